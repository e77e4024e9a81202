use std::path::PathBuf;
use std::sync::Arc;

use channel_plugin::handshake::HandshakeConfig;
use channel_plugin::plugin_runtime::{init_plugin_logging, serve};
use channel_plugin::InProcessTemplate;
use channel_webchat::WebchatAdapter;
use channel_webchat::WebchatRoutes;
use channel_webchat::client::Timings;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;

const DEFAULT_ADDR: &str = "0.0.0.0:8090";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    HandshakeConfig::default().check_env()?;

    let log_dir = std::env::var_os("OMNIGATE_PLUGIN_LOG_DIR").map(PathBuf::from);
    let level = std::env::var("OMNIGATE_PLUGIN_LOG_LEVEL")
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(LevelFilter::INFO);
    init_plugin_logging(log_dir.as_deref(), level);

    let addr = std::env::var("OMNIGATE_WEBCHAT_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = TcpListener::bind(&addr).await?;
    let routes = WebchatRoutes::new();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(channel_webchat::server::serve(
        listener,
        routes.clone(),
        Arc::new(routes.clone()),
        Timings::default(),
        shutdown.clone(),
    ));

    let result = serve(InProcessTemplate::new(move || WebchatAdapter::new(routes.clone()))).await;
    shutdown.cancel();
    let _ = server.await;
    result
}
