use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::{fs, process};

use anyhow::Context;
use channel_plugin::ChannelAdapter;
use channel_plugin::loader::{LoaderConfig, PluginLoader};
use channel_webchat::Timings;
use clap::{Args, Parser, Subcommand};
use omnigate::{
    Gateway, GatewayConfig,
    analysis::IntentService,
    config::{GatewayFile, Settings, load_env, resolve_root_dir},
    events::{LogPublisher, Outbox, OutboxConfig},
    logger::{LogConfig, init_tracing},
    repository::{InMemoryStore, Repositories},
    webhook::{SIGNATURE_HEADER, sign_payload},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "omnigate",
    about = "Omnichannel conversation gateway",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway
    Run(RunArgs),

    /// List plugin binaries in the plugin directory
    Plugins(PluginArgs),

    /// Compute the webhook signature header for a payload file
    Sign(SignArgs),

    /// Emit the JSON-Schema of the gateway file
    Schema(SchemaArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Gateway file, defaults to `<root>/gateway.yaml`
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    plugin_dir: Option<PathBuf>,

    /// Address the webchat endpoint listens on
    #[arg(long)]
    webchat_addr: Option<SocketAddr>,
}

#[derive(Args, Debug)]
struct PluginArgs {
    #[arg(long)]
    plugin_dir: Option<PathBuf>,

    /// Start each plugin and print what it serves
    #[arg(long, default_value_t = false)]
    probe: bool,
}

#[derive(Args, Debug)]
struct SignArgs {
    /// Shared webhook secret
    #[arg(long)]
    secret: String,

    file: PathBuf,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Write to this file instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(args).await,
        Commands::Plugins(args) => plugins(args).await,
        Commands::Sign(args) => {
            let payload = fs::read(&args.file).with_context(|| format!("reading {}", args.file.display()))?;
            let signature = sign_payload(&args.secret, &payload)?;
            println!("{SIGNATURE_HEADER}: {signature}");
            Ok(())
        }
        Commands::Schema(args) => {
            let schema = serde_json::to_string_pretty(&GatewayFile::schema())?;
            match args.out {
                Some(path) => {
                    fs::write(&path, schema)?;
                    println!("Schema written to {}", path.display());
                }
                None => println!("{schema}"),
            }
            Ok(())
        }
    }
}

fn settings() -> anyhow::Result<Settings> {
    let root = resolve_root_dir();
    load_env(&root);
    Ok(Settings::from_env(root)?)
}

fn loader_for(settings: &Settings) -> PluginLoader {
    PluginLoader::new(LoaderConfig {
        call_timeout: settings.rpc_timeout,
        handshake_timeout: settings.handshake_timeout,
        ..LoaderConfig::new(&settings.plugin_dir)
    })
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut settings = settings()?;
    if let Some(level) = args.log_level {
        settings.log_level = level;
    }
    if let Some(dir) = args.plugin_dir {
        settings.plugin_dir = dir;
    }
    if let Some(addr) = args.webchat_addr {
        settings.webchat_addr = addr;
    }
    if let Some(file) = args.config {
        settings.gateway_file = file;
    }

    let telemetry = init_tracing(&LogConfig {
        level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        otel_endpoint: settings.otel_endpoint.clone(),
    })?;
    info!(root = %settings.root.display(), "omnigate starting up…");

    let file = match GatewayFile::load(&settings.gateway_file) {
        Ok(file) => file,
        Err(err) => {
            error!("invalid gateway file {}: {err}", settings.gateway_file.display());
            telemetry.shutdown();
            process::exit(1);
        }
    };

    let outbox = Arc::new(Outbox::start(LogPublisher, OutboxConfig::default()));
    let gateway = Gateway::new(
        Repositories::in_memory(Arc::new(InMemoryStore::new())),
        IntentService::new(),
        outbox.clone(),
        Some(Arc::new(loader_for(&settings))),
        GatewayConfig::default(),
    )
    .await;
    gateway.start(&file).await?;

    let listener = TcpListener::bind(settings.webchat_addr)
        .await
        .with_context(|| format!("binding webchat endpoint on {}", settings.webchat_addr))?;
    let stop = CancellationToken::new();
    let server = tokio::spawn(channel_webchat::server::serve(
        listener,
        gateway.routes(),
        gateway.directory(),
        Timings::default(),
        stop.clone(),
    ));

    info!("omnigate running; press Ctrl-C to exit");
    println!("omnigate running on {}; press Ctrl-C to exit", settings.webchat_addr);

    tokio::signal::ctrl_c().await?;

    println!("\nShutting down…");
    info!("omnigate shutting down");
    stop.cancel();
    if let Err(err) = server.await {
        error!("webchat server task failed: {err}");
    }
    gateway.shutdown().await;
    outbox.close().await;
    telemetry.shutdown();

    println!("Goodbye!");
    Ok(())
}

async fn plugins(args: PluginArgs) -> anyhow::Result<()> {
    let mut settings = settings()?;
    if let Some(dir) = args.plugin_dir {
        settings.plugin_dir = dir;
    }
    let loader = loader_for(&settings);
    let names = loader.discover_plugins().await?;
    if names.is_empty() {
        println!("No plugins in {}", settings.plugin_dir.display());
        return Ok(());
    }
    for name in names {
        if !args.probe {
            println!("{name}");
            continue;
        }
        match loader.load_plugin(&name).await {
            Ok(adapter) => {
                let info = adapter.channel_info();
                println!("{name}\t{}\t{} {}", info.channel_type, info.name, info.version);
            }
            Err(err) => println!("{name}\terror: {err}"),
        }
    }
    loader.close().await?;
    Ok(())
}
