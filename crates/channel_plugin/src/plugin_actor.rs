use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{MessageHandler, StatusHandler};
use crate::error::{AdapterError, Result};
use crate::handshake::{HandshakeConfig, HandshakeLine};
use crate::jsonrpc::{Id, Message, Request, Response};
use crate::protocol::{InboundParams, Method, StatusParams};
use crate::remote_adapter::RemoteAdapter;

#[derive(Clone, Default)]
struct InstanceSinks {
    message: Option<Arc<dyn MessageHandler>>,
    status: Option<Arc<dyn StatusHandler>>,
}

/// State shared between the handle and its reader task.
struct Shared {
    name: String,
    // track in-flight calls by response id
    inflight: DashMap<String, oneshot::Sender<Response>>,
    sinks: DashMap<String, InstanceSinks>,
    alive: AtomicBool,
}

struct HandleInner {
    shared: Arc<Shared>,
    writer: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    call_timeout: Duration,
}

/// Host-side end of a plugin connection: sends JSON-RPC calls to the plugin,
/// routes its notifications to per-instance handlers and owns the child
/// process, which is killed when the stream ends or the handle shuts down.
#[derive(Clone)]
pub struct PluginHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.inner.shared.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl PluginHandle {
    /// Launch `exe_path` with the handshake cookie in its environment and
    /// wire JSON-RPC over its stdin/stdout.
    pub async fn spawn(
        exe_path: &Path,
        handshake: &HandshakeConfig,
        call_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let mut cmd = TokioCommand::new(exe_path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        handshake.apply_env(&mut cmd);
        let mut child = cmd.spawn()?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(AdapterError::transport("plugin stdio unavailable"));
        };

        let name = exe_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| exe_path.display().to_string());

        Self::establish(
            name,
            stdout,
            stdin,
            Some(child),
            handshake,
            call_timeout,
            handshake_timeout,
        )
        .await
    }

    /// Same as [`PluginHandle::spawn`] over arbitrary streams, for plugins
    /// that are not child processes.
    pub async fn connect_io<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        handshake: &HandshakeConfig,
        call_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::establish(
            name.into(),
            reader,
            writer,
            None,
            handshake,
            call_timeout,
            handshake_timeout,
        )
        .await
    }

    async fn establish<R, W>(
        name: String,
        reader: R,
        mut writer: W,
        mut child: Option<Child>,
        handshake: &HandshakeConfig,
        call_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut lines = BufReader::new(reader).lines();

        if let Err(err) = read_handshake(&mut lines, handshake, handshake_timeout).await {
            error!(plugin = %name, "refusing plugin: {err}");
            if let Some(child) = child.as_mut() {
                let _ = child.kill().await;
            }
            return Err(err);
        }
        info!(plugin = %name, "plugin handshake complete");

        let shared = Arc::new(Shared {
            name,
            inflight: DashMap::new(),
            sinks: DashMap::new(),
            alive: AtomicBool::new(true),
        });
        let shutdown = CancellationToken::new();

        // ── writer task: queued lines → plugin stdin ─────────────────────
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    let written = async {
                        writer.write_all(line.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                        writer.flush().await
                    }
                    .await;
                    if written.is_err() {
                        shutdown.cancel();
                        break;
                    }
                }
            });
        }

        // ── reader task: plugin stdout → responses / notifications ───────
        let reader = {
            let shared = Arc::clone(&shared);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = lines.next_line() => match next {
                            Ok(Some(line)) => route_line(&shared, &line),
                            Ok(None) => break,
                            Err(err) => {
                                warn!(plugin = %shared.name, "read error: {err}");
                                break;
                            }
                        }
                    }
                }
                shared.alive.store(false, Ordering::SeqCst);
                // dropping the senders fails every pending call
                shared.inflight.clear();
                if let Some(mut child) = child {
                    let _ = child.kill().await;
                }
                info!(plugin = %shared.name, "plugin connection closed");
            })
        };

        Ok(Self {
            inner: Arc::new(HandleInner {
                shared,
                writer: tx,
                shutdown,
                reader: Mutex::new(Some(reader)),
                call_timeout,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    pub fn is_alive(&self) -> bool {
        self.inner.shared.alive.load(Ordering::SeqCst)
    }

    /// Send one call and wait for its response, bounded by the call timeout.
    pub async fn call(&self, method: Method, params: Value) -> Result<Value> {
        let shared = &self.inner.shared;
        if !self.is_alive() {
            return Err(AdapterError::transport(format!(
                "plugin '{}' is not running",
                shared.name
            )));
        }

        let key = Uuid::new_v4().to_string();
        let request = Request::call(Id::String(key.clone()), method, Some(params));
        let line = serde_json::to_string(&request)?;

        let (rsp_tx, rsp_rx) = oneshot::channel();
        shared.inflight.insert(key.clone(), rsp_tx);
        if self.inner.writer.send(line).is_err() {
            shared.inflight.remove(&key);
            return Err(AdapterError::transport(format!(
                "plugin '{}' is not accepting calls",
                shared.name
            )));
        }
        debug!(plugin = %shared.name, %method, id = %key, "rpc call");

        match timeout(self.inner.call_timeout, rsp_rx).await {
            Err(_) => {
                shared.inflight.remove(&key);
                Err(AdapterError::Timeout(self.inner.call_timeout))
            }
            Ok(Err(_)) => Err(AdapterError::transport(format!(
                "plugin '{}' closed before answering {method}",
                shared.name
            ))),
            Ok(Ok(response)) => into_result(response),
        }
    }

    pub async fn rpc_call<P, T>(&self, method: Method, params: &P) -> Result<T>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let value = self.call(method, serde_json::to_value(params)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Create a fresh adapter instance inside the plugin.
    pub async fn dispense(&self) -> Result<RemoteAdapter> {
        RemoteAdapter::dispense(self.clone()).await
    }

    pub(crate) fn set_message_sink(&self, instance: &str, handler: Arc<dyn MessageHandler>) {
        self.inner
            .shared
            .sinks
            .entry(instance.to_string())
            .or_default()
            .message = Some(handler);
    }

    pub(crate) fn set_status_sink(&self, instance: &str, handler: Arc<dyn StatusHandler>) {
        self.inner
            .shared
            .sinks
            .entry(instance.to_string())
            .or_default()
            .status = Some(handler);
    }

    /// Forget the instance's handlers and tell the plugin to drop it.
    /// Fire-and-forget: usable from `Drop`, silent once the plugin is gone.
    pub(crate) fn release(&self, instance: &str) {
        self.inner.shared.sinks.remove(instance);
        if !self.is_alive() {
            return;
        }
        let params = serde_json::json!({ "instance": instance });
        match serde_json::to_string(&Request::notification(Method::Release, Some(params))) {
            Ok(line) => {
                let _ = self.inner.writer.send(line);
            }
            Err(err) => warn!(plugin = %self.inner.shared.name, "cannot encode release: {err}"),
        }
    }

    /// Stop reading, kill the child and wait for the reader task to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(reader) = self.inner.reader.lock().await.take() {
            let _ = reader.await;
        }
    }
}

async fn read_handshake<R>(
    lines: &mut tokio::io::Lines<BufReader<R>>,
    handshake: &HandshakeConfig,
    limit: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let first = timeout(limit, lines.next_line())
        .await
        .map_err(|_| AdapterError::handshake(format!("no handshake within {limit:?}")))??
        .ok_or_else(|| AdapterError::handshake("plugin exited before handshake"))?;
    let line: HandshakeLine = serde_json::from_str(first.trim())
        .map_err(|e| AdapterError::handshake(format!("malformed handshake line: {e}")))?;
    handshake.verify(&line)
}

fn into_result(response: Response) -> Result<Value> {
    match response.error {
        Some(err) => Err(AdapterError::Rpc {
            code: err.code,
            message: err.message,
        }),
        None => Ok(response.result.unwrap_or(Value::Null)),
    }
}

fn route_line(shared: &Arc<Shared>, line: &str) {
    match serde_json::from_str::<Message>(line) {
        Ok(Message::Response(rsp)) => {
            let Some(key) = rsp.id.key() else {
                warn!(plugin = %shared.name, "plugin answered without an id: {:?}", rsp.error);
                return;
            };
            match shared.inflight.remove(&key) {
                Some((_, tx)) => {
                    let _ = tx.send(rsp);
                }
                None => debug!(plugin = %shared.name, id = %key, "late response dropped"),
            }
        }
        Ok(Message::Request(req)) => {
            let shared = Arc::clone(shared);
            tokio::spawn(async move { deliver_notification(&shared, req).await });
        }
        Err(err) => warn!(plugin = %shared.name, "unparseable line from plugin: {err}"),
    }
}

async fn deliver_notification(shared: &Shared, req: Request) {
    let params = req.params.unwrap_or(Value::Null);
    let outcome = match req.method.parse::<Method>() {
        Ok(Method::InboundMessage) => match serde_json::from_value::<InboundParams>(params) {
            Ok(p) => {
                let handler = shared.sinks.get(&p.instance).and_then(|s| s.message.clone());
                match handler {
                    Some(h) => h.handle_message(p.message).await,
                    None => {
                        warn!(plugin = %shared.name, instance = %p.instance, "inbound message without handler");
                        Ok(())
                    }
                }
            }
            Err(err) => Err(err.into()),
        },
        Ok(Method::StatusUpdate) => match serde_json::from_value::<StatusParams>(params) {
            Ok(p) => {
                let handler = shared.sinks.get(&p.instance).and_then(|s| s.status.clone());
                match handler {
                    Some(h) => h.handle_status(p.status).await,
                    None => Ok(()),
                }
            }
            Err(err) => Err(err.into()),
        },
        _ => {
            warn!(plugin = %shared.name, method = %req.method, "unexpected request from plugin");
            Ok(())
        }
    };
    if let Err(err) = outcome {
        error!(plugin = %shared.name, method = %req.method, "notification handling failed: {err}");
    }
}
