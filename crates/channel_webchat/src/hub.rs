use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::envelope::Envelope;

/// Outbound buffer size of each client.
pub const CLIENT_BUFFER: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is stopped")]
    Closed,
}

/// What the hub knows about one live widget connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientInfo {
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub tenant_id: String,
    pub channel_id: String,
    pub contact_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    NotConnected,
    /// The client's buffer was full and the frame was dropped.
    BufferFull,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub clients: usize,
    pub conversations: usize,
}

struct ClientEntry {
    client_id: u64,
    info: ClientInfo,
    tx: mpsc::Sender<Envelope>,
}

/// Commands sent to the hub loop
enum Command {
    Register {
        info: ClientInfo,
        tx: mpsc::Sender<Envelope>,
        reply: oneshot::Sender<u64>,
    },
    Unregister {
        session_id: String,
        client_id: u64,
    },
    Broadcast {
        conversation_id: String,
        envelope: Envelope,
        reply: Option<oneshot::Sender<usize>>,
    },
    Send {
        session_id: String,
        envelope: Envelope,
        reply: Option<oneshot::Sender<SendOutcome>>,
    },
    Bind {
        session_id: String,
        conversation_id: String,
        contact_id: Option<String>,
    },
    Lookup {
        session_id: String,
        reply: oneshot::Sender<Option<ClientInfo>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the connection registry. All state lives in a single loop
/// task; the handle only enqueues commands, so it is cheap to clone and
/// never blocks on other clients.
#[derive(Debug, Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Register { .. } => "register",
            Command::Unregister { .. } => "unregister",
            Command::Broadcast { .. } => "broadcast",
            Command::Send { .. } => "send",
            Command::Bind { .. } => "bind",
            Command::Lookup { .. } => "lookup",
            Command::Stats { .. } => "stats",
            Command::Stop { .. } => "stop",
        };
        f.write_str(name)
    }
}

impl Hub {
    /// Spawn the hub loop on the current runtime.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { tx }
    }

    fn command(&self, command: Command) -> Result<(), HubError> {
        self.tx.send(command).map_err(|_| HubError::Closed)
    }

    /// Add a client. A client already registered under the same session is
    /// replaced and its buffer closed. Returns the id to unregister with.
    pub async fn register(&self, info: ClientInfo, tx: mpsc::Sender<Envelope>) -> Result<u64, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Register { info, tx, reply })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Remove a client and close its buffer. Ignored when the session has
    /// since been taken over by another client.
    pub fn unregister(&self, session_id: &str, client_id: u64) {
        let _ = self.command(Command::Unregister {
            session_id: session_id.to_string(),
            client_id,
        });
    }

    /// Fan out to every client indexed under the conversation. Best effort:
    /// a client with a full buffer misses the frame.
    pub fn broadcast_to_conversation(&self, conversation_id: &str, envelope: Envelope) -> Result<(), HubError> {
        self.command(Command::Broadcast {
            conversation_id: conversation_id.to_string(),
            envelope,
            reply: None,
        })
    }

    /// Like [`Hub::broadcast_to_conversation`], reporting how many clients
    /// accepted the frame.
    pub async fn broadcast_counted(&self, conversation_id: &str, envelope: Envelope) -> Result<usize, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Broadcast {
            conversation_id: conversation_id.to_string(),
            envelope,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn send_to_session(&self, session_id: &str, envelope: Envelope) -> Result<SendOutcome, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            session_id: session_id.to_string(),
            envelope,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Fire-and-forget variant used by connection loops for acks and errors.
    pub fn push_to_session(&self, session_id: &str, envelope: Envelope) {
        let _ = self.command(Command::Send {
            session_id: session_id.to_string(),
            envelope,
            reply: None,
        });
    }

    /// Index a session under a conversation once it is known.
    pub fn bind_conversation(
        &self,
        session_id: &str,
        conversation_id: &str,
        contact_id: Option<String>,
    ) -> Result<(), HubError> {
        self.command(Command::Bind {
            session_id: session_id.to_string(),
            conversation_id: conversation_id.to_string(),
            contact_id,
        })
    }

    pub async fn client(&self, session_id: &str) -> Result<Option<ClientInfo>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Lookup {
            session_id: session_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Stats { reply })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn client_count(&self) -> Result<usize, HubError> {
        Ok(self.stats().await?.clients)
    }

    pub async fn conversation_count(&self) -> Result<usize, HubError> {
        Ok(self.stats().await?.conversations)
    }

    /// Close every client buffer and end the loop. Later registrations fail
    /// with [`HubError::Closed`]. Stopping twice is harmless.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    clients: HashMap<String, ClientEntry>,
    conversations: HashMap<String, HashSet<String>>,
}

impl State {
    fn index(&mut self, conversation_id: &str, session_id: &str) {
        self.conversations
            .entry(conversation_id.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    fn unindex(&mut self, conversation_id: &str, session_id: &str) {
        if let Some(sessions) = self.conversations.get_mut(conversation_id) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                self.conversations.remove(conversation_id);
            }
        }
    }

    /// Removing the entry drops the hub's sender, which closes the buffer.
    fn remove(&mut self, session_id: &str) -> Option<ClientEntry> {
        let entry = self.clients.remove(session_id)?;
        if let Some(conversation_id) = entry.info.conversation_id.clone() {
            self.unindex(&conversation_id, session_id);
        }
        Some(entry)
    }

    fn deliver(entry: &ClientEntry, envelope: Envelope) -> SendOutcome {
        match entry.tx.try_send(envelope) {
            Ok(()) => SendOutcome::Delivered,
            Err(TrySendError::Full(_)) => {
                debug!(session_id = %entry.info.session_id, "client buffer full, frame dropped");
                SendOutcome::BufferFull
            }
            Err(TrySendError::Closed(_)) => SendOutcome::NotConnected,
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut state = State::default();
    while let Some(command) = rx.recv().await {
        trace!(?command, "hub command");
        match command {
            Command::Register { info, tx, reply } => {
                if state.remove(&info.session_id).is_some() {
                    debug!(session_id = %info.session_id, "session re-registered, previous client closed");
                }
                state.next_id += 1;
                let client_id = state.next_id;
                if let Some(conversation_id) = info.conversation_id.clone() {
                    state.index(&conversation_id, &info.session_id);
                }
                state.clients.insert(
                    info.session_id.clone(),
                    ClientEntry {
                        client_id,
                        info,
                        tx,
                    },
                );
                let _ = reply.send(client_id);
            }
            Command::Unregister {
                session_id,
                client_id,
            } => {
                let owned = state
                    .clients
                    .get(&session_id)
                    .is_some_and(|entry| entry.client_id == client_id);
                if owned {
                    state.remove(&session_id);
                }
            }
            Command::Broadcast {
                conversation_id,
                envelope,
                reply,
            } => {
                let mut delivered = 0;
                if let Some(sessions) = state.conversations.get(&conversation_id) {
                    for session_id in sessions {
                        if let Some(entry) = state.clients.get(session_id) {
                            if State::deliver(entry, envelope.clone()) == SendOutcome::Delivered {
                                delivered += 1;
                            }
                        }
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(delivered);
                }
            }
            Command::Send {
                session_id,
                envelope,
                reply,
            } => {
                let outcome = match state.clients.get(&session_id) {
                    Some(entry) => State::deliver(entry, envelope),
                    None => SendOutcome::NotConnected,
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Command::Bind {
                session_id,
                conversation_id,
                contact_id,
            } => {
                let previous = match state.clients.get_mut(&session_id) {
                    Some(entry) => {
                        if contact_id.is_some() {
                            entry.info.contact_id = contact_id;
                        }
                        entry.info.conversation_id.replace(conversation_id.clone())
                    }
                    None => continue,
                };
                if let Some(previous) = previous.filter(|p| *p != conversation_id) {
                    state.unindex(&previous, &session_id);
                }
                state.index(&conversation_id, &session_id);
            }
            Command::Lookup { session_id, reply } => {
                let _ = reply.send(state.clients.get(&session_id).map(|e| e.info.clone()));
            }
            Command::Stats { reply } => {
                let _ = reply.send(HubStats {
                    clients: state.clients.len(),
                    conversations: state.conversations.len(),
                });
            }
            Command::Stop { reply } => {
                let closed = state.clients.len();
                state.clients.clear();
                state.conversations.clear();
                info!(closed, "hub stopped");
                let _ = reply.send(());
                return;
            }
        }
    }
}
