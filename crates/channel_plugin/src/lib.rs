pub mod adapter;
pub mod base;
pub mod error;
pub mod handshake;
pub mod jsonrpc;
pub mod loader;
pub mod message;
pub mod plugin_actor;
pub mod plugin_runtime;
pub mod protocol;
pub mod registry;
pub mod remote_adapter;

pub use adapter::{
    ChannelAdapter, InboundAdapter, MessageHandler, PollingAdapter, StatusHandler,
    WebSocketAdapter, WebhookAdapter,
};
pub use base::BaseAdapter;
pub use error::{AdapterError, Result};
pub use registry::{AdapterTemplate, ChannelInboundHandler, InProcessTemplate, PluginRegistry};
