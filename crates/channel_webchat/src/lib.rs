pub mod adapter;
pub mod client;
pub mod envelope;
pub mod hub;
pub mod server;

pub use adapter::{WebchatAdapter, WidgetSettings, webchat_info};
pub use client::{ClientEvents, Timings};
pub use envelope::{Envelope, FrameType, Payload};
pub use hub::{ClientInfo, Hub, HubError, HubStats, SendOutcome};
pub use server::{ChannelDirectory, ChannelListing, Route, WebchatRoutes};
