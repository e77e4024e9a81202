//! Typed request/response pairs carried over the plugin bridge.
//!
//! One plugin process can host many adapter instances, so every call names
//! the instance it targets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::message::{
    InboundMessage, Media, OutboundMessage, ReadReceipt, StatusCallback, TypingIndicator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
pub enum Method {
    // host -> plugin
    /// Creates the named instance and answers with its channel info.
    Dispense,
    /// Drops the named instance. Sent as a notification.
    Release,
    GetChannelInfo,
    Initialize,
    Connect,
    Disconnect,
    IsConnected,
    GetConnectionStatus,
    SendMessage,
    SendTypingIndicator,
    SendReadReceipt,
    UploadMedia,
    DownloadMedia,
    // plugin -> host notifications
    InboundMessage,
    StatusUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceParams {
    pub instance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    pub instance: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageParams {
    pub instance: String,
    pub message: OutboundMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingParams {
    pub instance: String,
    pub indicator: TypingIndicator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceiptParams {
    pub instance: String,
    pub receipt: ReadReceipt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMediaParams {
    pub instance: String,
    pub media: Media,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadMediaParams {
    pub instance: String,
    pub media_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsConnectedResult {
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundParams {
    pub instance: String,
    pub message: InboundMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusParams {
    pub instance: String,
    pub status: StatusCallback,
}
