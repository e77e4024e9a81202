use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::adapter::{ChannelAdapter, InboundAdapter, MessageHandler, StatusHandler};
use crate::error::Result;
use crate::message::{
    ChannelInfo, ConnectionStatus, Media, MediaUpload, OutboundMessage, ReadReceipt, SendResult,
    TypingIndicator,
};
use crate::plugin_actor::PluginHandle;
use crate::protocol::{
    DownloadMediaParams, InitializeParams, InstanceParams, IsConnectedResult, Method,
    ReadReceiptParams, SendMessageParams, TypingParams, UploadMediaParams,
};

/// Client-side proxy for one adapter instance living in a plugin process.
/// Every contract method becomes one JSON-RPC call tagged with the instance id.
pub struct RemoteAdapter {
    handle: PluginHandle,
    instance: String,
    info: ChannelInfo,
}

impl RemoteAdapter {
    pub(crate) async fn dispense(handle: PluginHandle) -> Result<Self> {
        let instance = Uuid::new_v4().to_string();
        let info: ChannelInfo = handle
            .rpc_call(
                Method::Dispense,
                &InstanceParams {
                    instance: instance.clone(),
                },
            )
            .await?;
        Ok(Self {
            handle,
            instance,
            info,
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn plugin_name(&self) -> &str {
        self.handle.name()
    }

    fn params(&self) -> InstanceParams {
        InstanceParams {
            instance: self.instance.clone(),
        }
    }
}

impl Drop for RemoteAdapter {
    fn drop(&mut self) {
        self.handle.release(&self.instance);
    }
}

#[async_trait]
impl ChannelAdapter for RemoteAdapter {
    async fn initialize(&self, config: HashMap<String, String>) -> Result<()> {
        let params = InitializeParams {
            instance: self.instance.clone(),
            config,
        };
        self.handle
            .rpc_call::<_, Value>(Method::Initialize, &params)
            .await
            .map(|_| ())
    }

    async fn connect(&self) -> Result<()> {
        self.handle
            .rpc_call::<_, Value>(Method::Connect, &self.params())
            .await
            .map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        self.handle
            .rpc_call::<_, Value>(Method::Disconnect, &self.params())
            .await
            .map(|_| ())
    }

    async fn is_connected(&self) -> bool {
        match self
            .handle
            .rpc_call::<_, IsConnectedResult>(Method::IsConnected, &self.params())
            .await
        {
            Ok(r) => r.connected,
            Err(err) => {
                warn!(plugin = %self.plugin_name(), "is_connected failed: {err}");
                false
            }
        }
    }

    async fn connection_status(&self) -> ConnectionStatus {
        match self
            .handle
            .rpc_call(Method::GetConnectionStatus, &self.params())
            .await
        {
            Ok(status) => status,
            Err(err) => ConnectionStatus {
                connected: false,
                status: "error".into(),
                error: Some(err.to_string()),
                ..Default::default()
            },
        }
    }

    async fn send_message(&self, message: OutboundMessage) -> Result<SendResult> {
        let params = SendMessageParams {
            instance: self.instance.clone(),
            message,
        };
        match self.handle.rpc_call(Method::SendMessage, &params).await {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!(plugin = %self.plugin_name(), message_id = %params.message.id, "send failed: {err}");
                Ok(SendResult::failed(err.to_string()))
            }
        }
    }

    async fn send_typing_indicator(&self, indicator: TypingIndicator) -> Result<()> {
        let params = TypingParams {
            instance: self.instance.clone(),
            indicator,
        };
        self.handle
            .rpc_call::<_, Value>(Method::SendTypingIndicator, &params)
            .await
            .map(|_| ())
    }

    async fn send_read_receipt(&self, receipt: ReadReceipt) -> Result<()> {
        let params = ReadReceiptParams {
            instance: self.instance.clone(),
            receipt,
        };
        self.handle
            .rpc_call::<_, Value>(Method::SendReadReceipt, &params)
            .await
            .map(|_| ())
    }

    async fn upload_media(&self, media: Media) -> Result<MediaUpload> {
        let params = UploadMediaParams {
            instance: self.instance.clone(),
            media,
        };
        self.handle.rpc_call(Method::UploadMedia, &params).await
    }

    async fn download_media(&self, media_id: &str) -> Result<Option<Media>> {
        let params = DownloadMediaParams {
            instance: self.instance.clone(),
            media_id: media_id.to_string(),
        };
        self.handle.rpc_call(Method::DownloadMedia, &params).await
    }

    fn channel_info(&self) -> ChannelInfo {
        self.info.clone()
    }

    fn inbound(&self) -> Option<&dyn InboundAdapter> {
        Some(self)
    }
}

impl InboundAdapter for RemoteAdapter {
    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handle.set_message_sink(&self.instance, handler);
    }

    fn set_status_handler(&self, handler: Arc<dyn StatusHandler>) {
        self.handle.set_status_sink(&self.instance, handler);
    }
}
