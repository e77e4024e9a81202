use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::error::{AdapterError, Result};
use crate::message::{ChannelCapabilities, ChannelInfo, ChannelType, ConnectionStatus};

/// Shared bookkeeping embedded by concrete adapters: declared channel info,
/// the connection flag and the configuration map.
///
/// The no-op defaults for typing, read receipts and media live on
/// [`crate::ChannelAdapter`] itself; this struct only carries state.
#[derive(Debug)]
pub struct BaseAdapter {
    info: ChannelInfo,
    connected: AtomicBool,
    config: DashMap<String, String>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
}

impl BaseAdapter {
    pub fn new(info: ChannelInfo) -> Self {
        Self {
            info,
            connected: AtomicBool::new(false),
            config: DashMap::new(),
            last_connected_at: RwLock::new(None),
        }
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    pub fn channel_type(&self) -> ChannelType {
        self.info.channel_type
    }

    pub fn capabilities(&self) -> &ChannelCapabilities {
        &self.info.capabilities
    }

    /// Replaces the stored configuration.
    pub fn initialize(&self, config: HashMap<String, String>) {
        self.config.clear();
        for (key, value) in config {
            self.config.insert(key, value);
        }
        debug!(channel_type = %self.info.channel_type, keys = self.config.len(), "adapter configured");
    }

    pub fn config_value(&self, key: &str) -> Option<String> {
        self.config.get(key).map(|v| v.value().clone())
    }

    pub fn config_or(&self, key: &str, default: &str) -> String {
        self.config_value(key)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn config_flag(&self, key: &str) -> bool {
        self.config_value(key)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false)
    }

    /// Fails with every missing key listed.
    pub fn require(&self, keys: &[&str]) -> Result<()> {
        let missing: Vec<&str> = keys
            .iter()
            .copied()
            .filter(|k| self.config_value(k).is_none_or(|v| v.is_empty()))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AdapterError::invalid_config(format!(
                "missing required keys: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            let mut stamp = self
                .last_connected_at
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *stamp = Some(Utc::now());
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        let connected = self.is_connected();
        ConnectionStatus {
            connected,
            status: if connected { "connected" } else { "disconnected" }.to_string(),
            error: None,
            last_connected_at: *self
                .last_connected_at
                .read()
                .unwrap_or_else(PoisonError::into_inner),
            metadata: HashMap::new(),
        }
    }
}
