use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adapter::ChannelAdapter;
use crate::error::{AdapterError, Result};
use crate::handshake::HandshakeConfig;
use crate::message::ChannelInfo;
use crate::plugin_actor::PluginHandle;
use crate::registry::AdapterTemplate;
use crate::remote_adapter::RemoteAdapter;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub plugin_dir: PathBuf,
    pub handshake: HandshakeConfig,
    pub call_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl LoaderConfig {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            handshake: HandshakeConfig::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Discovers, spawns and supervises out-of-process adapter plugins.
pub struct PluginLoader {
    config: LoaderConfig,
    plugins: RwLock<HashMap<String, PluginHandle>>,
}

impl PluginLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            plugins: RwLock::new(HashMap::new()),
        }
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.config.plugin_dir
    }

    /// Start `name` (or reuse its running process) and dispense a fresh
    /// adapter instance from it. A plugin whose process died is respawned.
    pub async fn load_plugin(&self, name: &str) -> Result<RemoteAdapter> {
        let running = self.plugins.read().await.get(name).filter(|h| h.is_alive()).cloned();
        if let Some(handle) = running {
            return handle.dispense().await;
        }

        // spawn and handshake without holding the map
        let spawned = self.spawn(name).await?;
        let (handle, surplus) = match self.plugins.write().await.entry(name.to_string()) {
            Entry::Occupied(slot) if slot.get().is_alive() => (slot.get().clone(), Some(spawned)),
            Entry::Occupied(mut slot) => {
                warn!(plugin = %name, "plugin process gone, respawning");
                slot.insert(spawned.clone());
                (spawned, None)
            }
            Entry::Vacant(slot) => (slot.insert(spawned).clone(), None),
        };
        if let Some(surplus) = surplus {
            debug!(plugin = %name, "concurrent load won, stopping extra process");
            surplus.shutdown().await;
        }
        handle.dispense().await
    }

    async fn spawn(&self, name: &str) -> Result<PluginHandle> {
        let path = self.config.plugin_dir.join(name);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AdapterError::PluginNotFound { path });
        }
        info!(plugin = %name, path = %path.display(), "spawning plugin");
        PluginHandle::spawn(
            &path,
            &self.config.handshake,
            self.config.call_timeout,
            self.config.handshake_timeout,
        )
        .await
    }

    /// Terminate a plugin process. Unknown names are a no-op.
    pub async fn unload_plugin(&self, name: &str) -> Result<()> {
        let handle = self.plugins.write().await.remove(name);
        if let Some(handle) = handle {
            handle.shutdown().await;
            info!(plugin = %name, "plugin unloaded");
        }
        Ok(())
    }

    pub async fn loaded_plugins(&self) -> Vec<String> {
        let mut names: Vec<_> = self.plugins.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Executable files in the plugin directory. A missing directory yields
    /// an empty list.
    pub async fn discover_plugins(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.config.plugin_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() || !is_executable(&meta) {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Kill every plugin process. Safe with none loaded.
    pub async fn close(&self) -> Result<()> {
        let plugins: Vec<_> = self.plugins.write().await.drain().collect();
        for (name, handle) in plugins {
            handle.shutdown().await;
            info!(plugin = %name, "plugin stopped");
        }
        Ok(())
    }
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    meta.is_file()
}

/// Adapter template backed by a plugin binary. Every instantiation
/// dispenses a new instance from the (shared) plugin process.
pub struct PluginTemplate {
    loader: Arc<PluginLoader>,
    name: String,
    info: ChannelInfo,
}

impl PluginTemplate {
    pub async fn load(loader: Arc<PluginLoader>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        // the instance dispensed to read the info is released right away
        let info = loader.load_plugin(&name).await?.channel_info();
        Ok(Self { loader, name, info })
    }
}

#[async_trait]
impl AdapterTemplate for PluginTemplate {
    fn channel_info(&self) -> ChannelInfo {
        self.info.clone()
    }

    async fn instantiate(&self) -> Result<Arc<dyn ChannelAdapter>> {
        Ok(Arc::new(self.loader.load_plugin(&self.name).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_dir_discovers_nothing() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::new(LoaderConfig::new(dir.path().join("nope")));
        assert!(loader.discover_plugins().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn discovery_keeps_executables_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let exe = dir.path().join("webchat");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.path().join("README.md"), "docs").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let loader = PluginLoader::new(LoaderConfig::new(dir.path()));
        assert_eq!(loader.discover_plugins().await.unwrap(), vec!["webchat"]);
    }

    #[tokio::test]
    async fn loading_unknown_plugin_names_the_path() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::new(LoaderConfig::new(dir.path()));
        let err = loader.load_plugin("ghost").await.err().unwrap();
        assert!(matches!(err, AdapterError::PluginNotFound { .. }));
        assert!(err.to_string().starts_with("plugin not found: "));
        assert!(err.to_string().ends_with("ghost"));
        assert!(loader.loaded_plugins().await.is_empty());
    }

    #[tokio::test]
    async fn close_and_unload_are_safe_when_empty() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::new(LoaderConfig::new(dir.path()));
        loader.unload_plugin("ghost").await.unwrap();
        loader.close().await.unwrap();
        loader.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn foreign_handshake_fails_closed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let exe = dir.path().join("impostor");
        std::fs::write(
            &exe,
            "#!/bin/sh\necho '{\"protocol_version\":99,\"magic_cookie\":\"channel_adapter\"}'\nexec sleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = LoaderConfig::new(dir.path());
        config.handshake_timeout = Duration::from_secs(5);
        let loader = PluginLoader::new(config);

        let err = loader.load_plugin("impostor").await.err().unwrap();
        assert!(matches!(err, AdapterError::Handshake { .. }), "{err}");
        assert!(loader.loaded_plugins().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_plugin_times_out_during_handshake() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let exe = dir.path().join("mute");
        std::fs::write(&exe, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = LoaderConfig::new(dir.path());
        config.handshake_timeout = Duration::from_millis(300);
        let loader = PluginLoader::new(config);

        let err = loader.load_plugin("mute").await.err().unwrap();
        assert!(matches!(err, AdapterError::Handshake { .. }), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn registry_stays_readable_while_a_plugin_starts() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let exe = dir.path().join("slow");
        std::fs::write(&exe, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = LoaderConfig::new(dir.path());
        config.handshake_timeout = Duration::from_secs(2);
        let loader = Arc::new(PluginLoader::new(config));

        let starting = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load_plugin("slow").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let names = tokio::time::timeout(Duration::from_millis(500), loader.loaded_plugins())
            .await
            .expect("listing must not wait for the handshake");
        assert!(names.is_empty());
        tokio::time::timeout(Duration::from_millis(500), loader.unload_plugin("other"))
            .await
            .expect("unload must not wait for the handshake")
            .unwrap();

        assert!(starting.await.unwrap().is_err());
        assert!(loader.loaded_plugins().await.is_empty());
    }
}
