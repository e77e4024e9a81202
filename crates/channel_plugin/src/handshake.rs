use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{AdapterError, Result};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAGIC_COOKIE_KEY: &str = "OMNIGATE_PLUGIN";
pub const MAGIC_COOKIE_VALUE: &str = "channel_adapter";
pub const PROTOCOL_VERSION_ENV: &str = "OMNIGATE_PLUGIN_PROTOCOL_VERSION";

/// Identifies compatible plugin binaries. The host exports the cookie to the
/// child's environment; the child refuses to run without it and answers with
/// a [`HandshakeLine`] before any RPC traffic. Any mismatch fails the load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    pub protocol_version: u32,
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            magic_cookie_key: MAGIC_COOKIE_KEY.to_string(),
            magic_cookie_value: MAGIC_COOKIE_VALUE.to_string(),
        }
    }
}

/// First line a plugin writes on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeLine {
    pub protocol_version: u32,
    pub magic_cookie: String,
}

impl HandshakeConfig {
    pub fn line(&self) -> HandshakeLine {
        HandshakeLine {
            protocol_version: self.protocol_version,
            magic_cookie: self.magic_cookie_value.clone(),
        }
    }

    /// Host side: check what the plugin answered.
    pub fn verify(&self, line: &HandshakeLine) -> Result<()> {
        if line.protocol_version != self.protocol_version {
            return Err(AdapterError::handshake(format!(
                "protocol version mismatch: host {} plugin {}",
                self.protocol_version, line.protocol_version
            )));
        }
        if line.magic_cookie != self.magic_cookie_value {
            return Err(AdapterError::handshake("magic cookie mismatch"));
        }
        Ok(())
    }

    /// Plugin side: check the environment the host launched us with.
    pub fn check_env(&self) -> Result<()> {
        self.check_values(
            std::env::var(&self.magic_cookie_key).ok().as_deref(),
            std::env::var(PROTOCOL_VERSION_ENV).ok().as_deref(),
        )
    }

    fn check_values(&self, cookie: Option<&str>, version: Option<&str>) -> Result<()> {
        if cookie != Some(self.magic_cookie_value.as_str()) {
            return Err(AdapterError::handshake(format!(
                "this binary is a plugin and must be launched by its host ({} not set)",
                self.magic_cookie_key
            )));
        }
        if let Some(version) = version {
            if version.parse::<u32>().ok() != Some(self.protocol_version) {
                return Err(AdapterError::handshake(format!(
                    "host speaks protocol {version}, plugin speaks {}",
                    self.protocol_version
                )));
            }
        }
        Ok(())
    }

    pub fn apply_env(&self, cmd: &mut Command) {
        cmd.env(&self.magic_cookie_key, &self.magic_cookie_value);
        cmd.env(PROTOCOL_VERSION_ENV, self.protocol_version.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_rejects_mismatches() {
        let cfg = HandshakeConfig::default();
        assert!(cfg.verify(&cfg.line()).is_ok());

        let wrong_version = HandshakeLine {
            protocol_version: 2,
            magic_cookie: MAGIC_COOKIE_VALUE.into(),
        };
        assert!(matches!(
            cfg.verify(&wrong_version),
            Err(AdapterError::Handshake { .. })
        ));

        let wrong_cookie = HandshakeLine {
            protocol_version: PROTOCOL_VERSION,
            magic_cookie: "other".into(),
        };
        assert!(cfg.verify(&wrong_cookie).is_err());
    }

    #[test]
    fn plugin_refuses_missing_or_foreign_env() {
        let cfg = HandshakeConfig::default();
        assert!(cfg.check_values(None, None).is_err());
        assert!(cfg.check_values(Some("nope"), Some("1")).is_err());
        assert!(cfg.check_values(Some(MAGIC_COOKIE_VALUE), Some("9")).is_err());
        assert!(cfg.check_values(Some(MAGIC_COOKIE_VALUE), Some("1")).is_ok());
        assert!(cfg.check_values(Some(MAGIC_COOKIE_VALUE), None).is_ok());
    }
}
