//! Configuration loading and defaults.
//!
//! Two independent configurations live here, one per role:
//!
//! - **Server** (`burrow serve`): resolved as env vars > TOML file > compiled
//!   defaults. The file path comes from `--config`, falling back to
//!   `burrow.toml` in the current directory.
//! - **Agent** (`burrow start`): resolved as CLI flags > per-user config
//!   (`~/.config/burrow/config.toml`) > system-wide config
//!   (`/etc/burrow/config.toml`) > compiled defaults.
//!
//! The server TOML mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! base_domain = "example.com"
//! dev_mode = false
//!
//! [logging]
//! level = "info"
//! ```
//!
//! The agent config file is flat:
//!
//! ```toml
//! server = "wss://tunnel.example.com/tunnel"
//! token = "bw_..."
//! local_host = "127.0.0.1"
//! local_port = 8080
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level server configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener and domain settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Base domain for tunnels; `<subdomain>.<base_domain>` routes to agents.
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
    /// Development mode: accept the subdomain from an `X-Burrow-Subdomain`
    /// header or `?subdomain=` query, so tunnels can be exercised on
    /// localhost without wildcard DNS.
    #[serde(default)]
    pub dev_mode: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_base_domain() -> String {
    "burrow.localhost".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            base_domain: default_base_domain(),
            dev_mode: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load server configuration: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise
    /// `burrow.toml` in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config: ServerConfig = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .map_err(|e| format!("failed to read config file {p}: {e}"))?;
            toml::from_str(&content).map_err(|e| format!("failed to parse {p}: {e}"))?
        } else if Path::new("burrow.toml").exists() {
            let content = std::fs::read_to_string("burrow.toml")
                .map_err(|e| format!("failed to read burrow.toml: {e}"))?;
            toml::from_str(&content).map_err(|e| format!("failed to parse burrow.toml: {e}"))?
        } else {
            ServerConfig::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("BURROW_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(domain) = std::env::var("BURROW_DOMAIN") {
            config.server.base_domain = domain;
        }
        if std::env::var("BURROW_DEV").as_deref() == Ok("1") {
            config.server.dev_mode = true;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.server.base_domain.is_empty() {
            return Err("base_domain must not be empty".to_string());
        }
        Ok(())
    }
}

/// Agent configuration: how to reach the gateway and which local service to
/// expose.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Gateway connect URL (`ws://` or `wss://`, ending in `/tunnel`).
    #[serde(default = "default_agent_server")]
    pub server: String,
    /// Device auth token issued at registration.
    #[serde(default)]
    pub token: String,
    /// Local host requests are forwarded to (default `127.0.0.1`).
    #[serde(default = "default_local_host")]
    pub local_host: String,
    /// Local port requests are forwarded to (default 8080).
    #[serde(default = "default_local_port")]
    pub local_port: u16,
}

fn default_agent_server() -> String {
    "wss://tunnel.burrow.localhost/tunnel".to_string()
}
fn default_local_host() -> String {
    "127.0.0.1".to_string()
}
fn default_local_port() -> u16 {
    8080
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: default_agent_server(),
            token: String::new(),
            local_host: default_local_host(),
            local_port: default_local_port(),
        }
    }
}

/// CLI-provided overrides for the agent (all optional).
#[derive(Debug, Default)]
pub struct AgentOverrides {
    pub server: Option<String>,
    pub token: Option<String>,
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
}

/// Path of the per-user agent config file.
pub fn user_config_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config/burrow/config.toml"))
}

const SYSTEM_CONFIG_PATH: &str = "/etc/burrow/config.toml";

impl AgentConfig {
    /// Load agent configuration with the precedence chain:
    /// CLI flags > explicit `--config` file > user config > system config >
    /// defaults.
    pub fn load(path: Option<&str>, overrides: &AgentOverrides) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else {
            let user = user_config_path();
            match user.as_deref().filter(|p| p.exists()) {
                Some(p) => Self::from_file(p)?,
                None if Path::new(SYSTEM_CONFIG_PATH).exists() => {
                    Self::from_file(Path::new(SYSTEM_CONFIG_PATH))?
                }
                None => AgentConfig::default(),
            }
        };

        if let Some(ref server) = overrides.server {
            config.server = server.clone();
        }
        if let Some(ref token) = overrides.token {
            config.token = token.clone();
        }
        if let Some(ref host) = overrides.local_host {
            config.local_host = host.clone();
        }
        if let Some(port) = overrides.local_port {
            config.local_port = port;
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse {}: {e}", path.display()))
    }

    fn validate(&self) -> Result<(), String> {
        if self.token.is_empty() {
            return Err(
                "no token configured; register a device first or pass --token".to_string(),
            );
        }
        if self.local_port == 0 {
            return Err("local_port must be non-zero".to_string());
        }
        if !self.server.starts_with("ws://") && !self.server.starts_with("wss://") {
            return Err(format!(
                "server URL must be ws:// or wss://: {}",
                self.server
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.server.base_domain, "burrow.localhost");
        assert!(!config.server.dev_mode);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_server_config_partial_file() {
        let config: ServerConfig = toml::from_str(
            r#"
            [server]
            base_domain = "example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.base_domain, "example.com");
        assert_eq!(config.server.listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_agent_overrides_win() {
        let overrides = AgentOverrides {
            server: Some("ws://localhost:8080/tunnel".to_string()),
            token: Some("bw_test".to_string()),
            local_host: None,
            local_port: Some(3000),
        };
        let config = AgentConfig::load(None, &overrides).unwrap();
        assert_eq!(config.server, "ws://localhost:8080/tunnel");
        assert_eq!(config.token, "bw_test");
        assert_eq!(config.local_port, 3000);
    }

    #[test]
    fn test_agent_requires_token() {
        let err = AgentConfig::load(None, &AgentOverrides::default()).unwrap_err();
        assert!(err.contains("token"));
    }

    #[test]
    fn test_agent_rejects_http_url() {
        let overrides = AgentOverrides {
            server: Some("https://example.com/tunnel".to_string()),
            token: Some("bw_test".to_string()),
            ..AgentOverrides::default()
        };
        assert!(AgentConfig::load(None, &overrides).is_err());
    }
}
