//! File-backed configuration.
//!
//! Loaded once at startup via `toml_edit::DocumentMut` (rather than a plain
//! `toml`/`serde` deserialize) so a future config-writeback path can edit
//! the document in place and preserve comments/formatting; today nothing in
//! this crate writes it back, so the settings are extracted into plain
//! structs and the document itself is dropped once parsed.

use crate::error::{DryerError, Result};
use std::path::{Path, PathBuf};
use toml_edit::DocumentMut;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/dryercontrold";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

const DEFAULT_TOML: &str = r#"[moonraker]
base_url = "http://127.0.0.1:7125"
# api_key = "..."

[server]
bind_address = "127.0.0.1"
bind_port = 8080

[daemon]
data_directory = "/var/lib/dryercontrold"
"#;

#[derive(Debug, Clone)]
pub struct MoonrakerSettings {
    pub base_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_address: String,
    pub bind_port: u16,
}

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub data_directory: PathBuf,
}

/// In-memory, validated view of the config file.
pub struct Config {
    pub moonraker: MoonrakerSettings,
    pub server: ServerSettings,
    pub daemon: DaemonSettings,
}

impl Config {
    /// Loads the config at `path`, creating it with defaults (and its
    /// parent directory) if it doesn't exist yet.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !crate::cc_fs::exists(&path).await {
            if let Some(parent) = path.parent() {
                crate::cc_fs::create_dir_all(parent)
                    .await
                    .map_err(|e| DryerError::Fatal(e.to_string()))?;
            }
            crate::cc_fs::write_string(&path, DEFAULT_TOML.to_string())
                .await
                .map_err(|e| DryerError::Fatal(e.to_string()))?;
        }
        let text = crate::cc_fs::read_txt(&path)
            .await
            .map_err(|e| DryerError::Fatal(e.to_string()))?;
        let document: DocumentMut = text
            .parse()
            .map_err(|e: toml_edit::TomlError| DryerError::Fatal(e.to_string()))?;

        let moonraker = Self::parse_moonraker(&document)?;
        let server = Self::parse_server(&document)?;
        let daemon = Self::parse_daemon(&document)?;

        Ok(Self { moonraker, server, daemon })
    }

    fn parse_moonraker(doc: &DocumentMut) -> Result<MoonrakerSettings> {
        let table = doc["moonraker"]
            .as_table()
            .ok_or_else(|| DryerError::Fatal("missing [moonraker] section".into()))?;
        let base_url = table["base_url"]
            .as_str()
            .ok_or_else(|| DryerError::Fatal("moonraker.base_url must be a string".into()))?
            .to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(DryerError::Fatal(format!(
                "moonraker.base_url is not a well-formed URL: {base_url}"
            )));
        }
        let api_key = table
            .get("api_key")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(MoonrakerSettings { base_url, api_key })
    }

    fn parse_server(doc: &DocumentMut) -> Result<ServerSettings> {
        let table = doc["server"]
            .as_table()
            .ok_or_else(|| DryerError::Fatal("missing [server] section".into()))?;
        let bind_address = table
            .get("bind_address")
            .and_then(|v| v.as_str())
            .unwrap_or("127.0.0.1")
            .to_string();
        let raw_port = table["bind_port"]
            .as_integer()
            .ok_or_else(|| DryerError::Fatal("server.bind_port must be an integer".into()))?;
        let bind_port: u16 = raw_port.try_into().map_err(|_| {
            DryerError::Fatal(format!("server.bind_port {raw_port} out of u16 range"))
        })?;
        Ok(ServerSettings {
            bind_address,
            bind_port,
        })
    }

    fn parse_daemon(doc: &DocumentMut) -> Result<DaemonSettings> {
        let table = doc["daemon"]
            .as_table()
            .ok_or_else(|| DryerError::Fatal("missing [daemon] section".into()))?;
        let data_directory = table["data_directory"]
            .as_str()
            .ok_or_else(|| DryerError::Fatal("daemon.data_directory must be a string".into()))?
            .into();
        Ok(DaemonSettings { data_directory })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_created_with_valid_defaults() {
        let dir = std::env::temp_dir().join(format!("dryercontrold-test-{}", std::process::id()));
        let path = dir.join("config.toml");
        let cfg = Config::load(&path).await.expect("load should succeed");
        assert_eq!(cfg.moonraker.base_url, "http://127.0.0.1:7125");
        assert_eq!(cfg.server.bind_port, 8080);
        assert!(crate::cc_fs::exists(&path).await);
    }

    #[tokio::test]
    async fn invalid_bind_port_is_rejected() {
        let dir = std::env::temp_dir().join(format!("dryercontrold-test-{}", std::process::id() + 1));
        let path = dir.join("config.toml");
        crate::cc_fs::create_dir_all(&dir).await.unwrap();
        crate::cc_fs::write_string(
            &path,
            "[moonraker]\nbase_url = \"http://host\"\n[server]\nbind_port = 999999\n[daemon]\ndata_directory = \"/tmp\"\n"
                .to_string(),
        )
        .await
        .unwrap();
        let result = Config::load(&path).await;
        assert!(result.is_err());
    }
}
