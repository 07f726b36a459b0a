use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use serde::Deserialize;
use url::Url;

/// Command line options for the chat server.
#[derive(Parser, Debug, Default)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Base under which attachment URLs are published.
    pub public_url: Url,
    /// Holds `chat.db` and the `blobs/` tree.
    pub data_dir: PathBuf,
    /// Maximum upload size in megabytes.
    pub max_upload_mb: u64,
    /// How long after sending a message may still be edited.
    pub edit_window_secs: u64,
    /// HS256 key shared with the identity provider.
    pub jwt_secret: Vec<u8>,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("public_url", &self.public_url.as_str())
            .field("data_dir", &self.data_dir)
            .field("max_upload_mb", &self.max_upload_mb)
            .field("edit_window_secs", &self.edit_window_secs)
            .field("jwt_secret", &"<redacted>")
            .field("logging_enabled", &self.logging_enabled)
            .finish()
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    storage: FileStorage,
    #[serde(default)]
    chat: FileChat,
    #[serde(default)]
    auth: FileAuth,
    #[serde(default)]
    logging: FileLogging,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    public_url: Option<String>,
}

#[derive(Deserialize, Default)]
struct FileStorage {
    #[serde(default)]
    data_dir: Option<PathBuf>,
    #[serde(default)]
    max_upload_mb: Option<u64>,
}

#[derive(Deserialize, Default)]
struct FileChat {
    #[serde(default)]
    edit_window_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct FileAuth {
    #[serde(default)]
    jwt_secret: Option<String>,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

fn default_port() -> u16 {
    8788
}

fn default_logging() -> bool {
    true
}

const DEFAULT_MAX_UPLOAD_MB: u64 = 10;
const DEFAULT_EDIT_WINDOW_SECS: u64 = 5 * 60;

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
            public_url: None,
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("MARKET_CHAT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/market_chat.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };

        let port = cli
            .port
            .or_else(|| env_parsed("MARKET_CHAT_PORT"))
            .unwrap_or(file_cfg.server.port);
        let logging_enabled = cli
            .logging
            .or_else(|| env_parsed("MARKET_CHAT_LOGGING"))
            .unwrap_or(file_cfg.logging.enabled);

        // validate port range
        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }

        let bind = cli
            .bind
            .clone()
            .or_else(|| std::env::var("BIND").ok())
            .unwrap_or_else(|| format!("127.0.0.1:{}", port));

        let public_url = std::env::var("MARKET_CHAT_PUBLIC_URL")
            .ok()
            .or(file_cfg.server.public_url)
            .unwrap_or_else(|| format!("http://{bind}/"));
        let public_url = Url::parse(&public_url).context("invalid public url")?;

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .ok()
            .or(file_cfg.storage.data_dir)
            .unwrap_or_else(default_data_dir);
        let max_upload_mb = env_parsed("MAX_UPLOAD_MB")
            .or(file_cfg.storage.max_upload_mb)
            .unwrap_or(DEFAULT_MAX_UPLOAD_MB);
        let edit_window_secs = env_parsed("MARKET_CHAT_EDIT_WINDOW_SECS")
            .or(file_cfg.chat.edit_window_secs)
            .unwrap_or(DEFAULT_EDIT_WINDOW_SECS);

        let secret = std::env::var("MARKET_CHAT_JWT_SECRET")
            .ok()
            .or(file_cfg.auth.jwt_secret)
            .context("missing jwt secret (auth.jwt_secret or MARKET_CHAT_JWT_SECRET)")?;
        let jwt_secret = STANDARD
            .decode(secret.trim())
            .context("jwt secret is not valid base64")?;
        if jwt_secret.is_empty() {
            anyhow::bail!("empty jwt secret");
        }

        Ok(Self {
            bind,
            public_url,
            data_dir,
            max_upload_mb,
            edit_window_secs,
            jwt_secret,
            logging_enabled,
        })
    }

    /// Helper to return the upload limit in bytes.
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }

    pub fn edit_window_ms(&self) -> i64 {
        self.edit_window_secs as i64 * 1000
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chat.db")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

/// Determine the default data directory for the server.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/market_chat");
        p
    } else {
        PathBuf::from("./market_chat_data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    const ENV_KEYS: &[&str] = &[
        "MARKET_CHAT_CONFIG",
        "MARKET_CHAT_PORT",
        "MARKET_CHAT_LOGGING",
        "MARKET_CHAT_PUBLIC_URL",
        "MARKET_CHAT_EDIT_WINDOW_SECS",
        "MARKET_CHAT_JWT_SECRET",
        "MAX_UPLOAD_MB",
        "DATA_DIR",
        "BIND",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    fn load_with(contents: &str, cli: Cli) -> Result<Config> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, contents).unwrap();
        Config::load(&Cli {
            config: Some(path),
            ..cli
        })
    }

    const SECRET: &str = "[auth]\njwt_secret=\"c2VjcmV0\"\n";

    #[test]
    #[serial]
    fn valid_config_parses() {
        clear_env();
        let cfg = load_with(
            &format!("[server]\nport=5555\npublic_url=\"https://chat.example.com/\"\n[storage]\ndata_dir=\"/var/chat\"\nmax_upload_mb=3\n[chat]\nedit_window_secs=120\n[logging]\nenabled=false\n{SECRET}"),
            Cli::default(),
        )
        .unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:5555");
        assert_eq!(cfg.public_url.as_str(), "https://chat.example.com/");
        assert_eq!(cfg.db_path(), PathBuf::from("/var/chat/chat.db"));
        assert_eq!(cfg.max_upload_bytes(), 3 * 1024 * 1024);
        assert_eq!(cfg.edit_window_ms(), 120_000);
        assert_eq!(cfg.jwt_secret, b"secret");
        assert!(!cfg.logging_enabled);
        assert!(!format!("{cfg:?}").contains("c2VjcmV0"));
    }

    #[test]
    #[serial]
    fn missing_keys_defaults() {
        clear_env();
        let cfg = load_with(SECRET, Cli::default()).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:8788");
        assert_eq!(cfg.public_url.as_str(), "http://127.0.0.1:8788/");
        assert_eq!(cfg.max_upload_mb, 10);
        assert_eq!(cfg.edit_window_secs, 300);
        assert!(cfg.logging_enabled);
    }

    #[test]
    #[serial]
    fn invalid_port_fails() {
        clear_env();
        assert!(load_with(&format!("[server]\nport=80\n{SECRET}"), Cli::default()).is_err());
    }

    #[test]
    #[serial]
    fn secret_is_required() {
        clear_env();
        assert!(load_with("", Cli::default()).is_err());
        assert!(load_with("[auth]\njwt_secret=\"not base64!\"\n", Cli::default()).is_err());
        std::env::set_var("MARKET_CHAT_JWT_SECRET", "a2V5");
        let cfg = load_with("", Cli::default()).unwrap();
        assert_eq!(cfg.jwt_secret, b"key");
        clear_env();
    }

    #[test]
    #[serial]
    fn precedence_cli_env_file() {
        clear_env();
        std::env::set_var("MARKET_CHAT_PORT", "2222");
        std::env::set_var("MAX_UPLOAD_MB", "7");
        let cfg = load_with(
            &format!("[server]\nport=1111\n[storage]\nmax_upload_mb=2\n{SECRET}"),
            Cli {
                port: Some(3333),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3333");
        assert_eq!(cfg.max_upload_mb, 7);

        let cfg = load_with(&format!("[server]\nport=1111\n{SECRET}"), Cli::default()).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:2222");
        clear_env();
    }

    #[test]
    #[serial]
    fn logging_toggle() {
        clear_env();
        std::env::set_var("MARKET_CHAT_LOGGING", "false");
        let cfg = load_with(SECRET, Cli::default()).unwrap();
        assert!(!cfg.logging_enabled);
        let cfg = load_with(
            SECRET,
            Cli {
                logging: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(cfg.logging_enabled);
        clear_env();
    }
}
