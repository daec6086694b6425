use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub socket: SocketConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4000".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Shared with the auth service that issues the tokens. A fresh secret
    /// is generated for first runs; single-node deployments that also mint
    /// tokens locally can use it as-is.
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN REST shared secret. No secret means no TURN entries are handed
    /// out, which is fine on friendly networks.
    pub turn_secret: Option<String>,
    pub credential_ttl_secs: i64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec!["stun:stun.l.google.com:19302".into()],
            turn_urls: Vec::new(),
            turn_secret: None,
            credential_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SocketConfig {
    pub push_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            push_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("Config file not found at '{path}', generating defaults...");
            let config = Config::default();
            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, toml::to_string_pretty(&config)?)?;
            harden_secret_file_permissions(path)?;
            tracing::info!("Generated default config at '{path}'");
            config
        };

        // Environment variable overrides
        if let Ok(value) = std::env::var("LANYARD_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("LANYARD_JWT_SECRET") {
            config.auth.jwt_secret = value;
        }
        if let Ok(value) = std::env::var("LANYARD_TURN_SECRET") {
            config.ice.turn_secret = Some(value);
        }

        anyhow::ensure!(
            config.auth.jwt_secret.trim().len() >= 32,
            "auth.jwt_secret must be a strong random secret (at least 32 characters)"
        );
        Ok(config)
    }
}

fn harden_secret_file_permissions(path: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    let _ = path;
    Ok(())
}

fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| format!("{:x}", rng.gen_range(0..16)))
        .collect()
}
