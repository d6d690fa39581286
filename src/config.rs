use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cloudflare: CloudflareConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Honour X-Real-IP / X-Forwarded-For when deriving the caller address
    #[serde(default = "default_true")]
    pub trust_forwarded_headers: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            trust_forwarded_headers: default_true(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct CloudflareConfig {
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

fn default_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_ttl() -> u32 {
    120
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            api_base: default_api_base(),
            timeout_secs: default_timeout_secs(),
            ttl: default_ttl(),
        }
    }
}

// 不输出 api_token
impl std::fmt::Debug for CloudflareConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareConfig")
            .field("api_token", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("timeout_secs", &self.timeout_secs)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: String,
}

fn default_registry_path() -> String {
    "domains.txt".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.apply_overrides(
            std::env::var("PORT").ok(),
            std::env::var("CLOUDFLARE_API_TOKEN").ok(),
        );
        config.validate()?;

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Environment values win over the file; unparsable ports are ignored.
    pub fn apply_overrides(&mut self, port: Option<String>, api_token: Option<String>) {
        if let Some(port) = port.and_then(|p| p.trim().parse().ok()) {
            self.server.port = port;
        }
        if let Some(token) = api_token.filter(|t| !t.trim().is_empty()) {
            self.cloudflare.api_token = token.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cloudflare.api_token.trim().is_empty() {
            anyhow::bail!("Cloudflare API token is missing");
        }
        if self.cloudflare.timeout_secs == 0 {
            anyhow::bail!("cloudflare.timeout_secs must be greater than zero");
        }
        Ok(())
    }
}
