use serde::Deserialize;
use std::path::Path;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,

    /// Tokens that are denylisted regardless of cryptographic validity
    #[serde(default)]
    pub invalidated_tokens: Vec<String>,

    /// Services keyed by virtual host
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen address, e.g. "127.0.0.1:3000"
    pub addr: String,

    /// Path to log file; stderr when unset
    pub log_file: Option<String>,

    /// Shared secret used to sign and verify bearer tokens
    pub secret: String,

    /// Name of this gateway, expected as the token issuer
    pub name: String,

    /// Graceful shutdown deadline in seconds (default: 30)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_s: u64,

    /// Read timeout in seconds (0 disables)
    #[serde(default)]
    pub read_timeout_s: u64,

    /// Write timeout in seconds, also bounds a single backend call (0 disables)
    #[serde(default)]
    pub write_timeout_s: u64,

    /// Idle connection timeout in seconds (0 disables)
    #[serde(default)]
    pub idle_timeout_s: u64,
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Configuration of one backend service behind a virtual host
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Hostname clients address this service by
    pub virtual_host: String,

    /// Backend base URL, scheme and authority, e.g. "http://127.0.0.1:8080"
    pub url: String,

    /// Basic auth user injected into forwarded requests
    #[serde(default)]
    pub user: String,

    /// Basic auth password injected into forwarded requests
    #[serde(default)]
    pub password: String,

    /// Requests per second; 0 means unlimited
    #[serde(default)]
    pub rate_limit: u32,

    /// Bearer token requirement flag: "enabled" or "true" turns it on
    #[serde(default)]
    pub jwt: String,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
invalidated_tokens = ["revoked.token.one"]

[server]
addr = "127.0.0.1:3000"
secret = "test_secret"
name = "hostgate"
shutdown_timeout_s = 10
write_timeout_s = 15

[[services]]
virtual_host = "api.example.com"
url = "http://127.0.0.1:8080"
user = "svc"
password = "hunter2"
rate_limit = 5
jwt = "enabled"

[[services]]
virtual_host = "static.example.com"
url = "http://127.0.0.1:8081"
"#;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.server.addr, "127.0.0.1:3000");
        assert_eq!(config.server.name, "hostgate");
        assert_eq!(config.server.shutdown_timeout_s, 10);
        assert_eq!(config.server.write_timeout_s, 15);
        assert_eq!(config.invalidated_tokens, vec!["revoked.token.one"]);
        assert_eq!(config.services.len(), 2);

        let api = &config.services[0];
        assert_eq!(api.virtual_host, "api.example.com");
        assert_eq!(api.rate_limit, 5);
        assert_eq!(api.jwt, "enabled");

        let public = &config.services[1];
        assert_eq!(public.user, "");
        assert_eq!(public.rate_limit, 0);
        assert_eq!(public.jwt, "");
    }

    #[test]
    fn defaults_apply() {
        let config: Config = toml::from_str(
            r#"
[server]
addr = "0.0.0.0:80"
secret = "s"
name = "n"
"#,
        )
        .unwrap();
        assert_eq!(config.server.shutdown_timeout_s, 30);
        assert_eq!(config.server.write_timeout_s, 0);
        assert!(config.invalidated_tokens.is_empty());
        assert!(config.services.is_empty());
        assert!(config.server.log_file.is_none());
    }

    #[test]
    fn rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[server\naddr = ").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn load_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.server.secret, "test_secret");
    }
}
