//! Service descriptors, the virtual-host registry and the live proxy state
//!
//! `ProxyState` bundles everything a request consults (secret, issuer name,
//! registry, revocation set) into one immutable snapshot. Reload builds a
//! complete new state and swaps the shared pointer; it never mutates fields
//! in place, so an in-flight request always sees a consistent combination.

use crate::config::{Config, ServiceConfig};
use crate::limit::RateLimiter;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hyper::Uri;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Credentials the gateway injects into forwarded requests
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

impl BasicAuth {
    /// Value for the outbound Authorization header
    pub fn header_value(&self) -> String {
        let credentials = format!("{}:{}", self.user, self.password);
        format!("Basic {}", BASE64.encode(credentials))
    }
}

/// One backend behind one virtual host, immutable after construction
#[derive(Debug)]
pub struct ServiceDescriptor {
    pub virtual_host: String,
    pub target: Uri,
    pub basic_auth: Option<BasicAuth>,
    pub auth_required: bool,
    pub limiter: Option<RateLimiter>,
}

impl ServiceDescriptor {
    /// Build a descriptor from its configuration record
    pub fn from_config(cfg: &ServiceConfig) -> anyhow::Result<Self> {
        let target: Uri = cfg.url.parse().map_err(|e| {
            anyhow::anyhow!("service '{}': invalid url '{}': {}", cfg.virtual_host, cfg.url, e)
        })?;
        if target.scheme().is_none() || target.authority().is_none() {
            anyhow::bail!(
                "service '{}': url '{}' must include scheme and host",
                cfg.virtual_host,
                cfg.url
            );
        }

        let basic_auth = if !cfg.user.is_empty() && !cfg.password.is_empty() {
            Some(BasicAuth {
                user: cfg.user.clone(),
                password: cfg.password.clone(),
            })
        } else {
            None
        };

        let limiter = if cfg.rate_limit > 0 {
            Some(RateLimiter::new(cfg.rate_limit))
        } else {
            None
        };

        Ok(Self {
            virtual_host: cfg.virtual_host.clone(),
            target,
            basic_auth,
            auth_required: cfg.jwt == "enabled" || cfg.jwt == "true",
            limiter,
        })
    }

    /// Admission check; a service without a limiter is unlimited
    pub fn allow(&self) -> bool {
        self.limiter.as_ref().map_or(true, |l| l.allow())
    }
}

/// Everything a request consults, replaced wholesale on reload
#[derive(Debug)]
pub struct ProxyState {
    pub secret: Vec<u8>,
    pub service_name: String,
    pub registry: HashMap<String, ServiceDescriptor>,
    pub revoked: HashSet<String>,
}

impl ProxyState {
    /// Build the full state from a loaded configuration.
    ///
    /// Later services sharing a virtual host overwrite earlier ones.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut registry = HashMap::with_capacity(config.services.len());
        for cfg in &config.services {
            let descriptor = ServiceDescriptor::from_config(cfg)?;
            registry.insert(cfg.virtual_host.clone(), descriptor);
        }

        Ok(Self {
            secret: config.server.secret.clone().into_bytes(),
            service_name: config.server.name.clone(),
            registry,
            revoked: config.invalidated_tokens.iter().cloned().collect(),
        })
    }

    /// Load configuration and build a complete new state.
    ///
    /// All-or-nothing: on any error the caller keeps its current state.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let config = Config::load(path)?;
        Self::from_config(&config)
    }
}

/// Live state handle: requests clone the inner Arc once (one consistent
/// snapshot for the whole request), reload swaps the pointer under the
/// write lock.
pub type SharedState = Arc<RwLock<Arc<ProxyState>>>;

pub fn shared_state(initial: ProxyState) -> SharedState {
    Arc::new(RwLock::new(Arc::new(initial)))
}

pub fn snapshot(shared: &SharedState) -> Arc<ProxyState> {
    shared.read().clone()
}

pub fn install(shared: &SharedState, next: ProxyState) {
    *shared.write() = Arc::new(next);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn service_config(virtual_host: &str, url: &str) -> ServiceConfig {
        ServiceConfig {
            virtual_host: virtual_host.to_string(),
            url: url.to_string(),
            user: String::new(),
            password: String::new(),
            rate_limit: 0,
            jwt: String::new(),
        }
    }

    fn config_with(services: Vec<ServiceConfig>) -> Config {
        Config {
            server: ServerConfig {
                addr: "127.0.0.1:3000".to_string(),
                log_file: None,
                secret: "test_secret".to_string(),
                name: "hostgate".to_string(),
                shutdown_timeout_s: 10,
                read_timeout_s: 0,
                write_timeout_s: 0,
                idle_timeout_s: 0,
            },
            invalidated_tokens: vec!["revoked-token".to_string()],
            services,
        }
    }

    #[test]
    fn test_descriptor_defaults() {
        let descriptor =
            ServiceDescriptor::from_config(&service_config("a.test", "http://127.0.0.1:8080"))
                .unwrap();
        assert_eq!(descriptor.virtual_host, "a.test");
        assert_eq!(descriptor.target.authority().unwrap().as_str(), "127.0.0.1:8080");
        assert!(descriptor.basic_auth.is_none());
        assert!(!descriptor.auth_required);
        assert!(descriptor.limiter.is_none());
        assert!(descriptor.allow());
    }

    #[test]
    fn test_jwt_flag_values() {
        for (flag, expected) in [("enabled", true), ("true", true), ("disabled", false), ("", false)] {
            let mut cfg = service_config("a.test", "http://127.0.0.1:8080");
            cfg.jwt = flag.to_string();
            let descriptor = ServiceDescriptor::from_config(&cfg).unwrap();
            assert_eq!(descriptor.auth_required, expected, "jwt flag: {:?}", flag);
        }
    }

    #[test]
    fn test_basic_auth_requires_both_fields() {
        let mut cfg = service_config("a.test", "http://127.0.0.1:8080");
        cfg.user = "svc".to_string();
        assert!(ServiceDescriptor::from_config(&cfg).unwrap().basic_auth.is_none());

        cfg.password = "hunter2".to_string();
        let auth = ServiceDescriptor::from_config(&cfg).unwrap().basic_auth.unwrap();
        assert_eq!(auth.header_value(), format!("Basic {}", BASE64.encode("svc:hunter2")));
    }

    #[test]
    fn test_limiter_present_iff_rate_positive() {
        let mut cfg = service_config("a.test", "http://127.0.0.1:8080");
        cfg.rate_limit = 2;
        let descriptor = ServiceDescriptor::from_config(&cfg).unwrap();
        assert!(descriptor.limiter.is_some());
        assert!(descriptor.allow());
        assert!(descriptor.allow());
        assert!(!descriptor.allow());
    }

    #[test]
    fn test_rejects_url_without_scheme() {
        let cfg = service_config("a.test", "127.0.0.1:8080");
        assert!(ServiceDescriptor::from_config(&cfg).is_err());
        let cfg = service_config("a.test", "/just/a/path");
        assert!(ServiceDescriptor::from_config(&cfg).is_err());
    }

    #[test]
    fn test_duplicate_virtual_host_last_wins() {
        let config = config_with(vec![
            service_config("a.test", "http://127.0.0.1:8080"),
            service_config("a.test", "http://127.0.0.1:9090"),
        ]);
        let state = ProxyState::from_config(&config).unwrap();
        assert_eq!(state.registry.len(), 1);
        assert_eq!(
            state.registry["a.test"].target.authority().unwrap().as_str(),
            "127.0.0.1:9090"
        );
    }

    #[test]
    fn test_from_config_builds_full_state() {
        let config = config_with(vec![service_config("a.test", "http://127.0.0.1:8080")]);
        let state = ProxyState::from_config(&config).unwrap();
        assert_eq!(state.secret, b"test_secret");
        assert_eq!(state.service_name, "hostgate");
        assert!(state.revoked.contains("revoked-token"));
    }

    #[test]
    fn test_bad_service_fails_whole_build() {
        let config = config_with(vec![
            service_config("a.test", "http://127.0.0.1:8080"),
            service_config("b.test", "not a url at all \u{7f}"),
        ]);
        assert!(ProxyState::from_config(&config).is_err());
    }

    #[test]
    fn test_load_missing_file_is_error() {
        assert!(ProxyState::load("/nonexistent/hostgate.toml").is_err());
    }

    #[test]
    fn test_snapshot_survives_install() {
        let shared = shared_state(
            ProxyState::from_config(&config_with(vec![service_config(
                "a.test",
                "http://127.0.0.1:8080",
            )]))
            .unwrap(),
        );

        let before = snapshot(&shared);

        let mut next_config = config_with(vec![service_config("b.test", "http://127.0.0.1:9090")]);
        next_config.server.secret = "rotated".to_string();
        install(&shared, ProxyState::from_config(&next_config).unwrap());

        // The captured snapshot still pairs the old registry with the old secret
        assert!(before.registry.contains_key("a.test"));
        assert_eq!(before.secret, b"test_secret");

        let after = snapshot(&shared);
        assert!(after.registry.contains_key("b.test"));
        assert!(!after.registry.contains_key("a.test"));
        assert_eq!(after.secret, b"rotated");
    }
}
