use crate::error::ConfigError;
use std::time::Duration;
use url::Url;

/// How routing keys are derived from containers and requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    /// `DOMAIN=` env var on the container, else `{short_id}.{base_domain}`
    #[default]
    Domain,
    /// Leading host label matched against the 12-character container id prefix
    Identifier,
}

impl RoutingMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "domain" => Some(RoutingMode::Domain),
            "id" | "identifier" => Some(RoutingMode::Identifier),
            _ => None,
        }
    }
}

/// Gateway configuration, read from the environment at startup
#[derive(Debug, Clone)]
pub struct Config {
    /// Base routing domain (GW_DOMAIN)
    pub domain: String,

    /// Listen host (GW_HOST, default: 0.0.0.0)
    pub host: String,

    /// Listen port (GW_PORT, default: 2377)
    pub port: u16,

    /// Backend to forward unmatched requests to (GW_DEFAULT_ROUTE)
    pub default_route: Option<Url>,

    /// Skip containers without an explicit DOMAIN (GW_SKIP_NO_DOMAIN)
    pub skip_no_domain: bool,

    /// Reject crawler user agents and serve robots.txt (BOUNCE_BOTS)
    pub bounce_bots: bool,

    /// Port used when a container exposes none (DEFAULT_PORT, default: 5000)
    pub default_port: u16,

    /// Register the /_* debug endpoints (DEBUG, disabled only by "0")
    pub debug_endpoints: bool,

    /// Docker endpoint (DOCKER_HOST)
    pub docker_host: String,

    /// Routing key derivation (GW_ROUTING_MODE, default: domain)
    pub routing_mode: RoutingMode,

    /// Default number of log lines for /_logs (GW_LOG_LINES, default: 1000)
    pub log_lines: u32,

    /// Maximum concurrently handled container events (GW_EVENT_WORKERS, default: 16)
    pub event_workers: usize,

    /// Maximum idle connections per backend (GW_POOL_MAX_IDLE, default: 10)
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (GW_POOL_IDLE_TIMEOUT_SECS, default: 90)
    pub pool_idle_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2377
}

// Foreman's default port
fn default_backend_port() -> u16 {
    5000
}

fn default_log_lines() -> u32 {
    1000
}

fn default_event_workers() -> usize {
    16
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl Config {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let routing_mode = match get("GW_ROUTING_MODE") {
            Some(value) => RoutingMode::parse(&value).ok_or_else(|| ConfigError::Invalid {
                name: "GW_ROUTING_MODE",
                value: value.clone(),
                reason: "expected 'domain' or 'id'".to_string(),
            })?,
            None => RoutingMode::default(),
        };

        let default_route = match get("GW_DEFAULT_ROUTE") {
            Some(value) => Some(Url::parse(&value).map_err(|e| ConfigError::Invalid {
                name: "GW_DEFAULT_ROUTE",
                value: value.clone(),
                reason: e.to_string(),
            })?),
            None => None,
        };

        let config = Self {
            domain: get("GW_DOMAIN").unwrap_or_default().to_lowercase(),
            host: get("GW_HOST").unwrap_or_else(default_host),
            port: parse_var(&get, "GW_PORT", default_port())?,
            default_route,
            skip_no_domain: get("GW_SKIP_NO_DOMAIN").is_some(),
            bounce_bots: get("BOUNCE_BOTS").is_some(),
            default_port: parse_var(&get, "DEFAULT_PORT", default_backend_port())?,
            debug_endpoints: lookup("DEBUG").as_deref() != Some("0"),
            docker_host: get("DOCKER_HOST").ok_or(ConfigError::Missing("DOCKER_HOST"))?,
            routing_mode,
            log_lines: parse_var(&get, "GW_LOG_LINES", default_log_lines())?,
            event_workers: parse_var(&get, "GW_EVENT_WORKERS", default_event_workers())?,
            pool_max_idle_per_host: parse_var(
                &get,
                "GW_POOL_MAX_IDLE",
                default_pool_max_idle_per_host(),
            )?,
            pool_idle_timeout_secs: parse_var(
                &get,
                "GW_POOL_IDLE_TIMEOUT_SECS",
                default_pool_idle_timeout(),
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routing_mode == RoutingMode::Domain && self.domain.is_empty() {
            return Err(ConfigError::Missing("GW_DOMAIN"));
        }

        // Backends, the default route included, are reached over plain HTTP only
        if let Some(route) = &self.default_route {
            if route.scheme() != "http" || route.host_str().is_none() {
                return Err(ConfigError::Invalid {
                    name: "GW_DEFAULT_ROUTE",
                    value: route.to_string(),
                    reason: "expected an http:// URL with a host".to_string(),
                });
            }
        }

        if self.event_workers == 0 {
            return Err(ConfigError::Invalid {
                name: "GW_EVENT_WORKERS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        if self.default_port == 0 {
            return Err(ConfigError::Invalid {
                name: "DEFAULT_PORT",
                value: "0".to_string(),
                reason: "must be a non-zero port".to_string(),
            });
        }

        Ok(())
    }

    /// Address the HTTP server binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

fn parse_var<G, T>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: value.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_minimal_config() {
        let config = config_from(&[
            ("GW_DOMAIN", "Apps.Example.com"),
            ("DOCKER_HOST", "unix:///var/run/docker.sock"),
        ])
        .unwrap();

        assert_eq!(config.domain, "apps.example.com");
        assert_eq!(config.bind_address(), "0.0.0.0:2377");
        assert_eq!(config.default_port, 5000);
        assert_eq!(config.log_lines, 1000);
        assert_eq!(config.event_workers, 16);
        assert_eq!(config.routing_mode, RoutingMode::Domain);
        assert!(config.default_route.is_none());
        assert!(!config.skip_no_domain);
        assert!(!config.bounce_bots);
        assert!(config.debug_endpoints);
        assert_eq!(config.pool_idle_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn test_full_config() {
        let config = config_from(&[
            ("GW_DOMAIN", "example.com"),
            ("DOCKER_HOST", "tcp://127.0.0.1:2375"),
            ("GW_HOST", "127.0.0.1"),
            ("GW_PORT", "8080"),
            ("GW_DEFAULT_ROUTE", "http://10.0.0.1:3000"),
            ("GW_SKIP_NO_DOMAIN", "1"),
            ("BOUNCE_BOTS", "yes"),
            ("DEFAULT_PORT", "8000"),
            ("DEBUG", "0"),
            ("GW_LOG_LINES", "50"),
            ("GW_EVENT_WORKERS", "4"),
        ])
        .unwrap();

        assert_eq!(config.bind_address(), "127.0.0.1:8080");
        assert_eq!(
            config.default_route.as_ref().map(|u| u.as_str()),
            Some("http://10.0.0.1:3000/")
        );
        assert!(config.skip_no_domain);
        assert!(config.bounce_bots);
        assert_eq!(config.default_port, 8000);
        assert!(!config.debug_endpoints);
        assert_eq!(config.log_lines, 50);
        assert_eq!(config.event_workers, 4);
    }

    #[test]
    fn test_missing_domain_is_fatal() {
        let err = config_from(&[("DOCKER_HOST", "unix:///var/run/docker.sock")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("GW_DOMAIN")));
    }

    #[test]
    fn test_missing_docker_host_is_fatal() {
        let err = config_from(&[("GW_DOMAIN", "example.com")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DOCKER_HOST")));
    }

    #[test]
    fn test_identifier_mode_does_not_need_domain() {
        let config = config_from(&[
            ("DOCKER_HOST", "unix:///var/run/docker.sock"),
            ("GW_ROUTING_MODE", "id"),
        ])
        .unwrap();
        assert_eq!(config.routing_mode, RoutingMode::Identifier);
    }

    #[test]
    fn test_invalid_values() {
        let base = [
            ("GW_DOMAIN", "example.com"),
            ("DOCKER_HOST", "unix:///var/run/docker.sock"),
        ];

        let mut vars = base.to_vec();
        vars.push(("GW_PORT", "not-a-port"));
        assert!(matches!(
            config_from(&vars).unwrap_err(),
            ConfigError::Invalid { name: "GW_PORT", .. }
        ));

        let mut vars = base.to_vec();
        vars.push(("GW_DEFAULT_ROUTE", "::not a url"));
        assert!(matches!(
            config_from(&vars).unwrap_err(),
            ConfigError::Invalid { name: "GW_DEFAULT_ROUTE", .. }
        ));

        let mut vars = base.to_vec();
        vars.push(("GW_DEFAULT_ROUTE", "https://127.0.0.1:8443"));
        assert!(matches!(
            config_from(&vars).unwrap_err(),
            ConfigError::Invalid { name: "GW_DEFAULT_ROUTE", .. }
        ));

        let mut vars = base.to_vec();
        vars.push(("GW_ROUTING_MODE", "weighted"));
        assert!(matches!(
            config_from(&vars).unwrap_err(),
            ConfigError::Invalid { name: "GW_ROUTING_MODE", .. }
        ));

        let mut vars = base.to_vec();
        vars.push(("GW_EVENT_WORKERS", "0"));
        assert!(matches!(
            config_from(&vars).unwrap_err(),
            ConfigError::Invalid { name: "GW_EVENT_WORKERS", .. }
        ));
    }

    #[test]
    fn test_debug_enabled_unless_zero() {
        let config = config_from(&[
            ("GW_DOMAIN", "example.com"),
            ("DOCKER_HOST", "unix:///var/run/docker.sock"),
            ("DEBUG", "false"),
        ])
        .unwrap();
        assert!(config.debug_endpoints);
    }
}
