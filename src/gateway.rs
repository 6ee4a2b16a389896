//! Routing table and request dispatch
//!
//! The [`Gateway`] maps routing keys (hostnames, or container id prefixes in
//! identifier mode) to the set of destinations currently serving them. The
//! table is only reachable through the gateway's operations, each of which
//! holds the table lock for in-memory work only: container inspection and
//! proxying always happen outside it.

use crate::config::{Config, RoutingMode};
use crate::container::{short_id, ContainerMetadata, ContainerSource, SHORT_ID_LEN};
use crate::destination::Destination;
use crate::error::{text_error_response, GatewayError, GatewayErrorCode};
use crate::forward::{ForwardStats, Forwarder, PoolConfig, ProxyBody, SingleTargetProxy};
use hyper::header::HeaderValue;
use hyper::{Request, Response};
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// User agents turned away when bot bouncing is enabled
const BOT_AGENTS: [&str; 3] = ["google", "yahoo", "bing"];

/// Settings the gateway reads but never changes
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub routing_mode: RoutingMode,
    pub domain: String,
    pub skip_no_domain: bool,
    pub default_port: u16,
    pub default_route: Option<Url>,
    pub bounce_bots: bool,
    pub pool: PoolConfig,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            routing_mode: RoutingMode::Domain,
            domain: String::new(),
            skip_no_domain: false,
            default_port: 5000,
            default_route: None,
            bounce_bots: false,
            pool: PoolConfig::default(),
        }
    }
}

impl From<&Config> for GatewayOptions {
    fn from(config: &Config) -> Self {
        Self {
            routing_mode: config.routing_mode,
            domain: config.domain.clone(),
            skip_no_domain: config.skip_no_domain,
            default_port: config.default_port,
            default_route: config.default_route.clone(),
            bounce_bots: config.bounce_bots,
            pool: PoolConfig {
                max_idle_per_host: config.pool_max_idle_per_host,
                idle_timeout: config.pool_idle_timeout(),
            },
        }
    }
}

/// Destinations under one routing key, by container id
type DestinationSet = HashMap<String, Arc<Destination>>;

/// The routing table proper. Never exposed outside this module.
#[derive(Default)]
struct RoutingTable {
    routes: HashMap<String, DestinationSet>,
}

impl RoutingTable {
    fn contains(&self, key: &str, container_id: &str) -> bool {
        self.routes
            .get(key)
            .is_some_and(|set| set.contains_key(container_id))
    }

    fn insert(&mut self, key: &str, destination: Arc<Destination>) {
        // A container lives under at most one key
        self.remove_container(destination.container_id(), Some(key));

        self.routes
            .entry(key.to_string())
            .or_default()
            .insert(destination.container_id().to_string(), destination);
    }

    fn remove(&mut self, key: &str, container_id: &str) -> bool {
        let Some(set) = self.routes.get_mut(key) else {
            return false;
        };

        let removed = set.remove(container_id).is_some();
        if set.is_empty() {
            self.routes.remove(key);
        }
        removed
    }

    /// Remove a container from every key except `keep`
    fn remove_container(&mut self, container_id: &str, keep: Option<&str>) -> bool {
        let mut removed = false;
        self.routes.retain(|key, set| {
            if Some(key.as_str()) != keep && set.remove(container_id).is_some() {
                removed = true;
            }
            !set.is_empty()
        });
        removed
    }

    fn pick(&self, key: &str) -> Option<Arc<Destination>> {
        self.routes
            .get(key)?
            .values()
            .choose(&mut rand::thread_rng())
            .cloned()
    }
}

/// Routing-table manager and request dispatcher
pub struct Gateway {
    table: Mutex<RoutingTable>,
    source: Arc<dyn ContainerSource>,
    forwarder: Arc<Forwarder>,
    default_route: Option<SingleTargetProxy>,
    options: GatewayOptions,
}

impl Gateway {
    pub fn new(source: Arc<dyn ContainerSource>, options: GatewayOptions) -> Arc<Self> {
        let forwarder = Arc::new(Forwarder::new(options.pool.clone()));
        let default_route = options
            .default_route
            .clone()
            .map(|url| SingleTargetProxy::new(url, Arc::clone(&forwarder)));

        Arc::new(Self {
            table: Mutex::new(RoutingTable::default()),
            source,
            forwarder,
            default_route,
            options,
        })
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Counters for traffic forwarded to destinations
    pub fn forward_stats(&self) -> Arc<ForwardStats> {
        self.forwarder.stats()
    }

    /// The container source this gateway reconciles against
    pub fn source(&self) -> &Arc<dyn ContainerSource> {
        &self.source
    }

    /// Routing key for a container, or `None` when it should not be routed
    pub fn routing_key(&self, container: &ContainerMetadata) -> Option<String> {
        match self.options.routing_mode {
            RoutingMode::Domain => {
                if let Some(domain) = container.env_var("DOMAIN").map(str::trim) {
                    if !domain.is_empty() {
                        return Some(domain.to_lowercase());
                    }
                }

                if self.options.skip_no_domain {
                    return None;
                }

                Some(format!("{}.{}", container.short_id(), self.options.domain).to_lowercase())
            }
            RoutingMode::Identifier => {
                if container.id.is_empty() {
                    None
                } else {
                    Some(container.short_id().to_lowercase())
                }
            }
        }
    }

    /// Routing key for a request host (`Host` header or URI authority)
    pub fn request_key(&self, host: &str) -> Option<String> {
        let hostname = strip_port(host.trim()).to_lowercase();
        if hostname.is_empty() {
            return None;
        }

        match self.options.routing_mode {
            RoutingMode::Domain => Some(hostname),
            RoutingMode::Identifier => {
                let label = hostname.split('.').next().unwrap_or_default();
                if label.len() < SHORT_ID_LEN {
                    return None;
                }
                Some(short_id(label).to_string())
            }
        }
    }

    /// Register a container.
    ///
    /// Containers without a routing key or without exposed ports are skipped
    /// without error. Registering the same container twice under the same key
    /// fails with [`GatewayError::AlreadyExists`] and leaves the table as is.
    pub fn add(&self, container: &ContainerMetadata) -> Result<(), GatewayError> {
        info!(container_id = %container.id, "Adding container");

        let Some(key) = self.routing_key(container) else {
            info!(container_id = %container.id, "Skipped adding container without domain");
            return Ok(());
        };

        if container.exposed_ports.is_empty() {
            info!(container_id = %container.id, key = %key, "Container does not have any exposed ports");
            return Ok(());
        }

        let destination = Arc::new(Destination::new(
            container,
            self.options.default_port,
            Arc::clone(&self.forwarder),
        )?);

        let mut table = self.table.lock();
        if table.contains(&key, &container.id) {
            return Err(GatewayError::AlreadyExists {
                key,
                container_id: container.id.clone(),
            });
        }

        debug!(container_id = %container.id, key = %key, target = %destination, "Registered destination");
        table.insert(&key, destination);
        Ok(())
    }

    /// Remove a container from the key its metadata derives to.
    /// Returns whether a destination was removed.
    pub fn remove(&self, container: &ContainerMetadata) -> bool {
        info!(container_id = %container.id, "Removing container");

        let Some(key) = self.routing_key(container) else {
            return false;
        };

        self.table.lock().remove(&key, &container.id)
    }

    /// Remove a container from whichever key holds it. Used once a container
    /// is gone and its routing key can no longer be derived.
    pub fn remove_by_id(&self, container_id: &str) -> bool {
        let removed = self.table.lock().remove_container(container_id, None);
        if removed {
            info!(container_id, "Removed container by id");
        }
        removed
    }

    /// Empty the routing table
    pub fn flush(&self) {
        let mut table = self.table.lock();
        let count = table.routes.len();
        table.routes.clear();
        debug!(routes = count, "Flushed routing table");
    }

    /// Register every running container. Containers that fail to inspect or
    /// register are logged and skipped; only a failed listing is an error.
    /// Returns the number of containers registered.
    pub async fn load(&self) -> Result<usize, GatewayError> {
        let ids = self.source.list_running().await?;
        let mut added = 0;

        for id in &ids {
            let container = match self.source.inspect(id).await {
                Ok(container) => container,
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Failed to inspect container during load");
                    continue;
                }
            };

            match self.add(&container) {
                Ok(()) => added += 1,
                Err(e) => warn!(container_id = %id, error = %e, "Failed to add container during load"),
            }
        }

        info!(containers = ids.len(), added, routes = self.route_count(), "Loaded routing table");
        Ok(added)
    }

    /// A destination for `key`, chosen uniformly at random
    pub fn find(&self, key: &str) -> Option<Arc<Destination>> {
        self.table.lock().pick(key)
    }

    /// A destination for a request host
    pub fn find_for_host(&self, host: &str) -> Option<Arc<Destination>> {
        self.request_key(host).and_then(|key| self.find(&key))
    }

    /// Snapshot of every key and its destination URLs
    pub fn routes(&self) -> BTreeMap<String, Vec<String>> {
        let table = self.table.lock();
        table
            .routes
            .iter()
            .map(|(key, set)| {
                let mut targets: Vec<String> = set.values().map(|d| d.to_string()).collect();
                targets.sort();
                (key.clone(), targets)
            })
            .collect()
    }

    pub fn route_count(&self) -> usize {
        self.table.lock().routes.len()
    }

    /// Dispatch a request to a destination for its host.
    ///
    /// Unmatched requests go to the default route when one is configured,
    /// otherwise they get a "no route" response listing the known routes.
    pub async fn handle(&self, mut req: Request<ProxyBody>, client_addr: SocketAddr) -> Response<ProxyBody> {
        if self.options.bounce_bots && is_bot(&req) {
            debug!(user_agent = ?req.headers().get(hyper::header::USER_AGENT), "Bounced bot request");
            return self.not_found();
        }

        let host = request_host(&req);
        let destination = host.as_deref().and_then(|h| self.find_for_host(h));

        let request_id = set_forwarding_headers(&mut req, client_addr);

        info!(
            method = %req.method(),
            host = host.as_deref().unwrap_or(""),
            path = %req.uri(),
            request_id = %request_id,
            destination = %destination.as_ref().map(|d| d.to_string()).unwrap_or_default(),
            "Request"
        );

        match destination {
            Some(destination) => destination.serve(req).await,
            None => match &self.default_route {
                Some(route) => route.serve(req).await,
                None => self.not_found(),
            },
        }
    }

    /// "No route" response listing the routes currently known
    pub fn not_found(&self) -> Response<ProxyBody> {
        let routes = self.routes();
        let mut message = String::from("No routes found for this host!\n");

        if !routes.is_empty() {
            message.push_str("\nAvailable routes:\n");
            let listing: Vec<String> = routes.keys().map(|host| format!("- http://{}", host)).collect();
            message.push_str(&listing.join("\n"));
        }

        text_error_response(GatewayErrorCode::NoRoute, message)
    }
}

/// Host the client addressed: the Host header, else the URI authority (HTTP/2)
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal
        return rest.split(']').next().unwrap_or_default();
    }
    host.split(':').next().unwrap_or_default()
}

fn is_bot<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(hyper::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|agent| {
            let agent = agent.to_lowercase();
            BOT_AGENTS.iter().any(|bot| agent.contains(bot))
        })
        .unwrap_or(false)
}

/// Set request id, Host and X-Forwarded-* headers, returning the request id.
/// Forwarded headers are overwritten: the gateway is the first trusted hop.
fn set_forwarding_headers(req: &mut Request<ProxyBody>, client_addr: SocketAddr) -> String {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let host = request_host(&*req).and_then(|h| HeaderValue::from_str(&h).ok());
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = host {
        // HTTP/2 clients only send :authority; backends still get a Host header
        if !headers.contains_key(hyper::header::HOST) {
            headers.insert(hyper::header::HOST, host.clone());
        }
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    request_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ExposedPort;
    use crate::forward::{empty_body, full_body};
    use crate::mock::MockSource;
    use http_body_util::BodyExt;
    use hyper::StatusCode;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn gateway_with(options: GatewayOptions) -> (Arc<Gateway>, Arc<MockSource>) {
        let source = Arc::new(MockSource::new());
        let gateway = Gateway::new(source.clone(), options);
        (gateway, source)
    }

    fn domain_gateway() -> (Arc<Gateway>, Arc<MockSource>) {
        gateway_with(GatewayOptions {
            domain: "apps.example.com".to_string(),
            ..Default::default()
        })
    }

    fn container(id: &str, ip: &str, domain: Option<&str>) -> ContainerMetadata {
        ContainerMetadata {
            id: id.to_string(),
            ip_address: ip.to_string(),
            exposed_ports: vec![ExposedPort::tcp(8080)],
            env: domain.map(|d| vec![format!("DOMAIN={}", d)]).unwrap_or_default(),
            tty: false,
        }
    }

    fn client() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_routing_key_from_domain_env() {
        let (gw, _) = domain_gateway();
        let c = container("0123456789abcdef", "10.0.0.5", Some("Foo.Example.com"));
        assert_eq!(gw.routing_key(&c).as_deref(), Some("foo.example.com"));
    }

    #[test]
    fn test_routing_key_falls_back_to_short_id() {
        let (gw, _) = domain_gateway();
        let c = container("0123456789abcdef", "10.0.0.5", None);
        assert_eq!(gw.routing_key(&c).as_deref(), Some("0123456789ab.apps.example.com"));

        let empty_domain = container("0123456789abcdef", "10.0.0.5", Some(""));
        assert_eq!(
            gw.routing_key(&empty_domain).as_deref(),
            Some("0123456789ab.apps.example.com")
        );
    }

    #[test]
    fn test_routing_key_skip_no_domain() {
        let (gw, _) = gateway_with(GatewayOptions {
            domain: "apps.example.com".to_string(),
            skip_no_domain: true,
            ..Default::default()
        });
        assert_eq!(gw.routing_key(&container("0123456789abcdef", "10.0.0.5", None)), None);
        assert!(gw.add(&container("0123456789abcdef", "10.0.0.5", None)).is_ok());
        assert_eq!(gw.route_count(), 0);
    }

    #[test]
    fn test_identifier_mode_keys() {
        let (gw, _) = gateway_with(GatewayOptions {
            routing_mode: RoutingMode::Identifier,
            ..Default::default()
        });
        let id = "0123456789abcdef0123456789abcdef";
        gw.add(&container(id, "10.0.0.7", Some("ignored.example.com"))).unwrap();

        assert_eq!(gw.routes().keys().collect::<Vec<_>>(), vec!["0123456789ab"]);
        assert!(gw.find_for_host("0123456789ab.anything.test").is_some());
        assert!(gw.find_for_host(&format!("{}:80", id)).is_some());
        assert!(gw.find_for_host("0123456789").is_none());
        assert!(gw.find_for_host("ffffffffffff.example.com").is_none());
    }

    #[test]
    fn test_request_key_strips_port_and_case() {
        let (gw, _) = domain_gateway();
        assert_eq!(gw.request_key("Foo.Example.com:80").as_deref(), Some("foo.example.com"));
        assert_eq!(gw.request_key("[::1]:8080").as_deref(), Some("::1"));
        assert_eq!(gw.request_key(""), None);
    }

    #[test]
    fn test_second_add_is_rejected() {
        let (gw, _) = domain_gateway();
        let c = container("aaaaaaaaaaaa1", "10.0.0.5", Some("foo.example.com"));

        gw.add(&c).unwrap();
        let err = gw.add(&c).unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyExists { .. }));

        let routes = gw.routes();
        assert_eq!(routes["foo.example.com"], vec!["http://10.0.0.5:8080"]);
    }

    #[test]
    fn test_add_without_ports_is_a_noop() {
        let (gw, _) = domain_gateway();
        let mut c = container("aaaaaaaaaaaa1", "10.0.0.5", Some("foo.example.com"));
        c.exposed_ports.clear();

        assert!(gw.add(&c).is_ok());
        assert_eq!(gw.route_count(), 0);
    }

    #[test]
    fn test_add_with_invalid_address_fails() {
        let (gw, _) = domain_gateway();
        let c = container("aaaaaaaaaaaa1", "", Some("foo.example.com"));
        assert!(matches!(gw.add(&c), Err(GatewayError::Destination(_))));
        assert_eq!(gw.route_count(), 0);
    }

    #[test]
    fn test_container_moves_between_keys() {
        let (gw, _) = domain_gateway();
        gw.add(&container("aaaaaaaaaaaa1", "10.0.0.5", Some("old.example.com"))).unwrap();
        gw.add(&container("aaaaaaaaaaaa1", "10.0.0.5", Some("new.example.com"))).unwrap();

        let routes = gw.routes();
        assert_eq!(routes.len(), 1);
        assert!(routes.contains_key("new.example.com"));
    }

    #[test]
    fn test_remove_prunes_empty_keys() {
        let (gw, _) = domain_gateway();
        let a = container("aaaaaaaaaaaa1", "10.0.0.5", Some("foo.example.com"));
        let b = container("bbbbbbbbbbbb1", "10.0.0.6", Some("foo.example.com"));
        gw.add(&a).unwrap();
        gw.add(&b).unwrap();

        assert!(gw.remove(&a));
        assert_eq!(gw.routes()["foo.example.com"], vec!["http://10.0.0.6:8080"]);

        assert!(gw.remove(&b));
        assert!(!gw.routes().contains_key("foo.example.com"));
        assert!(gw.find("foo.example.com").is_none());
    }

    #[test]
    fn test_remove_absent_is_a_noop() {
        let (gw, _) = domain_gateway();
        let a = container("aaaaaaaaaaaa1", "10.0.0.5", Some("foo.example.com"));

        assert!(!gw.remove(&a));
        assert!(!gw.remove_by_id("does-not-exist"));

        gw.add(&a).unwrap();
        assert!(gw.remove(&a));
        assert!(!gw.remove(&a));
        assert_eq!(gw.route_count(), 0);
    }

    #[test]
    fn test_remove_by_id_scans_all_keys() {
        let (gw, _) = domain_gateway();
        gw.add(&container("aaaaaaaaaaaa1", "10.0.0.5", Some("foo.example.com"))).unwrap();
        gw.add(&container("bbbbbbbbbbbb1", "10.0.0.6", Some("bar.example.com"))).unwrap();

        assert!(gw.remove_by_id("aaaaaaaaaaaa1"));
        let routes = gw.routes();
        assert!(!routes.contains_key("foo.example.com"));
        assert!(routes.contains_key("bar.example.com"));
    }

    #[test]
    fn test_flush_empties_table() {
        let (gw, _) = domain_gateway();
        gw.add(&container("aaaaaaaaaaaa1", "10.0.0.5", Some("foo.example.com"))).unwrap();
        gw.add(&container("bbbbbbbbbbbb1", "10.0.0.6", None)).unwrap();
        assert_eq!(gw.route_count(), 2);

        gw.flush();
        assert_eq!(gw.route_count(), 0);
        assert!(gw.find("foo.example.com").is_none());
    }

    #[tokio::test]
    async fn test_load_rebuilds_from_running_containers() {
        let (gw, source) = domain_gateway();
        source.insert_running(container("aaaaaaaaaaaa1", "10.0.0.5", Some("foo.example.com")));
        source.insert_running(container("bbbbbbbbbbbb1", "10.0.0.6", None));
        source.insert_stopped(container("cccccccccccc1", "10.0.0.7", Some("stopped.example.com")));

        gw.add(&container("dddddddddddd1", "10.0.0.8", Some("stale.example.com"))).unwrap();

        gw.flush();
        assert_eq!(gw.load().await.unwrap(), 2);

        let keys: Vec<String> = gw.routes().into_keys().collect();
        assert_eq!(keys, vec!["bbbbbbbbbbbb.apps.example.com", "foo.example.com"]);
    }

    #[tokio::test]
    async fn test_load_skips_uninspectable_containers() {
        let (gw, source) = domain_gateway();
        source.insert_running(container("aaaaaaaaaaaa1", "10.0.0.5", Some("foo.example.com")));
        source.list_ghost("eeeeeeeeeeee1");

        assert_eq!(gw.load().await.unwrap(), 1);
        assert!(gw.find("foo.example.com").is_some());
    }

    #[tokio::test]
    async fn test_load_fails_when_listing_fails() {
        let (gw, source) = domain_gateway();
        source.fail_listing(true);
        assert!(matches!(gw.load().await, Err(GatewayError::Container(_))));
    }

    #[test]
    fn test_find_is_roughly_uniform() {
        let (gw, _) = domain_gateway();
        for (id, ip) in [("aaaaaaaaaaaa1", "10.0.0.1"), ("bbbbbbbbbbbb1", "10.0.0.2"), ("cccccccccccc1", "10.0.0.3")] {
            gw.add(&container(id, ip, Some("k.example.com"))).unwrap();
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..10_000 {
            let dest = gw.find("k.example.com").unwrap();
            *counts.entry(dest.container_id().to_string()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for (id, count) in counts {
            assert!((2_900..=3_800).contains(&count), "{} picked {} times", id, count);
        }
    }

    #[test]
    fn test_concurrent_add_remove_and_find() {
        let (gw, _) = domain_gateway();
        let keys = ["a.example.com", "b.example.com", "c.example.com", "d.example.com"];
        let ids: Vec<String> = (0..100).map(|i| format!("{:012x}{:04}", i, i)).collect();
        let index: HashMap<String, usize> = ids.iter().cloned().enumerate().map(|(i, id)| (id, i)).collect();
        // Set once `remove` has returned for that container
        let removed: Vec<AtomicBool> = (0..ids.len()).map(|_| AtomicBool::new(false)).collect();

        std::thread::scope(|scope| {
            for (i, id) in ids.iter().enumerate() {
                let gw = &gw;
                let removed = &removed;
                let key = keys[i % keys.len()];
                scope.spawn(move || {
                    let c = container(id, &format!("10.0.{}.{}", i / 250, i % 250 + 1), Some(key));
                    gw.add(&c).unwrap();
                    if i % 2 == 0 {
                        assert!(gw.remove(&c));
                        removed[i].store(true, Ordering::SeqCst);
                    }
                });
            }

            for t in 0..4 {
                let gw = &gw;
                let index = &index;
                let removed = &removed;
                scope.spawn(move || {
                    for n in 0..250 {
                        let key = keys[(t + n) % keys.len()];
                        let gone: Vec<bool> = removed.iter().map(|f| f.load(Ordering::SeqCst)).collect();
                        if let Some(dest) = gw.find(key) {
                            let i = index[dest.container_id()];
                            assert!(!gone[i], "{} found after its removal", dest.container_id());
                        }
                    }
                });
            }
        });

        // Even-indexed containers were removed, and those are exactly the
        // ones keyed under a and c
        let routes = gw.routes();
        let total: usize = routes.values().map(|v| v.len()).sum();
        assert_eq!(total, 50);
        assert_eq!(
            routes.keys().collect::<Vec<_>>(),
            vec!["b.example.com", "d.example.com"]
        );
        assert!(gw.find("a.example.com").is_none());
    }

    #[tokio::test]
    async fn test_handle_without_route_lists_known_routes() {
        let (gw, _) = domain_gateway();
        gw.add(&container("aaaaaaaaaaaa1", "10.0.0.5", Some("foo.example.com"))).unwrap();

        assert_eq!(
            gw.find_for_host("foo.example.com:80").unwrap().to_string(),
            "http://10.0.0.5:8080"
        );

        let req = Request::builder()
            .uri("/")
            .header("Host", "bar.example.com")
            .body(empty_body())
            .unwrap();
        let response = gw.handle(req, client()).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("X-Gateway-Error").unwrap(), "NO_ROUTE");
        let body = body_string(response).await;
        assert!(body.contains("http://foo.example.com"));
    }

    #[tokio::test]
    async fn test_handle_bounces_bots() {
        let (gw, _) = gateway_with(GatewayOptions {
            domain: "apps.example.com".to_string(),
            bounce_bots: true,
            ..Default::default()
        });
        gw.add(&container("aaaaaaaaaaaa1", "10.0.0.5", Some("foo.example.com"))).unwrap();

        let req = Request::builder()
            .uri("/")
            .header("Host", "foo.example.com")
            .header("User-Agent", "Mozilla/5.0 (compatible; Googlebot/2.1)")
            .body(full_body("ignored"))
            .unwrap();
        let response = gw.handle(req, client()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_set_forwarding_headers() {
        let mut req = Request::builder()
            .uri("/")
            .header("Host", "foo.example.com")
            .header("X-Forwarded-For", "6.6.6.6")
            .header("X-Request-ID", "req-1")
            .body(empty_body())
            .unwrap();

        let request_id = set_forwarding_headers(&mut req, client());
        assert_eq!(request_id, "req-1");
        assert_eq!(req.headers().get(X_FORWARDED_FOR).unwrap(), "127.0.0.1");
        assert_eq!(req.headers().get(X_FORWARDED_HOST).unwrap(), "foo.example.com");
        assert_eq!(req.headers().get(X_FORWARDED_PROTO).unwrap(), "http");
    }

    #[test]
    fn test_forwarding_headers_from_authority() {
        let mut req = Request::builder()
            .version(hyper::Version::HTTP_2)
            .uri("http://foo.example.com/path")
            .body(empty_body())
            .unwrap();

        set_forwarding_headers(&mut req, client());
        assert_eq!(req.headers().get(X_FORWARDED_HOST).unwrap(), "foo.example.com");
        assert_eq!(req.headers().get(hyper::header::HOST).unwrap(), "foo.example.com");
    }
}
