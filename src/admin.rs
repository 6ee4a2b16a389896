//! Debug endpoints served alongside proxied traffic (`/_routes`, `/_logs`, ...)

use crate::destination::Destination;
use crate::forward::{full_body, ProxyBody};
use crate::gateway::{request_host, Gateway};
use hyper::header::{CONTENT_TYPE, LOCATION};
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use tracing::{info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const HELP: &str = "\
List of all available system endpoints;

/_help        - Show this message
/_routes      - List all available routes
/_routes.json - List all routes and their destinations as JSON
/_reset       - Flush all existing routes and load new ones
/_logs        - Print container logs (for specified host)
/_env         - Print container environment variables (for specified host)
/_file        - Print a file from the container (for specified host)

To get logs or environment variable for a container:

http://my-container.domain.com/_logs
http://my-container.domain.com/_logs?lines=100
http://my-container.domain.com/_env
http://my-container.domain.com/_file?file=/etc/hosts";

const ROBOTS: &str = "User-agent: *\nDisallow: /";

/// Helper to create a plain-text response
fn response(status: StatusCode, body: impl Into<String>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<String>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// First value of a query parameter
fn query_param<B>(req: &Request<B>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Handlers for the gateway's debug endpoints
pub struct Admin {
    gateway: Arc<Gateway>,
    log_lines: u32,
}

impl Admin {
    /// `log_lines` is the `/_logs` tail when the request names none
    pub fn new(gateway: Arc<Gateway>, log_lines: u32) -> Self {
        Self { gateway, log_lines }
    }

    /// `/_routes`: one `http://<key>` per line
    pub fn routes(&self) -> Response<ProxyBody> {
        let listing: Vec<String> = self
            .gateway
            .routes()
            .into_keys()
            .map(|key| format!("http://{}", key))
            .collect();

        response(StatusCode::OK, listing.join("\n"))
    }

    /// `/_routes.json`: every key and its destination URLs
    pub fn routes_json(&self) -> Response<ProxyBody> {
        let body = serde_json::to_string(&self.gateway.routes()).unwrap_or_else(|_| "{}".to_string());
        json_response(StatusCode::OK, body)
    }

    /// `/_reset`: rebuild the routing table, then redirect to `/_routes`
    pub async fn reset(&self) -> Response<ProxyBody> {
        self.gateway.flush();

        match self.gateway.load().await {
            Ok(count) => {
                info!(containers = count, "Routing table reset");
                Response::builder()
                    .status(StatusCode::MOVED_PERMANENTLY)
                    .header(LOCATION, "/_routes")
                    .body(full_body(""))
                    .expect("valid redirect response")
            }
            Err(e) => {
                warn!(error = %e, "Routing table reset failed");
                response(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e))
            }
        }
    }

    /// `/_logs`: recent output of the container serving this host
    pub async fn logs<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        let Some(destination) = self.destination_for(req) else {
            return self.gateway.not_found();
        };

        let lines = query_param(req, "lines")
            .filter(|v| !v.is_empty())
            .or_else(|| query_param(req, "limit").filter(|v| !v.is_empty()))
            .unwrap_or_else(|| self.log_lines.to_string());

        match self.gateway.source().logs(destination.container_id(), &lines).await {
            Ok(output) => response(StatusCode::OK, String::from_utf8_lossy(&output)),
            Err(e) => response(StatusCode::OK, format!("Error while fetching logs: {}\n", e)),
        }
    }

    /// `/_env`: environment of the container serving this host
    pub async fn env<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        let Some(destination) = self.destination_for(req) else {
            return self.gateway.not_found();
        };

        match self.gateway.source().inspect(destination.container_id()).await {
            Ok(container) => response(StatusCode::OK, container.env.join("\n")),
            Err(e) => response(StatusCode::OK, format!("Error while inspecting container: {}\n", e)),
        }
    }

    /// `/_file?file=<path>`: contents of a file inside the container
    pub async fn file<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        let Some(destination) = self.destination_for(req) else {
            return self.gateway.not_found();
        };

        let Some(file) = query_param(req, "file").filter(|f| !f.is_empty()) else {
            return response(StatusCode::BAD_REQUEST, "Missing file parameter\n");
        };

        let cmd = vec!["cat".to_string(), file];
        match self.gateway.source().exec(destination.container_id(), cmd).await {
            Ok(output) => response(StatusCode::OK, String::from_utf8_lossy(&output)),
            Err(e) => response(StatusCode::OK, format!("Error while reading file: {}\n", e)),
        }
    }

    pub fn help(&self) -> Response<ProxyBody> {
        response(StatusCode::OK, HELP)
    }

    pub fn robots(&self) -> Response<ProxyBody> {
        response(StatusCode::OK, ROBOTS)
    }

    fn destination_for<B>(&self, req: &Request<B>) -> Option<Arc<Destination>> {
        request_host(req).and_then(|host| self.gateway.find_for_host(&host))
    }
}
