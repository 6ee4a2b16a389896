//! HTTP front end: accept loop, per-connection service and path routing

use crate::admin::Admin;
use crate::config::Config;
use crate::forward::ProxyBody;
use crate::gateway::Gateway;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Handler selected for a request path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Proxy,
    Routes,
    RoutesJson,
    Reset,
    Logs,
    Env,
    File,
    Help,
    Robots,
}

/// Maps request paths to gateway or debug handlers. Built once at startup.
pub struct Router {
    gateway: Arc<Gateway>,
    admin: Admin,
    debug_endpoints: bool,
    robots: bool,
}

impl Router {
    pub fn new(gateway: Arc<Gateway>, admin: Admin, debug_endpoints: bool, robots: bool) -> Self {
        Self {
            gateway,
            admin,
            debug_endpoints,
            robots,
        }
    }

    pub fn from_config(config: &Config, gateway: Arc<Gateway>) -> Self {
        let admin = Admin::new(Arc::clone(&gateway), config.log_lines);
        Self::new(gateway, admin, config.debug_endpoints, config.bounce_bots)
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Endpoint serving `path`. Unregistered endpoints fall through to the proxy.
    pub fn resolve(&self, path: &str) -> Endpoint {
        if self.robots && path == "/robots.txt" {
            return Endpoint::Robots;
        }

        if !self.debug_endpoints {
            return Endpoint::Proxy;
        }

        match path {
            "/_routes" => Endpoint::Routes,
            "/_routes.json" => Endpoint::RoutesJson,
            "/_reset" => Endpoint::Reset,
            "/_logs" => Endpoint::Logs,
            "/_env" => Endpoint::Env,
            "/_file" => Endpoint::File,
            "/_help" => Endpoint::Help,
            _ => Endpoint::Proxy,
        }
    }

    pub async fn dispatch(&self, req: Request<ProxyBody>, client_addr: SocketAddr) -> Response<ProxyBody> {
        let endpoint = self.resolve(req.uri().path());
        if endpoint != Endpoint::Proxy {
            debug!(method = %req.method(), path = %req.uri().path(), ?endpoint, "Debug endpoint request");
        }

        match endpoint {
            Endpoint::Proxy => self.gateway.handle(req, client_addr).await,
            Endpoint::Routes => self.admin.routes(),
            Endpoint::RoutesJson => self.admin.routes_json(),
            Endpoint::Reset => self.admin.reset().await,
            Endpoint::Logs => self.admin.logs(&req).await,
            Endpoint::Env => self.admin.env(&req).await,
            Endpoint::File => self.admin.file(&req).await,
            Endpoint::Help => self.admin.help(),
            Endpoint::Robots => self.admin.robots(),
        }
    }
}

/// The gateway's HTTP server
pub struct GatewayServer {
    bind_addr: String,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(bind_addr: impl Into<String>, router: Router, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            router: Arc::new(router),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.bind_addr, e))?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already-bound listener
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Starting gateway server on http://{}", addr);

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, router: Arc<Router>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move {
            let req = req.map(|body| body.boxed());
            Ok::<_, Infallible>(router.dispatch(req, addr).await)
        }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
