use crate::container::ContainerMetadata;
use crate::error::DestinationError;
use crate::forward::{Forwarder, ProxyBody, SingleTargetProxy};
use hyper::{Request, Response};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// A routable backend: one container instance at one resolved address.
///
/// Containers never change address without being recreated, so a
/// destination is never mutated once built.
pub struct Destination {
    container_id: String,
    target: Url,
    proxy: SingleTargetProxy,
}

impl Destination {
    /// Build a destination for an inspected container. Uses the lowest
    /// exposed TCP port, or `default_port` when nothing is exposed.
    pub fn new(
        container: &ContainerMetadata,
        default_port: u16,
        forwarder: Arc<Forwarder>,
    ) -> Result<Self, DestinationError> {
        let port = container.preferred_port().unwrap_or(default_port);
        let address = format!("http://{}:{}", container.ip_address, port);

        let target = Url::parse(&address)
            .map_err(|source| DestinationError::InvalidAddress { address, source })?;

        Ok(Self {
            container_id: container.id.clone(),
            proxy: SingleTargetProxy::new(target.clone(), forwarder),
            target,
        })
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Forward a request to this destination
    pub async fn serve(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        self.proxy.serve(req).await
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target.as_str().trim_end_matches('/'))
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("container_id", &self.container_id)
            .field("target", &self.target.as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ExposedPort, PortProtocol};

    fn container(ip: &str, ports: Vec<ExposedPort>) -> ContainerMetadata {
        ContainerMetadata {
            id: "f00dfeedbeef0123456789".to_string(),
            ip_address: ip.to_string(),
            exposed_ports: ports,
            ..Default::default()
        }
    }

    #[test]
    fn test_destination_uses_exposed_port() {
        let dest = Destination::new(
            &container("10.0.0.5", vec![ExposedPort::tcp(8080)]),
            5000,
            Arc::new(Forwarder::default()),
        )
        .unwrap();

        assert_eq!(dest.container_id(), "f00dfeedbeef0123456789");
        assert_eq!(dest.to_string(), "http://10.0.0.5:8080");
        assert_eq!(dest.target().port(), Some(8080));
    }

    #[test]
    fn test_destination_picks_lowest_tcp_port() {
        let ports = vec![
            ExposedPort::tcp(9090),
            ExposedPort {
                port: 53,
                protocol: PortProtocol::Udp,
            },
            ExposedPort::tcp(3000),
        ];
        let dest = Destination::new(&container("10.0.0.5", ports), 5000, Arc::new(Forwarder::default()))
            .unwrap();
        assert_eq!(dest.to_string(), "http://10.0.0.5:3000");
    }

    #[test]
    fn test_destination_falls_back_to_default_port() {
        let dest = Destination::new(&container("172.17.0.4", vec![]), 5000, Arc::new(Forwarder::default()))
            .unwrap();
        assert_eq!(dest.to_string(), "http://172.17.0.4:5000");
    }

    #[test]
    fn test_destination_rejects_empty_ip() {
        let err = Destination::new(
            &container("", vec![ExposedPort::tcp(8080)]),
            5000,
            Arc::new(Forwarder::default()),
        )
        .unwrap_err();
        assert!(matches!(err, DestinationError::InvalidAddress { .. }));
    }
}
