//! Docker-backed container source

use crate::container::{ContainerEvent, ContainerMetadata, ContainerSource, EventStream, ExposedPort};
use crate::error::ContainerError;
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions, LogsOptions};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerInspectResponse, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::{Stream, StreamExt};
use hyper::body::Bytes;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Seconds before a Docker API call times out
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Container source talking to the Docker daemon
pub struct DockerSource {
    client: Docker,
}

impl DockerSource {
    /// Connect to the Docker daemon at `host` and verify it responds
    pub async fn connect(host: &str) -> anyhow::Result<Self> {
        let client = Self::connect_to_host(host).map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                 Ensure Docker is running and accessible.",
                host,
                e
            )
        })?;

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure dockerd is running and DOCKER_HOST is correct.",
                e
            )
        })?;

        debug!(host, "Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") || host.starts_with('/') {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid DOCKER_HOST format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }
}

fn map_not_found(id: &str, err: bollard::errors::Error) -> ContainerError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => ContainerError::NotFound(id.to_string()),
        e => ContainerError::from(e),
    }
}

/// Extract routing metadata from an inspect response
fn metadata_from_inspect(id: &str, info: ContainerInspectResponse) -> ContainerMetadata {
    let config = info.config.unwrap_or_default();

    let mut exposed_ports: Vec<ExposedPort> = config
        .exposed_ports
        .unwrap_or_default()
        .keys()
        .filter_map(|spec| {
            let port = ExposedPort::parse(spec);
            if port.is_none() {
                warn!(container_id = id, spec = %spec, "Ignoring unparsable exposed port");
            }
            port
        })
        .collect();
    exposed_ports.sort_by_key(|p| (p.port, p.protocol));

    ContainerMetadata {
        id: info.id.unwrap_or_else(|| id.to_string()),
        ip_address: info
            .network_settings
            .map(|settings| {
                resolve_ip_address(settings.ip_address, settings.networks.unwrap_or_default())
            })
            .unwrap_or_default(),
        exposed_ports,
        env: config.env.unwrap_or_default(),
        tty: config.tty.unwrap_or(false),
    }
}

/// Prefer the legacy bridge address; containers on user-defined networks only
/// carry per-network addresses, so fall back to the first network by name.
fn resolve_ip_address(
    primary: Option<String>,
    networks: HashMap<String, bollard::models::EndpointSettings>,
) -> String {
    if let Some(ip) = primary.filter(|ip| !ip.is_empty()) {
        return ip;
    }

    let mut names: Vec<&String> = networks.keys().collect();
    names.sort();

    names
        .into_iter()
        .filter_map(|name| networks.get(name).and_then(|n| n.ip_address.clone()))
        .find(|ip| !ip.is_empty())
        .unwrap_or_default()
}

fn event_from_message(message: EventMessage) -> ContainerEvent {
    ContainerEvent {
        id: message.actor.and_then(|actor| actor.id).unwrap_or_default(),
        status: message.action.unwrap_or_default(),
    }
}

/// Collect a stream of log frames into a single buffer
async fn collect_output<S>(stream: S) -> Result<Bytes, ContainerError>
where
    S: Stream<Item = Result<bollard::container::LogOutput, ContainerError>>,
{
    futures::pin_mut!(stream);
    let mut buf = Vec::new();
    while let Some(frame) = stream.next().await {
        buf.extend_from_slice(&frame?.into_bytes());
    }
    Ok(Bytes::from(buf))
}

#[async_trait]
impl ContainerSource for DockerSource {
    async fn list_running(&self) -> Result<Vec<String>, ContainerError> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerMetadata, ContainerError> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_not_found(id, e))?;

        Ok(metadata_from_inspect(id, info))
    }

    async fn events(&self) -> Result<EventStream, ContainerError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);

        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        let stream = self
            .client
            .events(Some(options))
            .map(|result| {
                result
                    .map(event_from_message)
                    .map_err(|e| ContainerError::Stream(e.to_string()))
            })
            .boxed();

        Ok(stream)
    }

    async fn logs(&self, id: &str, tail: &str) -> Result<Bytes, ContainerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let stream = self
            .client
            .logs(id, Some(options))
            .map(|frame| frame.map_err(|e| map_not_found(id, e)));

        collect_output(stream).await
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<Bytes, ContainerError> {
        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            cmd: Some(cmd),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(id, options)
            .await
            .map_err(|e| map_not_found(id, e))?;

        match self
            .client
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await?
        {
            StartExecResults::Attached { output, .. } => {
                collect_output(output.map(|frame| frame.map_err(ContainerError::from))).await
            }
            StartExecResults::Detached => Ok(Bytes::new()),
        }
    }
}
