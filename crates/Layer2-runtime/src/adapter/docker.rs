//! Docker adapter - runs console containers through the Docker Engine API

use super::{AdapterError, ContainerAdapter, ContainerRef, ContainerSpec, ProcessInfo, ProcessState};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Seconds the engine waits for a graceful stop before killing
const STOP_GRACE_SECS: i64 = 10;

/// Docker Engine adapter
pub struct DockerAdapter {
    /// Docker client
    docker: Arc<Docker>,
}

impl DockerAdapter {
    /// Connect using the local socket / `DOCKER_HOST`
    pub fn connect() -> Result<Self, AdapterError> {
        let docker = Docker::connect_with_local_defaults().map_err(map_docker_error)?;
        Ok(Self::with_client(docker))
    }

    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker: Arc::new(docker),
        }
    }

    /// Whether the engine answers a ping
    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.slug.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                network_mode: spec.network.clone(),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn force_remove(&self, id: &str) -> Result<(), AdapterError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(map_docker_error(e)),
        }
    }
}

#[async_trait]
impl ContainerAdapter for DockerAdapter {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerRef, AdapterError> {
        let options = || CreateContainerOptions {
            name: spec.slug.clone(),
            ..Default::default()
        };

        let response = match self
            .docker
            .create_container(Some(options()), Self::container_config(spec))
            .await
        {
            // A leftover container from a previous incarnation holds the name
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                warn!(container = %spec.slug, "Removing stale container with the same name");
                self.force_remove(&spec.slug).await?;
                self.docker
                    .create_container(Some(options()), Self::container_config(spec))
                    .await
            }
            other => other,
        }
        .map_err(|e| match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => AdapterError::ImageNotFound(spec.image.clone()),
            other => map_docker_error(other),
        })?;

        for warning in &response.warnings {
            warn!(container = %spec.slug, warning = %warning, "Docker create warning");
        }

        debug!(container = %spec.slug, id = %response.id, "Created container");
        Ok(ContainerRef {
            id: response.id,
            name: spec.slug.clone(),
        })
    }

    async fn start(&self, container: &ContainerRef) -> Result<(), AdapterError> {
        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => AdapterError::NotFound(container.name.clone()),
                other => map_docker_error(other),
            })?;

        info!(container = %container.name, "Started container");
        Ok(())
    }

    async fn stop(&self, container: &ContainerRef) -> Result<(), AdapterError> {
        let options = StopContainerOptions {
            t: STOP_GRACE_SECS,
        };
        match self.docker.stop_container(&container.id, Some(options)).await {
            Ok(()) => {}
            // 304: already stopped, 404: already gone
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {}
            Err(e) => return Err(map_docker_error(e)),
        }

        self.force_remove(&container.id).await?;
        info!(container = %container.name, "Stopped and removed container");
        Ok(())
    }

    async fn inspect(&self, container: &ContainerRef) -> Result<ProcessInfo, AdapterError> {
        let response = self
            .docker
            .inspect_container(&container.id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => AdapterError::NotFound(container.name.clone()),
                other => map_docker_error(other),
            })?;

        let state = response.state.unwrap_or_default();
        let process_state = if state.running.unwrap_or(false) {
            ProcessState::Running
        } else {
            ProcessState::Exited {
                exit_code: state.exit_code,
            }
        };

        let address = response.network_settings.and_then(|settings| {
            settings
                .networks
                .and_then(|networks| {
                    networks
                        .into_values()
                        .filter_map(|endpoint| endpoint.ip_address)
                        .find(|ip| !ip.is_empty())
                })
                .or(settings.ip_address.filter(|ip| !ip.is_empty()))
        });

        Ok(ProcessInfo {
            state: process_state,
            pid: state.pid.filter(|pid| *pid > 0),
            address,
        })
    }
}

/// Map bollard errors onto the adapter taxonomy
fn map_docker_error(err: bollard::errors::Error) -> AdapterError {
    use bollard::errors::Error as DockerError;

    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => AdapterError::NotFound(message),
        DockerError::RequestTimeoutError => AdapterError::Timeout,
        e @ (DockerError::IOError { .. } | DockerError::HyperResponseError { .. }) => {
            AdapterError::DaemonUnreachable(e.to_string())
        }
        other => AdapterError::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DEFAULT_RPC_PORT;

    #[test]
    fn test_container_config() {
        let spec = ContainerSpec::new("ws1-kali", "metasploit:latest")
            .with_network("kestrel")
            .with_label("kestrel.workspace", "1")
            .with_env("MSF_RPC_PORT", DEFAULT_RPC_PORT.to_string());

        let config = DockerAdapter::container_config(&spec);
        assert_eq!(config.image.as_deref(), Some("metasploit:latest"));
        assert_eq!(config.env, Some(vec!["MSF_RPC_PORT=55553".to_string()]));
        assert_eq!(
            config.host_config.and_then(|h| h.network_mode).as_deref(),
            Some("kestrel")
        );
        assert_eq!(config.labels.unwrap()["kestrel.workspace"], "1");
    }

    #[test]
    fn test_error_mapping() {
        let err = map_docker_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        });
        assert_eq!(err, AdapterError::NotFound("No such container".into()));

        let err = map_docker_error(bollard::errors::Error::RequestTimeoutError);
        assert_eq!(err, AdapterError::Timeout);
    }
}
