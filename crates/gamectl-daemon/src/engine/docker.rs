//! Docker engine over the Docker Engine API (bollard).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerStateStatusEnum, HostConfig, PortBinding as DockerPortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::stats::{CpuSample, CpuSampler, bytes_to_mb};
use super::{
    ContainerEngine, ContainerRef, ContainerSnapshot, ContainerSpec, ContainerStatus, EngineError,
    LogStream, ResourceUsage,
};

/// Lines of history sent before following new output.
const LOG_TAIL_LINES: &str = "100";

/// Docker-backed [`ContainerEngine`].
///
/// Constructed once at process start. Constructing does not contact the
/// daemon; an unreachable daemon surfaces as [`EngineError::Unavailable`]
/// on the first call.
pub struct DockerEngine {
    docker: Docker,
    cpu: CpuSampler,
}

impl DockerEngine {
    /// Connect to `socket`, or to the local defaults (`DOCKER_HOST`, then
    /// the platform socket) when `None`.
    pub fn connect(socket: Option<&str>, timeout: Duration) -> Result<Self, EngineError> {
        let docker = match socket {
            Some(path) => {
                Docker::connect_with_socket(path, timeout.as_secs(), bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults().map(|d| d.with_timeout(timeout)),
        }
        .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        info!(socket = socket.unwrap_or("local defaults"), "Docker client configured");
        Ok(Self {
            docker,
            cpu: CpuSampler::new(),
        })
    }

    async fn sample_usage(&self, container: &ContainerRef) -> Result<ResourceUsage, EngineError> {
        let mut stats = self.docker.stats(
            container.as_str(),
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        let Some(reading) = stats.next().await else {
            return Ok(ResourceUsage::default());
        };
        let reading = reading.map_err(classify)?;

        let cpu = &reading.cpu_stats;
        let online_cpus = cpu
            .online_cpus
            .or_else(|| {
                cpu.cpu_usage
                    .percpu_usage
                    .as_ref()
                    .map(|per_cpu| per_cpu.len() as u64)
            })
            .unwrap_or(1);
        let sample = CpuSample {
            container_total: cpu.cpu_usage.total_usage,
            system_total: cpu.system_cpu_usage.unwrap_or(0),
            online_cpus: u32::try_from(online_cpus).unwrap_or(u32::MAX),
        };

        Ok(ResourceUsage {
            cpu_percent: self.cpu.observe(container.as_str(), sample),
            memory_mb: bytes_to_mb(reading.memory_stats.usage.unwrap_or(0)),
        })
    }
}

/// Map a Docker API error onto the engine taxonomy.
///
/// Anything that is not a response from the daemon (connection refused,
/// missing socket, timeout) counts as the engine being unavailable.
fn classify(err: DockerError) -> EngineError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        DockerError::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api(format!("{status_code}: {message}")),
        other => EngineError::Unavailable(other.to_string()),
    }
}

/// `304 Not Modified` means the container was already in the requested
/// state.
fn ignore_not_modified(result: Result<(), DockerError>) -> Result<(), EngineError> {
    match result {
        Err(DockerError::DockerResponseServerError {
            status_code: 304, ..
        }) => Ok(()),
        other => other.map_err(classify),
    }
}

/// Split `repo[:tag]`, keeping registry ports (`host:5000/repo`) intact.
fn split_image(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

const fn map_state(state: ContainerStateStatusEnum) -> ContainerStatus {
    match state {
        ContainerStateStatusEnum::RUNNING => ContainerStatus::Running,
        ContainerStateStatusEnum::RESTARTING => ContainerStatus::Restarting,
        ContainerStateStatusEnum::EXITED
        | ContainerStateStatusEnum::DEAD
        | ContainerStateStatusEnum::CREATED => ContainerStatus::Exited,
        _ => ContainerStatus::Unknown,
    }
}

fn grace_secs(grace: Duration) -> i64 {
    i64::try_from(grace.as_secs()).unwrap_or(i64::MAX)
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for binding in &spec.ports {
        exposed_ports.insert(binding.container_key(), HashMap::new());
        port_bindings.insert(
            binding.container_key(),
            Some(vec![DockerPortBinding {
                host_ip: None,
                host_port: Some(binding.host_port.to_string()),
            }]),
        );
    }

    let binds = spec
        .volumes
        .iter()
        .map(|v| format!("{}:{}:rw", v.host_path.display(), v.container_path))
        .collect();
    let env = spec
        .environment
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    Config {
        image: Some(spec.image.clone()),
        env: Some(env),
        exposed_ports: Some(exposed_ports),
        stop_timeout: Some(grace_secs(spec.stop_grace)),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            binds: Some(binds),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map(|_| ()).map_err(classify)
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        let (from_image, tag) = split_image(image);
        info!(image = from_image, tag, "Pulling image");

        let mut progress = self.docker.create_image(
            Some(CreateImageOptions {
                from_image,
                tag,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(step) = progress.next().await {
            let step = step.map_err(|e| match classify(e) {
                EngineError::Unavailable(msg) => EngineError::Unavailable(msg),
                other => EngineError::Image(other.to_string()),
            })?;
            if let Some(error) = step.error {
                return Err(EngineError::Image(error));
            }
            if let Some(status) = step.status {
                debug!(image, status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerRef, EngineError> {
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                container_config(spec),
            )
            .await
            .map_err(|e| match classify(e) {
                EngineError::NotFound(msg) => EngineError::Image(msg),
                other => other,
            })?;
        for warning in &created.warnings {
            warn!(container = %spec.name, warning, "Docker warning on create");
        }

        let container = ContainerRef::new(created.id);
        if let Err(e) = self
            .docker
            .start_container(container.as_str(), None::<StartContainerOptions<String>>)
            .await
        {
            // A created-but-never-started container would make the next
            // launch attempt fail with a name conflict.
            if let Err(cleanup) = self
                .docker
                .remove_container(
                    container.as_str(),
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                warn!(
                    container = %container.short(),
                    error = %cleanup,
                    "Failed to remove container that did not start"
                );
            }
            return Err(classify(e));
        }

        info!(container = %container.short(), name = %spec.name, "Container started");
        Ok(container)
    }

    async fn inspect(&self, container: &ContainerRef) -> Result<ContainerSnapshot, EngineError> {
        let details = self
            .docker
            .inspect_container(container.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;

        let status = details
            .state
            .and_then(|state| state.status)
            .map_or(ContainerStatus::Unknown, map_state);

        let usage = if status == ContainerStatus::Running {
            self.sample_usage(container).await?
        } else {
            ResourceUsage::default()
        };

        Ok(ContainerSnapshot { status, usage })
    }

    async fn start(&self, container: &ContainerRef) -> Result<(), EngineError> {
        ignore_not_modified(
            self.docker
                .start_container(container.as_str(), None::<StartContainerOptions<String>>)
                .await,
        )
    }

    async fn stop(&self, container: &ContainerRef, grace: Duration) -> Result<(), EngineError> {
        ignore_not_modified(
            self.docker
                .stop_container(
                    container.as_str(),
                    Some(StopContainerOptions {
                        t: grace_secs(grace),
                    }),
                )
                .await,
        )
    }

    async fn restart(&self, container: &ContainerRef, grace: Duration) -> Result<(), EngineError> {
        self.docker
            .restart_container(
                container.as_str(),
                Some(RestartContainerOptions {
                    t: isize::try_from(grace.as_secs()).unwrap_or(isize::MAX),
                }),
            )
            .await
            .map_err(classify)
    }

    async fn remove(
        &self,
        container: &ContainerRef,
        purge_volumes: bool,
    ) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                container.as_str(),
                Some(RemoveContainerOptions {
                    v: purge_volumes,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(classify)?;
        self.cpu.forget(container.as_str());
        Ok(())
    }

    async fn stream_logs(&self, container: &ContainerRef) -> Result<LogStream, EngineError> {
        // Fail fast on a missing container instead of yielding an error on
        // the first poll.
        self.docker
            .inspect_container(container.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;

        let docker = self.docker.clone();
        let name = container.as_str().to_string();
        let stream = async_stream::stream! {
            let mut logs = docker.logs(
                &name,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    tail: LOG_TAIL_LINES.to_string(),
                    ..Default::default()
                }),
            );
            while let Some(chunk) = logs.next().await {
                yield chunk.map(|output| output.to_string()).map_err(classify);
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_image_handles_tags_and_registries() {
        assert_eq!(
            split_image("thijsvanloef/palworld-server-docker:latest"),
            ("thijsvanloef/palworld-server-docker", "latest")
        );
        assert_eq!(split_image("ubuntu"), ("ubuntu", "latest"));
        assert_eq!(
            split_image("registry.local:5000/game/server"),
            ("registry.local:5000/game/server", "latest")
        );
        assert_eq!(
            split_image("registry.local:5000/game/server:v2"),
            ("registry.local:5000/game/server", "v2")
        );
    }

    #[test]
    fn server_errors_map_by_status() {
        let not_found = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        };
        assert!(matches!(classify(not_found), EngineError::NotFound(_)));

        let conflict = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "name in use".into(),
        };
        assert!(matches!(classify(conflict), EngineError::Conflict(_)));

        let boom = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        assert!(matches!(classify(boom), EngineError::Api(_)));
    }

    #[test]
    fn transport_errors_are_unavailable() {
        let err = DockerError::RequestTimeoutError;
        assert!(classify(err).is_unavailable());
    }

    #[test]
    fn not_modified_is_success() {
        let result = ignore_not_modified(Err(DockerError::DockerResponseServerError {
            status_code: 304,
            message: String::new(),
        }));
        assert!(result.is_ok());
    }

    #[test]
    fn states_map_onto_engine_statuses() {
        assert_eq!(
            map_state(ContainerStateStatusEnum::RUNNING),
            ContainerStatus::Running
        );
        assert_eq!(
            map_state(ContainerStateStatusEnum::EXITED),
            ContainerStatus::Exited
        );
        assert_eq!(
            map_state(ContainerStateStatusEnum::RESTARTING),
            ContainerStatus::Restarting
        );
        assert_eq!(
            map_state(ContainerStateStatusEnum::PAUSED),
            ContainerStatus::Unknown
        );
    }
}
