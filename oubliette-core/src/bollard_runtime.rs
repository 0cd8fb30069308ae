//! `ContainerRuntime` implementation backed by the local Docker daemon via
//! `bollard`. This is the only production implementation; `FakeRuntime` in
//! [`crate::container::fake`] backs the lifecycle's own tests.

use async_trait::async_trait;
use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::container::{
    ContainerId, ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus, ExecOutput,
    RuntimeError,
};

pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    /// Connects using the platform default (unix socket on Linux/macOS,
    /// named pipe on Windows), honoring `DOCKER_HOST` if set.
    pub fn connect() -> std::result::Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn container_name(project_id: uuid::Uuid) -> String {
    format!("oubliette-{project_id}")
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn ensure_image(&self, image: &str) -> std::result::Result<(), RuntimeError> {
        info!(image, "pulling image");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image, status, "pull progress");
                    }
                }
                Err(e) => return Err(RuntimeError::PullFailed(image.to_string(), e.to_string())),
            }
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> std::result::Result<ContainerId, RuntimeError> {
        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|(host, container)| Mount {
                target: Some(container.clone()),
                source: Some(host.clone()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            })
            .collect();

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let host_config = HostConfig {
            mounts: Some(mounts),
            network_mode: if spec.network_isolated {
                Some("none".to_string())
            } else {
                None
            },
            ..Default::default()
        };

        let config = BollardConfig {
            image: Some(spec.image.clone()),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = container_name(spec.project_id);
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(ContainerId(response.id))
    }

    async fn start(&self, id: &ContainerId) -> std::result::Result<(), RuntimeError> {
        self.docker
            .start_container::<String>(&id.0, None)
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn stop(&self, id: &ContainerId) -> std::result::Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(&id.0, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(RuntimeError::NotFound(id.0.clone())),
            Err(e) => Err(RuntimeError::Unavailable(e.to_string())),
        }
    }

    async fn remove(&self, id: &ContainerId) -> std::result::Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                &id.0,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()), // already gone; remove is idempotent
            Err(e) => Err(RuntimeError::Unavailable(e.to_string())),
        }
    }

    async fn exec(
        &self,
        id: &ContainerId,
        cmd: &[String],
    ) -> std::result::Result<ExecOutput, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                &id.0,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?
        {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(bollard::container::LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(bollard::container::LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "exec output stream error"),
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn inspect(&self, id: &ContainerId) -> std::result::Result<ContainerStatus, RuntimeError> {
        match self.docker.inspect_container(&id.0, None).await {
            Ok(details) => {
                let running = details
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                let image = details
                    .config
                    .and_then(|c| c.image)
                    .unwrap_or_default();
                Ok(ContainerStatus {
                    state: if running {
                        ContainerState::Running
                    } else {
                        ContainerState::Stopped
                    },
                    image,
                })
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ContainerStatus {
                state: ContainerState::Missing,
                image: String::new(),
            }),
            Err(e) => Err(RuntimeError::Unavailable(e.to_string())),
        }
    }
}
