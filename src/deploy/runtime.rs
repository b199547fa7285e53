use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

/// Everything needed to start one container.
#[derive(Debug, Clone)]
pub struct ContainerLaunch {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub source_port: u16,
}

/// Seam between the supervisor and the container engine.
///
/// `launch` must return a live child with piped stdout/stderr; `evict` is
/// fire-and-forget and must never block the caller; `remove` is the
/// awaited variant used by the shutdown sweep.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn launch(&self, launch: &ContainerLaunch) -> std::io::Result<Child>;

    fn evict(&self, name: &str);

    async fn remove(&self, name: &str) -> std::io::Result<()>;
}

/// Runs containers through the `docker` CLI.
pub struct DockerCli;

impl DockerCli {
    fn run_args(launch: &ContainerLaunch) -> Vec<String> {
        vec![
            "run".to_string(),
            format!("-p{}:{}", launch.host_port, launch.source_port),
            format!("--name={}", launch.name),
            launch.image.clone(),
        ]
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn launch(&self, launch: &ContainerLaunch) -> std::io::Result<Child> {
        Command::new("docker")
            .args(Self::run_args(launch))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }

    fn evict(&self, name: &str) {
        let name = name.to_string();
        // Issued, not awaited. The old and new container may briefly
        // coexist; failures must not block the next deployment.
        tokio::spawn(async move {
            match Command::new("docker")
                .args(["rm", "-f", &name])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
            {
                Ok(status) if status.success() => {
                    log::debug!("Evicted container {name}");
                }
                Ok(status) => {
                    log::warn!("Evicting container {name} exited with {status}");
                }
                Err(e) => {
                    log::warn!("Unable to evict container {name}: {e}");
                }
            }
        });
    }

    async fn remove(&self, name: &str) -> std::io::Result<()> {
        let status = Command::new("docker")
            .args(["rm", "-f", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(std::io::Error::other(format!(
                "docker rm -f {name} exited with {status}"
            )));
        }
        Ok(())
    }
}
