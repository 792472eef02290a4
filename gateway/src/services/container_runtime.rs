use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

use crate::config::{AGENT_CHARACTERS_MOUNT, AGENT_CONTAINER_PORT};
use crate::services::command;

/// Everything needed to (re)create an agent container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub characters_dir: PathBuf,
    pub character_file: String,
}

impl ContainerSpec {
    /// Path of the character file as seen from inside the container.
    pub fn character_path(&self) -> String {
        format!(
            "{}/{}/{}",
            AGENT_CHARACTERS_MOUNT, self.name, self.character_file
        )
    }

    pub fn run_args(&self) -> Vec<String> {
        command::args([
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "-p".to_string(),
            format!("{}:{}", self.host_port, AGENT_CONTAINER_PORT),
            "-v".to_string(),
            format!("{}:{}", self.characters_dir.display(), AGENT_CHARACTERS_MOUNT),
            self.image.clone(),
            "pnpm".to_string(),
            "start".to_string(),
            format!("--character={}", self.character_path()),
        ])
    }
}

/// Typed operations against the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str) -> Result<()>;
    async fn run(&self, spec: &ContainerSpec) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
    async fn remove(&self, name: &str) -> Result<()>;
    async fn pause(&self, name: &str) -> Result<()>;
    async fn unpause(&self, name: &str) -> Result<()>;
    async fn restart(&self, name: &str) -> Result<()>;
    /// Errors when the container does not exist or cannot be inspected.
    async fn is_running(&self, name: &str) -> Result<bool>;
}

/// Drives the local `docker` CLI.
pub struct DockerRuntime;

impl DockerRuntime {
    async fn docker(&self, args: Vec<String>) -> Result<String> {
        command::run("docker", &args).await
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> Result<()> {
        self.docker(command::args(["pull", image]))
            .await
            .with_context(|| format!("Failed to pull image {}", image))?;
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<()> {
        let id = self
            .docker(spec.run_args())
            .await
            .with_context(|| format!("Failed to start container {}", spec.name))?;
        tracing::debug!(container = %spec.name, id = %id.trim(), "Container started");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.docker(command::args(["stop", name])).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.docker(command::args(["rm", name])).await?;
        Ok(())
    }

    async fn pause(&self, name: &str) -> Result<()> {
        self.docker(command::args(["pause", name])).await?;
        Ok(())
    }

    async fn unpause(&self, name: &str) -> Result<()> {
        self.docker(command::args(["unpause", name])).await?;
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.docker(command::args(["restart", name])).await?;
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let out = self
            .docker(command::args(["inspect", "-f", "{{.State.Running}}", name]))
            .await?;
        Ok(out.trim() == "true")
    }
}
