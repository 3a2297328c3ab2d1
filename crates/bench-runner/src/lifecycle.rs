use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, error, info};

use crate::driver::CompositionRun;
use crate::fsutil::ensure_dir;
use crate::image::ImageRef;

/// The container runtime surface the manager drives.
pub trait ContainerRuntime {
    fn pull(&self, image: &str) -> Result<()>;

    /// Content-addressable id of a local image.
    fn inspect_image_id(&self, image: &str) -> Result<String>;

    fn container_ip(&self, container: &str) -> Result<String>;

    fn stop_container(&self, container: &str) -> Result<()>;

    fn remove_container(&self, container: &str) -> Result<()>;

    /// Writes the container's combined logs to `dest`, replacing it.
    fn capture_logs(&self, container: &str, dest: &Path) -> Result<()>;

    fn compose_up(&self, compose_file: &Path) -> Result<CompositionRun>;
}

/// `docker` and `docker-compose` on the PATH.
#[derive(Debug, Clone)]
pub struct DockerCli {
    docker: String,
    compose: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            compose: "docker-compose".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new(docker: impl Into<String>, compose: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
            compose: compose.into(),
        }
    }

    fn docker(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {} {}", self.docker, args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output")
                .to_string();
            return Err(anyhow!(
                "{} {} exited with {}: {}",
                self.docker,
                args.join(" "),
                output.status,
                detail
            ));
        }
        Ok(output.stdout)
    }
}

impl ContainerRuntime for DockerCli {
    fn pull(&self, image: &str) -> Result<()> {
        let out = self.docker(&["pull", image])?;
        debug!(image = %image, output = %String::from_utf8_lossy(&out).trim(), "docker pull");
        Ok(())
    }

    fn inspect_image_id(&self, image: &str) -> Result<String> {
        let out = self.docker(&["inspect", image])?;
        parse_image_id(&out)
    }

    fn container_ip(&self, container: &str) -> Result<String> {
        let out = self.docker(&["inspect", container])?;
        parse_container_ip(&out)
    }

    fn stop_container(&self, container: &str) -> Result<()> {
        self.docker(&["stop", container]).map(|_| ())
    }

    fn remove_container(&self, container: &str) -> Result<()> {
        self.docker(&["rm", container]).map(|_| ())
    }

    fn capture_logs(&self, container: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        let file = fs::File::create(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let stderr = file.try_clone()?;
        let status = Command::new(&self.docker)
            .args(["logs", container])
            .stdin(Stdio::null())
            .stdout(file)
            .stderr(stderr)
            .status()
            .with_context(|| format!("failed to run {} logs {}", self.docker, container))?;
        if !status.success() {
            return Err(anyhow!(
                "{} logs {} exited with {}",
                self.docker,
                container,
                status
            ));
        }
        Ok(())
    }

    fn compose_up(&self, compose_file: &Path) -> Result<CompositionRun> {
        let file = compose_file.to_string_lossy().to_string();
        CompositionRun::spawn(
            &self.compose,
            [
                "-f",
                file.as_str(),
                "up",
                "--build",
                "--abort-on-container-exit",
            ],
        )
    }
}

pub fn parse_image_id(inspect_output: &[u8]) -> Result<String> {
    let value: Value =
        serde_json::from_slice(inspect_output).context("docker inspect output is not JSON")?;
    value
        .pointer("/0/Id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("docker inspect output has no Id"))
}

/// First network address of a container in `docker inspect` output.
pub fn parse_container_ip(inspect_output: &[u8]) -> Result<String> {
    let value: Value =
        serde_json::from_slice(inspect_output).context("docker inspect output is not JSON")?;
    value
        .pointer("/0/NetworkSettings/Networks")
        .and_then(|v| v.as_object())
        .and_then(|networks| networks.values().next())
        .and_then(|network| network.get("IPAddress"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("container has no network address"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub image: ImageRef,
    pub tag: String,
}

/// Acquisition and cleanup of solution images and their containers.
pub struct ImageLifecycle<R> {
    runtime: R,
}

impl<R: ContainerRuntime> ImageLifecycle<R> {
    pub fn new(runtime: R) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Removes a leftover container from an earlier run. It may legitimately
    /// not exist, so failures are only logged.
    pub fn cleanup_stale_container(&self, name: &str) {
        debug!(container = %name, "cleaning up unused container, if left");
        if let Err(e) = self.runtime.remove_container(name) {
            info!(container = %name, error = %e, "container cleanup failed; proceeding");
        }
    }

    /// Stops and removes the shared harness container.
    pub fn retire_harness(&self, name: &str) {
        if let Err(e) = self.runtime.stop_container(name) {
            debug!(container = %name, error = %e, "harness stop failed; proceeding");
        }
        self.cleanup_stale_container(name);
    }

    /// Pulls the image and resolves the build id results are tagged with.
    pub fn prepare(&self, image: &ImageRef) -> Result<PreparedImage> {
        info!(image = %image, "pulling image");
        self.runtime
            .pull(image.as_str())
            .with_context(|| format!("failed to pull {}", image))?;
        debug!(image = %image, "inspecting image");
        let tag = self
            .runtime
            .inspect_image_id(image.as_str())
            .with_context(|| format!("failed to inspect {}", image))?;
        info!(image = %image, tag = %tag, "image tag resolved");
        Ok(PreparedImage {
            image: image.clone(),
            tag,
        })
    }

    /// Best-effort capture of a container's logs.
    pub fn save_logs(&self, container: &str, dest: &Path) -> bool {
        match self.runtime.capture_logs(container, dest) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    container = %container,
                    dest = %dest.display(),
                    error = %e,
                    "failed to save container logs"
                );
                false
            }
        }
    }
}
