//! The `berth build` pipeline: docker login, docker build, docker push.
//! Sequential, streamed to the log, first failing step aborts.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::config::RegistryConfig;
use crate::deploy::progress::{LogSink, ProgressLog};
use crate::image::{parent_images, ImageRef};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("'docker {step}' exited with code {code}")]
    Step { step: String, code: i32 },
    #[error("{0}")]
    Push(String),
    #[error("Unable to determine an image name from the context directory")]
    ImageName,
}

const MISSING_PUSH_CREDENTIALS: &str =
    "Required configuration missing for pushing docker image. Please make sure to set \
     'registry', 'user' and 'password' in your configuration.";

/// Build the image for `context` and optionally push it.
/// Returns the full image reference that was built.
pub async fn run(
    registry: Option<&RegistryConfig>,
    context: &Path,
    dockerfile: Option<&Path>,
    tag: Option<&str>,
) -> Result<ImageRef, BuildError> {
    let progress: Arc<dyn ProgressLog> = Arc::new(LogSink);
    let image = resolve_image(context, registry, tag)?;
    let dockerfile_path = context.join(dockerfile.unwrap_or(Path::new("Dockerfile")));

    report_parent_images(&dockerfile_path, &progress);

    let credentials = resolve_credentials(registry);

    if let Some((user, password)) = &credentials {
        let host = registry.map(|r| r.host.as_str()).unwrap_or_default();
        progress.line("build", "Running 'docker login'");
        let mut login = Command::new("docker");
        login.args(["login", "--username", user, "--password-stdin"]);
        if !host.is_empty() {
            login.arg(host);
        }
        // The command line is never echoed; the password goes over stdin.
        run_step(&progress, "login", login, Some(password.as_bytes())).await?;
    } else {
        progress.line(
            "build",
            "Skipping 'docker login' because user and password are not configured",
        );
    }

    let mut build = Command::new("docker");
    build
        .arg("build")
        .arg(context)
        .arg("-f")
        .arg(&dockerfile_path)
        .args(["-t", &image.to_string()]);
    log::info!("Running 'docker build' for {image}");
    run_step(&progress, "build", build, None).await?;

    if registry.is_some_and(|r| r.push) {
        if credentials.is_none() {
            progress.line("build", MISSING_PUSH_CREDENTIALS);
            return Err(BuildError::Push(MISSING_PUSH_CREDENTIALS.to_string()));
        }
        log::info!("Running 'docker push' for {image}");
        let mut push = Command::new("docker");
        push.args(["push", &image.to_string()]);
        run_step(&progress, "push", push, None).await?;
    } else {
        progress.line("build", "Skipping 'docker push'");
    }

    Ok(image)
}

/// Image name defaults: name from the context directory, tag `latest`,
/// registry prefix from config.
fn resolve_image(
    context: &Path,
    registry: Option<&RegistryConfig>,
    tag: Option<&str>,
) -> Result<ImageRef, BuildError> {
    let context = std::path::absolute(context)?;
    let name = context
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_lowercase())
        .ok_or(BuildError::ImageName)?;

    Ok(ImageRef {
        registry: registry.map(|r| r.host.clone()),
        name,
        tag: Some(tag.unwrap_or("latest").to_string()),
        digest: None,
    })
}

fn report_parent_images(dockerfile_path: &Path, progress: &Arc<dyn ProgressLog>) {
    let dockerfile = match std::fs::read_to_string(dockerfile_path) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("Unable to read {dockerfile_path:?}: {e}");
            return;
        }
    };
    for parent in parent_images(&dockerfile) {
        progress.line("build", &format!("Parent image: {parent}"));
        if !parent.is_tagged() {
            log::warn!("Parent image {parent} is untagged and floats on 'latest'");
        }
    }
}

/// Explicit config credentials win; otherwise fall back to the Docker
/// credential store for the registry host.
fn resolve_credentials(registry: Option<&RegistryConfig>) -> Option<(String, String)> {
    let registry = registry?;
    if let (Some(user), Some(password)) = (&registry.user, &registry.password) {
        return Some((user.clone(), password.clone()));
    }
    match crate::login::get_docker_credentials(&registry.host) {
        Ok(credentials) => Some(credentials),
        Err(e) => {
            log::debug!("No stored credentials for {}: {e}", registry.host);
            None
        }
    }
}

/// Run one pipeline step, forwarding its output line by line to the
/// progress log. A non-zero exit aborts the pipeline.
async fn run_step(
    progress: &Arc<dyn ProgressLog>,
    step: &str,
    mut command: Command,
    stdin_data: Option<&[u8]>,
) -> Result<(), BuildError> {
    command
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await?;
        }
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_task = tokio::spawn(forward_lines(stdout, Arc::clone(progress), step.to_string()));
    let err_task = tokio::spawn(forward_lines(stderr, Arc::clone(progress), step.to_string()));

    let status = child.wait().await?;
    let _ = out_task.await;
    let _ = err_task.await;

    if !status.success() {
        return Err(BuildError::Step {
            step: step.to_string(),
            code: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

async fn forward_lines<R>(reader: Option<R>, progress: Arc<dyn ProgressLog>, step: String)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else { return };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        progress.line(&step, &line);
    }
}
