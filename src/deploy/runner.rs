use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::ports::{PortAllocator, PortError};
use super::progress::{LineWriter, LogSink, ProgressLog};
use super::runtime::{ContainerLaunch, ContainerRuntime, DockerCli};
use super::{DeployKey, DeployOptions, DeployRequest, Deployment};

/// Ceiling on distinct live port-to-container bindings. Guards against
/// unbounded container accumulation from first-time deployments across
/// many branches; redeploys to an already-bound port are always allowed.
pub const MAX_CONTAINERS: usize = 5;

/// Each capture buffer keeps at most this much of the newest output.
const CAPTURE_LIMIT: usize = 1024 * 1024;

const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Unable to deploy {key} as limit of {limit} has been reached")]
    Capacity { key: DeployKey, limit: usize },
    #[error("Fatal error deploying using Docker: {0}")]
    Launch(std::io::Error),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("Docker deployment failure")]
    StartupFailed { stdout: String, stderr: String },
    #[error("Docker process error: {0}")]
    Process(std::io::Error),
}

/// Accumulated process output for pattern evaluation and diagnostics.
/// Trimmed from the front once it exceeds the cap, so cumulative matching
/// always sees the newest output.
#[derive(Default)]
struct CaptureBuffer {
    inner: String,
}

impl CaptureBuffer {
    fn push(&mut self, text: &str) {
        self.inner.push_str(text);
        if self.inner.len() > CAPTURE_LIMIT {
            let mut cut = self.inner.len() - CAPTURE_LIMIT;
            while !self.inner.is_char_boundary(cut) {
                cut += 1;
            }
            self.inner.drain(..cut);
        }
    }

    fn as_str(&self) -> &str {
        &self.inner
    }

    fn into_string(self) -> String {
        self.inner
    }
}

/// Deployer that uses `docker run` to give every repository branch its
/// own container on a stable host port.
pub struct Deployer {
    options: DeployOptions,
    runtime: Arc<dyn ContainerRuntime>,
    progress: Arc<dyn ProgressLog>,
    ports: PortAllocator,
    /// Port to container name. The authoritative record of live
    /// containers; overwritten when a new container takes over a port.
    containers: Mutex<HashMap<u16, String>>,
    /// Serializes the evict/launch/record window per port. Streaming
    /// happens outside these locks.
    launch_locks: Mutex<HashMap<u16, Arc<Mutex<()>>>>,
}

impl Deployer {
    pub fn new(options: DeployOptions) -> Self {
        Self::with_runtime(options, Arc::new(DockerCli), Arc::new(LogSink))
    }

    pub fn with_runtime(
        options: DeployOptions,
        runtime: Arc<dyn ContainerRuntime>,
        progress: Arc<dyn ProgressLog>,
    ) -> Self {
        Self {
            options,
            runtime,
            progress,
            ports: PortAllocator::new(),
            containers: Mutex::new(HashMap::new()),
            launch_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run one deployment attempt to completion.
    ///
    /// Resolves the branch's port, replaces any container currently bound
    /// to it, launches the image and waits until a success pattern matches
    /// the accumulated stdout or the process exits. On success the
    /// container is left running and its remaining output is drained by a
    /// detached task.
    pub async fn deploy(&self, request: &DeployRequest) -> Result<Deployment, DeployError> {
        let key = request.key();
        let port = self.ports.resolve(&key, self.options.lower_port).await?;
        let name = key.container_name();

        let lock = self.launch_lock(port).await;
        let guard = lock.lock().await;

        let reserved = {
            let mut containers = self.containers.lock().await;
            match containers.get(&port) {
                Some(existing) => {
                    log::info!("Evicting container {existing} from port {port} for {key}");
                    self.runtime.evict(existing);
                    false
                }
                None if containers.len() >= MAX_CONTAINERS => {
                    return Err(DeployError::Capacity {
                        key,
                        limit: MAX_CONTAINERS,
                    });
                }
                None => {
                    // The slot is claimed under the same lock as the ceiling
                    // check; a concurrent first-time deploy on another port
                    // sees it counted while this launch is still in flight.
                    containers.insert(port, name.clone());
                    true
                }
            }
        };

        let launch = ContainerLaunch {
            name: name.clone(),
            image: request.image.clone(),
            host_port: port,
            source_port: self.options.source_port,
        };
        log::info!("Deploying {} on port {port} as {name}", request.image);
        let child = match self.runtime.launch(&launch).await {
            Ok(child) if child.id().is_some() => child,
            Ok(_) => {
                self.release_claim(port, reserved).await;
                return Err(DeployError::Launch(std::io::Error::other(
                    "no process id for spawned container",
                )));
            }
            Err(e) => {
                self.release_claim(port, reserved).await;
                return Err(DeployError::Launch(e));
            }
        };

        // Recorded before startup success is known (the reservation above
        // already holds the name on first-time deploys): a failed
        // deployment leaves the table pointing at the failed container,
        // which the next deploy to this port evicts.
        self.containers.lock().await.insert(port, name.clone());
        drop(guard);

        let deployment = Deployment {
            id: Uuid::now_v7(),
            key,
            container: name,
            port,
            endpoint: format!("{}:{}", self.options.base_url, port),
            started_at: Utc::now(),
        };

        self.watch_startup(child, &deployment).await?;
        Ok(deployment)
    }

    fn pattern_matches(&self, stdout: &str) -> bool {
        self.options
            .success_patterns
            .iter()
            .any(|pattern| pattern.is_match(stdout))
    }

    async fn launch_lock(&self, port: u16) -> Arc<Mutex<()>> {
        let mut locks = self.launch_locks.lock().await;
        Arc::clone(locks.entry(port).or_default())
    }

    /// Undo a first-time slot claim after a failed spawn. Takeover deploys
    /// never release: the previous container's entry stays, as evicted.
    async fn release_claim(&self, port: u16, reserved: bool) {
        if reserved {
            self.containers.lock().await.remove(&port);
        }
    }

    /// Stream the child's output until a success pattern matches the
    /// accumulated stdout or the process exits without one.
    async fn watch_startup(
        &self,
        mut child: Child,
        deployment: &Deployment,
    ) -> Result<(), DeployError> {
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeployError::Launch(std::io::Error::other("stdout not piped")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| DeployError::Launch(std::io::Error::other("stderr not piped")))?;

        let mut out_lines = LineWriter::new(Arc::clone(&self.progress), &deployment.container);
        let mut err_lines = LineWriter::new(Arc::clone(&self.progress), &deployment.container);
        let mut stdout_buf = CaptureBuffer::default();
        let mut stderr_buf = CaptureBuffer::default();

        let mut out_chunk = [0u8; READ_CHUNK];
        let mut err_chunk = [0u8; READ_CHUNK];
        let mut out_open = true;
        let mut err_open = true;
        let mut matched = false;

        while (out_open || err_open) && !matched {
            tokio::select! {
                read = stdout.read(&mut out_chunk), if out_open => {
                    let n = read.map_err(DeployError::Process)?;
                    if n == 0 {
                        out_open = false;
                        continue;
                    }
                    let text = String::from_utf8_lossy(&out_chunk[..n]);
                    out_lines.write(&text);
                    stdout_buf.push(&text);
                    // Patterns run against everything accumulated so far;
                    // a match may span chunk boundaries.
                    matched = self.pattern_matches(stdout_buf.as_str());
                }
                read = stderr.read(&mut err_chunk), if err_open => {
                    let n = read.map_err(DeployError::Process)?;
                    if n == 0 {
                        err_open = false;
                        continue;
                    }
                    let text = String::from_utf8_lossy(&err_chunk[..n]);
                    err_lines.write(&text);
                    stderr_buf.push(&text);
                }
            }
        }

        if matched {
            // The container stays up. A detached task keeps forwarding
            // its output and reaps the eventual exit.
            log::info!(
                "Deployment {} for {} is up at {}",
                deployment.id,
                deployment.key,
                deployment.endpoint
            );
            detach_drain(
                child,
                stdout,
                stderr,
                out_lines,
                err_lines,
                deployment.container.clone(),
            );
            return Ok(());
        }

        let status = child.wait().await.map_err(DeployError::Process)?;
        out_lines.flush();
        err_lines.flush();

        // One last check: the pattern may have completed right at exit.
        if self.pattern_matches(stdout_buf.as_str()) {
            log::info!(
                "Deployment {} for {} is up at {}",
                deployment.id,
                deployment.key,
                deployment.endpoint
            );
            return Ok(());
        }

        log::error!(
            "Deployment {} for {} exited with {status} before any success pattern matched",
            deployment.id,
            deployment.key,
        );
        log::error!(
            "stdout:\n{}\nstderr:\n{}",
            stdout_buf.as_str(),
            stderr_buf.as_str()
        );
        Err(DeployError::StartupFailed {
            stdout: stdout_buf.into_string(),
            stderr: stderr_buf.into_string(),
        })
    }

    /// Snapshot of both tables, joined per key.
    pub async fn snapshot(&self) -> Vec<DeploySnapshot> {
        let assignments = self.ports.snapshot().await;
        let containers = self.containers.lock().await;
        assignments
            .into_iter()
            .map(|(key, port)| DeploySnapshot {
                endpoint: format!("{}:{}", self.options.base_url, port),
                container: containers.get(&port).cloned(),
                key,
                port,
            })
            .collect()
    }

    /// Stop and remove every container this deployer recorded. Awaited,
    /// for use on daemon shutdown.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.containers.lock().await.drain().map(|(_, n)| n).collect();
        let removals = names.into_iter().map(|name| {
            let runtime = Arc::clone(&self.runtime);
            async move {
                log::info!("Removing container {name}");
                if let Err(e) = runtime.remove(&name).await {
                    log::warn!("Unable to remove container {name}: {e}");
                }
            }
        });
        future::join_all(removals).await;
    }
}

/// Keeps forwarding a resolved deployment's output to the progress log
/// and reaps the process when it eventually exits.
fn detach_drain(
    mut child: Child,
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    mut out_lines: LineWriter,
    mut err_lines: LineWriter,
    container: String,
) {
    tokio::spawn(async move {
        let mut out_chunk = [0u8; READ_CHUNK];
        let mut err_chunk = [0u8; READ_CHUNK];
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            tokio::select! {
                read = stdout.read(&mut out_chunk), if out_open => match read {
                    Ok(0) | Err(_) => out_open = false,
                    Ok(n) => out_lines.write(&String::from_utf8_lossy(&out_chunk[..n])),
                },
                read = stderr.read(&mut err_chunk), if err_open => match read {
                    Ok(0) | Err(_) => err_open = false,
                    Ok(n) => err_lines.write(&String::from_utf8_lossy(&err_chunk[..n])),
                },
            }
        }
        out_lines.flush();
        err_lines.flush();

        match child.wait().await {
            Ok(status) => log::info!("Container {container} exited with {status}"),
            Err(e) => log::warn!("Unable to reap container {container}: {e}"),
        }
    });
}

/// One row of the deployment table as reported by the API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeploySnapshot {
    pub key: DeployKey,
    pub port: u16,
    pub container: Option<String>,
    pub endpoint: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::ports::testing::quiet_base;
    use crate::deploy::progress::testing::VecSink;
    use async_trait::async_trait;
    use regex::Regex;
    use std::process::Stdio;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};
    use tokio::sync::Notify;

    /// Runs `sh -c` scripts keyed by image name instead of docker, and
    /// records every launch and eviction.
    struct FakeRuntime {
        scripts: StdMutex<HashMap<String, String>>,
        launches: StdMutex<Vec<ContainerLaunch>>,
        evictions: StdMutex<Vec<String>>,
        gates: StdMutex<HashMap<String, Arc<Notify>>>,
    }

    impl FakeRuntime {
        fn new(scripts: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(
                    scripts
                        .iter()
                        .map(|(image, script)| (image.to_string(), script.to_string()))
                        .collect(),
                ),
                launches: StdMutex::new(Vec::new()),
                evictions: StdMutex::new(Vec::new()),
                gates: StdMutex::new(HashMap::new()),
            })
        }

        fn launches(&self) -> Vec<ContainerLaunch> {
            self.launches.lock().unwrap().clone()
        }

        fn evictions(&self) -> Vec<String> {
            self.evictions.lock().unwrap().clone()
        }

        /// Launches of `image` block until the returned handle is notified.
        fn gate_launch(&self, image: &str) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            self.gates
                .lock()
                .unwrap()
                .insert(image.to_string(), Arc::clone(&gate));
            gate
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn launch(&self, launch: &ContainerLaunch) -> std::io::Result<Child> {
            self.launches.lock().unwrap().push(launch.clone());
            let gate = self.gates.lock().unwrap().get(&launch.image).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(&launch.image)
                .cloned()
                .ok_or_else(|| std::io::Error::other("unknown image"))?;
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(script)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
        }

        fn evict(&self, name: &str) {
            self.evictions.lock().unwrap().push(name.to_string());
        }

        async fn remove(&self, _name: &str) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn options(lower_port: u16, patterns: &[&str]) -> DeployOptions {
        DeployOptions {
            lower_port,
            source_port: 8080,
            base_url: "http://localhost".to_string(),
            success_patterns: patterns.iter().map(|p| Regex::new(p).unwrap()).collect(),
        }
    }

    fn request(repo: &str, branch: &str, image: &str) -> DeployRequest {
        DeployRequest {
            repo: repo.to_string(),
            branch: branch.to_string(),
            image: image.to_string(),
        }
    }

    #[tokio::test]
    async fn test_success_mid_stream_leaves_process_running() {
        let runtime = FakeRuntime::new(&[(
            "app:1",
            "echo 'Started app in 2.1 seconds'; sleep 5",
        )]);
        let deployer = Deployer::with_runtime(
            options(quiet_base(49210, 1).await, &["Started .+ in .+ seconds"]),
            runtime.clone(),
            VecSink::new(),
        );

        let start = Instant::now();
        let deployment = deployer
            .deploy(&request("app", "main", "app:1"))
            .await
            .expect("deployment should resolve on pattern match");

        // Resolved on the matching chunk, not on process exit.
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(deployment.endpoint, format!("http://localhost:{}", deployment.port));
        assert_eq!(deployment.container, "app_main");
        assert_eq!(runtime.launches().len(), 1);
    }

    #[tokio::test]
    async fn test_exit_without_match_surfaces_both_streams() {
        let runtime = FakeRuntime::new(&[(
            "app:bad",
            "echo starting; echo boom >&2; exit 1",
        )]);
        let deployer = Deployer::with_runtime(
            options(quiet_base(49220, 1).await, &["Started"]),
            runtime.clone(),
            VecSink::new(),
        );

        let err = deployer
            .deploy(&request("app", "main", "app:bad"))
            .await
            .expect_err("deployment should fail without a match");

        match err {
            DeployError::StartupFailed { stdout, stderr } => {
                assert_eq!(stdout, "starting\n");
                assert_eq!(stderr, "boom\n");
            }
            other => panic!("expected StartupFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_match_exactly_at_exit_resolves() {
        // No trailing newline and an immediate exit: the match is only
        // guaranteed by the re-test against the final accumulated output.
        let runtime = FakeRuntime::new(&[("app:quick", "printf 'ready'")]);
        let deployer = Deployer::with_runtime(
            options(quiet_base(49230, 1).await, &["ready"]),
            runtime.clone(),
            VecSink::new(),
        );

        deployer
            .deploy(&request("app", "main", "app:quick"))
            .await
            .expect("match at exit should resolve");
    }

    #[tokio::test]
    async fn test_redeploy_evicts_previous_container_once() {
        let runtime = FakeRuntime::new(&[("app:1", "echo up")]);
        let deployer = Deployer::with_runtime(
            options(quiet_base(49240, 1).await, &["up"]),
            runtime.clone(),
            VecSink::new(),
        );

        let first = deployer.deploy(&request("app", "main", "app:1")).await.unwrap();
        assert!(runtime.evictions().is_empty());

        let second = deployer.deploy(&request("app", "main", "app:1")).await.unwrap();
        assert_eq!(second.port, first.port);
        assert_eq!(runtime.evictions(), vec!["app_main".to_string()]);
    }

    #[tokio::test]
    async fn test_capacity_ceiling_blocks_sixth_first_time_deploy() {
        let runtime = FakeRuntime::new(&[("app:1", "echo up")]);
        let deployer = Deployer::with_runtime(
            options(quiet_base(49250, 6).await, &["up"]),
            runtime.clone(),
            VecSink::new(),
        );

        for branch in ["b1", "b2", "b3", "b4", "b5"] {
            deployer
                .deploy(&request("app", branch, "app:1"))
                .await
                .unwrap();
        }

        let err = deployer
            .deploy(&request("app", "b6", "app:1"))
            .await
            .expect_err("sixth first-time deploy must hit the ceiling");
        assert!(matches!(err, DeployError::Capacity { limit: MAX_CONTAINERS, .. }));
        // No process was spawned for the rejected attempt.
        assert_eq!(runtime.launches().len(), 5);

        // Reusing an already-bound port is still permitted.
        deployer.deploy(&request("app", "b1", "app:1")).await.unwrap();
        assert_eq!(runtime.launches().len(), 6);
    }

    #[tokio::test]
    async fn test_concurrent_first_time_deploys_cannot_exceed_ceiling() {
        let runtime = FakeRuntime::new(&[("app:1", "echo up"), ("app:2", "echo up")]);
        let deployer = Arc::new(Deployer::with_runtime(
            options(quiet_base(49310, 6).await, &["up"]),
            runtime.clone(),
            VecSink::new(),
        ));

        for branch in ["b1", "b2", "b3", "b4"] {
            deployer
                .deploy(&request("app", branch, "app:1"))
                .await
                .unwrap();
        }

        // Hold the fifth deploy inside its launch: the final slot must
        // already count against the ceiling before the spawn completes.
        let gate = runtime.gate_launch("app:2");
        let fifth = tokio::spawn({
            let deployer = Arc::clone(&deployer);
            async move { deployer.deploy(&request("app", "b5", "app:2")).await }
        });
        while runtime.launches().len() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = deployer
            .deploy(&request("app", "b6", "app:1"))
            .await
            .expect_err("sixth first-time deploy must hit the ceiling mid-launch");
        assert!(matches!(err, DeployError::Capacity { limit: MAX_CONTAINERS, .. }));

        gate.notify_one();
        fifth
            .await
            .unwrap()
            .expect("gated deploy should still resolve");
        assert_eq!(runtime.launches().len(), 5);
    }

    #[tokio::test]
    async fn test_branch_port_scenario() {
        let runtime = FakeRuntime::new(&[("app:1", "echo up")]);
        let base = quiet_base(49270, 2).await;
        let deployer = Deployer::with_runtime(
            options(base, &["up"]),
            runtime.clone(),
            VecSink::new(),
        );

        let main = deployer.deploy(&request("r", "main", "app:1")).await.unwrap();
        let feature = deployer.deploy(&request("r", "feature", "app:1")).await.unwrap();
        assert_eq!(main.port, base);
        assert_eq!(feature.port, base + 1);

        let again = deployer.deploy(&request("r", "main", "app:1")).await.unwrap();
        assert_eq!(again.port, 49270);
        assert_eq!(runtime.evictions(), vec!["r_main".to_string()]);
    }

    #[tokio::test]
    async fn test_progress_log_receives_delimited_lines() {
        let runtime = FakeRuntime::new(&[("app:1", "echo one; echo two; echo up")]);
        let sink = VecSink::new();
        let deployer = Deployer::with_runtime(
            options(quiet_base(49280, 1).await, &["up"]),
            runtime.clone(),
            sink.clone(),
        );

        deployer.deploy(&request("app", "main", "app:1")).await.unwrap();

        let lines = sink.lines();
        assert!(lines.contains(&"one".to_string()));
        assert!(lines.contains(&"two".to_string()));
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let runtime = FakeRuntime::new(&[]);
        let deployer = Deployer::with_runtime(
            options(quiet_base(49290, 1).await, &["up"]),
            runtime.clone(),
            VecSink::new(),
        );

        let err = deployer
            .deploy(&request("app", "main", "app:unknown"))
            .await
            .expect_err("unknown image should fail to launch");
        assert!(matches!(err, DeployError::Launch(_)));

        // The failed attempt releases its slot claim; the port assignment
        // itself persists with no container bound.
        let snapshot = deployer.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].container.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_joins_tables() {
        let runtime = FakeRuntime::new(&[("app:1", "echo up")]);
        let base = quiet_base(49300, 1).await;
        let deployer = Deployer::with_runtime(
            options(base, &["up"]),
            runtime.clone(),
            VecSink::new(),
        );

        deployer.deploy(&request("app", "main", "app:1")).await.unwrap();
        let snapshot = deployer.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].port, base);
        assert_eq!(snapshot[0].container.as_deref(), Some("app_main"));
        assert_eq!(snapshot[0].endpoint, format!("http://localhost:{base}"));
    }

    #[test]
    fn test_capture_buffer_front_trims() {
        let mut buf = CaptureBuffer::default();
        buf.push(&"x".repeat(CAPTURE_LIMIT));
        buf.push("tail marker");
        assert_eq!(buf.as_str().len(), CAPTURE_LIMIT);
        assert!(buf.as_str().ends_with("tail marker"));
    }
}
