//! Lifecycle of shared, long-lived backing processes and of per-node
//! subprocess groups.

use crate::ProcessLifecycleError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheck {
    /// `host:port` accepting TCP connections.
    Tcp(String),
    /// URL answering GET with a 2xx status.
    Http(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharedProcessSpec {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub health: HealthCheck,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_release_grace_ms")]
    pub release_grace_ms: u64,
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_grace_ms() -> u64 {
    3_000
}

fn default_release_grace_ms() -> u64 {
    500
}

impl SharedProcessSpec {
    pub fn validate(&self) -> Result<(), ProcessLifecycleError> {
        if self.name.trim().is_empty() {
            return Err(ProcessLifecycleError::InvalidSpec(
                "shared process name must not be empty".to_string(),
            ));
        }
        if self.command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(ProcessLifecycleError::InvalidSpec(format!(
                "shared process '{}' has no command",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_healthy(&self, check: &HealthCheck) -> bool;
}

/// Healthy when `host:port` accepts a TCP connection.
#[derive(Clone, Debug)]
pub struct TcpProbe {
    pub connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl TcpProbe {
    pub async fn check(&self, address: &str) -> bool {
        matches!(
            timeout(self.connect_timeout, tokio::net::TcpStream::connect(address)).await,
            Ok(Ok(_))
        )
    }
}

/// Healthy when a GET returns a 2xx status.
#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            request_timeout: Duration::from_secs(2),
        }
    }
}

impl HttpProbe {
    pub async fn check(&self, url: &str) -> bool {
        match self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DefaultHealthProbe {
    pub tcp: TcpProbe,
    pub http: HttpProbe,
}

#[async_trait]
impl HealthProbe for DefaultHealthProbe {
    async fn is_healthy(&self, check: &HealthCheck) -> bool {
        match check {
            HealthCheck::Tcp(address) => self.tcp.check(address).await,
            HealthCheck::Http(url) => self.http.check(url).await,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Started,
    Reused,
}

impl Ownership {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Reused => "reused",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessLease {
    pub name: String,
    pub ownership: Ownership,
    pub pid: Option<u32>,
}

struct ManagedProcess {
    spec: SharedProcessSpec,
    owner_run_id: String,
    child: Child,
}

/// Starts shared processes at most once and stops the ones a run owns.
///
/// `ensure` calls are serialized per manager, so overlapping callers never
/// launch the same process twice.
pub struct ProcessLifecycleManager {
    probe: Arc<dyn HealthProbe>,
    owned: Mutex<BTreeMap<String, ManagedProcess>>,
}

impl Default for ProcessLifecycleManager {
    fn default() -> Self {
        Self::new(Arc::new(DefaultHealthProbe::default()))
    }
}

impl ProcessLifecycleManager {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            probe,
            owned: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn ensure(
        &self,
        run_id: &str,
        spec: &SharedProcessSpec,
    ) -> Result<ProcessLease, ProcessLifecycleError> {
        spec.validate()?;
        let mut owned = self.owned.lock().await;

        if self.probe.is_healthy(&spec.health).await {
            let pid = owned.get(&spec.name).and_then(|managed| managed.child.id());
            info!(run_id, name = spec.name.as_str(), "reusing healthy shared process");
            return Ok(ProcessLease {
                name: spec.name.clone(),
                ownership: Ownership::Reused,
                pid,
            });
        }

        if let Some(mut stale) = owned.remove(&spec.name) {
            warn!(
                name = spec.name.as_str(),
                "owned shared process is unhealthy; replacing it"
            );
            terminate(&mut stale).await;
        }

        let mut child = spawn_detached(spec)?;
        let pid = child.id();
        // Kills the group if this future is dropped before the process is owned.
        let startup_guard = ProcessGroupGuard::new(pid);
        info!(run_id, name = spec.name.as_str(), pid, "launched shared process");

        let deadline = Instant::now() + Duration::from_millis(spec.startup_timeout_ms);
        loop {
            if self.probe.is_healthy(&spec.health).await {
                break;
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(ProcessLifecycleError::ExitedEarly {
                        name: spec.name.clone(),
                        reason: status.to_string(),
                    });
                }
                Ok(None) => {}
                Err(error) => {
                    return Err(ProcessLifecycleError::Launch {
                        name: spec.name.clone(),
                        reason: error.to_string(),
                    });
                }
            }
            if Instant::now() >= deadline {
                let mut failed = ManagedProcess {
                    spec: spec.clone(),
                    owner_run_id: run_id.to_string(),
                    child,
                };
                terminate(&mut failed).await;
                return Err(ProcessLifecycleError::Unhealthy {
                    name: spec.name.clone(),
                    timeout_ms: spec.startup_timeout_ms,
                });
            }
            sleep(Duration::from_millis(spec.poll_interval_ms.max(1))).await;
        }

        owned.insert(
            spec.name.clone(),
            ManagedProcess {
                spec: spec.clone(),
                owner_run_id: run_id.to_string(),
                child,
            },
        );
        startup_guard.disarm();
        Ok(ProcessLease {
            name: spec.name.clone(),
            ownership: Ownership::Started,
            pid,
        })
    }

    /// Stops every process started by `run_id`. Returns the stopped names.
    pub async fn shutdown_owned(&self, run_id: &str) -> Vec<String> {
        let mut owned = self.owned.lock().await;
        let names: Vec<String> = owned
            .iter()
            .filter(|(_, managed)| managed.owner_run_id == run_id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            if let Some(mut managed) = owned.remove(name) {
                terminate(&mut managed).await;
            }
        }
        names
    }

    pub async fn owned_by(&self, run_id: &str) -> Vec<String> {
        self.owned
            .lock()
            .await
            .iter()
            .filter(|(_, managed)| managed.owner_run_id == run_id)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn spawn_detached(spec: &SharedProcessSpec) -> Result<Child, ProcessLifecycleError> {
    let (program, args) = spec
        .command
        .split_first()
        .ok_or_else(|| ProcessLifecycleError::InvalidSpec(format!("'{}' has no command", spec.name)))?;
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = spec.working_dir.as_ref() {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    command.process_group(0);
    command.spawn().map_err(|error| ProcessLifecycleError::Launch {
        name: spec.name.clone(),
        reason: error.to_string(),
    })
}

async fn terminate(managed: &mut ManagedProcess) {
    let name = managed.spec.name.as_str();
    let pid = managed.child.id();
    if let Some(pid) = pid {
        signal_group(pid, GroupSignal::Terminate);
    }
    let grace = Duration::from_millis(managed.spec.grace_ms);
    if timeout(grace, managed.child.wait()).await.is_err() {
        warn!(name, pid, "shared process ignored SIGTERM; killing group");
        if let Some(pid) = pid {
            signal_group(pid, GroupSignal::Kill);
        }
        if let Err(error) = managed.child.kill().await {
            warn!(name, %error, "failed to kill shared process");
        }
    }
    // Let the port/socket drain before a back-to-back run probes it.
    sleep(Duration::from_millis(managed.spec.release_grace_ms)).await;
    info!(name, pid, "stopped shared process");
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum GroupSignal {
    Terminate,
    Kill,
}

/// Signals the process group led by `pid`. Missing groups are ignored.
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: GroupSignal) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(error) = killpg(Pid::from_raw(raw), signal) {
        if error != nix::errno::Errno::ESRCH {
            warn!(pid, %error, "failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pid: u32, _signal: GroupSignal) {}

/// Kills a subprocess group when dropped unless disarmed first.
pub(crate) struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    pub(crate) fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    pub(crate) fn disarm(mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            signal_group(pid, GroupSignal::Kill);
        }
    }
}
