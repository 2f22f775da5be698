//! Worker supervising an external OS process.
//!
//! Media pipelines run out of process so a native crash takes down the child,
//! never the device. The child is spawned with `kill_on_drop`, so aborting the
//! supervising task (the terminate phase of `WorkerHandle::stop`) SIGKILLs it.

use super::{Health, StopOutcome, StopTimeouts, Worker, WorkerContext, STOP_POLL};
use crate::error::WorkerError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// What to do with a stale exclusive endpoint left by a previous run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourcePolicy {
    /// Remove the stale artifact and proceed
    Overwrite,
    /// Refuse to start, health goes to Error
    Strict,
}

/// Waits between the signals sent to a child on stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalLadder {
    pub interrupt_wait: Duration,
    pub terminate_wait: Duration,
}

impl Default for SignalLadder {
    fn default() -> Self {
        Self {
            interrupt_wait: Duration::from_secs(2),
            terminate_wait: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Claim {
    path: PathBuf,
    policy: ResourcePolicy,
}

#[derive(Debug, Clone)]
struct Dependency {
    path: PathBuf,
    timeout: Duration,
}

pub struct ProcessWorker {
    name: String,
    program: String,
    args: Vec<String>,
    lethal: bool,
    ladder: SignalLadder,
    claim: Option<Claim>,
    dependency: Option<Dependency>,
}

impl ProcessWorker {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            lethal: false,
            ladder: SignalLadder::default(),
            claim: None,
            dependency: None,
        }
    }

    /// `gst-launch-1.0 -e <pipeline>`; `-e` turns SIGINT into an EOS so muxers flush
    pub fn pipeline(name: impl Into<String>, launcher: &str, pipeline: &str) -> Result<Self, WorkerError> {
        let mut args = vec!["-e".to_string()];
        args.extend(
            shell_words::split(pipeline).map_err(|e| WorkerError::Failed(format!("bad pipeline: {e}")))?,
        );
        Ok(Self::new(name, launcher, args))
    }

    pub fn lethal(mut self, lethal: bool) -> Self {
        self.lethal = lethal;
        self
    }

    pub fn ladder(mut self, ladder: SignalLadder) -> Self {
        self.ladder = ladder;
        self
    }

    /// Exclusive endpoint the child creates (e.g. a shared-memory socket)
    pub fn claim(mut self, path: impl Into<PathBuf>, policy: ResourcePolicy) -> Self {
        self.claim = Some(Claim {
            path: path.into(),
            policy,
        });
        self
    }

    /// Path that must exist before the child is spawned
    pub fn requires(mut self, path: impl Into<PathBuf>, timeout: Duration) -> Self {
        self.dependency = Some(Dependency {
            path: path.into(),
            timeout,
        });
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    async fn supervise(self, ctx: WorkerContext) -> Result<(), WorkerError> {
        let tag = ctx.tag();

        if let Some(claim) = &self.claim {
            prepare_claim(claim, &tag)?;
        }

        if let Some(dep) = &self.dependency {
            ctx.health.set(Health::Warning);
            if !wait_for_path(&dep.path, dep.timeout, &ctx).await? {
                debug!("{} stopped while waiting for {:?}", tag, dep.path);
                return Ok(());
            }
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            let stderr_tag = tag.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("{} {}", stderr_tag, line);
                }
            });
        }

        info!("{} launched {} (pid {:?})", tag, self.program, child.id());
        let mut ready = self.claim.is_none();
        ctx.health.set(if ready { Health::Ok } else { Health::Warning });

        let mut ticker = tokio::time::interval(STOP_POLL);
        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status?;
                    self.release_claim(&tag);
                    if ctx.stop.is_stopped() {
                        info!("{} exited ({})", tag, status);
                        return Ok(());
                    }
                    return Err(WorkerError::Exited(status.to_string()));
                }
                _ = ticker.tick() => {
                    if ctx.stop.is_stopped() {
                        break;
                    }
                    if !ready {
                        if let Some(claim) = &self.claim {
                            if claim.path.exists() {
                                ready = true;
                                ctx.health.set(Health::Ok);
                                info!("{} ready on {:?}", tag, claim.path);
                            }
                        }
                    }
                }
            }
        }

        let outcome = self.shutdown_child(&mut child, &tag).await;
        ctx.escalation.record(outcome);
        self.release_claim(&tag);
        Ok(())
    }

    /// Walks SIGINT, SIGTERM, SIGKILL and returns the step that ended the child
    async fn shutdown_child(&self, child: &mut Child, tag: &str) -> StopOutcome {
        send_interrupt(child, tag);
        if let Ok(status) = tokio::time::timeout(self.ladder.interrupt_wait, child.wait()).await {
            debug!("{} child exited after SIGINT: {:?}", tag, status);
            return StopOutcome::Graceful;
        }

        warn!("{} child ignored SIGINT for {:?}, sending SIGTERM", tag, self.ladder.interrupt_wait);
        send_terminate(child, tag);
        if let Ok(status) = tokio::time::timeout(self.ladder.terminate_wait, child.wait()).await {
            warn!("{} child exited after SIGTERM: {:?}", tag, status);
            return StopOutcome::Terminated;
        }

        error!("{} child ignored SIGTERM, killing", tag);
        if let Err(e) = child.kill().await {
            error!("{} kill failed: {}", tag, e);
        }
        StopOutcome::Killed
    }

    fn release_claim(&self, tag: &str) {
        let Some(claim) = &self.claim else { return };
        match std::fs::remove_file(&claim.path) {
            Ok(()) => debug!("{} released {:?}", tag, claim.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("{} could not remove {:?}: {}", tag, claim.path, e),
        }
    }
}

impl Worker for ProcessWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn lethal(&self) -> bool {
        self.lethal
    }

    fn stop_timeouts(&self) -> StopTimeouts {
        // the task must outlive the whole signal ladder before the handle aborts it
        StopTimeouts {
            grace: self.ladder.interrupt_wait + self.ladder.terminate_wait + Duration::from_millis(500),
            kill: Duration::from_secs(2),
        }
    }

    fn run(self: Box<Self>, ctx: WorkerContext) -> BoxFuture<'static, Result<(), WorkerError>> {
        Box::pin(self.supervise(ctx))
    }
}

fn prepare_claim(claim: &Claim, tag: &str) -> Result<(), WorkerError> {
    if !claim.path.exists() {
        return Ok(());
    }
    match claim.policy {
        ResourcePolicy::Overwrite => {
            warn!("{} removing stale {:?}", tag, claim.path);
            std::fs::remove_file(&claim.path).map_err(|e| WorkerError::ResourceConflict {
                path: claim.path.clone(),
                reason: format!("stale endpoint could not be removed: {e}"),
            })
        }
        ResourcePolicy::Strict => Err(WorkerError::ResourceConflict {
            path: claim.path.clone(),
            reason: "endpoint already exists".into(),
        }),
    }
}

/// Polls until `path` exists. `Ok(false)` means the stop flag tripped first.
async fn wait_for_path(path: &Path, timeout: Duration, ctx: &WorkerContext) -> Result<bool, WorkerError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut announced = false;
    loop {
        if path.exists() {
            return Ok(true);
        }
        if ctx.stop.is_stopped() {
            return Ok(false);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(WorkerError::DependencyMissing(path.to_path_buf()));
        }
        if !announced {
            info!("{} waiting for {:?}", ctx.tag(), path);
            announced = true;
        }
        tokio::time::sleep(STOP_POLL).await;
    }
}

#[cfg(unix)]
fn signal_child(child: &Child, signal: nix::sys::signal::Signal, tag: &str) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Some(pid) = child.id() else { return };
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        warn!("{} failed to send {:?}: {}", tag, signal, e);
    }
}

#[cfg(unix)]
fn send_interrupt(child: &mut Child, tag: &str) {
    signal_child(child, nix::sys::signal::Signal::SIGINT, tag);
}

#[cfg(unix)]
fn send_terminate(child: &mut Child, tag: &str) {
    signal_child(child, nix::sys::signal::Signal::SIGTERM, tag);
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child, tag: &str) {
    send_terminate(child, tag);
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, tag: &str) {
    if let Err(e) = child.start_kill() {
        warn!("{} failed to stop child: {}", tag, e);
    }
}
