//! Login flow controller: drives the scan-to-login handshake.
//!
//! Flow: start() → POST /start → poll { artifact, status } every tick →
//!       success (settle, then hide) | failed (stay visible) | close()/refresh().
//!
//! Each (re)start bumps a generation counter. The poll task and the settle
//! timer carry the generation they were spawned for and drop any result once
//! it is no longer current. Aborting the poll task also aborts the fetches it
//! is awaiting, so a cancelled flow never writes to the snapshot.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::errors::HandshakeError;
use crate::login::api::HandshakeApi;
use crate::login::backoff::{retry_with_backoff, BackoffPolicy};
use crate::models::login::{QrArtifact, RemoteLoginStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginFlowState {
    NotStarted,
    Waiting,
    Success,
    Failed,
}

impl LoginFlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoginFlowState::Success | LoginFlowState::Failed)
    }
}

/// What the UI renders. Written only by the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginSnapshot {
    pub status: LoginFlowState,
    pub artifact: Option<QrArtifact>,
    /// Whether the code display is open.
    pub visible: bool,
    pub elapsed_seconds: Option<u64>,
}

impl Default for LoginSnapshot {
    fn default() -> Self {
        Self {
            status: LoginFlowState::NotStarted,
            artifact: None,
            visible: false,
            elapsed_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoginFlowConfig {
    pub poll_interval: Duration,
    /// Pause between a success report and hiding the code display.
    pub settle_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for LoginFlowConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            settle_delay: Duration::from_millis(2000),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Default)]
struct FlowTasks {
    generation: u64,
    poll: Option<JoinHandle<()>>,
    settle: Option<JoinHandle<()>>,
}

impl FlowTasks {
    /// Invalidates everything in flight and returns the new generation.
    fn cancel(&mut self) -> u64 {
        self.generation += 1;
        if let Some(poll) = self.poll.take() {
            poll.abort();
        }
        if let Some(settle) = self.settle.take() {
            settle.abort();
        }
        self.generation
    }
}

struct LoginInner {
    api: Arc<dyn HandshakeApi>,
    config: LoginFlowConfig,
    snapshot: watch::Sender<LoginSnapshot>,
    tasks: Mutex<FlowTasks>,
}

#[derive(Clone)]
pub struct LoginFlowController {
    inner: Arc<LoginInner>,
}

impl LoginFlowController {
    pub fn new(api: Arc<dyn HandshakeApi>, config: LoginFlowConfig) -> Self {
        let (snapshot, _) = watch::channel(LoginSnapshot::default());
        Self {
            inner: Arc::new(LoginInner {
                api,
                config,
                snapshot,
                tasks: Mutex::new(FlowTasks::default()),
            }),
        }
    }

    /// Opens the code display and asks the service to start a login flow.
    /// Polling begins once the service confirms the flow is running.
    pub async fn start(&self) -> Result<(), HandshakeError> {
        let generation = self.inner.begin();

        let outcome = self.inner.api.start().await;
        if !self.inner.is_current(generation) {
            debug!("Login start response arrived after the flow was cancelled");
            return Ok(());
        }

        match outcome {
            Ok(resp) if resp.flow_started() => {
                info!(
                    status = resp.status.as_deref().unwrap_or("started"),
                    "Login flow started"
                );
                Arc::clone(&self.inner).begin_polling(generation);
                Ok(())
            }
            Ok(resp) => {
                let status = resp.status.unwrap_or_else(|| "unknown".to_string());
                warn!(%status, message = ?resp.message, "Login service refused to start");
                self.inner.abandon(generation);
                Err(HandshakeError::StartRejected { status })
            }
            Err(e) => {
                error!("Failed to start login flow: {e}");
                self.inner.abandon(generation);
                Err(e)
            }
        }
    }

    /// Discards the current code and starts over.
    #[allow(dead_code)]
    pub async fn refresh(&self) -> Result<(), HandshakeError> {
        self.start().await
    }

    /// Stops polling and hides the code display. A finished outcome stays readable.
    pub fn close(&self) {
        self.inner.lock_tasks().cancel();
        self.inner.snapshot.send_modify(|s| {
            s.visible = false;
            s.artifact = None;
            s.elapsed_seconds = None;
            if !s.status.is_terminal() {
                s.status = LoginFlowState::NotStarted;
            }
        });
        info!("Login code display closed");
    }

    pub fn watch(&self) -> watch::Receiver<LoginSnapshot> {
        self.inner.snapshot.subscribe()
    }

    #[allow(dead_code)]
    pub fn snapshot(&self) -> LoginSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn status(&self) -> LoginFlowState {
        self.inner.snapshot.borrow().status
    }

    #[allow(dead_code)]
    pub fn is_polling(&self) -> bool {
        self.inner
            .lock_tasks()
            .poll
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl LoginInner {
    fn lock_tasks(&self) -> MutexGuard<'_, FlowTasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_tasks().generation == generation
    }

    fn begin(&self) -> u64 {
        let generation = self.lock_tasks().cancel();
        self.snapshot.send_replace(LoginSnapshot {
            visible: true,
            ..LoginSnapshot::default()
        });
        generation
    }

    fn abandon(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        self.snapshot.send_modify(|s| {
            s.visible = false;
            s.status = LoginFlowState::NotStarted;
        });
    }

    fn begin_polling(self: Arc<Self>, generation: u64) {
        let mut tasks = self.lock_tasks();
        if tasks.generation != generation {
            return;
        }
        self.snapshot
            .send_modify(|s| s.status = LoginFlowState::Waiting);
        tasks.poll = Some(tokio::spawn(Arc::clone(&self).poll_loop(generation)));
    }

    /// One tick fetches the artifact and the status side by side. The first
    /// tick fires immediately. A terminal status drops whatever artifact
    /// retries are still pending.
    async fn poll_loop(self: Arc<Self>, generation: u64) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let artifact = self.refresh_artifact(generation);
            let status = self.check_status(generation);
            tokio::pin!(artifact, status);

            let mut artifact_done = false;
            let finished = loop {
                tokio::select! {
                    biased;
                    () = &mut artifact, if !artifact_done => artifact_done = true,
                    finished = &mut status => break finished,
                }
            };
            if finished {
                debug!("Login polling stopped");
                return;
            }
            if !artifact_done {
                artifact.await;
            }
        }
    }

    async fn refresh_artifact(&self, generation: u64) {
        let result = retry_with_backoff(&self.config.backoff, || self.api.fetch_qrcode()).await;
        match result {
            Ok(Some(artifact)) => {
                let tasks = self.lock_tasks();
                if tasks.generation != generation {
                    return;
                }
                let changed = self.snapshot.send_if_modified(|s| {
                    if s.status.is_terminal() || s.artifact.as_ref() == Some(&artifact) {
                        return false;
                    }
                    s.artifact = Some(artifact);
                    true
                });
                if changed {
                    info!("Login code loaded");
                }
            }
            Ok(None) => debug!("Login code not ready; waiting for the next tick"),
            Err(e) if e.is_not_ready() => {
                debug!("Login code not generated yet; waiting for the next tick")
            }
            Err(e) => warn!("Failed to load login code: {e}"),
        }
    }

    /// Returns true once the flow is over (or no longer ours) and polling should stop.
    async fn check_status(self: &Arc<Self>, generation: u64) -> bool {
        let resp = match self.api.fetch_status().await {
            Ok(resp) => resp,
            Err(e) => {
                // Connectivity hiccups never fail the flow; only the server can.
                warn!("Login status check failed: {e}");
                return false;
            }
        };

        if resp.is_in_progress == Some(true) {
            if let Some(secs) = resp.elapsed_seconds {
                debug!("Login flow in progress: {secs}s");
            }
        }

        let mut tasks = self.lock_tasks();
        if tasks.generation != generation {
            return true;
        }

        match resp.status {
            RemoteLoginStatus::Success => {
                self.snapshot.send_modify(|s| {
                    s.status = LoginFlowState::Success;
                    s.elapsed_seconds = resp.elapsed_seconds.or(s.elapsed_seconds);
                });
                info!("Login succeeded");
                tasks.poll = None;
                let settle_delay = self.config.settle_delay;
                tasks.settle = Some(tokio::spawn(
                    Arc::clone(self).dismiss_after(settle_delay, generation),
                ));
                true
            }
            RemoteLoginStatus::Failed => {
                self.snapshot.send_modify(|s| {
                    s.status = LoginFlowState::Failed;
                    s.elapsed_seconds = resp.elapsed_seconds.or(s.elapsed_seconds);
                });
                warn!("Login failed; waiting for the user to retry");
                tasks.poll = None;
                true
            }
            RemoteLoginStatus::Waiting | RemoteLoginStatus::Other(_) => {
                if resp.elapsed_seconds.is_some() {
                    self.snapshot.send_if_modified(|s| {
                        let changed = s.elapsed_seconds != resp.elapsed_seconds;
                        s.elapsed_seconds = resp.elapsed_seconds;
                        changed
                    });
                }
                false
            }
        }
    }

    async fn dismiss_after(self: Arc<Self>, delay: Duration, generation: u64) {
        tokio::time::sleep(delay).await;
        let mut tasks = self.lock_tasks();
        if tasks.generation != generation {
            return;
        }
        tasks.settle = None;
        self.snapshot.send_modify(|s| s.visible = false);
        debug!("Login code display dismissed after success");
    }
}
