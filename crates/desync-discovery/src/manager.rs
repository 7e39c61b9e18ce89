//! Run registry
//!
//! Every run gets an opaque id. Runs share one actuator, so they execute
//! one after another behind an async lock; a run waiting for the lock shows
//! as queued and can be canceled before it starts.

use crate::actuator::Actuator;
use crate::controller::Controller;
use crate::error::{validate_host, DiscoveryError, Result};
use crate::model::Progress;
use crate::network::Network;
use crate::report::DiscoveryReport;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for the actuator
    Queued,
    /// Probing
    Running,
    /// Finished with a report
    Completed,
    /// Canceled; a report exists if the run had started
    Canceled,
    /// The run could not start
    Failed,
}

impl RunStatus {
    /// Short name
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Canceled => "canceled",
            RunStatus::Failed => "failed",
        }
    }

    /// Whether the run has not finished yet
    pub fn is_running(&self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

/// Summary of one registered run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    /// Run id
    pub id: Uuid,
    /// Target hostname
    pub host: String,
    /// Lifecycle state
    pub status: RunStatus,
    /// Latest progress
    pub progress: Progress,
    /// Why the run failed, if it did
    pub error: Option<String>,
}

struct RunHandle {
    host: String,
    cancel: CancellationToken,
    status: watch::Sender<RunStatus>,
    progress: watch::Receiver<Progress>,
    report: Mutex<Option<DiscoveryReport>>,
    error: Mutex<Option<String>>,
}

impl RunHandle {
    fn info(&self, id: Uuid) -> RunInfo {
        RunInfo {
            id,
            host: self.host.clone(),
            status: *self.status.borrow(),
            progress: self.progress.borrow().clone(),
            error: self.error.lock().clone(),
        }
    }
}

/// Starts, tracks and cancels discovery runs
pub struct DiscoveryManager {
    network: Arc<dyn Network>,
    actuator: Arc<dyn Actuator>,
    runtime: Handle,
    runs: RwLock<HashMap<Uuid, Arc<RunHandle>>>,
    serial: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for DiscoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("runs", &self.runs.read().len())
            .finish_non_exhaustive()
    }
}

impl DiscoveryManager {
    /// Manager spawning runs on `runtime`
    pub fn new(network: Arc<dyn Network>, actuator: Arc<dyn Actuator>, runtime: Handle) -> Self {
        Self {
            network,
            actuator,
            runtime,
            runs: RwLock::new(HashMap::new()),
            serial: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Queue a run for `host` and return its id
    ///
    /// # Errors
    /// Returns [`DiscoveryError::InvalidHost`] for a malformed hostname.
    pub fn start(&self, host: &str) -> Result<Uuid> {
        let host = validate_host(host)?;
        let id = Uuid::new_v4();
        let (status, _) = watch::channel(RunStatus::Queued);
        let (progress_tx, progress_rx) = watch::channel(Progress::default());
        let run = Arc::new(RunHandle {
            host: host.clone(),
            cancel: CancellationToken::new(),
            status,
            progress: progress_rx,
            report: Mutex::new(None),
            error: Mutex::new(None),
        });
        self.runs.write().insert(id, Arc::clone(&run));

        let controller = Controller::new(Arc::clone(&self.network), Arc::clone(&self.actuator))
            .with_cancel(run.cancel.clone())
            .with_progress(progress_tx);
        let serial = Arc::clone(&self.serial);
        self.runtime.spawn(async move {
            let _turn = serial.lock().await;
            if run.cancel.is_cancelled() {
                run.status.send_replace(RunStatus::Canceled);
                return;
            }
            run.status.send_replace(RunStatus::Running);
            info!(%id, host = %run.host, "discovery run started");

            match controller.run(&run.host).await {
                Ok(report) => {
                    let status = if report.canceled {
                        RunStatus::Canceled
                    } else {
                        RunStatus::Completed
                    };
                    *run.report.lock() = Some(report);
                    run.status.send_replace(status);
                }
                Err(e) => {
                    warn!(%id, error = %e, "discovery run failed");
                    *run.error.lock() = Some(e.to_string());
                    run.status.send_replace(RunStatus::Failed);
                }
            }
        });
        Ok(id)
    }

    fn get(&self, id: Uuid) -> Result<Arc<RunHandle>> {
        self.runs
            .read()
            .get(&id)
            .cloned()
            .ok_or(DiscoveryError::UnknownRun(id))
    }

    /// Lifecycle state of a run
    pub fn status(&self, id: Uuid) -> Result<RunStatus> {
        Ok(*self.get(id)?.status.borrow())
    }

    /// Latest progress of a run
    pub fn progress(&self, id: Uuid) -> Result<Progress> {
        Ok(self.get(id)?.progress.borrow().clone())
    }

    /// Ask a run to stop at its next safe point
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let run = self.get(id)?;
        run.cancel.cancel();
        info!(%id, host = %run.host, "discovery run cancel requested");
        Ok(())
    }

    /// Final report, once the run has one
    pub fn results(&self, id: Uuid) -> Result<Option<DiscoveryReport>> {
        Ok(self.get(id)?.report.lock().clone())
    }

    /// Summary of one run
    pub fn info(&self, id: Uuid) -> Result<RunInfo> {
        Ok(self.get(id)?.info(id))
    }

    /// Summaries of every registered run
    pub fn list(&self) -> Vec<RunInfo> {
        let mut runs: Vec<RunInfo> = self
            .runs
            .read()
            .iter()
            .map(|(id, run)| run.info(*id))
            .collect();
        runs.sort_by(|a, b| a.host.cmp(&b.host).then(a.id.cmp(&b.id)));
        runs
    }

    /// Wait until a run has finished and return its final state
    pub async fn wait(&self, id: Uuid) -> Result<RunStatus> {
        let run = self.get(id)?;
        let mut status = run.status.subscribe();
        let finished = match status.wait_for(|s| !s.is_running()).await {
            Ok(state) => *state,
            Err(_) => *run.status.borrow(),
        };
        Ok(finished)
    }

    /// Drop a finished run from the registry
    pub fn forget(&self, id: Uuid) -> Result<()> {
        let run = self.get(id)?;
        if run.status.borrow().is_running() {
            run.cancel.cancel();
        }
        self.runs.write().remove(&id);
        Ok(())
    }
}
