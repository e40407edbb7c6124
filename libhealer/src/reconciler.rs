use std::path::PathBuf;

use log::{error, info};

use crate::coordination::{CoordinationError, Coordinator};
use crate::launcher::WorkerLauncher;

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// At least the desired number of workers is registered.
    Satisfied { live: usize },
    /// One worker was started.
    Launched { live: usize, pid: u32 },
    /// A worker was needed but could not be started.
    LaunchFailed { live: usize },
}

impl ReconcileOutcome {
    pub fn live(&self) -> usize {
        match *self {
            ReconcileOutcome::Satisfied { live }
            | ReconcileOutcome::Launched { live, .. }
            | ReconcileOutcome::LaunchFailed { live } => live,
        }
    }
}

/// Compares registered workers against the desired count.
pub struct Reconciler {
    namespace: String,
    desired: u32,
    program: PathBuf,
    launcher: WorkerLauncher,
}

impl Reconciler {
    pub fn new(
        namespace: impl Into<String>,
        desired: u32,
        program: impl Into<PathBuf>,
        launcher: WorkerLauncher,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            desired,
            program: program.into(),
            launcher,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn desired(&self) -> u32 {
        self.desired
    }

    /// Runs one pass.
    ///
    /// Reading the children re-arms the children watch, so every pass leaves
    /// exactly one fresh watch behind. At most one worker is started per pass
    /// however large the deficit is; the new worker's registration triggers
    /// the next pass. Workers above the desired count are left alone.
    ///
    /// Read errors abort the pass and are returned. Launch errors are logged
    /// and reported through the outcome.
    pub async fn reconcile(
        &self,
        client: &dyn Coordinator,
    ) -> Result<ReconcileOutcome, CoordinationError> {
        let children = client.get_children_with_watch(&self.namespace).await?;
        let live = children.len();
        info!(
            "Currently there are {live} workers under {} (desired {})",
            self.namespace, self.desired
        );

        if live >= self.desired as usize {
            return Ok(ReconcileOutcome::Satisfied { live });
        }

        match self.launcher.launch(&self.program) {
            Ok(pid) => {
                info!("Started worker pid {pid}");
                Ok(ReconcileOutcome::Launched { live, pid })
            }
            Err(e) => {
                error!("Failed to launch worker: {e}");
                Ok(ReconcileOutcome::LaunchFailed { live })
            }
        }
    }
}
