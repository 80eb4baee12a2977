//! Reservation submitter — single-site or grid submission.
//!
//! The strategy is decided once from the number of job specs. Either
//! way a failure aborts with the manual command the operator can retry.

use std::sync::Arc;

use tracing::{error, info, warn};

use vmfleet_core::{JobHandle, NetworkMode, Walltime};
use vmfleet_planner::Allocation;

use crate::error::{ReservationError, ReservationResult};
use crate::job_spec::{JobSpec, build_job_specs};
use crate::transport::ReservationTransport;

/// How the specs are sent to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionStrategy {
    Single(JobSpec),
    Grid(Vec<JobSpec>),
}

impl SubmissionStrategy {
    pub fn select(mut specs: Vec<JobSpec>) -> ReservationResult<Self> {
        match specs.len() {
            0 => Err(ReservationError::InvalidSpec("nothing to submit".into())),
            1 => Ok(SubmissionStrategy::Single(specs.remove(0))),
            _ => Ok(SubmissionStrategy::Grid(specs)),
        }
    }

    pub fn specs(&self) -> &[JobSpec] {
        match self {
            SubmissionStrategy::Single(spec) => std::slice::from_ref(spec),
            SubmissionStrategy::Grid(specs) => specs,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SubmissionStrategy::Single(_) => "single",
            SubmissionStrategy::Grid(_) => "grid",
        }
    }

    /// The manual command matching this strategy.
    pub fn fallback_command(&self, transport: &dyn ReservationTransport) -> String {
        match self {
            SubmissionStrategy::Single(spec) => transport.manual_command(spec),
            SubmissionStrategy::Grid(specs) => transport.manual_batch_command(specs),
        }
    }
}

pub struct ReservationSubmitter {
    transport: Arc<dyn ReservationTransport>,
}

impl ReservationSubmitter {
    pub fn new(transport: Arc<dyn ReservationTransport>) -> Self {
        Self { transport }
    }

    /// Build the job specs for `allocation` and submit them.
    pub async fn reserve(
        &self,
        allocation: &Allocation,
        walltime: Walltime,
        network: NetworkMode,
    ) -> ReservationResult<Vec<JobHandle>> {
        let specs = build_job_specs(allocation, walltime, network)?;
        let strategy = SubmissionStrategy::select(specs)?;
        self.submit(&strategy).await
    }

    pub async fn submit(&self, strategy: &SubmissionStrategy) -> ReservationResult<Vec<JobHandle>> {
        info!(
            strategy = strategy.name(),
            specs = strategy.specs().len(),
            "submitting reservation"
        );
        let outcome = match strategy {
            SubmissionStrategy::Single(spec) => self.transport.submit(spec).await,
            SubmissionStrategy::Grid(specs) => self.transport.submit_batch(specs).await,
        };

        match outcome {
            Ok(handle) => {
                info!(job = %handle, strategy = strategy.name(), "reservation granted");
                Ok(vec![handle])
            }
            Err(e) => {
                let command = strategy.fallback_command(self.transport.as_ref());
                error!(error = %e, "reservation failed");
                Err(ReservationError::ReservationFailed {
                    reason: e.to_string(),
                    command,
                })
            }
        }
    }

    /// Cancel every handle, reporting the first failure.
    pub async fn cancel(&self, handles: &[JobHandle]) -> ReservationResult<()> {
        let mut first_err = None;
        for handle in handles {
            match self.transport.cancel(handle).await {
                Ok(()) => info!(job = %handle, "reservation cancelled"),
                Err(e) => {
                    warn!(job = %handle, error = %e, "failed to cancel reservation");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
