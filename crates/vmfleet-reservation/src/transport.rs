//! Reservation transport contract.

use async_trait::async_trait;

use vmfleet_core::JobHandle;

use crate::command::{oargridsub_command, oarsub_command};
use crate::error::TransportError;
use crate::job_spec::JobSpec;

#[async_trait]
pub trait ReservationTransport: Send + Sync {
    /// Submit a single-site job.
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, TransportError>;

    /// Submit a multi-site job as one batch.
    async fn submit_batch(&self, specs: &[JobSpec]) -> Result<JobHandle, TransportError>;

    async fn cancel(&self, handle: &JobHandle) -> Result<(), TransportError>;

    /// Command an operator can run to submit `spec` by hand.
    fn manual_command(&self, spec: &JobSpec) -> String {
        oarsub_command(spec)
    }

    fn manual_batch_command(&self, specs: &[JobSpec]) -> String {
        oargridsub_command(specs)
    }
}
