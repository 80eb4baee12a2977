//! vmfleet-reservation — turns an allocation into granted jobs.
//!
//! One job spec is built per site of the allocation. A single spec is
//! submitted directly, several are submitted as one grid job. On failure
//! the equivalent manual command is returned for the operator.
//!
//! ```text
//! Allocation ──► build_job_specs ──► SubmissionStrategy
//!                                      ├── Single ──► transport.submit
//!                                      └── Grid   ──► transport.submit_batch
//! ```

pub mod command;
pub mod error;
pub mod job_spec;
pub mod submitter;
pub mod transport;

pub use command::{oargridsub_command, oarsub_command};
pub use error::{ReservationError, ReservationResult, TransportError};
pub use job_spec::{DEPLOY_JOB_TYPE, JobSpec, build_job_specs};
pub use submitter::{ReservationSubmitter, SubmissionStrategy};
pub use transport::ReservationTransport;
