//! Post-deployment program.

use std::path::Path;
use std::process::ExitStatus;

use tokio::process::Command;
use tracing::{info, warn};

use vmfleet_deploy::DeploymentReport;

pub const ENV_OUTDIR: &str = "VMFLEET_OUTDIR";
pub const ENV_HOSTS: &str = "VMFLEET_HOSTS";
pub const ENV_VMS: &str = "VMFLEET_VMS";

/// Run `program` with the deployment outputs in its environment.
///
/// A failing program is logged, never fatal. Returns `None` when there
/// is nothing to run or it could not be started.
pub async fn run_program(
    program: &[String],
    outdir: &Path,
    report: &DeploymentReport,
) -> Option<ExitStatus> {
    let (command, args) = program.split_first()?;
    info!(program = %command, "running post-deployment program");

    let status = Command::new(command)
        .args(args)
        .env(ENV_OUTDIR, outdir)
        .env(ENV_HOSTS, &report.hosts_file)
        .env(ENV_VMS, &report.vms_file)
        .status()
        .await;

    match status {
        Ok(status) if status.success() => {
            info!(program = %command, "post-deployment program finished");
            Some(status)
        }
        Ok(status) => {
            warn!(program = %command, code = ?status.code(), "post-deployment program failed");
            Some(status)
        }
        Err(e) => {
            warn!(program = %command, error = %e, "cannot start post-deployment program");
            None
        }
    }
}
