//! Manual submission commands.
//!
//! When the transport fails, the operator gets the equivalent command
//! line to run on the frontend. Dates are rendered in UTC.

use chrono::{DateTime, Utc};

use crate::job_spec::JobSpec;

fn oar_date(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// `oarsub` command for a single-site job, run through the site frontend.
pub fn oarsub_command(spec: &JobSpec) -> String {
    format!(
        "ssh {site} oarsub -t {job_type} -r '{start}' -l \"{selector},walltime={walltime}\"",
        site = spec.site,
        job_type = spec.job_type,
        start = oar_date(spec.start),
        selector = spec.selector(),
        walltime = spec.walltime,
    )
}

/// `oargridsub` command for a multi-site job.
///
/// Start and walltime are taken from the first spec; all specs of a
/// batch share them.
pub fn oargridsub_command(specs: &[JobSpec]) -> String {
    let Some(first) = specs.first() else {
        return String::new();
    };
    let rdefs: Vec<String> = specs
        .iter()
        .map(|spec| format!("{}:rdef=\"{}\"", spec.site, spec.selector()))
        .collect();
    format!(
        "oargridsub -t {job_type} -w {walltime} -s '{start}' {rdefs}",
        job_type = first.job_type,
        walltime = first.walltime,
        start = oar_date(first.start),
        rdefs = rdefs.join(","),
    )
}
