//! vmfleet — reserve physical hosts and deploy a fleet of virtual machines.
//!
//! # Usage
//!
//! ```text
//! vmfleet --catalog testbed.toml -n 100 -w 2:00:00 -- ./benchmark.sh
//! vmfleet --catalog testbed.toml -j lyon:4242 -i placement.toml
//! ```

use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use vmfleet_cli::{Args, Driver, log_summary, run_program};
use vmfleet_core::{FleetConfig, RunContext, RunStatus};
use vmfleet_testbed::{Testbed, TestbedCatalog};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("warn,vmfleet={}", args.log_level())))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &args.config {
        Some(path) => FleetConfig::from_file(path)?,
        None => FleetConfig::default(),
    };
    config.validate()?;
    let request = args.request(&config)?;

    let testbed = Arc::new(Testbed::new(TestbedCatalog::from_file(&args.catalog)?));
    let driver = Driver::new(testbed.clone(), testbed.collaborators());

    let mut ctx = RunContext::new();
    let outcome = driver.execute(&request, &mut ctx).await;
    let status = match &outcome {
        Ok(report) => report.status.clone(),
        Err(e) => RunStatus::Aborted {
            reason: e.to_string(),
        },
    };
    log_summary(&ctx, &status);

    let report = outcome.inspect_err(|e| error!("{e}"))?;
    run_program(&args.program, &request.deploy.outdir, &report).await;
    Ok(())
}
