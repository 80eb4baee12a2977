//! Execution driver — sequences topology, reservation and deployment.
//!
//! ```text
//! TOPOLOGY ─► RESERVATION ─► HOSTS ─► VIRTUAL MACHINES
//!               (skipped when job handles are supplied)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use vmfleet_core::{
    CoreError, ExclusionSet, JobHandle, PlacementDocument, PoolRequirement, RunContext, RunStatus,
    Topology, TopologyBuilder, VmTemplate, Walltime,
};
use vmfleet_deploy::{Collaborators, DeployError, DeployOptions, DeploymentReport, Orchestrator};
use vmfleet_planner::{CapacityService, Plan, PlanError, PlanRequest, ResourcePlanner};
use vmfleet_reservation::{ReservationError, ReservationSubmitter};

/// Width of the timing bars printed at the end of a run.
const TIMING_BAR_WIDTH: usize = 60;

/// Any failure that aborts a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Input(#[from] CoreError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Deploy(#[from] DeployError),
}

pub type RunResult<T> = Result<T, RunError>;

/// Everything one run asks for, CLI and config merged.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub n_vm: Option<u32>,
    pub placement: Option<PathBuf>,
    /// Existing jobs; planning and submission are skipped when non-empty.
    pub jobs: Vec<JobHandle>,
    pub resources: String,
    pub walltime: Walltime,
    pub blacklist: ExclusionSet,
    pub template: VmTemplate,
    pub max_vms: u32,
    pub horizon_days: u32,
    pub cpu_overcommit: u32,
    pub deploy: DeployOptions,
}

pub struct Driver {
    capacity: Arc<dyn CapacityService>,
    collaborators: Collaborators,
}

impl Driver {
    pub fn new(capacity: Arc<dyn CapacityService>, collaborators: Collaborators) -> Self {
        Self {
            capacity,
            collaborators,
        }
    }

    pub fn build_topology(&self, request: &RunRequest) -> RunResult<Topology> {
        let builder = TopologyBuilder::new(request.template.backing.clone().unwrap_or_default())
            .with_max_vms(request.max_vms);

        let topology = if let Some(path) = &request.placement {
            let document = PlacementDocument::from_file(path)?;
            builder.from_placement(&document, &request.template)?
        } else if let Some(n_vm) = request.n_vm {
            builder.from_count(n_vm, &request.template, &request.resources)?
        } else {
            info!("no VM requested, one VM per host will be defined");
            Topology {
                vms: Vec::new(),
                requirement: PoolRequirement::new(),
            }
        };
        Ok(topology)
    }

    pub async fn plan(&self, request: &RunRequest, topology: &Topology) -> RunResult<Plan> {
        let planner = ResourcePlanner::new(Arc::clone(&self.capacity))
            .with_horizon_days(request.horizon_days)
            .with_cpu_overcommit(request.cpu_overcommit);
        let plan = planner
            .plan(&PlanRequest {
                topology,
                walltime: request.walltime,
                blacklist: &request.blacklist,
                dedicated_vlan: request.deploy.dedicated_vlan,
                now: Utc::now(),
            })
            .await?;
        Ok(plan)
    }

    pub async fn reserve(&self, plan: &Plan) -> RunResult<Vec<JobHandle>> {
        let submitter = ReservationSubmitter::new(Arc::clone(&self.collaborators.reservations));
        let handles = submitter
            .reserve(&plan.allocation, plan.walltime, plan.network)
            .await?;
        Ok(handles)
    }

    /// Run the whole pipeline.
    pub async fn execute(
        &self,
        request: &RunRequest,
        ctx: &mut RunContext,
    ) -> RunResult<DeploymentReport> {
        info!("── TOPOLOGY ──");
        let started = Instant::now();
        let topology = self.build_topology(request)?;
        info!(
            vms = topology.vm_count(),
            memory_mb = topology.total_memory(),
            vcpus = topology.total_cpu(),
            requirement = %topology.requirement,
            "topology ready"
        );
        let elapsed = ctx.finish_stage("topology", started);
        info!("stage done in {:.1} s", elapsed.as_secs_f64());

        info!("── RESERVATION ──");
        let started = Instant::now();
        let handles = if request.jobs.is_empty() {
            let plan = self.plan(request, &topology).await?;
            self.reserve(&plan).await?
        } else {
            let jobs: Vec<String> = request.jobs.iter().map(ToString::to_string).collect();
            info!(jobs = %jobs.join(","), "reusing existing job(s), planning skipped");
            request.jobs.clone()
        };
        let elapsed = ctx.finish_stage("reservation", started);
        info!("stage done in {:.1} s", elapsed.as_secs_f64());

        let orchestrator = Orchestrator::new(self.collaborators.clone(), request.deploy.clone());
        let report = orchestrator.run(&handles, &topology, ctx).await?;
        Ok(report)
    }
}

/// Log excluded hosts, failed VMs, stage timings and the final status.
pub fn log_summary(ctx: &RunContext, status: &RunStatus) {
    for (host, reason) in ctx.excluded_hosts() {
        warn!(%host, %reason, "host excluded");
    }
    for (vm, reason) in ctx.failed_vms() {
        warn!(%vm, %reason, "VM not deployed");
    }
    for line in ctx.timing_bars(TIMING_BAR_WIDTH) {
        info!("{line}");
    }
    match status {
        RunStatus::Aborted { reason } => warn!(
            status = status.label(),
            %reason,
            elapsed = format!("{:.1}s", ctx.total_elapsed().as_secs_f64()),
            "run finished"
        ),
        _ => info!(
            status = status.label(),
            excluded_hosts = ctx.excluded_hosts().len(),
            failed_vms = ctx.failed_vms().len(),
            elapsed = format!("{:.1}s", ctx.total_elapsed().as_secs_f64()),
            "run finished"
        ),
    }
}
