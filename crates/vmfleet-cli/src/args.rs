//! Command-line arguments and their merge with `fleet.toml`.

use std::path::PathBuf;

use chrono::Utc;
use clap::{ArgGroup, Parser};

use vmfleet_core::{ExclusionSet, FleetConfig, JobHandle, VmTemplate, Walltime};
use vmfleet_deploy::{DeployOptions, DiskLocation, DistributionPolicy, HostImage, PackageMode};

use crate::driver::{RunError, RunRequest};

#[derive(Parser, Debug)]
#[command(
    name = "vmfleet",
    about = "Reserve physical hosts and deploy a fleet of virtual machines on them",
    version
)]
#[command(group(
    ArgGroup::new("input")
        .required(true)
        .multiple(true)
        .args(["n_vm", "infile", "jobs"])
))]
pub struct Args {
    /// Number of virtual machines to deploy.
    #[arg(short = 'n', long = "n-vm", conflicts_with = "infile")]
    pub n_vm: Option<u32>,

    /// Placement document (TOML) listing pools, hosts and VMs.
    #[arg(short = 'i', long = "infile")]
    pub infile: Option<PathBuf>,

    /// Reuse an existing job: `ID` for a grid job, `SITE:ID` for a site job.
    #[arg(short = 'j', long = "job")]
    pub jobs: Vec<JobHandle>,

    /// Pools to draw hosts from, e.g. `all` or `lyon,taurus:4`.
    #[arg(short = 'r', long)]
    pub resources: Option<String>,

    /// Reservation length, `H:MM:SS`.
    #[arg(short = 'w', long)]
    pub walltime: Option<Walltime>,

    /// Put the VMs on a dedicated virtual network.
    #[arg(long)]
    pub vlan: bool,

    /// Comma-separated pools never to use.
    #[arg(short = 'b', long)]
    pub blacklist: Option<String>,

    /// Named image to deploy hosts with.
    #[arg(short = 'e', long = "env-name")]
    pub env_name: Option<String>,

    /// Image file to deploy hosts with.
    #[arg(short = 'a', long = "env-file")]
    pub env_file: Option<PathBuf>,

    /// Deploy hosts even when they already run the image.
    #[arg(long)]
    pub forcedeploy: bool,

    /// Use hosts as they are.
    #[arg(long, conflicts_with = "retries")]
    pub nodeploy: bool,

    /// Deployment rounds per host.
    #[arg(long)]
    pub retries: Option<u32>,

    /// Package management: full, minimal or skip.
    #[arg(long)]
    pub packages: Option<PackageMode>,

    /// Stage a package cache on the service node (full mode only).
    #[arg(long = "package-cache")]
    pub package_cache: bool,

    /// round-robin, per-host:K, random[:SEED] or concentrated.
    #[arg(short = 'd', long = "vm-distribution")]
    pub vm_distribution: Option<DistributionPolicy>,

    /// Backing disk image of the VMs.
    #[arg(short = 'f', long = "vm-backing-file")]
    pub vm_backing_file: Option<String>,

    /// VM template, e.g. `mem=2048,cpu=2`.
    #[arg(short = 't', long = "vm-template")]
    pub vm_template: Option<String>,

    /// Where backing images are prepared: one or all.
    #[arg(short = 'k', long = "vm-disk-location")]
    pub vm_disk_location: Option<DiskLocation>,

    /// Write VM topology snapshots before and after instantiation.
    #[arg(long)]
    pub snapshots: bool,

    /// Output directory (default `vmfleet_%Y%m%d_%H%M%S`).
    #[arg(short = 'o', long)]
    pub outdir: Option<PathBuf>,

    /// Path to fleet.toml.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Testbed catalog (TOML).
    #[arg(long)]
    pub catalog: PathBuf,

    #[arg(short = 'v', long, conflicts_with = "quiet")]
    pub verbose: bool,

    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Program run after a successful deployment.
    #[arg(last = true)]
    pub program: Vec<String>,
}

impl Args {
    /// Default log level of the `vmfleet` targets.
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    /// Merge the arguments over `config`.
    pub fn request(&self, config: &FleetConfig) -> Result<RunRequest, RunError> {
        let base = config.vm_template()?;
        let mut template = match &self.vm_template {
            Some(spec) => VmTemplate::parse_with(spec, &base)?,
            None => base,
        };
        if let Some(backing) = &self.vm_backing_file {
            template.backing = Some(backing.clone());
        }
        let walltime = match self.walltime {
            Some(walltime) => walltime,
            None => config.walltime()?,
        };

        let outdir = self
            .outdir
            .clone()
            .unwrap_or_else(|| PathBuf::from(Utc::now().format("vmfleet_%Y%m%d_%H%M%S").to_string()));
        let mut deploy = DeployOptions::from_config(config, outdir)?;
        deploy.host_image = HostImage::select(
            self.env_name.clone(),
            self.env_file.clone(),
            &config.defaults.host_image,
        )?;
        if self.nodeploy {
            deploy.max_retries = 0;
        } else if let Some(retries) = self.retries {
            deploy.max_retries = retries;
        }
        deploy.force_deploy |= self.forcedeploy;
        if let Some(packages) = self.packages {
            deploy.packages = packages;
        }
        if self.package_cache {
            if let PackageMode::Full { cache } = &mut deploy.packages {
                *cache = true;
            }
        }
        if let Some(policy) = self.vm_distribution {
            deploy.distribution = policy;
        }
        if let Some(location) = self.vm_disk_location {
            deploy.disk_location = location;
        }
        deploy.dedicated_vlan = self.vlan;
        deploy.snapshots = self.snapshots;
        deploy.vm_template = template.clone();

        Ok(RunRequest {
            n_vm: self.n_vm,
            placement: self.infile.clone(),
            jobs: self.jobs.clone(),
            resources: self
                .resources
                .clone()
                .unwrap_or_else(|| config.defaults.resources.clone()),
            walltime,
            blacklist: self
                .blacklist
                .as_deref()
                .map(ExclusionSet::parse_list)
                .unwrap_or_default(),
            template,
            max_vms: config.orchestrator.max_vms,
            horizon_days: config.orchestrator.planning_horizon_days,
            cpu_overcommit: config.orchestrator.cpu_overcommit,
            deploy,
        })
    }
}
