//! Triton model repository packaging for compiled TensorRT plans.
//!
//! For every `(prefix, type)` pair the packager looks for
//! `<artifacts_root>/<prefix>/<prefix>_<type>.plan` and, when present, replaces
//! `<base_repo>/<prefix>_<type>/` with a fresh entry:
//!
//! ```text
//! <base_repo>/<model_name>/
//!     config.pbtxt
//!     1/<model_name>.plan
//! ```
//!
//! Absent plans are skipped. Any other filesystem error aborts the run.

use std::fs::{self, FileTimes};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::PackagerConfig;
use crate::render::render_config_pbtxt;
use crate::utils::{EncoderKind, SummaryRow};

/// Only one model version is ever deployed.
pub const VERSION_DIR: &str = "1";
pub const CONFIG_FILE_NAME: &str = "config.pbtxt";
pub const PLAN_EXTENSION: &str = "plan";

/// Paths derived for one `(prefix, type)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentUnit {
    pub prefix: String,
    pub kind: EncoderKind,
    pub model_name: String,
    pub source: PathBuf,
    pub model_dir: PathBuf,
    pub version_dir: PathBuf,
    pub plan_path: PathBuf,
    pub config_path: PathBuf,
}

impl DeploymentUnit {
    pub fn new(cfg: &PackagerConfig, prefix: &str, kind: EncoderKind) -> Self {
        let model_name = kind.model_name(prefix);
        let plan_file = plan_file_name(&model_name);
        let model_dir = cfg.base_repo.join(&model_name);
        let version_dir = model_dir.join(VERSION_DIR);
        Self {
            prefix: prefix.to_string(),
            kind,
            source: cfg.artifacts_root.join(prefix).join(&plan_file),
            plan_path: version_dir.join(&plan_file),
            config_path: model_dir.join(CONFIG_FILE_NAME),
            model_name,
            model_dir,
            version_dir,
        }
    }

    pub fn plan_file_name(&self) -> String {
        plan_file_name(&self.model_name)
    }
}

fn plan_file_name(model_name: &str) -> String {
    format!("{model_name}.{PLAN_EXTENSION}")
}

/// Cross product of prefixes and types, prefixes outermost.
pub fn plan_units(cfg: &PackagerConfig) -> Vec<DeploymentUnit> {
    cfg.model_prefixes
        .iter()
        .flat_map(|prefix| {
            cfg.types
                .iter()
                .map(move |kind| DeploymentUnit::new(cfg, prefix, *kind))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Deployed,
    /// Dry run: the plan exists and would be deployed.
    Planned,
    /// Source plan not found.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct PackageReport {
    pub base_repo: PathBuf,
    pub units: Vec<(DeploymentUnit, UnitStatus)>,
}

impl PackageReport {
    pub fn deployed(&self) -> impl Iterator<Item = &DeploymentUnit> {
        self.with_status(UnitStatus::Deployed)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &DeploymentUnit> {
        self.with_status(UnitStatus::Skipped)
    }

    pub fn planned(&self) -> impl Iterator<Item = &DeploymentUnit> {
        self.with_status(UnitStatus::Planned)
    }

    fn with_status(&self, status: UnitStatus) -> impl Iterator<Item = &DeploymentUnit> {
        self.units
            .iter()
            .filter(move |(_, s)| *s == status)
            .map(|(u, _)| u)
    }

    pub fn summary_rows(&self) -> Vec<SummaryRow> {
        self.units
            .iter()
            .map(|(unit, status)| match status {
                UnitStatus::Deployed => SummaryRow {
                    model: unit.model_name.clone(),
                    status: "Deployed",
                    detail: format!("{VERSION_DIR}/{}", unit.plan_file_name()),
                },
                UnitStatus::Planned => SummaryRow {
                    model: unit.model_name.clone(),
                    status: "Planned",
                    detail: format!("from {}", unit.source.display()),
                },
                UnitStatus::Skipped => SummaryRow {
                    model: unit.model_name.clone(),
                    status: "Skipped",
                    detail: format!("not found: {}", unit.source.display()),
                },
            })
            .collect()
    }
}

/// Package every configured pair into `cfg.base_repo`.
pub fn package_models(cfg: &PackagerConfig, dry_run: bool) -> Result<PackageReport> {
    info!(
        base_repo = %cfg.base_repo.display(),
        artifacts_root = %cfg.artifacts_root.display(),
        prefixes = cfg.model_prefixes.len(),
        types = cfg.types.len(),
        dry_run,
        "setting up models"
    );

    if !dry_run {
        fs::create_dir_all(&cfg.base_repo).with_context(|| {
            format!("failed to create model repository {}", cfg.base_repo.display())
        })?;
    }

    let mut units = Vec::new();
    for unit in plan_units(cfg) {
        let status = setup_model(&unit, dry_run)?;
        units.push((unit, status));
    }

    let report = PackageReport {
        base_repo: cfg.base_repo.clone(),
        units,
    };
    info!(
        deployed = report.deployed().count(),
        planned = report.planned().count(),
        skipped = report.skipped().count(),
        "packaging done"
    );
    Ok(report)
}

/// Deploy a single unit, replacing whatever was at its model directory.
pub fn setup_model(unit: &DeploymentUnit, dry_run: bool) -> Result<UnitStatus> {
    let exists = unit
        .source
        .try_exists()
        .with_context(|| format!("failed to stat {}", unit.source.display()))?;
    if !exists {
        warn!(
            model = %unit.model_name,
            source = %unit.source.display(),
            "skipping: source plan not found"
        );
        return Ok(UnitStatus::Skipped);
    }

    if dry_run {
        info!(
            model = %unit.model_name,
            source = %unit.source.display(),
            dest = %unit.plan_path.display(),
            "dry-run: would deploy"
        );
        return Ok(UnitStatus::Planned);
    }

    if unit.model_dir.exists() {
        info!(path = %unit.model_dir.display(), "removing previous deployment");
        fs::remove_dir_all(&unit.model_dir)
            .with_context(|| format!("failed to remove {}", unit.model_dir.display()))?;
    }
    fs::create_dir_all(&unit.version_dir)
        .with_context(|| format!("failed to create {}", unit.version_dir.display()))?;

    info!(
        source = %unit.source.display(),
        dest = %unit.plan_path.display(),
        "copying plan"
    );
    let bytes = copy_preserving_metadata(&unit.source, &unit.plan_path)?;

    let config = render_config_pbtxt(unit.kind, &unit.model_name, &unit.plan_file_name());
    fs::write(&unit.config_path, config)
        .with_context(|| format!("failed to write {}", unit.config_path.display()))?;

    info!(
        model = %unit.model_name,
        bytes,
        config = %unit.config_path.display(),
        "created config with default_model_filename"
    );
    Ok(UnitStatus::Deployed)
}

/// Copy `src` to `dst`, carrying over permissions and access/modification times.
pub fn copy_preserving_metadata(src: &Path, dst: &Path) -> Result<u64> {
    let bytes = fs::copy(src, dst)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;

    let meta =
        fs::metadata(src).with_context(|| format!("failed to read metadata of {}", src.display()))?;
    let mut times = FileTimes::new();
    if let Ok(modified) = meta.modified() {
        times = times.set_modified(modified);
    }
    if let Ok(accessed) = meta.accessed() {
        times = times.set_accessed(accessed);
    }
    // read-only handle: the copy may already carry the source's 0444 mode
    fs::File::open(dst)
        .and_then(|f| f.set_times(times))
        .with_context(|| format!("failed to set file times on {}", dst.display()))?;

    Ok(bytes)
}
