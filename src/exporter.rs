//! ONNX export of the image and text encoders.
//!
//! Each encoder is exported on its own: a failure while exporting one is
//! reported and recorded, and the other export still runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, anyhow};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::config::{ExportConfig, prepare_train_config};
use crate::harness::{HarnessContext, build_export_harness};
use crate::utils::{DataType, EncoderKind, SummaryRow};

/// CLIP BPE vocabulary size.
pub const VOCAB_SIZE: i64 = 49408;
/// Tokens per caption.
pub const TEXT_LENGTH: i64 = 77;
/// Input resolution (H, W) the model was trained at.
pub const IMAGE_SIZE: (i64, i64) = (384, 128);

/// One encoder method wrapped as a standalone exportable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportJob {
    pub kind: EncoderKind,
    pub model_name: String,
    /// Python wrapper module name.
    pub wrapper: &'static str,
    /// Parent model method the wrapper forwards to.
    pub method: &'static str,
    pub input_name: &'static str,
    pub output_name: &'static str,
    pub dummy_shape: Vec<i64>,
    pub dummy_dtype: DataType,
    /// Exclusive upper bound for integer token dummies.
    pub token_range: Option<i64>,
    pub onnx_path: PathBuf,
}

impl ExportJob {
    pub fn for_kind(kind: EncoderKind, cfg: &ExportConfig) -> Self {
        let model_name = kind.model_name(&cfg.prefix);
        let onnx_path = cfg.output_dir.join(format!("{model_name}.onnx"));
        match kind {
            EncoderKind::ImageEncoder => Self {
                kind,
                model_name,
                wrapper: "ImageEncoderWrapper",
                method: "encode_image",
                input_name: "image",
                output_name: "image_features",
                dummy_shape: vec![cfg.batch_size, 3, IMAGE_SIZE.0, IMAGE_SIZE.1],
                // declared fp32 while the model runs fp16; unresolved
                dummy_dtype: DataType::Fp32,
                token_range: None,
                onnx_path,
            },
            EncoderKind::TextEncoder => Self {
                kind,
                model_name,
                wrapper: "TextEncoderWrapper",
                method: "encode_text",
                input_name: "text",
                output_name: "text_features",
                dummy_shape: vec![cfg.batch_size, TEXT_LENGTH],
                dummy_dtype: DataType::Int32,
                token_range: Some(VOCAB_SIZE),
                onnx_path,
            },
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self.kind {
            EncoderKind::ImageEncoder => "Image Encoder",
            EncoderKind::TextEncoder => "Text Encoder",
        }
    }

    /// Reject dummy inputs the wrapped method can never accept.
    pub fn validate(&self) -> Result<()> {
        let rank = match self.kind {
            EncoderKind::ImageEncoder => 4,
            EncoderKind::TextEncoder => 2,
        };
        if self.dummy_shape.len() != rank {
            return Err(anyhow!(
                "{} dummy input must have rank {rank}, got shape {:?}",
                self.input_name,
                self.dummy_shape
            ));
        }
        if let Some(d) = self.dummy_shape.iter().find(|d| **d <= 0) {
            return Err(anyhow!(
                "{} dummy input has non-positive dimension {d} in shape {:?}",
                self.input_name,
                self.dummy_shape
            ));
        }
        if self.token_range.is_some() == self.dummy_dtype.is_float() {
            return Err(anyhow!(
                "{} dummy dtype {:?} does not match its input kind",
                self.input_name,
                self.dummy_dtype
            ));
        }
        Ok(())
    }
}

/// Both jobs, image first.
pub fn export_jobs(cfg: &ExportConfig) -> Vec<ExportJob> {
    EncoderKind::ALL
        .iter()
        .map(|kind| ExportJob::for_kind(*kind, cfg))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportStatus {
    Exported,
    /// Dry run: harness written next to the target.
    Planned(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub job: ExportJob,
    pub status: ExportStatus,
}

impl ExportOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self.status, ExportStatus::Failed(_))
    }

    pub fn summary_row(&self) -> SummaryRow {
        let (status, detail) = match &self.status {
            ExportStatus::Exported => ("Exported", self.job.onnx_path.display().to_string()),
            ExportStatus::Planned(script) => ("Planned", script.display().to_string()),
            ExportStatus::Failed(err) => ("Failed", err.lines().next().unwrap_or("").to_string()),
        };
        SummaryRow {
            model: self.job.model_name.clone(),
            status,
            detail,
        }
    }
}

/// Run `export` for each job in order, isolating failures per job.
///
/// Jobs failing [`ExportJob::validate`] are not handed to `export`.
pub fn run_exports<F>(jobs: &[ExportJob], mut export: F) -> Vec<ExportOutcome>
where
    F: FnMut(&ExportJob) -> Result<()>,
{
    let mut outcomes = Vec::with_capacity(jobs.len());
    for job in jobs {
        println!("\nAttempting to export {}...", job.display_name());
        let result = job.validate().and_then(|()| export(job));
        let status = match result {
            Ok(()) => {
                println!(
                    "Success: {} exported to {}",
                    job.display_name(),
                    job.onnx_path.display()
                );
                info!(model = %job.model_name, path = %job.onnx_path.display(), "export succeeded");
                ExportStatus::Exported
            }
            Err(e) => {
                println!("Failed to export {}: {e:#}", job.display_name());
                warn!(model = %job.model_name, err = %format!("{e:#}"), "export failed");
                ExportStatus::Failed(format!("{e:#}"))
            }
        };
        outcomes.push(ExportOutcome {
            job: job.clone(),
            status,
        });
    }
    outcomes
}

/// Detect the Python executable name available on this system.
/// Tries `python3` first, then `python`.
pub fn detect_python() -> Result<String> {
    for candidate in &["python3", "python"] {
        if let Ok(output) = Command::new(candidate).arg("--version").output()
            && output.status.success()
        {
            return Ok(candidate.to_string());
        }
    }
    Err(anyhow!(
        "Python not found on PATH. Install Python with torch and pass --python if it is not python3/python."
    ))
}

/// Runs generated harnesses with a Python interpreter.
#[derive(Debug, Clone)]
pub struct PythonExporter<'a> {
    pub python: String,
    pub ctx: HarnessContext<'a>,
}

impl PythonExporter<'_> {
    pub fn export(&self, job: &ExportJob) -> Result<()> {
        let script = build_export_harness(&self.ctx, job);
        info!(
            python = %self.python,
            model = %job.model_name,
            method = job.method,
            "running export harness"
        );

        // progress lines go straight to our stdout; stderr is kept for the error
        let output = Command::new(&self.python)
            .args(["-c", &script])
            .current_dir(self.ctx.project_root)
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("failed to run {} for export", self.python))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "export harness exited with {}: {}",
                output.status,
                last_line(stderr.trim())
            ));
        }
        if !job.onnx_path.exists() {
            return Err(anyhow!(
                "export harness finished but {} was not written",
                job.onnx_path.display()
            ));
        }
        Ok(())
    }
}

/// Python tracebacks end with the exception line.
fn last_line(text: &str) -> &str {
    text.lines().last().unwrap_or(text)
}

/// Export both encoders as configured.
///
/// Training-config and filesystem problems abort; per-encoder export
/// failures are returned in the outcomes.
pub fn export_encoders(cfg: &ExportConfig, dry_run: bool) -> Result<Vec<ExportOutcome>> {
    info!(
        train_config = %cfg.train_config.display(),
        checkpoint = %cfg.checkpoint.display(),
        output_dir = %cfg.output_dir.display(),
        dry_run,
        "starting export"
    );
    // keep alive until every harness has run
    let patched = prepare_train_config(&cfg.train_config)?;
    fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("failed to create output dir {}", cfg.output_dir.display()))?;
    let jobs = export_jobs(cfg);

    if dry_run {
        return write_harnesses(cfg, &patched, &jobs);
    }

    let python = match &cfg.python {
        Some(python) => python.clone(),
        None => detect_python()?,
    };
    let exporter = PythonExporter {
        python,
        ctx: HarnessContext {
            project_root: &cfg.project_root,
            train_config: patched.path(),
            checkpoint: &cfg.checkpoint,
            device: &cfg.device,
            opset: cfg.opset,
        },
    };
    Ok(run_exports(&jobs, |job| exporter.export(job)))
}

/// Dry run: persist the patched config and one harness per job.
fn write_harnesses(
    cfg: &ExportConfig,
    patched: &NamedTempFile,
    jobs: &[ExportJob],
) -> Result<Vec<ExportOutcome>> {
    let config_path = cfg.output_dir.join(format!("{}_export_config.yaml", cfg.prefix));
    fs::copy(patched.path(), &config_path)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    let ctx = HarnessContext {
        project_root: &cfg.project_root,
        train_config: &config_path,
        checkpoint: &cfg.checkpoint,
        device: &cfg.device,
        opset: cfg.opset,
    };

    let mut outcomes = Vec::with_capacity(jobs.len());
    for job in jobs {
        let script_path = harness_path(&cfg.output_dir, job);
        fs::write(&script_path, build_export_harness(&ctx, job))
            .with_context(|| format!("failed to write {}", script_path.display()))?;
        info!(path = %script_path.display(), "dry-run: wrote export harness");
        outcomes.push(ExportOutcome {
            job: job.clone(),
            status: ExportStatus::Planned(script_path),
        });
    }
    Ok(outcomes)
}

pub fn harness_path(output_dir: &Path, job: &ExportJob) -> PathBuf {
    output_dir.join(format!("{}.export.py", job.model_name))
}
