use reid_deploy::config::{ExportConfig, PackagerConfig, Settings};
use reid_deploy::exporter;
use reid_deploy::packager;
use reid_deploy::utils::{self, EncoderKind};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "reid-deploy",
    about = "Export ReID encoders to ONNX and package TensorRT plans for Triton",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// YAML settings file with `package:` and `export:` sections
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy compiled .plan engines into a Triton model repository
    Package {
        /// Model repository root to write
        #[arg(long)]
        base_repo: Option<PathBuf>,
        /// Directory containing <prefix>/<prefix>_<type>.plan
        #[arg(long)]
        artifacts_root: Option<PathBuf>,
        /// Model prefix (repeatable); replaces the configured list
        #[arg(long = "prefix", value_name = "PREFIX")]
        prefixes: Vec<String>,
        /// Model type (repeatable); replaces the configured list
        #[arg(long = "type", value_enum, value_name = "TYPE")]
        types: Vec<EncoderKind>,
        /// Print planned actions without touching the filesystem
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Export the image and text encoders to ONNX
    Export {
        /// Training configuration YAML
        #[arg(long)]
        train_config: Option<PathBuf>,
        /// Trained weights checkpoint
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Checkout providing the `model` and `utils` Python packages
        #[arg(long)]
        project_root: Option<PathBuf>,
        /// Directory the .onnx files are written to
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Output file prefix, e.g. irra_icfg
        #[arg(long)]
        prefix: Option<String>,
        /// Python interpreter (defaults to python3/python on PATH)
        #[arg(long)]
        python: Option<String>,
        /// Torch device to export on
        #[arg(long)]
        device: Option<String>,
        /// ONNX opset version
        #[arg(long)]
        opset: Option<u32>,
        /// Write the export harnesses without running them
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let settings = Settings::load(args.config.as_deref())?;

    match args.command {
        Commands::Package {
            base_repo,
            artifacts_root,
            prefixes,
            types,
            dry_run,
        } => {
            let mut cfg: PackagerConfig = settings.package;
            if let Some(base_repo) = base_repo {
                cfg.base_repo = base_repo;
            }
            if let Some(artifacts_root) = artifacts_root {
                cfg.artifacts_root = artifacts_root;
            }
            if !prefixes.is_empty() {
                cfg.model_prefixes = prefixes;
            }
            if !types.is_empty() {
                cfg.types = types;
            }

            println!("Setting up models in {}...", cfg.base_repo.display());
            let report = packager::package_models(&cfg, dry_run)?;
            utils::print_summary("reid-deploy package", &report.summary_rows(), &report.base_repo);

            let skipped = report.skipped().count();
            if skipped > 0 {
                warn!(skipped, "some source plans were missing and skipped");
            }
            if dry_run {
                info!("dry-run completed; repository untouched");
            }
            println!("Done.");
        }
        Commands::Export {
            train_config,
            checkpoint,
            project_root,
            output_dir,
            prefix,
            python,
            device,
            opset,
            dry_run,
        } => {
            let mut cfg: ExportConfig = settings.export;
            if let Some(train_config) = train_config {
                cfg.train_config = train_config;
            }
            if let Some(checkpoint) = checkpoint {
                cfg.checkpoint = checkpoint;
            }
            if let Some(project_root) = project_root {
                cfg.project_root = project_root;
            }
            if let Some(output_dir) = output_dir {
                cfg.output_dir = output_dir;
            }
            if let Some(prefix) = prefix {
                cfg.prefix = prefix;
            }
            if python.is_some() {
                cfg.python = python;
            }
            if let Some(device) = device {
                cfg.device = device;
            }
            if let Some(opset) = opset {
                cfg.opset = opset;
            }

            println!("Loading configuration from {}", cfg.train_config.display());
            let outcomes = exporter::export_encoders(&cfg, dry_run)?;
            let rows: Vec<_> = outcomes.iter().map(|o| o.summary_row()).collect();
            utils::print_summary("reid-deploy export", &rows, &cfg.output_dir);

            let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
            if failed > 0 {
                warn!(failed, "some encoders failed to export; see messages above");
            }
            info!(
                exported = outcomes.len() - failed,
                failed, dry_run, "export flow completed"
            );
        }
    }

    Ok(())
}
