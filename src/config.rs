use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::utils::EncoderKind;

/// Loss selection that instantiates both the SDM and MLM heads.
pub const EXPORT_LOSS_NAMES: &str = "sdm+mlm";

const DEFAULT_IRRA_ROOT: &str = "/home/jayn2u/IRRA";

/// Inputs of the deployment packager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackagerConfig {
    /// Root of the Triton model repository being written.
    pub base_repo: PathBuf,
    /// Directory holding `<prefix>/<prefix>_<type>.plan` engines.
    pub artifacts_root: PathBuf,
    pub model_prefixes: Vec<String>,
    pub types: Vec<EncoderKind>,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        Self {
            base_repo: Path::new(DEFAULT_IRRA_ROOT).join("model_repository"),
            artifacts_root: PathBuf::from(DEFAULT_IRRA_ROOT),
            model_prefixes: vec![
                "irra_cuhk".to_string(),
                "irra_icfg".to_string(),
                "irra_rstp".to_string(),
            ],
            types: EncoderKind::ALL.to_vec(),
        }
    }
}

/// Inputs of the ONNX export tool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    /// Training configuration YAML the model was built from.
    pub train_config: PathBuf,
    pub checkpoint: PathBuf,
    /// Checkout providing the `model` and `utils` Python packages.
    pub project_root: PathBuf,
    pub output_dir: PathBuf,
    /// Name prefix of the exported files, e.g. `irra_icfg`.
    pub prefix: String,
    /// Python interpreter; detected from PATH when unset.
    pub python: Option<String>,
    pub device: String,
    pub opset: u32,
    pub batch_size: i64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        let run_dir = Path::new(DEFAULT_IRRA_ROOT).join("irra_icfg");
        Self {
            train_config: run_dir.join("configs.yaml"),
            checkpoint: run_dir.join("best.pth"),
            project_root: PathBuf::from(DEFAULT_IRRA_ROOT),
            output_dir: run_dir,
            prefix: "irra_icfg".to_string(),
            python: None,
            device: "cuda".to_string(),
            opset: 17,
            batch_size: 1,
        }
    }
}

/// Optional settings file: one section per tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub package: PackagerConfig,
    pub export: ExportConfig,
}

impl Settings {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("failed to parse settings YAML")
    }

    /// Load settings from `path`, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings = Self::from_yaml(&text)
            .with_context(|| format!("invalid settings file {}", path.display()))?;
        info!(path = %path.display(), "loaded settings file");
        Ok(settings)
    }
}

/// Return the training config text with `loss_names` forced to [`EXPORT_LOSS_NAMES`].
pub fn override_loss_names(train_yaml: &str) -> Result<String> {
    let doc: Value =
        serde_yaml::from_str(train_yaml).context("failed to parse training config YAML")?;
    let mut map: Mapping = match doc {
        Value::Mapping(map) => map,
        Value::Null => Mapping::new(),
        other => {
            return Err(anyhow!(
                "training config must be a YAML mapping, found {}",
                yaml_kind(&other)
            ));
        }
    };

    let previous = map.insert(
        Value::String("loss_names".to_string()),
        Value::String(EXPORT_LOSS_NAMES.to_string()),
    );
    debug!(?previous, "overrode loss_names for export");

    serde_yaml::to_string(&Value::Mapping(map)).context("failed to serialize training config")
}

/// Write a patched copy of the training config to a temp file.
/// The file lives as long as the returned handle.
pub fn prepare_train_config(path: &Path) -> Result<NamedTempFile> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read training config {}", path.display()))?;
    let patched = override_loss_names(&text)
        .with_context(|| format!("invalid training config {}", path.display()))?;

    let mut file = tempfile::Builder::new()
        .prefix("export_config_")
        .suffix(".yaml")
        .tempfile()
        .context("failed to create temp file for patched training config")?;
    file.write_all(patched.as_bytes())
        .context("failed to write patched training config")?;
    file.flush().context("failed to flush patched training config")?;

    info!(
        source = %path.display(),
        patched = %file.path().display(),
        loss_names = EXPORT_LOSS_NAMES,
        "prepared training config"
    );
    Ok(file)
}

fn yaml_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
