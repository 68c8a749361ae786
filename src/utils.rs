use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Which half of the joint image/text model a unit refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum EncoderKind {
    ImageEncoder,
    TextEncoder,
}

impl EncoderKind {
    pub const ALL: [EncoderKind; 2] = [EncoderKind::ImageEncoder, EncoderKind::TextEncoder];

    pub fn as_str(self) -> &'static str {
        match self {
            EncoderKind::ImageEncoder => "image_encoder",
            EncoderKind::TextEncoder => "text_encoder",
        }
    }

    /// `{prefix}_{kind}`, shared by ONNX exports, plan files and repository entries.
    pub fn model_name(self, prefix: &str) -> String {
        format!("{prefix}_{}", self.as_str())
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncoderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image_encoder" => Ok(EncoderKind::ImageEncoder),
            "text_encoder" => Ok(EncoderKind::TextEncoder),
            other => Err(anyhow!(
                "unknown model type '{other}'; expected image_encoder or text_encoder"
            )),
        }
    }
}

/// Tensor element types used by the serving configs and export dummies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Fp16,
    Fp32,
    Int32,
    Int64,
}

impl DataType {
    /// Name as written in `config.pbtxt` (`TYPE_FP16`, ...).
    pub fn triton_name(self) -> &'static str {
        match self {
            DataType::Fp16 => "TYPE_FP16",
            DataType::Fp32 => "TYPE_FP32",
            DataType::Int32 => "TYPE_INT32",
            DataType::Int64 => "TYPE_INT64",
        }
    }

    /// Name as written in a torch dtype expression (`torch.float16`, ...).
    pub fn torch_name(self) -> &'static str {
        match self {
            DataType::Fp16 => "torch.float16",
            DataType::Fp32 => "torch.float32",
            DataType::Int32 => "torch.int32",
            DataType::Int64 => "torch.int64",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Fp16 | DataType::Fp32)
    }
}

/// One row of the summary table printed after a command finishes.
#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub model: String,
    pub status: &'static str,
    pub detail: String,
}

pub fn render_summary(title: &str, rows: &[SummaryRow], location: &Path) -> String {
    let width = rows
        .iter()
        .map(|r| r.model.len())
        .max()
        .unwrap_or(0)
        .max("Model".len());

    let mut out = String::new();
    out.push_str(&format!("{:-<72}\n", ""));
    out.push_str(&format!("  {title}  ({})\n", location.display()));
    out.push_str(&format!("{:-<72}\n", ""));
    out.push_str(&format!("  {:<width$} | {:<8} | Detail\n", "Model", "Status"));
    out.push_str(&format!("  {:-<width$}-+-{:-<8}-+-{:-<20}\n", "", "", ""));
    for row in rows {
        out.push_str(&format!(
            "  {:<width$} | {:<8} | {}\n",
            row.model, row.status, row.detail
        ));
    }
    out.push_str(&format!("{:-<72}\n", ""));
    out
}

pub fn print_summary(title: &str, rows: &[SummaryRow], location: &Path) {
    println!("\n{}", render_summary(title, rows, location));
}
