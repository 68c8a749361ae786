//! `config.pbtxt` rendering for Triton model repository entries.
//!
//! Each encoder kind carries a fixed serving contract (one input, one output,
//! TensorRT plan platform). Rendering substitutes the model name and prepends
//! the `default_model_filename` directive pointing at the copied plan.

use crate::utils::{DataType, EncoderKind};

pub const PLATFORM: &str = "tensorrt_plan";
pub const MAX_BATCH_SIZE: u32 = 32;
/// ViT-B/16 projection width.
pub const EMBEDDING_DIM: i64 = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: &'static str,
    pub data_type: DataType,
    pub dims: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub name: String,
    pub platform: &'static str,
    pub max_batch_size: u32,
    pub input: TensorSpec,
    pub output: TensorSpec,
}

impl ModelConfig {
    /// Serving contract for `kind`, named `model_name`.
    pub fn for_kind(kind: EncoderKind, model_name: &str) -> Self {
        let (input, output) = match kind {
            EncoderKind::ImageEncoder => (
                TensorSpec {
                    name: "image",
                    data_type: DataType::Fp16,
                    dims: vec![3, 256, 256],
                },
                TensorSpec {
                    name: "image_embeddings",
                    data_type: DataType::Fp32,
                    dims: vec![EMBEDDING_DIM],
                },
            ),
            EncoderKind::TextEncoder => (
                TensorSpec {
                    name: "text",
                    data_type: DataType::Int64,
                    dims: vec![77],
                },
                TensorSpec {
                    name: "text_embeddings",
                    data_type: DataType::Fp32,
                    dims: vec![EMBEDDING_DIM],
                },
            ),
        };
        Self {
            name: model_name.to_string(),
            platform: PLATFORM,
            max_batch_size: MAX_BATCH_SIZE,
            input,
            output,
        }
    }

    /// Config body without the `default_model_filename` line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("name: \"{}\"\n", self.name));
        out.push_str(&format!("platform: \"{}\"\n", self.platform));
        out.push_str(&format!("max_batch_size: {}\n", self.max_batch_size));
        out.push_str(&render_tensor_block("input", &self.input));
        out.push_str(&render_tensor_block("output", &self.output));
        out
    }
}

fn render_tensor_block(section: &str, tensor: &TensorSpec) -> String {
    let dims = tensor
        .dims
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{section} [\n  {{\n    name: \"{name}\"\n    data_type: {dtype}\n    dims: [ {dims} ]\n  }}\n]\n",
        name = tensor.name,
        dtype = tensor.data_type.triton_name(),
    )
}

/// Full `config.pbtxt` contents for a repository entry.
pub fn render_config_pbtxt(kind: EncoderKind, model_name: &str, plan_file_name: &str) -> String {
    let body = ModelConfig::for_kind(kind, model_name).render();
    format!("default_model_filename: \"{plan_file_name}\"\n{body}")
}
