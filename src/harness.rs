//! Python harness rendering for ONNX export.
//!
//! The model is only constructible through its Python package, so each
//! encoder export is a generated script run in a fresh interpreter.

use std::path::Path;

use crate::exporter::ExportJob;

/// Everything a harness needs besides the job itself.
#[derive(Debug, Clone, Copy)]
pub struct HarnessContext<'a> {
    pub project_root: &'a Path,
    pub train_config: &'a Path,
    pub checkpoint: &'a Path,
    pub device: &'a str,
    pub opset: u32,
}

/// Build, load and export one wrapped encoder.
pub fn build_export_harness(ctx: &HarnessContext<'_>, job: &ExportJob) -> String {
    let shape = job
        .dummy_shape
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let dummy = match job.token_range {
        Some(high) => format!(
            "torch.randint(0, {high}, ({shape},), dtype={dtype})",
            dtype = job.dummy_dtype.torch_name()
        ),
        None => format!(
            "torch.randn({shape}, dtype={dtype})",
            dtype = job.dummy_dtype.torch_name()
        ),
    };

    format!(
        r#"
import sys
import torch
import torch.onnx

sys.path.insert(0, {root})
from model.build import build_model
from utils.checkpoint import Checkpointer
from utils.iotools import load_train_configs

print("Loading configuration from " + {config}, flush=True)
args = load_train_configs({config})
print("Building model...", flush=True)
model = build_model(args, num_classes={num_classes})
print("Loading checkpoint from " + {checkpoint}, flush=True)
Checkpointer(model).load(f={checkpoint})

device = {device}
model.to(device)
model.eval()


class {wrapper}(torch.nn.Module):
    def __init__(self, model):
        super().__init__()
        self.model = model

    def forward(self, {input}):
        return self.model.{method}({input})


dummy = {dummy}.to(device)
torch.onnx.export(
    {wrapper}(model),
    (dummy,),
    {onnx_path},
    export_params=True,
    opset_version={opset},
    do_constant_folding=True,
    input_names=["{input}"],
    output_names=["{output}"],
    dynamic_axes={{"{input}": {{0: "{axis}"}}, "{output}": {{0: "{axis}"}}}},
)
"#,
        root = py_str(&ctx.project_root.display().to_string()),
        config = py_str(&ctx.train_config.display().to_string()),
        checkpoint = py_str(&ctx.checkpoint.display().to_string()),
        device = py_str(ctx.device),
        num_classes = NUM_CLASSES,
        wrapper = job.wrapper,
        method = job.method,
        input = job.input_name,
        output = job.output_name,
        onnx_path = py_str(&job.onnx_path.display().to_string()),
        opset = ctx.opset,
        axis = BATCH_AXIS,
    )
}

/// Identity count the checkpoint's classifier head was trained with.
pub const NUM_CLASSES: u32 = 100;
pub const BATCH_AXIS: &str = "batch_size";

/// Quote `s` as a Python string literal.
fn py_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
