/// Integration tests for the reid-deploy library.
///
/// Packaging runs against real temp directories laid out like an IRRA
/// checkout. Export tests either swap the Python backend for a closure or
/// point `python` at a stand-in shell script, so they do NOT require torch
/// or a GPU.
use std::fs;
use std::path::{Path, PathBuf};

use reid_deploy::config::{ExportConfig, PackagerConfig};
use reid_deploy::exporter::{ExportStatus, export_encoders, export_jobs, harness_path, run_exports};
use reid_deploy::packager::package_models;
use reid_deploy::utils::EncoderKind;
use tempfile::{TempDir, tempdir};
use walkdir::WalkDir;

fn packager_config(root: &Path, prefixes: &[&str]) -> PackagerConfig {
    PackagerConfig {
        base_repo: root.join("model_repository"),
        artifacts_root: root.to_path_buf(),
        model_prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
        types: EncoderKind::ALL.to_vec(),
    }
}

fn write_plan(root: &Path, prefix: &str, kind: EncoderKind, contents: &[u8]) -> PathBuf {
    let dir = root.join(prefix);
    fs::create_dir_all(&dir).expect("create prefix dir");
    let path = dir.join(format!("{}.plan", kind.model_name(prefix)));
    fs::write(&path, contents).expect("write plan");
    path
}

/// Relative paths and contents of every file under `dir`, sorted.
fn tree(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut out: Vec<(String, Vec<u8>)> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(dir).unwrap().display().to_string();
            (rel, fs::read(e.path()).expect("read file"))
        })
        .collect();
    out.sort();
    out
}

// ── packaging ────────────────────────────────────────────────────────────────

#[test]
fn package_copies_plan_and_writes_config() {
    let tmp = tempdir().expect("tempdir");
    let engine = b"\x7fTRT-engine-bytes\x00\x01";
    write_plan(tmp.path(), "irra_cuhk", EncoderKind::ImageEncoder, engine);
    let cfg = packager_config(tmp.path(), &["irra_cuhk"]);

    let report = package_models(&cfg, false).expect("package failed");
    assert_eq!(report.deployed().count(), 1);
    assert_eq!(report.skipped().count(), 1);

    let model_dir = cfg.base_repo.join("irra_cuhk_image_encoder");
    let plan = model_dir.join("1/irra_cuhk_image_encoder.plan");
    assert_eq!(fs::read(&plan).expect("read plan"), engine);

    let config = fs::read_to_string(model_dir.join("config.pbtxt")).expect("read config");
    assert!(config.starts_with("default_model_filename: \"irra_cuhk_image_encoder.plan\"\n"));
    assert!(config.contains("name: \"irra_cuhk_image_encoder\"\n"));
    assert!(config.contains("platform: \"tensorrt_plan\""));
    assert!(config.contains("dims: [ 3, 256, 256 ]"));
}

#[test]
fn package_entry_contains_only_plan_and_config() {
    let tmp = tempdir().expect("tempdir");
    write_plan(tmp.path(), "irra_rstp", EncoderKind::TextEncoder, b"text-engine");
    let cfg = packager_config(tmp.path(), &["irra_rstp"]);
    package_models(&cfg, false).expect("package failed");

    let names: Vec<String> = tree(&cfg.base_repo.join("irra_rstp_text_encoder"))
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, ["1/irra_rstp_text_encoder.plan", "config.pbtxt"]);
}

#[test]
fn package_missing_sources_create_nothing() {
    let tmp = tempdir().expect("tempdir");
    let cfg = packager_config(tmp.path(), &["a", "b"]);

    let report = package_models(&cfg, false).expect("missing sources must not fail");
    assert_eq!(report.skipped().count(), 4);
    assert!(cfg.base_repo.exists(), "repository root is created up front");
    assert_eq!(fs::read_dir(&cfg.base_repo).unwrap().count(), 0);
}

#[test]
fn package_leaves_existing_entry_alone_when_source_missing() {
    let tmp = tempdir().expect("tempdir");
    let cfg = packager_config(tmp.path(), &["a"]);
    let existing = cfg.base_repo.join("a_text_encoder/1");
    fs::create_dir_all(&existing).unwrap();
    fs::write(existing.join("a_text_encoder.plan"), b"deployed earlier").unwrap();

    package_models(&cfg, false).expect("package failed");
    assert_eq!(
        fs::read(existing.join("a_text_encoder.plan")).unwrap(),
        b"deployed earlier"
    );
}

#[test]
fn package_produces_at_most_one_dir_per_pair() {
    let tmp = tempdir().expect("tempdir");
    for prefix in ["a", "b"] {
        for kind in EncoderKind::ALL {
            write_plan(tmp.path(), prefix, kind, prefix.as_bytes());
        }
    }
    // an artifact nobody asked for
    write_plan(tmp.path(), "c", EncoderKind::ImageEncoder, b"c");
    let cfg = packager_config(tmp.path(), &["a", "b"]);
    package_models(&cfg, false).expect("package failed");

    let mut dirs: Vec<String> = fs::read_dir(&cfg.base_repo)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    dirs.sort();
    assert_eq!(
        dirs,
        ["a_image_encoder", "a_text_encoder", "b_image_encoder", "b_text_encoder"]
    );
}

#[test]
fn package_rerun_is_idempotent_and_drops_stale_files() {
    let tmp = tempdir().expect("tempdir");
    write_plan(tmp.path(), "irra_icfg", EncoderKind::ImageEncoder, b"img");
    write_plan(tmp.path(), "irra_icfg", EncoderKind::TextEncoder, b"txt");
    let cfg = packager_config(tmp.path(), &["irra_icfg"]);

    package_models(&cfg, false).expect("first run");
    let first = tree(&cfg.base_repo);

    // leftovers from some other deployment
    let model_dir = cfg.base_repo.join("irra_icfg_image_encoder");
    fs::create_dir_all(model_dir.join("2")).unwrap();
    fs::write(model_dir.join("2/old.plan"), b"stale").unwrap();
    fs::write(model_dir.join("notes.txt"), b"stale").unwrap();

    package_models(&cfg, false).expect("second run");
    assert_eq!(tree(&cfg.base_repo), first);
}

#[test]
fn package_rerun_picks_up_new_plan_contents() {
    let tmp = tempdir().expect("tempdir");
    let src = write_plan(tmp.path(), "a", EncoderKind::ImageEncoder, b"v1");
    let cfg = packager_config(tmp.path(), &["a"]);
    package_models(&cfg, false).expect("first run");

    fs::write(&src, b"v2-rebuilt").unwrap();
    package_models(&cfg, false).expect("second run");
    let plan = cfg.base_repo.join("a_image_encoder/1/a_image_encoder.plan");
    assert_eq!(fs::read(plan).unwrap(), b"v2-rebuilt");
}

// ── export ───────────────────────────────────────────────────────────────────

fn export_config(tmp: &TempDir) -> ExportConfig {
    let train_config = tmp.path().join("configs.yaml");
    fs::write(&train_config, "loss_names: sdm+id+mlm\nimg_size: [384, 128]\n").unwrap();
    ExportConfig {
        train_config,
        checkpoint: tmp.path().join("best.pth"),
        project_root: tmp.path().to_path_buf(),
        output_dir: tmp.path().join("onnx"),
        ..ExportConfig::default()
    }
}

#[test]
fn export_image_failure_still_produces_text_model() {
    let tmp = tempdir().expect("tempdir");
    let cfg = export_config(&tmp);
    fs::create_dir_all(&cfg.output_dir).unwrap();

    let mut jobs = export_jobs(&cfg);
    jobs[0].dummy_shape = vec![1, 3, 0, 128];

    let outcomes = run_exports(&jobs, |job| {
        fs::write(&job.onnx_path, job.model_name.as_bytes())?;
        Ok(())
    });

    assert!(matches!(outcomes[0].status, ExportStatus::Failed(_)));
    assert_eq!(outcomes[1].status, ExportStatus::Exported);
    assert!(!cfg.output_dir.join("irra_icfg_image_encoder.onnx").exists());
    assert!(cfg.output_dir.join("irra_icfg_text_encoder.onnx").exists());
}

#[test]
fn export_dry_run_writes_harnesses_and_patched_config() {
    let tmp = tempdir().expect("tempdir");
    let cfg = export_config(&tmp);

    let outcomes = export_encoders(&cfg, true).expect("dry-run export");
    assert_eq!(outcomes.len(), 2);

    for outcome in &outcomes {
        let script = harness_path(&cfg.output_dir, &outcome.job);
        assert_eq!(outcome.status, ExportStatus::Planned(script.clone()));
        let text = fs::read_to_string(&script).expect("read harness");
        assert!(text.contains(&format!("self.model.{}(", outcome.job.method)));
        assert!(!outcome.job.onnx_path.exists(), "dry-run must not export");
    }

    let patched = fs::read_to_string(cfg.output_dir.join("irra_icfg_export_config.yaml"))
        .expect("read patched config");
    let doc: serde_yaml::Value = serde_yaml::from_str(&patched).expect("parse patched config");
    assert_eq!(doc["loss_names"].as_str(), Some("sdm+mlm"));
    assert_eq!(doc["img_size"][1].as_u64(), Some(128));
}

#[test]
fn export_missing_training_config_is_fatal() {
    let tmp = tempdir().expect("tempdir");
    let cfg = ExportConfig {
        train_config: tmp.path().join("absent.yaml"),
        output_dir: tmp.path().join("onnx"),
        ..ExportConfig::default()
    };
    let err = export_encoders(&cfg, true).unwrap_err();
    assert!(format!("{err:#}").contains("absent.yaml"));
    assert!(!cfg.output_dir.exists(), "no output dir left behind");
}

/// Install an executable shell script standing in for the Python interpreter.
/// It receives `-c <harness>` like python would.
#[cfg(unix)]
fn fake_python(dir: &Path, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-python.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write fake python");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake python");
    path.display().to_string()
}

#[cfg(unix)]
#[test]
fn export_interpreter_crash_on_image_still_exports_text() {
    let tmp = tempdir().expect("tempdir");
    let mut cfg = export_config(&tmp);
    let text_onnx = cfg.output_dir.join("irra_icfg_text_encoder.onnx");
    cfg.python = Some(fake_python(
        tmp.path(),
        &format!(
            r#"case "$2" in
  *encode_image*)
    echo "Traceback (most recent call last):" >&2
    echo "RuntimeError: CUDA error: out of memory" >&2
    exit 1 ;;
  *encode_text*)
    printf onnx > "{}" ;;
esac
"#,
            text_onnx.display()
        ),
    ));

    let outcomes = export_encoders(&cfg, false).expect("export run");

    match &outcomes[0].status {
        ExportStatus::Failed(err) => {
            assert!(err.contains("RuntimeError: CUDA error: out of memory"), "got: {err}");
            assert!(!err.contains("Traceback"), "only the final line is kept: {err}");
        }
        other => panic!("image export should fail, got {other:?}"),
    }
    assert_eq!(outcomes[1].status, ExportStatus::Exported);
    assert_eq!(fs::read(&text_onnx).expect("read text onnx"), b"onnx");
    assert!(!cfg.output_dir.join("irra_icfg_image_encoder.onnx").exists());
}

#[cfg(unix)]
#[test]
fn export_clean_exit_without_onnx_is_a_failure() {
    let tmp = tempdir().expect("tempdir");
    let mut cfg = export_config(&tmp);
    cfg.python = Some(fake_python(tmp.path(), "exit 0\n"));

    let outcomes = export_encoders(&cfg, false).expect("export run");
    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        match &outcome.status {
            ExportStatus::Failed(err) => assert!(err.contains("was not written"), "got: {err}"),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
