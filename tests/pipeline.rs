use std::path::{Path, PathBuf};

use volsweep::{
    Artifact, CameraPath, FrameParameters, HeqParams, PlanConfig, RunConfig, StageExecutor,
    StageInvocation, StageKind, SweepError, SweepResult, ToolConfig, run_batch, run_one,
    toolkit::dice_slice_path,
};

/// Recording stage backend: captures every executed invocation and fabricates
/// stage outputs on disk, without spawning anything. Mirrors the real
/// executor's skip-if-output-exists semantics so cache behavior is observable
/// through the call log.
#[derive(Default)]
struct FakeExecutor {
    /// Frame count, used to emit the dice contract's numbered slices.
    frames: usize,
    /// Report returned by every min/max capture: (min, max, has_nonfinite).
    report: (f64, f64, bool),
    /// Fail any invocation whose argv contains this token.
    fail_on_arg: Option<String>,
    calls: Vec<(StageKind, StageInvocation)>,
    captures: Vec<StageInvocation>,
}

impl FakeExecutor {
    fn new(frames: usize) -> Self {
        Self {
            frames,
            report: (0.25, 0.75, false),
            ..Self::default()
        }
    }

    fn kinds(&self) -> Vec<StageKind> {
        self.calls.iter().map(|(k, _)| *k).collect()
    }

    fn count(&self, kind: StageKind) -> usize {
        self.calls.iter().filter(|(k, _)| *k == kind).count()
    }
}

fn arg_after(inv: &StageInvocation, flag: &str) -> String {
    let pos = inv
        .args
        .iter()
        .position(|a| a == flag)
        .unwrap_or_else(|| panic!("no `{flag}` in {}", inv.command_line()));
    inv.args[pos + 1].clone()
}

impl StageExecutor for FakeExecutor {
    fn run(
        &mut self,
        stage: StageKind,
        invocation: &StageInvocation,
        output: &Path,
    ) -> SweepResult<Artifact> {
        if output.exists() {
            return Ok(Artifact {
                path: output.to_path_buf(),
                reused: true,
            });
        }
        if let Some(bad) = &self.fail_on_arg
            && invocation.args.iter().any(|a| a == bad)
        {
            return Err(SweepError::ExternalFailure {
                stage,
                command: invocation.command_line(),
                status: "exit status: 1".to_string(),
                stderr: "synthetic failure".to_string(),
            });
        }
        self.calls.push((stage, invocation.clone()));

        if stage == StageKind::Dice {
            let prefix = PathBuf::from(arg_after(invocation, "-o"));
            for i in 0..self.frames {
                std::fs::write(dice_slice_path(&prefix, i), b"slice").unwrap();
            }
        } else {
            std::fs::write(output, invocation.command_line()).unwrap();
        }

        Ok(Artifact {
            path: output.to_path_buf(),
            reused: false,
        })
    }

    fn capture(
        &mut self,
        _stage: StageKind,
        invocation: &StageInvocation,
    ) -> SweepResult<String> {
        self.captures.push(invocation.clone());
        let (min, max, nonfinite) = self.report;
        let mut report = format!("min: {min}\nmax: {max}\n");
        if nonfinite {
            report.push_str("# has non-existent values\n");
        }
        Ok(report)
    }
}

fn base_config(dir: &Path) -> RunConfig {
    let input = dir.join("volume.nrrd");
    std::fs::write(&input, b"volume").unwrap();
    RunConfig {
        input,
        out_dir: dir.join("out"),
        stem: "vol".to_string(),
        plan: PlanConfig {
            path: CameraPath::Sweep { start: 0, end: 9 },
            interval: 3,
            defaults: FrameParameters::default(),
        },
        heq: None,
        colormap: None,
        fps: 25,
        threads: 2,
        keep_intermediates: true,
        tools: ToolConfig::default(),
    }
}

fn out_dir_names(cfg: &RunConfig) -> Vec<String> {
    let mut names = std::fs::read_dir(&cfg.out_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    names.sort();
    names
}

#[test]
fn pipeline_runs_stages_in_order_and_orders_the_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config(dir.path());
    let mut exec = FakeExecutor::new(4);

    let outcome = run_one(&cfg, "val", "max", &mut exec).unwrap();
    assert!(!outcome.reused);
    assert!(outcome.video.exists());
    let video_name = outcome.video.file_name().unwrap().to_string_lossy();
    assert!(video_name.starts_with("vol-val-max-video-"));
    assert!(video_name.ends_with(".avi"));

    // Angles 0..=9 at interval 3 -> 4 frames.
    assert_eq!(
        exec.kinds(),
        [
            StageKind::Render,
            StageKind::Render,
            StageKind::Render,
            StageKind::Render,
            StageKind::Quantize,
            StageKind::Quantize,
            StageKind::Quantize,
            StageKind::Quantize,
            StageKind::Encode,
        ]
    );
    assert_eq!(exec.captures.len(), 4);

    // The manifest lists the quantized images in frame order.
    let manifest = std::fs::read_dir(&cfg.out_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|e| e == "txt"))
        .expect("manifest retained");
    let listing = std::fs::read_to_string(manifest).unwrap();
    let quant_outputs = exec
        .calls
        .iter()
        .filter(|(k, _)| *k == StageKind::Quantize)
        .map(|(_, inv)| arg_after(inv, "-o"))
        .collect::<Vec<_>>();
    assert_eq!(
        listing.lines().collect::<Vec<_>>(),
        quant_outputs.iter().map(String::as_str).collect::<Vec<_>>()
    );
}

#[test]
fn second_identical_run_is_a_full_cache_hit() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config(dir.path());
    let mut exec = FakeExecutor::new(4);

    run_one(&cfg, "val", "max", &mut exec).unwrap();
    let calls_after_first = exec.calls.len();
    let captures_after_first = exec.captures.len();

    let outcome = run_one(&cfg, "val", "max", &mut exec).unwrap();
    assert!(outcome.reused);
    // No stage is touched, not even the aggregation scan.
    assert_eq!(exec.calls.len(), calls_after_first);
    assert_eq!(exec.captures.len(), captures_after_first);
}

#[test]
fn deleting_only_the_video_reruns_just_aggregate_and_encode() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config(dir.path());
    let mut exec = FakeExecutor::new(4);

    let outcome = run_one(&cfg, "val", "max", &mut exec).unwrap();
    std::fs::remove_file(&outcome.video).unwrap();
    let calls_after_first = exec.calls.len();

    let outcome = run_one(&cfg, "val", "max", &mut exec).unwrap();
    assert!(!outcome.reused);
    assert!(outcome.video.exists());

    let new_calls = exec.calls[calls_after_first..]
        .iter()
        .map(|(k, _)| *k)
        .collect::<Vec<_>>();
    assert_eq!(new_calls, [StageKind::Encode]);
    // The aggregation scan is mandatory on every non-hit pass.
    assert_eq!(exec.captures.len(), 8);
}

#[test]
fn quantize_uses_the_global_range_from_aggregation() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config(dir.path());
    let mut exec = FakeExecutor::new(4);
    exec.report = (0.125, 0.875, false);

    run_one(&cfg, "val", "max", &mut exec).unwrap();

    let quantize_invs = exec
        .calls
        .iter()
        .filter(|(k, _)| *k == StageKind::Quantize)
        .map(|(_, inv)| inv)
        .collect::<Vec<_>>();
    assert_eq!(quantize_invs.len(), 4);
    for inv in quantize_invs {
        assert_eq!(arg_after(inv, "-min"), "0.125");
        assert_eq!(arg_after(inv, "-max"), "0.875");
        assert_eq!(arg_after(inv, "-b"), "8");
    }
}

#[test]
fn equalize_joins_dices_and_renames_slices_to_keyed_frames() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_config(dir.path());
    cfg.plan.path = CameraPath::Sweep { start: 0, end: 1 };
    cfg.plan.interval = 1;
    cfg.heq = Some(HeqParams {
        bins: 3000,
        smoothing: 1,
    });
    let mut exec = FakeExecutor::new(2);

    run_one(&cfg, "val", "max", &mut exec).unwrap();

    assert_eq!(
        exec.kinds(),
        [
            StageKind::Render,
            StageKind::Render,
            StageKind::Join,
            StageKind::Equalize,
            StageKind::Dice,
            StageKind::Quantize,
            StageKind::Quantize,
            StageKind::Encode,
        ]
    );

    let names = out_dir_names(&cfg);
    assert_eq!(names.iter().filter(|n| n.contains("-heq-")).count(), 2);
    // Temp slices were renamed away, not left behind.
    assert!(names.iter().all(|n| !n.contains("-slice-")));

    // Aggregation ran over the equalized frames, not the raw renders.
    for inv in &exec.captures {
        assert!(inv.command_line().contains("-heq-"));
    }
}

#[test]
fn equalize_redices_when_a_per_frame_output_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_config(dir.path());
    cfg.plan.path = CameraPath::Sweep { start: 0, end: 1 };
    cfg.plan.interval = 1;
    cfg.heq = Some(HeqParams {
        bins: 3000,
        smoothing: 1,
    });
    let mut exec = FakeExecutor::new(2);

    let outcome = run_one(&cfg, "val", "max", &mut exec).unwrap();
    std::fs::remove_file(&outcome.video).unwrap();

    // Drop one equalized frame; the slab artifacts are still present, so the
    // rerun must skip join/equalize but still dice and rename.
    let heq_frame = std::fs::read_dir(&cfg.out_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.file_name().unwrap().to_string_lossy().contains("-heq-"))
        .unwrap();
    std::fs::remove_file(&heq_frame).unwrap();
    let calls_after_first = exec.calls.len();

    run_one(&cfg, "val", "max", &mut exec).unwrap();
    let new_calls = exec.calls[calls_after_first..]
        .iter()
        .map(|(k, _)| *k)
        .collect::<Vec<_>>();
    assert_eq!(new_calls, [StageKind::Dice, StageKind::Encode]);
    assert!(heq_frame.exists());
}

#[test]
fn nan_strip_runs_only_when_nonfinite_values_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config(dir.path());
    let mut exec = FakeExecutor::new(4);
    exec.report = (0.0, 1.0, true);
    run_one(&cfg, "val", "max", &mut exec).unwrap();
    assert_eq!(exec.count(StageKind::NanStrip), 4);

    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config(dir.path());
    let mut exec = FakeExecutor::new(4);
    exec.report = (0.0, 1.0, false);
    run_one(&cfg, "val", "max", &mut exec).unwrap();
    assert_eq!(exec.count(StageKind::NanStrip), 0);
}

#[test]
fn colormap_content_not_path_determines_artifact_keys() {
    let dir_a = tempfile::tempdir().unwrap();
    let mut cfg_a = base_config(dir_a.path());
    let map_a = dir_a.path().join("map.txt");
    std::fs::write(&map_a, b"0 0 0\n1 1 1\n").unwrap();
    cfg_a.colormap = Some(map_a);

    let dir_b = tempfile::tempdir().unwrap();
    let mut cfg_b = base_config(dir_b.path());
    let map_b = dir_b.path().join("map.txt");
    std::fs::write(&map_b, b"1 0 0\n0 0 1\n").unwrap();
    cfg_b.colormap = Some(map_b);

    let mut exec = FakeExecutor::new(4);
    let out_a = run_one(&cfg_a, "val", "max", &mut exec).unwrap();
    assert_eq!(exec.count(StageKind::Colormap), 4);
    let out_b = run_one(&cfg_b, "val", "max", &mut exec).unwrap();

    // Same path stem, different contents: every keyed name must differ.
    assert_ne!(
        out_a.video.file_name().unwrap(),
        out_b.video.file_name().unwrap()
    );

    // Identical contents at a different path produce identical keys.
    let dir_c = tempfile::tempdir().unwrap();
    let mut cfg_c = base_config(dir_c.path());
    let map_c = dir_c.path().join("renamed-map.txt");
    std::fs::write(&map_c, b"0 0 0\n1 1 1\n").unwrap();
    cfg_c.colormap = Some(map_c);
    let out_c = run_one(&cfg_c, "val", "max", &mut exec).unwrap();
    assert_eq!(
        out_a.video.file_name().unwrap(),
        out_c.video.file_name().unwrap()
    );
}

#[test]
fn cleanup_leaves_only_the_video() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_config(dir.path());
    cfg.keep_intermediates = false;
    let mut exec = FakeExecutor::new(4);

    run_one(&cfg, "val", "max", &mut exec).unwrap();

    let names = out_dir_names(&cfg);
    assert_eq!(names.len(), 1);
    assert!(names[0].contains("-video-"));
}

#[test]
fn batch_continues_past_a_failing_pair() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config(dir.path());
    let mut exec = FakeExecutor::new(4);
    exec.fail_on_arg = Some("gmag".to_string());

    let queries = vec!["gmag".to_string(), "val".to_string()];
    let measures = vec!["max".to_string()];
    let summary = run_batch(&cfg, &queries, &measures, &mut exec).unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].query, "gmag");
    assert!(matches!(
        summary.failures[0].error,
        SweepError::ExternalFailure { .. }
    ));
    assert_eq!(summary.completed.len(), 1);
    assert!(summary.completed[0].2.video.exists());
    assert!(summary.any_failed());
}

#[test]
fn empty_query_list_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config(dir.path());
    let mut exec = FakeExecutor::new(4);
    let err = run_batch(&cfg, &[], &["max".to_string()], &mut exec).unwrap_err();
    assert!(matches!(err, SweepError::Configuration(_)));
}
