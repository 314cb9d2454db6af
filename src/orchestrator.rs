//! Pipeline orchestration for one (query, measure) run.
//!
//! Stages run in a fixed order, each gated by a cache check against its keyed
//! output artifact:
//!
//! 1. plan the frame sequence and check for the final video (full-run hit)
//! 2. render each frame (individually skippable)
//! 3. optionally join/equalize/dice for one global brightness mapping
//! 4. optionally remap through a colormap
//! 5. aggregate global min/max + non-finite presence (mandatory, never cached)
//! 6. strip non-finite samples when present
//! 7. quantize each frame against the global range
//! 8. write the frame manifest and encode the video
//! 9. delete intermediates unless retention is requested
//!
//! Artifact names follow `{stem}-{query}-{measure}-{tag}-{key}.{ext}`; the
//! key covers every input that determines the artifact's bytes.

use std::path::{Path, PathBuf};

use crate::{
    error::{SweepError, SweepResult},
    key::{ArtifactKey, KeyWriter, Keyed, key_of},
    params::ParameterSequence,
    planner::{self, PlanConfig},
    stage::{StageExecutor, StageKind},
    toolkit::{self, ToolConfig},
};

const VOLUME_EXT: &str = "nrrd";
const IMAGE_EXT: &str = "png";
const VIDEO_EXT: &str = "avi";
const MANIFEST_EXT: &str = "txt";

/// Axis along which per-frame volumes are joined into a slab.
const SLAB_AXIS: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeqParams {
    pub bins: u32,
    pub smoothing: u32,
}

/// Everything fixed for one batch of runs; queries and measures vary per run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub input: PathBuf,
    pub out_dir: PathBuf,
    /// Base filename stem shared by every artifact of this batch.
    pub stem: String,
    pub plan: PlanConfig,
    pub heq: Option<HeqParams>,
    pub colormap: Option<PathBuf>,
    pub fps: u32,
    /// Thread count forwarded to the external renderer.
    pub threads: usize,
    pub keep_intermediates: bool,
    pub tools: ToolConfig,
}

/// Run-scoped accumulators for global quantization.
///
/// The first observation seeds the range; later observations only widen it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RunStats {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub has_nonfinite: bool,
}

impl RunStats {
    pub fn observe(&mut self, min: f64, max: f64, nonfinite: bool) {
        self.min = Some(match self.min {
            Some(m) => m.min(min),
            None => min,
        });
        self.max = Some(match self.max {
            Some(m) => m.max(max),
            None => max,
        });
        self.has_nonfinite |= nonfinite;
    }

    pub fn range(&self) -> SweepResult<(f64, f64)> {
        match (self.min, self.max) {
            (Some(min), Some(max)) => Ok((min, max)),
            _ => Err(SweepError::configuration(
                "no artifacts were aggregated before quantization",
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub video: PathBuf,
    /// True when the final video already existed (full-run cache hit).
    pub reused: bool,
}

/// Drive the full pipeline for one (query, measure) pair.
pub fn run_one(
    cfg: &RunConfig,
    query: &str,
    measure: &str,
    exec: &mut dyn StageExecutor,
) -> SweepResult<RunOutcome> {
    let sequence = planner::plan(&cfg.plan)?;
    let colormap = match &cfg.colormap {
        Some(path) => Some(std::fs::read(path).map_err(|e| {
            SweepError::configuration(format!("cannot read colormap '{}': {e}", path.display()))
        })?),
        None => None,
    };
    std::fs::create_dir_all(&cfg.out_dir)?;

    let mut ctx = RunContext {
        cfg,
        query,
        measure,
        sequence,
        colormap,
        stats: RunStats::default(),
        intermediates: Vec::new(),
    };

    let video = ctx.artifact_path("video", ctx.run_key(), VIDEO_EXT);
    if video.exists() {
        tracing::info!(query, measure, "full-run cache hit: {}", video.display());
        return Ok(RunOutcome {
            video,
            reused: true,
        });
    }

    let mut current = ctx.render_all(exec)?;
    if ctx.cfg.heq.is_some() {
        current = ctx.equalize_all(exec, &current)?;
    }
    if ctx.colormap.is_some() {
        current = ctx.colormap_all(exec, &current)?;
    }
    ctx.aggregate(exec, &current)?;
    if ctx.stats.has_nonfinite {
        ctx.strip_nonfinite(exec, &current)?;
    }
    let images = ctx.quantize_all(exec, &current)?;
    let outcome = ctx.encode(exec, &images, video)?;

    if !ctx.cfg.keep_intermediates {
        ctx.cleanup();
    }

    Ok(outcome)
}

/// Explicit per-run state threaded through the stages; no process globals.
struct RunContext<'a> {
    cfg: &'a RunConfig,
    query: &'a str,
    measure: &'a str,
    sequence: ParameterSequence,
    /// Colormap file *content*; keys hash the bytes so an edited map
    /// invalidates old artifacts even at the same path.
    colormap: Option<Vec<u8>>,
    stats: RunStats,
    /// Every non-final artifact this run produced or reused, for cleanup.
    intermediates: Vec<PathBuf>,
}

impl RunContext<'_> {
    fn artifact_path(&self, tag: &str, key: ArtifactKey, ext: &str) -> PathBuf {
        self.cfg.out_dir.join(format!(
            "{}-{}-{}-{}-{}.{}",
            self.cfg.stem, self.query, self.measure, tag, key, ext
        ))
    }

    /// Equalization tag folded into every downstream key: a presence bit plus
    /// the parameters that shape the mapping when enabled.
    fn write_heq_tag(&self, w: &mut KeyWriter) {
        match self.cfg.heq {
            Some(HeqParams { bins, smoothing }) => {
                w.write_u8(1);
                w.write_u32(bins);
                w.write_u32(smoothing);
            }
            None => w.write_u8(0),
        }
    }

    fn write_colormap_tag(&self, w: &mut KeyWriter) {
        match &self.colormap {
            Some(bytes) => {
                w.write_u8(1);
                w.write_bytes(bytes);
            }
            None => w.write_u8(0),
        }
    }

    /// Whole-run key naming the final video and the frame manifest.
    fn run_key(&self) -> ArtifactKey {
        let mut w = KeyWriter::new();
        self.sequence.write_key(&mut w);
        self.write_heq_tag(&mut w);
        self.write_colormap_tag(&mut w);
        w.finish()
    }

    fn render_all(&mut self, exec: &mut dyn StageExecutor) -> SweepResult<Vec<PathBuf>> {
        let mut outputs = Vec::with_capacity(self.sequence.len());
        for frame in &self.sequence.frames {
            let path = self.artifact_path("render", key_of(frame), VOLUME_EXT);
            let inv = toolkit::render_frame(
                &self.cfg.tools,
                &self.cfg.input,
                frame,
                self.query,
                self.measure,
                self.cfg.threads,
                &path,
            );
            exec.run(StageKind::Render, &inv, &path)?;
            outputs.push(path);
        }
        self.intermediates.extend(outputs.iter().cloned());
        Ok(outputs)
    }

    /// Join all renders into a slab, equalize it with one global mapping, then
    /// dice it back into per-frame volumes.
    ///
    /// Per-frame equalization would drift brightness between frames; the slab
    /// detour gives every frame the same transfer function. The slab and the
    /// equalized slab are each individually skippable, and the dice+rename
    /// step runs whenever any per-frame output is missing.
    fn equalize_all(
        &mut self,
        exec: &mut dyn StageExecutor,
        renders: &[PathBuf],
    ) -> SweepResult<Vec<PathBuf>> {
        let heq = self
            .cfg
            .heq
            .expect("equalize_all called without heq config");

        let frame_paths = self
            .sequence
            .frames
            .iter()
            .map(|frame| {
                let mut w = KeyWriter::new();
                frame.write_key(&mut w);
                self.write_heq_tag(&mut w);
                self.artifact_path("heq", w.finish(), VOLUME_EXT)
            })
            .collect::<Vec<_>>();

        if frame_paths.iter().any(|p| !p.exists()) {
            let slab = self.artifact_path("slab", key_of(&self.sequence), VOLUME_EXT);
            let inv = toolkit::join_slab(&self.cfg.tools, renders, SLAB_AXIS, &slab);
            exec.run(StageKind::Join, &inv, &slab)?;

            let mut w = KeyWriter::new();
            self.sequence.write_key(&mut w);
            self.write_heq_tag(&mut w);
            let heq_slab = self.artifact_path("heqslab", w.finish(), VOLUME_EXT);
            let inv =
                toolkit::equalize(&self.cfg.tools, &slab, heq.bins, heq.smoothing, &heq_slab);
            exec.run(StageKind::Equalize, &inv, &heq_slab)?;

            // The toolkit dices into sequentially numbered temp slices; stale
            // slices from an interrupted run must not masquerade as fresh.
            let prefix = self.cfg.out_dir.join(format!(
                "{}-{}-{}-slice-",
                self.cfg.stem, self.query, self.measure
            ));
            for i in 0..frame_paths.len() {
                remove_if_present(&toolkit::dice_slice_path(&prefix, i))?;
            }
            let inv = toolkit::dice(&self.cfg.tools, &heq_slab, SLAB_AXIS, &prefix);
            exec.run(StageKind::Dice, &inv, &toolkit::dice_slice_path(&prefix, 0))?;

            // Slice i corresponds to frame i in sequence order.
            for (i, frame_path) in frame_paths.iter().enumerate() {
                std::fs::rename(toolkit::dice_slice_path(&prefix, i), frame_path)?;
            }

            self.intermediates.push(slab);
            self.intermediates.push(heq_slab);
        } else {
            tracing::info!(
                query = self.query,
                measure = self.measure,
                "skipped equalize: all per-frame outputs exist"
            );
        }

        self.intermediates.extend(frame_paths.iter().cloned());
        Ok(frame_paths)
    }

    fn colormap_all(
        &mut self,
        exec: &mut dyn StageExecutor,
        inputs: &[PathBuf],
    ) -> SweepResult<Vec<PathBuf>> {
        let map_path = self
            .cfg
            .colormap
            .as_ref()
            .expect("colormap_all called without a colormap");

        let mut outputs = Vec::with_capacity(inputs.len());
        for (frame, input) in self.sequence.frames.iter().zip(inputs) {
            let mut w = KeyWriter::new();
            frame.write_key(&mut w);
            self.write_heq_tag(&mut w);
            self.write_colormap_tag(&mut w);
            let path = self.artifact_path("cmap", w.finish(), VOLUME_EXT);
            let inv = toolkit::colormap_remap(&self.cfg.tools, input, map_path, &path);
            exec.run(StageKind::Colormap, &inv, &path)?;
            outputs.push(path);
        }
        self.intermediates.extend(outputs.iter().cloned());
        Ok(outputs)
    }

    /// Fold every current artifact's reported range into [`RunStats`].
    ///
    /// Always scans the full set, even on a rerun — the stats must reflect the
    /// artifacts as they exist now, so this stage is deliberately uncached.
    fn aggregate(
        &mut self,
        exec: &mut dyn StageExecutor,
        inputs: &[PathBuf],
    ) -> SweepResult<()> {
        self.stats = RunStats::default();
        for input in inputs {
            let inv = toolkit::minmax(&self.cfg.tools, input);
            let report = exec.capture(StageKind::MinMax, &inv)?;
            let (min, max, nonfinite) = parse_minmax(&report, input)?;
            self.stats.observe(min, max, nonfinite);
        }
        Ok(())
    }

    /// Rewrite each artifact in place, replacing non-finite samples with zero.
    fn strip_nonfinite(
        &mut self,
        exec: &mut dyn StageExecutor,
        inputs: &[PathBuf],
    ) -> SweepResult<()> {
        for input in inputs {
            let tmp = input.with_extension(format!("tmp.{VOLUME_EXT}"));
            remove_if_present(&tmp)?;
            let inv = toolkit::nan_strip(&self.cfg.tools, input, &tmp);
            exec.run(StageKind::NanStrip, &inv, &tmp)?;
            std::fs::rename(&tmp, input)?;
        }
        Ok(())
    }

    fn quantize_all(
        &mut self,
        exec: &mut dyn StageExecutor,
        inputs: &[PathBuf],
    ) -> SweepResult<Vec<PathBuf>> {
        let (min, max) = self.stats.range()?;
        let mut outputs = Vec::with_capacity(inputs.len());
        for (i, (frame, input)) in self.sequence.frames.iter().zip(inputs).enumerate() {
            // The positional index keeps visually identical frames from
            // colliding on content-only keys.
            let mut w = KeyWriter::new();
            frame.write_key(&mut w);
            self.write_heq_tag(&mut w);
            self.write_colormap_tag(&mut w);
            w.write_u64(i as u64);
            let path = self.artifact_path("quant", w.finish(), IMAGE_EXT);
            let inv = toolkit::quantize(&self.cfg.tools, input, min, max, &path);
            exec.run(StageKind::Quantize, &inv, &path)?;
            outputs.push(path);
        }
        self.intermediates.extend(outputs.iter().cloned());
        Ok(outputs)
    }

    /// Write the ordered frame manifest and encode the video.
    ///
    /// Manifest order is load-bearing: it becomes video frame order. The
    /// manifest is rewritten every pass rather than cached; it is cheap and
    /// must match the current sequence.
    fn encode(
        &mut self,
        exec: &mut dyn StageExecutor,
        images: &[PathBuf],
        video: PathBuf,
    ) -> SweepResult<RunOutcome> {
        let manifest = self.artifact_path("frames", self.run_key(), MANIFEST_EXT);
        let mut listing = String::new();
        for image in images {
            listing.push_str(&image.display().to_string());
            listing.push('\n');
        }
        std::fs::write(&manifest, listing)?;
        self.intermediates.push(manifest.clone());

        let first = &self.sequence.frames[0];
        let inv = toolkit::encode(
            &self.cfg.tools,
            &manifest,
            first.width,
            first.height,
            self.cfg.fps,
            &video,
        );
        let artifact = exec.run(StageKind::Encode, &inv, &video)?;

        Ok(RunOutcome {
            video,
            reused: artifact.reused,
        })
    }

    /// Delete every recorded intermediate. Per-file and unconditional; a file
    /// that is already gone is logged and ignored, never fatal.
    fn cleanup(&mut self) {
        for path in self.intermediates.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("cleanup: cannot remove '{}': {e}", path.display());
            }
        }
    }
}

fn remove_if_present(path: &Path) -> SweepResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Parse the toolkit's textual min/max report.
///
/// Expected lines: `min: <value>` and `max: <value>`, with an additional line
/// mentioning non-existent values when the volume contains NaN or infinities.
fn parse_minmax(report: &str, input: &Path) -> SweepResult<(f64, f64, bool)> {
    let mut min = None;
    let mut max = None;
    let mut nonfinite = false;
    for line in report.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("min:") {
            min = rest.trim().parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("max:") {
            max = rest.trim().parse::<f64>().ok();
        } else if line.contains("non-existent") || line.to_ascii_lowercase().contains("nan") {
            nonfinite = true;
        }
    }
    match (min, max) {
        (Some(min), Some(max)) => Ok((min, max, nonfinite)),
        _ => Err(anyhow::anyhow!(
            "unparsable min/max report for '{}': {report:?}",
            input.display()
        )
        .into()),
    }
}
