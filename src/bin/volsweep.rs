use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use volsweep::{
    CameraPath, FrameParameters, HeqParams, PlanConfig, ProcessExecutor, RunConfig, ToolConfig,
    load_script, run_batch,
};

#[derive(Parser, Debug)]
#[command(name = "volsweep", version)]
struct Cli {
    /// Input volume.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Directory for artifacts and the final videos.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Artifact name stem (defaults to the input file stem).
    #[arg(long)]
    stem: Option<String>,

    /// Scalar query to render; repeatable.
    #[arg(long = "query", required = true)]
    queries: Vec<String>,

    /// Ray measure to apply; repeatable.
    #[arg(long = "measure", required = true)]
    measures: Vec<String>,

    /// Inclusive sweep angle range, as `start:end` (integer degrees).
    #[arg(long, conflicts_with = "script")]
    sweep: Option<String>,

    /// Camera script: JSON array of cascading partial frame overrides.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Keep every Nth planned frame, starting at the first.
    #[arg(long, default_value_t = 1)]
    interval: usize,

    /// Histogram-equalize brightness globally across the whole sweep.
    #[arg(long)]
    heq: bool,

    /// Equalization histogram bin count.
    #[arg(long, default_value_t = 3000)]
    heq_bins: u32,

    /// Equalization smoothing amount.
    #[arg(long, default_value_t = 1)]
    heq_smoothing: u32,

    /// Colormap file to remap values through.
    #[arg(long)]
    colormap: Option<PathBuf>,

    /// Video frame rate.
    #[arg(long, default_value_t = 25)]
    fps: u32,

    /// Thread count forwarded to the renderer.
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Retain intermediate artifacts instead of deleting them after encoding.
    #[arg(long)]
    keep: bool,

    /// Rendered image width.
    #[arg(long, default_value_t = 512)]
    width: u32,

    /// Rendered image height.
    #[arg(long, default_value_t = 512)]
    height: u32,

    /// Ray sampling step.
    #[arg(long)]
    step: Option<f64>,

    /// Value reconstruction kernel.
    #[arg(long)]
    kernel: Option<String>,

    /// Derivative reconstruction kernel.
    #[arg(long)]
    dkernel: Option<String>,

    /// Renderer program name.
    #[arg(long, default_value = "mrender")]
    render_cmd: String,

    /// Image toolkit program name.
    #[arg(long, default_value = "unu")]
    toolkit_cmd: String,

    /// Video encoder program name.
    #[arg(long, default_value = "mencoder")]
    encoder_cmd: String,
}

fn parse_sweep(range: &str) -> anyhow::Result<(i32, i32)> {
    let (start, end) = range
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("sweep range must look like 'start:end', got '{range}'"))?;
    Ok((start.trim().parse()?, end.trim().parse()?))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let path = match (&cli.sweep, &cli.script) {
        (Some(range), None) => {
            let (start, end) = parse_sweep(range)?;
            CameraPath::Sweep { start, end }
        }
        (None, Some(script)) => CameraPath::Script(load_script(script)?),
        (None, None) => anyhow::bail!("one of --sweep or --script is required"),
        (Some(_), Some(_)) => unreachable!("clap rejects --sweep with --script"),
    };

    let mut defaults = FrameParameters {
        width: cli.width,
        height: cli.height,
        ..FrameParameters::default()
    };
    if let Some(step) = cli.step {
        defaults.step = step;
    }
    if let Some(kernel) = cli.kernel {
        defaults.value_kernel = kernel;
    }
    if let Some(dkernel) = cli.dkernel {
        defaults.derivative_kernel = dkernel;
    }

    let stem = match cli.stem {
        Some(stem) => stem,
        None => cli
            .in_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("cannot derive a stem from the input path"))?,
    };

    let cfg = RunConfig {
        input: cli.in_path,
        out_dir: cli.out_dir,
        stem,
        plan: PlanConfig {
            path,
            interval: cli.interval,
            defaults,
        },
        heq: cli.heq.then_some(HeqParams {
            bins: cli.heq_bins,
            smoothing: cli.heq_smoothing,
        }),
        colormap: cli.colormap,
        fps: cli.fps,
        threads: cli.threads,
        keep_intermediates: cli.keep,
        tools: ToolConfig {
            render: cli.render_cmd,
            toolkit: cli.toolkit_cmd,
            encoder: cli.encoder_cmd,
        },
    };

    let mut exec = ProcessExecutor::default();
    let summary = run_batch(&cfg, &cli.queries, &cli.measures, &mut exec)?;

    if summary.any_failed() {
        anyhow::bail!(
            "{} of {} runs failed",
            summary.failures.len(),
            summary.total
        );
    }
    Ok(())
}
