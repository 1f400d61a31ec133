//! BEV perception over a sequence of BEV feature frames
//!
//! Runs tracking, map instance segmentation and occupancy forecasting frame by frame,
//! carrying track queries between frames, and optionally exports the outputs.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use candle_bev_perception::debug::{self, TensorStats};
use candle_bev_perception::detection::{decode_detections, BevDetection};
use candle_bev_perception::pipeline::{
    BevPerception, FrameOutput, PerceptionState, TiledMotionQueries,
};
use candle_bev_perception::visualize;
use candle_bev_perception::PerceptionConfig;

/// Select the compute device
pub fn device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!(
                "Running on CPU, to run on GPU(metal), build with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Model size presets
#[derive(Clone, Copy, ValueEnum, Debug)]
enum Which {
    Tiny,
    Small,
    Base,
}

impl Which {
    fn config(&self) -> PerceptionConfig {
        match self {
            Which::Tiny => PerceptionConfig::tiny(),
            Which::Small => PerceptionConfig::small(),
            Which::Base => PerceptionConfig::base(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Which preset to use when no config file is given.
    #[arg(long, value_enum, default_value_t = Which::Tiny)]
    which: Which,

    /// JSON configuration file overlaid onto the small preset, overrides --which.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to model weights, in safetensors format. Random weights when absent.
    #[arg(long)]
    model: Option<PathBuf>,

    /// BEV features as .npy, shaped (frames, N, H*W, E) or (N, H*W, E).
    /// Random features when absent.
    #[arg(long)]
    bev: Option<PathBuf>,

    /// Number of random frames to generate when --bev is absent.
    #[arg(long, default_value_t = 3)]
    frames: usize,

    /// Batch size of the generated frames.
    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Run in training mode (dropout, per-layer outputs, attention masks).
    #[arg(long)]
    train: bool,

    /// Minimum score for a decoded detection.
    #[arg(long, default_value_t = 0.5)]
    score_threshold: f32,

    /// Standard deviation of the jitter applied to synthesised motion queries.
    #[arg(long, default_value_t = 0.1)]
    motion_jitter: f64,

    /// Directory receiving .npy dumps, PNG renders and a JSON summary.
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct FrameSummary {
    frame: usize,
    num_queries: usize,
    confirmed_agents: Vec<usize>,
    num_forecast_agents: usize,
    detections: Vec<Vec<BevDetection>>,
    map_detections: Vec<Vec<BevDetection>>,
    stats: Vec<(String, TensorStats)>,
}

fn load_frames(args: &Args, config: &PerceptionConfig, device: &Device) -> anyhow::Result<Vec<Tensor>> {
    let (h, w) = config.trackformer.bev_feature_shape;
    let e = config.embed_dim();
    let frames = match &args.bev {
        Some(path) => {
            let bev = debug::read_npy(path, device)
                .with_context(|| format!("reading BEV features from {path:?}"))?;
            match bev.rank() {
                4 => (0..bev.dim(0)?)
                    .map(|i| bev.i(i))
                    .collect::<candle_core::Result<Vec<_>>>()?,
                3 => vec![bev],
                rank => anyhow::bail!("BEV features must be 3-D or 4-D, got rank {rank}"),
            }
        }
        None => (0..args.frames)
            .map(|_| Tensor::randn(0f32, 1.0, (args.batch_size, h * w, e), device))
            .collect::<candle_core::Result<Vec<_>>>()?,
    };
    for frame in &frames {
        if frame.dim(1)? != h * w || frame.dim(2)? != e {
            anyhow::bail!(
                "BEV frame {:?} does not match grid {}x{} with width {}",
                frame.dims(),
                h,
                w,
                e
            );
        }
    }
    Ok(frames)
}

fn export_frame(
    dir: &Path,
    index: usize,
    output: &FrameOutput,
    detections: &[Vec<BevDetection>],
    map_detections: &[Vec<BevDetection>],
    grid: (usize, usize),
) -> anyhow::Result<()> {
    let prefix = dir.join(format!("frame_{index:03}"));
    let path = |suffix: &str| PathBuf::from(format!("{}_{suffix}", prefix.display()));

    debug::write_npy(path("detections.npy"), &output.tracks.detections)?;
    debug::write_npy(path("track_mask.npy"), &output.track_mask)?;
    debug::write_npy(path("map_masks.npy"), &output.map.masks)?;

    if let Some(frame) = detections.first() {
        visualize::render_detections(frame, None, grid, 4)?.save(path("agents.png"))?;
    }
    if let Some(frame) = map_detections.first() {
        let masks = output.map.masks.i(0)?;
        visualize::render_detections(frame, Some(&masks), grid, 4)?.save(path("map.png"))?;
    }
    if let Some(occupancy) = &output.occupancy {
        debug::write_npy(path("occupancy.npy"), &occupancy.occupancies)?;
        // first agent of the first batch element: [T, H, W]
        let first = occupancy.occupancies.i((0, 0))?;
        visualize::render_occupancy(&first, 4)?.save(path("occupancy.png"))?;
    }
    Ok(())
}

pub fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let device = device(args.cpu)?;
    tracing::info!(?device, "using device");

    let config = match &args.config {
        Some(path) => PerceptionConfig::from_json_file(path)
            .with_context(|| format!("loading config from {path:?}"))?,
        None => args.which.config(),
    };
    config.validate()?;
    tracing::info!(
        embed_dim = config.embed_dim(),
        bev = ?config.trackformer.bev_feature_shape,
        max_detections = config.trackformer.max_detections,
        pred_horizon = config.occformer.pred_horizon,
        "model config"
    );

    // Keeps randomly initialised weights alive for the lifetime of the model
    let varmap = VarMap::new();
    let vb = match &args.model {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Model weights not found at {:?}", path);
            }
            tracing::info!(?path, "loading weights");
            unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)? }
        }
        None => {
            tracing::info!("no weights given, using random initialisation");
            VarBuilder::from_varmap(&varmap, DType::F32, &device)
        }
    };
    let model = BevPerception::load(&config, vb)?;
    let config = model.config();

    let frames = load_frames(&args, config, &device)?;
    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)?;
    }

    let motion = TiledMotionQueries {
        num_modes: config.occformer.num_modes,
        jitter: args.motion_jitter,
    };
    let grid = config.trackformer.bev_feature_shape;
    let mut state = PerceptionState::default();
    let mut summaries = Vec::with_capacity(frames.len());

    for (index, bev) in frames.iter().enumerate() {
        let (output, next) = model.step(bev, &state, Some(&motion), args.train)?;

        let detections = decode_detections(
            &output.tracks.detections,
            model.trackformer().detection_head(),
            grid,
            args.score_threshold,
            Some(&output.tracks.padding_mask),
        )?;
        let map_detections = decode_detections(
            &output.map.detections,
            model.mapformer().trackformer().detection_head(),
            grid,
            args.score_threshold,
            Some(&output.map.padding_mask),
        )?;
        for det in detections.iter().flatten().take(5) {
            tracing::info!(frame = index, "{det}");
        }

        let mut stats = vec![
            ("detections".to_string(), TensorStats::log("detections", &output.tracks.detections)?),
            ("map_masks".to_string(), TensorStats::log("map_masks", &output.map.masks)?),
        ];
        if let Some(occupancy) = &output.occupancy {
            stats.push((
                "occupancy".to_string(),
                TensorStats::log("occupancy", &occupancy.occupancies)?,
            ));
        }

        if let Some(dir) = &args.output_dir {
            export_frame(dir, index, &output, &detections, &map_detections, grid)?;
        }

        summaries.push(FrameSummary {
            frame: index,
            num_queries: output.tracks.num_queries()?,
            confirmed_agents: next
                .agents
                .as_ref()
                .map(|s| s.num_confirmed())
                .transpose()?
                .unwrap_or_default(),
            num_forecast_agents: match &output.agents {
                Some(agents) => agents.num_agents()?,
                None => 0,
            },
            detections,
            map_detections,
            stats,
        });
        state = next;
    }

    if let Some(dir) = &args.output_dir {
        let path = dir.join("summary.json");
        let file = std::fs::File::create(&path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &summaries)?;
        tracing::info!(?path, "summary written");
    }
    Ok(())
}
