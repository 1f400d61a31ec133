//! BEV perception heads on Candle
//!
//! Detection and tracking (`TrackFormer`), map instance segmentation (`MapFormer`)
//! and per-agent occupancy forecasting (`OccFormer`) over a shared bird's-eye-view
//! feature map, plus a multi-frame driver that carries track queries between frames.

pub mod config;
pub mod debug;
pub mod detection;
pub mod model;
pub mod pipeline;
pub mod visualize;

pub use config::{MapFormerConfig, OccFormerConfig, PerceptionConfig, TrackFormerConfig};
pub use detection::{decode_detections, BevDetection};
pub use pipeline::{BevPerception, FrameOutput, MotionQueryProvider, PerceptionState, TrackState};
