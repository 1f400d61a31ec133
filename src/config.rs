//! Perception Head Configuration
//!
//! This module defines the configuration structures for the TrackFormer, MapFormer and
//! OccFormer heads, plus presets for the model variants exposed on the command line.
//! All values are constructor-time only.

use std::path::Path;

use candle_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of box parameters emitted per query in 3-D mode
/// (cx, cy, cz, w, l, h, sin yaw, cos yaw, vx, vy).
pub const BOX_PARAMS_3D: usize = 10;

/// Number of box parameters emitted per query in 2-D mode
/// (cx, cy, w, l, sin yaw, cos yaw).
pub const BOX_PARAMS_2D: usize = 6;

/// Configuration for the detection / tracking decoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackFormerConfig {
    /// Number of attention heads (self attention and deformable attention)
    pub num_heads: usize,
    /// Query / BEV feature width
    pub embed_dim: usize,
    /// Number of stacked decoder layers
    pub num_layers: usize,
    /// Number of object classes predicted by the detection head
    pub num_classes: usize,
    /// Sampling points per head for deformable attention
    pub num_ref_points: usize,
    /// Hidden width of the feed-forward block
    pub dim_feedforward: usize,
    /// Dropout probability, only active in training mode
    pub dropout: f32,
    /// Scale applied to learned sampling offsets (in BEV cells)
    pub offset_scale: f64,
    /// Number of fixed detection query slots
    pub max_detections: usize,
    /// Learnable detection query table (fixed sinusoidal otherwise)
    pub learnable_pe: bool,
    /// BEV grid shape (H, W)
    pub bev_feature_shape: (usize, usize),
    /// Confidence a detection must exceed to be carried as a track
    pub track_threshold: f32,
    /// 3-D box parameters when true, 2-D otherwise
    pub det_3d: bool,
}

impl Default for TrackFormerConfig {
    fn default() -> Self {
        Self {
            num_heads: 8,
            embed_dim: 256,
            num_layers: 6,
            num_classes: 10,
            num_ref_points: 4,
            dim_feedforward: 512,
            dropout: 0.1,
            offset_scale: 1.0,
            max_detections: 900,
            learnable_pe: true,
            bev_feature_shape: (200, 200),
            track_threshold: 0.5,
            det_3d: true,
        }
    }
}

impl TrackFormerConfig {
    /// Number of box parameters for the configured detection mode
    pub fn num_box_params(&self) -> usize {
        if self.det_3d {
            BOX_PARAMS_3D
        } else {
            BOX_PARAMS_2D
        }
    }

    /// Width of the detection head output without segmentation coefficients
    pub fn num_det_params(&self) -> usize {
        self.num_classes + self.num_box_params()
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            candle_core::bail!(
                "trackformer embed_dim {} must be divisible by num_heads {}",
                self.embed_dim,
                self.num_heads
            );
        }
        if self.num_layers == 0 {
            candle_core::bail!("trackformer needs at least one decoder layer");
        }
        if self.num_classes == 0 || self.max_detections == 0 || self.num_ref_points == 0 {
            candle_core::bail!(
                "trackformer num_classes ({}), max_detections ({}) and num_ref_points ({}) must be non-zero",
                self.num_classes,
                self.max_detections,
                self.num_ref_points
            );
        }
        if !(0.0..=1.0).contains(&self.track_threshold) {
            candle_core::bail!(
                "track_threshold must be in [0, 1], got {}",
                self.track_threshold
            );
        }
        let (h, w) = self.bev_feature_shape;
        if h == 0 || w == 0 {
            candle_core::bail!("empty BEV grid {:?}", self.bev_feature_shape);
        }
        Ok(())
    }
}

/// Configuration for the instance segmentation head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapFormerConfig {
    /// Underlying detection / tracking decoder
    pub trackformer: TrackFormerConfig,
    /// Number of mask prototypes (and per-query mask coefficients)
    pub num_seg_coeffs: usize,
    /// Hidden channel width of the prototype generator
    pub seg_hidden_channels: usize,
}

impl Default for MapFormerConfig {
    fn default() -> Self {
        Self {
            trackformer: TrackFormerConfig::default(),
            num_seg_coeffs: 32,
            seg_hidden_channels: 256,
        }
    }
}

impl MapFormerConfig {
    pub fn validate(&self) -> Result<()> {
        self.trackformer.validate()?;
        if self.num_seg_coeffs == 0 {
            candle_core::bail!("mapformer num_seg_coeffs must be > 0");
        }
        if self.seg_hidden_channels == 0 {
            candle_core::bail!("mapformer seg_hidden_channels must be > 0");
        }
        Ok(())
    }
}

/// Configuration for the occupancy forecasting decoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccFormerConfig {
    /// Size of the agent positional embedding table
    pub max_num_agents: usize,
    pub num_heads: usize,
    pub embed_dim: usize,
    /// Motion modes per agent in the incoming motion queries
    pub num_modes: usize,
    /// Forecast timesteps, one decoder layer each
    pub pred_horizon: usize,
    pub dim_feedforward: usize,
    pub dropout: f32,
    pub learnable_pe: bool,
    /// Layers of each temporal-specific MLP
    pub num_tmlp_layers: usize,
    /// BEV grid shape (H, W)
    pub bev_feature_shape: (usize, usize),
    /// Downsampling from the BEV grid to the dense working grid
    pub bev_downsample_scale: usize,
    /// Extra downsampling applied inside each decoder layer for attention
    pub op_attn_scale: usize,
}

impl Default for OccFormerConfig {
    fn default() -> Self {
        Self {
            max_num_agents: 300,
            num_heads: 4,
            embed_dim: 128,
            num_modes: 6,
            pred_horizon: 5,
            dim_feedforward: 512,
            dropout: 0.1,
            learnable_pe: true,
            num_tmlp_layers: 2,
            bev_feature_shape: (200, 200),
            bev_downsample_scale: 4,
            op_attn_scale: 2,
        }
    }
}

impl OccFormerConfig {
    /// Shape of the dense feature map threaded between decoder layers
    pub fn dense_feature_shape(&self) -> (usize, usize) {
        let (h, w) = self.bev_feature_shape;
        (h / self.bev_downsample_scale, w / self.bev_downsample_scale)
    }

    /// Shape of the attention grid inside each decoder layer
    pub fn attention_shape(&self) -> (usize, usize) {
        let (h, w) = self.dense_feature_shape();
        (h / self.op_attn_scale, w / self.op_attn_scale)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            candle_core::bail!(
                "occformer embed_dim {} must be divisible by num_heads {}",
                self.embed_dim,
                self.num_heads
            );
        }
        if self.bev_downsample_scale == 0 || self.op_attn_scale == 0 {
            candle_core::bail!(
                "occformer scales must be > 0 (bev_downsample_scale {}, op_attn_scale {})",
                self.bev_downsample_scale,
                self.op_attn_scale
            );
        }
        if self.pred_horizon == 0 || self.num_modes == 0 || self.max_num_agents == 0 {
            candle_core::bail!(
                "occformer pred_horizon ({}), num_modes ({}) and max_num_agents ({}) must be non-zero",
                self.pred_horizon,
                self.num_modes,
                self.max_num_agents
            );
        }
        if self.num_tmlp_layers == 0 {
            candle_core::bail!("occformer num_tmlp_layers must be > 0");
        }
        let (h, w) = self.bev_feature_shape;
        let factor = self.bev_downsample_scale * self.op_attn_scale;
        if h == 0 || w == 0 || h % factor != 0 || w % factor != 0 {
            candle_core::bail!(
                "BEV grid {:?} must be divisible by bev_downsample_scale * op_attn_scale = {}",
                self.bev_feature_shape,
                factor
            );
        }
        Ok(())
    }
}

/// Configuration for the full multi-head pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionConfig {
    pub trackformer: TrackFormerConfig,
    pub mapformer: MapFormerConfig,
    pub occformer: OccFormerConfig,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self::small()
    }
}

impl PerceptionConfig {
    /// Tiny configuration, mostly for tests and smoke runs on CPU
    pub fn tiny() -> Self {
        let trackformer = TrackFormerConfig {
            num_heads: 2,
            embed_dim: 16,
            num_layers: 2,
            num_classes: 3,
            num_ref_points: 2,
            dim_feedforward: 32,
            dropout: 0.1,
            offset_scale: 1.0,
            max_detections: 6,
            learnable_pe: true,
            bev_feature_shape: (8, 8),
            track_threshold: 0.5,
            det_3d: true,
        };
        let mapformer = MapFormerConfig {
            trackformer: TrackFormerConfig {
                det_3d: false,
                ..trackformer.clone()
            },
            num_seg_coeffs: 4,
            seg_hidden_channels: 8,
        };
        let occformer = OccFormerConfig {
            max_num_agents: 32,
            num_heads: 2,
            embed_dim: 16,
            num_modes: 3,
            pred_horizon: 2,
            dim_feedforward: 32,
            dropout: 0.1,
            learnable_pe: true,
            num_tmlp_layers: 2,
            bev_feature_shape: (8, 8),
            bev_downsample_scale: 2,
            op_attn_scale: 2,
        };
        Self {
            trackformer,
            mapformer,
            occformer,
        }
    }

    /// Small configuration on a 50x50 BEV grid
    pub fn small() -> Self {
        let trackformer = TrackFormerConfig {
            num_heads: 4,
            embed_dim: 128,
            num_layers: 3,
            num_classes: 10,
            num_ref_points: 4,
            dim_feedforward: 256,
            dropout: 0.1,
            offset_scale: 1.0,
            max_detections: 100,
            learnable_pe: true,
            bev_feature_shape: (50, 50),
            track_threshold: 0.5,
            det_3d: true,
        };
        let mapformer = MapFormerConfig {
            trackformer: TrackFormerConfig {
                num_classes: 3,
                max_detections: 50,
                det_3d: false,
                ..trackformer.clone()
            },
            num_seg_coeffs: 16,
            seg_hidden_channels: 64,
        };
        let occformer = OccFormerConfig {
            max_num_agents: 300,
            num_heads: 4,
            embed_dim: 128,
            num_modes: 6,
            pred_horizon: 5,
            dim_feedforward: 256,
            dropout: 0.1,
            learnable_pe: true,
            num_tmlp_layers: 2,
            bev_feature_shape: (50, 50),
            bev_downsample_scale: 5,
            op_attn_scale: 2,
        };
        Self {
            trackformer,
            mapformer,
            occformer,
        }
    }

    /// Full-size configuration on a 200x200 BEV grid
    pub fn base() -> Self {
        let trackformer = TrackFormerConfig::default();
        let mapformer = MapFormerConfig {
            trackformer: TrackFormerConfig {
                num_classes: 3,
                max_detections: 300,
                det_3d: false,
                ..trackformer.clone()
            },
            num_seg_coeffs: 32,
            seg_hidden_channels: 256,
        };
        let occformer = OccFormerConfig {
            max_num_agents: 1200,
            embed_dim: trackformer.embed_dim,
            num_heads: 8,
            ..OccFormerConfig::default()
        };
        Self {
            trackformer,
            mapformer,
            occformer,
        }
    }

    /// Load a configuration from a JSON file.
    ///
    /// The file is overlaid onto [`PerceptionConfig::small`]: any field it omits, at any
    /// depth, keeps the preset value.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let overrides: Value = serde_json::from_reader(std::io::BufReader::new(file))?;
        Self::from_json_value(overrides)
    }

    /// Overlay `overrides` onto the small preset and validate the result
    pub fn from_json_value(overrides: Value) -> anyhow::Result<Self> {
        let mut merged = serde_json::to_value(Self::small())?;
        merge_json(&mut merged, overrides);
        let config: Self = serde_json::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    /// Width shared by all heads
    pub fn embed_dim(&self) -> usize {
        self.trackformer.embed_dim
    }

    pub fn validate(&self) -> Result<()> {
        self.trackformer.validate()?;
        self.mapformer.validate()?;
        self.occformer.validate()?;

        let dims = [
            self.trackformer.embed_dim,
            self.mapformer.trackformer.embed_dim,
            self.occformer.embed_dim,
        ];
        if dims.iter().any(|&d| d != dims[0]) {
            candle_core::bail!("heads disagree on embed_dim: {:?}", dims);
        }
        let shapes = [
            self.trackformer.bev_feature_shape,
            self.mapformer.trackformer.bev_feature_shape,
            self.occformer.bev_feature_shape,
        ];
        if shapes.iter().any(|&s| s != shapes[0]) {
            candle_core::bail!("heads disagree on bev_feature_shape: {:?}", shapes);
        }
        Ok(())
    }
}

/// Recursively overlay the objects of `overrides` onto `base`; other values replace
fn merge_json(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        PerceptionConfig::tiny().validate().unwrap();
        PerceptionConfig::small().validate().unwrap();
        PerceptionConfig::base().validate().unwrap();
    }

    #[test]
    fn test_det_params() {
        let config = PerceptionConfig::tiny();
        assert_eq!(config.trackformer.num_det_params(), 3 + BOX_PARAMS_3D);
        assert_eq!(config.mapformer.trackformer.num_det_params(), 3 + BOX_PARAMS_2D);
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let config = TrackFormerConfig {
            num_heads: 3,
            embed_dim: 16,
            ..TrackFormerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_indivisible_bev_grid() {
        let config = OccFormerConfig {
            bev_feature_shape: (50, 50),
            bev_downsample_scale: 4,
            op_attn_scale: 2,
            ..OccFormerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_seg_coeffs() {
        let config = MapFormerConfig {
            num_seg_coeffs: 0,
            ..MapFormerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_mismatched_heads() {
        let mut config = PerceptionConfig::tiny();
        config.occformer.embed_dim = 32;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_occformer_shapes() {
        let config = OccFormerConfig::default();
        assert_eq!(config.dense_feature_shape(), (50, 50));
        assert_eq!(config.attention_shape(), (25, 25));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = serde_json::json!({
            "trackformer": { "num_layers": 2 },
            "mapformer": { "trackformer": { "max_detections": 20 } }
        });
        let config = PerceptionConfig::from_json_value(json).unwrap();
        config.validate().unwrap();

        let small = PerceptionConfig::small();
        assert_eq!(config.trackformer.num_layers, 2);
        assert_eq!(config.trackformer.embed_dim, small.trackformer.embed_dim);
        assert_eq!(config.trackformer.bev_feature_shape, (50, 50));
        // nested head keeps its own preset values, not the agent head's
        assert_eq!(config.mapformer.trackformer.max_detections, 20);
        assert_eq!(config.mapformer.trackformer.num_classes, 3);
        assert!(!config.mapformer.trackformer.det_3d);
        assert_eq!(config.mapformer.num_seg_coeffs, small.mapformer.num_seg_coeffs);
        assert_eq!(config.occformer, small.occformer);
    }

    #[test]
    fn test_json_file_round_trip_and_rejection() {
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "trackformer": { "num_layers": 2 } }"#).unwrap();
        let config = PerceptionConfig::from_json_file(&path).unwrap();
        assert_eq!(config.trackformer.num_layers, 2);

        let path = dir.path().join("tiny.json");
        std::fs::write(&path, serde_json::to_string(&PerceptionConfig::tiny()).unwrap()).unwrap();
        assert_eq!(
            PerceptionConfig::from_json_file(&path).unwrap(),
            PerceptionConfig::tiny()
        );

        // only one head moved to a different grid
        let path = dir.path().join("mismatch.json");
        std::fs::write(&path, r#"{ "occformer": { "bev_feature_shape": [40, 40] } }"#).unwrap();
        assert!(PerceptionConfig::from_json_file(&path).is_err());
    }
}
