//! MapFormer: TrackFormer with a prototype-mask instance segmentation branch
//!
//! Per-object masks are a linear combination of a small set of prototype masks
//! computed from the BEV features, weighted by mask coefficients emitted as extra
//! channels of the detection head.

use candle_core::{ModuleT, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::config::MapFormerConfig;
use crate::model::layers::ConvBNorm;
use crate::model::trackformer::{TrackFormer, TrackFormerOutput};

/// Three conv blocks producing `out_channels` prototype masks at input resolution
#[derive(Debug, Clone)]
pub struct ProtoSegModule {
    conv1: ConvBNorm,
    conv2: ConvBNorm,
    conv3: ConvBNorm,
}

impl ProtoSegModule {
    pub fn load(
        in_channels: usize,
        out_channels: usize,
        hidden_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            conv1: ConvBNorm::load(in_channels, hidden_channels, 3, 1, vb.pp("conv1"))?,
            conv2: ConvBNorm::load(hidden_channels, hidden_channels, 3, 1, vb.pp("conv2"))?,
            conv3: ConvBNorm::load(hidden_channels, out_channels, 1, 1, vb.pp("conv3"))?,
        })
    }
}

impl ModuleT for ProtoSegModule {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv1.forward_t(xs, train)?;
        let xs = self.conv2.forward_t(&xs, train)?;
        self.conv3.forward_t(&xs, train)
    }
}

/// Result of one MapFormer pass
#[derive(Debug, Clone)]
pub struct MapFormerOutput {
    /// Final-layer query embeddings [N, Q, E]
    pub queries: Tensor,
    /// [N, Q] u8, 0 for padded track slots
    pub padding_mask: Tensor,
    /// Detections without mask coefficients [N, Q, num_classes + box params]
    pub detections: Tensor,
    /// Instance masks [N, Q, H, W]
    pub masks: Tensor,
    /// Recomputed confirmation mask for the next frame [N, Q]
    pub track_mask: Tensor,
    /// Per-layer detections including coefficients, training only
    pub layers_detections: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct MapFormer {
    config: MapFormerConfig,
    trackformer: TrackFormer,
    proto_seg_module: ProtoSegModule,
}

impl MapFormer {
    pub fn load(config: &MapFormerConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let trackformer =
            TrackFormer::load_with_seg_coeffs(&config.trackformer, config.num_seg_coeffs, vb.clone())?;
        let proto_seg_module = ProtoSegModule::load(
            config.trackformer.embed_dim,
            config.num_seg_coeffs,
            config.seg_hidden_channels,
            vb.pp("proto_seg_module"),
        )?;
        Ok(Self {
            config: config.clone(),
            trackformer,
            proto_seg_module,
        })
    }

    pub fn config(&self) -> &MapFormerConfig {
        &self.config
    }

    pub fn trackformer(&self) -> &TrackFormer {
        &self.trackformer
    }

    /// Prototype masks from BEV features [N, H*W, E] -> [N, K, H, W]
    pub fn prototypes(&self, bev_features: &Tensor, train: bool) -> Result<Tensor> {
        let (n, _, e) = bev_features.dims3()?;
        let (h, w) = self.config.trackformer.bev_feature_shape;
        let spatial = bev_features
            .transpose(1, 2)?
            .contiguous()?
            .reshape((n, e, h, w))?;
        self.proto_seg_module.forward_t(&spatial, train)
    }

    /// Forward pass, same inputs as [`TrackFormer::forward_t`]
    pub fn forward_t(
        &self,
        bev_features: &Tensor,
        track_queries: Option<&Tensor>,
        track_queries_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<MapFormerOutput> {
        let output =
            self.trackformer
                .forward_t(bev_features, track_queries, track_queries_mask, train)?;
        let track_mask = self.trackformer.track_mask(&output)?;
        let TrackFormerOutput {
            queries,
            padding_mask,
            detections,
            layers_detections,
        } = output;

        let coeffs = match self.trackformer.detection_head().seg_coeffs(&detections)? {
            Some(coeffs) => coeffs,
            None => candle_core::bail!("mapformer detection head predicts no mask coefficients"),
        };
        let detections =
            detections.narrow(D::Minus1, 0, self.config.trackformer.num_det_params())?;

        let protos = self.prototypes(bev_features, train)?;
        let (n, k, h, w) = protos.dims4()?;
        let num_queries = coeffs.dim(1)?;
        // [N, Q, K] x [N, K, H*W] -> [N, Q, H, W]
        let masks = coeffs
            .contiguous()?
            .matmul(&protos.reshape((n, k, h * w))?)?
            .reshape((n, num_queries, h, w))?;

        Ok(MapFormerOutput {
            queries,
            padding_mask,
            detections,
            masks,
            track_mask,
            layers_detections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackFormerConfig;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn test_config(max_detections: usize) -> MapFormerConfig {
        MapFormerConfig {
            trackformer: TrackFormerConfig {
                num_heads: 2,
                embed_dim: 8,
                num_layers: 2,
                num_classes: 2,
                num_ref_points: 2,
                dim_feedforward: 16,
                max_detections,
                bev_feature_shape: (6, 4),
                det_3d: false,
                ..Default::default()
            },
            num_seg_coeffs: 5,
            seg_hidden_channels: 8,
        }
    }

    #[test]
    fn test_mask_shapes_follow_bev_grid() {
        let device = Device::Cpu;
        for max_detections in [1usize, 4] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let model = MapFormer::load(&test_config(max_detections), vb).unwrap();

            let bev = Tensor::randn(0f32, 1.0, (2, 24, 8), &device).unwrap();
            let tracks = Tensor::randn(0f32, 1.0, (2, 3, 8), &device).unwrap();
            let mask = Tensor::new(&[[1u8, 1, 0], [1, 0, 0]], &device).unwrap();
            let output = model
                .forward_t(&bev, Some(&tracks), Some(&mask), false)
                .unwrap();

            let q = 2 + max_detections;
            assert_eq!(output.masks.dims(), &[2, q, 6, 4]);
            // 2 classes + 6 box params, coefficients trimmed
            assert_eq!(output.detections.dims(), &[2, q, 8]);
            assert_eq!(output.track_mask.dims(), &[2, q]);
            assert_eq!(output.queries.dims(), &[2, q, 8]);
            assert!(output.layers_detections.is_none());
        }
    }

    #[test]
    fn test_prototype_channels() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MapFormer::load(&test_config(3), vb).unwrap();

        let bev = Tensor::randn(0f32, 1.0, (1, 24, 8), &device).unwrap();
        let protos = model.prototypes(&bev, false).unwrap();
        assert_eq!(protos.dims(), &[1, 5, 6, 4]);
        assert_eq!(model.trackformer().detection_head().num_seg_coeffs(), 5);
    }

    #[test]
    fn test_training_keeps_coefficients_in_layer_outputs() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MapFormer::load(&test_config(3), vb).unwrap();

        let bev = Tensor::randn(0f32, 1.0, (2, 24, 8), &device).unwrap();
        let output = model.forward_t(&bev, None, None, true).unwrap();
        assert_eq!(output.masks.dims(), &[2, 3, 6, 4]);
        assert_eq!(
            output.layers_detections.unwrap().dims(),
            &[2, 2, 3, 8 + 5]
        );
    }

    #[test]
    fn test_zero_coefficients_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = MapFormerConfig {
            num_seg_coeffs: 0,
            ..test_config(3)
        };
        assert!(MapFormer::load(&config, vb).is_err());
    }
}
