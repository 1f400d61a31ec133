//! TrackFormer: detection + tracking decoder
//!
//! Every frame the decoder sees `[carried track queries ; learned detection queries]`.
//! Track queries come from the previous frame's output, filtered by a confirmation
//! mask and right-padded so that every batch element has the same number of tracks.

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::config::TrackFormerConfig;
use crate::model::attention::{standard_ref_points, DeformableAttention, MultiheadAttention};
use crate::model::detection_head::DetectionHead;
use crate::model::layers::{valid_mask, AddNorm, Mlp, PosEmbedding1D};

/// Gather-and-pad plan for ragged per-sample track sets
///
/// Built once from a validity mask of shape [N, T]. Valid rows of each batch element
/// are gathered in order; shorter elements are right-padded with zero rows up to the
/// batch-wide maximum. A single `index_select` over the flattened tracks (plus one
/// appended zero row used as the padding source) does the whole batch.
#[derive(Debug, Clone)]
pub struct TrackPadding {
    batch_size: usize,
    num_tracks: usize,
    max_valid: usize,
    valid_counts: Vec<usize>,
    /// Flat source row per output slot, `batch_size * num_tracks` for padding
    indices: Vec<u32>,
    mask: Tensor,
}

impl TrackPadding {
    /// Plan from a u8 [N, T] validity mask (non-zero = valid)
    pub fn from_mask(mask: &Tensor) -> Result<Self> {
        let num_tracks = match mask.dims() {
            &[_, t] => t,
            dims => candle_core::bail!("track mask must be [N, T], got {:?}", dims),
        };
        if mask.dtype() != DType::U8 {
            candle_core::bail!("track mask must be u8, got {:?}", mask.dtype());
        }
        let rows = mask.to_vec2::<u8>()?;
        Self::from_rows(&rows, num_tracks, mask.device())
    }

    fn from_rows(rows: &[Vec<u8>], num_tracks: usize, device: &Device) -> Result<Self> {
        let batch_size = rows.len();
        let valid: Vec<Vec<u32>> = rows
            .iter()
            .enumerate()
            .map(|(b, row)| {
                row.iter()
                    .enumerate()
                    .filter(|&(_, &v)| v != 0)
                    .map(|(i, _)| (b * num_tracks + i) as u32)
                    .collect()
            })
            .collect();
        let valid_counts: Vec<usize> = valid.iter().map(Vec::len).collect();
        let max_valid = valid_counts.iter().copied().max().unwrap_or(0);

        let pad_row = (batch_size * num_tracks) as u32;
        let mut indices = Vec::with_capacity(batch_size * max_valid);
        let mut mask = Vec::with_capacity(batch_size * max_valid);
        for rows in &valid {
            indices.extend_from_slice(rows);
            indices.extend(std::iter::repeat(pad_row).take(max_valid - rows.len()));
            mask.extend(std::iter::repeat(1u8).take(rows.len()));
            mask.extend(std::iter::repeat(0u8).take(max_valid - rows.len()));
        }
        let mask = Tensor::from_vec(mask, (batch_size, max_valid), device)?;

        Ok(Self {
            batch_size,
            num_tracks,
            max_valid,
            valid_counts,
            indices,
            mask,
        })
    }

    /// Largest valid-track count across the batch
    pub fn max_valid(&self) -> usize {
        self.max_valid
    }

    /// Valid-track count per batch element
    pub fn valid_counts(&self) -> &[usize] {
        &self.valid_counts
    }

    /// [N, max_valid] u8, 1 for gathered tracks and 0 for padding
    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    /// Source track positions of the gathered rows, per batch element
    pub fn source_positions(&self) -> Vec<Vec<usize>> {
        self.valid_counts
            .iter()
            .enumerate()
            .map(|(b, &count)| {
                let start = b * self.max_valid;
                self.indices[start..start + count]
                    .iter()
                    .map(|&i| i as usize - b * self.num_tracks)
                    .collect()
            })
            .collect()
    }

    /// Gather the valid rows of `tracks` [N, T, E] into [N, max_valid, E]
    pub fn gather(&self, tracks: &Tensor) -> Result<Tensor> {
        let (n, t, e) = tracks.dims3()?;
        if n != self.batch_size || t != self.num_tracks {
            candle_core::bail!(
                "tracks shape {:?} does not match mask [{}, {}]",
                tracks.dims(),
                self.batch_size,
                self.num_tracks
            );
        }
        if self.max_valid == 0 {
            return Tensor::zeros((n, 0, e), tracks.dtype(), tracks.device());
        }
        let pad = Tensor::zeros((1, e), tracks.dtype(), tracks.device())?;
        let source = Tensor::cat(&[&tracks.reshape((n * t, e))?, &pad], 0)?;
        let indices = Tensor::new(self.indices.as_slice(), tracks.device())?;
        source
            .index_select(&indices, 0)?
            .reshape((n, self.max_valid, e))
    }
}

/// Add the detection queries onto the trailing detection slots of the query set
fn reinject_detection_queries(queries: &Tensor, det_queries: &Tensor) -> Result<Tensor> {
    let num_queries = queries.dim(1)?;
    let num_det = det_queries.dim(1)?;
    if num_det > num_queries {
        candle_core::bail!(
            "{} detection queries do not fit in a query set of {}",
            num_det,
            num_queries
        );
    }
    let num_tracks = num_queries - num_det;
    let det_part = queries
        .narrow(1, num_tracks, num_det)?
        .broadcast_add(det_queries)?;
    if num_tracks == 0 {
        return Ok(det_part);
    }
    Tensor::cat(&[&queries.narrow(1, 0, num_tracks)?, &det_part], 1)
}

/// One decoder layer: self-attention, deformable cross-attention over BEV, FFN
#[derive(Debug, Clone)]
pub struct TrackFormerDecoderLayer {
    self_attention: MultiheadAttention,
    addnorm1: AddNorm,
    deform_attention: DeformableAttention,
    addnorm2: AddNorm,
    mlp: Mlp,
    addnorm3: AddNorm,
    bev_feature_shape: (usize, usize),
}

impl TrackFormerDecoderLayer {
    pub fn load(config: &TrackFormerConfig, vb: VarBuilder) -> Result<Self> {
        let e = config.embed_dim;
        Ok(Self {
            self_attention: MultiheadAttention::load(
                e,
                config.num_heads,
                config.dropout,
                vb.pp("self_attention"),
            )?,
            addnorm1: AddNorm::load(e, config.dropout, vb.pp("addnorm1"))?,
            deform_attention: DeformableAttention::load(
                e,
                1,
                config.num_heads,
                config.num_ref_points,
                config.offset_scale,
                config.dropout,
                vb.pp("deform_attention"),
            )?,
            addnorm2: AddNorm::load(e, config.dropout, vb.pp("addnorm2"))?,
            mlp: Mlp::simple(e, e, config.dim_feedforward, vb.pp("mlp"))?,
            addnorm3: AddNorm::load(e, config.dropout, vb.pp("addnorm3"))?,
            bev_feature_shape: config.bev_feature_shape,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `queries` - [N, Q, E] query set, tracks first
    /// * `bev_features` - [N, H*W, E]
    /// * `ref_points` - [N, Q, 1, 2] in BEV cells
    /// * `det_queries` - [N, M, E] unmodified detection queries (M <= Q)
    /// * `padding_mask` - [N, Q] u8, 0 for padded track slots
    pub fn forward_t(
        &self,
        queries: &Tensor,
        bev_features: &Tensor,
        ref_points: &Tensor,
        det_queries: &Tensor,
        padding_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (h, w) = self.bev_feature_shape;

        let q_and_k = reinject_detection_queries(queries, det_queries)?;
        let out1 = self.self_attention.forward_t(
            &q_and_k,
            &q_and_k,
            queries,
            Some(padding_mask),
            None,
            train,
        )?;
        let out2 = self.addnorm1.forward_t(queries, &out1, train)?;

        let aug_out2 = reinject_detection_queries(&out2, det_queries)?;
        let out3 = self.deform_attention.forward_t(
            &aug_out2,
            ref_points,
            bev_features,
            &[(h, w)],
            &[0],
            Some(padding_mask),
            train,
        )?;
        let out4 = self.addnorm2.forward_t(&out2, &out3, train)?;

        let out5 = self.mlp.forward(&out4)?;
        self.addnorm3.forward_t(&out4, &out5, train)
    }
}

/// Result of one TrackFormer pass
#[derive(Debug, Clone)]
pub struct TrackFormerOutput {
    /// Final-layer query embeddings [N, Q, E], the next frame's track queries
    pub queries: Tensor,
    /// [N, Q] u8, 0 for padded track slots
    pub padding_mask: Tensor,
    /// Final-layer detections [N, Q, D]
    pub detections: Tensor,
    /// Per-layer detections [num_layers, N, Q, D], training only
    pub layers_detections: Option<Tensor>,
}

impl TrackFormerOutput {
    pub fn num_queries(&self) -> Result<usize> {
        let (_, num_queries, _) = self.queries.dims3()?;
        Ok(num_queries)
    }
}

#[derive(Debug, Clone)]
pub struct TrackFormer {
    config: TrackFormerConfig,
    detection_pos_emb: PosEmbedding1D,
    decoder_modules: Vec<TrackFormerDecoderLayer>,
    detection_module: DetectionHead,
}

impl TrackFormer {
    pub fn load(config: &TrackFormerConfig, vb: VarBuilder) -> Result<Self> {
        Self::load_with_seg_coeffs(config, 0, vb)
    }

    /// Load with a detection head that also predicts `num_seg_coeffs` mask coefficients
    pub fn load_with_seg_coeffs(
        config: &TrackFormerConfig,
        num_seg_coeffs: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        let detection_pos_emb = PosEmbedding1D::load(
            config.max_detections,
            config.embed_dim,
            config.learnable_pe,
            vb.pp("detection_pos_emb"),
        )?;
        let decoder_modules = (0..config.num_layers)
            .map(|i| TrackFormerDecoderLayer::load(config, vb.pp(format!("decoder_modules.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let detection_module = DetectionHead::load(
            config.embed_dim,
            config.num_classes,
            config.num_box_params(),
            num_seg_coeffs,
            vb.pp("detection_module"),
        )?;

        Ok(Self {
            config: config.clone(),
            detection_pos_emb,
            decoder_modules,
            detection_module,
        })
    }

    pub fn config(&self) -> &TrackFormerConfig {
        &self.config
    }

    pub fn detection_head(&self) -> &DetectionHead {
        &self.detection_module
    }

    /// One reference point per query on a uniform grid over the BEV plane: [N, Q, 1, 2]
    pub fn reference_points(
        &self,
        batch_size: usize,
        num_queries: usize,
        device: &Device,
    ) -> Result<Tensor> {
        standard_ref_points(
            self.config.bev_feature_shape,
            batch_size,
            num_queries,
            false,
            device,
        )?
        .unsqueeze(2)
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `bev_features` - [N, H*W, E]
    /// * `track_queries` - optional [N, T, E] output queries of the previous frame
    /// * `track_queries_mask` - optional [N, T] confirmation mask; all tracks are kept
    ///   when absent
    pub fn forward_t(
        &self,
        bev_features: &Tensor,
        track_queries: Option<&Tensor>,
        track_queries_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<TrackFormerOutput> {
        let (batch_size, bev_len, embed_dim) = bev_features.dims3()?;
        let (h, w) = self.config.bev_feature_shape;
        if embed_dim != self.config.embed_dim {
            candle_core::bail!(
                "BEV feature width {} != embed_dim {}",
                embed_dim,
                self.config.embed_dim
            );
        }
        if bev_len != h * w {
            candle_core::bail!(
                "BEV feature length {} != {}x{} grid",
                bev_len,
                h,
                w
            );
        }
        let device = bev_features.device();

        let num_det = self.config.max_detections;
        let detection_queries = self
            .detection_pos_emb
            .forward()
            .to_dtype(bev_features.dtype())?
            .unsqueeze(0)?
            .broadcast_as((batch_size, num_det, embed_dim))?
            .contiguous()?;
        let detection_mask = valid_mask((batch_size, num_det), device)?;

        let (queries, padding_mask) = match (track_queries, track_queries_mask) {
            (Some(tracks), mask) => {
                let (tn, tt, te) = tracks.dims3()?;
                if te != embed_dim || tn != batch_size {
                    candle_core::bail!(
                        "track queries shape {:?} incompatible with BEV features {:?}",
                        tracks.dims(),
                        bev_features.dims()
                    );
                }
                let plan = match mask {
                    Some(mask) => {
                        if mask.dims() != [tn, tt] {
                            candle_core::bail!(
                                "track mask shape {:?} != track queries [{}, {}]",
                                mask.dims(),
                                tn,
                                tt
                            );
                        }
                        TrackPadding::from_mask(mask)?
                    }
                    None => TrackPadding::from_mask(&valid_mask((tn, tt), device)?)?,
                };
                if plan.max_valid() == 0 {
                    (detection_queries.clone(), detection_mask)
                } else {
                    let tracks = plan.gather(&tracks.to_dtype(bev_features.dtype())?)?;
                    (
                        Tensor::cat(&[&tracks, &detection_queries], 1)?,
                        Tensor::cat(&[plan.mask(), &detection_mask], 1)?,
                    )
                }
            }
            (None, Some(_)) => {
                candle_core::bail!("track mask supplied without track queries")
            }
            (None, None) => (detection_queries.clone(), detection_mask),
        };

        let num_queries = queries.dim(1)?;
        tracing::debug!(
            batch_size,
            num_tracks = num_queries - num_det,
            num_queries,
            "trackformer query set"
        );

        let ref_points = self
            .reference_points(batch_size, num_queries, device)?
            .to_dtype(bev_features.dtype())?;

        let last = self.decoder_modules.len() - 1;
        let mut output = queries;
        let mut layers_detections = Vec::new();
        for (i, layer) in self.decoder_modules.iter().enumerate() {
            output = layer.forward_t(
                &output,
                bev_features,
                &ref_points,
                &detection_queries,
                &padding_mask,
                train,
            )?;
            if train || i == last {
                layers_detections.push(self.detection_module.forward(&output)?);
            }
        }

        let detections = match layers_detections.last() {
            Some(detections) => detections.clone(),
            None => candle_core::bail!("TrackFormer has no decoder layers"),
        };
        let layers_detections = if train {
            Some(Tensor::stack(&layers_detections, 0)?)
        } else {
            None
        };

        Ok(TrackFormerOutput {
            queries: output,
            padding_mask,
            detections,
            layers_detections,
        })
    }

    /// Confirmation mask for the next frame: [N, Q] u8
    ///
    /// A query is confirmed when its best class probability exceeds `track_threshold`
    /// and it is not a padding slot.
    pub fn track_mask(&self, output: &TrackFormerOutput) -> Result<Tensor> {
        let logits = self.detection_module.class_logits(&output.detections)?;
        let scores = candle_nn::ops::sigmoid(&logits)?.max(D::Minus1)?;
        let confirmed = scores.gt(self.config.track_threshold as f64)?;
        confirmed.mul(&output.padding_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;
    use candle_nn::VarMap;

    fn test_config(max_detections: usize) -> TrackFormerConfig {
        TrackFormerConfig {
            num_heads: 2,
            embed_dim: 8,
            num_layers: 2,
            num_classes: 3,
            num_ref_points: 2,
            dim_feedforward: 16,
            max_detections,
            bev_feature_shape: (4, 4),
            ..Default::default()
        }
    }

    fn bev(batch_size: usize, device: &Device) -> Tensor {
        Tensor::randn(0f32, 1.0, (batch_size, 16, 8), device).unwrap()
    }

    #[test]
    fn test_padding_drops_invalid_tracks() {
        let device = Device::Cpu;
        // tracks a = 1, b = 2, c = 3
        let tracks = Tensor::new(&[[[1f32, 1.], [2., 2.], [3., 3.]]], &device).unwrap();
        let mask = Tensor::new(&[[1u8, 0, 1]], &device).unwrap();

        let plan = TrackPadding::from_mask(&mask).unwrap();
        let gathered = plan.gather(&tracks).unwrap();
        assert_eq!(
            gathered.to_vec3::<f32>().unwrap(),
            vec![vec![vec![1., 1.], vec![3., 3.]]]
        );
        assert_eq!(plan.mask().to_vec2::<u8>().unwrap(), vec![vec![1, 1]]);
    }

    #[test]
    fn test_padding_ragged_batch() {
        let device = Device::Cpu;
        let tracks = Tensor::new(
            &[[[1f32], [2.], [3.]], [[4.], [5.], [6.]]],
            &device,
        )
        .unwrap();
        let mask = Tensor::new(&[[1u8, 0, 1], [0, 1, 0]], &device).unwrap();

        let plan = TrackPadding::from_mask(&mask).unwrap();
        assert_eq!(plan.max_valid(), 2);
        assert_eq!(plan.valid_counts(), &[2, 1]);
        assert_eq!(plan.source_positions(), vec![vec![0, 2], vec![1]]);
        let gathered = plan.gather(&tracks).unwrap();
        assert_eq!(
            gathered.to_vec3::<f32>().unwrap(),
            vec![vec![vec![1.], vec![3.]], vec![vec![5.], vec![0.]]]
        );
        assert_eq!(
            plan.mask().to_vec2::<u8>().unwrap(),
            vec![vec![1, 1], vec![1, 0]]
        );
    }

    #[test]
    fn test_padding_all_valid_is_identity() {
        let device = Device::Cpu;
        let tracks = Tensor::randn(0f32, 1.0, (2, 4, 3), &device).unwrap();
        let mask = valid_mask((2, 4), &device).unwrap();

        let plan = TrackPadding::from_mask(&mask).unwrap();
        assert_eq!(plan.max_valid(), 4);
        assert_eq!(plan.mask().to_vec2::<u8>().unwrap(), vec![vec![1u8; 4]; 2]);
        let gathered = plan.gather(&tracks).unwrap();
        assert_eq!(
            gathered.to_vec3::<f32>().unwrap(),
            tracks.to_vec3::<f32>().unwrap()
        );
    }

    #[test]
    fn test_padding_no_valid_tracks() {
        let device = Device::Cpu;
        let mask = Tensor::zeros((2, 3), DType::U8, &device).unwrap();
        let plan = TrackPadding::from_mask(&mask).unwrap();
        assert_eq!(plan.max_valid(), 0);

        let tracks = Tensor::randn(0f32, 1.0, (2, 3, 5), &device).unwrap();
        assert_eq!(plan.gather(&tracks).unwrap().dims(), &[2, 0, 5]);
        assert!(plan
            .gather(&Tensor::randn(0f32, 1.0, (2, 4, 5), &device).unwrap())
            .is_err());
    }

    #[test]
    fn test_reinjection_only_touches_detection_slots() {
        let device = Device::Cpu;
        let queries = Tensor::new(&[[[1f32], [2.], [3.]]], &device).unwrap();
        let det_queries = Tensor::new(&[[[10f32]]], &device).unwrap();
        let out = reinject_detection_queries(&queries, &det_queries).unwrap();
        assert_eq!(
            out.to_vec3::<f32>().unwrap(),
            vec![vec![vec![1.], vec![2.], vec![13.]]]
        );

        // no track slots: every query is a detection slot
        let queries = Tensor::new(&[[[1f32], [2.]]], &device).unwrap();
        let det_queries = Tensor::new(&[[[10f32], [20.]]], &device).unwrap();
        let out = reinject_detection_queries(&queries, &det_queries).unwrap();
        assert_eq!(out.to_vec3::<f32>().unwrap(), vec![vec![vec![11.], vec![22.]]]);

        let too_many = Tensor::new(&[[[1f32], [2.], [3.]]], &device).unwrap();
        assert!(reinject_detection_queries(&det_queries, &too_many).is_err());
    }

    #[test]
    fn test_detection_queries_only() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = TrackFormer::load(&test_config(3), vb).unwrap();

        let output = model.forward_t(&bev(2, &device), None, None, false).unwrap();
        assert_eq!(output.num_queries().unwrap(), 3);
        assert_eq!(output.queries.dims(), &[2, 3, 8]);
        assert_eq!(output.padding_mask.to_vec2::<u8>().unwrap(), vec![vec![1u8; 3]; 2]);
        // 3 classes + 10 box params
        assert_eq!(output.detections.dims(), &[2, 3, 13]);
        assert!(output.layers_detections.is_none());
    }

    #[test]
    fn test_track_queries_are_padded_and_merged() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = TrackFormer::load(&test_config(3), vb).unwrap();

        let tracks = Tensor::randn(0f32, 1.0, (1, 4, 8), &device).unwrap();
        let mask = Tensor::new(&[[1u8, 0, 1, 1]], &device).unwrap();
        let output = model
            .forward_t(&bev(1, &device), Some(&tracks), Some(&mask), false)
            .unwrap();

        assert_eq!(output.num_queries().unwrap(), 3 + 3);
        assert_eq!(
            output.padding_mask.to_vec2::<u8>().unwrap(),
            vec![vec![1u8; 6]]
        );
        assert_eq!(
            model.reference_points(1, output.num_queries().unwrap(), &device).unwrap().dims(),
            &[1, 6, 1, 2]
        );
    }

    #[test]
    fn test_ragged_tracks_keep_padding_slots_masked() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = TrackFormer::load(&test_config(2), vb).unwrap();

        let tracks = Tensor::randn(0f32, 1.0, (2, 3, 8), &device).unwrap();
        let mask = Tensor::new(&[[1u8, 1, 1], [0, 1, 0]], &device).unwrap();
        let output = model
            .forward_t(&bev(2, &device), Some(&tracks), Some(&mask), false)
            .unwrap();

        assert_eq!(output.num_queries().unwrap(), 3 + 2);
        assert_eq!(
            output.padding_mask.to_vec2::<u8>().unwrap(),
            vec![vec![1, 1, 1, 1, 1], vec![1, 0, 0, 1, 1]]
        );

        // Padded slots are never confirmed, whatever their scores
        let track_mask = model.track_mask(&output).unwrap();
        assert_eq!(track_mask.dims(), &[2, 5]);
        let row = track_mask.i(1).unwrap().to_vec1::<u8>().unwrap();
        assert_eq!((row[1], row[2]), (0, 0));
    }

    #[test]
    fn test_training_stacks_every_layer() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = TrackFormerConfig {
            num_layers: 3,
            ..test_config(4)
        };
        let model = TrackFormer::load(&config, vb).unwrap();

        let tracks = Tensor::randn(0f32, 1.0, (2, 2, 8), &device).unwrap();
        let output = model
            .forward_t(&bev(2, &device), Some(&tracks), None, true)
            .unwrap();
        let layers = output.layers_detections.unwrap();
        assert_eq!(layers.dims(), &[3, 2, 6, 13]);
        assert_eq!(output.detections.dims(), &[2, 6, 13]);
    }

    #[test]
    fn test_track_mask_threshold() {
        let device = Device::Cpu;
        for (threshold, expected) in [(0.0f32, 1u8), (1.0, 0u8)] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let config = TrackFormerConfig {
                track_threshold: threshold,
                ..test_config(3)
            };
            let model = TrackFormer::load(&config, vb).unwrap();
            let output = model.forward_t(&bev(1, &device), None, None, false).unwrap();
            let mask = model.track_mask(&output).unwrap();
            assert_eq!(mask.to_vec2::<u8>().unwrap(), vec![vec![expected; 3]]);
        }
    }

    #[test]
    fn test_shape_preconditions() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = TrackFormer::load(&test_config(3), vb).unwrap();

        let wrong_width = Tensor::randn(0f32, 1.0, (1, 16, 6), &device).unwrap();
        assert!(model.forward_t(&wrong_width, None, None, false).is_err());

        let wrong_grid = Tensor::randn(0f32, 1.0, (1, 15, 8), &device).unwrap();
        assert!(model.forward_t(&wrong_grid, None, None, false).is_err());

        let tracks = Tensor::randn(0f32, 1.0, (1, 4, 8), &device).unwrap();
        let short_mask = Tensor::new(&[[1u8, 1, 1]], &device).unwrap();
        assert!(model
            .forward_t(&bev(1, &device), Some(&tracks), Some(&short_mask), false)
            .is_err());
        assert!(model
            .forward_t(&bev(1, &device), None, Some(&short_mask), false)
            .is_err());
    }

    #[test]
    fn test_float_track_mask_is_rejected() {
        let device = Device::Cpu;
        let scores = Tensor::new(&[[0.9f32, 0.2, 0.7]], &device).unwrap();
        assert!(TrackPadding::from_mask(&scores).is_err());

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = TrackFormer::load(&test_config(3), vb).unwrap();
        let tracks = Tensor::randn(0f32, 1.0, (1, 3, 8), &device).unwrap();
        assert!(model
            .forward_t(&bev(1, &device), Some(&tracks), Some(&scores), false)
            .is_err());
    }
}
