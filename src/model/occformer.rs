//! OccFormer: future occupancy forecasting
//!
//! Per-agent sparse features (track query, slot embedding, pooled motion query) are
//! fused with a dense BEV feature map over `pred_horizon` decoder layers, one per
//! future timestep. The dense map is carried from one timestep to the next.

use candle_core::{DType, Module, ModuleT, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::OccFormerConfig;
use crate::model::attention::MultiheadAttention;
use crate::model::layers::{
    resize_bilinear, AddNorm, ConvBNorm, ConvTransposeBNorm, Mlp, PosEmbedding1D,
    TemporalSpecificMlp,
};

/// Collapse motion modes with an element-wise max: [N, A, K, E] -> [N, A, E]
pub fn pool_modes(motion_queries: &Tensor) -> Result<Tensor> {
    motion_queries.max(2)
}

/// Dense/sparse fusion layer for one forecast timestep
#[derive(Debug, Clone)]
pub struct OccFormerDecoderLayer {
    self_attention: MultiheadAttention,
    addnorm1: AddNorm,
    cross_attention: MultiheadAttention,
    addnorm2: AddNorm,
    embed_dim: usize,
    dense_feature_shape: (usize, usize),
    attention_shape: (usize, usize),
}

impl OccFormerDecoderLayer {
    pub fn load(config: &OccFormerConfig, vb: VarBuilder) -> Result<Self> {
        let e = config.embed_dim;
        Ok(Self {
            self_attention: MultiheadAttention::load(
                e,
                config.num_heads,
                config.dropout,
                vb.pp("self_attention"),
            )?,
            addnorm1: AddNorm::load(e, config.dropout, vb.pp("addnorm1"))?,
            cross_attention: MultiheadAttention::load(
                e,
                config.num_heads,
                config.dropout,
                vb.pp("cross_attention"),
            )?,
            addnorm2: AddNorm::load(e, config.dropout, vb.pp("addnorm2"))?,
            embed_dim: e,
            dense_feature_shape: config.dense_feature_shape(),
            attention_shape: config.attention_shape(),
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `dense_features` - [N, E, h, w] at the dense working resolution
    /// * `agent_features` - [N, A, E]
    /// * `mask_features` - [N, A, E]
    /// * `return_attn_mask` - also return the learned attention mask
    /// * `pad_mask` - optional u8 [N, A], 0 for padded agents
    ///
    /// # Returns
    /// Next dense features [N, E, h, w] and, when requested, the attention mask
    /// [N, A, h / op_attn_scale, w / op_attn_scale]
    pub fn forward_t(
        &self,
        dense_features: &Tensor,
        agent_features: &Tensor,
        mask_features: &Tensor,
        return_attn_mask: bool,
        pad_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (n, e, h, w) = dense_features.dims4()?;
        if e != self.embed_dim || (h, w) != self.dense_feature_shape {
            candle_core::bail!(
                "dense features {:?} != [N, {}, {}, {}]",
                dense_features.dims(),
                self.embed_dim,
                self.dense_feature_shape.0,
                self.dense_feature_shape.1
            );
        }
        let (an, num_agents, ae) = agent_features.dims3()?;
        if an != n || ae != e || mask_features.dims() != agent_features.dims() {
            candle_core::bail!(
                "agent features {:?} / mask features {:?} incompatible with dense features {:?}",
                agent_features.dims(),
                mask_features.dims(),
                dense_features.dims()
            );
        }

        let (hs, ws) = self.attention_shape;
        let ds_dense = resize_bilinear(dense_features, hs, ws)?
            .permute((0, 2, 3, 1))?
            .contiguous()?
            .reshape((n, hs * ws, e))?;

        let out1 = self
            .self_attention
            .forward_t(&ds_dense, &ds_dense, &ds_dense, None, None, train)?;
        let out2 = self.addnorm1.forward_t(&ds_dense, &out1, train)?;

        // [N, hs*ws, A]
        let mut mask = out2.matmul(&mask_features.transpose(1, 2)?.contiguous()?)?;
        if let Some(pad_mask) = pad_mask {
            if pad_mask.dtype() != DType::U8 || pad_mask.dims() != [n, num_agents] {
                candle_core::bail!(
                    "pad mask must be u8 [{}, {}], got {:?} {:?}",
                    n,
                    num_agents,
                    pad_mask.dtype(),
                    pad_mask.dims()
                );
            }
            let keep = pad_mask.to_dtype(mask.dtype())?.unsqueeze(1)?;
            mask = mask.broadcast_mul(&keep)?;
        }

        let out3 = self.cross_attention.forward_t(
            &out2,
            agent_features,
            agent_features,
            None,
            Some(&mask),
            train,
        )?;
        let out4 = self
            .addnorm2
            .forward_t(&out2, &out3, train)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((n, e, hs, ws))?;
        let out5 = (resize_bilinear(&out4, h, w)? + dense_features)?;

        let attn_mask = if return_attn_mask {
            Some(
                mask.transpose(1, 2)?
                    .contiguous()?
                    .reshape((n, num_agents, hs, ws))?,
            )
        } else {
            None
        };
        Ok((out5, attn_mask))
    }
}

/// Result of one OccFormer pass
#[derive(Debug, Clone)]
pub struct OccFormerOutput {
    /// [N, A, pred_horizon, H, W]
    pub occupancies: Tensor,
    /// [N, A, pred_horizon, H / (ds * op), W / (ds * op)], training only
    pub attn_masks: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct OccFormer {
    config: OccFormerConfig,
    agent_pos_emb: PosEmbedding1D,
    temporal_mlp: TemporalSpecificMlp,
    mask_features_mlp: Mlp,
    occ_features_mlp: Mlp,
    decoder_modules: Vec<OccFormerDecoderLayer>,
    proto_conv_in: ConvBNorm,
    proto_upsample: ConvTransposeBNorm,
    proto_conv_out: ConvBNorm,
}

impl OccFormer {
    pub fn load(config: &OccFormerConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let e = config.embed_dim;
        let agent_pos_emb = PosEmbedding1D::load(
            config.max_num_agents,
            e,
            config.learnable_pe,
            vb.pp("agent_pos_emb"),
        )?;
        let temporal_mlp = TemporalSpecificMlp::load(
            3 * e,
            e,
            config.pred_horizon,
            config.dim_feedforward,
            config.num_tmlp_layers,
            vb.pp("temporal_mlp"),
        )?;
        let mask_features_mlp = Mlp::simple(e, e, config.dim_feedforward, vb.pp("mask_features_mlp"))?;
        let occ_features_mlp = Mlp::simple(e, e, config.dim_feedforward, vb.pp("occ_features_mlp"))?;
        let decoder_modules = (0..config.pred_horizon)
            .map(|i| OccFormerDecoderLayer::load(config, vb.pp(format!("decoder_modules.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        let ds = config.bev_downsample_scale;
        let vb_conv = vb.pp("conv_transpose");
        let proto_conv_in = ConvBNorm::load(e, e, 1, 1, vb_conv.pp("0"))?;
        let proto_upsample = ConvTransposeBNorm::load(e, e, ds, ds, vb_conv.pp("1"))?;
        let proto_conv_out = ConvBNorm::load(e, e, 1, 1, vb_conv.pp("2"))?;

        Ok(Self {
            config: config.clone(),
            agent_pos_emb,
            temporal_mlp,
            mask_features_mlp,
            occ_features_mlp,
            decoder_modules,
            proto_conv_in,
            proto_upsample,
            proto_conv_out,
        })
    }

    pub fn config(&self) -> &OccFormerConfig {
        &self.config
    }

    /// Dense features back to full BEV resolution: [N, E, h, w] -> [N, E, H, W]
    fn proto_map(&self, dense_features: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.proto_conv_in.forward_t(dense_features, train)?;
        let xs = self.proto_upsample.forward_t(&xs, train)?;
        self.proto_conv_out.forward_t(&xs, train)
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `bev_features` - [N, H*W, E]
    /// * `track_queries` - [N, A, E]
    /// * `motion_queries` - [N, A, num_modes, E]
    /// * `pad_mask` - optional u8 [N, A], 0 for padded agents
    pub fn forward_t(
        &self,
        bev_features: &Tensor,
        track_queries: &Tensor,
        motion_queries: &Tensor,
        pad_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<OccFormerOutput> {
        let e = self.config.embed_dim;
        let (h, w) = self.config.bev_feature_shape;
        let (batch_size, num_agents, track_dim) = track_queries.dims3()?;
        let (mn, motion_agents, num_modes, motion_dim) = motion_queries.dims4()?;
        if motion_agents != num_agents || mn != batch_size {
            candle_core::bail!(
                "track queries {:?} and motion queries {:?} disagree on batch/agent count",
                track_queries.dims(),
                motion_queries.dims()
            );
        }
        if track_dim != e || motion_dim != e {
            candle_core::bail!(
                "query widths (track {}, motion {}) != embed_dim {}",
                track_dim,
                motion_dim,
                e
            );
        }
        if num_modes != self.config.num_modes {
            candle_core::bail!(
                "motion queries carry {} modes, expected {}",
                num_modes,
                self.config.num_modes
            );
        }
        if bev_features.dims() != [batch_size, h * w, e] {
            candle_core::bail!(
                "BEV features {:?} != [{}, {}, {}]",
                bev_features.dims(),
                batch_size,
                h * w,
                e
            );
        }
        if num_agents == 0 || num_agents > self.agent_pos_emb.num_embeddings() {
            candle_core::bail!(
                "agent count {} outside 1..={}",
                num_agents,
                self.agent_pos_emb.num_embeddings()
            );
        }
        if let Some(pad_mask) = pad_mask {
            if pad_mask.dtype() != DType::U8 || pad_mask.dims() != [batch_size, num_agents] {
                candle_core::bail!(
                    "pad mask must be u8 [{}, {}], got {:?} {:?}",
                    batch_size,
                    num_agents,
                    pad_mask.dtype(),
                    pad_mask.dims()
                );
            }
        }
        let device = track_queries.device();

        let pooled = pool_modes(motion_queries)?;
        let slots = Tensor::arange(0u32, num_agents as u32, device)?
            .unsqueeze(0)?
            .repeat((batch_size, 1))?;
        let pos_emb = self
            .agent_pos_emb
            .lookup(&slots)?
            .to_dtype(track_queries.dtype())?;
        let sparse_features = Tensor::cat(&[track_queries, &pos_emb, &pooled], 2)?;

        let (dh, dw) = self.config.dense_feature_shape();
        let bev = bev_features
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, e, h, w))?;
        let mut dense_features = resize_bilinear(&bev, dh, dw)?;

        let mut occupancies = Vec::with_capacity(self.decoder_modules.len());
        let mut attn_masks = Vec::new();
        for (t, layer) in self.decoder_modules.iter().enumerate() {
            let agent_features = self.temporal_mlp.forward(&sparse_features, t)?;
            let mask_features = self.mask_features_mlp.forward(&agent_features)?;

            let (next_dense, attn_mask) = layer.forward_t(
                &dense_features,
                &agent_features,
                &mask_features,
                train,
                pad_mask,
                train,
            )?;
            dense_features = next_dense;
            if let Some(attn_mask) = attn_mask {
                attn_masks.push(attn_mask);
            }

            let occ_features = self.occ_features_mlp.forward(&mask_features)?;
            let proto = self
                .proto_map(&dense_features, train)?
                .reshape((batch_size, e, h * w))?;
            // [N, A, E] x [N, E, H*W] -> [N, A, H, W]
            let occupancy = occ_features
                .matmul(&proto)?
                .reshape((batch_size, num_agents, h, w))?;
            occupancies.push(occupancy);
        }

        tracing::debug!(
            batch_size,
            num_agents,
            horizon = occupancies.len(),
            "occformer forecast"
        );

        let occupancies = Tensor::stack(&occupancies, 2)?;
        let attn_masks = if attn_masks.is_empty() {
            None
        } else {
            Some(Tensor::stack(&attn_masks, 2)?)
        };
        Ok(OccFormerOutput {
            occupancies,
            attn_masks,
        })
    }
}
