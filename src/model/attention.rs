//! Attention primitives
//!
//! - `MultiheadAttention`: scaled dot-product attention with separate query and
//!   key/value lengths, an optional key padding mask and an optional additive bias.
//! - `DeformableAttention`: multi-scale deformable attention, sampling the value map
//!   at learned offsets around per-query reference points (pure Candle, no custom kernels).
//! - `standard_ref_points`: uniform grid of reference points over the BEV plane.

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

/// Additive score assigned to padded keys before the softmax
const MASKED_SCORE: f64 = -1e9;

/// Multi-head attention with packed QKV input projection
#[derive(Debug, Clone)]
pub struct MultiheadAttention {
    embed_dim: usize,
    num_heads: usize,
    head_dim: usize,
    /// Packed [3 * embed_dim, embed_dim] projection for Q, K and V
    in_proj_weight: Tensor,
    in_proj_bias: Tensor,
    out_proj: Linear,
    dropout: Dropout,
}

impl MultiheadAttention {
    pub fn load(embed_dim: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            candle_core::bail!(
                "embed_dim {} is not divisible by num_heads {}",
                embed_dim,
                num_heads
            );
        }
        let in_proj_weight = vb.get_with_hints(
            (3 * embed_dim, embed_dim),
            "in_proj_weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let in_proj_bias = vb.get_with_hints(
            3 * embed_dim,
            "in_proj_bias",
            candle_nn::Init::Const(0.0),
        )?;
        let out_proj = linear(embed_dim, embed_dim, vb.pp("out_proj"))?;

        Ok(Self {
            embed_dim,
            num_heads,
            head_dim: embed_dim / num_heads,
            in_proj_weight,
            in_proj_bias,
            out_proj,
            dropout: Dropout::new(dropout),
        })
    }

    /// Project with the `slot`-th block of the packed weights (0 = Q, 1 = K, 2 = V)
    fn project(&self, xs: &Tensor, slot: usize) -> Result<Tensor> {
        let e = self.embed_dim;
        let weight = self.in_proj_weight.narrow(0, slot * e, e)?;
        let bias = self.in_proj_bias.narrow(0, slot * e, e)?;
        xs.broadcast_matmul(&weight.t()?)?.broadcast_add(&bias)
    }

    /// [batch, len, embed] -> [batch, heads, len, head_dim]
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, len, _) = xs.dims3()?;
        xs.reshape((b, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `query` - [batch, len_q, embed_dim]
    /// * `key`, `value` - [batch, len_k, embed_dim]
    /// * `key_padding_mask` - optional u8 [batch, len_k], 1 for real keys, 0 for padding
    /// * `attn_bias` - optional [batch, len_q, len_k] added to the attention scores
    ///
    /// # Returns
    /// [batch, len_q, embed_dim]
    pub fn forward_t(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_padding_mask: Option<&Tensor>,
        attn_bias: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch_size, len_q, embed_dim) = query.dims3()?;
        let (kb, len_k, ke) = key.dims3()?;
        let (bv, len_v, ve) = value.dims3()?;
        if embed_dim != self.embed_dim || ke != embed_dim || ve != embed_dim {
            candle_core::bail!(
                "attention width mismatch: expected {}, got query {}, key {}, value {}",
                self.embed_dim,
                embed_dim,
                ke,
                ve
            );
        }
        if kb != batch_size || bv != batch_size || len_v != len_k {
            candle_core::bail!(
                "attention key/value shapes {:?} / {:?} do not match query {:?}",
                key.dims(),
                value.dims(),
                query.dims()
            );
        }

        let q = self.split_heads(&self.project(query, 0)?)?;
        let k = self.split_heads(&self.project(key, 1)?)?;
        let v = self.split_heads(&self.project(value, 2)?)?;

        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let mut scores = (q.matmul(&k_t)? / (self.head_dim as f64).sqrt())?;

        if let Some(mask) = key_padding_mask {
            if mask.dims() != [batch_size, len_k] {
                candle_core::bail!(
                    "key padding mask shape {:?} != [{}, {}]",
                    mask.dims(),
                    batch_size,
                    len_k
                );
            }
            // 0 for real keys, MASKED_SCORE for padding
            let bias = ((mask.to_dtype(scores.dtype())? - 1.0)? * -MASKED_SCORE)?
                .reshape((batch_size, 1, 1, len_k))?;
            scores = scores.broadcast_add(&bias)?;
        }
        if let Some(bias) = attn_bias {
            if bias.dims() != [batch_size, len_q, len_k] {
                candle_core::bail!(
                    "attention bias shape {:?} != [{}, {}, {}]",
                    bias.dims(),
                    batch_size,
                    len_q,
                    len_k
                );
            }
            scores = scores.broadcast_add(&bias.to_dtype(scores.dtype())?.unsqueeze(1)?)?;
        }

        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let weights = self.dropout.forward(&weights, train)?;
        let output = weights.matmul(&v)?;

        let output = output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, len_q, embed_dim))?;
        self.out_proj.forward(&output)
    }
}

/// Multi-scale deformable attention
///
/// Each query predicts `n_heads * n_levels * n_points` sampling offsets around its
/// reference point and a softmax-normalised weight per sample. Reference points and
/// offsets are expressed in feature-map cells of their level; offsets are multiplied
/// by `offset_scale` before use.
#[derive(Debug, Clone)]
pub struct DeformableAttention {
    d_model: usize,
    n_levels: usize,
    n_heads: usize,
    n_points: usize,
    offset_scale: f64,
    sampling_offsets: Linear,
    attention_weights: Linear,
    value_proj: Linear,
    output_proj: Linear,
    dropout: Dropout,
}

impl DeformableAttention {
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        d_model: usize,
        n_levels: usize,
        n_heads: usize,
        n_points: usize,
        offset_scale: f64,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if n_heads == 0 || d_model % n_heads != 0 {
            candle_core::bail!(
                "d_model {} is not divisible by n_heads {}",
                d_model,
                n_heads
            );
        }
        let sampling_offsets = linear(
            d_model,
            n_heads * n_levels * n_points * 2,
            vb.pp("sampling_offsets"),
        )?;
        let attention_weights = linear(
            d_model,
            n_heads * n_levels * n_points,
            vb.pp("attention_weights"),
        )?;
        let value_proj = linear(d_model, d_model, vb.pp("value_proj"))?;
        let output_proj = linear(d_model, d_model, vb.pp("output_proj"))?;

        Ok(Self {
            d_model,
            n_levels,
            n_heads,
            n_points,
            offset_scale,
            sampling_offsets,
            attention_weights,
            value_proj,
            output_proj,
            dropout: Dropout::new(dropout),
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `query` - [N, Len_q, C]
    /// * `reference_points` - [N, Len_q, n_levels, 2] as (x, y) in cells of each level
    /// * `input_flatten` - [N, sum(H*W), C]
    /// * `spatial_shapes` - [(H, W), ...] per level
    /// * `level_start_index` - offset of each level inside `input_flatten`
    /// * `query_mask` - optional u8 [N, Len_q]; masked queries sample nothing
    ///
    /// # Returns
    /// [N, Len_q, C]
    #[allow(clippy::too_many_arguments)]
    pub fn forward_t(
        &self,
        query: &Tensor,
        reference_points: &Tensor,
        input_flatten: &Tensor,
        spatial_shapes: &[(usize, usize)],
        level_start_index: &[usize],
        query_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (n, len_q, c) = query.dims3()?;
        let (_, len_in, c_in) = input_flatten.dims3()?;
        if c != self.d_model || c_in != self.d_model {
            candle_core::bail!(
                "deformable attention width mismatch: expected {}, got query {}, input {}",
                self.d_model,
                c,
                c_in
            );
        }
        if spatial_shapes.len() != self.n_levels || level_start_index.len() != self.n_levels {
            candle_core::bail!(
                "expected {} feature levels, got {} shapes / {} start indices",
                self.n_levels,
                spatial_shapes.len(),
                level_start_index.len()
            );
        }
        let total_hw: usize = spatial_shapes.iter().map(|(h, w)| h * w).sum();
        if total_hw != len_in {
            candle_core::bail!("Spatial shapes sum {} != input length {}", total_hw, len_in);
        }
        if reference_points.dims() != [n, len_q, self.n_levels, 2] {
            candle_core::bail!(
                "reference points shape {:?} != [{}, {}, {}, 2]",
                reference_points.dims(),
                n,
                len_q,
                self.n_levels
            );
        }

        let value = self.value_proj.forward(input_flatten)?;

        // [N, Len_q, n_heads, n_levels, n_points, 2]
        let offsets = self.sampling_offsets.forward(query)?.reshape((
            n,
            len_q,
            self.n_heads,
            self.n_levels,
            self.n_points,
            2,
        ))?;
        let offsets = (offsets * self.offset_scale)?;

        // [N, Len_q, n_heads, n_levels * n_points]
        let weights = self.attention_weights.forward(query)?.reshape((
            n,
            len_q,
            self.n_heads,
            self.n_levels * self.n_points,
        ))?;
        let mut weights = candle_nn::ops::softmax_last_dim(&weights)?;
        if let Some(mask) = query_mask {
            if mask.dims() != [n, len_q] {
                candle_core::bail!(
                    "query mask shape {:?} != [{}, {}]",
                    mask.dims(),
                    n,
                    len_q
                );
            }
            let mask = mask.to_dtype(weights.dtype())?.reshape((n, len_q, 1, 1))?;
            weights = weights.broadcast_mul(&mask)?;
        }

        // Sampling locations normalised to [0, 1] per level
        let normalizer: Vec<f32> = spatial_shapes
            .iter()
            .flat_map(|&(h, w)| [w as f32, h as f32])
            .collect();
        let normalizer = Tensor::from_vec(normalizer, (1, 1, 1, self.n_levels, 1, 2), query.device())?
            .to_dtype(query.dtype())?;
        let ref_pts = reference_points
            .to_dtype(query.dtype())?
            .unsqueeze(2)?
            .unsqueeze(4)?;
        let sampling_locations = ref_pts
            .broadcast_add(&offsets)?
            .broadcast_div(&normalizer)?;

        let head_dim = self.d_model / self.n_heads;
        let value = value
            .transpose(1, 2)?
            .reshape((n, self.n_heads, head_dim, len_in))?;

        let output = deformable_attn_core(
            &value,
            spatial_shapes,
            level_start_index,
            &sampling_locations,
            &weights,
        )?;
        let output = self.dropout.forward(&output, train)?;
        self.output_proj.forward(&output)
    }
}

/// Weighted bilinear sampling shared by all heads and levels
///
/// * `value` - [N, n_heads, head_dim, Len_in]
/// * `sampling_locations` - [N, Len_q, n_heads, n_levels, n_points, 2] in [0, 1]
/// * `attention_weights` - [N, Len_q, n_heads, n_levels * n_points]
///
/// Returns [N, Len_q, n_heads * head_dim]
fn deformable_attn_core(
    value: &Tensor,
    spatial_shapes: &[(usize, usize)],
    level_start_index: &[usize],
    sampling_locations: &Tensor,
    attention_weights: &Tensor,
) -> Result<Tensor> {
    let (n, n_heads, head_dim, _) = value.dims4()?;
    let dims = sampling_locations.dims();
    let (len_q, n_levels, n_points) = (dims[1], dims[3], dims[4]);

    // grid_sample expects [-1, 1]
    let grids = ((sampling_locations * 2.0)? - 1.0)?;

    let mut per_level = Vec::with_capacity(n_levels);
    for (lvl, (&(h, w), &start)) in spatial_shapes.iter().zip(level_start_index).enumerate() {
        let value_l = value
            .narrow(3, start, h * w)?
            .reshape((n * n_heads, head_dim, h, w))?;
        // [N, Len_q, n_heads, n_points, 2] -> [N*n_heads, Len_q, n_points, 2]
        let grid_l = grids
            .i((.., .., .., lvl, .., ..))?
            .transpose(1, 2)?
            .reshape((n * n_heads, len_q, n_points, 2))?;
        // [N*n_heads, head_dim, Len_q, n_points]
        per_level.push(grid_sample_bilinear(&value_l, &grid_l)?);
    }

    // [N*n_heads, head_dim, Len_q, n_levels * n_points]
    let samples = Tensor::stack(&per_level, 3)?.reshape((
        n * n_heads,
        head_dim,
        len_q,
        n_levels * n_points,
    ))?;
    let weights = attention_weights
        .transpose(1, 2)?
        .reshape((n * n_heads, 1, len_q, n_levels * n_points))?;

    let output = samples.broadcast_mul(&weights)?.sum(D::Minus1)?;
    output
        .reshape((n, n_heads * head_dim, len_q))?
        .transpose(1, 2)?
        .contiguous()
}

/// Bilinear sampling (`F.grid_sample`, `align_corners=False`, zero padding)
///
/// * `input` - [N, C, H, W]
/// * `grid` - [N, H_out, W_out, 2] as (x, y) in [-1, 1]
///
/// Returns [N, C, H_out, W_out]
pub fn grid_sample_bilinear(input: &Tensor, grid: &Tensor) -> Result<Tensor> {
    let (n, c, h, w) = input.dims4()?;
    let (gn, h_out, w_out, coords) = grid.dims4()?;
    if gn != n || coords != 2 {
        candle_core::bail!(
            "grid shape {:?} incompatible with input {:?}",
            grid.dims(),
            input.dims()
        );
    }
    let dtype = input.dtype();
    let grid = grid.to_dtype(DType::F32)?;

    let x = (((grid.i((.., .., .., 0))? + 1.0)? * (w as f64 / 2.0))? - 0.5)?;
    let y = (((grid.i((.., .., .., 1))? + 1.0)? * (h as f64 / 2.0))? - 0.5)?;
    let x0 = x.floor()?;
    let y0 = y.floor()?;
    let x1 = (&x0 + 1.0)?;
    let y1 = (&y0 + 1.0)?;

    let input_flat = input.reshape((n, c, h * w))?;
    let corner = |cx: &Tensor, cy: &Tensor, weight: Tensor| -> Result<Tensor> {
        // Corners outside the map contribute zero
        let inside = cx
            .ge(0.0)?
            .mul(&cx.le((w - 1) as f64)?)?
            .mul(&cy.ge(0.0)?)?
            .mul(&cy.le((h - 1) as f64)?)?
            .to_dtype(DType::F32)?;
        let weight = weight.mul(&inside)?;

        let xi = cx.clamp(0.0, (w - 1) as f64)?;
        let yi = cy.clamp(0.0, (h - 1) as f64)?;
        let index = ((yi * w as f64)? + xi)?
            .to_dtype(DType::U32)?
            .reshape((n, 1, h_out * w_out))?
            .repeat((1, c, 1))?;
        let values = input_flat
            .gather(&index, 2)?
            .reshape((n, c, h_out, w_out))?;
        values.broadcast_mul(&weight.unsqueeze(1)?.to_dtype(dtype)?)
    };

    let wx0 = (&x1 - &x)?;
    let wx1 = (&x - &x0)?;
    let wy0 = (&y1 - &y)?;
    let wy1 = (&y - &y0)?;

    let top_left = corner(&x0, &y0, wx0.mul(&wy0)?)?;
    let top_right = corner(&x1, &y0, wx1.mul(&wy0)?)?;
    let bottom_left = corner(&x0, &y1, wx0.mul(&wy1)?)?;
    let bottom_right = corner(&x1, &y1, wx1.mul(&wy1)?)?;

    (top_left + top_right)? + (bottom_left + bottom_right)?
}

/// Uniform grid of `n_sample` reference points over an (H, W) plane
///
/// Points are cell centres of a `rows x cols` lattice with `rows = ceil(sqrt(n))`
/// and `cols = ceil(n / rows)`, taken in row-major order. Coordinates are (x, y) in
/// plane units, or in [0, 1] when `normalize` is set.
///
/// Returns [batch_size, n_sample, 2]
pub fn standard_ref_points(
    plane_shape: (usize, usize),
    batch_size: usize,
    n_sample: usize,
    normalize: bool,
    device: &Device,
) -> Result<Tensor> {
    let (h, w) = plane_shape;
    if n_sample == 0 || h == 0 || w == 0 {
        candle_core::bail!(
            "cannot place {} reference points on a {:?} plane",
            n_sample,
            plane_shape
        );
    }
    let rows = (n_sample as f64).sqrt().ceil() as usize;
    let cols = n_sample.div_ceil(rows);
    let (sx, sy) = if normalize {
        (1.0 / cols as f32, 1.0 / rows as f32)
    } else {
        (w as f32 / cols as f32, h as f32 / rows as f32)
    };

    let points: Vec<f32> = (0..n_sample)
        .flat_map(|i| {
            let (row, col) = (i / cols, i % cols);
            [(col as f32 + 0.5) * sx, (row as f32 + 0.5) * sy]
        })
        .collect();
    Tensor::from_vec(points, (1, n_sample, 2), device)?.repeat((batch_size, 1, 1))
}
