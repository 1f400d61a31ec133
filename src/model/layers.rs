//! Shared building blocks
//!
//! Small reusable layers used by all three decoder stacks:
//! - `Mlp` / `TemporalSpecificMlp` feed-forward networks
//! - `AddNorm` residual + LayerNorm block
//! - `ConvBNorm` / `ConvTransposeBNorm` convolution + BatchNorm blocks
//! - `PosEmbedding1D` positional embedding table (learnable or sinusoidal)
//! - `resize_bilinear`, a bilinear resampler for NCHW feature maps

use candle_core::{DType, Device, Module, ModuleT, Result, Tensor};
use candle_nn::{
    Activation, BatchNorm, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Dropout,
    Embedding, LayerNorm, Linear, VarBuilder,
};

/// Multi-Layer Perceptron
///
/// A stack of linear layers with ReLU activations between them.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    pub fn load(
        input_dim: usize,
        hidden_dim: usize,
        output_dim: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_layers == 0 {
            candle_core::bail!("Mlp needs at least one layer");
        }
        let layers = (0..num_layers)
            .map(|i| {
                let in_dim = if i == 0 { input_dim } else { hidden_dim };
                let out_dim = if i + 1 == num_layers {
                    output_dim
                } else {
                    hidden_dim
                };
                candle_nn::linear(in_dim, out_dim, vb.pp(format!("layers.{i}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Two-layer `input -> hidden -> output` network
    pub fn simple(
        input_dim: usize,
        output_dim: usize,
        hidden_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::load(input_dim, hidden_dim, output_dim, 2, vb)
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut xs = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i < last {
                xs = xs.relu()?;
            }
        }
        Ok(xs)
    }
}

/// One `Mlp` per forecast timestep, all sharing the same input/output widths
#[derive(Debug, Clone)]
pub struct TemporalSpecificMlp {
    mlps: Vec<Mlp>,
}

impl TemporalSpecificMlp {
    pub fn load(
        input_dim: usize,
        output_dim: usize,
        num_timesteps: usize,
        hidden_dim: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mlps = (0..num_timesteps)
            .map(|t| {
                Mlp::load(
                    input_dim,
                    hidden_dim,
                    output_dim,
                    num_layers,
                    vb.pp(format!("mlps.{t}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { mlps })
    }

    pub fn num_timesteps(&self) -> usize {
        self.mlps.len()
    }

    /// Run the MLP belonging to timestep `t`
    pub fn forward(&self, xs: &Tensor, t: usize) -> Result<Tensor> {
        match self.mlps.get(t) {
            Some(mlp) => mlp.forward(xs),
            None => candle_core::bail!(
                "timestep {} out of range for {} temporal MLPs",
                t,
                self.mlps.len()
            ),
        }
    }
}

/// Residual add followed by LayerNorm: `norm(x + dropout(sublayer_out))`
#[derive(Debug, Clone)]
pub struct AddNorm {
    norm: LayerNorm,
    dropout: Dropout,
}

impl AddNorm {
    pub fn load(dim: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let norm = candle_nn::layer_norm(dim, 1e-5, vb.pp("norm"))?;
        Ok(Self {
            norm,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward_t(&self, xs: &Tensor, sublayer_out: &Tensor, train: bool) -> Result<Tensor> {
        let sublayer_out = self.dropout.forward(sublayer_out, train)?;
        self.norm.forward(&(xs + sublayer_out)?)
    }
}

/// Conv2d -> BatchNorm -> activation
#[derive(Debug, Clone)]
pub struct ConvBNorm {
    conv: Conv2d,
    bn: BatchNorm,
    activation: Activation,
}

impl ConvBNorm {
    pub fn load(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let config = Conv2dConfig {
            padding: kernel_size / 2,
            stride,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(
            in_channels,
            out_channels,
            kernel_size,
            config,
            vb.pp("conv"),
        )?;
        let bn = candle_nn::batch_norm(out_channels, 1e-5, vb.pp("bn"))?;
        Ok(Self {
            conv,
            bn,
            activation: Activation::Relu,
        })
    }
}

impl ModuleT for ConvBNorm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv.forward(&xs.contiguous()?)?;
        let xs = self.bn.forward_t(&xs, train)?;
        self.activation.forward(&xs)
    }
}

/// ConvTranspose2d -> BatchNorm -> activation
///
/// With `kernel_size == stride` and no padding this upsamples by exactly `stride`.
#[derive(Debug, Clone)]
pub struct ConvTransposeBNorm {
    conv: ConvTranspose2d,
    bn: BatchNorm,
    activation: Activation,
}

impl ConvTransposeBNorm {
    pub fn load(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let config = ConvTranspose2dConfig {
            padding: 0,
            output_padding: 0,
            stride,
            dilation: 1,
        };
        let conv = candle_nn::conv_transpose2d(
            in_channels,
            out_channels,
            kernel_size,
            config,
            vb.pp("conv"),
        )?;
        let bn = candle_nn::batch_norm(out_channels, 1e-5, vb.pp("bn"))?;
        Ok(Self {
            conv,
            bn,
            activation: Activation::Relu,
        })
    }
}

impl ModuleT for ConvTransposeBNorm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv.forward(&xs.contiguous()?)?;
        let xs = self.bn.forward_t(&xs, train)?;
        self.activation.forward(&xs)
    }
}

/// 1-D positional embedding table of shape [num_embeddings, embed_dim]
///
/// Learnable tables are loaded from `embedding.weight`; fixed tables use the
/// interleaved sin/cos encoding and carry no weights.
#[derive(Debug, Clone)]
pub struct PosEmbedding1D {
    embedding: Embedding,
    num_embeddings: usize,
}

impl PosEmbedding1D {
    pub fn load(
        num_embeddings: usize,
        embed_dim: usize,
        learnable: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embedding = if learnable {
            candle_nn::embedding(num_embeddings, embed_dim, vb.pp("embedding"))?
        } else {
            let table = sinusoidal_table(num_embeddings, embed_dim, vb.device())?;
            Embedding::new(table.to_dtype(vb.dtype())?, embed_dim)
        };
        Ok(Self {
            embedding,
            num_embeddings,
        })
    }

    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    /// The full table: [num_embeddings, embed_dim]
    pub fn forward(&self) -> &Tensor {
        self.embedding.embeddings()
    }

    /// Look up rows by index; `indexes` is any-rank u32, output appends `embed_dim`
    pub fn lookup(&self, indexes: &Tensor) -> Result<Tensor> {
        self.embedding.forward(indexes)
    }
}

/// table[p, i] = sin(p / 10000^(2(i/2)/d)) for even i, cos(...) for odd i
fn sinusoidal_table(num_embeddings: usize, embed_dim: usize, device: &Device) -> Result<Tensor> {
    let mut values = Vec::with_capacity(num_embeddings * embed_dim);
    for pos in 0..num_embeddings {
        for i in 0..embed_dim {
            let exponent = 2.0 * ((i / 2) as f64) / (embed_dim as f64);
            let angle = pos as f64 / 10000.0_f64.powf(exponent);
            let value = if i % 2 == 0 { angle.sin() } else { angle.cos() };
            values.push(value as f32);
        }
    }
    Tensor::from_vec(values, (num_embeddings, embed_dim), device)
}

/// Row-major [out_size, in_size] weights for 1-D bilinear resampling with
/// `align_corners=False` semantics.
fn interpolation_weights(in_size: usize, out_size: usize) -> Vec<f32> {
    let scale = in_size as f64 / out_size as f64;
    let mut weights = vec![0f32; out_size * in_size];
    for o in 0..out_size {
        let src = ((o as f64 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(in_size - 1);
        let i1 = (i0 + 1).min(in_size - 1);
        let lambda = (src - i0 as f64).clamp(0.0, 1.0) as f32;
        weights[o * in_size + i0] += 1.0 - lambda;
        weights[o * in_size + i1] += lambda;
    }
    weights
}

/// Bilinear resize of a [N, C, H, W] tensor to [N, C, out_h, out_w]
///
/// Separable implementation: one matmul along the width, one along the height.
/// Matches PyTorch's `F.interpolate(mode="bilinear", align_corners=False)` when the
/// output size is an integer multiple or divisor of the input size.
pub fn resize_bilinear(xs: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (n, c, h, w) = xs.dims4()?;
    if (h, w) == (out_h, out_w) {
        return Ok(xs.clone());
    }
    if h == 0 || w == 0 || out_h == 0 || out_w == 0 {
        candle_core::bail!("cannot resize {:?} to ({}, {})", xs.dims(), out_h, out_w);
    }
    let device = xs.device();
    let dtype = xs.dtype();
    let rx = Tensor::from_vec(interpolation_weights(w, out_w), (out_w, w), device)?
        .to_dtype(dtype)?;
    let ry = Tensor::from_vec(interpolation_weights(h, out_h), (out_h, h), device)?
        .to_dtype(dtype)?;

    // [N*C*H, W] x [W, W'] -> [N*C*H, W']
    let xs = xs.contiguous()?.reshape((n * c * h, w))?.matmul(&rx.t()?)?;

    // [N*C*W', H] x [H, H'] -> [N*C*W', H']
    let xs = xs
        .reshape((n * c, h, out_w))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((n * c * out_w, h))?
        .matmul(&ry.t()?)?;

    xs.reshape((n * c, out_w, out_h))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((n, c, out_h, out_w))
}

/// All-valid u8 mask of the given shape
pub fn valid_mask<S: Into<candle_core::Shape>>(shape: S, device: &Device) -> Result<Tensor> {
    Tensor::ones(shape, DType::U8, device)
}
