use crate::candle_aux_layers::*;
use crate::candle_image_ops::bilinear_resize;
use crate::candle_model_traits::*;
use crate::candle_normalization::*;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, ModuleT, VarBuilder};

/// Spatial size the encoder works at
pub const ENCODER_INPUT_SIZE: usize = 256;

pub struct ConvEncoderArgs {
    pub in_channels: usize,
    pub ngf: usize,
    pub w_dim: usize,
    pub crop_size: usize,
    pub norm: NormKind,
}

/// Strided-convolution encoder of single-channel images into a latent
/// Gaussian. Same layout as the image discriminator.
pub struct ConvEncoder {
    w_dim: usize,
    layers: StackLayers<NormConv2d>,
    fc_mean: Linear,
    fc_lnvar: Linear,
}

impl ImageEncoderT for ConvEncoder {
    fn forward_t(&self, x_nchw: &Tensor, train: bool) -> Result<EncoderOutput> {
        let x = bilinear_resize(x_nchw, ENCODER_INPUT_SIZE, ENCODER_INPUT_SIZE)?;

        let features = self.layers.forward_features_t(&x, train)?;
        let last = features
            .last()
            .ok_or_else(|| candle_core::Error::Msg("empty encoder".into()))?;

        let h = candle_nn::ops::leaky_relu(last, 0.2)?.flatten_from(1)?;

        Ok(EncoderOutput {
            mean: self.fc_mean.forward(&h)?,
            log_var: self.fc_lnvar.forward(&h)?,
            features,
        })
    }

    fn dim_latent(&self) -> usize {
        self.w_dim
    }
}

impl ConvEncoder {
    /// Number of stride-2 blocks: 6 if `crop_size >= 256`, else 5
    pub fn num_blocks(crop_size: usize) -> usize {
        if crop_size >= 256 {
            6
        } else {
            5
        }
    }

    /// Will create a new convolutional encoder with these variables:
    ///
    /// * `enc.layer{i}.conv.weight` for the i-th stride-2 block
    /// * `enc.layer{i}.norm.*` with batch norm
    /// * `enc.fc_mu.{weight,bias}`
    /// * `enc.fc_var.{weight,bias}`
    pub fn new(args: ConvEncoderArgs, vs: VarBuilder) -> Result<Self> {
        let nf = args.ngf;
        let n_blocks = Self::num_blocks(args.crop_size);

        let mut layers = StackLayers::<NormConv2d>::new();
        let mut prev_dim = args.in_channels;
        for j in 0..n_blocks {
            let next_dim = nf * (1 << j.min(3));
            layers.push(NormConv2d::new(
                ConvSpec::new(prev_dim, next_dim, 3, 2, 1),
                args.norm,
                vs.pp(format!("enc.layer{}", j)),
            )?);
            prev_dim = next_dim;
        }

        let s0 = ENCODER_INPUT_SIZE >> n_blocks;
        let d_flat = prev_dim * s0 * s0;

        let fc_mean = candle_nn::linear(d_flat, args.w_dim, vs.pp("enc.fc_mu"))?;
        let fc_lnvar = candle_nn::linear(d_flat, args.w_dim, vs.pp("enc.fc_var"))?;

        Ok(Self {
            w_dim: args.w_dim,
            layers,
            fc_mean,
            fc_lnvar,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

///
/// z = mu + sigma * eps
/// where eps ~ N(0, 1)
///
/// # Arguments
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
/// * `train` - sample if true, otherwise return the mean
pub fn reparameterize(z_mean: &Tensor, z_lnvar: &Tensor, train: bool) -> Result<Tensor> {
    if train {
        let eps = Tensor::randn_like(z_mean, 0., 1.)?;
        z_mean + (z_lnvar * 0.5)?.exp()? * eps
    } else {
        Ok(z_mean.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(crop_size: usize, norm: &str) -> anyhow::Result<(ConvEncoder, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let enc = ConvEncoder::new(
            ConvEncoderArgs {
                in_channels: 1,
                ngf: 2,
                w_dim: 7,
                crop_size,
                norm: NormKind::parse(norm)?,
            },
            vb,
        )?;
        Ok((enc, varmap))
    }

    #[test]
    fn latent_dim_regardless_of_input_size() -> anyhow::Result<()> {
        let (enc, _) = build(256, "spectralinstance")?;
        for (h, w) in [(256, 256), (64, 48), (300, 300)] {
            let x = Tensor::randn(0f32, 1f32, (3, 1, h, w), &Device::Cpu)?;
            let out = enc.forward_t(&x, true)?;
            assert_eq!(out.mean.dims(), &[3, 7]);
            assert_eq!(out.log_var.dims(), &[3, 7]);
        }
        Ok(())
    }

    #[test]
    fn six_blocks_for_large_crops() -> anyhow::Result<()> {
        let (enc, _) = build(256, "instance")?;
        let x = Tensor::randn(0f32, 1f32, (1, 1, 256, 256), &Device::Cpu)?;
        let out = enc.forward_t(&x, false)?;
        assert_eq!(out.features.len(), 6);
        let widths: Vec<usize> = out.features.iter().map(|f| f.dim(1).unwrap()).collect();
        assert_eq!(widths, vec![2, 4, 8, 16, 16, 16]);
        assert_eq!(out.features[5].dims(), &[1, 16, 4, 4]);
        Ok(())
    }

    #[test]
    fn five_blocks_for_small_crops() -> anyhow::Result<()> {
        let (enc, _) = build(128, "batch")?;
        let x = Tensor::randn(0f32, 1f32, (2, 1, 128, 128), &Device::Cpu)?;
        let out = enc.forward_t(&x, true)?;
        assert_eq!(enc.num_layers(), 5);
        assert_eq!(out.features[4].dims(), &[2, 16, 8, 8]);
        assert_eq!(out.mean.dims(), &[2, 7]);
        Ok(())
    }

    #[test]
    fn reparameterize_returns_mean_in_eval() -> Result<()> {
        let mu = Tensor::randn(0f32, 1f32, (4, 3), &Device::Cpu)?;
        let lv = Tensor::zeros((4, 3), DType::F32, &Device::Cpu)?;
        let z = reparameterize(&mu, &lv, false)?;
        let diff = (z - &mu)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        let z = reparameterize(&mu, &lv, true)?;
        assert_eq!(z.dims(), mu.dims());
        Ok(())
    }
}
