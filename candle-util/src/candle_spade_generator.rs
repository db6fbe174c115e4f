use crate::candle_aux_layers::ConvActivation;
use crate::candle_image_ops::nearest_resize;
use crate::candle_model_traits::*;
use crate::candle_normalization::*;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, ModuleT, VarBuilder};

/// Number of 2x upsampling steps between the latent grid and the output
pub const NUM_UPSAMPLING: usize = 5;

const LEAKY_SLOPE: f64 = 0.2;

/////////////////////////////////////////
// spatially-adaptive normalization    //
/////////////////////////////////////////

/// x -> param_free_norm(x) * (1 + gamma(label)) + beta(label)
pub struct Spade {
    param_free_norm: FeatureNorm,
    mlp_shared: NormConv2d,
    mlp_gamma: NormConv2d,
    mlp_beta: NormConv2d,
}

impl Spade {
    /// * `sub_norm` - parameter-free normalization of the features
    /// * `norm_nc` - number of feature channels
    /// * `label_nc` - number of conditioning channels
    /// * `n_hidden` - width of the shared embedding
    pub fn new(
        sub_norm: SubNorm,
        norm_nc: usize,
        label_nc: usize,
        n_hidden: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        let param_free_norm = FeatureNorm::new(sub_norm, norm_nc, false, vs.pp("param_free_norm"))?;
        let mlp_shared = NormConv2d::plain(ConvSpec::new(label_nc, n_hidden, 3, 1, 1), vs.pp("mlp_shared"))?;
        let mlp_gamma = NormConv2d::plain(ConvSpec::new(n_hidden, norm_nc, 3, 1, 1), vs.pp("mlp_gamma"))?;
        let mlp_beta = NormConv2d::plain(ConvSpec::new(n_hidden, norm_nc, 3, 1, 1), vs.pp("mlp_beta"))?;
        Ok(Self {
            param_free_norm,
            mlp_shared,
            mlp_gamma,
            mlp_beta,
        })
    }

    pub fn forward_t(&self, x: &Tensor, label: &Tensor, train: bool) -> Result<Tensor> {
        let normalized = self.param_free_norm.forward_t(x, train)?;

        let (_, _, h, w) = x.dims4()?;
        let label = nearest_resize(label, h, w)?;
        let actv = ConvActivation::Relu.apply(&self.mlp_shared.forward_t(&label, train)?)?;
        let gamma = self.mlp_gamma.forward_t(&actv, train)?;
        let beta = self.mlp_beta.forward_t(&actv, train)?;

        normalized.mul(&(gamma + 1.)?)?.add(&beta)
    }
}

/// Residual block with SPADE normalization; a learned shortcut is
/// used when the number of channels changes.
pub struct SpadeResBlock {
    conv_0: NormConv2d,
    conv_1: NormConv2d,
    norm_0: Spade,
    norm_1: Spade,
    shortcut: Option<(NormConv2d, Spade)>,
}

impl SpadeResBlock {
    pub fn new(
        fin: usize,
        fout: usize,
        norm: NormKind,
        label_nc: usize,
        n_hidden: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        let fmiddle = fin.min(fout);
        let conv_norm = NormKind {
            spectral: norm.spectral,
            sub_norm: SubNorm::Identity,
        };

        let conv_0 = NormConv2d::new(ConvSpec::new(fin, fmiddle, 3, 1, 1), conv_norm, vs.pp("conv_0"))?;
        let conv_1 = NormConv2d::new(ConvSpec::new(fmiddle, fout, 3, 1, 1), conv_norm, vs.pp("conv_1"))?;
        let norm_0 = Spade::new(norm.sub_norm, fin, label_nc, n_hidden, vs.pp("norm_0"))?;
        let norm_1 = Spade::new(norm.sub_norm, fmiddle, label_nc, n_hidden, vs.pp("norm_1"))?;

        let shortcut = if fin != fout {
            let conv_s = NormConv2d::new(ConvSpec::new(fin, fout, 1, 1, 0), conv_norm, vs.pp("conv_s"))?;
            let norm_s = Spade::new(norm.sub_norm, fin, label_nc, n_hidden, vs.pp("norm_s"))?;
            Some((conv_s, norm_s))
        } else {
            None
        };

        Ok(Self {
            conv_0,
            conv_1,
            norm_0,
            norm_1,
            shortcut,
        })
    }

    pub fn forward_t(&self, x: &Tensor, label: &Tensor, train: bool) -> Result<Tensor> {
        let x_s = match &self.shortcut {
            Some((conv_s, norm_s)) => conv_s.forward_t(&norm_s.forward_t(x, label, train)?, train)?,
            None => x.clone(),
        };

        let dx = self.norm_0.forward_t(x, label, train)?;
        let dx = self
            .conv_0
            .forward_t(&candle_nn::ops::leaky_relu(&dx, LEAKY_SLOPE)?, train)?;
        let dx = self.norm_1.forward_t(&dx, label, train)?;
        let dx = self
            .conv_1
            .forward_t(&candle_nn::ops::leaky_relu(&dx, LEAKY_SLOPE)?, train)?;

        x_s + dx
    }
}

pub struct SpadeGeneratorArgs {
    pub label_nc: usize,
    pub out_channels: usize,
    pub ngf: usize,
    pub w_dim: usize,
    pub crop_size: usize,
    pub n_hidden: usize,
    pub norm: NormKind,
}

/// Generator decoding a latent code into an image while modulating
/// every block by the conditioning map.
///
/// Variables:
/// * `gen.fc.{weight,bias}`
/// * `gen.{head_0,G_middle_0,G_middle_1,up_0..up_3}.*`
/// * `gen.conv_img.*`
pub struct SpadeGenerator {
    w_dim: usize,
    ngf: usize,
    sh: usize,
    sw: usize,
    fc: Linear,
    head_0: SpadeResBlock,
    middle: Vec<SpadeResBlock>,
    up_blocks: Vec<SpadeResBlock>,
    conv_img: NormConv2d,
}

impl SpadeGenerator {
    pub fn new(args: SpadeGeneratorArgs, vs: VarBuilder) -> Result<Self> {
        let divisor = 1 << NUM_UPSAMPLING;
        if args.crop_size % divisor != 0 || args.crop_size < divisor {
            return Err(candle_core::Error::Msg(format!(
                "crop size {} must be a positive multiple of {}",
                args.crop_size, divisor
            )));
        }
        let sh = args.crop_size / divisor;
        let sw = sh;

        let nf = args.ngf;
        let label_nc = args.label_nc;
        let n_hidden = args.n_hidden;
        let norm = args.norm;

        let fc = candle_nn::linear(args.w_dim, 16 * nf * sh * sw, vs.pp("gen.fc"))?;

        let head_0 = SpadeResBlock::new(16 * nf, 16 * nf, norm, label_nc, n_hidden, vs.pp("gen.head_0"))?;

        let middle = (0..2)
            .map(|j| {
                SpadeResBlock::new(
                    16 * nf,
                    16 * nf,
                    norm,
                    label_nc,
                    n_hidden,
                    vs.pp(format!("gen.G_middle_{}", j)),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let widths = [16 * nf, 8 * nf, 4 * nf, 2 * nf, nf];
        let up_blocks = widths
            .windows(2)
            .enumerate()
            .map(|(j, w)| {
                SpadeResBlock::new(w[0], w[1], norm, label_nc, n_hidden, vs.pp(format!("gen.up_{}", j)))
            })
            .collect::<Result<Vec<_>>>()?;

        let conv_img = NormConv2d::plain(ConvSpec::new(nf, args.out_channels, 3, 1, 1), vs.pp("gen.conv_img"))?;

        Ok(Self {
            w_dim: args.w_dim,
            ngf: nf,
            sh,
            sw,
            fc,
            head_0,
            middle,
            up_blocks,
            conv_img,
        })
    }

    fn up(x: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        x.upsample_nearest2d(2 * h, 2 * w)
    }
}

impl ImageGeneratorT for SpadeGenerator {
    fn forward_t(&self, label_nchw: &Tensor, z_nk: &Tensor, train: bool) -> Result<Tensor> {
        let n = z_nk.dim(0)?;
        let x = self
            .fc
            .forward(z_nk)?
            .reshape((n, 16 * self.ngf, self.sh, self.sw))?;

        let mut x = self.head_0.forward_t(&x, label_nchw, train)?;
        x = Self::up(&x)?;

        for block in self.middle.iter() {
            x = block.forward_t(&x, label_nchw, train)?;
        }

        for block in self.up_blocks.iter() {
            x = Self::up(&x)?;
            x = block.forward_t(&x, label_nchw, train)?;
        }

        let x = candle_nn::ops::leaky_relu(&x, LEAKY_SLOPE)?;
        self.conv_img.forward_t(&x, train)?.tanh()
    }

    fn dim_latent(&self) -> usize {
        self.w_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn generates_crop_sized_images() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let gen = SpadeGenerator::new(
            SpadeGeneratorArgs {
                label_nc: 1,
                out_channels: 1,
                ngf: 2,
                w_dim: 5,
                crop_size: 64,
                n_hidden: 4,
                norm: NormKind::parse("spectralinstance")?,
            },
            vb,
        )?;

        let label = Tensor::randn(0f32, 1f32, (2, 1, 64, 64), &Device::Cpu)?;
        let z = Tensor::randn(0f32, 1f32, (2, 5), &Device::Cpu)?;
        let fake = gen.forward_t(&label, &z, true)?;
        assert_eq!(fake.dims(), &[2, 1, 64, 64]);

        let max_abs = fake.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max_abs <= 1.0);
        Ok(())
    }

    #[test]
    fn rejects_crop_not_divisible() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let gen = SpadeGenerator::new(
            SpadeGeneratorArgs {
                label_nc: 1,
                out_channels: 1,
                ngf: 2,
                w_dim: 5,
                crop_size: 100,
                n_hidden: 4,
                norm: NormKind::parse("instance")?,
            },
            vb,
        );
        assert!(gen.is_err());
        Ok(())
    }
}
