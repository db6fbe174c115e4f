use crate::candle_image_ops::instance_standardize;
use candle_core::{Result, Tensor, Var};
use candle_nn::{BatchNorm, BatchNormConfig, ModuleT, VarBuilder};

const NORM_EPS: f64 = 1e-5;

/// Normalization that follows a convolution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubNorm {
    Instance,
    Batch,
    Identity,
}

/// Parsed normalization option, e.g., `spectralinstance`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NormKind {
    pub spectral: bool,
    pub sub_norm: SubNorm,
}

impl NormKind {
    /// Parse `[spectral]{instance,batch,syncbatch,none}`
    pub fn parse(name: &str) -> anyhow::Result<Self> {
        let name = name.trim().to_lowercase();
        let (spectral, rest) = match name.strip_prefix("spectral") {
            Some(rest) => (true, rest),
            None => (false, name.as_str()),
        };
        let sub_norm = match rest {
            "instance" => SubNorm::Instance,
            "batch" | "syncbatch" => SubNorm::Batch,
            "" | "none" => SubNorm::Identity,
            _ => return Err(anyhow::anyhow!("unknown normalization: {}", name)),
        };
        Ok(Self { spectral, sub_norm })
    }

    pub fn has_norm(&self) -> bool {
        self.sub_norm != SubNorm::Identity
    }
}

impl std::str::FromStr for NormKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        Self::parse(s)
    }
}

/////////////////////////////////////
// normalization after convolution //
/////////////////////////////////////

pub enum FeatureNorm {
    Instance,
    Batch(BatchNorm),
    Identity,
}

impl FeatureNorm {
    /// * `affine` - learn scale and shift (batch norm only)
    pub fn new(sub_norm: SubNorm, channels: usize, affine: bool, vb: VarBuilder) -> Result<Self> {
        Ok(match sub_norm {
            SubNorm::Instance => Self::Instance,
            SubNorm::Identity => Self::Identity,
            SubNorm::Batch => {
                let config = BatchNormConfig {
                    eps: NORM_EPS,
                    remove_mean: true,
                    affine,
                    momentum: 0.1,
                };
                Self::Batch(candle_nn::batch_norm(channels, config, vb)?)
            }
        })
    }
}

impl ModuleT for FeatureNorm {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Instance => instance_standardize(x, NORM_EPS),
            Self::Batch(bn) => bn.forward_t(x, train),
            Self::Identity => Ok(x.clone()),
        }
    }
}

/////////////////////////
// spectral conv layer //
/////////////////////////

/// Divide a weight by its largest singular value. The singular
/// vector estimate `u` is refined by one power iteration step per
/// training forward pass; it never receives gradients, but it is
/// saved along with the weights when it comes from a `VarMap`.
pub struct SpectralWeight {
    weight: Tensor,
    u: Var,
}

impl SpectralWeight {
    /// * `weight` - (out x ...) weight
    /// * `u` - (out x 1) initial left singular vector estimate
    pub fn new(weight: Tensor, u: Tensor) -> Result<Self> {
        let u = Var::from_tensor(&u)?;
        Ok(Self { weight, u })
    }

    pub fn forward_t(&self, train: bool) -> Result<Tensor> {
        let n_out = self.weight.dim(0)?;
        let w_mat = self.weight.reshape((n_out, ()))?;
        let w_fixed = w_mat.detach();

        let u = l2_normalize(&self.u.as_tensor().detach())?;
        let v = l2_normalize(&w_fixed.t()?.matmul(&u)?)?;
        let u = if train {
            let u = l2_normalize(&w_fixed.matmul(&v)?)?;
            self.u.set(&u)?;
            u
        } else {
            u
        };

        let sigma = u.t()?.matmul(&w_mat)?.matmul(&v)?;
        self.weight.broadcast_div(&sigma.reshape((1, 1, 1, 1))?)
    }
}

fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = (x.sqr()?.sum_all()?.sqrt()? + 1e-12)?;
    x.broadcast_div(&norm)
}

#[derive(Clone, Copy, Debug)]
pub struct ConvSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvSpec {
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
        }
    }
}

/// 2d convolution optionally with spectral normalization on the
/// weight followed by a feature normalization layer.
///
/// Variables:
/// * `{prefix}.conv.weight`
/// * `{prefix}.conv.weight_u` (spectral norm, not trained)
/// * `{prefix}.conv.bias` (only without feature normalization)
/// * `{prefix}.norm.*` (batch norm only)
pub struct NormConv2d {
    spec: ConvSpec,
    weight: Tensor,
    spectral: Option<SpectralWeight>,
    bias: Option<Tensor>,
    norm: FeatureNorm,
}

impl NormConv2d {
    pub fn new(spec: ConvSpec, norm: NormKind, vb: VarBuilder) -> Result<Self> {
        let fan_in = spec.in_channels * spec.kernel * spec.kernel;
        let bound = 1. / (fan_in as f64).sqrt();
        let init_ws = candle_nn::init::Init::Uniform {
            lo: -bound,
            up: bound,
        };

        let weight = vb.pp("conv").get_with_hints(
            (spec.out_channels, spec.in_channels, spec.kernel, spec.kernel),
            "weight",
            init_ws,
        )?;

        let bias = if norm.has_norm() {
            None
        } else {
            Some(vb.pp("conv").get_with_hints(spec.out_channels, "bias", init_ws)?)
        };

        let spectral = if norm.spectral {
            let u = vb.pp("conv").get_with_hints(
                (spec.out_channels, 1),
                "weight_u",
                candle_nn::init::Init::Randn { mean: 0., stdev: 1. },
            )?;
            Some(SpectralWeight::new(weight.clone(), u)?)
        } else {
            None
        };

        let norm = FeatureNorm::new(norm.sub_norm, spec.out_channels, true, vb.pp("norm"))?;

        Ok(Self {
            spec,
            weight,
            spectral,
            bias,
            norm,
        })
    }

    /// plain convolution with bias, no normalization
    pub fn plain(spec: ConvSpec, vb: VarBuilder) -> Result<Self> {
        Self::new(
            spec,
            NormKind {
                spectral: false,
                sub_norm: SubNorm::Identity,
            },
            vb,
        )
    }
}

impl ModuleT for NormConv2d {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let weight = match &self.spectral {
            Some(sn) => sn.forward_t(train)?,
            None => self.weight.clone(),
        };

        let h = x.conv2d(&weight, self.spec.padding, self.spec.stride, 1, 1)?;

        let h = match &self.bias {
            Some(b) => h.broadcast_add(&b.reshape((1, self.spec.out_channels, 1, 1))?)?,
            None => h,
        };

        self.norm.forward_t(&h, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn parse_norm_names() -> anyhow::Result<()> {
        let k = NormKind::parse("spectralinstance")?;
        assert!(k.spectral);
        assert_eq!(k.sub_norm, SubNorm::Instance);

        let k: NormKind = "batch".parse()?;
        assert!(!k.spectral);
        assert_eq!(k.sub_norm, SubNorm::Batch);

        assert_eq!(NormKind::parse("syncbatch")?.sub_norm, SubNorm::Batch);
        assert_eq!(NormKind::parse("spectral")?.sub_norm, SubNorm::Identity);
        assert!(!NormKind::parse("none")?.has_norm());
        assert!(NormKind::parse("layer").is_err());
        Ok(())
    }

    #[test]
    fn spectral_weight_has_unit_norm() -> Result<()> {
        let w = Tensor::randn(0f32, 1f32, (6, 3, 3, 3), &Device::Cpu)?;
        let u = Tensor::randn(0f32, 1f32, (6, 1), &Device::Cpu)?;
        let sn = SpectralWeight::new(w, u)?;
        let mut w_sn = sn.forward_t(true)?;
        for _ in 0..50 {
            w_sn = sn.forward_t(true)?;
        }
        // after convergence the top singular value is ~1
        let w_mat = w_sn.reshape((6, 27))?;
        let mut v = Tensor::ones((27, 1), DType::F32, &Device::Cpu)?;
        for _ in 0..100 {
            v = l2_normalize(&w_mat.t()?.matmul(&w_mat.matmul(&v)?)?)?;
        }
        let sigma = w_mat.matmul(&v)?.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        assert!((sigma - 1.0).abs() < 0.05, "sigma = {}", sigma);
        Ok(())
    }

    #[test]
    fn strided_conv_halves_spatial_size() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let conv = NormConv2d::new(
            ConvSpec::new(1, 4, 3, 2, 1),
            NormKind {
                spectral: true,
                sub_norm: SubNorm::Instance,
            },
            vb,
        )?;
        let x = Tensor::randn(0f32, 1f32, (2, 1, 16, 16), &Device::Cpu)?;
        let y = conv.forward_t(&x, true)?;
        assert_eq!(y.dims(), &[2, 4, 8, 8]);
        // weight and singular vector; no bias under a normalization layer
        assert_eq!(varmap.all_vars().len(), 2);
        assert!(varmap.data().lock().unwrap().contains_key("conv.weight_u"));
        Ok(())
    }
}
