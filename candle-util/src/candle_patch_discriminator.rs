use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;
use crate::candle_normalization::*;
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

const MAX_WIDTH: usize = 512;

pub struct PatchDiscriminatorArgs {
    pub in_channels: usize,
    pub ndf: usize,
    pub n_layers: usize,
    pub norm: NormKind,
}

/// PatchGAN discriminator: kernel 4 convolutions with leaky ReLU,
/// the last layer predicts realism per patch
pub struct PatchDiscriminator {
    layers: StackLayers<NormConv2d>,
}

impl PatchDiscriminator {
    pub fn new(args: &PatchDiscriminatorArgs, vs: VarBuilder) -> Result<Self> {
        let kw = 4;
        let pw = 2;
        let act = ConvActivation::LeakyRelu(0.2);

        let mut layers = StackLayers::<NormConv2d>::new();

        let mut nf = args.ndf;
        layers.push_with_act(
            NormConv2d::plain(ConvSpec::new(args.in_channels, nf, kw, 2, pw), vs.pp("model0"))?,
            act,
        );

        for n in 1..args.n_layers.max(1) {
            let nf_prev = nf;
            nf = (nf * 2).min(MAX_WIDTH);
            let stride = if n == args.n_layers - 1 { 1 } else { 2 };
            layers.push_with_act(
                NormConv2d::new(
                    ConvSpec::new(nf_prev, nf, kw, stride, pw),
                    args.norm,
                    vs.pp(format!("model{}", n)),
                )?,
                act,
            );
        }

        let n = layers.len();
        layers.push(NormConv2d::plain(
            ConvSpec::new(nf, 1, kw, 1, pw),
            vs.pp(format!("model{}", n)),
        )?);

        Ok(Self { layers })
    }

    pub fn forward_features_t(&self, x: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        self.layers.forward_features_t(x, train)
    }
}

/// Several PatchGAN discriminators looking at progressively
/// down-sampled copies of the input
///
/// Variables: `disc.scale{s}.model{l}.*`
pub struct MultiscaleDiscriminator {
    scales: Vec<PatchDiscriminator>,
}

impl MultiscaleDiscriminator {
    pub fn new(args: PatchDiscriminatorArgs, num_d: usize, vs: VarBuilder) -> Result<Self> {
        let scales = (0..num_d.max(1))
            .map(|s| PatchDiscriminator::new(&args, vs.pp(format!("disc.scale{}", s))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { scales })
    }
}

impl ImageDiscriminatorT for MultiscaleDiscriminator {
    fn forward_t(&self, x_nchw: &Tensor, train: bool) -> Result<Vec<Vec<Tensor>>> {
        let mut ret = Vec::with_capacity(self.scales.len());
        let mut x = x_nchw.clone();
        for (s, disc) in self.scales.iter().enumerate() {
            ret.push(disc.forward_features_t(&x, train)?);
            if s + 1 < self.scales.len() {
                x = x.avg_pool2d(2)?;
            }
        }
        Ok(ret)
    }

    fn num_scales(&self) -> usize {
        self.scales.len()
    }
}
