use crate::lentil_common::*;
use crate::train_options::{LossConfig, ModelConfig};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_util::candle_conv_encoder::*;
use candle_util::candle_loss_functions::*;
use candle_util::candle_model_traits::*;
use candle_util::candle_normalization::NormKind;
use candle_util::candle_patch_discriminator::*;
use candle_util::candle_spade_generator::*;

/// single-channel labels and images
const IMAGE_CHANNELS: usize = 1;

/// Named loss terms of one step; the optimized loss is their sum
pub struct StepLosses {
    pub terms: Vec<(Box<str>, Tensor)>,
}

impl StepLosses {
    fn new() -> Self {
        Self { terms: vec![] }
    }

    fn push(&mut self, name: &str, loss: Tensor) {
        self.terms.push((name.into(), loss));
    }

    pub fn total(&self) -> anyhow::Result<Tensor> {
        let mut terms = self.terms.iter().map(|(_, t)| t);
        let first = terms
            .next()
            .ok_or_else(|| anyhow::anyhow!("no loss terms"))?;
        let mut tot = first.clone();
        for t in terms {
            tot = (tot + t)?;
        }
        Ok(tot)
    }

    pub fn to_loss_map(&self) -> anyhow::Result<LossMap> {
        let mut ret = LossMap::new();
        for (name, t) in self.terms.iter() {
            ret.insert(name.clone(), scalar_value(t)?);
        }
        Ok(ret)
    }
}

pub fn scalar_value(t: &Tensor) -> anyhow::Result<f32> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

/// Generator step outputs
pub struct GeneratorStep {
    pub losses: StepLosses,
    /// unweighted monitoring values, not optimized
    pub log_losses: StepLosses,
    pub fake: Tensor,
}

/// Which networks a checkpoint file holds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkKind {
    Encoder,
    Generator,
    Discriminator,
}

impl NetworkKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Encoder => "E",
            Self::Generator => "G",
            Self::Discriminator => "D",
        }
    }
}

/// `{dir}/{label}_net_{E,G,D}.safetensors`
pub fn checkpoint_file(dir: &Path, label: CheckpointLabel, kind: NetworkKind) -> PathBuf {
    dir.join(format!("{}_net_{}.safetensors", label, kind.tag()))
}

///
/// Encoder, SPADE generator and multiscale discriminator, each with
/// its own variable map so that they can be optimized and saved
/// separately.
///
pub struct Pix2PixModel {
    pub encoder: ConvEncoder,
    pub generator: SpadeGenerator,
    pub discriminator: MultiscaleDiscriminator,
    pub var_e: VarMap,
    pub var_g: VarMap,
    pub var_d: VarMap,
    loss_config: LossConfig,
    device: Device,
}

impl Pix2PixModel {
    pub fn new(config: &ModelConfig, loss_config: LossConfig, device: &Device) -> anyhow::Result<Self> {
        config.validate()?;

        let var_e = VarMap::new();
        let var_g = VarMap::new();
        let var_d = VarMap::new();

        let encoder = ConvEncoder::new(
            ConvEncoderArgs {
                in_channels: IMAGE_CHANNELS,
                ngf: config.ngf,
                w_dim: config.w_dim,
                crop_size: config.crop_size,
                norm: NormKind::parse(&config.norm_e)?,
            },
            VarBuilder::from_varmap(&var_e, DType::F32, device),
        )?;

        let generator = SpadeGenerator::new(
            SpadeGeneratorArgs {
                label_nc: IMAGE_CHANNELS,
                out_channels: IMAGE_CHANNELS,
                ngf: config.ngf,
                w_dim: config.w_dim,
                crop_size: config.crop_size,
                n_hidden: config.spade_hidden,
                norm: NormKind::parse(&config.norm_g)?,
            },
            VarBuilder::from_varmap(&var_g, DType::F32, device),
        )?;

        let discriminator = MultiscaleDiscriminator::new(
            PatchDiscriminatorArgs {
                in_channels: 2 * IMAGE_CHANNELS,
                ndf: config.ndf,
                n_layers: config.n_layers_d,
                norm: NormKind::parse(&config.norm_d)?,
            },
            config.num_d,
            VarBuilder::from_varmap(&var_d, DType::F32, device),
        )?;

        Ok(Self {
            encoder,
            generator,
            discriminator,
            var_e,
            var_g,
            var_d,
            loss_config,
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// encoder and generator variables, optimized together
    pub fn generator_vars(&self) -> Vec<candle_core::Var> {
        let mut ret = self.var_e.all_vars();
        ret.extend(self.var_g.all_vars());
        ret
    }

    pub fn discriminator_vars(&self) -> Vec<candle_core::Var> {
        self.var_d.all_vars()
    }

    /// Encode style images and synthesize from the label maps
    ///
    /// # Returns
    /// `(fake, encoder output)`
    pub fn generate_fake(
        &self,
        label: &Tensor,
        style: &Tensor,
        train: bool,
    ) -> anyhow::Result<(Tensor, EncoderOutput)> {
        let enc = self.encoder.forward_t(style, train)?;
        let z = reparameterize(&enc.mean, &enc.log_var, train)?;
        let fake = self.generator.forward_t(label, &z, train)?;
        Ok((fake, enc))
    }

    /// Discriminate fake and real in one batch
    ///
    /// # Returns
    /// `(pred_fake, pred_real)`, each per scale
    pub fn discriminate(
        &self,
        label: &Tensor,
        fake: &Tensor,
        real: &Tensor,
        train: bool,
    ) -> anyhow::Result<(Vec<Vec<Tensor>>, Vec<Vec<Tensor>>)> {
        let n = label.dim(0)?;
        let fake_concat = Tensor::cat(&[label, fake], 1)?;
        let real_concat = Tensor::cat(&[label, real], 1)?;
        let both = Tensor::cat(&[&fake_concat, &real_concat], 0)?;

        let preds = self.discriminator.forward_t(&both, train)?;

        let mut pred_fake = Vec::with_capacity(preds.len());
        let mut pred_real = Vec::with_capacity(preds.len());
        for feats in preds {
            pred_fake.push(
                feats
                    .iter()
                    .map(|f| f.narrow(0, 0, n))
                    .collect::<candle_core::Result<Vec<_>>>()?,
            );
            pred_real.push(
                feats
                    .iter()
                    .map(|f| f.narrow(0, n, n))
                    .collect::<candle_core::Result<Vec<_>>>()?,
            );
        }
        Ok((pred_fake, pred_real))
    }

    pub fn compute_generator_loss(
        &self,
        batch: &ImageMinibatch,
        train: bool,
    ) -> anyhow::Result<GeneratorStep> {
        let cfg = &self.loss_config;
        let mut losses = StepLosses::new();
        let mut log_losses = StepLosses::new();

        let (fake, enc) = self.generate_fake(&batch.label, &batch.style, train)?;

        let kld = gaussian_kl_loss(&enc.mean, &enc.log_var)?.mean_all()?;
        losses.push("KLD", (&kld * cfg.lambda_kld)?);
        log_losses.push("log_KLD", kld);

        let (pred_fake, pred_real) = self.discriminate(&batch.label, &fake, &batch.image, train)?;

        losses.push("GAN", cfg.gan_mode.generator_loss_multiscale(&pred_fake)?);

        if cfg.use_gan_feat_loss {
            let feat = feature_matching_loss(&pred_fake, &pred_real)?;
            losses.push("GAN_Feat", (feat * cfg.lambda_feat)?);
        }

        let l1 = l1_loss(&fake, &batch.image)?;
        if cfg.lambda_l1 > 0. {
            losses.push("L1", (&l1 * cfg.lambda_l1)?);
        }
        log_losses.push("log_L1", l1);

        Ok(GeneratorStep {
            losses,
            log_losses,
            fake,
        })
    }

    pub fn compute_discriminator_loss(
        &self,
        batch: &ImageMinibatch,
        train: bool,
    ) -> anyhow::Result<StepLosses> {
        let gan_mode = self.loss_config.gan_mode;
        let mut losses = StepLosses::new();

        let (fake, _) = self.generate_fake(&batch.label, &batch.style, train)?;
        let fake = fake.detach();

        let (pred_fake, pred_real) = self.discriminate(&batch.label, &fake, &batch.image, train)?;

        losses.push("D_Fake", gan_mode.discriminator_loss_multiscale(&pred_fake, false)?);
        losses.push("D_real", gan_mode.discriminator_loss_multiscale(&pred_real, true)?);
        Ok(losses)
    }

    /// All the losses in inference mode, without touching parameters
    ///
    /// # Returns
    /// `(losses, fake)`
    pub fn evaluate_losses(&self, batch: &ImageMinibatch) -> anyhow::Result<(LossMap, Tensor)> {
        let g_step = self.compute_generator_loss(batch, false)?;
        let d_losses = self.compute_discriminator_loss(batch, false)?;

        let mut ret = g_step.losses.to_loss_map()?;
        ret.extend(g_step.log_losses.to_loss_map()?);
        ret.extend(d_losses.to_loss_map()?);
        Ok((ret, g_step.fake.detach()))
    }

    /// Latent means of style images, no sampling
    pub fn encode_mean(&self, style: &Tensor) -> anyhow::Result<Tensor> {
        Ok(self.encoder.forward_t(style, false)?.mean)
    }

    /// Synthesize from label maps given latent codes
    pub fn synthesize(&self, label: &Tensor, z: &Tensor) -> anyhow::Result<Tensor> {
        Ok(self.generator.forward_t(label, z, false)?)
    }

    fn var_map(&self, kind: NetworkKind) -> &VarMap {
        match kind {
            NetworkKind::Encoder => &self.var_e,
            NetworkKind::Generator => &self.var_g,
            NetworkKind::Discriminator => &self.var_d,
        }
    }

    fn var_map_mut(&mut self, kind: NetworkKind) -> &mut VarMap {
        match kind {
            NetworkKind::Encoder => &mut self.var_e,
            NetworkKind::Generator => &mut self.var_g,
            NetworkKind::Discriminator => &mut self.var_d,
        }
    }

    /// Write `{label}_net_{E,G,D}.safetensors` under `dir`
    pub fn save(&self, dir: &Path, label: CheckpointLabel) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        for kind in [
            NetworkKind::Encoder,
            NetworkKind::Generator,
            NetworkKind::Discriminator,
        ] {
            let file = checkpoint_file(dir, label, kind);
            self.var_map(kind).save(&file)?;
        }
        info!("saved the {} networks in {}", label, dir.display());
        Ok(())
    }

    /// Restore the listed networks from `dir`
    pub fn load(&mut self, dir: &Path, label: CheckpointLabel, kinds: &[NetworkKind]) -> anyhow::Result<()> {
        for &kind in kinds {
            let file = checkpoint_file(dir, label, kind);
            if !file.exists() {
                anyhow::bail!("missing checkpoint {}", file.display());
            }
            self.var_map_mut(kind)
                .load(&file)
                .map_err(|e| anyhow::anyhow!("failed to load {}: {}", file.display(), e))?;
        }
        info!("loaded the {} networks from {}", label, dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            ngf: 2,
            ndf: 4,
            w_dim: 3,
            load_size: 32,
            crop_size: 32,
            norm_e: "spectralinstance".into(),
            norm_g: "spectralinstance".into(),
            norm_d: "spectralinstance".into(),
            spade_hidden: 4,
            n_layers_d: 2,
            num_d: 2,
        }
    }

    fn tiny_batch(n: usize, dev: &Device) -> anyhow::Result<ImageMinibatch> {
        Ok(ImageMinibatch {
            label: Tensor::rand(-1f32, 1f32, (n, 1, 32, 32), dev)?,
            image: Tensor::rand(-1f32, 1f32, (n, 1, 32, 32), dev)?,
            style: Tensor::rand(-1f32, 1f32, (n, 1, 32, 32), dev)?,
            names: (0..n).map(|i| format!("s{}", i).into_boxed_str()).collect(),
        })
    }

    #[test]
    fn loss_terms_by_configuration() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let model = Pix2PixModel::new(&tiny_config(), LossConfig::default(), &dev)?;
        let batch = tiny_batch(2, &dev)?;

        let g_step = model.compute_generator_loss(&batch, true)?;
        let names: Vec<&str> = g_step.losses.terms.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(names, vec!["KLD", "GAN", "GAN_Feat", "L1"]);
        assert_eq!(g_step.fake.dims(), &[2, 1, 32, 32]);
        assert!(scalar_value(&g_step.losses.total()?)?.is_finite());

        let d_losses = model.compute_discriminator_loss(&batch, true)?.to_loss_map()?;
        assert!(d_losses.contains_key("D_Fake") && d_losses.contains_key("D_real"));

        let no_extras = LossConfig {
            use_gan_feat_loss: false,
            lambda_l1: 0.,
            ..LossConfig::default()
        };
        let model = Pix2PixModel::new(&tiny_config(), no_extras, &dev)?;
        let g_step = model.compute_generator_loss(&batch, true)?;
        let names: Vec<&str> = g_step.losses.terms.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(names, vec!["KLD", "GAN"]);
        let log_names: Vec<&str> = g_step.log_losses.terms.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(log_names, vec!["log_KLD", "log_L1"]);
        Ok(())
    }

    #[test]
    fn split_discriminator_outputs() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let model = Pix2PixModel::new(&tiny_config(), LossConfig::default(), &dev)?;
        let batch = tiny_batch(3, &dev)?;
        let (pred_fake, pred_real) = model.discriminate(&batch.label, &batch.image, &batch.image, false)?;
        assert_eq!(pred_fake.len(), 2);
        for (f, r) in pred_fake.iter().zip(pred_real.iter()) {
            assert_eq!(f.len(), r.len());
            assert_eq!(f[0].dim(0)?, 3);
            assert_eq!(f.last().unwrap().dims(), r.last().unwrap().dims());
        }
        Ok(())
    }

    #[test]
    fn save_and_load_networks() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let model = Pix2PixModel::new(&tiny_config(), LossConfig::default(), &dev)?;
        model.save(dir.path(), CheckpointLabel::Epoch(3))?;
        for kind in ["E", "G", "D"] {
            assert!(dir.path().join(format!("3_net_{}.safetensors", kind)).exists());
        }

        let mut other = Pix2PixModel::new(&tiny_config(), LossConfig::default(), &dev)?;
        other.load(
            dir.path(),
            CheckpointLabel::Epoch(3),
            &[NetworkKind::Encoder, NetworkKind::Generator],
        )?;

        let style = Tensor::rand(-1f32, 1f32, (1, 1, 32, 32), &dev)?;
        let a = model.encode_mean(&style)?.flatten_all()?.to_vec1::<f32>()?;
        let b = other.encode_mean(&style)?.flatten_all()?.to_vec1::<f32>()?;
        for (x, y) in a.iter().zip(b.iter()) {
            approx::assert_abs_diff_eq!(x, y, epsilon = 1e-5);
        }

        assert!(other
            .load(dir.path(), CheckpointLabel::Latest, &[NetworkKind::Discriminator])
            .is_err());
        Ok(())
    }
}
