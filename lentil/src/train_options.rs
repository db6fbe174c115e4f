use crate::lentil_common::*;

use candle_util::candle_data_loader_util::ImageTransform;
use candle_util::candle_loss_functions::GanMode;
use candle_util::candle_normalization::NormKind;
use candle_util::candle_spade_generator::NUM_UPSAMPLING;
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    pub fn to_device(&self, device_no: usize) -> anyhow::Result<candle_core::Device> {
        Ok(match self {
            ComputeDevice::Metal => candle_core::Device::new_metal(device_no)?,
            ComputeDevice::Cuda => candle_core::Device::new_cuda(device_no)?,
            ComputeDevice::Cpu => candle_core::Device::Cpu,
        })
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum GanModeArg {
    Hinge,
    Ls,
    Original,
    W,
}

impl From<GanModeArg> for GanMode {
    fn from(arg: GanModeArg) -> Self {
        match arg {
            GanModeArg::Hinge => GanMode::Hinge,
            GanModeArg::Ls => GanMode::Ls,
            GanModeArg::Original => GanMode::Original,
            GanModeArg::W => GanMode::W,
        }
    }
}

/// Everything needed to rebuild the networks; saved next to the
/// checkpoints so that inference doesn't need the training options
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelConfig {
    pub ngf: usize,
    pub ndf: usize,
    pub w_dim: usize,
    pub load_size: usize,
    pub crop_size: usize,
    pub norm_e: String,
    pub norm_g: String,
    pub norm_d: String,
    pub spade_hidden: usize,
    pub n_layers_d: usize,
    pub num_d: usize,
}

impl ModelConfig {
    pub fn to_json(&self, file_path: &Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(file_path, text)?;
        Ok(())
    }

    pub fn from_json(file_path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(file_path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", file_path.display(), e))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn transform(&self, flip: bool) -> ImageTransform {
        ImageTransform {
            load_size: self.load_size,
            crop_size: self.crop_size,
            random_crop: true,
            flip,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let divisor = 1 << NUM_UPSAMPLING;
        if self.crop_size == 0 || self.crop_size % divisor != 0 {
            anyhow::bail!("crop size {} should be a multiple of {}", self.crop_size, divisor);
        }
        if self.load_size < self.crop_size {
            anyhow::bail!(
                "load size {} is smaller than crop size {}",
                self.load_size,
                self.crop_size
            );
        }
        if self.ngf == 0 || self.ndf == 0 || self.w_dim == 0 || self.num_d == 0 {
            anyhow::bail!("network widths, latent dimension and number of discriminators should be positive");
        }
        NormKind::parse(&self.norm_e)?;
        NormKind::parse(&self.norm_g)?;
        NormKind::parse(&self.norm_d)?;
        Ok(())
    }
}

/// Loss weights and adversarial objective
#[derive(Clone, Copy, Debug)]
pub struct LossConfig {
    pub gan_mode: GanMode,
    pub lambda_feat: f64,
    pub lambda_kld: f64,
    pub lambda_l1: f64,
    pub use_gan_feat_loss: bool,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            gan_mode: GanMode::Hinge,
            lambda_feat: 10.0,
            lambda_kld: 0.05,
            lambda_l1: 10.0,
            use_gan_feat_loss: true,
        }
    }
}

/// Adam hyper-parameters and the learning rate schedule
#[derive(Clone, Copy, Debug)]
pub struct OptimizerConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub ttur: bool,
    pub niter: usize,
    pub niter_decay: usize,
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(
        long,
        short,
        default_value = "label2image",
        help = "Experiment name",
        long_help = "Name of the experiment.\n\
		     Checkpoints, logs and images are stored in {checkpoints_dir}/{name}/"
    )]
    pub name: Box<str>,

    #[arg(long, default_value = "checkpoints", help = "Checkpoint directory")]
    pub checkpoints_dir: Box<str>,

    #[arg(
        long,
        short = 'd',
        required = true,
        help = "Training data root",
        long_help = "Training data root with sub-directories:\n\
		     - label/ conditioning maps\n\
		     - image/ target images\n\
		     - style/ style references (optional; image/ otherwise)\n\
		     Files are paired by their names without extension."
    )]
    pub dataroot: Box<str>,

    #[arg(
        long,
        help = "Validation data root",
        long_help = "Validation data root with the same layout as the training data.\n\
		     If not specified, the training data are used without augmentation."
    )]
    pub val_dataroot: Option<Box<str>>,

    #[arg(long, short = 'b', default_value_t = 1, help = "Minibatch size")]
    pub batch_size: usize,

    #[arg(
        long,
        default_value_t = 286,
        help = "Scale images to this size",
        long_help = "Scale images to this size before cropping."
    )]
    pub load_size: usize,

    #[arg(
        long,
        default_value_t = 256,
        help = "Crop to this size",
        long_help = "Crop to this size after scaling.\n\
		     Must be a multiple of 32; crops of 256 or more add a sixth encoder block."
    )]
    pub crop_size: usize,

    #[arg(long, default_value_t = 64, help = "Generator/encoder base width")]
    pub ngf: usize,

    #[arg(long, default_value_t = 64, help = "Discriminator base width")]
    pub ndf: usize,

    #[arg(
        long,
        short = 'z',
        default_value_t = 256,
        help = "Latent dimension",
        long_help = "Dimension of the latent style code produced by the encoder."
    )]
    pub w_dim: usize,

    #[arg(
        long,
        default_value = "spectralinstance",
        help = "Encoder normalization",
        long_help = "Normalization of encoder layers:\n\
		     [spectral]{instance,batch,syncbatch,none}"
    )]
    pub norm_e: String,

    #[arg(
        long,
        default_value = "spectralinstance",
        help = "Generator normalization",
        long_help = "Normalization of generator layers.\n\
		     `spectral` applies to the residual convolutions;\n\
		     the rest selects the parameter-free norm inside SPADE."
    )]
    pub norm_g: String,

    #[arg(long, default_value = "spectralinstance", help = "Discriminator normalization")]
    pub norm_d: String,

    #[arg(long, default_value_t = 128, help = "Hidden width of the SPADE modulation")]
    pub spade_hidden: usize,

    #[arg(long, default_value_t = 4, help = "Layers in each discriminator")]
    pub n_layers_d: usize,

    #[arg(long, default_value_t = 2, help = "Number of discriminator scales")]
    pub num_d: usize,

    #[arg(long, value_enum, default_value = "hinge", help = "Adversarial loss")]
    pub gan_mode: GanModeArg,

    #[arg(long, default_value_t = 10.0, help = "Weight of the feature matching loss")]
    pub lambda_feat: f64,

    #[arg(long, default_value_t = 0.05, help = "Weight of the KL divergence")]
    pub lambda_kld: f64,

    #[arg(
        long,
        default_value_t = 10.0,
        help = "Weight of the L1 reconstruction loss",
        long_help = "Weight of the L1 distance between generated and target images.\n\
		     Set to 0 to disable."
    )]
    pub lambda_l1: f64,

    #[arg(long, default_value_t = false, help = "Disable the feature matching loss")]
    pub no_gan_feat_loss: bool,

    #[arg(long, default_value_t = 50, help = "Epochs at the initial learning rate")]
    pub niter: usize,

    #[arg(
        long,
        default_value_t = 0,
        help = "Epochs of linear learning rate decay",
        long_help = "Epochs to linearly decay the learning rate to zero after `niter` epochs."
    )]
    pub niter_decay: usize,

    #[arg(long, default_value_t = 2e-4, help = "Initial learning rate")]
    pub lr: f64,

    #[arg(long, default_value_t = 0.0, help = "Adam beta1 (only with --no-ttur)")]
    pub beta1: f64,

    #[arg(long, default_value_t = 0.9, help = "Adam beta2 (only with --no-ttur)")]
    pub beta2: f64,

    #[arg(
        long,
        default_value_t = false,
        help = "Disable the two time-scale update rule",
        long_help = "Without TTUR, both networks use `lr`, `beta1` and `beta2`.\n\
		     With TTUR, the generator uses lr/2 and the discriminator 2*lr,\n\
		     both with betas (0, 0.9)."
    )]
    pub no_ttur: bool,

    #[arg(long, default_value_t = 1, help = "Discriminator steps per generator step")]
    pub d_steps_per_g: usize,

    #[arg(long, default_value_t = 100, help = "Print losses every {n} samples")]
    pub print_freq: usize,

    #[arg(long, default_value_t = 100, help = "Visualize and validate every {n} samples")]
    pub display_freq: usize,

    #[arg(long, default_value_t = 5000, help = "Save the latest model every {n} samples")]
    pub save_latest_freq: usize,

    #[arg(long, default_value_t = 10, help = "Save a model copy every {n} epochs")]
    pub save_epoch_freq: usize,

    #[arg(long, default_value_t = 5, help = "Minibatches per validation run")]
    pub validation_limit: usize,

    #[arg(long, default_value_t = false, help = "Resume from the saved checkpoint")]
    pub continue_train: bool,

    #[arg(long, default_value = "latest", help = "Checkpoint to resume from: latest or an epoch")]
    pub which_epoch: Box<str>,

    #[arg(long, default_value_t = false, help = "Don't flip images for augmentation")]
    pub no_flip: bool,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    pub device: ComputeDevice,

    #[arg(
        long,
        default_value_t = 0,
        help = "A device for cuda",
        long_help = "For cuda or meta, we may want to choose a different device."
    )]
    pub device_no: usize,

    #[arg(
        long,
        short,
        help = "Verbosity",
        long_help = "Enable verbose output.\n\
		     Prints additional information during execution."
    )]
    pub verbose: bool,
}

impl TrainArgs {
    pub fn experiment_dir(&self) -> PathBuf {
        Path::new(&*self.checkpoints_dir).join(&*self.name)
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            ngf: self.ngf,
            ndf: self.ndf,
            w_dim: self.w_dim,
            load_size: self.load_size,
            crop_size: self.crop_size,
            norm_e: self.norm_e.clone(),
            norm_g: self.norm_g.clone(),
            norm_d: self.norm_d.clone(),
            spade_hidden: self.spade_hidden,
            n_layers_d: self.n_layers_d,
            num_d: self.num_d,
        }
    }

    pub fn loss_config(&self) -> LossConfig {
        LossConfig {
            gan_mode: self.gan_mode.into(),
            lambda_feat: self.lambda_feat,
            lambda_kld: self.lambda_kld,
            lambda_l1: self.lambda_l1,
            use_gan_feat_loss: !self.no_gan_feat_loss,
        }
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            lr: self.lr,
            beta1: self.beta1,
            beta2: self.beta2,
            ttur: !self.no_ttur,
            niter: self.niter,
            niter_decay: self.niter_decay,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.model_config().validate()?;
        if self.batch_size == 0 || self.d_steps_per_g == 0 {
            anyhow::bail!("batch size and D steps per G should be positive");
        }
        if self.print_freq == 0
            || self.display_freq == 0
            || self.save_latest_freq == 0
            || self.save_epoch_freq == 0
        {
            anyhow::bail!("print/display/save frequencies should be positive");
        }
        if self.niter + self.niter_decay == 0 {
            anyhow::bail!("no training epochs: niter + niter_decay = 0");
        }
        self.which_epoch.parse::<CheckpointLabel>()?;
        Ok(())
    }
}
