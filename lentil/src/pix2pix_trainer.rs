use crate::lentil_common::*;
use crate::pix2pix_model::*;
use crate::train_loop::TrainerT;
use crate::train_options::OptimizerConfig;

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

/// Learning rates of the generator and the discriminator over epochs
#[derive(Clone, Copy, Debug)]
pub struct LearningRateSchedule {
    config: OptimizerConfig,
}

impl LearningRateSchedule {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// `(lr_g, lr_d)` from a shared rate; TTUR halves the generator's
    /// and doubles the discriminator's
    pub fn split(&self, lr: f64) -> (f64, f64) {
        if self.config.ttur {
            (lr / 2., lr * 2.)
        } else {
            (lr, lr)
        }
    }

    /// Adam `(beta1, beta2)`
    pub fn betas(&self) -> (f64, f64) {
        if self.config.ttur {
            (0., 0.9)
        } else {
            (self.config.beta1, self.config.beta2)
        }
    }

    /// Shared rate after epoch `epoch` ends; linear decay to zero
    /// over `niter_decay` epochs once `niter` epochs are done
    pub fn next_lr(&self, old_lr: f64, epoch: usize) -> f64 {
        if epoch > self.config.niter && self.config.niter_decay > 0 {
            (old_lr - self.config.lr / self.config.niter_decay as f64).max(0.)
        } else {
            old_lr
        }
    }

    /// Shared rate at the start of `first_epoch`, replaying the decay
    /// steps of the epochs before it
    pub fn lr_at_epoch_start(&self, first_epoch: usize) -> f64 {
        (1..first_epoch).fold(self.config.lr, |lr, e| self.next_lr(lr, e))
    }
}

///
/// Alternating generator/discriminator optimization of a
/// [`Pix2PixModel`] with separate AdamW optimizers
///
pub struct Pix2PixTrainer {
    pub model: Pix2PixModel,
    checkpoint_dir: PathBuf,
    schedule: LearningRateSchedule,
    old_lr: f64,
    optimizer_g: AdamW,
    optimizer_d: AdamW,
    g_losses: LossMap,
    d_losses: LossMap,
    log_losses: LossMap,
    generated: Option<Tensor>,
}

impl Pix2PixTrainer {
    /// * `model` - networks, already restored when resuming
    /// * `config` - optimizer settings
    /// * `checkpoint_dir` - where `save` writes
    /// * `first_epoch` - the learning rate follows the schedule from here
    pub fn new(
        model: Pix2PixModel,
        config: OptimizerConfig,
        checkpoint_dir: &Path,
        first_epoch: usize,
    ) -> anyhow::Result<Self> {
        let schedule = LearningRateSchedule::new(config);
        let old_lr = schedule.lr_at_epoch_start(first_epoch);
        let (lr_g, lr_d) = schedule.split(old_lr);
        let (beta1, beta2) = schedule.betas();

        let params = |lr: f64| ParamsAdamW {
            lr,
            beta1,
            beta2,
            eps: 1e-8,
            weight_decay: 0.,
        };

        let optimizer_g = AdamW::new(model.generator_vars(), params(lr_g))?;
        let optimizer_d = AdamW::new(model.discriminator_vars(), params(lr_d))?;

        info!(
            "optimizers: lr_G = {}, lr_D = {}, betas = ({}, {})",
            lr_g, lr_d, beta1, beta2
        );

        Ok(Self {
            model,
            checkpoint_dir: checkpoint_dir.to_path_buf(),
            schedule,
            old_lr,
            optimizer_g,
            optimizer_d,
            g_losses: LossMap::new(),
            d_losses: LossMap::new(),
            log_losses: LossMap::new(),
            generated: None,
        })
    }
}

impl TrainerT for Pix2PixTrainer {
    fn run_generator_one_step(&mut self, batch: &ImageMinibatch) -> anyhow::Result<()> {
        let step = self.model.compute_generator_loss(batch, true)?;
        let loss = step.losses.total()?;
        self.optimizer_g.backward_step(&loss)?;
        self.g_losses = step.losses.to_loss_map()?;
        self.log_losses = step.log_losses.to_loss_map()?;
        self.generated = Some(step.fake.detach());
        Ok(())
    }

    fn run_discriminator_one_step(&mut self, batch: &ImageMinibatch) -> anyhow::Result<()> {
        let losses = self.model.compute_discriminator_loss(batch, true)?;
        let loss = losses.total()?;
        self.optimizer_d.backward_step(&loss)?;
        self.d_losses = losses.to_loss_map()?;
        Ok(())
    }

    fn get_latest_losses(&self, include_log_losses: bool) -> LossMap {
        let mut ret = self.g_losses.clone();
        ret.extend(self.d_losses.iter().map(|(k, v)| (k.clone(), *v)));
        if include_log_losses {
            ret.extend(self.log_losses.iter().map(|(k, v)| (k.clone(), *v)));
        }
        ret
    }

    fn get_latest_generated(&self) -> Option<&Tensor> {
        self.generated.as_ref()
    }

    fn update_learning_rate(&mut self, epoch: usize) -> anyhow::Result<()> {
        let new_lr = self.schedule.next_lr(self.old_lr, epoch);
        if new_lr != self.old_lr {
            let (lr_g, lr_d) = self.schedule.split(new_lr);
            self.optimizer_g.set_learning_rate(lr_g);
            self.optimizer_d.set_learning_rate(lr_d);
            info!("update learning rate: {} -> {}", self.old_lr, new_lr);
            self.old_lr = new_lr;
        }
        Ok(())
    }

    fn save(&self, label: CheckpointLabel) -> anyhow::Result<()> {
        self.model.save(&self.checkpoint_dir, label)
    }
}
