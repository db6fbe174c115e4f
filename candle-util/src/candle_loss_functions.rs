use candle_core::{Result, Tensor};

/// KL divergence loss between two Gaussian distributions
///
/// -0.5 * (1 + log(sigma^2) - mu^2 - sigma^2)
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (z_var - 1. + z_mean.powf(2.)? - z_lnvar)?.sum(z_mean.rank() - 1)? * 0.5
}

/// Mean absolute error between two tensors of the same shape
pub fn l1_loss(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    x.sub(y)?.abs()?.mean_all()
}

/// softplus(x) = log(1 + exp(x)), computed without overflow
fn softplus(x: &Tensor) -> Result<Tensor> {
    let log1p_exp_neg_abs = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    x.relu()?.add(&log1p_exp_neg_abs)
}

/// Adversarial objectives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GanMode {
    Hinge,
    Ls,
    Original,
    W,
}

impl GanMode {
    /// Discriminator-side loss of a prediction
    ///
    /// * `pred` - patch-wise prediction of a single scale
    /// * `target_is_real` - whether `pred` was computed on real data
    pub fn discriminator_loss(&self, pred: &Tensor, target_is_real: bool) -> Result<Tensor> {
        match (self, target_is_real) {
            (Self::Hinge, true) => (pred.neg()? + 1.)?.relu()?.mean_all(),
            (Self::Hinge, false) => (pred + 1.)?.relu()?.mean_all(),
            (Self::Ls, true) => (pred - 1.)?.sqr()?.mean_all(),
            (Self::Ls, false) => pred.sqr()?.mean_all(),
            (Self::Original, true) => softplus(&pred.neg()?)?.mean_all(),
            (Self::Original, false) => softplus(pred)?.mean_all(),
            (Self::W, true) => pred.mean_all()?.neg(),
            (Self::W, false) => pred.mean_all(),
        }
    }

    /// Generator-side loss of a prediction on generated data
    pub fn generator_loss(&self, pred: &Tensor) -> Result<Tensor> {
        match self {
            Self::Hinge | Self::W => pred.mean_all()?.neg(),
            Self::Ls | Self::Original => self.discriminator_loss(pred, true),
        }
    }

    /// Average the discriminator-side loss over scales; the last
    /// feature of each scale is its prediction
    pub fn discriminator_loss_multiscale(
        &self,
        preds: &[Vec<Tensor>],
        target_is_real: bool,
    ) -> Result<Tensor> {
        average_over_scales(preds, |pred| self.discriminator_loss(pred, target_is_real))
    }

    /// Average the generator-side loss over scales
    pub fn generator_loss_multiscale(&self, preds: &[Vec<Tensor>]) -> Result<Tensor> {
        average_over_scales(preds, |pred| self.generator_loss(pred))
    }
}

impl std::str::FromStr for GanMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "hinge" => Ok(Self::Hinge),
            "ls" => Ok(Self::Ls),
            "original" => Ok(Self::Original),
            "w" => Ok(Self::W),
            _ => Err(anyhow::anyhow!("unexpected gan mode {}", s)),
        }
    }
}

fn average_over_scales<F>(preds: &[Vec<Tensor>], loss_fn: F) -> Result<Tensor>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    let mut tot: Option<Tensor> = None;
    for feats in preds {
        let pred = feats
            .last()
            .ok_or_else(|| candle_core::Error::Msg("empty discriminator output".into()))?;
        let loss = loss_fn(pred)?;
        tot = Some(match tot {
            Some(t) => (t + loss)?,
            None => loss,
        });
    }
    let tot = tot.ok_or_else(|| candle_core::Error::Msg("no discriminator scales".into()))?;
    tot / preds.len() as f64
}

/// Feature matching loss: L1 distances between the intermediate
/// discriminator features of generated and real data (the prediction
/// layer excluded), summed over layers and averaged over scales.
/// Real features are detached.
pub fn feature_matching_loss(fake: &[Vec<Tensor>], real: &[Vec<Tensor>]) -> Result<Tensor> {
    if fake.is_empty() || fake.len() != real.len() {
        return Err(candle_core::Error::Msg(format!(
            "feature matching needs matching scales: {} vs. {}",
            fake.len(),
            real.len()
        )));
    }

    let num_d = fake.len() as f64;
    let mut tot: Option<Tensor> = None;
    for (fake_feats, real_feats) in fake.iter().zip(real.iter()) {
        let n_inter = fake_feats.len().saturating_sub(1);
        for (f, r) in fake_feats.iter().zip(real_feats.iter()).take(n_inter) {
            let loss = l1_loss(f, &r.detach())?;
            tot = Some(match tot {
                Some(t) => (t + loss)?,
                None => loss,
            });
        }
    }

    match tot {
        Some(t) => t / num_d,
        None => Tensor::new(0f32, fake[0][0].device()),
    }
}
