use crate::lentil_common::*;

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Where to pick up training: the epoch to (re)start and how many
/// samples of that epoch were already seen
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct IterRecord {
    pub epoch: usize,
    pub epoch_iter: usize,
}

impl IterRecord {
    pub fn to_json(&self, file_path: &Path) -> anyhow::Result<()> {
        std::fs::write(file_path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn from_json(file_path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(file_path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

pub struct IterCounterArgs {
    pub niter: usize,
    pub niter_decay: usize,
    pub batch_size: usize,
    /// number of samples per epoch
    pub dataset_size: usize,
    pub print_freq: usize,
    pub display_freq: usize,
    pub save_latest_freq: usize,
    pub save_epoch_freq: usize,
    pub continue_train: bool,
}

/// Keeps track of epochs and steps (counted in samples), decides when
/// to print, display and save, and persists the resume point.
pub struct IterationCounter {
    args: IterCounterArgs,
    record_path: PathBuf,

    pub total_epochs: usize,
    pub first_epoch: usize,
    pub current_epoch: usize,
    pub epoch_iter: usize,
    pub total_steps_so_far: usize,
    pub time_per_iter: f32,

    epoch_start_time: Instant,
    last_iter_time: Instant,
}

impl IterationCounter {
    /// * `args` - schedule and frequencies
    /// * `experiment_dir` - where `iter.json` is kept
    pub fn new(args: IterCounterArgs, experiment_dir: &Path) -> Self {
        let record_path = experiment_dir.join(ITER_RECORD_FILE);

        let (first_epoch, epoch_iter) = if args.continue_train {
            match IterRecord::from_json(&record_path) {
                Ok(rec) => {
                    info!(
                        "resuming from epoch {} at iteration {}",
                        rec.epoch, rec.epoch_iter
                    );
                    (rec.epoch.max(1), rec.epoch_iter)
                }
                Err(e) => {
                    warn!(
                        "could not load the iteration record {}: {}; starting from the beginning",
                        record_path.display(),
                        e
                    );
                    (1, 0)
                }
            }
        } else {
            (1, 0)
        };

        let total_epochs = args.niter + args.niter_decay;
        let total_steps_so_far = (first_epoch - 1) * args.dataset_size + epoch_iter;
        let now = Instant::now();

        Self {
            args,
            record_path,
            total_epochs,
            first_epoch,
            current_epoch: first_epoch,
            epoch_iter,
            total_steps_so_far,
            time_per_iter: 0.,
            epoch_start_time: now,
            last_iter_time: now,
        }
    }

    /// epochs to run, inclusive of both ends
    pub fn training_epochs(&self) -> std::ops::RangeInclusive<usize> {
        self.first_epoch..=self.total_epochs
    }

    pub fn record_epoch_start(&mut self, epoch: usize) {
        let now = Instant::now();
        self.epoch_start_time = now;
        self.last_iter_time = now;
        self.epoch_iter = 0;
        self.current_epoch = epoch;
    }

    pub fn record_one_iteration(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_iter_time).as_secs_f32();
        self.time_per_iter = elapsed / self.args.batch_size as f32;
        self.last_iter_time = now;
        self.total_steps_so_far += self.args.batch_size;
        self.epoch_iter += self.args.batch_size;
    }

    pub fn record_epoch_end(&mut self) -> anyhow::Result<()> {
        let elapsed = self.epoch_start_time.elapsed().as_secs_f32();
        info!(
            "End of epoch {} / {} \t Time Taken: {:.0} sec",
            self.current_epoch, self.total_epochs, elapsed
        );

        if self.current_epoch % self.args.save_epoch_freq == 0 {
            IterRecord {
                epoch: self.current_epoch + 1,
                epoch_iter: 0,
            }
            .to_json(&self.record_path)?;
            info!("saved the iteration record at the end of epoch {}", self.current_epoch);
        }
        Ok(())
    }

    pub fn record_current_iter(&self) -> anyhow::Result<()> {
        IterRecord {
            epoch: self.current_epoch,
            epoch_iter: self.epoch_iter,
        }
        .to_json(&self.record_path)?;
        info!(
            "saved the iteration record: epoch {}, iteration {}",
            self.current_epoch, self.epoch_iter
        );
        Ok(())
    }

    fn hits(&self, freq: usize) -> bool {
        self.total_steps_so_far % freq < self.args.batch_size
    }

    pub fn needs_saving(&self) -> bool {
        self.hits(self.args.save_latest_freq)
    }

    pub fn needs_printing(&self) -> bool {
        self.hits(self.args.print_freq)
    }

    pub fn needs_displaying(&self) -> bool {
        self.hits(self.args.display_freq)
    }

    /// whether to keep an epoch-labelled copy of the model
    pub fn needs_epoch_saving(&self, epoch: usize) -> bool {
        epoch % self.args.save_epoch_freq == 0 || epoch == self.total_epochs
    }

    pub fn record_path(&self) -> &Path {
        &self.record_path
    }
}
