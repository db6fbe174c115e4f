use crate::iter_counter::IterationCounter;
use crate::lentil_common::*;

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressDrawTarget};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What the training loop needs from a trainer
pub trait TrainerT {
    fn run_generator_one_step(&mut self, batch: &ImageMinibatch) -> anyhow::Result<()>;

    fn run_discriminator_one_step(&mut self, batch: &ImageMinibatch) -> anyhow::Result<()>;

    /// latest losses of both steps, optionally with monitoring-only values
    fn get_latest_losses(&self, include_log_losses: bool) -> LossMap;

    fn get_latest_generated(&self) -> Option<&Tensor>;

    /// called at the end of each epoch
    fn update_learning_rate(&mut self, epoch: usize) -> anyhow::Result<()>;

    fn save(&self, label: CheckpointLabel) -> anyhow::Result<()>;
}

/// Callbacks for printing and displaying progress
pub trait TrainMonitor<T: TrainerT> {
    fn print(&mut self, trainer: &T, counter: &IterationCounter) -> anyhow::Result<()>;

    fn display(
        &mut self,
        trainer: &T,
        batch: &ImageMinibatch,
        counter: &IterationCounter,
    ) -> anyhow::Result<()>;
}

pub struct TrainLoopConfig {
    pub batch_size: usize,
    pub d_steps_per_g: usize,
    pub device: Device,
    /// set asynchronously to stop training
    pub stop: Arc<AtomicBool>,
    pub show_progress: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopExit {
    Finished,
    Interrupted,
}

/// Run the epochs of `counter` over minibatches of `data`
pub fn run_training_loop<T, L, M>(
    trainer: &mut T,
    data: &mut L,
    counter: &mut IterationCounter,
    monitor: &mut M,
    config: &TrainLoopConfig,
) -> anyhow::Result<LoopExit>
where
    T: TrainerT,
    L: ImageDataLoader,
    M: TrainMonitor<T>,
{
    for epoch in counter.training_epochs() {
        if epoch != counter.first_epoch {
            counter.record_epoch_start(epoch);
        }

        data.shuffle_minibatch(config.batch_size)?;
        let num_batches = data.num_minibatch();
        let start_iter = counter.epoch_iter;

        let pb = ProgressBar::new(num_batches as u64);
        if !config.show_progress {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }
        pb.set_message(format!("epoch {}", epoch));

        for b in 0..num_batches {
            if config.stop.load(Ordering::SeqCst) {
                pb.finish_and_clear();
                return Ok(LoopExit::Interrupted);
            }

            let batch = data.minibatch_data(b, &config.device)?;
            counter.record_one_iteration();

            if (start_iter + b) % config.d_steps_per_g == 0 {
                trainer.run_generator_one_step(&batch)?;
            }
            trainer.run_discriminator_one_step(&batch)?;

            if counter.needs_printing() {
                monitor.print(trainer, counter)?;
            }

            if counter.needs_displaying() {
                monitor.display(trainer, &batch, counter)?;
            }

            if counter.needs_saving() {
                info!(
                    "saving the latest model (epoch {}, total_steps {})",
                    epoch, counter.total_steps_so_far
                );
                trainer.save(CheckpointLabel::Latest)?;
                counter.record_current_iter()?;
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        trainer.update_learning_rate(epoch)?;
        counter.record_epoch_end()?;

        if counter.needs_epoch_saving(epoch) {
            info!(
                "saving the model at the end of epoch {}, iters {}",
                epoch, counter.total_steps_so_far
            );
            trainer.save(CheckpointLabel::Latest)?;
            trainer.save(CheckpointLabel::Epoch(epoch))?;
        }
    }
    Ok(LoopExit::Finished)
}

/// Run the loop, then save `latest` and the iteration record exactly
/// once however the loop ended. A loop error is returned after the
/// final save.
pub fn train_with_final_checkpoint<T, L, M>(
    trainer: &mut T,
    data: &mut L,
    counter: &mut IterationCounter,
    monitor: &mut M,
    config: &TrainLoopConfig,
) -> anyhow::Result<LoopExit>
where
    T: TrainerT,
    L: ImageDataLoader,
    M: TrainMonitor<T>,
{
    let result = run_training_loop(trainer, data, counter, monitor, config);

    match &result {
        Ok(LoopExit::Finished) => info!("training was successfully finished"),
        Ok(LoopExit::Interrupted) => warn!("training was interrupted"),
        Err(e) => log::error!("training stopped: {}", e),
    }

    let saved = trainer
        .save(CheckpointLabel::Latest)
        .and_then(|_| counter.record_current_iter());

    match (result, saved) {
        (Err(e), Err(save_err)) => {
            log::error!("final save failed: {}", save_err);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(save_err)) => Err(save_err),
        (Ok(exit), Ok(())) => Ok(exit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter_counter::{IterCounterArgs, IterRecord};
    use candle_core::DType;

    /// pretend data: `n` samples of 2 x 2 images
    struct MockData {
        n: usize,
        batch_size: usize,
        fail_at: Option<usize>,
    }

    impl ImageDataLoader for MockData {
        fn minibatch_data(&self, batch_idx: usize, dev: &Device) -> anyhow::Result<ImageMinibatch> {
            if Some(batch_idx) == self.fail_at {
                anyhow::bail!("broken minibatch {}", batch_idx);
            }
            let x = Tensor::zeros((self.batch_size, 1, 2, 2), DType::F32, dev)?;
            Ok(ImageMinibatch {
                label: x.clone(),
                image: x.clone(),
                style: x,
                names: (0..self.batch_size).map(|i| i.to_string().into_boxed_str()).collect(),
            })
        }

        fn num_minibatch(&self) -> usize {
            self.n / self.batch_size
        }

        fn num_samples(&self) -> usize {
            self.n
        }

        fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
            self.batch_size = batch_size;
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockTrainer {
        g_steps: usize,
        d_steps: usize,
        lr_updates: Vec<usize>,
        stop_after: Option<(usize, Arc<AtomicBool>)>,
    }

    impl TrainerT for MockTrainer {
        fn run_generator_one_step(&mut self, _batch: &ImageMinibatch) -> anyhow::Result<()> {
            self.g_steps += 1;
            Ok(())
        }

        fn run_discriminator_one_step(&mut self, _batch: &ImageMinibatch) -> anyhow::Result<()> {
            self.d_steps += 1;
            if let Some((n, stop)) = &self.stop_after {
                if self.d_steps == *n {
                    stop.store(true, Ordering::SeqCst);
                }
            }
            Ok(())
        }

        fn get_latest_losses(&self, _include_log_losses: bool) -> LossMap {
            LossMap::new()
        }

        fn get_latest_generated(&self) -> Option<&Tensor> {
            None
        }

        fn update_learning_rate(&mut self, epoch: usize) -> anyhow::Result<()> {
            self.lr_updates.push(epoch);
            Ok(())
        }

        fn save(&self, _label: CheckpointLabel) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// `save` takes `&self`; count through a wrapper instead
    struct CountingTrainer {
        inner: MockTrainer,
        saves: std::cell::RefCell<Vec<CheckpointLabel>>,
    }

    impl TrainerT for CountingTrainer {
        fn run_generator_one_step(&mut self, batch: &ImageMinibatch) -> anyhow::Result<()> {
            self.inner.run_generator_one_step(batch)
        }

        fn run_discriminator_one_step(&mut self, batch: &ImageMinibatch) -> anyhow::Result<()> {
            self.inner.run_discriminator_one_step(batch)
        }

        fn get_latest_losses(&self, include_log_losses: bool) -> LossMap {
            self.inner.get_latest_losses(include_log_losses)
        }

        fn get_latest_generated(&self) -> Option<&Tensor> {
            None
        }

        fn update_learning_rate(&mut self, epoch: usize) -> anyhow::Result<()> {
            self.inner.update_learning_rate(epoch)
        }

        fn save(&self, label: CheckpointLabel) -> anyhow::Result<()> {
            self.saves.borrow_mut().push(label);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockMonitor {
        printed: usize,
        displayed: usize,
    }

    impl<T: TrainerT> TrainMonitor<T> for MockMonitor {
        fn print(&mut self, _trainer: &T, _counter: &IterationCounter) -> anyhow::Result<()> {
            self.printed += 1;
            Ok(())
        }

        fn display(
            &mut self,
            _trainer: &T,
            _batch: &ImageMinibatch,
            _counter: &IterationCounter,
        ) -> anyhow::Result<()> {
            self.displayed += 1;
            Ok(())
        }
    }

    fn counter_args(continue_train: bool) -> IterCounterArgs {
        IterCounterArgs {
            niter: 2,
            niter_decay: 1,
            batch_size: 2,
            dataset_size: 8,
            print_freq: 4,
            display_freq: 8,
            save_latest_freq: 6,
            save_epoch_freq: 2,
            continue_train,
        }
    }

    fn loop_config(d_steps_per_g: usize) -> TrainLoopConfig {
        TrainLoopConfig {
            batch_size: 2,
            d_steps_per_g,
            device: Device::Cpu,
            stop: Arc::new(AtomicBool::new(false)),
            show_progress: false,
        }
    }

    fn counting(inner: MockTrainer) -> CountingTrainer {
        CountingTrainer {
            inner,
            saves: std::cell::RefCell::new(vec![]),
        }
    }

    #[test]
    fn normal_completion() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut counter = IterationCounter::new(counter_args(false), dir.path());
        let mut data = MockData {
            n: 8,
            batch_size: 2,
            fail_at: None,
        };
        let mut trainer = counting(MockTrainer::default());
        let mut monitor = MockMonitor::default();
        let config = loop_config(2);

        let exit = train_with_final_checkpoint(&mut trainer, &mut data, &mut counter, &mut monitor, &config)?;
        assert_eq!(exit, LoopExit::Finished);

        // 3 epochs x 4 minibatches
        assert_eq!(trainer.inner.d_steps, 12);
        assert_eq!(trainer.inner.g_steps, 6);
        assert_eq!(trainer.inner.lr_updates, vec![1, 2, 3]);
        assert_eq!(counter.total_steps_so_far, 24);
        assert_eq!(monitor.printed, 6);
        assert_eq!(monitor.displayed, 3);

        use CheckpointLabel::*;
        let saves = trainer.saves.borrow().clone();
        // steps 6, 12 | epoch 2 | 18, 24 | epoch 3 | final
        assert_eq!(
            saves,
            vec![Latest, Latest, Latest, Epoch(2), Latest, Latest, Latest, Epoch(3), Latest]
        );

        let rec = IterRecord::from_json(counter.record_path())?;
        assert_eq!(rec, IterRecord { epoch: 3, epoch_iter: 8 });
        Ok(())
    }

    #[test]
    fn interrupt_saves_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut counter = IterationCounter::new(counter_args(false), dir.path());
        let mut data = MockData {
            n: 8,
            batch_size: 2,
            fail_at: None,
        };
        let config = loop_config(1);
        let mut trainer = counting(MockTrainer {
            stop_after: Some((5, config.stop.clone())),
            ..Default::default()
        });
        let mut monitor = MockMonitor::default();

        let exit = train_with_final_checkpoint(&mut trainer, &mut data, &mut counter, &mut monitor, &config)?;
        assert_eq!(exit, LoopExit::Interrupted);
        assert_eq!(trainer.inner.d_steps, 5);

        // one periodic save at step 6 + the final one
        assert_eq!(trainer.saves.borrow().len(), 2);
        let rec = IterRecord::from_json(counter.record_path())?;
        assert_eq!(rec, IterRecord { epoch: 2, epoch_iter: 2 });
        Ok(())
    }

    #[test]
    fn error_saves_once_and_propagates() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut counter = IterationCounter::new(counter_args(false), dir.path());
        let mut data = MockData {
            n: 8,
            batch_size: 2,
            fail_at: Some(1),
        };
        let mut trainer = counting(MockTrainer::default());
        let mut monitor = MockMonitor::default();

        let result = train_with_final_checkpoint(&mut trainer, &mut data, &mut counter, &mut monitor, &loop_config(1));
        let err = result.expect_err("the broken minibatch should stop training");
        assert!(err.to_string().contains("broken minibatch 1"));
        assert_eq!(*trainer.saves.borrow(), vec![CheckpointLabel::Latest]);

        let rec = IterRecord::from_json(counter.record_path())?;
        assert_eq!(rec, IterRecord { epoch: 1, epoch_iter: 2 });
        Ok(())
    }

    #[test]
    fn resume_keeps_batch_offset() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        IterRecord {
            epoch: 3,
            epoch_iter: 2,
        }
        .to_json(&dir.path().join(ITER_RECORD_FILE))?;

        let mut counter = IterationCounter::new(counter_args(true), dir.path());
        let mut data = MockData {
            n: 8,
            batch_size: 2,
            fail_at: None,
        };
        let mut trainer = counting(MockTrainer::default());
        let mut monitor = MockMonitor::default();

        train_with_final_checkpoint(&mut trainer, &mut data, &mut counter, &mut monitor, &loop_config(2))?;

        // only epoch 3 runs; batch indexes 2..6 with generator steps at 2, 4
        assert_eq!(trainer.inner.d_steps, 4);
        assert_eq!(trainer.inner.g_steps, 2);
        assert_eq!(trainer.inner.lr_updates, vec![3]);
        assert_eq!(counter.total_steps_so_far, 2 * 8 + 2 + 8);
        Ok(())
    }
}
