use crate::iter_counter::*;
use crate::lentil_common::*;
use crate::pix2pix_model::{NetworkKind, Pix2PixModel};
use crate::pix2pix_trainer::Pix2PixTrainer;
use crate::train_loop::*;
use crate::train_options::TrainArgs;
use crate::validation::{run_validation, DISPLAY_LIMIT};
use crate::visualizer::Visualizer;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Prints losses, renders grids and validates on the training and
/// validation data
struct TrainingMonitor {
    visualizer: Visualizer,
    train_eval: ImageFolderData,
    val: ImageFolderData,
    validation_limit: usize,
}

impl TrainMonitor<Pix2PixTrainer> for TrainingMonitor {
    fn print(&mut self, trainer: &Pix2PixTrainer, counter: &IterationCounter) -> anyhow::Result<()> {
        let losses = trainer.get_latest_losses(true);
        self.visualizer.print_current_errors(
            counter.current_epoch,
            counter.total_steps_so_far,
            &losses,
            counter.time_per_iter,
        )?;
        self.visualizer
            .plot_current_errors(&losses, counter.total_steps_so_far)
    }

    fn display(
        &mut self,
        trainer: &Pix2PixTrainer,
        batch: &ImageMinibatch,
        counter: &IterationCounter,
    ) -> anyhow::Result<()> {
        self.visualizer.visualize_sidebyside(
            batch,
            trainer.get_latest_generated(),
            counter.current_epoch,
            counter.total_steps_so_far,
            DISPLAY_LIMIT,
            "train",
        )?;

        for (loader, key) in [(&self.train_eval, "train"), (&self.val, "val")] {
            run_validation(
                loader,
                &trainer.model,
                &self.visualizer,
                counter,
                self.validation_limit,
                key,
            )?;
        }
        Ok(())
    }
}

/// * `stop` - raised to stop after the current step and save
pub fn run_train(args: &TrainArgs, stop: Arc<AtomicBool>) -> anyhow::Result<()> {
    args.validate()?;

    let experiment_dir = args.experiment_dir();
    std::fs::create_dir_all(&experiment_dir)?;

    info!("{:#?}", args);

    let model_config = args.model_config();
    model_config.to_json(&experiment_dir.join(OPTIONS_FILE))?;

    let dev = args.device.to_device(args.device_no)?;

    // 1. data
    let dataroot = Path::new(&*args.dataroot);
    let transform = model_config.transform(!args.no_flip);

    let mut train_data = ImageFolderData::new(dataroot, transform, true)?;
    train_data.shuffle_minibatch(args.batch_size)?;

    let mut train_eval = ImageFolderData::new(dataroot, transform, false)?;
    train_eval.shuffle_minibatch(args.batch_size)?;

    let val_root = args.val_dataroot.as_deref().unwrap_or(&args.dataroot);
    let mut val = ImageFolderData::new(Path::new(val_root), transform, false)?;
    val.shuffle_minibatch(args.batch_size)?;

    let dataset_size = train_data.num_minibatch() * args.batch_size;
    info!("{} training samples per epoch", dataset_size);

    // 2. counter and networks
    let mut counter = IterationCounter::new(
        IterCounterArgs {
            niter: args.niter,
            niter_decay: args.niter_decay,
            batch_size: args.batch_size,
            dataset_size,
            print_freq: args.print_freq,
            display_freq: args.display_freq,
            save_latest_freq: args.save_latest_freq,
            save_epoch_freq: args.save_epoch_freq,
            continue_train: args.continue_train,
        },
        &experiment_dir,
    );

    let mut model = Pix2PixModel::new(&model_config, args.loss_config(), &dev)?;

    if args.continue_train {
        let label: CheckpointLabel = args.which_epoch.parse()?;
        model.load(
            &experiment_dir,
            label,
            &[
                NetworkKind::Encoder,
                NetworkKind::Generator,
                NetworkKind::Discriminator,
            ],
        )?;
    }

    let mut trainer = Pix2PixTrainer::new(
        model,
        args.optimizer_config(),
        &experiment_dir,
        counter.first_epoch,
    )?;

    let mut monitor = TrainingMonitor {
        visualizer: Visualizer::new(&experiment_dir)?,
        train_eval,
        val,
        validation_limit: args.validation_limit,
    };

    // 3. train
    let loop_config = TrainLoopConfig {
        batch_size: args.batch_size,
        d_steps_per_g: args.d_steps_per_g,
        device: dev,
        stop,
        show_progress: !args.verbose,
    };

    let exit = train_with_final_checkpoint(
        &mut trainer,
        &mut train_data,
        &mut counter,
        &mut monitor,
        &loop_config,
    )?;

    info!("done: {:?}", exit);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visualizer::{LOSS_LOG_FILE, WEB_IMAGE_DIR};
    use clap::Parser;
    use image::GrayImage;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: TrainArgs,
    }

    fn write_dataset(root: &Path, n: usize) -> anyhow::Result<()> {
        for sub in [LABEL_DIR, IMAGE_DIR] {
            std::fs::create_dir_all(root.join(sub))?;
            for i in 0..n {
                let img = GrayImage::from_fn(40, 40, |x, y| image::Luma([((x * y + i as u32) % 255) as u8]));
                img.save(root.join(sub).join(format!("s{}.png", i)))?;
            }
        }
        Ok(())
    }

    fn tiny_args(data: &Path, checkpoints: &Path, niter: usize, resume: bool) -> anyhow::Result<TrainArgs> {
        let niter = niter.to_string();
        let mut argv = vec![
            "lentil",
            "-d",
            data.to_str().unwrap(),
            "--checkpoints-dir",
            checkpoints.to_str().unwrap(),
            "--name",
            "tiny",
            "--load-size",
            "36",
            "--crop-size",
            "32",
            "--ngf",
            "2",
            "--ndf",
            "4",
            "-z",
            "3",
            "--spade-hidden",
            "4",
            "--n-layers-d",
            "2",
            "--num-d",
            "1",
            "-b",
            "1",
            "--niter",
            niter.as_str(),
            "--print-freq",
            "1",
            "--display-freq",
            "3",
            "--validation-limit",
            "1",
            "--verbose",
        ];
        if resume {
            argv.push("--continue-train");
        }
        Ok(TestCli::try_parse_from(argv)?.args)
    }

    /// `iters` of the training lines in the loss log; validation lines
    /// carry `{key}/` prefixed losses
    fn logged_training_iters(experiment_dir: &Path) -> anyhow::Result<Vec<usize>> {
        let log = std::fs::read_to_string(experiment_dir.join(LOSS_LOG_FILE))?;
        let mut ret = vec![];
        for line in log.lines().filter(|l| l.starts_with("(epoch") && !l.contains('/')) {
            let iters = line
                .split("iters: ")
                .nth(1)
                .and_then(|s| s.split(',').next())
                .ok_or_else(|| anyhow::anyhow!("no iters in {}", line))?;
            ret.push(iters.parse()?);
        }
        Ok(ret)
    }

    #[test]
    fn loss_log_counts_steps_across_epochs_and_resumes() -> anyhow::Result<()> {
        let data_dir = tempfile::tempdir()?;
        let checkpoints = tempfile::tempdir()?;
        write_dataset(data_dir.path(), 3)?;

        let args = tiny_args(data_dir.path(), checkpoints.path(), 2, false)?;
        let experiment_dir = args.experiment_dir();
        run_train(&args, Arc::new(AtomicBool::new(false)))?;

        assert_eq!(logged_training_iters(&experiment_dir)?, vec![1, 2, 3, 4, 5, 6]);
        assert!(experiment_dir.join(OPTIONS_FILE).exists());
        assert!(experiment_dir.join("latest_net_G.safetensors").exists());

        let images = experiment_dir.join(WEB_IMAGE_DIR);
        for name in [
            "epoch001_iter3_train.png",
            "epoch001_iter3_train_validation.png",
            "epoch002_iter6_val_validation.png",
        ] {
            assert!(images.join(name).exists(), "missing {}", name);
        }

        // the last epoch is picked up again from its saved position
        let args = tiny_args(data_dir.path(), checkpoints.path(), 3, true)?;
        run_train(&args, Arc::new(AtomicBool::new(false)))?;

        let iters = logged_training_iters(&experiment_dir)?;
        assert_eq!(iters, (1..=12).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn raised_stop_flag_still_saves() -> anyhow::Result<()> {
        let data_dir = tempfile::tempdir()?;
        let checkpoints = tempfile::tempdir()?;
        write_dataset(data_dir.path(), 3)?;

        let args = tiny_args(data_dir.path(), checkpoints.path(), 2, false)?;
        let experiment_dir = args.experiment_dir();
        run_train(&args, Arc::new(AtomicBool::new(true)))?;

        assert!(logged_training_iters(&experiment_dir)?.is_empty());
        assert!(experiment_dir.join("latest_net_G.safetensors").exists());
        assert!(experiment_dir.join(ITER_RECORD_FILE).exists());
        Ok(())
    }
}
