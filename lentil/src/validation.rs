use crate::iter_counter::IterationCounter;
use crate::lentil_common::*;
use crate::pix2pix_model::Pix2PixModel;
use crate::visualizer::Visualizer;

/// rows of a side-by-side grid
pub const DISPLAY_LIMIT: usize = 8;

/// Evaluate the losses over at most `limit` minibatches without
/// updating parameters, log the means under `{log_key}/{name}` and
/// save a side-by-side grid of the first minibatch.
///
/// # Returns
/// mean losses keyed by `{log_key}/{name}`
pub fn run_validation<L>(
    loader: &L,
    model: &Pix2PixModel,
    visualizer: &Visualizer,
    counter: &IterationCounter,
    limit: usize,
    log_key: &str,
) -> anyhow::Result<LossMap>
where
    L: ImageDataLoader,
{
    let num_batches = loader.num_minibatch().min(limit);
    if num_batches == 0 {
        warn!("no {} data to validate", log_key);
        return Ok(LossMap::new());
    }

    let epoch = counter.current_epoch;
    let steps = counter.total_steps_so_far;

    let mut sums = LossMap::new();
    for b in 0..num_batches {
        let batch = loader.minibatch_data(b, model.device())?;
        let (losses, fake) = model.evaluate_losses(&batch)?;

        for (k, v) in losses {
            *sums.entry(k).or_default() += v;
        }

        if b == 0 {
            visualizer.visualize_sidebyside(
                &batch,
                Some(&fake),
                epoch,
                steps,
                DISPLAY_LIMIT,
                &format!("{}_validation", log_key),
            )?;
        }
    }

    let means: LossMap = sums
        .into_iter()
        .map(|(k, v)| (format!("{}/{}", log_key, k).into_boxed_str(), v / num_batches as f32))
        .collect();

    visualizer.print_current_errors(epoch, steps, &means, counter.time_per_iter)?;
    visualizer.plot_current_errors(&means, steps)?;
    Ok(means)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter_counter::IterCounterArgs;
    use crate::train_options::{LossConfig, ModelConfig};
    use candle_core::Device;
    use candle_util::candle_data_loader_util::ImageTransform;
    use image::GrayImage;

    fn write_dataset(root: &Path, n: usize) -> anyhow::Result<()> {
        for sub in [LABEL_DIR, IMAGE_DIR] {
            std::fs::create_dir_all(root.join(sub))?;
            for i in 0..n {
                let img = GrayImage::from_fn(40, 40, |x, y| image::Luma([((x + y + i as u32) % 255) as u8]));
                img.save(root.join(sub).join(format!("s{}.png", i)))?;
            }
        }
        Ok(())
    }

    #[test]
    fn validation_means_and_grid() -> anyhow::Result<()> {
        let data_dir = tempfile::tempdir()?;
        let exp_dir = tempfile::tempdir()?;
        write_dataset(data_dir.path(), 5)?;

        let transform = ImageTransform {
            load_size: 36,
            crop_size: 32,
            random_crop: true,
            flip: true,
        };
        let mut loader = ImageFolderData::new(data_dir.path(), transform, false)?;
        loader.shuffle_minibatch(2)?;
        assert_eq!(loader.num_minibatch(), 3);

        let config = ModelConfig {
            ngf: 2,
            ndf: 4,
            w_dim: 3,
            load_size: 36,
            crop_size: 32,
            norm_e: "spectralinstance".into(),
            norm_g: "spectralbatch".into(),
            norm_d: "spectralinstance".into(),
            spade_hidden: 4,
            n_layers_d: 2,
            num_d: 2,
        };
        let model = Pix2PixModel::new(&config, LossConfig::default(), &Device::Cpu)?;
        let visualizer = Visualizer::new(exp_dir.path())?;
        let counter = IterationCounter::new(
            IterCounterArgs {
                niter: 1,
                niter_decay: 0,
                batch_size: 2,
                dataset_size: 4,
                print_freq: 2,
                display_freq: 2,
                save_latest_freq: 2,
                save_epoch_freq: 1,
                continue_train: false,
            },
            exp_dir.path(),
        );

        let means = run_validation(&loader, &model, &visualizer, &counter, 2, "val")?;
        for k in ["val/GAN", "val/KLD", "val/D_Fake", "val/D_real", "val/log_L1"] {
            assert!(means.contains_key(k), "missing {}", k);
        }
        assert!(means.values().all(|v| v.is_finite()));
        assert!(visualizer.image_path(1, 0, "val_validation").exists());

        let scalars = std::fs::read_to_string(exp_dir.path().join(crate::visualizer::SCALARS_FILE))?;
        assert_eq!(scalars.lines().count(), means.len());
        Ok(())
    }
}
