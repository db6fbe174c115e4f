use crate::lentil_common::*;

use candle_core::Tensor;
use candle_util::candle_data_loader_util::tensor_to_gray_images;
use image::GrayImage;
use std::io::Write;

pub const LOSS_LOG_FILE: &str = "loss_log.txt";
pub const SCALARS_FILE: &str = "scalars.tsv";
pub const WEB_IMAGE_DIR: &str = "web/images";

/// Writes the loss log, the scalar table and image grids of an
/// experiment
pub struct Visualizer {
    log_path: PathBuf,
    scalars_path: PathBuf,
    image_dir: PathBuf,
}

impl Visualizer {
    pub fn new(experiment_dir: &Path) -> anyhow::Result<Self> {
        let image_dir = experiment_dir.join(WEB_IMAGE_DIR);
        std::fs::create_dir_all(&image_dir)?;

        let log_path = experiment_dir.join(LOSS_LOG_FILE);
        let mut log = open_append_writer(&log_path)?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        writeln!(log, "================ Training Loss ({}) ================", now)?;
        log.flush()?;

        Ok(Self {
            log_path,
            scalars_path: experiment_dir.join(SCALARS_FILE),
            image_dir,
        })
    }

    /// Log one line of losses and append it to `loss_log.txt`
    pub fn print_current_errors(
        &self,
        epoch: usize,
        steps: usize,
        losses: &LossMap,
        time_per_iter: f32,
    ) -> anyhow::Result<()> {
        let mut message = format!("(epoch: {}, iters: {}, time: {:.3}) ", epoch, steps, time_per_iter);
        for (k, v) in losses.iter() {
            message.push_str(&format!("{}: {:.3} ", k, v));
        }
        info!("{}", message);

        let mut log = open_append_writer(&self.log_path)?;
        writeln!(log, "{}", message)?;
        log.flush()?;
        Ok(())
    }

    /// Append `step\tname\tvalue` rows to `scalars.tsv`
    pub fn plot_current_errors(&self, losses: &LossMap, steps: usize) -> anyhow::Result<()> {
        let mut out = open_append_writer(&self.scalars_path)?;
        for (k, v) in losses.iter() {
            writeln!(out, "{}\t{}\t{}", steps, k, v)?;
        }
        out.flush()?;
        Ok(())
    }

    /// `web/images/epoch{epoch:03}_iter{steps}_{log_key}.png`
    pub fn image_path(&self, epoch: usize, steps: usize, log_key: &str) -> PathBuf {
        self.image_dir
            .join(format!("epoch{:03}_iter{}_{}.png", epoch, steps, log_key))
    }

    /// Save a grid with one row per sample, columns `label | style |
    /// image | fake`; `fake` is omitted if not available
    pub fn visualize_sidebyside(
        &self,
        batch: &ImageMinibatch,
        fake: Option<&Tensor>,
        epoch: usize,
        steps: usize,
        limit: usize,
        log_key: &str,
    ) -> anyhow::Result<PathBuf> {
        let mut columns = vec![
            tensor_to_gray_images(&batch.label)?,
            tensor_to_gray_images(&batch.style)?,
            tensor_to_gray_images(&batch.image)?,
        ];
        if let Some(fake) = fake {
            columns.push(tensor_to_gray_images(fake)?);
        }

        let nrow = columns.iter().map(|c| c.len()).min().unwrap_or(0).min(limit);
        let rows: Vec<Vec<&GrayImage>> = (0..nrow)
            .map(|r| columns.iter().map(|c| &c[r]).collect())
            .collect();

        let path = self.image_path(epoch, steps, log_key);
        image_grid(&rows)?.save(&path)?;
        Ok(path)
    }
}

/// Tile images row by row; every cell takes the size of the first
fn image_grid(rows: &[Vec<&GrayImage>]) -> anyhow::Result<GrayImage> {
    let first = rows
        .first()
        .and_then(|r| r.first())
        .ok_or_else(|| anyhow::anyhow!("nothing to visualize"))?;
    let (w, h) = first.dimensions();
    let ncol = rows.iter().map(|r| r.len()).max().unwrap_or(0) as u32;

    let mut grid = GrayImage::new(w * ncol, h * rows.len() as u32);
    for (r, row) in rows.iter().enumerate() {
        for (c, tile) in row.iter().enumerate() {
            image::imageops::replace(&mut grid, *tile, (c as u32 * w) as i64, (r as u32 * h) as i64);
        }
    }
    Ok(grid)
}
