use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use rand::prelude::SliceRandom;
use rand::Rng;
use std::path::Path;

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` or `sequential_minibatch` is called,
/// `chunks` partition indexes.
///
pub struct Minibatches {
    pub samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(size: usize) -> Self {
        Self {
            samples: (0..size).collect(),
            chunks: vec![],
        }
    }

    /// Random permutation split into `batch_size` chunks; the last
    /// incomplete chunk is dropped unless it is the only one.
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        let mut rng = rand::rng();
        self.samples.shuffle(&mut rng);
        self.chunks = Self::partition(&self.samples, batch_size.max(1), true);
    }

    /// Keep the sample order and all the samples
    pub fn sequential_minibatch(&mut self, batch_size: usize) {
        self.samples.sort_unstable();
        self.chunks = Self::partition(&self.samples, batch_size.max(1), false);
    }

    fn partition(samples: &[usize], batch_size: usize, drop_last: bool) -> Vec<Vec<usize>> {
        let mut chunks: Vec<Vec<usize>> = samples.chunks(batch_size).map(|c| c.to_vec()).collect();
        if drop_last && chunks.len() > 1 {
            if let Some(last) = chunks.last() {
                if last.len() < batch_size {
                    chunks.pop();
                }
            }
        }
        chunks
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

/// How to turn an image file into a fixed-size training example
#[derive(Clone, Copy, Debug)]
pub struct ImageTransform {
    pub load_size: usize,
    pub crop_size: usize,
    pub random_crop: bool,
    pub flip: bool,
}

/// Random choices shared by all the images of one sample so that
/// label and target stay aligned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropFlip {
    pub x: u32,
    pub y: u32,
    pub flip: bool,
}

impl ImageTransform {
    pub fn sample_params<R: Rng>(&self, rng: &mut R) -> CropFlip {
        let margin = self.load_size.saturating_sub(self.crop_size) as u32;
        let (x, y) = if self.random_crop && margin > 0 {
            (rng.random_range(0..=margin), rng.random_range(0..=margin))
        } else {
            (margin / 2, margin / 2)
        };
        CropFlip {
            x,
            y,
            flip: self.flip && rng.random_bool(0.5),
        }
    }

    /// resize to `load_size`, crop `crop_size`, optionally flip
    pub fn apply(&self, img: &DynamicImage, params: CropFlip) -> GrayImage {
        let load = self.load_size.max(self.crop_size) as u32;
        let crop = self.crop_size as u32;
        let resized = img.resize_exact(load, load, FilterType::Triangle).to_luma8();
        let cropped = image::imageops::crop_imm(&resized, params.x, params.y, crop, crop).to_image();
        if params.flip {
            image::imageops::flip_horizontal(&cropped)
        } else {
            cropped
        }
    }
}

/// Read an image file as grayscale regardless of its format
pub fn read_image(path: &Path) -> anyhow::Result<DynamicImage> {
    image::open(path).map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))
}

/// [0, 255] -> [-1, 1]
pub fn gray_to_unit_range(img: &GrayImage) -> Vec<f32> {
    img.as_raw().iter().map(|&v| v as f32 / 127.5 - 1.0).collect()
}

/// [-1, 1] -> [0, 255] with clamping
pub fn unit_range_to_gray(values: &[f32], width: u32, height: u32) -> anyhow::Result<GrayImage> {
    let raw: Vec<u8> = values
        .iter()
        .map(|&v| (((v.clamp(-1.0, 1.0) + 1.0) * 127.5).round()) as u8)
        .collect();
    GrayImage::from_raw(width, height, raw)
        .ok_or_else(|| anyhow::anyhow!("{} values can't fill {} x {}", values.len(), width, height))
}

/// Split `(n, c, h, w)` images in [-1, 1] into `n` grayscale images;
/// only the first channel is kept.
pub fn tensor_to_gray_images(x_nchw: &candle_core::Tensor) -> anyhow::Result<Vec<GrayImage>> {
    let (n, _, h, w) = x_nchw.dims4()?;
    let x = x_nchw
        .narrow(1, 0, 1)?
        .to_device(&candle_core::Device::Cpu)?
        .to_dtype(candle_core::DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;

    x.chunks(h * w)
        .take(n)
        .map(|values| unit_range_to_gray(values, w as u32, h as u32))
        .collect()
}
