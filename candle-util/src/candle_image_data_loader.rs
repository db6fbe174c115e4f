use crate::candle_data_loader_util::*;

use candle_core::{Device, Tensor};
use log::info;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const LABEL_DIR: &str = "label";
pub const IMAGE_DIR: &str = "image";
pub const STYLE_DIR: &str = "style";

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// One minibatch of single-channel images `(n, 1, h, w)` in [-1, 1]
pub struct ImageMinibatch {
    /// conditioning (content) map
    pub label: Tensor,
    /// target image
    pub image: Tensor,
    /// style reference fed to the encoder
    pub style: Tensor,
    /// sample names (file stems)
    pub names: Vec<Box<str>>,
}

impl ImageMinibatch {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// `ImageDataLoader` for minibatch learning
pub trait ImageDataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<ImageMinibatch>;

    fn num_minibatch(&self) -> usize;

    fn num_samples(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

#[derive(Clone, Debug)]
pub struct ImageTriplet {
    pub name: Box<str>,
    pub label: PathBuf,
    pub image: PathBuf,
    pub style: PathBuf,
}

///
/// Images under a data root paired by their file stems:
///
/// * `{root}/label/` conditioning maps
/// * `{root}/image/` targets
/// * `{root}/style/` style references (optional, `image/` otherwise)
///
pub struct ImageFolderData {
    triplets: Vec<ImageTriplet>,
    transform: ImageTransform,
    train: bool,
    minibatches: Minibatches,
}

fn list_images_by_stem(dir: &Path) -> anyhow::Result<HashMap<Box<str>, PathBuf>> {
    if !dir.is_dir() {
        return Err(anyhow::anyhow!("missing directory {}", dir.display()));
    }

    let mut ret = HashMap::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let ext = path
            .extension()
            .and_then(|x| x.to_str())
            .map(|x| x.to_lowercase())
            .unwrap_or_default();

        if !path.is_file() || !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }

        if let Some(stem) = path.file_stem().and_then(|x| x.to_str()) {
            ret.insert(stem.into(), path.clone());
        }
    }
    Ok(ret)
}

impl ImageFolderData {
    /// * `root` - data root directory
    /// * `transform` - resize/crop/flip
    /// * `train` - random crop/flip and shuffled minibatches
    pub fn new(root: &Path, transform: ImageTransform, train: bool) -> anyhow::Result<Self> {
        let labels = list_images_by_stem(&root.join(LABEL_DIR))?;
        let images = list_images_by_stem(&root.join(IMAGE_DIR))?;

        let style_dir = root.join(STYLE_DIR);
        let styles = if style_dir.is_dir() {
            Some(list_images_by_stem(&style_dir)?)
        } else {
            None
        };

        let mut names: Vec<&Box<str>> = labels.keys().collect();
        names.sort();

        let mut triplets = Vec::with_capacity(names.len());
        for name in names {
            let image = images
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("no target image for label {}", name))?;

            let style = match styles.as_ref() {
                Some(styles) => styles
                    .get(name)
                    .ok_or_else(|| anyhow::anyhow!("no style image for label {}", name))?,
                None => image,
            };

            triplets.push(ImageTriplet {
                name: name.clone(),
                label: labels[name].clone(),
                image: image.clone(),
                style: style.clone(),
            });
        }

        if triplets.is_empty() {
            return Err(anyhow::anyhow!("no images found under {}", root.display()));
        }

        if images.len() != triplets.len() {
            log::warn!(
                "{} target images without a matching label are ignored",
                images.len() - triplets.len()
            );
        }

        info!("found {} image pairs in {}", triplets.len(), root.display());

        let transform = if train {
            transform
        } else {
            ImageTransform {
                random_crop: false,
                flip: false,
                ..transform
            }
        };

        let minibatches = Minibatches::new(triplets.len());

        Ok(Self {
            triplets,
            transform,
            train,
            minibatches,
        })
    }

    fn read_sample(&self, idx: usize) -> anyhow::Result<[Vec<f32>; 3]> {
        let triplet = &self.triplets[idx];
        let params = self.transform.sample_params(&mut rand::rng());

        let load = |path: &Path| -> anyhow::Result<Vec<f32>> {
            let img = read_image(path)?;
            Ok(gray_to_unit_range(&self.transform.apply(&img, params)))
        };

        Ok([
            load(&triplet.label)?,
            load(&triplet.image)?,
            load(&triplet.style)?,
        ])
    }
}

impl ImageDataLoader for ImageFolderData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<ImageMinibatch> {
        let samples = self.minibatches.chunks.get(batch_idx).ok_or_else(|| {
            anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                self.num_minibatch()
            )
        })?;

        let decoded = samples
            .par_iter()
            .map(|&i| self.read_sample(i))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let n = samples.len();
        let s = self.transform.crop_size;

        let stack = |k: usize| -> anyhow::Result<Tensor> {
            let data: Vec<f32> = decoded.iter().flat_map(|x| x[k].iter().copied()).collect();
            Ok(Tensor::from_vec(data, (n, 1, s, s), target_device)?)
        };

        Ok(ImageMinibatch {
            label: stack(0)?,
            image: stack(1)?,
            style: stack(2)?,
            names: samples.iter().map(|&i| self.triplets[i].name.clone()).collect(),
        })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_samples(&self) -> usize {
        self.triplets.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if self.train {
            self.minibatches.shuffle_minibatch(batch_size);
        } else {
            self.minibatches.sequential_minibatch(batch_size);
        }
        Ok(())
    }
}
