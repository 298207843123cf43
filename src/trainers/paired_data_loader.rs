//! Paired visible/infrared data loader for LLVIP-style datasets
//!
//! Expects `<root>/visible/<split>` and `<root>/infrared/<split>` holding the
//! same number of images, paired by sorted file name. Both images of a pair
//! receive the same random flip and crop so they stay pixel-aligned.

use candle_core::{Device, Tensor};
use image::imageops::{self, FilterType};
use image::RgbImage;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ConsistencyError, Result};
use crate::trainers::image_utils::rgb_to_tensor;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub root: PathBuf,
    pub split: String,
    /// Side of the square random crop, clamped to the image size
    pub crop_size: u32,
    /// Side of the square network input after cropping
    pub resize_size: u32,
    pub random_flip: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("LLVIP"),
            split: "train".to_string(),
            crop_size: 512,
            resize_size: 128,
            random_flip: true,
        }
    }
}

/// Sorted image files directly inside `dir`
fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

pub struct PairedDataset {
    config: DataConfig,
    pairs: Vec<(PathBuf, PathBuf)>,
}

impl PairedDataset {
    pub fn new(config: DataConfig) -> Result<Self> {
        let visible_dir = config.root.join("visible").join(&config.split);
        let infrared_dir = config.root.join("infrared").join(&config.split);
        let visible = list_images(&visible_dir)?;
        let infrared = list_images(&infrared_dir)?;

        if visible.len() != infrared.len() {
            warn!(
                "{} visible vs {} infrared images, pairing the first {}",
                visible.len(),
                infrared.len(),
                visible.len().min(infrared.len())
            );
        }
        let pairs: Vec<_> = visible.into_iter().zip(infrared).collect();
        if pairs.is_empty() {
            return Err(ConsistencyError::NoValidPairs(config.root.display().to_string()));
        }

        info!("Paired dataset: {} pairs from {}", pairs.len(), config.root.display());
        Ok(Self { config, pairs })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    /// Loads and augments pair `index` as `(visible, infrared)` on the CPU
    ///
    /// Fails with `PairMismatch` when the two source images differ in size.
    pub fn load_pair<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<(Tensor, Tensor)> {
        let (visible_path, infrared_path) = &self.pairs[index];
        let mut visible = image::open(visible_path)?.to_rgb8();
        let mut infrared = image::open(infrared_path)?.to_rgb8();

        if visible.dimensions() != infrared.dimensions() {
            return Err(ConsistencyError::PairMismatch {
                index,
                visible: visible.dimensions(),
                infrared: infrared.dimensions(),
            });
        }

        if self.config.random_flip && rng.gen_bool(0.5) {
            visible = imageops::flip_horizontal(&visible);
            infrared = imageops::flip_horizontal(&infrared);
        }

        let (width, height) = visible.dimensions();
        let crop_w = self.config.crop_size.min(width);
        let crop_h = self.config.crop_size.min(height);
        let x = rng.gen_range(0..=width - crop_w);
        let y = rng.gen_range(0..=height - crop_h);

        let prepare = |img: &RgbImage| -> Result<Tensor> {
            let cropped = imageops::crop_imm(img, x, y, crop_w, crop_h).to_image();
            let size = self.config.resize_size;
            let resized = imageops::resize(&cropped, size, size, FilterType::Triangle);
            rgb_to_tensor(&resized, &Device::Cpu)
        };

        Ok((prepare(&visible)?, prepare(&infrared)?))
    }
}

/// Shuffled batches over a `PairedDataset`, reshuffled every epoch
pub struct PairedDataLoader {
    dataset: PairedDataset,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    rng: StdRng,
    device: Device,
}

impl PairedDataLoader {
    pub fn new(dataset: PairedDataset, batch_size: usize, seed: u64, device: Device) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        order.shuffle(&mut rng);
        Self {
            dataset,
            batch_size: batch_size.max(1),
            order,
            cursor: 0,
            epoch: 0,
            rng,
            device,
        }
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    fn next_index(&mut self) -> usize {
        if self.cursor == self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
            self.epoch += 1;
        }
        let index = self.order[self.cursor];
        self.cursor += 1;
        index
    }

    /// Next `(visible, infrared)` batch, each `[B, 3, S, S]` on the loader's device
    ///
    /// Mismatched pairs are logged and replaced by the following ones.
    pub fn next_batch(&mut self) -> Result<(Tensor, Tensor)> {
        let mut visible = Vec::with_capacity(self.batch_size);
        let mut infrared = Vec::with_capacity(self.batch_size);
        let mut skipped = 0;

        while visible.len() < self.batch_size {
            let wanted = self.batch_size - visible.len();
            let jobs: Vec<(usize, u64)> = (0..wanted)
                .map(|_| {
                    let index = self.next_index();
                    (index, self.rng.gen())
                })
                .collect();

            let dataset = &self.dataset;
            let loaded: Vec<Result<(Tensor, Tensor)>> = jobs
                .par_iter()
                .map(|&(index, seed)| dataset.load_pair(index, &mut StdRng::seed_from_u64(seed)))
                .collect();

            for result in loaded {
                match result {
                    Ok((v, i)) => {
                        visible.push(v);
                        infrared.push(i);
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!("Skipping image pair: {e}");
                        skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            if skipped >= self.dataset.len() && visible.is_empty() {
                return Err(ConsistencyError::NoValidPairs(
                    self.dataset.config.root.display().to_string(),
                ));
            }
        }

        let visible = Tensor::stack(&visible, 0)?.to_device(&self.device)?;
        let infrared = Tensor::stack(&infrared, 0)?.to_device(&self.device)?;
        Ok((visible, infrared))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn write_pair(root: &Path, name: &str, visible: (u32, u32), infrared: (u32, u32)) {
        // horizontal gradient, so a flip is visible in the pixels
        let make = |(w, h): (u32, u32)| {
            RgbImage::from_fn(w, h, |x, y| Rgb([(x * 20) as u8, (y * 20) as u8, 128]))
        };
        make(visible).save(root.join("visible/train").join(name)).unwrap();
        make(infrared).save(root.join("infrared/train").join(name)).unwrap();
    }

    fn dataset_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("visible/train")).unwrap();
        fs::create_dir_all(dir.path().join("infrared/train")).unwrap();
        write_pair(dir.path(), "010001.png", (12, 10), (12, 10));
        write_pair(dir.path(), "010002.png", (12, 10), (10, 12));
        write_pair(dir.path(), "010003.png", (12, 10), (12, 10));
        dir
    }

    fn config(root: &Path) -> DataConfig {
        DataConfig {
            root: root.to_path_buf(),
            crop_size: 8,
            resize_size: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_pairs_by_sorted_name() -> Result<()> {
        let dir = dataset_dir();
        let dataset = PairedDataset::new(config(dir.path()))?;
        assert_eq!(dataset.len(), 3);
        assert!(dataset.pairs[1].0.ends_with("visible/train/010002.png"));
        assert!(dataset.pairs[1].1.ends_with("infrared/train/010002.png"));
        Ok(())
    }

    #[test]
    fn test_mismatched_pair_is_recoverable() -> Result<()> {
        let dir = dataset_dir();
        let dataset = PairedDataset::new(config(dir.path()))?;
        let err = dataset
            .load_pair(1, &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, ConsistencyError::PairMismatch { index: 1, .. }));
        Ok(())
    }

    #[test]
    fn test_augmentation_is_synchronised() -> Result<()> {
        let dir = dataset_dir();
        let dataset = PairedDataset::new(config(dir.path()))?;
        for seed in 0..8 {
            let (visible, infrared) = dataset.load_pair(0, &mut StdRng::seed_from_u64(seed))?;
            assert_eq!(visible.dims(), &[3, 4, 4]);
            assert_eq!(visible.to_vec3::<f32>()?, infrared.to_vec3::<f32>()?);
        }
        Ok(())
    }

    #[test]
    fn test_batches_skip_mismatched_pairs() -> Result<()> {
        let dir = dataset_dir();
        let dataset = PairedDataset::new(config(dir.path()))?;
        let mut loader = PairedDataLoader::new(dataset, 2, 42, Device::Cpu);

        for _ in 0..5 {
            let (visible, infrared) = loader.next_batch()?;
            assert_eq!(visible.dims(), &[2, 3, 4, 4]);
            assert_eq!(infrared.dims(), &[2, 3, 4, 4]);
            let max = visible.abs()?.max_all()?.to_scalar::<f32>()?;
            assert!(max <= 1.0);
        }
        // ten good samples from two good pairs per epoch
        assert!(loader.epoch() >= 3);
        Ok(())
    }

    #[test]
    fn test_all_mismatched_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("visible/train")).unwrap();
        fs::create_dir_all(dir.path().join("infrared/train")).unwrap();
        write_pair(dir.path(), "a.png", (12, 10), (10, 12));
        let dataset = PairedDataset::new(config(dir.path())).unwrap();
        let mut loader = PairedDataLoader::new(dataset, 2, 0, Device::Cpu);
        assert!(matches!(loader.next_batch(), Err(ConsistencyError::NoValidPairs(_))));
    }
}
