//! Image sources for training and evaluation
//!
//! The model only needs `(batch, C, H, W)` tensors and the pixel variance used
//! to normalise the reconstruction loss. [`ImageSource`] captures exactly
//! that; [`InMemoryImages`] is the tensor-backed implementation.

use std::f64::consts::PI;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{HopVaeError, Result};

/// Values that 8-bit pixels 0 and 255 map to
pub const PIXEL_RANGE: (f64, f64) = (-0.5, 0.5);

/// A finite, indexable collection of equally shaped images
pub trait ImageSource {
    /// Number of images
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(channels, height, width)` of every image
    fn image_shape(&self) -> (usize, usize, usize);

    /// Stack the images at `indices` into `(indices.len(), C, H, W)`
    fn batch(&self, indices: &[usize]) -> Result<Tensor>;

    /// Population variance of all pixel values
    fn data_variance(&self) -> Result<f64>;

    /// Iterate over consecutive batches, shuffled when a seed is given. The
    /// last batch may be smaller.
    fn batches(&self, batch_size: usize, shuffle_seed: Option<u64>) -> Batches<'_, Self> {
        Batches::new(self, batch_size, shuffle_seed)
    }
}

/// Batch iterator over an [`ImageSource`]
pub struct Batches<'a, S: ImageSource + ?Sized> {
    source: &'a S,
    batch_size: usize,
    indices: Vec<usize>,
    current: usize,
}

impl<'a, S: ImageSource + ?Sized> Batches<'a, S> {
    fn new(source: &'a S, batch_size: usize, shuffle_seed: Option<u64>) -> Self {
        let mut indices: Vec<usize> = (0..source.len()).collect();
        if let Some(seed) = shuffle_seed {
            indices.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        Self {
            source,
            batch_size: batch_size.max(1),
            indices,
            current: 0,
        }
    }

    /// Number of batches in a full pass
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }
}

impl<'a, S: ImageSource + ?Sized> Iterator for Batches<'a, S> {
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.indices.len() {
            return None;
        }
        let end = (self.current + self.batch_size).min(self.indices.len());
        let batch = self.source.batch(&self.indices[self.current..end]);
        self.current = end;
        Some(batch)
    }
}

/// Images held in a single `(N, C, H, W)` tensor
#[derive(Debug, Clone)]
pub struct InMemoryImages {
    images: Tensor,
}

impl InMemoryImages {
    /// Wrap an `(N, C, H, W)` tensor
    pub fn new(images: Tensor) -> Result<Self> {
        let (n, c, h, w) = images.dims4()?;
        if n == 0 || c == 0 || h == 0 || w == 0 {
            return Err(HopVaeError::config(format!(
                "image tensor must be non-empty, got {:?}",
                images.dims()
            )));
        }
        Ok(Self {
            images: images.to_dtype(DType::F32)?,
        })
    }

    /// Build from 8-bit pixels in `(N, C, H, W)` order, mapped to
    /// `x / 255 − 0.5`
    pub fn from_pixels(
        pixels: &[u8],
        shape: (usize, usize, usize, usize),
        device: &Device,
    ) -> Result<Self> {
        let (n, c, h, w) = shape;
        if pixels.len() != n * c * h * w {
            return Err(HopVaeError::shape_mismatch(&[n * c * h * w], &[pixels.len()]));
        }
        let (low, high) = PIXEL_RANGE;
        let step = (high - low) / 255.0;
        let data: Vec<f32> = pixels
            .iter()
            .map(|&p| (low + p as f64 * step) as f32)
            .collect();
        Self::new(Tensor::from_vec(data, shape, device)?)
    }

    /// Deterministic sinusoidal gratings with values in `[-0.5, 0.5]`
    ///
    /// Every image gets its own orientation, frequency and phase drawn from a
    /// generator seeded with `seed`; channels differ by a phase offset.
    pub fn synthetic(
        count: usize,
        channels: usize,
        size: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = Vec::with_capacity(count * channels * size * size);

        for _ in 0..count {
            let angle = rng.gen_range(0.0..PI);
            let frequency = rng.gen_range(0.5..3.0) * 2.0 * PI / size as f64;
            let phase = rng.gen_range(0.0..2.0 * PI);
            let (fx, fy) = (frequency * angle.cos(), frequency * angle.sin());

            for c in 0..channels {
                let offset = phase + c as f64 * PI / 3.0;
                for y in 0..size {
                    for x in 0..size {
                        let value = 0.5 * (fx * x as f64 + fy * y as f64 + offset).sin();
                        data.push(value as f32);
                    }
                }
            }
        }

        Self::new(Tensor::from_vec(data, (count, channels, size, size), device)?)
    }

    /// The backing tensor
    pub fn images(&self) -> &Tensor {
        &self.images
    }
}

impl ImageSource for InMemoryImages {
    fn len(&self) -> usize {
        self.images.dims()[0]
    }

    fn image_shape(&self) -> (usize, usize, usize) {
        let dims = self.images.dims();
        (dims[1], dims[2], dims[3])
    }

    fn batch(&self, indices: &[usize]) -> Result<Tensor> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(HopVaeError::config(format!(
                "image index {} out of range for {} images",
                bad,
                self.len()
            )));
        }
        let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let ids = Tensor::from_vec(ids, indices.len(), self.images.device())?;
        Ok(self.images.index_select(&ids, 0)?)
    }

    fn data_variance(&self) -> Result<f64> {
        let mean = self.images.mean_all()?;
        let variance = self.images.broadcast_sub(&mean)?.sqr()?.mean_all()?;
        Ok(variance.to_scalar::<f32>()? as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn source() -> InMemoryImages {
        InMemoryImages::synthetic(10, 3, 8, 1, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_synthetic_shape_and_range() {
        let images = source();
        assert_eq!(images.len(), 10);
        assert_eq!(images.image_shape(), (3, 8, 8));

        let values = images.images().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (-0.5..=0.5).contains(v)));
    }

    #[test]
    fn test_synthetic_is_deterministic() {
        let a = InMemoryImages::synthetic(4, 1, 6, 9, &Device::Cpu).unwrap();
        let b = InMemoryImages::synthetic(4, 1, 6, 9, &Device::Cpu).unwrap();
        assert_eq!(
            a.images().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.images().flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_batches_cover_everything_once() {
        let images = source();
        let batches = images.batches(4, Some(3));
        assert_eq!(batches.num_batches(), 3);

        let sizes: Vec<usize> = batches.map(|b| b.unwrap().dims()[0]).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_ordered_batches() {
        let images = source();
        let first = images.batches(2, None).next().unwrap().unwrap();
        let expected = images.images().narrow(0, 0, 2).unwrap();
        assert_eq!(
            first.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            expected.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_shuffle_depends_on_seed() {
        let images = source();
        let collect = |seed| -> Vec<f32> {
            images
                .batches(10, Some(seed))
                .next()
                .unwrap()
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap()
        };
        assert_eq!(collect(5), collect(5));
        assert_ne!(collect(5), collect(6));
    }

    #[test]
    fn test_data_variance() {
        let pixels = [0u8, 255, 0, 255];
        let images = InMemoryImages::from_pixels(&pixels, (1, 1, 2, 2), &Device::Cpu).unwrap();
        assert_relative_eq!(images.data_variance().unwrap(), 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_from_pixels_rejects_wrong_length() {
        assert!(InMemoryImages::from_pixels(&[0u8; 3], (1, 1, 2, 2), &Device::Cpu).is_err());
    }

    #[test]
    fn test_batch_index_out_of_range() {
        assert!(source().batch(&[0, 10]).is_err());
    }
}
