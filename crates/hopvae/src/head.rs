//! Output heads
//!
//! The decoder is shared; only the interpretation of its output differs.
//! [`OutputHead::DirectPixel`] treats it as the reconstructed image,
//! [`OutputHead::MixtureLikelihood`] as discretized logistic mixture
//! parameters.

use candle_core::Tensor;
use rand::Rng;

use crate::config::{HeadConfig, HopVaeConfig};
use crate::error::{HopVaeError, Result};
use crate::likelihood::DiscretizedLogisticMixture;

/// How decoder output is turned into images or likelihoods
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputHead {
    /// Decoder output is the image
    DirectPixel,
    /// Decoder output parameterises a per-pixel mixture
    MixtureLikelihood(DiscretizedLogisticMixture),
}

/// Result of [`crate::HopVae::forward`]
#[derive(Debug, Clone)]
pub enum HeadOutput {
    /// `(batch, C, H, W)` direct reconstruction
    Reconstruction(Tensor),
    /// `(batch, C·H·W)` per-dimension log-likelihood of the input
    LogLikelihood(Tensor),
    /// `(batch, C, H, W)` values drawn from the mixture
    Samples(Tensor),
}

impl HeadOutput {
    /// Borrow the wrapped tensor
    pub fn tensor(&self) -> &Tensor {
        match self {
            HeadOutput::Reconstruction(t)
            | HeadOutput::LogLikelihood(t)
            | HeadOutput::Samples(t) => t,
        }
    }

    /// Unwrap into the tensor
    pub fn into_tensor(self) -> Tensor {
        match self {
            HeadOutput::Reconstruction(t)
            | HeadOutput::LogLikelihood(t)
            | HeadOutput::Samples(t) => t,
        }
    }
}

impl OutputHead {
    /// Build the head described by `config.head`
    pub fn from_config(config: &HopVaeConfig) -> Result<Self> {
        match config.head {
            HeadConfig::Direct => Ok(OutputHead::DirectPixel),
            HeadConfig::Mixture {
                num_mixtures,
                num_bins,
                low,
                high,
            } => {
                let mixture =
                    DiscretizedLogisticMixture::new(num_mixtures, config.num_channels, num_bins)?
                        .with_range(low, high)?;
                Ok(OutputHead::MixtureLikelihood(mixture))
            }
        }
    }

    /// The mixture, if this is the likelihood head
    pub fn mixture(&self) -> Option<&DiscretizedLogisticMixture> {
        match self {
            OutputHead::DirectPixel => None,
            OutputHead::MixtureLikelihood(mixture) => Some(mixture),
        }
    }

    /// Per-dimension log-likelihood of `image` under decoded parameters,
    /// `(batch, C·H·W)`
    ///
    /// Pixels are clamped into the mixture range first.
    pub fn log_likelihood(
        mixture: &DiscretizedLogisticMixture,
        decoded: &Tensor,
        image: &Tensor,
    ) -> Result<Tensor> {
        let params = mixture.split_params(decoded)?;
        let (batch, seq, _) = params.dims()?;
        if image.elem_count() != batch * seq {
            return Err(HopVaeError::shape_mismatch(&[batch, seq], image.dims()));
        }
        let (low, high) = mixture.range();
        let target = image.clamp(low, high)?.reshape((batch, seq, 1))?;
        mixture.log_prob(&params, &target)
    }

    /// Turn decoded output into images, drawing from the mixture when there
    /// is one
    pub fn sample<R: Rng + ?Sized>(&self, decoded: &Tensor, rng: &mut R) -> Result<Tensor> {
        match self {
            OutputHead::DirectPixel => Ok(decoded.clone()),
            OutputHead::MixtureLikelihood(mixture) => {
                let params = mixture.split_params(decoded)?;
                let samples = mixture.sample(&params, rng)?;
                Self::unflatten(mixture, decoded, &samples)
            }
        }
    }

    /// Deterministic image view of decoded output; the mixture mean for the
    /// likelihood head
    pub fn to_image(&self, decoded: &Tensor) -> Result<Tensor> {
        match self {
            OutputHead::DirectPixel => Ok(decoded.clone()),
            OutputHead::MixtureLikelihood(mixture) => {
                let params = mixture.split_params(decoded)?;
                let mean = mixture.mean(&params)?;
                Self::unflatten(mixture, decoded, &mean)
            }
        }
    }

    /// `(batch, C·H·W)` → `(batch, C, H, W)` using the decoded spatial size
    fn unflatten(
        mixture: &DiscretizedLogisticMixture,
        decoded: &Tensor,
        flat: &Tensor,
    ) -> Result<Tensor> {
        let (batch, _, height, width) = decoded.dims4()?;
        Ok(flat.reshape((batch, mixture.num_channels(), height, width))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn mixture_head(k: usize, c: usize) -> OutputHead {
        OutputHead::MixtureLikelihood(DiscretizedLogisticMixture::new(k, c, 256).unwrap())
    }

    #[test]
    fn test_from_config() {
        let config = HopVaeConfig::cifar10();
        assert_eq!(OutputHead::from_config(&config).unwrap(), OutputHead::DirectPixel);

        let config = config.with_head(HeadConfig::mixture(10));
        let head = OutputHead::from_config(&config).unwrap();
        assert_eq!(head.mixture().unwrap().param_channels(), 70);
    }

    #[test]
    fn test_direct_head_passes_through() {
        let decoded = Tensor::randn(0f32, 1.0, (2, 3, 4, 4), &Device::Cpu).unwrap();
        let head = OutputHead::DirectPixel;
        let image = head.to_image(&decoded).unwrap();
        assert_eq!(
            image.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            decoded.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_mixture_head_shapes() {
        let head = mixture_head(4, 3);
        let decoded = Tensor::randn(0f32, 1.0, (2, 28, 5, 5), &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(0);

        assert_eq!(head.sample(&decoded, &mut rng).unwrap().dims(), &[2, 3, 5, 5]);
        assert_eq!(head.to_image(&decoded).unwrap().dims(), &[2, 3, 5, 5]);

        let image = Tensor::zeros((2, 3, 5, 5), DType::F32, &Device::Cpu).unwrap();
        let ll = OutputHead::log_likelihood(head.mixture().unwrap(), &decoded, &image).unwrap();
        assert_eq!(ll.dims(), &[2, 75]);
    }

    #[test]
    fn test_log_likelihood_rejects_wrong_image() {
        let head = mixture_head(2, 1);
        let decoded = Tensor::zeros((1, 6, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let image = Tensor::zeros((1, 1, 3, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            OutputHead::log_likelihood(head.mixture().unwrap(), &decoded, &image),
            Err(HopVaeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_head_output_accessors() {
        let t = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        let out = HeadOutput::LogLikelihood(t);
        assert_eq!(out.tensor().dims(), &[1, 4]);
        assert_eq!(out.into_tensor().dims(), &[1, 4]);
    }
}
