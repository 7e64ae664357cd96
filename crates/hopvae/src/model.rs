//! The HopVAE orchestrator
//!
//! ```text
//! image ─▶ Encoder ─▶ 1×1 conv ─▶ (B, R², D) ─▶ Hopfield ─▶ (B, D, R, R) ─▶ Decoder ─▶ head
//! ```

use candle_core::{Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::HopVaeConfig;
use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::error::{HopVaeError, Result};
use crate::head::{HeadOutput, OutputHead};
use crate::hopfield::HopfieldLayer;

/// Whether [`HopVae::forward`] scores the input or draws from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Mixture head returns the log-likelihood of the input
    Train,
    /// Mixture head returns samples
    Eval,
}

/// Outcome of [`HopVae::interpolate`]
#[derive(Debug, Clone)]
pub enum Interpolation {
    /// Decoder output for the averaged embedding grids
    Blended(Tensor),
    /// The inputs had different shapes; holds the first input unchanged
    ShapeMismatch(Tensor),
}

impl Interpolation {
    /// Whether the inputs were actually blended
    pub fn is_blended(&self) -> bool {
        matches!(self, Interpolation::Blended(_))
    }

    /// Unwrap into the tensor
    pub fn into_tensor(self) -> Tensor {
        match self {
            Interpolation::Blended(t) | Interpolation::ShapeMismatch(t) => t,
        }
    }
}

/// Autoencoder with a modern Hopfield bottleneck
///
/// Parameters are registered in the [`VarBuilder`] passed to [`HopVae::new`]
/// under `encoder`, `pre_quantization`, `hopfield` and `decoder`.
#[derive(Debug, Clone)]
pub struct HopVae {
    config: HopVaeConfig,
    encoder: Encoder,
    pre_quantization: Conv2d,
    hopfield: HopfieldLayer,
    decoder: Decoder,
    head: OutputHead,
}

impl HopVae {
    /// Validate `config` and build every component.
    ///
    /// # Errors
    ///
    /// Returns [`HopVaeError::DimensionMismatch`] when the encoder grid for
    /// `image_size` differs from `representation_dim`, and
    /// [`HopVaeError::Config`] for other invalid settings.
    pub fn new(config: &HopVaeConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let encoder = Encoder::new(
            config.num_channels,
            config.num_hiddens,
            config.num_residual_layers,
            config.num_residual_hiddens,
            vb.pp("encoder"),
        )?;
        let pre_quantization = conv2d(
            config.num_hiddens,
            config.embedding_dim,
            1,
            Conv2dConfig::default(),
            vb.pp("pre_quantization"),
        )?;
        let hopfield = HopfieldLayer::new(
            config.embedding_dim,
            config.num_embeddings,
            config.hopfield_scaling(),
            config.hopfield.learn_scaling,
            vb.pp("hopfield"),
        )?;
        let decoder = Decoder::new(
            config.embedding_dim,
            config.decoder_out_channels(),
            config.num_hiddens,
            config.num_residual_layers,
            config.num_residual_hiddens,
            vb.pp("decoder"),
        )?;
        let head = OutputHead::from_config(config)?;

        tracing::debug!(
            image_size = config.image_size,
            grid = config.representation_dim,
            embedding_dim = config.embedding_dim,
            memory = config.num_embeddings,
            out_channels = config.decoder_out_channels(),
            "Built HopVAE"
        );

        Ok(Self {
            config: config.clone(),
            encoder,
            pre_quantization,
            hopfield,
            decoder,
            head,
        })
    }

    pub fn config(&self) -> &HopVaeConfig {
        &self.config
    }

    pub fn head(&self) -> &OutputHead {
        &self.head
    }

    /// The associative-memory bottleneck
    pub fn hopfield(&self) -> &HopfieldLayer {
        &self.hopfield
    }

    fn check_input(&self, image: &Tensor) -> Result<()> {
        let dims = image.dims();
        let size = self.config.image_size;
        let expected = [
            dims.first().copied().unwrap_or(0),
            self.config.num_channels,
            size,
            size,
        ];
        if dims != expected {
            return Err(HopVaeError::shape_mismatch(&expected, dims));
        }
        Ok(())
    }

    /// Encode and project to the `(batch, embedding_dim, R, R)` grid
    pub fn embed(&self, image: &Tensor) -> Result<Tensor> {
        self.check_input(image)?;
        let features = self.encoder.forward(image)?;
        let embedded = self.pre_quantization.forward(&features)?;

        let (_, _, height, width) = embedded.dims4()?;
        let grid = self.config.representation_dim;
        for actual in [height, width] {
            if actual != grid {
                return Err(HopVaeError::DimensionMismatch {
                    what: "representation grid",
                    expected: grid,
                    actual,
                });
            }
        }
        Ok(embedded)
    }

    /// Replace every grid vector by its Hopfield retrieval
    pub fn quantize(&self, embedded: &Tensor) -> Result<Tensor> {
        let (batch, dim, height, width) = embedded.dims4()?;
        let queries = embedded
            .permute((0, 2, 3, 1))?
            .reshape((batch, height * width, dim))?;
        let retrieved = self.hopfield.forward(&queries)?;
        self.sequence_to_grid(&retrieved)
    }

    /// `(batch, R², D)` → `(batch, D, R, R)`
    fn sequence_to_grid(&self, sequence: &Tensor) -> Result<Tensor> {
        let (batch, _, dim) = sequence.dims3()?;
        let grid = self.config.representation_dim;
        Ok(sequence
            .reshape((batch, grid, grid, dim))?
            .permute((0, 3, 1, 2))?
            .contiguous()?)
    }

    /// Decoder output for a quantized grid
    pub fn decode(&self, quantized: &Tensor) -> Result<Tensor> {
        Ok(self.decoder.forward(quantized)?)
    }

    /// Raw decoder output: the reconstruction, or mixture parameters
    /// `(batch, K·(1+2C), H, W)` for the likelihood head
    pub fn reconstruct(&self, image: &Tensor) -> Result<Tensor> {
        let embedded = self.embed(image)?;
        let quantized = self.quantize(&embedded)?;
        self.decode(&quantized)
    }

    /// Run the model in the given mode
    ///
    /// `rng` is only drawn from by the mixture head in [`ForwardMode::Eval`].
    pub fn forward<R: Rng + ?Sized>(
        &self,
        image: &Tensor,
        mode: ForwardMode,
        rng: &mut R,
    ) -> Result<HeadOutput> {
        let decoded = self.reconstruct(image)?;
        match (&self.head, mode) {
            (OutputHead::DirectPixel, _) => Ok(HeadOutput::Reconstruction(decoded)),
            (OutputHead::MixtureLikelihood(mixture), ForwardMode::Train) => Ok(
                HeadOutput::LogLikelihood(OutputHead::log_likelihood(mixture, &decoded, image)?),
            ),
            (OutputHead::MixtureLikelihood(_), ForwardMode::Eval) => {
                Ok(HeadOutput::Samples(self.head.sample(&decoded, rng)?))
            }
        }
    }

    /// Generate `num_samples` images from standard-normal queries
    ///
    /// Returns `(num_samples, C, H, W)`: decoder output for the direct head,
    /// mixture draws for the likelihood head.
    pub fn sample<R: Rng + ?Sized>(&self, num_samples: usize, rng: &mut R) -> Result<Tensor> {
        if num_samples == 0 {
            return Err(HopVaeError::config("num_samples must be positive"));
        }
        let patterns = self.config.num_patterns();
        let dim = self.config.embedding_dim;
        let bank = self.hopfield.stored_patterns();

        let noise: Vec<f32> = (0..num_samples * patterns * dim)
            .map(|_| rng.sample(StandardNormal))
            .collect();
        let queries = Tensor::from_vec(noise, (num_samples, patterns, dim), bank.device())?
            .to_dtype(bank.dtype())?;

        let retrieved = self.hopfield.forward(&queries)?;
        let decoded = self.decode(&self.sequence_to_grid(&retrieved)?)?;
        self.head.sample(&decoded, rng)
    }

    /// Decode the average of the embedding grids of `a` and `b`
    ///
    /// Inputs of different shapes are not an error: `a` is returned unchanged
    /// as [`Interpolation::ShapeMismatch`].
    pub fn interpolate(&self, a: &Tensor, b: &Tensor) -> Result<Interpolation> {
        if a.dims() != b.dims() {
            tracing::warn!(
                a = ?a.dims(),
                b = ?b.dims(),
                "Interpolation inputs differ in shape, returning first input"
            );
            return Ok(Interpolation::ShapeMismatch(a.clone()));
        }

        let za = self.embed(a)?;
        let zb = self.embed(b)?;
        let blended = ((za + zb)? / 2.0)?;
        let quantized = self.quantize(&blended)?;
        Ok(Interpolation::Blended(self.decode(&quantized)?))
    }

    /// Image view of decoder output: unchanged for the direct head, the
    /// mixture mean `(batch, C, H, W)` for the likelihood head
    pub fn to_image(&self, decoded: &Tensor) -> Result<Tensor> {
        self.head.to_image(decoded)
    }

    /// Scalar training objective
    ///
    /// Direct head: `mse(reconstruction, image) / data_variance`. Mixture
    /// head: mean negative log-likelihood per dimension; `data_variance` is
    /// ignored.
    pub fn loss(&self, image: &Tensor, data_variance: f64) -> Result<Tensor> {
        match &self.head {
            OutputHead::DirectPixel => {
                if !(data_variance.is_finite() && data_variance > 0.0) {
                    return Err(HopVaeError::config(format!(
                        "data_variance must be positive, got {}",
                        data_variance
                    )));
                }
                let decoded = self.reconstruct(image)?;
                let mse = (decoded - image)?.sqr()?.mean_all()?;
                Ok((mse / data_variance)?)
            }
            OutputHead::MixtureLikelihood(mixture) => {
                let decoded = self.reconstruct(image)?;
                let log_likelihood = OutputHead::log_likelihood(mixture, &decoded, image)?;
                Ok(log_likelihood.mean_all()?.neg()?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeadConfig;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_config() -> HopVaeConfig {
        HopVaeConfig {
            image_size: 8,
            num_channels: 1,
            num_hiddens: 8,
            num_residual_layers: 1,
            num_residual_hiddens: 4,
            embedding_dim: 4,
            num_embeddings: 16,
            representation_dim: 2,
            ..HopVaeConfig::mnist()
        }
    }

    fn build(config: &HopVaeConfig) -> (VarMap, HopVae) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = HopVae::new(config, vb).unwrap();
        (varmap, model)
    }

    fn images(batch: usize) -> Tensor {
        Tensor::rand(-0.5f32, 0.5, (batch, 1, 8, 8), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_grid_mismatch_fails_construction() {
        let mut config = tiny_config();
        config.representation_dim = 3;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(
            HopVae::new(&config, vb),
            Err(HopVaeError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_input_shape() {
        let (_varmap, model) = build(&tiny_config());
        let wrong = Tensor::zeros((2, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.reconstruct(&wrong),
            Err(HopVaeError::ShapeMismatch { .. })
        ));

        let flat = Tensor::zeros((2, 64), DType::F32, &Device::Cpu).unwrap();
        assert!(model.reconstruct(&flat).is_err());
    }

    #[test]
    fn test_pipeline_shapes() {
        let (_varmap, model) = build(&tiny_config());
        let x = images(3);

        let embedded = model.embed(&x).unwrap();
        assert_eq!(embedded.dims(), &[3, 4, 2, 2]);
        let quantized = model.quantize(&embedded).unwrap();
        assert_eq!(quantized.dims(), &[3, 4, 2, 2]);
        assert_eq!(model.decode(&quantized).unwrap().dims(), &[3, 1, 8, 8]);
    }

    #[test]
    fn test_forward_modes() {
        let mut rng = StdRng::seed_from_u64(0);
        let (_varmap, direct) = build(&tiny_config());
        let x = images(2);
        for mode in [ForwardMode::Train, ForwardMode::Eval] {
            let out = direct.forward(&x, mode, &mut rng).unwrap();
            assert!(matches!(out, HeadOutput::Reconstruction(_)));
            assert_eq!(out.tensor().dims(), &[2, 1, 8, 8]);
        }

        let (_varmap, mixture) = build(&tiny_config().with_head(HeadConfig::mixture(3)));
        let train = mixture.forward(&x, ForwardMode::Train, &mut rng).unwrap();
        assert!(matches!(train, HeadOutput::LogLikelihood(_)));
        assert_eq!(train.tensor().dims(), &[2, 64]);

        let eval = mixture.forward(&x, ForwardMode::Eval, &mut rng).unwrap();
        assert!(matches!(eval, HeadOutput::Samples(_)));
        assert_eq!(eval.tensor().dims(), &[2, 1, 8, 8]);
    }

    #[test]
    fn test_loss_reaches_memory_bank() {
        let (varmap, model) = build(&tiny_config());
        let loss = model.loss(&images(2), 0.06).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap() >= 0.0);

        let grads = loss.backward().unwrap();
        let vars = varmap.data().lock().unwrap();
        let bank = vars.get("hopfield.stored_patterns").unwrap();
        assert!(grads.get(bank.as_tensor()).is_some());
    }

    #[test]
    fn test_mixture_loss_is_finite() {
        let (_varmap, model) = build(&tiny_config().with_head(HeadConfig::mixture(2)));
        let loss = model.loss(&images(2), 1.0).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());
    }

    #[test]
    fn test_loss_rejects_bad_variance() {
        let (_varmap, model) = build(&tiny_config());
        assert!(model.loss(&images(1), 0.0).is_err());
    }

    #[test]
    fn test_mixture_loss_ignores_variance() {
        let (_varmap, model) = build(&tiny_config().with_head(HeadConfig::mixture(2)));
        let loss = model.loss(&images(1), 0.0).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());
    }

    #[test]
    fn test_sample_is_seeded() {
        let (_varmap, model) = build(&tiny_config());
        let a = model.sample(2, &mut StdRng::seed_from_u64(5)).unwrap();
        let b = model.sample(2, &mut StdRng::seed_from_u64(5)).unwrap();
        assert_eq!(a.dims(), &[2, 1, 8, 8]);
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
        assert!(model.sample(0, &mut StdRng::seed_from_u64(5)).is_err());
    }

    #[test]
    fn test_interpolate_self_is_reconstruction() {
        let (_varmap, model) = build(&tiny_config());
        let x = images(2);

        let blended = model.interpolate(&x, &x).unwrap();
        assert!(blended.is_blended());
        let blended = blended.into_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let recon = model.reconstruct(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in blended.iter().zip(&recon) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_interpolate_shape_mismatch_returns_first() {
        let (_varmap, model) = build(&tiny_config());
        let a = images(2);
        let b = images(1);

        let result = model.interpolate(&a, &b).unwrap();
        assert!(!result.is_blended());
        assert_eq!(
            result.into_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_to_image_for_mixture() {
        let (_varmap, model) = build(&tiny_config().with_head(HeadConfig::mixture(2)));
        let decoded = model.reconstruct(&images(1)).unwrap();
        assert_eq!(decoded.dims(), &[1, 6, 8, 8]);
        assert_eq!(model.to_image(&decoded).unwrap().dims(), &[1, 1, 8, 8]);
    }
}
