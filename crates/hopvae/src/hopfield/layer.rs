//! Tensor implementation of the associative-memory bottleneck

use candle_core::{DType, Module, Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::error::{HopVaeError, Result};

/// Inverse temperature of the retrieval softmax
#[derive(Debug, Clone)]
enum Scaling {
    Fixed(f64),
    /// Trainable `ln β`, shape `(1,)`
    LearnedLog(Tensor),
}

/// Single-step modern Hopfield layer with a learned, static memory bank
///
/// Every query row `ξ` is replaced by `softmax(β · ξ Mᵀ) M`, where `M` holds
/// `num_stored_patterns` rows of width `embedding_dim`. Keys and values are the
/// same bank, so each output row is a convex combination of stored patterns.
/// The bank size never changes after construction.
///
/// # Examples
///
/// ```rust
/// use candle_core::{DType, Device, Module, Tensor};
/// use candle_nn::{VarBuilder, VarMap};
/// use hopvae::hopfield::HopfieldLayer;
///
/// let varmap = VarMap::new();
/// let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
/// let layer = HopfieldLayer::new(16, 32, 0.25, false, vb).unwrap();
///
/// let queries = Tensor::randn(0f32, 1.0, (2, 9, 16), &Device::Cpu).unwrap();
/// let retrieved = layer.forward(&queries).unwrap();
/// assert_eq!(retrieved.dims(), &[2, 9, 16]);
/// ```
#[derive(Debug, Clone)]
pub struct HopfieldLayer {
    stored_patterns: Tensor,
    scaling: Scaling,
}

impl HopfieldLayer {
    /// Create a layer with `quantity` trainable stored patterns
    ///
    /// When `learn_scaling` is set, `scaling` only initialises a trainable β,
    /// stored as the variable `log_scaling`.
    pub fn new(
        embedding_dim: usize,
        quantity: usize,
        scaling: f64,
        learn_scaling: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        if !(scaling.is_finite() && scaling > 0.0) {
            return Err(HopVaeError::config(format!(
                "Hopfield scaling must be positive, got {}",
                scaling
            )));
        }

        let stored_patterns = vb.get_with_hints(
            (quantity, embedding_dim),
            "stored_patterns",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        let scaling = if learn_scaling {
            Scaling::LearnedLog(vb.get_with_hints(1, "log_scaling", Init::Const(scaling.ln()))?)
        } else {
            Scaling::Fixed(scaling)
        };

        Ok(Self {
            stored_patterns,
            scaling,
        })
    }

    /// Build a layer around an existing `(quantity, embedding_dim)` bank
    pub fn from_stored_patterns(stored_patterns: Tensor, scaling: f64) -> Result<Self> {
        let dims = stored_patterns.dims();
        if dims.len() != 2 || dims.iter().any(|&d| d == 0) {
            return Err(HopVaeError::config(format!(
                "stored patterns must be a non-empty matrix, got shape {:?}",
                dims
            )));
        }
        if !(scaling.is_finite() && scaling > 0.0) {
            return Err(HopVaeError::config(format!(
                "Hopfield scaling must be positive, got {}",
                scaling
            )));
        }
        Ok(Self {
            stored_patterns,
            scaling: Scaling::Fixed(scaling),
        })
    }

    /// The `(quantity, embedding_dim)` memory bank
    pub fn stored_patterns(&self) -> &Tensor {
        &self.stored_patterns
    }

    /// Number of stored patterns
    pub fn num_stored_patterns(&self) -> usize {
        self.stored_patterns.dims()[0]
    }

    /// Width of every pattern
    pub fn embedding_dim(&self) -> usize {
        self.stored_patterns.dims()[1]
    }

    /// Current inverse temperature
    pub fn scaling(&self) -> Result<f64> {
        match &self.scaling {
            Scaling::Fixed(beta) => Ok(*beta),
            Scaling::LearnedLog(log_beta) => {
                let value = log_beta.to_dtype(DType::F64)?.to_vec1::<f64>()?;
                Ok(value[0].exp())
            }
        }
    }

    /// Retrieval distribution `softmax(β · Q Mᵀ)` of shape
    /// `(batch, num_patterns, quantity)`
    pub fn retrieval_weights(&self, queries: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, num_patterns, dim) = queries.dims3()?;
        if dim != self.embedding_dim() {
            candle_core::bail!(
                "query width {} does not match stored pattern width {}",
                dim,
                self.embedding_dim()
            );
        }

        let flat = queries.reshape((batch * num_patterns, dim))?;
        let similarities = flat.matmul(&self.stored_patterns.t()?)?;
        let scaled = match &self.scaling {
            Scaling::Fixed(beta) => (similarities * *beta)?,
            Scaling::LearnedLog(log_beta) => similarities.broadcast_mul(&log_beta.exp()?)?,
        };
        let weights = candle_nn::ops::softmax(&scaled, D::Minus1)?;
        weights.reshape((batch, num_patterns, self.num_stored_patterns()))
    }

    /// Retrieve a single query against the bank
    ///
    /// # Errors
    ///
    /// Returns [`HopVaeError::DimensionMismatch`] if `query` has the wrong width.
    pub fn retrieve_pattern(&self, query: &[f32]) -> Result<Vec<f32>> {
        if query.len() != self.embedding_dim() {
            return Err(HopVaeError::DimensionMismatch {
                what: "query width",
                expected: self.embedding_dim(),
                actual: query.len(),
            });
        }

        let query = Tensor::from_slice(query, (1, 1, query.len()), self.stored_patterns.device())?
            .to_dtype(self.stored_patterns.dtype())?;
        let retrieved = self.forward(&query)?;
        Ok(retrieved.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

impl Module for HopfieldLayer {
    fn forward(&self, queries: &Tensor) -> candle_core::Result<Tensor> {
        let weights = self.retrieval_weights(queries)?;
        weights.broadcast_matmul(&self.stored_patterns)
    }
}
