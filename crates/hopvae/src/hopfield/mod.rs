//! Associative-memory bottleneck
//!
//! A modern Hopfield layer (Ramsauer et al., 2020) used in place of a VQ-VAE
//! codebook. Each spatial feature vector is a state pattern; it is replaced by
//! a softmax-weighted combination of learned stored patterns. Retrieval is
//! differentiable, so no straight-through estimator is needed.
//!
//! The inverse temperature β is either fixed or learned. A learned β is stored
//! as `ln β`, so it stays positive however far training moves it.

mod layer;

pub use layer::HopfieldLayer;
