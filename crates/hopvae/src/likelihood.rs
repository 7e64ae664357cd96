//! Discretized logistic mixture likelihood
//!
//! Per-pixel (non-autoregressive) PixelCNN++ output layer. Each channel
//! intensity is modelled as a mixture of `K` logistic distributions integrated
//! over the quantisation bin that contains it:
//!
//! ```text
//! P(x) = Σ_k π_k [σ((x + Δ/2 − μ_k)/s_k) − σ((x − Δ/2 − μ_k)/s_k)]
//! ```
//!
//! The lowest and highest bins absorb the tails so the probability mass over
//! all `num_bins` levels is exactly one.

use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use rand::Rng;

use crate::error::{HopVaeError, Result};

/// Floor applied to predicted log-scales, `ln(1e-14)`
pub const MIN_LOG_SCALE: f64 = -32.236_191_301_916_64;

/// Below this CDF difference the bin mass is approximated by the density at
/// the bin centre times the bin width.
const CDF_DELTA_FLOOR: f64 = 1e-5;

const LOG_FLOOR: f64 = 1e-12;

/// Uniform draws are kept inside `(ε, 1 − ε)` so both logs stay finite.
const UNIFORM_EPS: f32 = 1e-5;

/// Mixture parameters laid out as `(batch, sequence, num_mixtures)`
#[derive(Debug, Clone)]
pub struct MixtureParams {
    /// Unnormalised mixture weights
    pub logits: Tensor,
    /// Component locations
    pub means: Tensor,
    /// Component log-scales (unclamped)
    pub log_scales: Tensor,
}

impl MixtureParams {
    /// Bundle three equally shaped rank-3 tensors
    pub fn new(logits: Tensor, means: Tensor, log_scales: Tensor) -> Result<Self> {
        let dims = logits.dims().to_vec();
        if dims.len() != 3 {
            return Err(HopVaeError::config(format!(
                "mixture parameters must be (batch, sequence, mixtures), got {:?}",
                dims
            )));
        }
        for other in [&means, &log_scales] {
            if other.dims() != dims.as_slice() {
                return Err(HopVaeError::shape_mismatch(&dims, other.dims()));
            }
        }
        Ok(Self {
            logits,
            means,
            log_scales,
        })
    }

    /// `(batch, sequence, num_mixtures)`
    pub fn dims(&self) -> Result<(usize, usize, usize)> {
        Ok(self.logits.dims3()?)
    }
}

/// Discretized mixture of logistics over `num_bins` evenly spaced levels in
/// `[low, high]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscretizedLogisticMixture {
    num_mixtures: usize,
    num_channels: usize,
    num_bins: usize,
    low: f64,
    high: f64,
}

/// `ln(1 + eˣ)` without overflow
fn softplus(xs: &Tensor) -> candle_core::Result<Tensor> {
    let tail = xs.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    xs.relu()? + tail
}

/// Stable log-sum-exp over the last axis, dropping it
fn log_sum_exp(xs: &Tensor) -> candle_core::Result<Tensor> {
    let max = xs.max_keepdim(D::Minus1)?;
    let sum = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(D::Minus1)?.log()?;
    (sum + max)?.squeeze(D::Minus1)
}

impl DiscretizedLogisticMixture {
    /// Mixture over 8-bit style levels in `[-1, 1]`
    pub fn new(num_mixtures: usize, num_channels: usize, num_bins: usize) -> Result<Self> {
        if num_mixtures == 0 || num_channels == 0 {
            return Err(HopVaeError::config(
                "num_mixtures and num_channels must be positive",
            ));
        }
        if num_bins < 2 {
            return Err(HopVaeError::config(format!(
                "num_bins must be at least 2, got {}",
                num_bins
            )));
        }
        Ok(Self {
            num_mixtures,
            num_channels,
            num_bins,
            low: -1.0,
            high: 1.0,
        })
    }

    /// Use a different intensity range
    pub fn with_range(mut self, low: f64, high: f64) -> Result<Self> {
        if !(low.is_finite() && high.is_finite() && low < high) {
            return Err(HopVaeError::config(format!(
                "invalid intensity range [{}, {}]",
                low, high
            )));
        }
        self.low = low;
        self.high = high;
        Ok(self)
    }

    pub fn num_mixtures(&self) -> usize {
        self.num_mixtures
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    /// `(low, high)` intensity range
    pub fn range(&self) -> (f64, f64) {
        (self.low, self.high)
    }

    /// Distance between adjacent quantisation levels
    pub fn bin_width(&self) -> f64 {
        (self.high - self.low) / (self.num_bins - 1) as f64
    }

    /// Decoder channels needed: `K` shared logits plus `K` means and `K`
    /// log-scales per image channel
    pub fn param_channels(&self) -> usize {
        self.num_mixtures * (1 + 2 * self.num_channels)
    }

    /// Rearrange raw decoder output `(batch, K·(1+2C), H, W)` into three
    /// `(batch, C·H·W, K)` blocks.
    ///
    /// Channel `c·K + k` of the means block (and likewise of the log-scale
    /// block) belongs to image channel `c`, component `k`. Logits are shared
    /// across the channels of a pixel. Sequence order is `(c, y, x)`.
    pub fn split_params(&self, raw: &Tensor) -> Result<MixtureParams> {
        let (batch, channels, height, width) = raw.dims4()?;
        if channels != self.param_channels() {
            return Err(HopVaeError::shape_mismatch(
                &[batch, self.param_channels(), height, width],
                raw.dims(),
            ));
        }

        let k = self.num_mixtures;
        let c = self.num_channels;
        let hw = height * width;

        let logits = raw
            .narrow(1, 0, k)?
            .reshape((batch, k, hw))?
            .transpose(1, 2)?
            .unsqueeze(1)?
            .broadcast_as((batch, c, hw, k))?
            .reshape((batch, c * hw, k))?;

        let per_channel = |start: usize| -> candle_core::Result<Tensor> {
            raw.narrow(1, start, k * c)?
                .reshape((batch * c, k, hw))?
                .transpose(1, 2)?
                .reshape((batch, c * hw, k))
        };
        let means = per_channel(k)?;
        let log_scales = per_channel(k + k * c)?;

        MixtureParams::new(logits, means, log_scales)
    }

    /// Per-position log-likelihood of `x`
    ///
    /// `x` has shape `(batch, sequence, 1)` and holds values on the
    /// quantisation grid. Returns `(batch, sequence)`.
    pub fn log_prob(&self, params: &MixtureParams, x: &Tensor) -> Result<Tensor> {
        let (batch, seq, k) = params.dims()?;
        if x.dims() != [batch, seq, 1] {
            return Err(HopVaeError::shape_mismatch(&[batch, seq, 1], x.dims()));
        }

        let x = x.broadcast_as((batch, seq, k))?;
        let log_scales = params.log_scales.maximum(MIN_LOG_SCALE)?;
        let inv_stdv = log_scales.neg()?.exp()?;
        let centered = (&x - &params.means)?;
        let half = self.bin_width() / 2.0;

        let plus_in = (centered.affine(1.0, half)? * &inv_stdv)?;
        let min_in = (centered.affine(1.0, -half)? * &inv_stdv)?;
        let cdf_delta = (ops::sigmoid(&plus_in)? - ops::sigmoid(&min_in)?)?;

        // log σ(a) = a − softplus(a),  log(1 − σ(b)) = −softplus(b)
        let log_cdf_plus = (&plus_in - softplus(&plus_in)?)?;
        let log_one_minus_cdf_min = softplus(&min_in)?.neg()?;

        let mid_in = (&centered * &inv_stdv)?;
        let log_pdf_mid = ((&mid_in - &log_scales)? - (softplus(&mid_in)? * 2.0)?)?;
        let log_interior = cdf_delta.ge(CDF_DELTA_FLOOR)?.where_cond(
            &cdf_delta.maximum(LOG_FLOOR)?.log()?,
            &(log_pdf_mid + self.bin_width().ln())?,
        )?;

        let upper = x
            .gt(self.high - half)?
            .where_cond(&log_one_minus_cdf_min, &log_interior)?;
        let log_probs = x.lt(self.low + half)?.where_cond(&log_cdf_plus, &upper)?;

        let weighted = (log_probs + ops::log_softmax(&params.logits, D::Minus1)?)?;
        Ok(log_sum_exp(&weighted)?)
    }

    /// Draw one value per position, returning `(batch, sequence)`
    ///
    /// Components are chosen with the Gumbel-max trick and the value is drawn
    /// by inverting the logistic CDF, then clamped to the intensity range.
    pub fn sample<R: Rng + ?Sized>(&self, params: &MixtureParams, rng: &mut R) -> Result<Tensor> {
        let (batch, seq, k) = params.dims()?;
        let device = params.logits.device();
        let dtype = params.logits.dtype();

        let gumbel: Vec<f32> = (0..batch * seq * k)
            .map(|_| {
                let u: f32 = rng.gen_range(UNIFORM_EPS..1.0 - UNIFORM_EPS);
                -(-u.ln()).ln()
            })
            .collect();
        let gumbel = Tensor::from_vec(gumbel, (batch, seq, k), device)?.to_dtype(dtype)?;
        let choice = (&params.logits + gumbel)?.argmax_keepdim(D::Minus1)?;

        let means = params.means.contiguous()?.gather(&choice, D::Minus1)?;
        let log_scales = params
            .log_scales
            .maximum(MIN_LOG_SCALE)?
            .gather(&choice, D::Minus1)?;

        let logistic: Vec<f32> = (0..batch * seq)
            .map(|_| {
                let u: f32 = rng.gen_range(UNIFORM_EPS..1.0 - UNIFORM_EPS);
                u.ln() - (1.0 - u).ln()
            })
            .collect();
        let logistic = Tensor::from_vec(logistic, (batch, seq, 1), device)?.to_dtype(dtype)?;

        let x = (means + (log_scales.exp()? * logistic)?)?;
        Ok(x.clamp(self.low, self.high)?.squeeze(D::Minus1)?)
    }

    /// Expected value `Σ_k π_k μ_k` clamped to the range, `(batch, sequence)`
    pub fn mean(&self, params: &MixtureParams) -> Result<Tensor> {
        let weights = ops::softmax(&params.logits, D::Minus1)?;
        let mean = (weights * &params.means)?.sum(D::Minus1)?;
        Ok(mean.clamp(self.low, self.high)?)
    }

    /// Centres of every quantisation level
    pub fn levels(&self) -> Vec<f32> {
        let width = self.bin_width();
        (0..self.num_bins)
            .map(|i| (self.low + i as f64 * width) as f32)
            .collect()
    }

    /// Probability mass of every level under fixed parameters, `(num_bins,)`
    ///
    /// `logits`, `means` and `log_scales` describe a single position.
    pub fn level_probabilities(
        &self,
        logits: &[f32],
        means: &[f32],
        log_scales: &[f32],
        device: &candle_core::Device,
    ) -> Result<Vec<f32>> {
        let k = logits.len();
        if means.len() != k || log_scales.len() != k {
            return Err(HopVaeError::shape_mismatch(
                &[k],
                &[means.len().min(log_scales.len())],
            ));
        }
        let n = self.num_bins;
        let repeat = |values: &[f32]| -> candle_core::Result<Tensor> {
            Tensor::from_slice(values, (1, 1, k), device)?
                .broadcast_as((1, n, k))?
                .contiguous()
        };
        let params = MixtureParams::new(repeat(logits)?, repeat(means)?, repeat(log_scales)?)?;
        let x = Tensor::from_vec(self.levels(), (1, n, 1), device)?;

        let probs = self.log_prob(&params, &x)?.exp()?.to_dtype(DType::F32)?;
        Ok(probs.squeeze(0)?.to_vec1::<f32>()?)
    }
}
