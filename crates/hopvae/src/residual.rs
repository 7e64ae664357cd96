//! Residual refinement blocks shared by the encoder and decoder

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d_no_bias, Conv2d, Conv2dConfig, VarBuilder};

/// `x + conv1x1(relu(conv3x3(relu(x))))`
///
/// The 3×3 convolution narrows to `residual_channels`, the 1×1 convolution
/// widens back to `channels`, so the output shape always equals the input
/// shape.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    conv_1: Conv2d,
    conv_2: Conv2d,
}

impl ResidualBlock {
    /// Create a block operating on `channels`-wide feature maps
    pub fn new(channels: usize, residual_channels: usize, vb: VarBuilder) -> Result<Self> {
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_1 = conv2d_no_bias(channels, residual_channels, 3, same, vb.pp("conv_1"))?;
        let conv_2 = conv2d_no_bias(
            residual_channels,
            channels,
            1,
            Conv2dConfig::default(),
            vb.pp("conv_2"),
        )?;
        Ok(Self { conv_1, conv_2 })
    }
}

impl Module for ResidualBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.conv_1.forward(&xs.relu()?)?;
        let h = self.conv_2.forward(&h.relu()?)?;
        xs + h
    }
}

/// A sequence of [`ResidualBlock`]s followed by a single ReLU
#[derive(Debug, Clone)]
pub struct ResidualStack {
    layers: Vec<ResidualBlock>,
}

impl ResidualStack {
    /// Create a stack of `num_layers` blocks; zero layers reduces to a ReLU
    pub fn new(
        channels: usize,
        num_layers: usize,
        residual_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.pp("layers");
        let layers = (0..num_layers)
            .map(|i| ResidualBlock::new(channels, residual_channels, vb.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Number of blocks in the stack
    pub fn depth(&self) -> usize {
        self.layers.len()
    }
}

impl Module for ResidualStack {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        xs.relu()
    }
}
