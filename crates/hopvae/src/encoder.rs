//! Convolutional encoder
//!
//! Downsamples by 4 with two stride-2 convolutions, widens the receptive field
//! with two stride-1 convolutions, then refines with a residual stack. Image
//! sizes that are not a multiple of 4 truncate per ordinary convolution
//! arithmetic; [`crate::HopVaeConfig::validate`] rejects configurations whose
//! resulting grid differs from `representation_dim`.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

use crate::residual::ResidualStack;

/// Image → feature grid
#[derive(Debug, Clone)]
pub struct Encoder {
    conv_1: Conv2d,
    conv_2: Conv2d,
    conv_3: Conv2d,
    conv_4: Conv2d,
    residual_stack: ResidualStack,
}

impl Encoder {
    /// Create an encoder producing `num_hiddens` channels
    pub fn new(
        in_channels: usize,
        num_hiddens: usize,
        num_residual_layers: usize,
        num_residual_hiddens: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let down = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let half = num_hiddens / 2;
        let conv_1 = conv2d(in_channels, half, 4, down, vb.pp("conv_1"))?;
        let conv_2 = conv2d(half, num_hiddens, 4, down, vb.pp("conv_2"))?;
        let conv_3 = conv2d(num_hiddens, num_hiddens, 3, same, vb.pp("conv_3"))?;
        let conv_4 = conv2d(num_hiddens, num_hiddens, 3, same, vb.pp("conv_4"))?;
        let residual_stack = ResidualStack::new(
            num_hiddens,
            num_residual_layers,
            num_residual_hiddens,
            vb.pp("residual_stack"),
        )?;

        Ok(Self {
            conv_1,
            conv_2,
            conv_3,
            conv_4,
            residual_stack,
        })
    }
}

impl Module for Encoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv_1.forward(xs)?.relu()?;
        let xs = self.conv_2.forward(&xs)?.relu()?;
        let xs = self.conv_3.forward(&xs)?.relu()?;
        let xs = self.conv_4.forward(&xs)?;
        self.residual_stack.forward(&xs)
    }
}
