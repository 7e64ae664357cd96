//! Convolutional decoder, the mirror image of [`crate::encoder::Encoder`]

use candle_core::{Module, Result, Tensor};
use candle_nn::{
    conv2d, conv_transpose2d, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig,
    VarBuilder,
};

use crate::residual::ResidualStack;

/// Embedding grid → image-resolution output
///
/// `out_channels` is the image channel count for direct reconstruction or the
/// mixture parameter count for the likelihood head.
#[derive(Debug, Clone)]
pub struct Decoder {
    conv_1: Conv2d,
    residual_stack: ResidualStack,
    conv_trans_1: ConvTranspose2d,
    conv_trans_2: ConvTranspose2d,
    conv_trans_3: ConvTranspose2d,
}

impl Decoder {
    /// Create a decoder reading `in_channels`-wide embedding grids
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        num_hiddens: usize,
        num_residual_layers: usize,
        num_residual_hiddens: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let up = ConvTranspose2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let same_t = ConvTranspose2dConfig {
            padding: 1,
            ..Default::default()
        };

        let half = num_hiddens / 2;
        let conv_1 = conv2d(in_channels, num_hiddens, 3, same, vb.pp("conv_1"))?;
        let residual_stack = ResidualStack::new(
            num_hiddens,
            num_residual_layers,
            num_residual_hiddens,
            vb.pp("residual_stack"),
        )?;
        let conv_trans_1 = conv_transpose2d(num_hiddens, half, 4, up, vb.pp("conv_trans_1"))?;
        let conv_trans_2 = conv_transpose2d(half, half, 4, up, vb.pp("conv_trans_2"))?;
        let conv_trans_3 =
            conv_transpose2d(half, out_channels, 3, same_t, vb.pp("conv_trans_3"))?;

        Ok(Self {
            conv_1,
            residual_stack,
            conv_trans_1,
            conv_trans_2,
            conv_trans_3,
        })
    }
}

impl Module for Decoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv_1.forward(xs)?;
        let xs = self.residual_stack.forward(&xs)?;
        let xs = self.conv_trans_1.forward(&xs)?.relu()?;
        let xs = self.conv_trans_2.forward(&xs)?.relu()?;
        self.conv_trans_3.forward(&xs)
    }
}
