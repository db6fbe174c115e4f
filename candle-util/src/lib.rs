pub mod candle_aux_layers;
pub mod candle_conv_encoder;
pub mod candle_data_loader_util;
pub mod candle_image_data_loader;
pub mod candle_image_ops;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod candle_normalization;
pub mod candle_patch_discriminator;
pub mod candle_spade_generator;

pub use candle_core;
pub use candle_nn;
