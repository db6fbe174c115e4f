use candle_core::{Result, Tensor};

/// Output of an image encoder
///
/// * `mean` - mean of the latent Gaussian (n x k)
/// * `log_var` - log variance of the latent Gaussian (n x k)
/// * `features` - intermediate feature maps, in the order of layers
pub struct EncoderOutput {
    pub mean: Tensor,
    pub log_var: Tensor,
    pub features: Vec<Tensor>,
}

pub trait ImageEncoderT {
    /// Encode images into latent Gaussian parameters
    ///
    /// # Arguments
    /// * `x_nchw` - input images (n x 1 x h x w), any spatial size
    /// * `train` - whether to use batch statistics/update spectral norm
    fn forward_t(&self, x_nchw: &Tensor, train: bool) -> Result<EncoderOutput>;

    fn dim_latent(&self) -> usize;
}

pub trait ImageGeneratorT {
    /// Synthesize images conditioned on a label map and a latent code
    ///
    /// # Arguments
    /// * `label_nchw` - conditioning map (n x 1 x h x w)
    /// * `z_nk` - latent code (n x k)
    /// * `train` - training mode
    fn forward_t(&self, label_nchw: &Tensor, z_nk: &Tensor, train: bool) -> Result<Tensor>;

    fn dim_latent(&self) -> usize;
}

pub trait ImageDiscriminatorT {
    /// Discriminate an image given its conditioning map
    ///
    /// # Returns
    /// One list of features per scale; the last feature of each list
    /// is that scale's patch-wise prediction.
    fn forward_t(&self, x_nchw: &Tensor, train: bool) -> Result<Vec<Vec<Tensor>>>;

    fn num_scales(&self) -> usize;
}
