use candle_core::{Device, Result, Tensor};

/// Interpolation weights (out x in) of 1-d bilinear resampling with
/// half-pixel centers, i.e., `src = (dst + 0.5) * in / out - 0.5`
///
/// * `n_in` - input length
/// * `n_out` - output length
/// * `device` - where the weight matrix lives
pub fn bilinear_weights(n_in: usize, n_out: usize, device: &Device) -> Result<Tensor> {
    let scale = n_in as f64 / n_out as f64;
    let mut w = vec![0f32; n_out * n_in];

    for i in 0..n_out {
        let src = ((i as f64 + 0.5) * scale - 0.5).max(0.0);
        let lo = (src.floor() as usize).min(n_in - 1);
        let hi = (lo + 1).min(n_in - 1);
        let frac = src - lo as f64;
        w[i * n_in + lo] += (1.0 - frac) as f32;
        w[i * n_in + hi] += frac as f32;
    }

    Tensor::from_vec(w, (n_out, n_in), device)
}

/// Bilinear resize of `(batch, channel, height, width)` images.
/// Implemented as two matrix products so that gradients flow back to
/// the input.
///
/// * `x_bchw` - input images
/// * `height` - target height
/// * `width` - target width
pub fn bilinear_resize(x_bchw: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (b, c, h, w) = x_bchw.dims4()?;
    if h == height && w == width {
        return Ok(x_bchw.clone());
    }

    let dev = x_bchw.device();
    let dtype = x_bchw.dtype();
    let rx_wv = bilinear_weights(w, width, dev)?.t()?.contiguous()?.to_dtype(dtype)?;
    let ry_hu = bilinear_weights(h, height, dev)?.t()?.contiguous()?.to_dtype(dtype)?;

    // rows: (b c h, w) -> (b c h, width)
    let x = x_bchw.contiguous()?.reshape((b * c * h, w))?.matmul(&rx_wv)?;

    // cols: (b c, width, h) -> (b c width, height)
    let x = x
        .reshape((b * c, h, width))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b * c * width, h))?
        .matmul(&ry_hu)?;

    x.reshape((b * c, width, height))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b, c, height, width))
}

/// Nearest neighbour resize of a conditioning map to `(height, width)`
pub fn nearest_resize(x_bchw: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (_, _, h, w) = x_bchw.dims4()?;
    if h == height && w == width {
        Ok(x_bchw.clone())
    } else {
        x_bchw.upsample_nearest2d(height, width)
    }
}

/// Instance-wise standardization over the spatial axes
///
/// (x - mean(x)) / sqrt(var(x) + eps) for each sample and channel
pub fn instance_standardize(x_bchw: &Tensor, eps: f64) -> Result<Tensor> {
    let (b, c, h, w) = x_bchw.dims4()?;
    let x = x_bchw.reshape((b, c, h * w))?;
    let mu = x.mean_keepdim(2)?;
    let centred = x.broadcast_sub(&mu)?;
    let var = centred.sqr()?.mean_keepdim(2)?;
    centred
        .broadcast_div(&(var + eps)?.sqrt()?)?
        .reshape((b, c, h, w))
}
