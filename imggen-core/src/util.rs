use std::io::Cursor;

use anyhow::{Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::info;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                info!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                info!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Half precision only pays off on CUDA; Metal and CPU stay in f32.
pub fn default_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    }
}

/// Standard normal noise drawn from a seeded host RNG, then moved to `device`.
///
/// The CPU backend cannot be seeded through `Device::set_seed`, so noise is
/// produced on the host to keep seeds reproducible on every backend.
pub fn seeded_noise(
    seed: u64,
    shape: (usize, usize, usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let len = shape.0 * shape.1 * shape.2 * shape.3;
    let values: Vec<f32> = (0..len).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
    Ok(Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(device)?)
}

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Resizes `img` and converts it to a (1, 3, height, width) tensor in [-1, 1].
pub fn image_to_tensor(
    img: &DynamicImage,
    width: usize,
    height: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let img = img
        .resize_exact(width as u32, height as u32, FilterType::CatmullRom)
        .to_rgb8()
        .into_raw();
    let img = Tensor::from_vec(img, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?
        .to_device(device)?
        .to_dtype(dtype)?;
    Ok(img)
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode png")?;
    Ok(bytes)
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("failed to decode image")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let a = seeded_noise(7, (1, 2, 3, 4), &Device::Cpu).unwrap();
        let b = seeded_noise(7, (1, 2, 3, 4), &Device::Cpu).unwrap();
        let c = seeded_noise(8, (1, 2, 3, 4), &Device::Cpu).unwrap();
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let c = c.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a.len(), 24);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_image_tensor_round_trip_shape() {
        let img = DynamicImage::new_rgb8(20, 10);
        let t = image_to_tensor(&img, 16, 8, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(t.dims(), &[1, 3, 8, 16]);
        // Black pixels map to -1.
        let min = t.flatten_all().unwrap().min(0).unwrap().to_scalar::<f32>().unwrap();
        assert!((min + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tensor_to_image_rejects_non_rgb() {
        let t = Tensor::zeros((1, 4, 4), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&t).is_err());
        let t = Tensor::zeros((3, 4, 5), DType::U8, &Device::Cpu).unwrap();
        let img = tensor_to_image(&t).unwrap();
        assert_eq!((img.width(), img.height()), (5, 4));
    }

    #[test]
    fn test_png_round_trip() {
        let img = DynamicImage::new_rgb8(3, 2);
        let bytes = encode_png(&img).unwrap();
        let decoded = decode_image(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
        assert!(decode_image(b"not an image").is_err());
    }
}
