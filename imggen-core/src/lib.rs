#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod animate;
pub mod cache;
pub mod device_map;
pub mod generate;
pub mod loader;
pub mod lora;
pub mod prompt;
pub mod registry;
pub mod system;
pub mod workflow;
mod loader_factory;
mod util;

mod flux;
mod stable_diffusion;

pub use cache::*;
pub use device_map::*;
pub use flux::FluxLoader;
pub use generate::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use registry::*;
use serde::{Deserialize, Serialize};
pub use stable_diffusion::StableDiffusionLoader;
pub(crate) use util::*;
pub use util::{decode_image, encode_png};

/// Fully resolved sampling parameters handed to a pipeline.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub seed: u64,
}

/// Starting image for image-to-image generation.
#[derive(Debug, Clone)]
pub struct InitImage {
    pub image: DynamicImage,
    /// How much of the source to discard, 0 keeps it and 1 ignores it.
    pub strength: f64,
}

pub trait ModelLike: Send + Sync {
    fn run(
        &self,
        params: &GenerationParams,
        init: Option<&InitImage>,
    ) -> anyhow::Result<DynamicImage>;

    fn supports_img2img(&self) -> bool {
        false
    }
}
