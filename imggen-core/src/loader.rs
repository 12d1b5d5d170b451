use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::{DType, Device};
use hf_hub::api::tokio::Api;

use crate::{default_dtype, Architecture, DeviceMap, ModelInfo, ModelLike};

/// A LoRA file ready to be merged into a base model.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraWeights {
    pub id: String,
    pub path: PathBuf,
    pub weight: f64,
    pub base: Architecture,
}

/// Everything a loader needs to build one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub model: ModelInfo,
    pub device_map: DeviceMap,
    pub low_memory: bool,
    pub lora: Option<LoraWeights>,
}

pub trait Loader {
    type Model: ModelLike;

    fn load(
        request: &LoadRequest,
        api: &Api,
        merge_dir: &Path,
    ) -> impl Future<Output = Result<Self::Model>> + Send
    where
        Self: Sized;
}

/// Memory trade-offs applied while building a pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryPlan {
    pub dtype: DType,
    /// Download the fp16 weight variant instead of full precision files.
    pub use_f16_weights: bool,
    pub sliced_attention_size: Option<usize>,
}

impl MemoryPlan {
    pub fn new(device: &Device, low_memory: bool) -> Self {
        let cuda = device.is_cuda();
        let sliced_attention_size = if low_memory {
            Some(1)
        } else if cuda {
            Some(4)
        } else {
            None
        };
        Self {
            dtype: default_dtype(device),
            use_f16_weights: cuda && low_memory,
            sliced_attention_size,
        }
    }
}
