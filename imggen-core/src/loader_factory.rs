use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{
    flux, select_best_device, stable_diffusion, Architecture, FluxLoader, LoadRequest, Loader,
    MemoryPlan, ModelInfo, ModelLike, ModelSource, StableDiffusionLoader,
};

/// Load a pipeline, picking the loader from the model's architecture
pub async fn load_model(
    request: &LoadRequest,
    api: &Api,
    merge_dir: &Path,
) -> Result<Arc<dyn ModelLike>> {
    let architecture = request.model.architecture();
    info!(
        model_id = %request.model.id,
        repo = %request.model.repo,
        %architecture,
        "Loading model"
    );

    match architecture {
        Architecture::StableDiffusionV1_5 | Architecture::StableDiffusionXl => {
            let model = StableDiffusionLoader::load(request, api, merge_dir).await?;
            Ok(Arc::new(model))
        }
        Architecture::Flux => {
            let model = FluxLoader::load(request, api, merge_dir).await?;
            Ok(Arc::new(model))
        }
    }
}

/// Download every file a model needs without building it.
pub async fn prefetch_model(
    model: &ModelInfo,
    api: &Api,
    device_map: crate::DeviceMap,
    low_memory: bool,
) -> Result<Vec<PathBuf>> {
    info!(model_id = %model.id, repo = %model.repo, "Downloading model files");
    let paths = match model.architecture() {
        architecture @ (Architecture::StableDiffusionV1_5 | Architecture::StableDiffusionXl) => {
            let device = select_best_device(device_map)?;
            let plan = MemoryPlan::new(&device, low_memory);
            stable_diffusion::fetch_files(architecture.try_into()?, &model.repo, api, &plan)
                .await?
                .paths()
        }
        Architecture::Flux => flux::fetch_files(&model.repo, api).await?.paths(),
    };
    info!(model_id = %model.id, files = paths.len(), "Model files ready");
    Ok(paths)
}

/// Loads pipelines from the Hugging Face hub.
#[derive(Clone)]
pub struct HubSource {
    api: Api,
    merge_dir: PathBuf,
}

impl HubSource {
    /// `merge_dir` receives base weights with LoRA deltas baked in.
    pub fn new(api: Api, merge_dir: impl Into<PathBuf>) -> Self {
        Self {
            api,
            merge_dir: merge_dir.into(),
        }
    }
}

impl ModelSource for HubSource {
    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn ModelLike>> {
        load_model(&request, &self.api, &self.merge_dir).await
    }
}
