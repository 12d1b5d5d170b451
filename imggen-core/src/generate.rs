//! Request handling around a pipeline: defaults, prompt rewriting, LoRA
//! selection and the out-of-memory retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use image::DynamicImage;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::lora::LoraStore;
use crate::prompt::{apply_lora_trigger, enrich_img2img_prompt, enrich_prompt};
use crate::system::format_duration;
use crate::{
    Architecture, DeviceMap, GenerationParams, InitImage, LoraWeights, ModelCache, ModelLike,
    ModelSource, Registry,
};

pub const MIN_DIMENSION: usize = 64;
pub const MAX_DIMENSION: usize = 2048;
pub const MAX_STEPS: usize = 200;

const RETRY_MAX_WIDTH: usize = 512;
const RETRY_MAX_HEIGHT: usize = 384;
const RETRY_MAX_STEPS: usize = 30;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0} is not supported")]
    Unsupported(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

/// True when `err` carries a [`GenerationError::OutOfMemory`].
pub fn is_out_of_memory(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<GenerationError>(),
            Some(GenerationError::OutOfMemory(_))
        )
    })
}

/// Turns a device allocation failure into [`GenerationError::OutOfMemory`].
///
/// CUDA and Metal report these as driver errors whose text is the only
/// marker; everything else passes through untouched.
pub fn classify_device_error(err: anyhow::Error) -> anyhow::Error {
    if is_out_of_memory(&err) {
        return err;
    }
    let message = format!("{err:#}");
    let lower = message.to_lowercase();
    if lower.contains("out of memory") || lower.contains("out_of_memory") {
        return GenerationError::OutOfMemory(message).into();
    }
    err
}

/// A generation request as it arrives from a caller; unset fields take
/// the defaults of the model that ends up serving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub width: Option<usize>,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub steps: Option<usize>,
    #[serde(default)]
    pub guidance: Option<f64>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub lora: Option<String>,
    /// Append quality keywords to short prompts.
    #[serde(default = "default_enrich")]
    pub enrich: bool,
}

fn default_enrich() -> bool {
    true
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: None,
            height: None,
            steps: None,
            guidance: None,
            seed: None,
            model: None,
            lora: None,
            enrich: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingDefaults {
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    /// Width and height are rounded down to a multiple of this.
    pub dimension_multiple: usize,
}

impl SamplingDefaults {
    pub fn for_architecture(architecture: Architecture, low_memory: bool, img2img: bool) -> Self {
        match architecture {
            Architecture::Flux => Self {
                width: 1360,
                height: 768,
                steps: 4,
                guidance: 0.0,
                dimension_multiple: 16,
            },
            Architecture::StableDiffusionV1_5 | Architecture::StableDiffusionXl => Self {
                width: if img2img { 768 } else { 512 },
                height: 512,
                steps: if low_memory { 30 } else { 50 },
                guidance: 7.5,
                dimension_multiple: 8,
            },
        }
    }
}

/// Clamps to the supported range and rounds down to a multiple of `multiple`.
pub fn normalize_dimension(value: usize, multiple: usize) -> usize {
    value.clamp(MIN_DIMENSION, MAX_DIMENSION) / multiple * multiple
}

/// Fills unset request fields from `defaults` and checks the result.
pub fn resolve_params(
    request: &GenerationRequest,
    defaults: &SamplingDefaults,
    prompt: String,
) -> Result<GenerationParams, GenerationError> {
    let steps = request.steps.unwrap_or(defaults.steps);
    if steps == 0 || steps > MAX_STEPS {
        return Err(GenerationError::InvalidRequest(format!(
            "steps must be between 1 and {MAX_STEPS}, got {steps}"
        )));
    }
    let guidance = request.guidance.unwrap_or(defaults.guidance);
    if !guidance.is_finite() || guidance < 0.0 {
        return Err(GenerationError::InvalidRequest(format!(
            "guidance must be a non-negative number, got {guidance}"
        )));
    }
    let seed = request
        .seed
        .unwrap_or_else(|| rand::thread_rng().gen_range(0..i32::MAX as u64));

    Ok(GenerationParams {
        prompt,
        negative_prompt: request.negative_prompt.clone().unwrap_or_default(),
        width: normalize_dimension(
            request.width.unwrap_or(defaults.width),
            defaults.dimension_multiple,
        ),
        height: normalize_dimension(
            request.height.unwrap_or(defaults.height),
            defaults.dimension_multiple,
        ),
        steps,
        guidance,
        seed,
    })
}

impl GenerationParams {
    /// Smaller settings used for the single retry after running out of memory.
    ///
    /// The caps are multiples of 16, so an aligned size stays aligned.
    pub fn reduced_for_retry(&self) -> Self {
        Self {
            width: self.width.min(RETRY_MAX_WIDTH),
            height: self.height.min(RETRY_MAX_HEIGHT),
            steps: self.steps.min(RETRY_MAX_STEPS),
            ..self.clone()
        }
    }
}

async fn run_blocking(
    model: Arc<dyn ModelLike>,
    params: GenerationParams,
    init: Option<InitImage>,
) -> Result<DynamicImage> {
    tokio::task::spawn_blocking(move || model.run(&params, init.as_ref()))
        .await
        .context("generation task failed")?
        .map_err(classify_device_error)
}

/// Runs `model`, retrying once with reduced settings when it runs out of memory.
///
/// Returns the image, the parameters that produced it and whether a retry happened.
pub async fn run_with_retry(
    model: Arc<dyn ModelLike>,
    params: GenerationParams,
    init: Option<InitImage>,
) -> Result<(DynamicImage, GenerationParams, bool)> {
    match run_blocking(model.clone(), params.clone(), init.clone()).await {
        Ok(image) => Ok((image, params, false)),
        Err(err) if is_out_of_memory(&err) => {
            let reduced = params.reduced_for_retry();
            warn!(
                error = %format!("{err:#}"),
                width = reduced.width,
                height = reduced.height,
                steps = reduced.steps,
                "Out of memory, retrying with reduced settings"
            );
            let image = run_blocking(model, reduced.clone(), init)
                .await
                .context("generation failed again with reduced settings")?;
            Ok((image, reduced, true))
        }
        Err(err) => Err(err),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeneratorSettings {
    pub device_map: DeviceMap,
    pub low_memory: bool,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image: DynamicImage,
    pub model_id: String,
    pub lora: Option<String>,
    /// Parameters the image was actually produced with.
    pub params: GenerationParams,
    pub retried: bool,
    pub elapsed: Duration,
}

pub struct Generator<S> {
    registry: Arc<Registry>,
    cache: ModelCache<S>,
    loras: LoraStore,
    settings: GeneratorSettings,
}

impl<S: ModelSource> Generator<S> {
    pub fn new(
        registry: Arc<Registry>,
        source: S,
        loras: LoraStore,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            registry,
            cache: ModelCache::new(source),
            loras,
            settings,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cache(&self) -> &ModelCache<S> {
        &self.cache
    }

    pub fn settings(&self) -> GeneratorSettings {
        self.settings
    }

    /// Loads a model ahead of the first request.
    pub async fn preload(&self, model_id: Option<&str>) -> Result<String> {
        let loaded = self
            .cache
            .get_or_load(
                &self.registry,
                model_id,
                self.settings.device_map,
                self.settings.low_memory,
                None,
            )
            .await?;
        Ok(loaded.model_id)
    }

    /// Suggestions for `model_id`, or for the model served last.
    pub async fn prompt_suggestions(&self, model_id: Option<&str>) -> Result<Vec<String>> {
        let model_id = match model_id {
            Some(id) => id.to_string(),
            None => match self.cache.current_model_id().await {
                Some(id) => id,
                None => self.registry.default_model_id()?.to_string(),
            },
        };
        Ok(self.registry.prompt_suggestions(&model_id))
    }

    pub async fn text_to_image(&self, request: GenerationRequest) -> Result<GeneratedImage> {
        self.generate(request, None).await
    }

    pub async fn image_to_image(
        &self,
        image: DynamicImage,
        strength: f64,
        request: GenerationRequest,
    ) -> Result<GeneratedImage> {
        if !(0.0..=1.0).contains(&strength) {
            return Err(GenerationError::InvalidRequest(format!(
                "strength must be between 0 and 1, got {strength}"
            ))
            .into());
        }
        self.generate(request, Some(InitImage { image, strength })).await
    }

    /// Looks up and fetches a LoRA; any problem is logged and yields `None`.
    async fn resolve_lora(&self, lora_id: &str, architecture: Architecture) -> Option<LoraWeights> {
        let Some(info) = self.registry.lora(lora_id) else {
            warn!(lora_id, "Unknown LoRA, continuing without it");
            return None;
        };
        if !architecture.supports_lora() || info.base != architecture {
            warn!(
                lora_id,
                lora_base = %info.base,
                model_architecture = %architecture,
                "LoRA is not compatible with the model, continuing without it"
            );
            return None;
        }
        match self.loras.fetch(info).await {
            Ok(path) => Some(LoraWeights {
                id: info.id.clone(),
                path,
                weight: info.weight,
                base: info.base,
            }),
            Err(err) => {
                warn!(lora_id, error = %err, "LoRA unavailable, continuing without it");
                None
            }
        }
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        init: Option<InitImage>,
    ) -> Result<GeneratedImage> {
        let start = Instant::now();
        if request.prompt.trim().is_empty() {
            let err = GenerationError::InvalidRequest("prompt must not be empty".to_string());
            return Err(err.into());
        }

        let model = self.registry.resolve_model(request.model.as_deref())?;
        let lora = match request.lora.as_deref() {
            Some(lora_id) => self.resolve_lora(lora_id, model.architecture()).await,
            None => None,
        };
        let loaded = self
            .cache
            .get_or_load(
                &self.registry,
                Some(&model.id),
                self.settings.device_map,
                self.settings.low_memory,
                lora,
            )
            .await?;

        if init.is_some() && !loaded.model.supports_img2img() {
            return Err(GenerationError::Unsupported(format!(
                "image-to-image with model `{}`",
                loaded.model_id
            ))
            .into());
        }

        let mut prompt = match (request.enrich, init.is_some()) {
            (false, _) => request.prompt.clone(),
            (true, false) => enrich_prompt(&request.prompt),
            (true, true) => enrich_img2img_prompt(&request.prompt),
        };
        if let Some(info) = loaded.lora.as_deref().and_then(|id| self.registry.lora(id)) {
            prompt = apply_lora_trigger(&prompt, &info.prompt_trigger);
        }

        let defaults = SamplingDefaults::for_architecture(
            loaded.architecture,
            self.settings.low_memory,
            init.is_some(),
        );
        let params = resolve_params(&request, &defaults, prompt)?;
        info!(
            model_id = %loaded.model_id,
            lora = ?loaded.lora,
            width = params.width,
            height = params.height,
            steps = params.steps,
            guidance = params.guidance,
            seed = params.seed,
            img2img = init.is_some(),
            "Generating image"
        );

        let (image, params, retried) = run_with_retry(loaded.model.clone(), params, init).await?;
        let elapsed = start.elapsed();
        info!(
            model_id = %loaded.model_id,
            elapsed = %format_duration(elapsed),
            retried,
            "Image generated"
        );

        Ok(GeneratedImage {
            image,
            model_id: loaded.model_id,
            lora: loaded.lora,
            params,
            retried,
            elapsed,
        })
    }
}
