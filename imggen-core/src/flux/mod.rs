use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::clip::text_model::{
    Activation, ClipTextConfig, ClipTextTransformer,
};
use candle_transformers::models::flux::{self, autoencoder::AutoEncoder, model::Flux};
use candle_transformers::models::t5::{self, T5EncoderModel};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::{
    seeded_noise, select_best_device, tensor_to_image, GenerationError, GenerationParams,
    InitImage, LoadRequest, Loader, ModelLike,
};

const T5_SEQUENCE_LENGTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    /// Detect the variant from a repository name, schnell unless it says dev.
    pub fn from_name(repo: &str) -> Self {
        let name_upper = repo.to_uppercase();
        if name_upper.contains("DEV") && !name_upper.contains("SCHNELL") {
            FluxVariant::Dev
        } else {
            FluxVariant::Schnell
        }
    }

    fn transformer_file(&self) -> &'static str {
        match self {
            FluxVariant::Schnell => "flux1-schnell.safetensors",
            FluxVariant::Dev => "flux1-dev.safetensors",
        }
    }
}

/// Local paths of every file a Flux pipeline needs.
pub(crate) struct FluxFiles {
    t5_model: PathBuf,
    t5_config: PathBuf,
    t5_tokenizer: PathBuf,
    clip_model: PathBuf,
    clip_tokenizer: PathBuf,
    autoencoder: PathBuf,
    transformer: PathBuf,
}

impl FluxFiles {
    pub(crate) fn paths(&self) -> Vec<PathBuf> {
        vec![
            self.t5_model.clone(),
            self.t5_config.clone(),
            self.t5_tokenizer.clone(),
            self.clip_model.clone(),
            self.clip_tokenizer.clone(),
            self.autoencoder.clone(),
            self.transformer.clone(),
        ]
    }
}

pub(crate) async fn fetch_files(repo: &str, api: &Api) -> Result<FluxFiles> {
    let variant = FluxVariant::from_name(repo);

    let t5_repo = api.repo(hf_hub::Repo::with_revision(
        "google/t5-v1_1-xxl".to_string(),
        hf_hub::RepoType::Model,
        "refs/pr/2".to_string(),
    ));
    let t5_model = t5_repo
        .get("model.safetensors")
        .await
        .context("failed to get T5 model file")?;
    let t5_config = t5_repo
        .get("config.json")
        .await
        .context("failed to get T5 config")?;
    let t5_tokenizer = api
        .model("lmz/mt5-tokenizers".to_string())
        .get("t5-v1_1-xxl.tokenizer.json")
        .await
        .context("failed to get T5 tokenizer")?;

    let clip_repo = api.model("openai/clip-vit-large-patch14".to_string());
    let clip_model = clip_repo
        .get("model.safetensors")
        .await
        .context("failed to get CLIP model file")?;
    let clip_tokenizer = clip_repo
        .get("tokenizer.json")
        .await
        .context("failed to get CLIP tokenizer")?;

    let bf_repo = api.model(repo.to_string());
    let autoencoder = bf_repo
        .get("ae.safetensors")
        .await
        .context("failed to get autoencoder model file")?;
    let transformer = bf_repo
        .get(variant.transformer_file())
        .await
        .context("failed to get flux model file")?;

    Ok(FluxFiles {
        t5_model,
        t5_config,
        t5_tokenizer,
        clip_model,
        clip_tokenizer,
        autoencoder,
        transformer,
    })
}

pub struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    // The T5 encoder keeps a mutable position bias cache.
    t5_model: Mutex<T5EncoderModel>,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    clip_max_len: usize,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

impl FluxModel {
    fn t5_embedding(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > T5_SEQUENCE_LENGTH {
            warn!(
                tokens = tokens.len(),
                max = T5_SEQUENCE_LENGTH,
                "Prompt too long for T5, truncating"
            );
        }
        tokens.resize(T5_SEQUENCE_LENGTH, 0);
        let input = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        let mut t5 = self
            .t5_model
            .lock()
            .map_err(|_| anyhow!("T5 encoder lock poisoned"))?;
        Ok(t5.forward(&input)?)
    }

    fn clip_embedding(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.clip_max_len {
            warn!(
                tokens = tokens.len(),
                max = self.clip_max_len,
                "Prompt too long for CLIP, truncating"
            );
            tokens.truncate(self.clip_max_len);
        }
        let input = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&input)?)
    }
}

impl ModelLike for FluxModel {
    fn run(&self, params: &GenerationParams, init: Option<&InitImage>) -> Result<DynamicImage> {
        if init.is_some() {
            return Err(GenerationError::Unsupported("image-to-image with Flux".to_string()).into());
        }
        let (width, height) = (params.width, params.height);

        let noise_shape = (1, 16, height.div_ceil(16) * 2, width.div_ceil(16) * 2);
        let noise_img = seeded_noise(params.seed, noise_shape, &self.device)?.to_dtype(self.dtype)?;

        let t5_emb = self.t5_embedding(&params.prompt)?;
        let clip_emb = self.clip_embedding(&params.prompt)?;

        let state = flux::sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let shift = match self.variant {
            FluxVariant::Schnell => None,
            FluxVariant::Dev => Some((state.img.dim(1)?, 0.5, 1.15)),
        };
        let timesteps = flux::sampling::get_schedule(params.steps, shift);
        debug!(steps = params.steps, "Starting flux denoising");

        let latent_img = flux::sampling::denoise(
            &self.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            params.guidance,
        )?;
        let unpacked = flux::sampling::unpack(&latent_img, height, width)?;
        debug!("Generated latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        debug!("Decoded image");

        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
            .to_dtype(DType::U8)?
            .to_device(&Device::Cpu)?;
        tensor_to_image(&img.i(0)?)
    }
}

fn var_builder(
    path: &Path,
    dtype: DType,
    device: &Device,
    what: &str,
) -> Result<VarBuilder<'static>> {
    unsafe {
        VarBuilder::from_mmaped_safetensors(&[path], dtype, device)
            .with_context(|| format!("failed to build {what} var builder"))
    }
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = FluxModel;

    async fn load(request: &LoadRequest, api: &Api, _merge_dir: &Path) -> Result<Self::Model> {
        if let Some(lora) = &request.lora {
            warn!(lora_id = %lora.id, "Flux pipelines do not take LoRA adapters, ignoring");
        }
        let variant = FluxVariant::from_name(&request.model.repo);
        let device = select_best_device(request.device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();
        info!(repo = %request.model.repo, ?variant, ?dtype, "Loading Flux pipeline");

        let files = fetch_files(&request.model.repo, api).await?;

        let t5_config =
            std::fs::read_to_string(&files.t5_config).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&t5_config).context("failed to parse T5 config")?;
        let t5_vb = var_builder(&files.t5_model, dtype, &device, "T5")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer = Tokenizer::from_file(&files.t5_tokenizer)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_vb = var_builder(&files.clip_model, dtype, &device, "CLIP")?;
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer = Tokenizer::from_file(&files.clip_tokenizer)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        let (autoencoder_config, flux_config) = match variant {
            FluxVariant::Schnell => (
                flux::autoencoder::Config::schnell(),
                flux::model::Config::schnell(),
            ),
            FluxVariant::Dev => (flux::autoencoder::Config::dev(), flux::model::Config::dev()),
        };
        let autoencoder = AutoEncoder::new(
            &autoencoder_config,
            var_builder(&files.autoencoder, dtype, &device, "autoencoder")?,
        )
        .context("failed to load autoencoder")?;
        let flux_vb = var_builder(&files.transformer, dtype, &device, "flux")?;
        let flux_model =
            Flux::new(&flux_config, flux_vb).context("failed to load flux model")?;

        info!(repo = %request.model.repo, "Flux pipeline ready");
        Ok(FluxModel {
            variant,
            device,
            dtype,
            t5_model: Mutex::new(t5_model),
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            clip_max_len: clip_config.max_position_embeddings,
            autoencoder,
            flux_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_from_name() {
        assert_eq!(
            FluxVariant::from_name("black-forest-labs/FLUX.1-schnell"),
            FluxVariant::Schnell
        );
        assert_eq!(FluxVariant::from_name("black-forest-labs/FLUX.1-dev"), FluxVariant::Dev);
        assert_eq!(FluxVariant::from_name("someone/flux-finetune"), FluxVariant::Schnell);
        assert_eq!(FluxVariant::Dev.transformer_file(), "flux1-dev.safetensors");
    }
}
