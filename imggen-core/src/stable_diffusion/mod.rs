use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::lora::{LoraAdapter, LoraTarget};
use crate::{
    image_to_tensor, seeded_noise, select_best_device, tensor_to_image, Architecture,
    GenerationError, GenerationParams, InitImage, LoadRequest, Loader, LoraWeights, MemoryPlan,
    ModelLike,
};

const VAE_SCALE: f64 = 0.18215;
const SDXL_FP16_VAE_REPO: &str = "madebyollin/sdxl-vae-fp16-fix";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVersion {
    V1_5,
    Xl,
}

impl TryFrom<Architecture> for SdVersion {
    type Error = Error;

    fn try_from(architecture: Architecture) -> Result<Self> {
        match architecture {
            Architecture::StableDiffusionV1_5 => Ok(SdVersion::V1_5),
            Architecture::StableDiffusionXl => Ok(SdVersion::Xl),
            other => bail!("{other} is not a stable diffusion architecture"),
        }
    }
}

impl SdVersion {
    fn config(
        &self,
        sliced_attention_size: Option<usize>,
        height: Option<usize>,
        width: Option<usize>,
    ) -> StableDiffusionConfig {
        match self {
            SdVersion::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, height, width),
            SdVersion::Xl => StableDiffusionConfig::sdxl(sliced_attention_size, height, width),
        }
    }

    fn tokenizer_repos(&self) -> &'static [&'static str] {
        match self {
            SdVersion::V1_5 => &["openai/clip-vit-base-patch32"],
            SdVersion::Xl => &[
                "openai/clip-vit-large-patch14",
                "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k",
            ],
        }
    }

    fn text_encoder_dirs(&self) -> &'static [&'static str] {
        match self {
            SdVersion::V1_5 => &["text_encoder"],
            SdVersion::Xl => &["text_encoder", "text_encoder_2"],
        }
    }

    fn text_encoder_targets(&self) -> &'static [LoraTarget] {
        match self {
            SdVersion::V1_5 => &[LoraTarget::TEXT_ENCODER],
            SdVersion::Xl => &[LoraTarget::TEXT_ENCODER_1, LoraTarget::TEXT_ENCODER_2],
        }
    }
}

/// Local paths of every file a stable diffusion pipeline needs.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PipelineFiles {
    tokenizers: Vec<PathBuf>,
    clips: Vec<PathBuf>,
    unet: PathBuf,
    vae: PathBuf,
}

impl PipelineFiles {
    pub(crate) fn paths(&self) -> Vec<PathBuf> {
        let mut paths = self.tokenizers.clone();
        paths.extend(self.clips.iter().cloned());
        paths.push(self.unet.clone());
        paths.push(self.vae.clone());
        paths
    }
}

fn weight_file(dir: &str, stem: &str, f16: bool) -> String {
    if f16 {
        format!("{dir}/{stem}.fp16.safetensors")
    } else {
        format!("{dir}/{stem}.safetensors")
    }
}

/// Fetches the fp16 variant when asked for, falling back to full precision.
async fn get_weights(api: &Api, repo: &str, dir: &str, stem: &str, f16: bool) -> Result<PathBuf> {
    let repo_api = api.model(repo.to_string());
    if f16 {
        match repo_api.get(&weight_file(dir, stem, true)).await {
            Ok(path) => return Ok(path),
            Err(err) => {
                debug!(repo, dir, error = %err, "No fp16 weights, using full precision");
            }
        }
    }
    let file = weight_file(dir, stem, false);
    repo_api
        .get(&file)
        .await
        .with_context(|| format!("failed to get {file} from {repo}"))
}

pub(crate) async fn fetch_files(
    version: SdVersion,
    repo: &str,
    api: &Api,
    plan: &MemoryPlan,
) -> Result<PipelineFiles> {
    let f16 = plan.use_f16_weights;

    let mut tokenizers = Vec::new();
    for tokenizer_repo in version.tokenizer_repos() {
        let path = api
            .model(tokenizer_repo.to_string())
            .get("tokenizer.json")
            .await
            .with_context(|| format!("failed to get tokenizer from {tokenizer_repo}"))?;
        tokenizers.push(path);
    }

    let mut clips = Vec::new();
    for dir in version.text_encoder_dirs() {
        clips.push(get_weights(api, repo, dir, "model", f16).await?);
    }

    let unet = get_weights(api, repo, "unet", "diffusion_pytorch_model", f16).await?;
    let vae = if version == SdVersion::Xl && plan.dtype == DType::F16 {
        // The stock SDXL VAE overflows in f16.
        api.model(SDXL_FP16_VAE_REPO.to_string())
            .get("diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get the fp16 SDXL VAE")?
    } else {
        get_weights(api, repo, "vae", "diffusion_pytorch_model", f16).await?
    };

    Ok(PipelineFiles {
        tokenizers,
        clips,
        unet,
        vae,
    })
}

/// Merges `adapter` into the weights at `base` and writes them to `merged`.
///
/// Returns `base` unchanged when no layer matched. The file is written next
/// to `merged` and renamed into place, so `merged` only ever holds a
/// complete file.
fn merge_component(
    adapter: &LoraAdapter,
    base: &Path,
    merged: &Path,
    target: LoraTarget,
    strength: f64,
) -> Result<(PathBuf, usize)> {
    if merged.exists() {
        debug!(path = %merged.display(), "Reusing merged weights");
        return Ok((merged.to_path_buf(), 0));
    }
    let mut weights = candle_core::safetensors::load(base, &Device::Cpu)
        .with_context(|| format!("failed to load {}", base.display()))?;
    let count = adapter.merge_into(&mut weights, target, strength)?;
    if count == 0 {
        return Ok((base.to_path_buf(), 0));
    }
    let partial = merged.with_extension("tmp");
    candle_core::safetensors::save(&weights, &partial)
        .with_context(|| format!("failed to write {}", partial.display()))?;
    fs::rename(&partial, merged)
        .with_context(|| format!("failed to move {} into place", partial.display()))?;
    info!(path = %merged.display(), layers = count, "Saved merged weights");
    Ok((merged.to_path_buf(), count))
}

fn merge_lora(
    mut files: PipelineFiles,
    version: SdVersion,
    model_id: &str,
    lora: &LoraWeights,
    merge_dir: &Path,
    plan: &MemoryPlan,
) -> Result<PipelineFiles> {
    let adapter = LoraAdapter::load(&lora.path, &lora.id)?;
    let precision = if plan.use_f16_weights { "fp16" } else { "fp32" };
    let out_dir = merge_dir.join(format!("{model_id}-{}-{:.2}-{precision}", lora.id, lora.weight));
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let (unet, mut total) = merge_component(
        &adapter,
        &files.unet,
        &out_dir.join("unet.safetensors"),
        LoraTarget::UNET,
        lora.weight,
    )?;
    files.unet = unet;
    for (i, (clip, target)) in files
        .clips
        .iter_mut()
        .zip(version.text_encoder_targets())
        .enumerate()
    {
        let merged = out_dir.join(format!("text_encoder_{i}.safetensors"));
        let (path, count) = merge_component(&adapter, clip, &merged, *target, lora.weight)?;
        *clip = path;
        total += count;
    }

    if total == 0 && files.unet.starts_with(merge_dir) {
        debug!(lora_id = %lora.id, "Using previously merged LoRA weights");
    } else if total == 0 {
        warn!(lora_id = %lora.id, model_id, "LoRA matched no weights of the model");
    } else {
        info!(lora_id = %lora.id, model_id, layers = total, weight = lora.weight, "LoRA merged");
    }
    Ok(files)
}

struct TextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    pad_id: u32,
    max_len: usize,
}

impl TextEncoder {
    fn embed(&self, text: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_len {
            warn!(tokens = tokens.len(), max = self.max_len, "Prompt too long, truncating");
            tokens.truncate(self.max_len);
        }
        tokens.resize(self.max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

pub struct StableDiffusionModel {
    version: SdVersion,
    device: Device,
    dtype: DType,
    sliced_attention_size: Option<usize>,
    text_encoders: Vec<TextEncoder>,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl StableDiffusionModel {
    fn text_embeddings(
        &self,
        prompt: &str,
        negative_prompt: &str,
        use_guide_scale: bool,
    ) -> Result<Tensor> {
        let mut embeddings = Vec::with_capacity(self.text_encoders.len());
        for encoder in &self.text_encoders {
            let cond = encoder.embed(prompt, &self.device)?;
            let emb = if use_guide_scale {
                let uncond = encoder.embed(negative_prompt, &self.device)?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            };
            embeddings.push(emb.to_dtype(self.dtype)?);
        }
        Ok(Tensor::cat(&embeddings, D::Minus1)?)
    }
}

impl ModelLike for StableDiffusionModel {
    fn run(&self, params: &GenerationParams, init: Option<&InitImage>) -> Result<DynamicImage> {
        let sd_config = self.version.config(
            self.sliced_attention_size,
            Some(params.height),
            Some(params.width),
        );
        let mut scheduler = sd_config.build_scheduler(params.steps)?;
        let use_guide_scale = params.guidance > 1.0;
        let text_embeddings =
            self.text_embeddings(&params.prompt, &params.negative_prompt, use_guide_scale)?;
        let timesteps = scheduler.timesteps().to_vec();

        let (latents, t_start) = match init {
            Some(init) => {
                if !(0.0..=1.0).contains(&init.strength) {
                    return Err(GenerationError::InvalidRequest(format!(
                        "strength must be between 0 and 1, got {}",
                        init.strength
                    ))
                    .into());
                }
                let image = image_to_tensor(
                    &init.image,
                    params.width,
                    params.height,
                    &self.device,
                    self.dtype,
                )?;
                let latents = (self.vae.encode(&image)?.sample()? * VAE_SCALE)?;
                let t_start = params.steps - (params.steps as f64 * init.strength) as usize;
                let latents = match timesteps.get(t_start) {
                    Some(&timestep) => {
                        let noise = seeded_noise(params.seed, latents.dims4()?, &self.device)?
                            .to_dtype(latents.dtype())?;
                        scheduler.add_noise(&latents, noise, timestep)?
                    }
                    None => latents,
                };
                (latents, t_start)
            }
            None => {
                let shape = (1, 4, params.height / 8, params.width / 8);
                let latents = seeded_noise(params.seed, shape, &self.device)?;
                ((latents * scheduler.init_noise_sigma())?, 0)
            }
        };
        let mut latents = latents.to_dtype(self.dtype)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            if index < t_start {
                continue;
            }
            let latent_model_input = if use_guide_scale {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&latent_model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guide_scale {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
                (uncond + ((text - uncond)? * params.guidance)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, steps = timesteps.len(), "Denoising step done");
        }

        let images = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let images = ((images / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let images = (images.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        tensor_to_image(&images.i(0)?)
    }

    fn supports_img2img(&self) -> bool {
        true
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionModel;

    async fn load(request: &LoadRequest, api: &Api, merge_dir: &Path) -> Result<Self::Model> {
        let version = SdVersion::try_from(request.model.architecture())?;
        let device = select_best_device(request.device_map).context("failed to set up device")?;
        let plan = MemoryPlan::new(&device, request.low_memory);
        info!(
            repo = %request.model.repo,
            ?version,
            dtype = ?plan.dtype,
            sliced_attention = ?plan.sliced_attention_size,
            "Loading stable diffusion pipeline"
        );

        let mut files = fetch_files(version, &request.model.repo, api, &plan).await?;
        if let Some(lora) = &request.lora {
            files = merge_lora(files, version, &request.model.id, lora, merge_dir, &plan)?;
        }

        let sd_config = version.config(plan.sliced_attention_size, None, None);
        let clip_configs = std::iter::once(&sd_config.clip).chain(sd_config.clip2.as_ref());
        let mut text_encoders = Vec::new();
        for ((tokenizer_file, clip_file), clip_config) in
            files.tokenizers.iter().zip(&files.clips).zip(clip_configs)
        {
            let tokenizer = Tokenizer::from_file(tokenizer_file)
                .map_err(Error::msg)
                .context("failed to load CLIP tokenizer")?;
            let pad_token = clip_config.pad_with.as_deref().unwrap_or("<|endoftext|>");
            let pad_id = tokenizer
                .get_vocab(true)
                .get(pad_token)
                .copied()
                .with_context(|| format!("tokenizer has no `{pad_token}` token"))?;
            let model = stable_diffusion::build_clip_transformer(
                clip_config,
                clip_file,
                &device,
                DType::F32,
            )
            .context("failed to build CLIP text encoder")?;
            text_encoders.push(TextEncoder {
                tokenizer,
                model,
                pad_id,
                max_len: clip_config.max_position_embeddings,
            });
        }

        let vae = sd_config
            .build_vae(&files.vae, &device, plan.dtype)
            .context("failed to build VAE")?;
        let unet = sd_config
            .build_unet(&files.unet, &device, 4, cfg!(feature = "flash-attn"), plan.dtype)
            .context("failed to build UNet")?;

        info!(
            repo = %request.model.repo,
            lora = ?request.lora.as_ref().map(|l| &l.id),
            "Stable diffusion pipeline ready"
        );
        Ok(StableDiffusionModel {
            version,
            device,
            dtype: plan.dtype,
            sliced_attention_size: plan.sliced_attention_size,
            text_encoders,
            vae,
            unet,
        })
    }
}
