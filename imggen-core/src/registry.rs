//! Catalog of the models and LoRA adapters the service knows how to load.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Network family of a model, which decides the pipeline used to run it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "sd-v1-5")]
    StableDiffusionV1_5,
    #[serde(rename = "sdxl")]
    StableDiffusionXl,
    #[serde(rename = "flux")]
    Flux,
}

serde_plain::derive_display_from_serialize!(Architecture);
serde_plain::derive_fromstr_from_deserialize!(Architecture);

impl Architecture {
    /// Detect the architecture from a model or repository name
    pub fn from_name(model_name: &str) -> Self {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Architecture::Flux
        } else if name_upper.contains("XL") || name_upper.contains("PONY") {
            Architecture::StableDiffusionXl
        } else {
            Architecture::StableDiffusionV1_5
        }
    }

    pub fn supports_lora(&self) -> bool {
        !matches!(self, Architecture::Flux)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Architecture>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub description: String,
}

impl ModelInfo {
    pub fn architecture(&self) -> Architecture {
        self.architecture
            .unwrap_or_else(|| Architecture::from_name(&self.repo))
    }
}

/// A single file hosted on the Hugging Face hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubFile {
    pub repo: String,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraInfo {
    pub id: String,
    pub name: String,
    pub base: Architecture,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prompt_trigger: String,
    #[serde(default = "default_lora_weight")]
    pub weight: f64,
    /// Page to fetch the file from by hand when no hub copy exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub: Option<HubFile>,
}

fn default_lora_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub models: Vec<ModelInfo>,
    #[serde(default)]
    pub loras: Vec<LoraInfo>,
}

const GENERIC_SUGGESTIONS: [&str; 4] = [
    "a photograph of an astronaut riding a horse on mars, high quality",
    "a professional photograph of a mountain landscape, Alps, sunset, detailed",
    "a fantasy castle on a floating island, detailed, vibrant colors",
    "portrait of a smiling woman with blue eyes, professional lighting, high quality",
];

const REALISM_SUGGESTIONS: [&str; 2] = [
    "a hyper realistic portrait of a beautiful woman, 8k, detailed skin texture",
    "realistic landscape, mountains, forest, lake, sunset, 8k photography",
];

const FLUX_SUGGESTIONS: [&str; 2] = [
    "highly detailed digital art, vibrant colors, fantasy theme",
    "futuristic sci-fi cityscape, detailed, neon lights, volumetric lighting",
];

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registry {
    pub fn builtin() -> Self {
        let model = |id: &str,
                     name: &str,
                     repo: &str,
                     architecture: Architecture,
                     default: bool,
                     description: &str| ModelInfo {
            id: id.to_string(),
            name: name.to_string(),
            repo: repo.to_string(),
            architecture: Some(architecture),
            default,
            description: description.to_string(),
        };
        Self {
            models: vec![
                model(
                    "stable-diffusion-v1-5",
                    "Stable Diffusion v1.5",
                    "runwayml/stable-diffusion-v1-5",
                    Architecture::StableDiffusionV1_5,
                    true,
                    "Base model",
                ),
                model(
                    "pony-realism-v21",
                    "Pony Realism v2.1",
                    "LyliaEngine/ponyRealism_v21MainVAE",
                    Architecture::StableDiffusionXl,
                    false,
                    "Fine-tune for realistic images",
                ),
                model(
                    "pony-realism-v22",
                    "Pony Realism v2.2",
                    "TheImposterImposters/PonyRealism-v2.2MainVAE",
                    Architecture::StableDiffusionXl,
                    false,
                    "Improved fine-tune for realistic images",
                ),
                model(
                    "flux-schnell",
                    "FLUX.1 schnell",
                    "black-forest-labs/FLUX.1-schnell",
                    Architecture::Flux,
                    false,
                    "Few-step distilled model, best for digital art",
                ),
            ],
            loras: vec![LoraInfo {
                id: "tatsumaki-opm".to_string(),
                name: "Tatsumaki (One Punch Man)".to_string(),
                base: Architecture::StableDiffusionV1_5,
                description: "Character adaptation for Tatsumaki from One Punch Man".to_string(),
                prompt_trigger: "tatsumaki, one punch man, character, green hair".to_string(),
                weight: 0.8,
                url: Some("https://civitai.com/api/download/models/415015".to_string()),
                hub: None,
            }],
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read registry {}", path.display()))?;
        let registry: Registry = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse registry {}", path.display()))?;
        if registry.models.is_empty() {
            anyhow::bail!("registry {} lists no models", path.display());
        }
        Ok(registry)
    }

    /// Writes the catalog to `model_info.json` inside `models_dir`.
    pub fn save_model_info(&self, models_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(models_dir)
            .with_context(|| format!("failed to create {}", models_dir.display()))?;
        let path = models_dir.join("model_info.json");
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(&path, raw).with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "Saved model catalog");
        Ok(path)
    }

    pub fn model(&self, id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn lora(&self, id: &str) -> Option<&LoraInfo> {
        self.loras.iter().find(|l| l.id == id)
    }

    pub fn default_model_id(&self) -> Result<&str> {
        self.models
            .iter()
            .find(|m| m.default)
            .or_else(|| self.models.first())
            .map(|m| m.id.as_str())
            .ok_or_else(|| anyhow!("the model registry is empty"))
    }

    /// Picks the model to load: the default when `id` is `None` or unknown.
    pub fn resolve_model(&self, id: Option<&str>) -> Result<&ModelInfo> {
        if let Some(id) = id {
            if let Some(model) = self.model(id) {
                return Ok(model);
            }
            warn!(model_id = id, "Model not found, using the default model");
        }
        let default = self.default_model_id()?;
        self.model(default)
            .ok_or_else(|| anyhow!("default model `{default}` missing from registry"))
    }

    pub fn first_model_for(&self, architecture: Architecture) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.architecture() == architecture)
    }

    pub fn prompt_suggestions(&self, model_id: &str) -> Vec<String> {
        let mut suggestions: Vec<String> =
            GENERIC_SUGGESTIONS.iter().map(|s| s.to_string()).collect();
        if model_id.contains("pony-realism") {
            suggestions.extend(REALISM_SUGGESTIONS.iter().map(|s| s.to_string()));
        } else if model_id.contains("flux") {
            suggestions.extend(FLUX_SUGGESTIONS.iter().map(|s| s.to_string()));
        }
        suggestions
    }
}
