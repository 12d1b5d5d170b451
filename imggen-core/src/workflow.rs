//! Multi-image workflows built from the single-image operations.

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{GeneratedImage, GenerationRequest, Generator, ModelSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// One image from each of the first two models.
    Simple,
    /// The prompt rendered in several artistic styles.
    StyleTransfer,
    /// A base image, edited variations of it and an optional LoRA take.
    AdvancedEditing,
}

serde_plain::derive_display_from_serialize!(WorkflowKind);
serde_plain::derive_fromstr_from_deserialize!(WorkflowKind);

const STYLES: [&str; 5] = ["oil painting", "anime", "digital art", "watercolor", "pencil sketch"];
const VARIATIONS: [&str; 4] = [
    "add more details, increase contrast",
    "dramatic lighting",
    "bright colors, cinematic shot",
    "dark mood, dramatic shadows",
];
const STYLE_FLUX_MODEL: &str = "flux-schnell";
const STYLE_REALISM_MODEL: &str = "pony-realism-v21";
const EDITING_BASE_MODEL: &str = "pony-realism-v22";
const CHARACTER_LORA: &str = "tatsumaki-opm";

fn request(prompt: String, model: Option<&str>, steps: usize) -> GenerationRequest {
    GenerationRequest {
        model: model.map(str::to_string),
        steps: Some(steps),
        guidance: Some(7.5),
        ..GenerationRequest::new(prompt)
    }
}

/// Runs a workflow; images that fail are logged and left out.
pub async fn run_workflow<S: ModelSource>(
    generator: &Generator<S>,
    kind: WorkflowKind,
    prompt: &str,
) -> Vec<GeneratedImage> {
    info!(workflow = %kind, prompt, "Starting workflow");
    let images = match kind {
        WorkflowKind::Simple => simple(generator, prompt).await,
        WorkflowKind::StyleTransfer => style_transfer(generator, prompt).await,
        WorkflowKind::AdvancedEditing => advanced_editing(generator, prompt).await,
    };
    info!(workflow = %kind, images = images.len(), "Workflow finished");
    images
}

async fn simple<S: ModelSource>(generator: &Generator<S>, prompt: &str) -> Vec<GeneratedImage> {
    let mut images = Vec::new();
    let model_ids: Vec<String> = generator
        .registry()
        .models
        .iter()
        .take(2)
        .map(|m| m.id.clone())
        .collect();
    for model_id in model_ids {
        match generator
            .text_to_image(request(prompt.to_string(), Some(&model_id), 40))
            .await
        {
            Ok(image) => images.push(image),
            Err(err) => {
                error!(model_id = %model_id, error = %format!("{err:#}"), "Workflow image failed")
            }
        }
    }
    images
}

async fn style_transfer<S: ModelSource>(
    generator: &Generator<S>,
    prompt: &str,
) -> Vec<GeneratedImage> {
    let mut images = Vec::new();
    for style in STYLES {
        let model_id = if style == "anime" || style == "digital art" {
            STYLE_FLUX_MODEL
        } else {
            STYLE_REALISM_MODEL
        };
        let styled = format!("{prompt}, {style} style, high quality");
        match generator.text_to_image(request(styled, Some(model_id), 35)).await {
            Ok(image) => images.push(image),
            Err(err) => error!(style, error = %format!("{err:#}"), "Style transfer failed"),
        }
    }
    images
}

async fn advanced_editing<S: ModelSource>(
    generator: &Generator<S>,
    prompt: &str,
) -> Vec<GeneratedImage> {
    let mut images = Vec::new();
    let base = match generator
        .text_to_image(request(prompt.to_string(), Some(EDITING_BASE_MODEL), 30))
        .await
    {
        Ok(base) => base,
        Err(err) => {
            error!(error = %format!("{err:#}"), "Base image failed, stopping workflow");
            return images;
        }
    };
    let source = base.image.clone();
    images.push(base);

    for variation in VARIATIONS {
        let edit = request(format!("{prompt}, {variation}"), None, 25);
        match generator.image_to_image(source.clone(), 0.5, edit).await {
            Ok(image) => images.push(image),
            Err(err) => error!(variation, error = %format!("{err:#}"), "Variation failed"),
        }
    }

    let lower = prompt.to_lowercase();
    if lower.contains("character") || lower.contains("portrait") {
        let registry = generator.registry();
        let model = registry
            .lora(CHARACTER_LORA)
            .and_then(|lora| registry.first_model_for(lora.base))
            .map(|m| m.id.clone());
        if let Some(model_id) = model {
            let mut with_lora = request(prompt.to_string(), Some(&model_id), 30);
            with_lora.lora = Some(CHARACTER_LORA.to_string());
            match generator.text_to_image(with_lora).await {
                Ok(image) => images.push(image),
                Err(err) => error!(
                    lora_id = CHARACTER_LORA,
                    error = %format!("{err:#}"),
                    "LoRA image failed"
                ),
            }
        }
    }
    images
}
