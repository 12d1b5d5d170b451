//! LoRA (Low-Rank Adaptation) loading and merging.
//!
//! A LoRA stores, for some layers of a base model, a pair of small matrices
//! whose product is a weight delta: `W' = W + strength * (alpha / rank) * (up @ down)`.
//! Deltas are merged into the base weights before the pipeline is built, so
//! generation runs at the same speed with or without an adapter.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::tokio::Api;
use safetensors::SafeTensors;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::LoraInfo;

/// One low-rank weight pair for a single layer
#[derive(Debug)]
pub struct LoraPair {
    /// Down projection (A), shape `[rank, in_features, ..]`
    pub down: Tensor,
    /// Up projection (B), shape `[out_features, rank, ..]`
    pub up: Tensor,
    pub alpha: f32,
    pub rank: usize,
}

#[derive(Debug)]
pub struct LoraAdapter {
    pub name: String,
    /// Pairs keyed by the layer name as written in the adapter file.
    pub pairs: HashMap<String, LoraPair>,
    /// Training base model recorded in the file metadata, if any.
    pub base_model: Option<String>,
}

/// Naming scheme used to find base weights for adapter layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoraTarget {
    /// kohya style, e.g. `lora_unet_` + `down_blocks_0_attentions_0_proj_in`
    pub kohya_prefix: &'static str,
    /// PEFT/diffusers style, e.g. `unet.` + `down_blocks.0.attentions.0.proj_in`
    pub peft_prefix: &'static str,
}

impl LoraTarget {
    pub const UNET: LoraTarget = LoraTarget {
        kohya_prefix: "lora_unet_",
        peft_prefix: "unet.",
    };
    pub const TEXT_ENCODER: LoraTarget = LoraTarget {
        kohya_prefix: "lora_te_",
        peft_prefix: "text_encoder.",
    };
    pub const TEXT_ENCODER_1: LoraTarget = LoraTarget {
        kohya_prefix: "lora_te1_",
        peft_prefix: "text_encoder.",
    };
    pub const TEXT_ENCODER_2: LoraTarget = LoraTarget {
        kohya_prefix: "lora_te2_",
        peft_prefix: "text_encoder_2.",
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Half {
    Down,
    Up,
}

fn split_lora_key(key: &str) -> Option<(&str, Half)> {
    const SUFFIXES: [(&str, Half); 4] = [
        (".lora_down.weight", Half::Down),
        (".lora_A.weight", Half::Down),
        (".lora_up.weight", Half::Up),
        (".lora_B.weight", Half::Up),
    ];
    SUFFIXES
        .iter()
        .find_map(|(suffix, half)| key.strip_suffix(suffix).map(|base| (base, *half)))
}

impl LoraAdapter {
    pub fn load(path: &Path, name: &str) -> Result<Self> {
        info!(path = %path.display(), "Loading LoRA adapter");
        let data = fs::read(path)
            .with_context(|| format!("failed to read LoRA file {}", path.display()))?;

        let base_model = SafeTensors::read_metadata(&data)
            .ok()
            .and_then(|(_, metadata)| {
                metadata
                    .metadata()
                    .as_ref()
                    .and_then(|m| m.get("ss_base_model_version").cloned())
            });

        let tensors = candle_core::safetensors::load_buffer(&data, &Device::Cpu)
            .with_context(|| format!("failed to parse safetensors {}", path.display()))?;
        let mut adapter = Self::from_tensors(name, tensors)?;
        adapter.base_model = base_model;

        info!(
            path = %path.display(),
            weight_pairs = adapter.pairs.len(),
            base_model = ?adapter.base_model,
            "LoRA adapter loaded"
        );
        Ok(adapter)
    }

    pub fn from_tensors(name: &str, tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut downs = HashMap::new();
        let mut ups = HashMap::new();
        let mut alphas = HashMap::new();

        for (key, tensor) in tensors {
            if let Some(base) = key.strip_suffix(".alpha") {
                let alpha = tensor
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?
                    .first()
                    .copied()
                    .with_context(|| format!("empty alpha tensor {key}"))?;
                alphas.insert(base.to_string(), alpha);
            } else if let Some((base, half)) = split_lora_key(&key) {
                match half {
                    Half::Down => downs.insert(base.to_string(), tensor),
                    Half::Up => ups.insert(base.to_string(), tensor),
                };
            }
        }

        let mut pairs = HashMap::new();
        for (layer, down) in downs {
            let Some(up) = ups.remove(&layer) else {
                warn!(layer = %layer, "LoRA down tensor without matching up tensor");
                continue;
            };
            let rank = down.dim(0)?;
            let alpha = alphas.get(&layer).copied().unwrap_or(rank as f32);
            debug!(layer = %layer, rank, alpha, "Loaded LoRA weight pair");
            pairs.insert(layer, LoraPair { down, up, alpha, rank });
        }
        for layer in ups.keys() {
            warn!(layer = %layer, "LoRA up tensor without matching down tensor");
        }

        Ok(Self {
            name: name.to_string(),
            pairs,
            base_model: None,
        })
    }

    /// Adds the scaled deltas of every matching pair to `weights`.
    ///
    /// Returns how many base weights were modified.
    pub fn merge_into(
        &self,
        weights: &mut HashMap<String, Tensor>,
        target: LoraTarget,
        strength: f64,
    ) -> Result<usize> {
        let mut lookup = HashMap::new();
        for key in weights.keys() {
            let Some(stem) = key.strip_suffix(".weight") else {
                continue;
            };
            let kohya = format!("{}{}", target.kohya_prefix, stem.replace('.', "_"));
            lookup.insert(kohya, key.clone());
            lookup.insert(format!("{}{}", target.peft_prefix, stem), key.clone());
        }

        let mut merged = 0;
        for (layer, pair) in &self.pairs {
            let Some(key) = lookup.get(layer) else {
                continue;
            };
            let Some(base) = weights.get(key) else {
                continue;
            };
            let down = pair.down.to_dtype(DType::F32)?.flatten_from(1)?;
            let up = pair.up.to_dtype(DType::F32)?.flatten_from(1)?;
            if up.dim(0)? * down.dim(1)? != base.elem_count() {
                warn!(
                    layer = %layer,
                    base_shape = ?base.dims(),
                    "LoRA delta does not match the base weight shape, skipping"
                );
                continue;
            }
            let delta = up.matmul(&down)?.reshape(base.shape().clone())?;
            let scale = strength * pair.alpha as f64 / pair.rank as f64;
            let updated = (base.to_dtype(DType::F32)? + (delta * scale)?)?.to_dtype(base.dtype())?;
            weights.insert(key.clone(), updated);
            merged += 1;
        }
        debug!(adapter = %self.name, merged, prefix = target.kohya_prefix, "Merged LoRA deltas");
        Ok(merged)
    }
}

#[derive(Debug, Error)]
pub enum LoraError {
    #[error("LoRA `{id}` must be downloaded by hand from {url} and saved as {}", path.display())]
    ManualDownload { id: String, url: String, path: PathBuf },
    #[error("LoRA `{0}` has no local file and no download source")]
    NoSource(String),
    #[error("LoRA `{0}` lives on the hub but the hub client is unavailable")]
    Offline(String),
    #[error("failed to download LoRA `{id}`: {source}")]
    Download {
        id: String,
        #[source]
        source: hf_hub::api::tokio::ApiError,
    },
    #[error("failed to store LoRA `{id}`: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Directory of LoRA files, filled from the hub on demand.
pub struct LoraStore {
    dir: PathBuf,
    api: Option<Api>,
}

impl LoraStore {
    pub fn new(dir: impl Into<PathBuf>, api: Option<Api>) -> Self {
        Self {
            dir: dir.into(),
            api,
        }
    }

    pub fn local_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.safetensors"))
    }

    /// Copies a downloaded file into the store under `id`.
    async fn store(&self, id: &str, downloaded: &Path) -> Result<PathBuf, LoraError> {
        let path = self.local_path(id);
        let io_err = |source| LoraError::Io {
            id: id.to_string(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        tokio::fs::copy(downloaded, &path).await.map_err(io_err)?;
        Ok(path)
    }

    pub async fn fetch(&self, info: &LoraInfo) -> Result<PathBuf, LoraError> {
        let path = self.local_path(&info.id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(lora_id = %info.id, path = %path.display(), "LoRA already downloaded");
            return Ok(path);
        }

        if let Some(hub) = &info.hub {
            let api = self
                .api
                .as_ref()
                .ok_or_else(|| LoraError::Offline(info.id.clone()))?;
            info!(lora_id = %info.id, repo = %hub.repo, file = %hub.file, "Downloading LoRA");
            let cached = api
                .model(hub.repo.clone())
                .get(&hub.file)
                .await
                .map_err(|source| LoraError::Download {
                    id: info.id.clone(),
                    source,
                })?;
            let path = self.store(&info.id, &cached).await?;
            info!(lora_id = %info.id, path = %path.display(), "LoRA downloaded");
            return Ok(path);
        }

        match &info.url {
            Some(url) => {
                warn!(
                    lora_id = %info.id,
                    url = %url,
                    destination = %path.display(),
                    "LoRA needs a manual download, continuing without it"
                );
                Err(LoraError::ManualDownload {
                    id: info.id.clone(),
                    url: url.clone(),
                    path,
                })
            }
            None => Err(LoraError::NoSource(info.id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::{Architecture, HubFile};

    fn t(values: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(values.to_vec(), shape, &Device::Cpu).unwrap()
    }

    fn values(tensor: &Tensor) -> Vec<f32> {
        tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_split_lora_key() {
        assert_eq!(
            split_lora_key("lora_unet_mid_block_attentions_0_proj_in.lora_down.weight"),
            Some(("lora_unet_mid_block_attentions_0_proj_in", Half::Down))
        );
        assert_eq!(split_lora_key("unet.a.b.lora_B.weight"), Some(("unet.a.b", Half::Up)));
        assert_eq!(split_lora_key("unet.a.b.weight"), None);
    }

    #[test]
    fn test_kohya_merge_with_alpha() {
        let mut tensors = HashMap::new();
        tensors.insert(
            "lora_unet_down_blocks_0_proj.lora_down.weight".to_string(),
            t(&[1., 2., 3.], &[1, 3]),
        );
        tensors.insert(
            "lora_unet_down_blocks_0_proj.lora_up.weight".to_string(),
            t(&[1., 2.], &[2, 1]),
        );
        tensors.insert("lora_unet_down_blocks_0_proj.alpha".to_string(), t(&[2.], &[1]));
        let adapter = LoraAdapter::from_tensors("test", tensors).unwrap();
        assert_eq!(adapter.pairs.len(), 1);

        let mut weights = HashMap::new();
        weights.insert("down_blocks.0.proj.weight".to_string(), t(&[0.; 6], &[2, 3]));
        weights.insert("down_blocks.0.proj.bias".to_string(), t(&[5., 5.], &[2]));

        // alpha / rank = 2, strength 0.5, so the delta is applied as-is.
        let merged = adapter.merge_into(&mut weights, LoraTarget::UNET, 0.5).unwrap();
        assert_eq!(merged, 1);
        assert_eq!(values(&weights["down_blocks.0.proj.weight"]), vec![1., 2., 3., 2., 4., 6.]);
        assert_eq!(values(&weights["down_blocks.0.proj.bias"]), vec![5., 5.]);
    }

    #[test]
    fn test_peft_merge_conv_weight_defaults_alpha_to_rank() {
        let mut tensors = HashMap::new();
        tensors.insert(
            "unet.conv_in.lora_A.weight".to_string(),
            t(&[1., 0., 1.], &[1, 3, 1, 1]),
        );
        tensors.insert("unet.conv_in.lora_B.weight".to_string(), t(&[2., 3.], &[2, 1, 1, 1]));
        let adapter = LoraAdapter::from_tensors("conv", tensors).unwrap();
        assert_eq!(adapter.pairs["unet.conv_in"].alpha, 1.0);

        let mut weights = HashMap::new();
        weights.insert("conv_in.weight".to_string(), t(&[1.; 6], &[2, 3, 1, 1]));
        let merged = adapter.merge_into(&mut weights, LoraTarget::UNET, 1.0).unwrap();
        assert_eq!(merged, 1);
        let w = &weights["conv_in.weight"];
        assert_eq!(w.dims(), &[2, 3, 1, 1]);
        assert_eq!(values(w), vec![3., 1., 3., 4., 1., 4.]);
    }

    #[test]
    fn test_unmatched_and_mismatched_pairs_are_skipped() {
        let mut tensors = HashMap::new();
        tensors.insert("lora_te_layer.lora_down.weight".to_string(), t(&[1., 1.], &[1, 2]));
        tensors.insert("lora_te_layer.lora_up.weight".to_string(), t(&[1.], &[1, 1]));
        tensors.insert("lora_te_orphan.lora_up.weight".to_string(), t(&[1.], &[1, 1]));
        let adapter = LoraAdapter::from_tensors("te", tensors).unwrap();
        assert_eq!(adapter.pairs.len(), 1);

        let mut weights = HashMap::new();
        weights.insert("layer.weight".to_string(), t(&[0.; 4], &[2, 2]));
        // The UNet prefix never matches a text encoder adapter.
        assert_eq!(adapter.merge_into(&mut weights, LoraTarget::UNET, 1.0).unwrap(), 0);
        // Shapes disagree (1x2 delta against a 2x2 weight).
        assert_eq!(
            adapter.merge_into(&mut weights, LoraTarget::TEXT_ENCODER, 1.0).unwrap(),
            0
        );
        assert_eq!(values(&weights["layer.weight"]), vec![0.; 4]);
    }

    fn lora_info(id: &str) -> LoraInfo {
        LoraInfo {
            id: id.to_string(),
            name: id.to_string(),
            base: Architecture::StableDiffusionV1_5,
            description: String::new(),
            prompt_trigger: String::new(),
            weight: 1.0,
            url: None,
            hub: None,
        }
    }

    #[tokio::test]
    async fn test_store_fetch() {
        let dir = tempdir().unwrap();
        let store = LoraStore::new(dir.path(), None);

        fs::write(store.local_path("present"), b"x").unwrap();
        assert_eq!(
            store.fetch(&lora_info("present")).await.unwrap(),
            dir.path().join("present.safetensors")
        );

        let mut manual = lora_info("manual");
        manual.url = Some("https://example.invalid/lora".to_string());
        assert!(matches!(
            store.fetch(&manual).await,
            Err(LoraError::ManualDownload { .. })
        ));

        let mut hub = lora_info("hub");
        hub.hub = Some(HubFile {
            repo: "someone/lora".to_string(),
            file: "lora.safetensors".to_string(),
        });
        assert!(matches!(store.fetch(&hub).await, Err(LoraError::Offline(_))));
        assert!(matches!(
            store.fetch(&lora_info("nothing")).await,
            Err(LoraError::NoSource(_))
        ));
    }

    #[tokio::test]
    async fn test_store_copies_into_missing_dir() {
        let dir = tempdir().unwrap();
        let downloaded = dir.path().join("blob");
        fs::write(&downloaded, b"weights").unwrap();
        let store = LoraStore::new(dir.path().join("loras"), None);

        let path = store.store("hub", &downloaded).await.unwrap();
        assert_eq!(path, store.local_path("hub"));
        assert_eq!(fs::read(&path).unwrap(), b"weights");
        assert_eq!(store.fetch(&lora_info("hub")).await.unwrap(), path);

        let err = store.store("gone", &dir.path().join("missing")).await.unwrap_err();
        assert!(matches!(err, LoraError::Io { .. }));
    }
}
