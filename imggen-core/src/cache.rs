//! Loaded pipelines keyed by model, device and adapter.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{Architecture, DeviceMap, LoadRequest, LoraWeights, ModelLike, Registry};

/// Builds pipelines on a cache miss.
pub trait ModelSource: Send + Sync {
    fn load(&self, request: LoadRequest) -> impl Future<Output = Result<Arc<dyn ModelLike>>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub model_id: String,
    pub device_map: DeviceMap,
    pub low_memory: bool,
    /// LoRA id and weight in thousandths.
    pub lora: Option<(String, i64)>,
}

impl CacheKey {
    pub fn new(
        model_id: &str,
        device_map: DeviceMap,
        low_memory: bool,
        lora: Option<&LoraWeights>,
    ) -> Self {
        Self {
            model_id: model_id.to_string(),
            device_map,
            low_memory,
            lora: lora.map(|l| (l.id.clone(), (l.weight * 1000.0).round() as i64)),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.model_id, self.device_map, self.low_memory)?;
        if let Some((id, weight)) = &self.lora {
            write!(f, "_{id}@{:.3}", *weight as f64 / 1000.0)?;
        }
        Ok(())
    }
}

/// A pipeline handed out by the cache.
#[derive(Clone)]
pub struct LoadedModel {
    pub model_id: String,
    pub architecture: Architecture,
    /// Id of the LoRA merged into the pipeline, if any.
    pub lora: Option<String>,
    pub model: Arc<dyn ModelLike>,
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model_id", &self.model_id)
            .field("architecture", &self.architecture)
            .field("lora", &self.lora)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, Arc<dyn ModelLike>>,
    current_model_id: Option<String>,
}

pub struct ModelCache<S> {
    source: S,
    /// Map and current id. Never held across a load.
    state: Mutex<CacheState>,
    /// Serialises loads so a key is built at most once.
    load_lock: Mutex<()>,
}

impl<S: ModelSource> ModelCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: Mutex::new(CacheState::default()),
            load_lock: Mutex::new(()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    async fn lookup(&self, key: &CacheKey, model_id: &str) -> Option<Arc<dyn ModelLike>> {
        let mut state = self.state.lock().await;
        let pipeline = state.entries.get(key).cloned()?;
        state.current_model_id = Some(model_id.to_string());
        Some(pipeline)
    }

    /// Returns a cached pipeline or loads one.
    ///
    /// A model that fails to load is replaced by the registry default; only a
    /// failure of the default itself is returned. Loads run one at a time,
    /// while hits and the read accessors stay available during a load.
    pub async fn get_or_load(
        &self,
        registry: &Registry,
        model_id: Option<&str>,
        device_map: DeviceMap,
        low_memory: bool,
        lora: Option<LoraWeights>,
    ) -> Result<LoadedModel> {
        let default_id = registry.default_model_id()?.to_string();
        let mut model = registry.resolve_model(model_id)?.clone();
        let mut lora = lora;

        loop {
            let key = CacheKey::new(&model.id, device_map, low_memory, lora.as_ref());
            let loaded = |pipeline: Arc<dyn ModelLike>| LoadedModel {
                model_id: model.id.clone(),
                architecture: model.architecture(),
                lora: lora.as_ref().map(|l| l.id.clone()),
                model: pipeline,
            };

            if let Some(pipeline) = self.lookup(&key, &model.id).await {
                info!(%key, "Using cached pipeline");
                return Ok(loaded(pipeline));
            }

            let _loading = self.load_lock.lock().await;
            // Another request may have built this key while we waited.
            if let Some(pipeline) = self.lookup(&key, &model.id).await {
                info!(%key, "Using pipeline loaded by a concurrent request");
                return Ok(loaded(pipeline));
            }

            let request = LoadRequest {
                model: model.clone(),
                device_map,
                low_memory,
                lora: lora.clone(),
            };
            match self.source.load(request).await {
                Ok(pipeline) => {
                    let mut state = self.state.lock().await;
                    info!(%key, cached = state.entries.len() + 1, "Pipeline loaded");
                    state.entries.insert(key, pipeline.clone());
                    state.current_model_id = Some(model.id.clone());
                    return Ok(loaded(pipeline));
                }
                Err(err) if model.id != default_id => {
                    warn!(
                        model_id = %model.id,
                        error = %format!("{err:#}"),
                        fallback = %default_id,
                        "Failed to load model, falling back to the default model"
                    );
                    model = registry.model(&default_id).cloned().ok_or_else(|| {
                        anyhow!("default model `{default_id}` missing from registry")
                    })?;
                    if let Some(l) = lora.as_ref().filter(|l| l.base != model.architecture()) {
                        warn!(lora_id = %l.id, "LoRA does not fit the fallback model, dropping it");
                        lora = None;
                    }
                }
                Err(err) => {
                    return Err(err.context(format!("failed to load default model `{}`", model.id)));
                }
            }
        }
    }

    /// Id of the model served most recently.
    pub async fn current_model_id(&self) -> Option<String> {
        self.state.lock().await.current_model_id.clone()
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().await.entries.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every pipeline and returns how many were released.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let released = state.entries.len();
        state.entries.clear();
        state.current_model_id = None;
        info!(released, "Pipeline cache cleared");
        released
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use anyhow::bail;
    use image::DynamicImage;

    use super::*;
    use crate::{GenerationParams, InitImage};

    pub(crate) struct Blank;

    impl ModelLike for Blank {
        fn run(
            &self,
            params: &GenerationParams,
            _init: Option<&InitImage>,
        ) -> Result<DynamicImage> {
            Ok(DynamicImage::new_rgb8(params.width as u32, params.height as u32))
        }
    }

    /// Source that records requests and fails for the listed model ids.
    #[derive(Default)]
    pub(crate) struct MockSource {
        pub loads: AtomicUsize,
        pub failing: Vec<String>,
        pub requests: StdMutex<Vec<LoadRequest>>,
        /// Time each load takes.
        pub delay: Option<Duration>,
    }

    impl ModelSource for MockSource {
        async fn load(&self, request: LoadRequest) -> Result<Arc<dyn ModelLike>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let failing = self.failing.contains(&request.model.id);
            let id = request.model.id.clone();
            self.requests.lock().unwrap().push(request);
            if failing {
                bail!("cannot load {id}");
            }
            Ok(Arc::new(Blank))
        }
    }

    fn lora(base: Architecture) -> LoraWeights {
        LoraWeights {
            id: "tatsumaki-opm".to_string(),
            path: PathBuf::from("tatsumaki-opm.safetensors"),
            weight: 0.8,
            base,
        }
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let cache = ModelCache::new(MockSource::default());
        let registry = Registry::builtin();

        let first = cache
            .get_or_load(&registry, Some("pony-realism-v21"), DeviceMap::ForceCpu, false, None)
            .await
            .unwrap();
        assert_eq!(first.model_id, "pony-realism-v21");
        assert_eq!(first.architecture, Architecture::StableDiffusionXl);
        let second = cache
            .get_or_load(&registry, Some("pony-realism-v21"), DeviceMap::ForceCpu, false, None)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first.model, &second.model));
        assert_eq!(cache.source().loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.current_model_id().await.as_deref(), Some("pony-realism-v21"));

        // Low memory is a different pipeline.
        cache
            .get_or_load(&registry, Some("pony-realism-v21"), DeviceMap::ForceCpu, true, None)
            .await
            .unwrap();
        assert_eq!(cache.len().await, 2);
        assert!(cache
            .contains(&CacheKey::new("pony-realism-v21", DeviceMap::ForceCpu, true, None))
            .await);
    }

    #[tokio::test]
    async fn test_lora_is_part_of_key() {
        let cache = ModelCache::new(MockSource::default());
        let registry = Registry::builtin();
        let plain = cache
            .get_or_load(&registry, None, DeviceMap::ForceCpu, false, None)
            .await
            .unwrap();
        let adapted = cache
            .get_or_load(
                &registry,
                None,
                DeviceMap::ForceCpu,
                false,
                Some(lora(Architecture::StableDiffusionV1_5)),
            )
            .await
            .unwrap();
        assert!(plain.lora.is_none());
        assert_eq!(adapted.lora.as_deref(), Some("tatsumaki-opm"));
        assert_eq!(cache.len().await, 2);
        let requests = cache.source().requests.lock().unwrap();
        assert!(requests[1].lora.is_some());
    }

    #[tokio::test]
    async fn test_failed_model_falls_back_to_default() {
        let source = MockSource {
            failing: vec!["flux-schnell".to_string()],
            ..Default::default()
        };
        let cache = ModelCache::new(source);
        let registry = Registry::builtin();

        let loaded = cache
            .get_or_load(&registry, Some("flux-schnell"), DeviceMap::ForceCpu, false, None)
            .await
            .unwrap();
        assert_eq!(loaded.model_id, "stable-diffusion-v1-5");
        assert_eq!(cache.source().loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.current_model_id().await.as_deref(), Some("stable-diffusion-v1-5"));
    }

    #[tokio::test]
    async fn test_fallback_drops_incompatible_lora() {
        let source = MockSource {
            failing: vec!["pony-realism-v22".to_string()],
            ..Default::default()
        };
        let cache = ModelCache::new(source);
        let registry = Registry::builtin();

        let loaded = cache
            .get_or_load(
                &registry,
                Some("pony-realism-v22"),
                DeviceMap::ForceCpu,
                false,
                Some(lora(Architecture::StableDiffusionXl)),
            )
            .await
            .unwrap();
        assert_eq!(loaded.model_id, "stable-diffusion-v1-5");
        assert!(loaded.lora.is_none());
    }

    #[tokio::test]
    async fn test_default_failure_is_an_error() {
        let source = MockSource {
            failing: vec!["stable-diffusion-v1-5".to_string()],
            ..Default::default()
        };
        let cache = ModelCache::new(source);
        let registry = Registry::builtin();
        let err = cache
            .get_or_load(&registry, Some("unknown"), DeviceMap::ForceCpu, false, None)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("stable-diffusion-v1-5"));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = ModelCache::new(MockSource::default());
        let registry = Registry::builtin();
        cache
            .get_or_load(&registry, None, DeviceMap::ForceCpu, false, None)
            .await
            .unwrap();
        assert_eq!(cache.clear().await, 1);
        assert!(cache.is_empty().await);
        assert!(cache.current_model_id().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_requests_load_once() {
        let cache = Arc::new(ModelCache::new(MockSource {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        }));
        let registry = Arc::new(Registry::builtin());

        let spawn_load = || {
            let cache = cache.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load(&registry, Some("flux-schnell"), DeviceMap::ForceCpu, false, None)
                    .await
            })
        };
        let (first, second) = tokio::join!(spawn_load(), spawn_load());
        let (first, second) = (first.unwrap().unwrap(), second.unwrap().unwrap());

        assert!(Arc::ptr_eq(&first.model, &second.model));
        assert_eq!(cache.source().loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cache_stays_readable_during_load() {
        let cache = Arc::new(ModelCache::new(MockSource {
            delay: Some(Duration::from_secs(2)),
            ..Default::default()
        }));
        let registry = Arc::new(Registry::builtin());

        cache
            .get_or_load(&registry, None, DeviceMap::ForceCpu, false, None)
            .await
            .unwrap();

        let slow = {
            let cache = cache.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load(&registry, Some("flux-schnell"), DeviceMap::ForceCpu, false, None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let wait = Duration::from_millis(500);
        let hit = tokio::time::timeout(
            wait,
            cache.get_or_load(&registry, None, DeviceMap::ForceCpu, false, None),
        )
        .await
        .expect("cache hit blocked by a running load")
        .unwrap();
        assert_eq!(hit.model_id, "stable-diffusion-v1-5");
        assert_eq!(tokio::time::timeout(wait, cache.len()).await.unwrap(), 1);
        assert!(tokio::time::timeout(wait, cache.current_model_id()).await.is_ok());

        let loaded = slow.await.unwrap().unwrap();
        assert_eq!(loaded.model_id, "flux-schnell");
        assert_eq!(cache.len().await, 2);
    }

    #[test]
    fn test_key_display() {
        let key = CacheKey::new(
            "stable-diffusion-v1-5",
            DeviceMap::Ordinal(0),
            true,
            Some(&lora(Architecture::StableDiffusionV1_5)),
        );
        assert_eq!(key.to_string(), "stable-diffusion-v1-5_gpu:0_true_tatsumaki-opm@0.800");
    }
}
