use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use base64::{prelude::BASE64_STANDARD, Engine};
use imggen_core::animate::{animate, AnimationOptions, Effect};
use imggen_core::system::{format_duration, SystemInfo};
use imggen_core::workflow::{run_workflow, WorkflowKind};
use imggen_core::{
    decode_image, encode_png, GeneratedImage, GenerationError, GenerationRequest, Generator,
    LoraInfo, ModelInfo, ModelSource,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

pub const DEFAULT_EDIT_STRENGTH: f64 = 0.8;

pub struct AppState<S> {
    pub generator: Generator<S>,
}

pub type SharedState<S> = Arc<AppState<S>>;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        ApiError {
            error: ApiErrorDetail {
                message: message.into(),
                error_type: error_type.into(),
            },
        }
    }
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(message, "invalid_request_error")),
    )
}

/// Unwraps a JSON body, reporting malformed or mistyped bodies as 400.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, (StatusCode, Json<ApiError>)> {
    body.map(|Json(value)| value).map_err(|rejection| bad_request(rejection.body_text()))
}

/// Maps domain errors onto HTTP statuses; anything unexpected is a 500.
fn api_error(err: anyhow::Error) -> (StatusCode, Json<ApiError>) {
    match err.downcast_ref::<GenerationError>() {
        Some(GenerationError::InvalidRequest(_) | GenerationError::Unsupported(_)) => {
            bad_request(err.to_string())
        }
        _ => {
            error!(error = %format!("{err:#}"), "Request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(format!("{err:#}"), "server_error")),
            )
        }
    }
}

fn decode_base64_image(data: &str) -> Result<image::DynamicImage, (StatusCode, Json<ApiError>)> {
    // Accept data URLs as well as bare base64.
    let data = data.split_once("base64,").map_or(data, |(_, rest)| rest);
    let bytes = BASE64_STANDARD
        .decode(data.trim())
        .map_err(|e| bad_request(format!("image is not valid base64: {e}")))?;
    decode_image(&bytes).map_err(|e| bad_request(format!("{e:#}")))
}

#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub image: String,
    pub model: String,
    pub lora: Option<String>,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub seed: u64,
    pub retried: bool,
    pub elapsed: String,
}

impl ImageResponse {
    fn from_generated(generated: GeneratedImage) -> anyhow::Result<Self> {
        let png = encode_png(&generated.image)?;
        let params = generated.params;
        Ok(Self {
            image: BASE64_STANDARD.encode(png),
            model: generated.model_id,
            lora: generated.lora,
            prompt: params.prompt,
            negative_prompt: params.negative_prompt,
            width: params.width,
            height: params.height,
            steps: params.steps,
            guidance: params.guidance,
            seed: params.seed,
            retried: generated.retried,
            elapsed: format_duration(generated.elapsed),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    /// Base64 encoded source image.
    pub image: String,
    pub strength: Option<f64>,
    #[serde(flatten)]
    pub request: GenerationRequest,
}

#[derive(Debug, Deserialize)]
pub struct VideoRequest {
    pub image: String,
    pub frames: Option<usize>,
    pub fps: Option<u32>,
    pub motion_scale: Option<f64>,
    pub effect: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VideoResponse {
    pub video: String,
    pub format: &'static str,
    pub frames: usize,
    pub fps: u32,
    pub effect: Effect,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowRequest {
    pub prompt: String,
    #[serde(default = "default_workflow")]
    pub workflow: WorkflowKind,
}

fn default_workflow() -> WorkflowKind {
    WorkflowKind::Simple
}

#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub workflow: WorkflowKind,
    pub images: Vec<ImageResponse>,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub data: Vec<ModelInfo>,
    pub default: String,
    pub current: Option<String>,
}

pub async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn list_models<S: ModelSource>(
    State(state): State<SharedState<S>>,
) -> ApiResult<ModelList> {
    let registry = state.generator.registry();
    let default = registry.default_model_id().map_err(api_error)?.to_string();
    let data = registry
        .models
        .iter()
        .cloned()
        .map(|mut m| {
            m.architecture = Some(m.architecture());
            m
        })
        .collect();
    Ok(Json(ModelList {
        data,
        default,
        current: state.generator.cache().current_model_id().await,
    }))
}

pub async fn list_loras<S: ModelSource>(State(state): State<SharedState<S>>) -> Json<Value> {
    let loras: &[LoraInfo] = &state.generator.registry().loras;
    Json(json!({ "data": loras }))
}

pub async fn prompt_suggestions<S: ModelSource>(
    State(state): State<SharedState<S>>,
    Path(model_id): Path<String>,
) -> ApiResult<Value> {
    let suggestions = state
        .generator
        .prompt_suggestions(Some(&model_id))
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "model": model_id, "suggestions": suggestions })))
}

pub async fn system_info<S: ModelSource>(State(state): State<SharedState<S>>) -> Json<SystemInfo> {
    Json(SystemInfo::collect(state.generator.settings().device_map))
}

pub async fn generate_image<S: ModelSource>(
    State(state): State<SharedState<S>>,
    body: Result<Json<GenerationRequest>, JsonRejection>,
) -> ApiResult<ImageResponse> {
    let req = json_body(body)?;
    info!(model = ?req.model, lora = ?req.lora, "Text-to-image request");
    let generated = state.generator.text_to_image(req).await.map_err(api_error)?;
    ImageResponse::from_generated(generated).map(Json).map_err(api_error)
}

pub async fn edit_image<S: ModelSource>(
    State(state): State<SharedState<S>>,
    body: Result<Json<EditRequest>, JsonRejection>,
) -> ApiResult<ImageResponse> {
    let req = json_body(body)?;
    let source = decode_base64_image(&req.image)?;
    let strength = req.strength.unwrap_or(DEFAULT_EDIT_STRENGTH);
    info!(model = ?req.request.model, strength, "Image-to-image request");
    let generated = state
        .generator
        .image_to_image(source, strength, req.request)
        .await
        .map_err(api_error)?;
    ImageResponse::from_generated(generated).map(Json).map_err(api_error)
}

pub async fn generate_video(
    body: Result<Json<VideoRequest>, JsonRejection>,
) -> ApiResult<VideoResponse> {
    let req = json_body(body)?;
    let defaults = AnimationOptions::default();
    let options = AnimationOptions {
        frames: req.frames.unwrap_or(defaults.frames),
        fps: req.fps.unwrap_or(defaults.fps),
        motion_scale: req.motion_scale.unwrap_or(defaults.motion_scale),
        effect: req.effect.as_deref().map(Effect::from_name).unwrap_or_default(),
    };
    options.validate().map_err(|e| api_error(e.into()))?;
    let source = decode_base64_image(&req.image)?;

    let gif = tokio::task::spawn_blocking(move || animate(&source, &options))
        .await
        .map_err(|e| api_error(e.into()))?
        .map_err(api_error)?;
    Ok(Json(VideoResponse {
        video: BASE64_STANDARD.encode(gif),
        format: "gif",
        frames: options.frames,
        fps: options.fps,
        effect: options.effect,
    }))
}

pub async fn workflow<S: ModelSource>(
    State(state): State<SharedState<S>>,
    body: Result<Json<WorkflowRequest>, JsonRejection>,
) -> ApiResult<WorkflowResponse> {
    let req = json_body(body)?;
    if req.prompt.trim().is_empty() {
        return Err(bad_request("prompt must not be empty"));
    }
    let images = run_workflow(&state.generator, req.workflow, &req.prompt)
        .await
        .into_iter()
        .map(ImageResponse::from_generated)
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(api_error)?;
    Ok(Json(WorkflowResponse {
        workflow: req.workflow,
        images,
    }))
}

pub async fn clear_cache<S: ModelSource>(State(state): State<SharedState<S>>) -> Json<Value> {
    let released = state.generator.cache().clear().await;
    Json(json!({ "released": released }))
}

pub fn router<S: ModelSource + 'static>(state: SharedState<S>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/models", get(list_models::<S>))
        .route("/v1/loras", get(list_loras::<S>))
        .route("/v1/models/{id}/suggestions", get(prompt_suggestions::<S>))
        .route("/v1/system", get(system_info::<S>))
        .route("/v1/images/generations", post(generate_image::<S>))
        .route("/v1/images/edits", post(edit_image::<S>))
        .route("/v1/videos/generations", post(generate_video))
        .route("/v1/workflows", post(workflow::<S>))
        .route("/v1/cache", delete(clear_cache::<S>))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use image::DynamicImage;
    use imggen_core::lora::LoraStore;
    use imggen_core::{
        DeviceMap, GenerationParams, GeneratorSettings, InitImage, LoadRequest, ModelLike, Registry,
    };
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    use super::*;

    struct Solid;

    impl ModelLike for Solid {
        fn run(&self, params: &GenerationParams, init: Option<&InitImage>) -> Result<DynamicImage> {
            match init {
                Some(init) => Ok(init.image.resize_exact(
                    params.width as u32,
                    params.height as u32,
                    image::imageops::FilterType::Nearest,
                )),
                None => Ok(DynamicImage::new_rgb8(params.width as u32, params.height as u32)),
            }
        }

        fn supports_img2img(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct TestSource {
        loads: AtomicUsize,
    }

    impl ModelSource for TestSource {
        async fn load(&self, _request: LoadRequest) -> Result<Arc<dyn ModelLike>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Solid))
        }
    }

    /// Router over a mock pipeline and an empty LoRA store; the store
    /// directory lives as long as the returned guard.
    fn app() -> (Router, TempDir) {
        let loras = tempdir().unwrap();
        let generator = Generator::new(
            Arc::new(Registry::builtin()),
            TestSource::default(),
            LoraStore::new(loras.path(), None),
            GeneratorSettings {
                device_map: DeviceMap::ForceCpu,
                low_memory: false,
            },
        );
        (router(Arc::new(AppState { generator })), loras)
    }

    async fn send(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        send_raw(app, method, uri, body.map(|b| b.to_string())).await
    }

    async fn send_raw(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<String>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn png_base64(width: u32, height: u32) -> String {
        BASE64_STANDARD.encode(encode_png(&DynamicImage::new_rgb8(width, height)).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_catalog() {
        let (app, _loras) = app();
        let (status, body) = send(app.clone(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(app.clone(), "GET", "/v1/models", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["default"], "stable-diffusion-v1-5");
        assert_eq!(body["data"].as_array().unwrap().len(), 4);
        assert_eq!(body["data"][3]["architecture"], "flux");

        let (_, body) = send(app.clone(), "GET", "/v1/loras", None).await;
        assert_eq!(body["data"][0]["id"], "tatsumaki-opm");

        let (status, body) =
            send(app.clone(), "GET", "/v1/models/unknown/suggestions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["suggestions"].as_array().unwrap().len(), 4);

        let (status, body) = send(app, "GET", "/v1/system", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device"], "cpu");
    }

    #[tokio::test]
    async fn test_generate_image() {
        let (app, _loras) = app();
        let (status, body) = send(
            app,
            "POST",
            "/v1/images/generations",
            Some(json!({"prompt": "a fox", "width": 300, "height": 200, "seed": 9})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model"], "stable-diffusion-v1-5");
        assert_eq!((body["width"].as_u64(), body["height"].as_u64()), (Some(296), Some(200)));
        assert_eq!(body["seed"], 9);
        let png = BASE64_STANDARD.decode(body["image"].as_str().unwrap()).unwrap();
        let image = decode_image(&png).unwrap();
        assert_eq!((image.width(), image.height()), (296, 200));
    }

    fn assert_invalid_request(status: StatusCode, body: &Value) {
        assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert!(body["error"]["message"].as_str().is_some_and(|m| !m.is_empty()));
    }

    #[tokio::test]
    async fn test_invalid_requests_are_400() {
        let (app, _loras) = app();
        let cases = [
            ("/v1/images/generations", json!({"prompt": ""})),
            ("/v1/images/edits", json!({"prompt": "blue", "image": "%%%"})),
            (
                "/v1/images/edits",
                json!({"prompt": "blue", "image": png_base64(8, 8), "strength": 2.0}),
            ),
            ("/v1/videos/generations", json!({"image": png_base64(8, 8), "frames": 0})),
        ];
        for (uri, body) in cases {
            let (status, body) = send(app.clone(), "POST", uri, Some(body)).await;
            assert_invalid_request(status, &body);
        }
    }

    #[tokio::test]
    async fn test_malformed_bodies_are_400_json() {
        let (app, _loras) = app();
        let cases = [
            ("/v1/images/generations", r#"{"width": 64}"#.to_string()),
            ("/v1/images/generations", "not json".to_string()),
            ("/v1/images/edits", r#"{"prompt": "blue"}"#.to_string()),
            ("/v1/videos/generations", r#"{"frames": "many"}"#.to_string()),
            ("/v1/workflows", r#"{"prompt": "x", "workflow": "basit"}"#.to_string()),
        ];
        for (uri, body) in cases {
            let (status, body) = send_raw(app.clone(), "POST", uri, Some(body)).await;
            assert_invalid_request(status, &body);
        }
    }

    #[tokio::test]
    async fn test_video_bounds() {
        let (app, _loras) = app();
        let cases = [
            json!({"image": png_base64(8, 8), "frames": 100000}),
            json!({"image": png_base64(8, 8), "fps": 0}),
            json!({"image": png_base64(8, 8), "motion_scale": 1e300}),
            json!({"image": png_base64(8, 8), "motion_scale": -600.0}),
        ];
        for body in cases {
            let (status, body) =
                send(app.clone(), "POST", "/v1/videos/generations", Some(body)).await;
            assert_invalid_request(status, &body);
        }
    }

    #[tokio::test]
    async fn test_edit_image() {
        let (app, _loras) = app();
        let image = format!("data:image/png;base64,{}", png_base64(40, 20));
        let (status, body) = send(
            app,
            "POST",
            "/v1/images/edits",
            Some(json!({"prompt": "make it blue", "image": image})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!((body["width"].as_u64(), body["height"].as_u64()), (Some(768), Some(512)));
        assert_eq!(body["prompt"], "make it blue, high detail, 8k resolution");
    }

    #[tokio::test]
    async fn test_video() {
        let (app, _loras) = app();
        let (status, body) = send(
            app,
            "POST",
            "/v1/videos/generations",
            Some(json!({"image": png_base64(16, 16), "frames": 3, "fps": 5, "effect": "sparkle"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["format"], "gif");
        assert_eq!(body["effect"], "zoom_pan");
        let gif = BASE64_STANDARD.decode(body["video"].as_str().unwrap()).unwrap();
        assert_eq!(&gif[..3], b"GIF");
    }

    #[tokio::test]
    async fn test_workflow_and_cache() {
        let (app, _loras) = app();
        let (status, body) = send(
            app.clone(),
            "POST",
            "/v1/workflows",
            Some(json!({"prompt": "a lake", "workflow": "simple"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["images"].as_array().unwrap().len(), 2);

        let (_, body) = send(app.clone(), "GET", "/v1/models", None).await;
        assert_eq!(body["current"], "pony-realism-v21");

        let (status, body) = send(app, "DELETE", "/v1/cache", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["released"], 2);
    }
}
