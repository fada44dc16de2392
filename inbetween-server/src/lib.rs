//! Command line and HTTP front end for keyframe interpolation.
//!
//! The binary calls [`run`] with an empty [`LoaderRegistry`]. Crates that ship a
//! concrete architecture call [`run`] with their own registry instead.

use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use hf_hub::api::tokio::Api;
use inbetween_core::{
    encode_gif, load_model, CheckpointLayout, ErrorKind, GenerationPipeline, GenerationRequest,
    Keyframe, LoaderRegistry, Resolution, VideoSink, WorkerRank,
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Keyframe interpolation video server")]
pub struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    pub cpu: bool,

    /// Output resolution as HEIGHT_WIDTH; selects checkpoint and config
    #[arg(long, default_value = "256_256")]
    pub resolution: Resolution,

    #[arg(long, default_value = "checkpoints")]
    pub checkpoints: PathBuf,

    #[arg(long, default_value = "configs")]
    pub configs: PathBuf,

    #[arg(long, default_value = "./tmp/")]
    pub result_dir: PathBuf,

    /// Never download missing checkpoints
    #[arg(long)]
    pub offline: bool,

    #[arg(long, default_value_t = inbetween_core::DEFAULT_SAVE_FPS)]
    pub save_fps: u32,

    /// Generate a single video from this keyframe and exit instead of serving
    #[arg(long)]
    pub image: Option<PathBuf>,

    /// Final keyframe for the one-shot video
    #[arg(long, requires = "image")]
    pub image2: Option<PathBuf>,

    #[arg(long, default_value = "")]
    pub prompt: String,

    #[arg(long, default_value_t = GenerationRequest::DEFAULT_STEPS)]
    pub steps: usize,

    #[arg(long, default_value_t = GenerationRequest::DEFAULT_CFG_SCALE)]
    pub cfg_scale: f64,

    #[arg(long, default_value_t = GenerationRequest::DEFAULT_ETA)]
    pub eta: f64,

    #[arg(long, default_value_t = GenerationRequest::DEFAULT_FRAME_STRIDE)]
    pub frame_stride: i64,

    #[arg(long, default_value_t = GenerationRequest::DEFAULT_SEED)]
    pub seed: u64,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    pub port: u16,
}

/// Body of `POST /v1/videos/generations`. Images are base64 encoded files in
/// any format the `image` crate reads.
#[derive(Deserialize, Debug)]
struct VideoRequest {
    image: String,
    #[serde(default)]
    image2: Option<String>,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    steps: Option<usize>,
    #[serde(default)]
    cfg_scale: Option<f64>,
    #[serde(default)]
    eta: Option<f64>,
    #[serde(default)]
    frame_stride: Option<i64>,
    #[serde(default)]
    seed: Option<u64>,
}

impl VideoRequest {
    fn into_generation_request(self) -> inbetween_core::Result<GenerationRequest> {
        let mut request = GenerationRequest::new(decode_keyframe(&self.image)?, self.prompt);
        if let Some(image2) = self.image2 {
            request = request.with_second_image(decode_keyframe(&image2)?);
        }
        request.steps = self.steps.unwrap_or(request.steps);
        request.cfg_scale = self.cfg_scale.unwrap_or(request.cfg_scale);
        request.eta = self.eta.unwrap_or(request.eta);
        request.frame_stride = self.frame_stride.unwrap_or(request.frame_stride);
        request.seed = self.seed.unwrap_or(request.seed);
        Ok(request)
    }
}

fn decode_keyframe(data: &str) -> inbetween_core::Result<Keyframe> {
    let bytes = BASE64_STANDARD
        .decode(data)
        .map_err(|e| inbetween_core::Error::MalformedInput(format!("invalid base64: {e}")))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| inbetween_core::Error::MalformedInput(format!("unreadable image: {e}")))?;
    Keyframe::from_image(image)
}

#[derive(Serialize)]
struct VideoResponse {
    /// Base64 encoded GIF.
    video: String,
    path: String,
    frames: usize,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Resource => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Clone)]
struct AppState {
    pipeline: GenerationPipeline,
    sink: Arc<dyn VideoSink>,
}

async fn generate_video_handler(
    State(state): State<AppState>,
    Json(req): Json<VideoRequest>,
) -> impl IntoResponse {
    match generate_video(req, state).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            error!("video generation failed: {e}");
            (status_for(e.kind()), e.to_string()).into_response()
        }
    }
}

async fn generate_video(
    req: VideoRequest,
    state: AppState,
) -> inbetween_core::Result<VideoResponse> {
    let request = req.into_generation_request()?;
    let render = move || -> inbetween_core::Result<_> {
        let rendered = state.pipeline.render(&request)?;
        let gif = encode_gif(&rendered.video, state.pipeline.save_fps())?;
        let path = state.sink.save_encoded(&gif, &rendered.slug)?;
        Ok((rendered, gif, path))
    };
    let (rendered, gif, path) = tokio::task::spawn_blocking(render)
        .await
        .map_err(|e| inbetween_core::Error::Config(format!("generation task failed: {e}")))??;

    info!(path = %path.display(), slug = %rendered.slug, "served video");
    Ok(VideoResponse {
        video: BASE64_STANDARD.encode(&gif),
        path: path.display().to_string(),
        frames: rendered.video.dim(2)?,
    })
}

fn one_shot_request(args: &Args, image: &Path) -> Result<GenerationRequest> {
    let first = Keyframe::open(image).with_context(|| format!("reading {}", image.display()))?;
    let mut request = GenerationRequest::new(first, args.prompt.clone());
    if let Some(image2) = &args.image2 {
        let second =
            Keyframe::open(image2).with_context(|| format!("reading {}", image2.display()))?;
        request = request.with_second_image(second);
    }
    request.steps = args.steps;
    request.cfg_scale = args.cfg_scale;
    request.eta = args.eta;
    request.frame_stride = args.frame_stride;
    request.seed = args.seed;
    Ok(request)
}

/// Loads the model through `registry`, then either renders the one-shot
/// request named by `--image` or serves HTTP until shut down.
pub async fn run(args: Args, registry: LoaderRegistry) -> Result<()> {
    let rank = WorkerRank::from_env()?;
    info!(
        local_rank = rank.local_rank,
        world_size = rank.world_size,
        "starting worker"
    );
    if rank.is_coordinator() {
        tokio::fs::create_dir_all(&args.result_dir)
            .await
            .with_context(|| format!("creating {}", args.result_dir.display()))?;
    }

    let layout = CheckpointLayout::new(
        args.checkpoints.clone(),
        args.configs.clone(),
        args.resolution,
    );
    let api = if args.offline { None } else { Some(Api::new()?) };
    let start = Instant::now();
    let model = load_model(&layout, api, rank.device_map(args.cpu), &registry)
        .await
        .context("loading model")?;
    info!(elapsed_secs = start.elapsed().as_secs_f64(), "model ready");

    let pipeline = GenerationPipeline::new(model, args.resolution).with_save_fps(args.save_fps);
    let sink: Arc<dyn VideoSink> = Arc::from(rank.sink(&args.result_dir));

    if let Some(image) = &args.image {
        let request = one_shot_request(&args, image)?;
        let result = tokio::task::spawn_blocking(move || pipeline.generate(&request, sink.as_ref()))
            .await??;
        println!("done {}", result.path.display());
        return Ok(());
    }

    if !rank.is_coordinator() {
        info!("non-coordinating worker has nothing to serve");
        return Ok(());
    }

    let app = Router::new()
        .route("/v1/videos/generations", post(generate_video_handler))
        .with_state(AppState { pipeline, sink });

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
