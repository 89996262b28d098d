//! actix-web routes consumed by the browser UI.

use std::sync::Arc;
use std::time::Duration;

use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{delete, get, post, web, App, HttpResponse, HttpServer, ResponseError};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::task;
use tracing::{info, warn};

use crate::capture::{self, CaptureRegistry, CaptureRequest};
use crate::config::Settings;
use crate::decode::decode_file;
use crate::error::{CaptureError, Error, StoreError, ValidationError};
use crate::report::{self, MIN_CAPTURES};
use crate::store::FileStore;

const DEFAULT_INTERFACE: &str = "any";

/// Shared handler state. Cheap to clone; the registry is the only mutable part.
#[derive(Clone)]
pub struct AppState {
    pub store: FileStore,
    pub registry: CaptureRegistry,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(settings: Settings) -> Result<Self, StoreError> {
        Ok(Self {
            store: FileStore::open(&settings.store_dir)?,
            registry: CaptureRegistry::new(),
            settings: Arc::new(settings),
        })
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::Format(_) | Error::Upload(_) => StatusCode::BAD_REQUEST,
            Error::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Error::Store(StoreError::InvalidName(_)) => StatusCode::BAD_REQUEST,
            Error::Capture(err) => match err {
                CaptureError::InvalidFilter { .. } | CaptureError::InvalidLimit(_) => {
                    StatusCode::BAD_REQUEST
                }
                CaptureError::NoSuchInterface { .. } | CaptureError::NotRunning { .. } => {
                    StatusCode::NOT_FOUND
                }
                CaptureError::CaptureInProgress { .. } => StatusCode::CONFLICT,
                CaptureError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

/// Runs decode, report and capture work on tokio's blocking pool so the
/// actix workers keep serving requests.
async fn blocking<T, F>(work: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Worker(e.to_string()))?
}

#[get("/api/version")]
async fn version() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

#[get("/api/interfaces")]
async fn interfaces() -> Result<HttpResponse, Error> {
    let names = blocking(|| Ok(capture::list_interfaces()?)).await?;
    Ok(HttpResponse::Ok().json(json!({ "interfaces": names })))
}

#[get("/api/files")]
async fn list_files(state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let files = state.store.list()?;
    Ok(HttpResponse::Ok().json(json!({ "files": files })))
}

#[delete("/api/files/{name}")]
async fn delete_file(
    state: web::Data<AppState>,
    name: web::Path<String>,
) -> Result<HttpResponse, Error> {
    state.store.delete(&name)?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Deleted" })))
}

#[post("/api/upload")]
async fn upload(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, Error> {
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| Error::Upload(e.to_string()))?
    {
        let disposition = field.content_disposition();
        if disposition.get_name() != Some("file") {
            continue;
        }
        let original = disposition
            .get_filename()
            .map(str::to_string)
            .filter(|name| !name.trim().is_empty())
            .ok_or(ValidationError::MissingField("file"))?;

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| Error::Upload(e.to_string()))?;
            bytes.extend_from_slice(&chunk);
        }

        let stored = state.store.save(&original, &bytes)?;
        return Ok(HttpResponse::Ok().json(json!({
            "filename": original,
            "saved_as": stored,
            "filepath": stored,
        })));
    }
    Err(ValidationError::MissingField("file").into())
}

#[derive(Debug, Deserialize)]
pub struct CaptureBody {
    pub interface: Option<String>,
    pub count: Option<u64>,
    pub filter: Option<String>,
    /// Seconds
    pub duration: Option<f64>,
}

impl CaptureBody {
    fn into_request(self) -> Result<CaptureRequest, CaptureError> {
        let duration_limit = self
            .duration
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .map_err(|_| CaptureError::InvalidLimit(format!("duration {secs}")))
            })
            .transpose()?;
        let interface = self
            .interface
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_INTERFACE.to_string());

        Ok(CaptureRequest {
            interface,
            filter: self.filter.unwrap_or_default(),
            packet_limit: self.count,
            duration_limit,
        })
    }
}

#[post("/api/capture")]
async fn start_capture(
    state: web::Data<AppState>,
    body: web::Json<CaptureBody>,
) -> Result<HttpResponse, Error> {
    let request = body.into_inner().into_request()?;
    info!("Capture requested on {}", request.interface);

    let state = state.get_ref().clone();
    let outcome = blocking(move || {
        let options = state.settings.capture_options();
        Ok(capture::start_capture(
            request,
            &state.registry,
            state.store.root(),
            &options,
        )?)
    })
    .await?;

    let filename = outcome
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(HttpResponse::Ok().json(json!({
        "filename": filename,
        "filepath": filename,
        "packets": outcome.packets,
        "message": "Capture completed",
    })))
}

#[derive(Debug, Deserialize)]
pub struct StopBody {
    pub interface: Option<String>,
}

#[post("/api/capture/stop")]
async fn stop_capture(
    state: web::Data<AppState>,
    body: web::Json<StopBody>,
) -> Result<HttpResponse, Error> {
    let interface = body
        .into_inner()
        .interface
        .unwrap_or_else(|| DEFAULT_INTERFACE.to_string());
    if !state.registry.cancel(&interface) {
        return Err(CaptureError::NotRunning { interface }.into());
    }
    Ok(HttpResponse::Ok().json(json!({ "message": "Stop requested" })))
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeBody {
    pub filepath: Option<String>,
}

#[post("/api/analyze")]
async fn analyze(
    state: web::Data<AppState>,
    body: web::Json<AnalyzeBody>,
) -> Result<HttpResponse, Error> {
    let filepath = body
        .into_inner()
        .filepath
        .ok_or(ValidationError::MissingField("filepath"))?;
    let path = state.store.resolve(&filepath)?;

    let report = blocking(move || {
        let capture = decode_file(&path)?;
        if let Some(err) = &capture.truncation {
            warn!("{} decoded partially: {}", capture.name(), err);
        }
        Ok(report::generate(&capture).into_text())
    })
    .await?;

    Ok(HttpResponse::Ok().json(json!({ "report": report, "filepath": filepath })))
}

#[derive(Debug, Deserialize)]
pub struct TimelineBody {
    #[serde(default)]
    pub filepaths: Vec<String>,
}

#[post("/api/timeline")]
async fn timeline(
    state: web::Data<AppState>,
    body: web::Json<TimelineBody>,
) -> Result<HttpResponse, Error> {
    let filepaths = body.into_inner().filepaths;
    if filepaths.len() < MIN_CAPTURES {
        return Err(ValidationError::TooFewCaptures {
            required: MIN_CAPTURES,
            supplied: filepaths.len(),
        }
        .into());
    }
    let paths = filepaths
        .iter()
        .map(|name| state.store.resolve(name))
        .collect::<Result<Vec<_>, _>>()?;

    let options = state.settings.timeline_options();
    let report = blocking(move || {
        let captures = paths
            .iter()
            .map(|path| decode_file(path))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(report::correlate_with(&captures, &options)?.into_text())
    })
    .await?;

    Ok(HttpResponse::Ok().json(json!({ "report": report, "filepaths": filepaths })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(version)
        .service(interfaces)
        .service(list_files)
        .service(delete_file)
        .service(upload)
        .service(start_capture)
        .service(stop_capture)
        .service(analyze)
        .service(timeline);
}

pub async fn run(bind: &str, port: u16, state: AppState) -> std::io::Result<()> {
    info!("Serving on {}:{} with store {}", bind, port, state.store.root().display());
    let data = web::Data::new(state);
    HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
        .bind((bind, port))?
        .run()
        .await
}
