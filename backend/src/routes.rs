use actix_files::Files;
use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{Error, HttpResponse, web};
use futures::TryStreamExt;
use log::{info, warn};
use shared::{AnalyzeUrlRequest, ErrorResponse, FailureCategory, HealthResponse};
use std::path::PathBuf;

use crate::analysis::{AnalysisReport, Analyzer};
use crate::media::MediaReference;

const UPLOAD_FIELD: &str = "video";

pub fn configure_routes(cfg: &mut web::ServiceConfig, static_dir: Option<PathBuf>) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/upload").route(web::post().to(upload_video)))
        .service(web::resource("/analyze-url").route(web::post().to(analyze_url)));

    if let Some(dir) = static_dir {
        cfg.service(Files::new("/static", dir.clone()))
            .service(Files::new("/", dir).index_file("index.html"));
    }
}

pub fn status_for(category: FailureCategory) -> StatusCode {
    match category {
        FailureCategory::UnsupportedFormat => StatusCode::BAD_REQUEST,
        FailureCategory::SourceTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        FailureCategory::SourceUnavailable => StatusCode::BAD_GATEWAY,
        FailureCategory::DecodeFailure | FailureCategory::NoFramesExtracted => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        FailureCategory::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        FailureCategory::InferenceFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond(report: AnalysisReport) -> HttpResponse {
    match report.to_response() {
        Ok(body) => HttpResponse::Ok().json(body),
        Err(body) => {
            let status = body
                .category
                .map(status_for)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            HttpResponse::build(status).json(body)
        }
    }
}

async fn health(analyzer: web::Data<Analyzer>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy".to_string(),
        model_loaded: analyzer.model_loaded(),
    })
}

async fn upload_video(
    analyzer: web::Data<Analyzer>,
    mut payload: Multipart,
) -> Result<HttpResponse, Error> {
    let limit = analyzer.default_limit();
    // One byte past the ceiling is enough for the resolver to reject it.
    let keep = limit.max_bytes().saturating_add(1) as usize;
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(mut field) = payload.try_next().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .unwrap_or_default()
            .to_string();

        let mut data = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            let room = keep - data.len();
            data.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if data.len() >= keep {
                warn!("Upload '{}' exceeds {} bytes, truncating read", filename, limit.max_bytes());
                break;
            }
        }
        upload = Some((filename, data));
        break;
    }

    let Some((name, content)) = upload else {
        return Ok(HttpResponse::BadRequest().json(ErrorResponse::new("No video file provided")));
    };
    if name.is_empty() {
        return Ok(HttpResponse::BadRequest().json(ErrorResponse::new("No file selected")));
    }

    info!("Received upload '{}' ({} bytes)", name, content.len());
    let report = analyzer
        .analyze(MediaReference::UploadedBytes { name, content }, limit)
        .await;
    Ok(respond(report))
}

async fn analyze_url(
    analyzer: web::Data<Analyzer>,
    request: web::Json<AnalyzeUrlRequest>,
) -> HttpResponse {
    let url = request.url.trim();
    if url.is_empty() {
        return HttpResponse::BadRequest().json(ErrorResponse::new("Empty URL provided"));
    }

    let reference = match MediaReference::from_url(url) {
        Ok(reference) => reference,
        Err(e) => {
            warn!("Rejected URL '{}': {}", url, e);
            return HttpResponse::BadRequest().json(ErrorResponse {
                category: Some(e.category()),
                ..ErrorResponse::new(e.to_string())
            });
        }
    };

    info!("Analyzing {:?} {}", reference.kind(), url);
    let report = analyzer.analyze(reference, analyzer.default_limit()).await;
    respond(report)
}
