use actix_files::{Files, NamedFile};
use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, ResponseError};
use futures::{StreamExt, TryStreamExt};
use log::{error, info, warn};
use pneumo_shared::{ErrorResponse, HealthResponse};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use uuid::Uuid;

use crate::inference::model::{InferenceError, ModelState};
use crate::inference::preprocess::Preprocessor;

const UPLOAD_FIELD: &str = "file";
const ALLOWED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

const PAGES: [(&str, &str); 4] = [
    ("/", "index.html"),
    ("/prediction.html", "prediction.html"),
    ("/analysis.html", "analysis.html"),
    ("/model.html", "model.html"),
];

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("No X-ray image file was uploaded.")]
    NoFileUploaded,
    #[error("No selected file.")]
    NoFileSelected,
    #[error("Unsupported file format. Please upload a PNG or JPEG image.")]
    UnsupportedFormat(String),
    #[error("Uploaded file is too large.")]
    FileTooLarge(usize),
    #[error("Malformed multipart upload.")]
    MalformedUpload,
}

/// Everything `/predict` can fail with. `Display` is the client-facing
/// message; `Debug` carries the detail for logs.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("Internal Server Error: Model is not available.")]
    ServiceUnavailable,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("An internal error occurred while processing the image.")]
    Inference(#[from] InferenceError),
}

impl ResponseError for PredictError {
    fn status_code(&self) -> StatusCode {
        match self {
            PredictError::ServiceUnavailable | PredictError::Inference(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            PredictError::Validation(ValidationError::FileTooLarge(_)) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            PredictError::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_upload_bytes: usize,
}

pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, static_dir: PathBuf) {
    cfg.service(web::resource("/predict").route(web::post().to(predict)))
        .service(web::resource("/health").route(web::get().to(health)));

    for (route, file_name) in PAGES {
        let page_path = static_dir.join(file_name);
        cfg.service(
            web::resource(route).route(web::get().to(move || serve_page(page_path.clone()))),
        );
    }

    cfg.service(Files::new("/static", static_dir));
}

async fn serve_page(path: PathBuf) -> Result<NamedFile, actix_web::Error> {
    NamedFile::open_async(&path).await.map_err(|e| {
        error!("Failed to open page {}: {}", path.display(), e);
        actix_web::error::ErrorNotFound("Page not found")
    })
}

pub fn has_allowed_extension(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    match lower.rsplit_once('.') {
        Some((_, extension)) => ALLOWED_EXTENSIONS.contains(&extension),
        None => false,
    }
}

/// Pulls the first part named `file` that carries a filename. Other parts
/// are drained and skipped.
async fn read_upload(mut payload: Multipart, max_bytes: usize) -> Result<Upload, ValidationError> {
    loop {
        let mut field = match payload.try_next().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                warn!("Predict request: No 'file' part in request.");
                return Err(ValidationError::NoFileUploaded);
            }
            Err(e) => {
                warn!("Predict request: could not read multipart body: {}", e);
                return Err(ValidationError::NoFileUploaded);
            }
        };

        let filename = if field.name() == Some(UPLOAD_FIELD) {
            field
                .content_disposition()
                .and_then(|cd| cd.get_filename())
                .map(str::to_string)
        } else {
            None
        };
        let Some(filename) = filename else {
            while let Some(chunk) = field.next().await {
                chunk.map_err(|e| {
                    warn!("Predict request: broken multipart field: {}", e);
                    ValidationError::MalformedUpload
                })?;
            }
            continue;
        };

        if filename.is_empty() {
            return Err(ValidationError::NoFileSelected);
        }
        if !has_allowed_extension(&filename) {
            warn!("Predict request: unsupported file '{}'", filename);
            return Err(ValidationError::UnsupportedFormat(filename));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let data = chunk.map_err(|e| {
                warn!("Predict request: broken upload for '{}': {}", filename, e);
                ValidationError::MalformedUpload
            })?;
            if bytes.len() + data.len() > max_bytes {
                warn!(
                    "Predict request: '{}' exceeds the {} byte upload limit",
                    filename, max_bytes
                );
                return Err(ValidationError::FileTooLarge(max_bytes));
            }
            bytes.extend_from_slice(&data);
        }

        return Ok(Upload { filename, bytes });
    }
}

async fn predict(
    state: web::Data<ModelState>,
    preprocessor: web::Data<Preprocessor>,
    limits: web::Data<UploadLimits>,
    payload: Multipart,
) -> Result<HttpResponse, PredictError> {
    let model = match state.get_ref() {
        ModelState::Available(model) => model.clone(),
        ModelState::Unavailable(reason) => {
            error!(
                "Attempted prediction while model failed to load: {}",
                reason
            );
            return Err(PredictError::ServiceUnavailable);
        }
    };

    let Upload { filename, bytes } = read_upload(payload, limits.max_upload_bytes).await?;

    let request_id = Uuid::new_v4();
    let digest = hex::encode(Sha256::digest(&bytes));
    info!(
        "[{}] Received '{}' ({} bytes, sha256 {})",
        request_id,
        filename,
        bytes.len(),
        digest
    );

    let preprocessor = preprocessor.get_ref().clone();
    let outcome = web::block(move || {
        let input = preprocessor.to_tensor(&bytes, model.device())?;
        model.infer(&input)
    })
    .await;

    let prediction = match outcome {
        Ok(Ok(prediction)) => prediction,
        Ok(Err(e)) => {
            error!(
                "[{}] Error during prediction processing of '{}': {:?}",
                request_id, filename, e
            );
            return Err(PredictError::Inference(e));
        }
        Err(e) => {
            error!(
                "[{}] Inference worker failed for '{}': {:?}",
                request_id, filename, e
            );
            return Err(PredictError::Inference(InferenceError::Worker(e.to_string())));
        }
    };

    info!(
        "[{}] Prediction result: {} (Confidence: {:.4})",
        request_id, prediction.label, prediction.confidence
    );
    Ok(HttpResponse::Ok().json(prediction.to_response()))
}

async fn health(state: web::Data<ModelState>) -> HttpResponse {
    let response = match state.get_ref() {
        ModelState::Available(model) => HealthResponse {
            status: "ok".into(),
            model: "available".into(),
            device: Some(format!("{:?}", model.device()).to_lowercase()),
            reason: None,
        },
        ModelState::Unavailable(e) => HealthResponse {
            status: "degraded".into(),
            model: "unavailable".into(),
            device: None,
            reason: Some(e.reason().into()),
        },
    };
    HttpResponse::Ok().json(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_png_and_jpeg_in_any_case() {
        for name in ["xray.png", "XRAY.PNG", "scan.jpg", "scan.JpEg", "a.b.jpeg", ".png"] {
            assert!(has_allowed_extension(name), "{}", name);
        }
    }

    #[test]
    fn rejects_other_formats() {
        for name in ["xray.gif", "xray.bmp", "png", "xray.png.txt", "xray", "xray."] {
            assert!(!has_allowed_extension(name), "{}", name);
        }
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            PredictError::ServiceUnavailable.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            PredictError::from(ValidationError::NoFileSelected).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PredictError::from(ValidationError::FileTooLarge(10)).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            PredictError::from(InferenceError::Preprocess("bad".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn inference_detail_stays_out_of_the_message() {
        let err = PredictError::from(InferenceError::Preprocess("tensor on cuda:3".into()));
        assert_eq!(
            err.to_string(),
            "An internal error occurred while processing the image."
        );
        assert!(format!("{:?}", err).contains("cuda:3"));
    }

    #[test]
    fn validation_messages_pass_through() {
        let err = PredictError::from(ValidationError::UnsupportedFormat("x.gif".into()));
        assert_eq!(
            err.to_string(),
            "Unsupported file format. Please upload a PNG or JPEG image."
        );
    }
}
