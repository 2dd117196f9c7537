use crate::config::UploadConfig;
use crate::object_storage::content_type_for;
use crate::provider_client::ImageOrder;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid request body: {0}")]
    MalformedBody(String),

    #[error("File name is required")]
    MissingFileName,

    #[error("File name exceeds {0} characters")]
    FileNameTooLong(usize),

    #[error("File data is required")]
    MissingFileData,

    #[error("File data is not valid base64")]
    InvalidBase64,

    #[error("File exceeds the {0} byte limit")]
    FileTooLarge(usize),

    #[error("Description exceeds {0} characters")]
    DescriptionTooLong(usize),

    #[error("ImageIds must contain at least one id")]
    EmptyOrder,

    #[error("Image ID must be a positive integer, got {0}")]
    InvalidImageId(i64),
}

/// Raw upload body as sent by the UI
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadImageRequest {
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_data: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Upload that passed every check
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedUpload {
    pub file_name: String,
    /// Base64 payload with any data-URL prefix removed
    pub base64: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageOrderRequest {
    image_ids: Vec<i64>,
}

/// Validates and sanitizes upload bodies against the configured limits
#[derive(Debug, Clone)]
pub struct UploadValidator {
    limits: UploadConfig,
}

impl UploadValidator {
    pub fn new(limits: UploadConfig) -> Self {
        Self { limits }
    }

    pub fn max_file_bytes(&self) -> usize {
        self.limits.max_file_bytes
    }

    /// Largest request body that can carry a valid upload
    pub fn max_body_bytes(&self) -> usize {
        // base64 expansion plus room for the other fields and a data-URL prefix
        self.limits.max_file_bytes / 3 * 4 + 4 + self.limits.max_description_len * 4 + 64 * 1024
    }

    pub fn parse(&self, body: &[u8]) -> Result<ValidatedUpload, ValidationError> {
        let request: UploadImageRequest = serde_json::from_slice(body)
            .map_err(|e| ValidationError::MalformedBody(e.to_string()))?;
        self.validate(request)
    }

    pub fn validate(&self, request: UploadImageRequest) -> Result<ValidatedUpload, ValidationError> {
        let file_name = sanitize_file_name(request.file_name.as_deref().unwrap_or_default());
        if file_name.is_empty() {
            return Err(ValidationError::MissingFileName);
        }
        if file_name.chars().count() > self.limits.max_file_name_len {
            return Err(ValidationError::FileNameTooLong(self.limits.max_file_name_len));
        }

        let raw = request.file_data.unwrap_or_default();
        let (data_url_mime, payload) = split_data_url(raw.trim());
        let base64: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        if base64.is_empty() {
            return Err(ValidationError::MissingFileData);
        }
        // Reject oversized payloads before decoding them
        if base64.len() / 4 * 3 > self.limits.max_file_bytes + 3 {
            return Err(ValidationError::FileTooLarge(self.limits.max_file_bytes));
        }
        let bytes = STANDARD
            .decode(base64.as_bytes())
            .map_err(|_| ValidationError::InvalidBase64)?;
        if bytes.is_empty() {
            return Err(ValidationError::MissingFileData);
        }
        if bytes.len() > self.limits.max_file_bytes {
            return Err(ValidationError::FileTooLarge(self.limits.max_file_bytes));
        }

        let description = request
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        if description
            .as_ref()
            .is_some_and(|d| d.chars().count() > self.limits.max_description_len)
        {
            return Err(ValidationError::DescriptionTooLong(self.limits.max_description_len));
        }

        let mime_type = data_url_mime
            .map(str::to_string)
            .unwrap_or_else(|| content_type_for(&file_name).to_string());

        Ok(ValidatedUpload {
            file_name,
            base64,
            bytes,
            mime_type,
            description,
        })
    }
}

/// Parse and check a reorder body
pub fn parse_image_order(body: &[u8]) -> Result<ImageOrder, ValidationError> {
    let request: ImageOrderRequest = serde_json::from_slice(body)
        .map_err(|e| ValidationError::MalformedBody(e.to_string()))?;

    if request.image_ids.is_empty() {
        return Err(ValidationError::EmptyOrder);
    }
    if let Some(bad) = request.image_ids.iter().find(|id| **id <= 0) {
        return Err(ValidationError::InvalidImageId(*bad));
    }

    Ok(ImageOrder {
        image_ids: request.image_ids,
    })
}

/// Split `data:<mime>;base64,<payload>` into its mime and payload
fn split_data_url(value: &str) -> (Option<&str>, &str) {
    value
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
        .map(|(mime, payload)| (Some(mime).filter(|m| !m.is_empty()), payload))
        .unwrap_or((None, value))
}

/// Trim, drop control characters and neutralize path separators
fn sanitize_file_name(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}
