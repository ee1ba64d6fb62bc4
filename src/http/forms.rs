//! Multipart form intake: collect fields into typed records at the
//! edge, validate, pass the record inward.

use axum::extract::Multipart;
use std::collections::HashMap;
use std::path::Path;

use crate::{AppError, AppResult};

const ALLOWED_IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

/// Raw multipart content: text fields plus an optional image part.
pub struct FormData {
    fields: HashMap<String, String>,
    pub image: Option<ImageUpload>,
}

pub struct ImageUpload {
    pub extension: String,
    pub bytes: Vec<u8>,
}

impl FormData {
    pub async fn read(mut multipart: Multipart) -> AppResult<Self> {
        let mut fields = HashMap::new();
        let mut image = None;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::Validation(format!("multipart: {}", e)))?
        {
            let name = match field.name() {
                Some(n) => n.to_string(),
                None => continue,
            };

            if name == "image" {
                let extension = field
                    .file_name()
                    .and_then(|f| Path::new(f).extension())
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_lowercase());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("image: {}", e)))?;
                if let Some(extension) = extension {
                    if ALLOWED_IMAGE_EXTENSIONS.contains(&extension.as_str()) && !bytes.is_empty()
                    {
                        image = Some(ImageUpload { extension, bytes: bytes.to_vec() });
                    }
                }
            } else {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("{}: {}", name, e)))?;
                fields.insert(name, value.trim().to_string());
            }
        }

        Ok(Self { fields, image })
    }

    /// A field that must be present and non-empty.
    pub fn required(&self, name: &str) -> AppResult<String> {
        match self.fields.get(name) {
            Some(v) if !v.is_empty() => Ok(v.clone()),
            _ => Err(AppError::Validation(name.to_string())),
        }
    }

    pub fn optional(&self, name: &str) -> Option<String> {
        self.fields.get(name).filter(|v| !v.is_empty()).cloned()
    }

    pub fn bool_flag(&self, name: &str) -> bool {
        self.optional(name).map(|v| v.to_lowercase() == "true").unwrap_or(false)
    }

    /// Optional integer; present-but-malformed is a validation error.
    pub fn optional_i64(&self, name: &str) -> AppResult<Option<i64>> {
        match self.optional(name) {
            None => Ok(None),
            Some(v) => v
                .parse::<i64>()
                .map(Some)
                .map_err(|_| AppError::Validation(format!("{} must be an integer", name))),
        }
    }

    /// Optional clip offset, clamped to [-1, 1]; present-but-malformed
    /// is a validation error.
    pub fn optional_clip_offset(&self, name: &str) -> AppResult<Option<f64>> {
        match self.optional(name) {
            None => Ok(None),
            Some(v) => v
                .parse::<f64>()
                .map(|x| Some(x.clamp(-1.0, 1.0)))
                .map_err(|_| AppError::Validation(format!("{} must be a number", name))),
        }
    }
}

/// Persist an uploaded image under a fresh name; returns the public URL
/// path.
pub fn save_image(upload_dir: &Path, image: &ImageUpload) -> AppResult<String> {
    std::fs::create_dir_all(upload_dir)?;
    let filename = format!("{}.{}", uuid::Uuid::new_v4().simple(), image.extension);
    std::fs::write(upload_dir.join(&filename), &image.bytes)?;
    tracing::info!(filename = %filename, bytes = image.bytes.len(), "Image uploaded");
    Ok(format!("/uploads/{}", filename))
}
