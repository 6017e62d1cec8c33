//! Storage for files attached to content.
//!
//! Uploads go to Cloudinary when it's configured. Otherwise files are written to
//! the local media directory and served by the backend under `/media`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use rocket::fs::TempFile;
use rocket::http::Status;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use utoipa::ToSchema;

use crate::config::{CloudinaryConfig, Config};
use crate::resp::problem::Problem;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "bmp", "tiff"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "wmv", "flv", "webm", "m4v", "mkv"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "flac", "aac", "m4a", "wma"];
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "txt", "rtf"];

const IMAGE_LIMIT: &str = "c_limit,w_800,h_600";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("unsupported file type '{0}'")]
    Unsupported(String),
    #[error("media host request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("media host rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<MediaError> for Problem {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::Unsupported(ext) => {
                Problem::new_untyped(Status::BadRequest, "Unsupported file type!")
                    .insert_str("extension", ext)
                    .detail(format!(
                        "Allowed extensions: {}",
                        [
                            IMAGE_EXTENSIONS,
                            VIDEO_EXTENSIONS,
                            AUDIO_EXTENSIONS,
                            DOCUMENT_EXTENSIONS
                        ]
                        .concat()
                        .join(", ")
                    ))
                    .to_owned()
            }
            other => Problem::internal("Failed to upload file", other),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Image,
    Video,
    Raw,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Image => "image",
            ResourceType::Video => "video",
            ResourceType::Raw => "raw",
        }
    }
}

/// Folder a file is stored in, derived from its extension and mime type.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FileCategory {
    Images,
    Videos,
    Audio,
    Documents,
}

impl FileCategory {
    pub fn detect(extension: &str, mime: Option<&str>) -> Option<FileCategory> {
        let ext = extension.to_ascii_lowercase();
        let ext = ext.as_str();

        if ext.is_empty() {
            // nameless uploads fall back to the declared media type
            let mime = mime.unwrap_or_default();
            return if mime.starts_with("image/") {
                Some(FileCategory::Images)
            } else if mime.starts_with("video/") {
                Some(FileCategory::Videos)
            } else if mime.starts_with("audio/") {
                Some(FileCategory::Audio)
            } else {
                None
            };
        }

        if IMAGE_EXTENSIONS.contains(&ext) {
            Some(FileCategory::Images)
        } else if VIDEO_EXTENSIONS.contains(&ext) {
            Some(FileCategory::Videos)
        } else if AUDIO_EXTENSIONS.contains(&ext) {
            Some(FileCategory::Audio)
        } else if DOCUMENT_EXTENSIONS.contains(&ext) {
            Some(FileCategory::Documents)
        } else {
            None
        }
    }

    pub fn folder(self) -> &'static str {
        match self {
            FileCategory::Images => "images",
            FileCategory::Videos => "videos",
            FileCategory::Audio => "audio",
            FileCategory::Documents => "documents",
        }
    }

    pub fn resource_type(self) -> ResourceType {
        match self {
            FileCategory::Images => ResourceType::Image,
            // the media host files audio under its video pipeline
            FileCategory::Videos | FileCategory::Audio => ResourceType::Video,
            FileCategory::Documents => ResourceType::Raw,
        }
    }
}

/// Reference to a stored file as kept on content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StoredFile {
    pub url: String,
    pub public_id: String,
    pub resource_type: ResourceType,
}

/// A fully read, type-checked upload.
#[derive(Clone)]
pub struct Upload {
    pub extension: String,
    pub category: FileCategory,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Upload({:?}, .{}, {} bytes)",
            self.category,
            self.extension,
            self.bytes.len()
        )
    }
}

impl Upload {
    pub fn new(extension: &str, mime: Option<&str>, bytes: Vec<u8>) -> Result<Upload, MediaError> {
        let extension = extension.trim_start_matches('.').to_ascii_lowercase();
        let category = FileCategory::detect(&extension, mime)
            .ok_or_else(|| MediaError::Unsupported(extension.clone()))?;
        Ok(Upload {
            extension,
            category,
            bytes,
        })
    }

    pub async fn from_temp_file(file: &TempFile<'_>) -> Result<Upload, MediaError> {
        let raw_name = file
            .raw_name()
            .map(|it| it.dangerous_unsafe_unsanitized_raw().as_str().to_string())
            .unwrap_or_default();
        let extension = Path::new(&raw_name)
            .extension()
            .and_then(|it| it.to_str())
            .map(str::to_string)
            .or_else(|| {
                file.content_type()
                    .and_then(|it| it.extension())
                    .map(|it| it.to_string())
            })
            .unwrap_or_default();
        let mime = file.content_type().map(|it| it.to_string());

        let mut bytes = Vec::with_capacity(file.len() as usize);
        let reader = file.open().await?;
        tokio::pin!(reader);
        reader.read_to_end(&mut bytes).await?;

        Upload::new(&extension, mime.as_deref(), bytes)
    }

    fn public_name(&self) -> String {
        format!(
            "file-{}-{}",
            chrono::Utc::now().timestamp_millis(),
            rand::thread_rng().gen_range(0..1_000_000_000u32)
        )
    }
}

#[rocket::async_trait]
pub trait MediaStore: Send + Sync {
    async fn upload(&self, upload: Upload) -> Result<StoredFile, MediaError>;
    async fn delete(&self, file: &StoredFile) -> Result<(), MediaError>;
}

pub type Media = Arc<dyn MediaStore>;

/// Picks the media host from configuration.
pub fn from_config(config: &Config) -> Media {
    match &config.cloudinary {
        Some(cloudinary) => {
            tracing::info!("Storing media on Cloudinary ({}).", cloudinary.cloud_name);
            Arc::new(CloudinaryStore::new(cloudinary.clone()))
        }
        None => {
            tracing::warn!(
                "Cloudinary isn't configured. Storing media in '{}'.",
                config.media_dir.display()
            );
            Arc::new(LocalMediaStore::new(
                config.media_dir.clone(),
                format!("{}/media", config.public_url.trim_end_matches('/')),
            ))
        }
    }
}

/// Signature over `params` as expected by the Cloudinary upload API: parameters sorted
/// by name, joined as `k=v` with `&`, followed by the API secret, SHA-1 hex encoded.
pub fn cloudinary_signature(params: &[(&str, String)], api_secret: &str) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    hex::encode(Sha1::digest(format!("{}{}", joined, api_secret).as_bytes()))
}

#[derive(Debug, Deserialize)]
struct CloudinaryUploadResponse {
    secure_url: String,
    public_id: String,
}

pub struct CloudinaryStore {
    config: CloudinaryConfig,
    client: reqwest::Client,
}

impl CloudinaryStore {
    pub fn new(config: CloudinaryConfig) -> CloudinaryStore {
        CloudinaryStore {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, resource_type: ResourceType, action: &str) -> String {
        format!(
            "https://api.cloudinary.com/v1_1/{}/{}/{}",
            self.config.cloud_name,
            resource_type.as_str(),
            action
        )
    }

    fn signed(&self, mut params: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        params.push(("timestamp", chrono::Utc::now().timestamp().to_string()));
        let signature = cloudinary_signature(&params, &self.config.api_secret);
        params.push(("api_key", self.config.api_key.clone()));
        params.push(("signature", signature));
        params
    }
}

async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, MediaError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(MediaError::Rejected { status, body })
}

#[rocket::async_trait]
impl MediaStore for CloudinaryStore {
    #[tracing::instrument(skip(self))]
    async fn upload(&self, upload: Upload) -> Result<StoredFile, MediaError> {
        let resource_type = upload.category.resource_type();
        let mut params = vec![
            ("folder", upload.category.folder().to_string()),
            ("public_id", upload.public_name()),
        ];
        if upload.category == FileCategory::Images {
            params.push(("transformation", IMAGE_LIMIT.to_string()));
        }

        let file_name = format!("upload.{}", upload.extension);
        let mut form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(upload.bytes).file_name(file_name));
        for (key, value) in self.signed(params) {
            form = form.text(key, value);
        }

        let response = self
            .client
            .post(self.endpoint(resource_type, "upload"))
            .multipart(form)
            .send()
            .await?;
        let uploaded: CloudinaryUploadResponse = check_response(response).await?.json().await?;

        tracing::info!("uploaded {} to Cloudinary", uploaded.public_id);
        Ok(StoredFile {
            url: uploaded.secure_url,
            public_id: uploaded.public_id,
            resource_type,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, file: &StoredFile) -> Result<(), MediaError> {
        let params = self.signed(vec![("public_id", file.public_id.clone())]);
        let response = self
            .client
            .post(self.endpoint(file.resource_type, "destroy"))
            .form(&params)
            .send()
            .await?;
        check_response(response).await?;

        tracing::info!("deleted {} from Cloudinary", file.public_id);
        Ok(())
    }
}

/// Stores files under a local directory. Public ids are paths relative to it.
pub struct LocalMediaStore {
    root: PathBuf,
    base_url: String,
}

impl LocalMediaStore {
    pub fn new(root: PathBuf, base_url: impl ToString) -> LocalMediaStore {
        LocalMediaStore {
            root,
            base_url: base_url.to_string(),
        }
    }

    fn path_of(&self, public_id: &str) -> Option<PathBuf> {
        let relative = Path::new(public_id);
        let escapes = relative
            .components()
            .any(|it| !matches!(it, std::path::Component::Normal(_)));
        if escapes {
            None
        } else {
            Some(self.root.join(relative))
        }
    }
}

#[rocket::async_trait]
impl MediaStore for LocalMediaStore {
    async fn upload(&self, upload: Upload) -> Result<StoredFile, MediaError> {
        let folder = upload.category.folder();
        let public_id = format!("{}/{}.{}", folder, upload.public_name(), upload.extension);

        tokio::fs::create_dir_all(self.root.join(folder)).await?;
        tokio::fs::write(self.root.join(&public_id), &upload.bytes).await?;

        tracing::debug!("stored {} locally", public_id);
        Ok(StoredFile {
            url: format!("{}/{}", self.base_url.trim_end_matches('/'), public_id),
            public_id,
            resource_type: upload.category.resource_type(),
        })
    }

    async fn delete(&self, file: &StoredFile) -> Result<(), MediaError> {
        match self.path_of(&file.public_id) {
            Some(path) => match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            None => Ok(()),
        }
    }
}
