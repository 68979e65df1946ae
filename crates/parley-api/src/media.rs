use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use thiserror::Error;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("image payload is not a base64 data URI")]
    Malformed,

    #[error("unsupported image content type: {0}")]
    UnsupportedType(String),

    #[error("image payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("empty image payload")]
    Empty,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Converts inline base64 image payloads into hosted URLs.
///
/// Each image lands as `{dir}/{uuid}.{ext}` and is served back under
/// `{public_base}/media/`. A failure here aborts the enclosing send before
/// anything is persisted.
pub struct MediaStore {
    dir: PathBuf,
    public_base: String,
}

impl MediaStore {
    pub async fn new(dir: PathBuf, public_base: String) -> std::io::Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Media storage directory: {}", dir.display());
        Ok(Self { dir, public_base })
    }

    pub async fn store_image(&self, payload: &str) -> Result<String, MediaError> {
        let (ext, data) = split_data_uri(payload)?;
        let bytes = B64.decode(data)?;
        if bytes.is_empty() {
            return Err(MediaError::Empty);
        }

        let filename = format!("{}.{}", Uuid::new_v4(), ext);
        fs::write(self.dir.join(&filename), &bytes).await?;

        Ok(format!("{}/media/{}", self.public_base, filename))
    }
}

/// Accepts `data:image/...;base64,...` URIs or a bare base64 string
/// (treated as PNG).
fn split_data_uri(payload: &str) -> Result<(&'static str, &str), MediaError> {
    let Some(rest) = payload.strip_prefix("data:") else {
        return Ok(("png", payload));
    };

    let (mime, data) = rest.split_once(";base64,").ok_or(MediaError::Malformed)?;
    let ext = match mime {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        other => return Err(MediaError::UnsupportedType(other.to_string())),
    };
    Ok((ext, data))
}
