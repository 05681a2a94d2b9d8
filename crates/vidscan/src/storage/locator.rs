use async_trait::async_trait;
use thiserror::Error;

use crate::config::StorageConfig;
use crate::model::Video;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid storage key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Turns a video into a location the analysis engine can download.
#[async_trait]
pub trait VideoLocator: Send + Sync {
    async fn locate(&self, video: &Video) -> Result<String, StorageError>;
}

/// Joins a video's storage key onto a fixed base URL.
pub struct UrlVideoLocator {
    base_url: String,
}

impl UrlVideoLocator {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.base_url)
    }
}

fn validate_key(key: &str) -> Result<&str, StorageError> {
    let trimmed = key.trim_start_matches('/');
    let invalid = |reason: &str| StorageError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(invalid("key is empty"));
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err(invalid("key escapes the storage root"));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(invalid("key contains control characters"));
    }
    Ok(trimmed)
}

#[async_trait]
impl VideoLocator for UrlVideoLocator {
    async fn locate(&self, video: &Video) -> Result<String, StorageError> {
        let key = validate_key(&video.storage_key)?;
        Ok(format!("{}/{}", self.base_url, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_locate_joins_base_and_key() {
        let locator = UrlVideoLocator::new("http://minio:9000/videos/");
        let video = Video::new("clip", "/uploads/2024/clip.mp4");
        assert_eq!(
            locator.locate(&video).await.unwrap(),
            "http://minio:9000/videos/uploads/2024/clip.mp4"
        );
    }

    #[tokio::test]
    async fn test_locate_rejects_bad_keys() {
        let locator = UrlVideoLocator::new("http://minio:9000/videos");
        for key in ["", "/", "uploads/../secrets", "a\nb"] {
            let video = Video::new("clip", key);
            assert!(
                matches!(
                    locator.locate(&video).await,
                    Err(StorageError::InvalidKey { .. })
                ),
                "key {:?} should be rejected",
                key
            );
        }
    }
}
