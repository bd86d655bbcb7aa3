//! File storage providers for uploaded report files.
//!
//! The service only needs two operations from its storage provider: put a
//! file somewhere the analysis client can fetch it from, and release it by
//! handle when the report is deleted.

use std::path::PathBuf;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use rand::RngCore;
use tracing::info;

/// Outcome of storing an uploaded file.
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Name the file was stored under.
    pub file_name: String,
    /// Location the analysis client fetches bytes from (URL or local path).
    pub url: String,
    /// Provider handle used for deletion, when the provider issues one.
    pub storage_id: Option<String>,
}

#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn store(
        &self,
        original_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> anyhow::Result<StoredFile>;

    async fn delete(&self, storage_id: &str) -> anyhow::Result<()>;
}

/// Stores uploads in a local directory. The default when no external
/// provider is configured; the analysis client reads these paths straight
/// from disk.
pub struct LocalFileStorage {
    base_dir: PathBuf,
}

impl LocalFileStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn store(
        &self,
        original_name: &str,
        _content_type: &str,
        bytes: Vec<u8>,
    ) -> anyhow::Result<StoredFile> {
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let file_name = unique_file_name(original_name);
        let path = self.base_dir.join(&file_name);
        tokio::fs::write(&path, bytes).await?;

        info!("Stored upload at {}", path.display());
        Ok(StoredFile {
            url: path.to_string_lossy().into_owned(),
            storage_id: Some(file_name.clone()),
            file_name,
        })
    }

    async fn delete(&self, storage_id: &str) -> anyhow::Result<()> {
        let path = self.base_dir.join(storage_id);
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }
}

/// URL-addressable storage provider: multipart upload, deletion by id.
pub struct HttpFileStorage {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpFileStorage {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FileStorage for HttpFileStorage {
    async fn store(
        &self,
        original_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> anyhow::Result<StoredFile> {
        let file_name = unique_file_name(original_name);
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str(content_type)?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{}/upload", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("storage upload failed: {}", response.status()));
        }

        let body: serde_json::Value = response.json().await?;
        let url = body["url"]
            .as_str()
            .ok_or_else(|| anyhow!("storage provider returned no url"))?
            .to_string();
        let storage_id = body["id"].as_str().map(str::to_string);

        info!("Stored upload at {}", url);
        Ok(StoredFile {
            file_name,
            url,
            storage_id,
        })
    }

    async fn delete(&self, storage_id: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .delete(format!("{}/files/{}", self.base_url, storage_id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("storage delete failed: {}", response.status()));
        }
        Ok(())
    }
}

/// `{timestamp}_{random}{ext}`: unique enough per provider folder, and the
/// extension survives for content-type sniffing on the way back out.
fn unique_file_name(original_name: &str) -> String {
    let extension = std::path::Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default();

    let mut suffix = [0u8; 6];
    rand::rng().fill_bytes(&mut suffix);

    format!(
        "{}_{}{}",
        Utc::now().timestamp_millis(),
        hex::encode(suffix),
        extension
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names_keep_the_extension() {
        let name = unique_file_name("Blood Report.PDF");
        assert!(name.ends_with(".pdf"));
        assert!(name.contains('_'));
    }

    #[test]
    fn unique_names_do_not_collide() {
        let a = unique_file_name("report.png");
        let b = unique_file_name("report.png");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn local_storage_roundtrip() {
        let dir = std::env::temp_dir().join("healthmate-files-test");
        let storage = LocalFileStorage::new(&dir);

        let stored = storage
            .store("report.pdf", "application/pdf", b"%PDF-1.4".to_vec())
            .await
            .unwrap();
        let bytes = tokio::fs::read(&stored.url).await.unwrap();
        assert_eq!(bytes, b"%PDF-1.4");

        storage
            .delete(stored.storage_id.as_deref().unwrap())
            .await
            .unwrap();
        assert!(tokio::fs::read(&stored.url).await.is_err());
    }
}
