//! Model file download with per-file progress and a local cache.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::pipeline::{FileEvent, FileProgress};
use crate::consts::default_model_cache_dir;
use crate::error::BridgeError;

/// One file of a model repository.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFile {
    /// Path relative to the repository root, e.g. `model.safetensors`.
    pub name: String,
    /// Expected lowercase hex SHA-256, when known.
    pub sha256: Option<String>,
}

impl ModelFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sha256: None,
        }
    }

    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into().to_lowercase());
        self
    }
}

/// Downloads model files into a cache directory, skipping files already there.
pub struct ModelFetcher {
    client: reqwest::Client,
    base_url: String,
    cache_dir: PathBuf,
    token: Option<String>,
}

impl ModelFetcher {
    pub fn new(base_url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            cache_dir: cache_dir.into(),
            token: None,
        }
    }

    /// Send `token` as a bearer credential (gated Hugging Face repositories).
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Fetcher for a Hugging Face model repository, cached under the user cache dir.
    pub fn hugging_face(model_id: &str) -> Self {
        Self::new(
            format!("https://huggingface.co/{model_id}/resolve/main"),
            default_model_cache_dir().join(model_id.replace('/', "--")),
        )
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn path_for(&self, file: &ModelFile) -> PathBuf {
        self.cache_dir.join(&file.name)
    }

    fn url_for(&self, file: &ModelFile) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), file.name)
    }

    /// Fetch every file in order, stopping at the first failure.
    pub async fn fetch_all(
        &self,
        files: &[ModelFile],
        progress: FileProgress<'_>,
    ) -> Result<Vec<PathBuf>, BridgeError> {
        let mut paths = Vec::with_capacity(files.len());
        for file in files {
            paths.push(self.fetch(file, progress).await?);
        }
        Ok(paths)
    }

    /// Fetch one file, reporting initiate / progress / done.
    pub async fn fetch(&self, file: &ModelFile, progress: FileProgress<'_>) -> Result<PathBuf, BridgeError> {
        let name = file.name.clone();
        progress(FileEvent::Initiate { file: name.clone() });

        let path = self.path_for(file);
        if self.is_cached(file, &path).await? {
            debug!(file = %name, "model file cached");
            progress(FileEvent::Progress { file: name.clone(), progress: 100.0 });
            progress(FileEvent::Done { file: name });
            return Ok(path);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = self.url_for(file);
        info!(%url, "downloading model file");
        let mut req = self.client.get(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(BridgeError::BackendFault(format!(
                "failed to fetch {name}: HTTP {}",
                resp.status()
            )));
        }

        let total = resp.content_length().filter(|len| *len > 0);
        let partial = partial_path(&path);
        let mut out = tokio::fs::File::create(&partial).await?;
        let mut hasher = Sha256::new();
        let mut received: u64 = 0;

        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            hasher.update(&chunk);
            received += chunk.len() as u64;
            if let Some(total) = total {
                progress(FileEvent::Progress {
                    file: name.clone(),
                    progress: received as f64 / total as f64 * 100.0,
                });
            }
        }
        out.flush().await?;
        drop(out);

        let digest = hex::encode(hasher.finalize());
        if let Some(expected) = &file.sha256
            && *expected != digest
        {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(BridgeError::BackendFault(format!(
                "checksum mismatch for {name}: expected {expected}, got {digest}"
            )));
        }

        tokio::fs::rename(&partial, &path).await?;
        if total.is_none() {
            progress(FileEvent::Progress { file: name.clone(), progress: 100.0 });
        }
        progress(FileEvent::Done { file: name });
        Ok(path)
    }

    async fn is_cached(&self, file: &ModelFile, path: &Path) -> Result<bool, BridgeError> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(false);
        }
        let Some(expected) = &file.sha256 else {
            return Ok(true);
        };
        let bytes = tokio::fs::read(path).await?;
        let digest = hex::encode(Sha256::digest(&bytes));
        if digest != *expected {
            warn!(file = %file.name, "cached model file is corrupt, refetching");
            return Ok(false);
        }
        Ok(true)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/cache/onnx/model.onnx")),
            PathBuf::from("/cache/onnx/model.onnx.part")
        );
    }

    #[test]
    fn hugging_face_layout() {
        let fetcher = ModelFetcher::hugging_face("unsloth/gemma-3-270m-it");
        assert!(fetcher.cache_dir().ends_with("unsloth--gemma-3-270m-it"));
        assert_eq!(
            fetcher.url_for(&ModelFile::new("tokenizer.json")),
            "https://huggingface.co/unsloth/gemma-3-270m-it/resolve/main/tokenizer.json"
        );
    }

    #[test]
    fn digests_are_lowercased() {
        let file = ModelFile::new("a").with_sha256("ABCDEF");
        assert_eq!(file.sha256.as_deref(), Some("abcdef"));
    }
}
