//! Per-artifact checkpoints so a job can resume after a crash.
//!
//! Checkpoints live under `temp/jobs/{job_id}/` in either a local directory or
//! a Bunny storage zone. Every operation is best-effort: the orchestrator logs
//! failures and carries on.

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::CheckpointConfig;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Ifc,
    Dwg,
    Obj,
    Rvt,
    Preview,
}

impl ArtifactKind {
    pub fn all() -> [ArtifactKind; 5] {
        [
            ArtifactKind::Ifc,
            ArtifactKind::Dwg,
            ArtifactKind::Obj,
            ArtifactKind::Rvt,
            ArtifactKind::Preview,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Ifc => "ifc",
            ArtifactKind::Dwg => "dwg",
            ArtifactKind::Obj => "obj",
            ArtifactKind::Rvt => "rvt",
            ArtifactKind::Preview => "preview",
        }
    }

    pub fn checkpoint_filename(&self) -> &'static str {
        match self {
            ArtifactKind::Ifc => "checkpoint_ifc.ifc",
            ArtifactKind::Dwg => "checkpoint_dwg.dwg",
            ArtifactKind::Obj => "checkpoint_obj.obj",
            ArtifactKind::Rvt => "checkpoint_rvt.rvt.ifc",
            ArtifactKind::Preview => "checkpoint_preview.png",
        }
    }
}

/// Local files recovered from earlier attempts, keyed by artifact
pub type CheckpointMap = BTreeMap<ArtifactKind, PathBuf>;

/// `temp/jobs/{job_id}/{checkpoint file}`
pub fn checkpoint_remote_path(job_id: &str, kind: ArtifactKind) -> String {
    format!("temp/jobs/{}/{}", job_id, kind.checkpoint_filename())
}

/// Bunny edge storage zone with a pull-zone CDN in front of it
#[derive(Debug, Clone)]
pub struct BunnyStorage {
    zone: String,
    region: String,
    access_key: String,
    cdn_host: String,
    client: Client,
}

impl BunnyStorage {
    pub fn new(zone: &str, region: &str, access_key: &str, cdn_host: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            zone: zone.to_string(),
            region: region.trim_end_matches('/').to_string(),
            access_key: access_key.to_string(),
            cdn_host: cdn_host.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn storage_url(&self, remote_path: &str) -> String {
        format!("https://{}/{}/{}", self.region, self.zone, remote_path)
    }

    pub fn cdn_url(&self, remote_path: &str) -> String {
        format!("https://{}/{}", self.cdn_host, remote_path)
    }

    /// PUT the file and return its CDN URL
    pub async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<String> {
        let bytes = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read {}", local_path.display()))?;
        let response = self
            .client
            .put(self.storage_url(remote_path))
            .header("AccessKey", &self.access_key)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != 200 && status.as_u16() != 201 {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Bunny upload failed: {} - {}", status, text));
        }
        Ok(self.cdn_url(remote_path))
    }

    /// GET from the CDN into `local_path`
    pub async fn download(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let response = self.client.get(self.cdn_url(remote_path)).send().await?;
        let response = response.error_for_status()?;
        let bytes = response.bytes().await?;
        write_file(local_path, &bytes).await
    }

    pub async fn delete(&self, remote_path: &str) -> Result<bool> {
        let response = self
            .client
            .delete(self.storage_url(remote_path))
            .header("AccessKey", &self.access_key)
            .send()
            .await?;
        Ok(matches!(response.status().as_u16(), 200 | 204))
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    let tmp = path.with_file_name(name);
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move file into {}", path.display()))?;
    Ok(())
}

/// Where checkpoints go
#[derive(Debug, Clone, Default)]
pub enum CheckpointStore {
    #[default]
    Disabled,
    LocalDir(PathBuf),
    Bunny(BunnyStorage),
}

impl CheckpointStore {
    /// Bunny when fully configured, then a local directory, else disabled
    pub fn from_config(config: &CheckpointConfig) -> Self {
        match (
            &config.bunny_storage_zone,
            &config.bunny_storage_region,
            &config.bunny_access_key,
            &config.bunny_cdn_host,
        ) {
            (Some(zone), Some(region), Some(key), Some(host)) => {
                CheckpointStore::Bunny(BunnyStorage::new(zone, region, key, host))
            }
            _ => match &config.local_dir {
                Some(dir) => CheckpointStore::LocalDir(dir.clone()),
                None => CheckpointStore::Disabled,
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, CheckpointStore::Disabled)
    }

    /// Upload `local_path` as the `kind` checkpoint of `job_id`.
    /// Returns the URL, or None when the store is disabled or the file is missing.
    pub async fn upload_checkpoint(
        &self,
        local_path: &Path,
        job_id: &str,
        kind: ArtifactKind,
    ) -> Result<Option<String>, PipelineError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        if !local_path.exists() {
            warn!("Checkpoint file does not exist: {}", local_path.display());
            return Ok(None);
        }

        let remote = checkpoint_remote_path(job_id, kind);
        let result = match self {
            CheckpointStore::Disabled => return Ok(None),
            CheckpointStore::LocalDir(root) => {
                let dest = root.join(&remote);
                match tokio::fs::read(local_path).await {
                    Ok(bytes) => write_file(&dest, &bytes)
                        .await
                        .map(|_| format!("file://{}", dest.display())),
                    Err(e) => Err(anyhow!("Failed to read {}: {}", local_path.display(), e)),
                }
            }
            CheckpointStore::Bunny(bunny) => bunny.upload(local_path, &remote).await,
        };

        match result {
            Ok(url) => {
                info!("Checkpoint uploaded: {} -> {}", kind.as_str(), url);
                Ok(Some(url))
            }
            Err(e) => {
                error!("Failed to upload checkpoint {}: {:#}", kind.as_str(), e);
                Err(PipelineError::CheckpointIoFailed(format!("{}: {:#}", kind.as_str(), e)))
            }
        }
    }

    /// Fetch the `kind` checkpoint of `job_id` into `local_path`
    pub async fn download_checkpoint(&self, job_id: &str, kind: ArtifactKind, local_path: &Path) -> bool {
        let remote = checkpoint_remote_path(job_id, kind);
        let result = match self {
            CheckpointStore::Disabled => return false,
            CheckpointStore::LocalDir(root) => {
                let source = root.join(&remote);
                match tokio::fs::read(&source).await {
                    Ok(bytes) => write_file(local_path, &bytes).await,
                    Err(e) => Err(anyhow!("Failed to read {}: {}", source.display(), e)),
                }
            }
            CheckpointStore::Bunny(bunny) => bunny.download(&remote, local_path).await,
        };
        match result {
            Ok(()) => {
                debug!("Checkpoint {} restored to {}", kind.as_str(), local_path.display());
                true
            }
            Err(e) => {
                debug!("No {} checkpoint for {}: {:#}", kind.as_str(), job_id, e);
                false
            }
        }
    }

    /// Download every available checkpoint of `job_id` into `dir`
    pub async fn restore_all(&self, job_id: &str, dir: &Path) -> CheckpointMap {
        let mut map = CheckpointMap::new();
        if !self.is_enabled() {
            return map;
        }
        for kind in ArtifactKind::all() {
            let local = dir.join(kind.checkpoint_filename());
            if self.download_checkpoint(job_id, kind, &local).await {
                map.insert(kind, local);
            }
        }
        map
    }

    /// Remove a stored object by its remote path
    pub async fn delete_remote(&self, remote_path: &str) -> bool {
        match self {
            CheckpointStore::Disabled => false,
            CheckpointStore::LocalDir(root) => tokio::fs::remove_file(root.join(remote_path)).await.is_ok(),
            CheckpointStore::Bunny(bunny) => match bunny.delete(remote_path).await {
                Ok(deleted) => deleted,
                Err(e) => {
                    warn!("Bunny delete of {} failed: {:#}", remote_path, e);
                    false
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sketch2bim_ckpt_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_remote_paths() {
        assert_eq!(checkpoint_remote_path("abc", ArtifactKind::Ifc), "temp/jobs/abc/checkpoint_ifc.ifc");
        assert_eq!(
            checkpoint_remote_path("abc", ArtifactKind::Rvt),
            "temp/jobs/abc/checkpoint_rvt.rvt.ifc"
        );
        assert_eq!(ArtifactKind::Preview.checkpoint_filename(), "checkpoint_preview.png");
        assert_eq!(serde_json::to_string(&ArtifactKind::Dwg).unwrap(), "\"dwg\"");
    }

    #[test]
    fn test_bunny_urls() {
        let bunny = BunnyStorage::new("zone", "storage.bunnycdn.com/", "key", "cdn.example.com");
        let remote = checkpoint_remote_path("j1", ArtifactKind::Obj);
        assert_eq!(
            bunny.storage_url(&remote),
            "https://storage.bunnycdn.com/zone/temp/jobs/j1/checkpoint_obj.obj"
        );
        assert_eq!(bunny.cdn_url(&remote), "https://cdn.example.com/temp/jobs/j1/checkpoint_obj.obj");
    }

    #[test]
    fn test_store_selection() {
        let mut config = CheckpointConfig::default();
        assert!(matches!(CheckpointStore::from_config(&config), CheckpointStore::Disabled));

        config.local_dir = Some(PathBuf::from("/tmp/ckpt"));
        assert!(matches!(CheckpointStore::from_config(&config), CheckpointStore::LocalDir(_)));

        // partial Bunny settings fall back to the local directory
        config.bunny_storage_zone = Some("zone".into());
        assert!(matches!(CheckpointStore::from_config(&config), CheckpointStore::LocalDir(_)));

        config.bunny_storage_region = Some("storage.bunnycdn.com".into());
        config.bunny_access_key = Some("key".into());
        config.bunny_cdn_host = Some("cdn.example.com".into());
        assert!(matches!(CheckpointStore::from_config(&config), CheckpointStore::Bunny(_)));
    }

    #[tokio::test]
    async fn test_disabled_store_is_inert() {
        let store = CheckpointStore::Disabled;
        let url = store
            .upload_checkpoint(Path::new("/nonexistent"), "job", ArtifactKind::Ifc)
            .await
            .unwrap();
        assert!(url.is_none());
        assert!(!store.download_checkpoint("job", ArtifactKind::Ifc, Path::new("/tmp/x")).await);
        assert!(!store.delete_remote("temp/jobs/job/checkpoint_ifc.ifc").await);
    }

    #[tokio::test]
    async fn test_local_round_trip() {
        let root = temp_dir();
        let work = temp_dir();
        let store = CheckpointStore::LocalDir(root.clone());

        let artifact = work.join("job.ifc");
        std::fs::write(&artifact, b"ISO-10303-21;").unwrap();
        let url = store
            .upload_checkpoint(&artifact, "job9", ArtifactKind::Ifc)
            .await
            .unwrap()
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("temp/jobs/job9/checkpoint_ifc.ifc"));

        let restored_dir = work.join("restore");
        let map = store.restore_all("job9", &restored_dir).await;
        assert_eq!(map.len(), 1);
        let restored = &map[&ArtifactKind::Ifc];
        assert_eq!(std::fs::read(restored).unwrap(), b"ISO-10303-21;");

        // missing source file is not an error
        let none = store
            .upload_checkpoint(&work.join("missing.obj"), "job9", ArtifactKind::Obj)
            .await
            .unwrap();
        assert!(none.is_none());

        assert!(store.delete_remote(&checkpoint_remote_path("job9", ArtifactKind::Ifc)).await);
        assert!(!store.download_checkpoint("job9", ArtifactKind::Ifc, &work.join("again.ifc")).await);

        std::fs::remove_dir_all(&root).ok();
        std::fs::remove_dir_all(&work).ok();
    }
}
