//! Local storage adapter. Buckets are directories with a JSON sidecar per
//! object; volumes are qcow2 files managed with `qemu-img`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::check_identifier;
use crate::inventory::{ObjectMeta, VolumeInfo};
use crate::runner::CommandRunner;
use crate::{BackendError, BackendResult, CallContext, StorageBackend};

#[derive(Debug, Default, Serialize, Deserialize)]
struct BucketConfig {
    versioning: bool,
}

pub struct LocalStorage {
    root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            root: root.into(),
            runner,
        }
    }

    fn bucket_dir(&self, bucket: &str) -> BackendResult<PathBuf> {
        check_identifier("bucket", bucket)?;
        Ok(self.root.join("buckets").join(bucket))
    }

    fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// Keys may contain '/', so objects are stored under the hex of the key.
    fn object_paths(dir: &Path, key: &str) -> (PathBuf, PathBuf) {
        let encoded = hex::encode(key.as_bytes());
        (
            dir.join("objects").join(&encoded),
            dir.join("objects").join(format!("{encoded}.meta")),
        )
    }

    async fn ensure_bucket(&self, bucket: &str) -> BackendResult<PathBuf> {
        let dir = self.bucket_dir(bucket)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Err(BackendError::NotFound(format!("bucket {bucket}")));
        }
        Ok(dir)
    }

    async fn bucket_config(dir: &Path) -> BackendResult<BucketConfig> {
        match tokio::fs::read(dir.join("bucket.json")).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| BackendError::Rejected(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BucketConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_meta(path: &Path, key: &str) -> BackendResult<ObjectMeta> {
        let raw = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BackendError::NotFound(key.to_string()),
            _ => e.into(),
        })?;
        serde_json::from_slice(&raw).map_err(|e| BackendError::Rejected(e.to_string()))
    }

    fn volume_path(&self, name: &str) -> BackendResult<PathBuf> {
        check_identifier("volume", name)?;
        Ok(self.volumes_dir().join(format!("{name}.qcow2")))
    }

    /// Only paths under the managed volume directory are accepted.
    fn managed_path(&self, path: &str) -> BackendResult<PathBuf> {
        let p = PathBuf::from(path);
        let name = p
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| BackendError::NotFound(path.to_string()))?;
        let expected = self.volume_path(name)?;
        if expected != p {
            return Err(BackendError::InvalidIdentifier {
                field: "path".into(),
                value: path.to_string(),
            });
        }
        Ok(p)
    }

    fn marker(path: &Path) -> PathBuf {
        path.with_extension("attached")
    }

    async fn qemu_img(&self, ctx: &CallContext, args: &[&str]) -> BackendResult<()> {
        self.runner.run(ctx, "qemu-img", args).await?.check("qemu-img")?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn ping(&self, _ctx: &CallContext) -> BackendResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn create_bucket(&self, _ctx: &CallContext, bucket: &str) -> BackendResult<()> {
        let dir = self.bucket_dir(bucket)?;
        tokio::fs::create_dir_all(dir.join("objects")).await?;
        tokio::fs::create_dir_all(dir.join("versions")).await?;
        info!(bucket, "bucket created");
        Ok(())
    }

    async fn set_versioning(&self, _ctx: &CallContext, bucket: &str, enabled: bool) -> BackendResult<()> {
        let dir = self.ensure_bucket(bucket).await?;
        let cfg = serde_json::to_vec(&BucketConfig { versioning: enabled })
            .map_err(|e| BackendError::Rejected(e.to_string()))?;
        tokio::fs::write(dir.join("bucket.json"), cfg).await?;
        Ok(())
    }

    async fn put_object(&self, _ctx: &CallContext, bucket: &str, key: &str, data: Bytes) -> BackendResult<ObjectMeta> {
        if key.is_empty() {
            return Err(BackendError::Rejected("object key is empty".into()));
        }
        let dir = self.ensure_bucket(bucket).await?;
        let cfg = Self::bucket_config(&dir).await?;
        let (data_path, meta_path) = Self::object_paths(&dir, key);

        let previous = Self::read_meta(&meta_path, key).await.ok();
        if let (true, Some(prev)) = (cfg.versioning, &previous) {
            let archived = dir
                .join("versions")
                .join(format!("{}.{}", hex::encode(key.as_bytes()), prev.version));
            tokio::fs::rename(&data_path, &archived).await?;
        }

        let meta = ObjectMeta {
            key: key.to_string(),
            size: data.len() as u64,
            etag: hex::encode(Sha256::digest(&data)),
            version: previous.map(|p| p.version + 1).unwrap_or(1),
        };
        tokio::fs::write(&data_path, &data).await?;
        let raw = serde_json::to_vec(&meta).map_err(|e| BackendError::Rejected(e.to_string()))?;
        tokio::fs::write(&meta_path, raw).await?;
        debug!(bucket, key, version = meta.version, "object stored");
        Ok(meta)
    }

    async fn get_object(&self, _ctx: &CallContext, bucket: &str, key: &str) -> BackendResult<Bytes> {
        let dir = self.ensure_bucket(bucket).await?;
        let (data_path, _) = Self::object_paths(&dir, key);
        match tokio::fs::read(&data_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackendError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn head_object(&self, _ctx: &CallContext, bucket: &str, key: &str) -> BackendResult<ObjectMeta> {
        let dir = self.ensure_bucket(bucket).await?;
        let (_, meta_path) = Self::object_paths(&dir, key);
        Self::read_meta(&meta_path, key).await
    }

    async fn delete_object(&self, _ctx: &CallContext, bucket: &str, key: &str) -> BackendResult<()> {
        let dir = self.ensure_bucket(bucket).await?;
        let (data_path, meta_path) = Self::object_paths(&dir, key);
        for p in [data_path, meta_path] {
            match tokio::fs::remove_file(&p).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn list_objects(&self, _ctx: &CallContext, bucket: &str, prefix: &str) -> BackendResult<Vec<ObjectMeta>> {
        let dir = self.ensure_bucket(bucket).await?;
        let mut entries = tokio::fs::read_dir(dir.join("objects")).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let meta = Self::read_meta(&path, "").await?;
            if meta.key.starts_with(prefix) {
                out.push(meta);
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn create_volume(&self, ctx: &CallContext, name: &str, size_gb: u32) -> BackendResult<VolumeInfo> {
        let path = self.volume_path(name)?;
        tokio::fs::create_dir_all(self.volumes_dir()).await?;
        let p = path.display().to_string();
        let size = format!("{size_gb}G");
        self.qemu_img(ctx, &["create", "-f", "qcow2", &p, &size]).await?;
        info!(volume = name, size_gb, "volume created");
        Ok(VolumeInfo { path: p, size_gb })
    }

    async fn delete_volume(&self, _ctx: &CallContext, path: &str) -> BackendResult<()> {
        let p = self.managed_path(path)?;
        if tokio::fs::try_exists(Self::marker(&p)).await? {
            return Err(BackendError::Rejected(format!("{path} is attached")));
        }
        match tokio::fs::remove_file(&p).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn snapshot_volume(&self, ctx: &CallContext, path: &str, snapshot_name: &str) -> BackendResult<VolumeInfo> {
        let src = self.managed_path(path)?;
        let dst = self.volume_path(snapshot_name)?;
        let (s, d) = (src.display().to_string(), dst.display().to_string());
        self.qemu_img(ctx, &["convert", "-O", "qcow2", &s, &d]).await?;
        Ok(VolumeInfo { path: d, size_gb: 0 })
    }

    async fn restore_snapshot(&self, ctx: &CallContext, snapshot_path: &str, volume_name: &str) -> BackendResult<VolumeInfo> {
        let src = self.managed_path(snapshot_path)?;
        let dst = self.volume_path(volume_name)?;
        let (s, d) = (src.display().to_string(), dst.display().to_string());
        self.qemu_img(ctx, &["convert", "-O", "qcow2", &s, &d]).await?;
        Ok(VolumeInfo { path: d, size_gb: 0 })
    }

    async fn attach_volume(&self, _ctx: &CallContext, path: &str, holder: &str) -> BackendResult<()> {
        let p = self.managed_path(path)?;
        let marker = Self::marker(&p);
        match tokio::fs::read_to_string(&marker).await {
            Ok(current) if current.trim() == holder => return Ok(()),
            Ok(current) => {
                return Err(BackendError::Rejected(format!("{path} already attached to {}", current.trim())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::write(&marker, holder).await?;
        Ok(())
    }

    async fn detach_volume(&self, _ctx: &CallContext, path: &str, holder: &str) -> BackendResult<()> {
        let p = self.managed_path(path)?;
        let marker = Self::marker(&p);
        match tokio::fs::read_to_string(&marker).await {
            Ok(current) if current.trim() != holder => Err(BackendError::Rejected(format!(
                "{path} is attached to {}",
                current.trim()
            ))),
            Ok(_) => Ok(tokio::fs::remove_file(&marker).await?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use std::time::Duration;

    struct Touch;

    #[async_trait]
    impl CommandRunner for Touch {
        async fn run(&self, _ctx: &CallContext, _program: &str, args: &[&str]) -> BackendResult<crate::runner::CommandOutput> {
            // Last path-looking argument is the output file.
            if let Some(out) = args.iter().rev().find(|a| a.ends_with(".qcow2")) {
                std::fs::write(out, b"qcow")?;
            }
            Ok(CommandOutput::ok(""))
        }
    }

    fn ctx() -> CallContext {
        CallContext::with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn objects_are_versioned() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStorage::new(dir.path(), Arc::new(Touch));
        store.create_bucket(&ctx(), "media").await.unwrap();
        store.set_versioning(&ctx(), "media", true).await.unwrap();

        let v1 = store.put_object(&ctx(), "media", "a/b.txt", Bytes::from_static(b"one")).await.unwrap();
        let v2 = store.put_object(&ctx(), "media", "a/b.txt", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));
        assert_ne!(v1.etag, v2.etag);
        assert_eq!(store.get_object(&ctx(), "media", "a/b.txt").await.unwrap(), Bytes::from_static(b"two"));

        let listed = store.list_objects(&ctx(), "media", "a/").await.unwrap();
        assert_eq!(listed.len(), 1);
        store.delete_object(&ctx(), "media", "a/b.txt").await.unwrap();
        assert!(matches!(
            store.head_object(&ctx(), "media", "a/b.txt").await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn volume_has_single_holder() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStorage::new(dir.path(), Arc::new(Touch));
        let vol = store.create_volume(&ctx(), "data1", 5).await.unwrap();

        store.attach_volume(&ctx(), &vol.path, "vm-a").await.unwrap();
        store.attach_volume(&ctx(), &vol.path, "vm-a").await.unwrap();
        assert!(matches!(
            store.attach_volume(&ctx(), &vol.path, "vm-b").await,
            Err(BackendError::Rejected(_))
        ));
        assert!(store.delete_volume(&ctx(), &vol.path).await.is_err());

        store.detach_volume(&ctx(), &vol.path, "vm-a").await.unwrap();
        let snap = store.snapshot_volume(&ctx(), &vol.path, "data1-snap").await.unwrap();
        let restored = store.restore_snapshot(&ctx(), &snap.path, "data2").await.unwrap();
        assert!(restored.path.ends_with("data2.qcow2"));
        store.delete_volume(&ctx(), &vol.path).await.unwrap();
        store.delete_volume(&ctx(), &vol.path).await.unwrap();
    }

    #[tokio::test]
    async fn unmanaged_paths_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStorage::new(dir.path(), Arc::new(Touch));
        assert!(matches!(
            store.delete_volume(&ctx(), "/etc/passwd").await,
            Err(BackendError::InvalidIdentifier { .. })
        ));
    }
}
