use std::sync::Arc;

use nimbus_common::{
    validate, CoreError, CoreResult, InstanceState, Snapshot, SnapshotStatus, Volume,
    VolumeStatus,
};
use nimbus_providers::{BackendError, Backends};
use uuid::Uuid;

use crate::services::InstanceService;
use crate::store::Store;

pub const MAX_VOLUME_GB: i32 = 16 * 1024;

/// Block volumes and their snapshots. Every call is synchronous against the
/// storage backend; the record follows the backend's answer.
#[derive(Clone)]
pub struct VolumeService {
    store: Arc<dyn Store>,
    backends: Backends,
    instances: InstanceService,
}

impl VolumeService {
    pub fn new(instances: InstanceService) -> Self {
        Self {
            store: instances.store().clone(),
            backends: instances.backends().clone(),
            instances,
        }
    }

    pub async fn create(&self, name: &str, size_gb: i32) -> CoreResult<Volume> {
        validate::identifier("name", name)?;
        if !(1..=MAX_VOLUME_GB).contains(&size_gb) {
            return Err(CoreError::validation("size_gb", format!("must be between 1 and {MAX_VOLUME_GB}")));
        }
        let vol = self.store.insert_volume(name, size_gb).await?;
        let ctx = self.instances.call_context();
        match self.backends.storage.create_volume(&ctx, &backend_volume_name(vol.id), size_gb as u32).await {
            Ok(info) => {
                self.store.update_volume(vol.id, VolumeStatus::Available, Some(&info.path)).await?;
                tracing::info!(volume_id = %vol.id, path = %info.path, "volume created");
                self.get(vol.id).await
            }
            Err(e) => {
                tracing::error!(volume_id = %vol.id, error = %e, "volume creation failed");
                self.store.update_volume(vol.id, VolumeStatus::Error, None).await?;
                Err(e.into())
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<Volume> {
        self.store
            .get_volume(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("volume {id}")))
    }

    /// Attaches to a Running instance. Re-attaching to the same holder is a no-op.
    pub async fn attach(&self, id: Uuid, instance_id: Uuid) -> CoreResult<Volume> {
        let vol = self.get(id).await?;
        if vol.instance_id == Some(instance_id) {
            return Ok(vol);
        }
        if vol.instance_id.is_some() {
            return Err(CoreError::Conflict(format!("volume {id} is attached elsewhere")));
        }
        let path = match (vol.status, vol.backend_path.as_deref()) {
            (VolumeStatus::Available, Some(p)) => p.to_string(),
            _ => return Err(CoreError::Conflict(format!("volume {id} is not available"))),
        };
        let inst = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("instance {instance_id}")))?;
        let handle = match (inst.state, inst.backend_handle.as_deref()) {
            (InstanceState::Running, Some(h)) => h.to_string(),
            _ => return Err(CoreError::Conflict(format!("instance {instance_id} is not running"))),
        };

        if !self.store.attach_volume(id, instance_id).await? {
            return Err(CoreError::Conflict(format!("volume {id} is attached elsewhere")));
        }
        let ctx = self.instances.call_context();
        let holder = instance_id.to_string();
        let mut attached = self.backends.storage.attach_volume(&ctx, &path, &holder).await;
        if attached.is_ok() {
            attached = self.backends.compute.attach_volume(&ctx, &handle, &path).await;
            if attached.is_err() {
                let _ = self.backends.storage.detach_volume(&ctx, &path, &holder).await;
            }
        }
        if let Err(e) = attached {
            self.store.detach_volume(id).await?;
            return Err(e.into());
        }
        tracing::info!(volume_id = %id, instance_id = %instance_id, "volume attached");
        self.get(id).await
    }

    pub async fn detach(&self, id: Uuid) -> CoreResult<Volume> {
        let vol = self.get(id).await?;
        let Some(instance_id) = vol.instance_id else {
            return Ok(vol);
        };
        if let Some(path) = vol.backend_path.as_deref() {
            let ctx = self.instances.call_context();
            let inst = self.store.get_instance(instance_id).await?;
            if let Some(handle) = inst.and_then(|i| i.backend_handle) {
                match self.backends.compute.detach_volume(&ctx, &handle, path).await {
                    Ok(()) | Err(BackendError::Unsupported(_)) | Err(BackendError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.backends.storage.detach_volume(&ctx, path, &instance_id.to_string()).await?;
        }
        self.store.detach_volume(id).await?;
        tracing::info!(volume_id = %id, instance_id = %instance_id, "volume detached");
        self.get(id).await
    }

    pub async fn delete(&self, id: Uuid) -> CoreResult<()> {
        let vol = self.get(id).await?;
        if vol.instance_id.is_some() {
            return Err(CoreError::Conflict(format!("volume {id} is attached")));
        }
        self.store.update_volume(id, VolumeStatus::Deleting, None).await?;
        if let Some(path) = vol.backend_path.as_deref() {
            let ctx = self.instances.call_context();
            if let Err(e) = self.backends.storage.delete_volume(&ctx, path).await {
                self.store.update_volume(id, vol.status, None).await?;
                return Err(e.into());
            }
        }
        self.store.delete_volume(id).await?;
        tracing::info!(volume_id = %id, "volume deleted");
        Ok(())
    }

    pub async fn snapshot(&self, volume_id: Uuid, name: &str) -> CoreResult<Snapshot> {
        validate::identifier("name", name)?;
        let vol = self.get(volume_id).await?;
        let Some(path) = vol.backend_path.clone() else {
            return Err(CoreError::Conflict(format!("volume {volume_id} has no backing storage")));
        };
        let snap = self.store.insert_snapshot(volume_id, name).await?;
        let ctx = self.instances.call_context();
        match self.backends.storage.snapshot_volume(&ctx, &path, &backend_snapshot_name(snap.id)).await {
            Ok(info) => {
                self.store.update_snapshot(snap.id, SnapshotStatus::Available, Some(&info.path)).await?;
                tracing::info!(volume_id = %volume_id, snapshot_id = %snap.id, "snapshot taken");
            }
            Err(e) => {
                self.store.update_snapshot(snap.id, SnapshotStatus::Error, None).await?;
                return Err(e.into());
            }
        }
        self.store
            .get_snapshot(snap.id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("snapshot {}", snap.id)))
    }

    /// Restores an Available snapshot into a new volume of the source's size.
    pub async fn restore(&self, snapshot_id: Uuid, volume_name: &str) -> CoreResult<Volume> {
        validate::identifier("name", volume_name)?;
        let snap = self
            .store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("snapshot {snapshot_id}")))?;
        let path = match (snap.status, snap.backend_path.as_deref()) {
            (SnapshotStatus::Available, Some(p)) => p.to_string(),
            _ => return Err(CoreError::Conflict(format!("snapshot {snapshot_id} is not available"))),
        };
        let size_gb = match self.store.get_volume(snap.volume_id).await? {
            Some(v) => v.size_gb,
            None => 1,
        };
        let vol = self.store.insert_volume(volume_name, size_gb).await?;
        let ctx = self.instances.call_context();
        match self.backends.storage.restore_snapshot(&ctx, &path, &backend_volume_name(vol.id)).await {
            Ok(info) => {
                self.store.update_volume(vol.id, VolumeStatus::Available, Some(&info.path)).await?;
                tracing::info!(snapshot_id = %snapshot_id, volume_id = %vol.id, "snapshot restored");
                self.get(vol.id).await
            }
            Err(e) => {
                self.store.update_volume(vol.id, VolumeStatus::Error, None).await?;
                Err(e.into())
            }
        }
    }
}

pub fn backend_volume_name(id: Uuid) -> String {
    format!("vol-{}", id.simple())
}

pub fn backend_snapshot_name(id: Uuid) -> String {
    format!("snap-{}", id.simple())
}
