//! Collaborators shared by every store instance.

use ddms_core::account::AccountDelegate;
use ddms_core::metadata::{SecretKeyMetaData, StoreMetaData, StoreMetaDataLocal};
use ddms_core::{GeneralError, MetaDataManager, StoreResult};
use ddms_device::DeviceRegistry;
use std::sync::Arc;
use tracing::warn;

/// Services a general store needs besides its engine.
#[derive(Clone)]
pub struct StoreContext {
    /// Metadata of stores and their keys.
    pub meta: Arc<MetaDataManager>,
    /// Device identity and classification.
    pub registry: Arc<DeviceRegistry>,
    /// Foreground users and the current account.
    pub account: Arc<dyn AccountDelegate>,
    /// Application id of the service itself.
    pub process_label: String,
    /// Runs after a cloud sync downloaded changes.
    pub on_cloud_change: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl StoreContext {
    /// Creates a context for the service `process_label`.
    pub fn new(
        meta: Arc<MetaDataManager>,
        registry: Arc<DeviceRegistry>,
        account: Arc<dyn AccountDelegate>,
        process_label: impl Into<String>,
    ) -> Self {
        Self {
            meta,
            registry,
            account,
            process_label: process_label.into(),
            on_cloud_change: None,
        }
    }

    /// Sets the hook run after a cloud sync downloaded changes.
    #[must_use]
    pub fn with_cloud_change_hook(mut self, hook: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.on_cloud_change = Some(hook);
        self
    }

    /// Returns true if `meta` is a store of the service itself.
    pub(crate) fn is_service_store(&self, meta: &StoreMetaData) -> bool {
        meta.app_id == self.process_label
    }

    pub(crate) fn is_public(&self, meta: &StoreMetaData) -> bool {
        self.meta
            .load_meta::<StoreMetaDataLocal>(&meta.key_local(), true)
            .is_some_and(|local| local.is_public)
    }

    /// Key material of an encrypted store; empty otherwise.
    pub(crate) fn password(&self, meta: &StoreMetaData) -> Vec<u8> {
        if !meta.is_encrypt {
            return Vec::new();
        }
        self.meta
            .load_meta::<SecretKeyMetaData>(&meta.secret_key(), true)
            .map(|secret| secret.s_key)
            .unwrap_or_default()
    }

    /// Cloud user of a sync: the requested one, else the store owner, else
    /// the first foreground user.
    pub(crate) fn cloud_user(&self, requested: i32, owner: i32) -> StoreResult<String> {
        if requested != 0 {
            return Ok(requested.to_string());
        }
        if owner != 0 {
            return Ok(owner.to_string());
        }
        self.account
            .foreground_users()
            .first()
            .map(i32::to_string)
            .ok_or_else(|| {
                warn!("no foreground user for cloud sync");
                GeneralError::NotInit
            })
    }
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("process_label", &self.process_label)
            .field("on_cloud_change", &self.on_cloud_change.is_some())
            .finish()
    }
}
