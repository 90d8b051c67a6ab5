//! Thread-safe mapping from binding key to [`DeviceBinding`] plus its
//! transient upgrade flags. Grounded on the discovery scanner's
//! `Arc<RwLock<HashMap<String, Device>>>` + broadcast-event shape, adapted
//! to the per-binding mutual-exclusion flags the OTA engine needs.

use std::collections::HashMap;
use std::sync::Arc;

use agent_core::{BindingState, DeviceBinding};
use tokio::sync::{broadcast, RwLock};
use tracing::info;

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub binding: DeviceBinding,
    pub state: BindingState,
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(DeviceBinding),
    Updated(DeviceBinding),
    Removed(DeviceBinding),
}

pub struct DeviceRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Populate the registry from the fleet bootstrap response. Registered
    /// devices are keyed by their server-issued device id; custom devices
    /// are keyed by `directory + "/" + entryName` — the same derivation
    /// used for `agentDeviceAdd`.
    pub async fn bootstrap(&self, bindings: Vec<DeviceBinding>) {
        let mut entries = self.entries.write().await;
        for binding in bindings {
            info!(key = %binding.key, "bootstrapped device binding");
            entries.insert(
                binding.key.clone(),
                RegistryEntry {
                    binding,
                    state: BindingState::default(),
                },
            );
        }
    }

    pub async fn get(&self, key: &str) -> Option<DeviceBinding> {
        self.entries.read().await.get(key).map(|e| e.binding.clone())
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn state(&self, key: &str) -> Option<BindingState> {
        self.entries.read().await.get(key).map(|e| e.state)
    }

    /// Insert or replace a binding, resetting its upgrade flags. Returns
    /// whether this was a fresh insert (as opposed to an update).
    pub async fn add(&self, binding: DeviceBinding) -> bool {
        let mut entries = self.entries.write().await;
        let is_new = !entries.contains_key(&binding.key);
        entries.insert(
            binding.key.clone(),
            RegistryEntry {
                binding: binding.clone(),
                state: BindingState::default(),
            },
        );
        drop(entries);
        let _ = self.events.send(if is_new {
            RegistryEvent::Added(binding)
        } else {
            RegistryEvent::Updated(binding)
        });
        is_new
    }

    /// Insert a binding only if absent (used to synthesize transient custom
    /// bindings addressed directly by the agent's own id).
    pub async fn get_or_insert(&self, binding: DeviceBinding) -> DeviceBinding {
        let mut entries = self.entries.write().await;
        entries
            .entry(binding.key.clone())
            .or_insert_with(|| RegistryEntry {
                binding: binding.clone(),
                state: BindingState::default(),
            })
            .binding
            .clone()
    }

    pub async fn update(&self, key: &str, mutate: impl FnOnce(&mut DeviceBinding)) -> Option<DeviceBinding> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(key)?;
        mutate(&mut entry.binding);
        let updated = entry.binding.clone();
        let _ = self.events.send(RegistryEvent::Updated(updated.clone()));
        Some(updated)
    }

    pub async fn remove(&self, key: &str) -> Option<DeviceBinding> {
        let removed = self.entries.write().await.remove(key).map(|e| e.binding);
        if let Some(binding) = &removed {
            let _ = self.events.send(RegistryEvent::Removed(binding.clone()));
        }
        removed
    }

    /// Attempt to start a download: returns `false` without mutating state
    /// if a download is already in flight for this binding.
    pub async fn try_begin_download(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.state.downloading => {
                entry.state.downloading = true;
                true
            }
            _ => false,
        }
    }

    pub async fn end_download(&self, key: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(key) {
            entry.state.downloading = false;
        }
    }

    /// Attempt to start an update: returns `false` without mutating state if
    /// an update is already in flight for this binding.
    pub async fn try_begin_update(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.state.updating => {
                entry.state.updating = true;
                true
            }
            _ => false,
        }
    }

    /// Finalize an update attempt: always clears `updating` and
    /// `stop_requested`, mirroring the legacy worker's `finally` block.
    pub async fn finish_update(&self, key: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(key) {
            entry.state.updating = false;
            entry.state.stop_requested = false;
        }
    }

    /// Handle a `Stop` command. If neither `downloading` nor `updating` is
    /// set, the legacy behavior applies immediately: report "already
    /// stopped" and reset (not set) `stop_requested`. Otherwise flag
    /// `stop_requested` for the in-flight worker to observe.
    ///
    /// Returns `true` if the stop should be reported immediately (nothing
    /// was in flight).
    pub async fn request_stop(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            return true;
        };
        if !entry.state.updating && !entry.state.downloading {
            entry.state.stop_requested = false;
            true
        } else {
            entry.state.stop_requested = true;
            false
        }
    }

    pub async fn is_stop_requested(&self, key: &str) -> bool {
        self.entries
            .read()
            .await
            .get(key)
            .map(|e| e.state.stop_requested)
            .unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn all(&self) -> Vec<DeviceBinding> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.binding.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(key: &str) -> DeviceBinding {
        DeviceBinding {
            key: key.to_string(),
            is_custom: false,
            directory: "/opt/app".into(),
            entry_name: "main.py".into(),
            conda_env: None,
            start_command: None,
            up_topic: format!("/devices/{key}/sys/messages/up"),
        }
    }

    #[tokio::test]
    async fn download_and_update_are_mutually_exclusive_in_flight() {
        let registry = DeviceRegistry::new();
        registry.add(binding("D1")).await;
        assert!(registry.try_begin_download("D1").await);
        assert!(!registry.try_begin_download("D1").await);
        registry.end_download("D1").await;
        assert!(registry.try_begin_download("D1").await);
    }

    #[tokio::test]
    async fn stop_when_idle_resets_flag_and_reports_immediately() {
        let registry = DeviceRegistry::new();
        registry.add(binding("D1")).await;
        let immediate = registry.request_stop("D1").await;
        assert!(immediate);
        assert!(!registry.is_stop_requested("D1").await);
    }

    #[tokio::test]
    async fn stop_while_updating_sets_flag_for_worker() {
        let registry = DeviceRegistry::new();
        registry.add(binding("D1")).await;
        assert!(registry.try_begin_update("D1").await);
        let immediate = registry.request_stop("D1").await;
        assert!(!immediate);
        assert!(registry.is_stop_requested("D1").await);
        registry.finish_update("D1").await;
        assert!(!registry.is_stop_requested("D1").await);
    }

    #[tokio::test]
    async fn get_or_insert_does_not_clobber_existing_state() {
        let registry = DeviceRegistry::new();
        registry.add(binding("D1")).await;
        registry.try_begin_update("D1").await;
        registry.get_or_insert(binding("D1")).await;
        assert!(registry.state("D1").await.unwrap().updating);
    }
}
