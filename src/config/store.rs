use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Settings store shared between the controller and its host
///
/// Uses `ArcSwap` for lock-free reads; writers replace the whole
/// configuration and notify subscribers. Optionally mirrored to a
/// JSON file.
#[derive(Clone)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<SettingChange>,
}

/// Configuration change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingChange {
    pub key: String,
}

impl SettingsStore {
    /// Create an in-memory store
    pub fn new(config: AppConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path: None,
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    /// Open a store backed by a JSON file, creating it with defaults if missing
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let config = match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                let mut config: AppConfig =
                    serde_json::from_str(&json).map_err(|e| AppError::Config(e.to_string()))?;
                config.streamer.normalize();
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::save_to_file(path, &config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        let mut store = Self::new(config);
        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    async fn save_to_file(path: &Path, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the entire configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        if let Some(ref path) = self.path {
            Self::save_to_file(path, &config).await?;
        }
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(SettingChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Update configuration with a closure
    ///
    /// `key` names the setting being changed and is forwarded to subscribers.
    /// Read-modify-write; concurrent writers are last-write-wins.
    pub async fn update<F>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);
        config.streamer.normalize();

        if let Some(ref path) = self.path {
            Self::save_to_file(path, &config).await?;
        }

        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(SettingChange {
            key: key.to_string(),
        });

        Ok(())
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<SettingChange> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_settings_store_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pixelstream.json");

        let store = SettingsStore::open(&path).await.unwrap();
        assert!(!store.get().webrtc.force_turn);

        store
            .update("webrtc.force_turn", |c| {
                c.webrtc.force_turn = true;
                c.streamer.max_reconnect_attempts = 7;
            })
            .await
            .unwrap();

        let config = store.get();
        assert!(config.webrtc.force_turn);
        assert_eq!(config.streamer.max_reconnect_attempts, 7);

        let reopened = SettingsStore::open(&path).await.unwrap();
        assert!(reopened.get().webrtc.force_turn);
        assert_eq!(reopened.get().streamer.max_reconnect_attempts, 7);
    }

    #[tokio::test]
    async fn test_update_notifies_subscribers() {
        let store = SettingsStore::new(AppConfig::default());
        let mut rx = store.subscribe();

        store
            .update("webrtc.preferred_codec", |c| {
                c.webrtc.preferred_codec.selected = "VP9 profile-id=0".to_string();
            })
            .await
            .unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.key, "webrtc.preferred_codec");
        assert_eq!(store.get().webrtc.preferred_codec.selected, "VP9 profile-id=0");
    }

    #[tokio::test]
    async fn test_update_normalizes_streamer_ranges() {
        let store = SettingsStore::new(AppConfig::default());
        store
            .update("streamer.auto_join_interval_ms", |c| {
                c.streamer.auto_join_interval_ms = 1;
            })
            .await
            .unwrap();
        assert_eq!(store.get().streamer.auto_join_interval_ms, 500);
    }
}
