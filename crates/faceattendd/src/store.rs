//! Small persistent key-value store for the admin token and camera presets.
//!
//! Values are opaque strings kept in one JSON object on disk. Every write
//! replaces the file atomically (temp file + rename).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ADMIN_TOKEN_KEY: &str = "admin_token";
pub const CAMERA_PRESETS_KEY: &str = "ip_camera_presets";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("store file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to encode store: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A saved remote camera address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraPreset {
    pub name: String,
    pub url: String,
}

#[derive(Debug)]
pub struct LocalStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl LocalStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.into());
        self.persist()
    }

    pub fn remove(&mut self, key: &str) -> Result<bool, StoreError> {
        let existed = self.values.remove(key).is_some();
        if existed {
            self.persist()?;
        }
        Ok(existed)
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.get(ADMIN_TOKEN_KEY).filter(|t| !t.is_empty())
    }

    pub fn set_admin_token(&mut self, token: &str) -> Result<(), StoreError> {
        self.set(ADMIN_TOKEN_KEY, token.trim())
    }

    pub fn clear_admin_token(&mut self) -> Result<bool, StoreError> {
        self.remove(ADMIN_TOKEN_KEY)
    }

    /// Saved presets. An unreadable preset list is treated as empty.
    pub fn camera_presets(&self) -> Vec<CameraPreset> {
        let Some(raw) = self.get(CAMERA_PRESETS_KEY) else {
            return Vec::new();
        };
        serde_json::from_str(raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring unreadable camera presets");
            Vec::new()
        })
    }

    /// Add a preset, replacing any preset with the same name.
    pub fn save_camera_preset(&mut self, preset: CameraPreset) -> Result<(), StoreError> {
        let mut presets = self.camera_presets();
        match presets.iter_mut().find(|p| p.name == preset.name) {
            Some(existing) => *existing = preset,
            None => presets.push(preset),
        }
        let raw = serde_json::to_string(&presets)?;
        self.set(CAMERA_PRESETS_KEY, raw)
    }

    pub fn remove_camera_preset(&mut self, name: &str) -> Result<bool, StoreError> {
        let mut presets = self.camera_presets();
        let before = presets.len();
        presets.retain(|p| p.name != name);
        if presets.len() == before {
            return Ok(false);
        }
        let raw = serde_json::to_string(&presets)?;
        self.set(CAMERA_PRESETS_KEY, raw)?;
        Ok(true)
    }

    /// Map a preset name to its URL; anything else is returned unchanged.
    pub fn resolve_camera(&self, camera: &str) -> String {
        self.camera_presets()
            .into_iter()
            .find(|p| p.name == camera)
            .map(|p| p.url)
            .unwrap_or_else(|| camera.to_string())
    }

    fn persist(&self) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        let encoded = serde_json::to_vec_pretty(&self.values)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, encoded).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        tracing::debug!(path = %self.path.display(), keys = self.values.len(), "store saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preset(name: &str, url: &str) -> CameraPreset {
        CameraPreset {
            name: name.into(),
            url: url.into(),
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("store.json")).unwrap();
        assert_eq!(store.admin_token(), None);
        assert!(store.camera_presets().is_empty());
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/store.json");

        let mut store = LocalStore::open(&path).unwrap();
        store.set_admin_token(" tok ").unwrap();
        store.set("theme", "dark").unwrap();

        let reopened = LocalStore::open(&path).unwrap();
        assert_eq!(reopened.admin_token(), Some("tok"));
        assert_eq!(reopened.get("theme"), Some("dark"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_clear_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let mut store = LocalStore::open(&path).unwrap();
        store.set_admin_token("tok").unwrap();
        assert!(store.clear_admin_token().unwrap());
        assert!(!store.clear_admin_token().unwrap());
        assert_eq!(LocalStore::open(&path).unwrap().admin_token(), None);
    }

    #[test]
    fn test_presets_replace_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LocalStore::open(dir.path().join("store.json")).unwrap();
        store.save_camera_preset(preset("door", "192.168.1.20")).unwrap();
        store.save_camera_preset(preset("hall", "http://cam/shot.jpg")).unwrap();
        store.save_camera_preset(preset("door", "192.168.1.21:8081")).unwrap();

        assert_eq!(
            store.camera_presets(),
            vec![preset("door", "192.168.1.21:8081"), preset("hall", "http://cam/shot.jpg")]
        );
        assert_eq!(store.resolve_camera("door"), "192.168.1.21:8081");
        assert_eq!(store.resolve_camera("/dev/video0"), "/dev/video0");

        assert!(store.remove_camera_preset("door").unwrap());
        assert!(!store.remove_camera_preset("door").unwrap());
        assert_eq!(store.camera_presets().len(), 1);
    }

    #[test]
    fn test_presets_stored_as_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LocalStore::open(dir.path().join("store.json")).unwrap();
        store.save_camera_preset(preset("door", "10.0.0.5")).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(store.get(CAMERA_PRESETS_KEY).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!([{"name": "door", "url": "10.0.0.5"}]));
    }

    #[test]
    fn test_garbled_presets_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LocalStore::open(dir.path().join("store.json")).unwrap();
        store.set(CAMERA_PRESETS_KEY, "not json").unwrap();
        assert!(store.camera_presets().is_empty());
        store.save_camera_preset(preset("door", "10.0.0.5")).unwrap();
        assert_eq!(store.camera_presets().len(), 1);
    }

    #[test]
    fn test_corrupt_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{ truncated").unwrap();
        assert!(matches!(LocalStore::open(&path), Err(StoreError::Corrupt { .. })));
    }
}
