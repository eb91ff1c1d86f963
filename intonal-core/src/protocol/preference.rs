//! Persisted backend override (`backend.json` in the config directory).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::BackendKind;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendPreference {
    pub force: Option<BackendKind>,
}

impl BackendPreference {
    pub fn load() -> Self {
        match Self::storage_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                log::warn!(target: "config", "ignoring malformed {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) {
        if let Some(path) = Self::storage_path() {
            self.save_to(&path);
        }
    }

    /// Writes the override, or removes the file when there is none.
    pub fn save_to(&self, path: &Path) {
        if self.force.is_none() {
            let _ = std::fs::remove_file(path);
            return;
        }
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    log::warn!(target: "config", "could not save {}: {}", path.display(), e);
                }
            }
            Err(e) => log::warn!(target: "config", "could not encode backend preference: {}", e),
        }
    }

    fn storage_path() -> Option<PathBuf> {
        crate::config::config_dir().map(|d| d.join("backend.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intonal").join("backend.json");
        let pref = BackendPreference {
            force: Some(BackendKind::ChannelRotation),
        };
        pref.save_to(&path);
        let json = std::fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"channel_rotation\""));
        assert_eq!(BackendPreference::load_from(&path), pref);
    }

    #[test]
    fn test_clearing_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.json");
        BackendPreference {
            force: Some(BackendKind::FineSysEx),
        }
        .save_to(&path);
        assert!(path.exists());
        BackendPreference::default().save_to(&path);
        assert!(!path.exists());
        assert_eq!(BackendPreference::load_from(&path).force, None);
    }

    #[test]
    fn test_malformed_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.json");
        std::fs::write(&path, "{ \"force\": \"smoke_signals\" }").unwrap();
        assert_eq!(BackendPreference::load_from(&path), BackendPreference::default());
    }
}
