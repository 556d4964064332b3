use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Built-in presets. They have no stored paths and cannot be changed.
pub const RESERVED_PRESETS: &[&str] = &["Standard Audio CD", "MP3 CD"];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_PRESETS.contains(&name)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PresetFile {
    #[serde(default)]
    presets: BTreeMap<String, Vec<PathBuf>>,
}

/// Named, ordered path lists persisted in `presets.toml`.
pub struct PresetStore {
    path: PathBuf,
    presets: BTreeMap<String, Vec<PathBuf>>,
}

impl PresetStore {
    /// Load the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let presets = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let file: PresetFile = toml::from_str(&contents).map_err(|e| {
                Error::Preset(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            file.presets
        } else {
            debug!("No preset file at {}, starting empty", path.display());
            BTreeMap::new()
        };

        let mut store = Self { path, presets };
        let shadowed: Vec<String> = store
            .presets
            .keys()
            .filter(|name| is_reserved(name))
            .cloned()
            .collect();
        for name in shadowed {
            warn!("Ignoring stored preset with reserved name '{}'", name);
            store.presets.remove(&name);
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reserved names first, then user presets alphabetically.
    pub fn names(&self) -> Vec<String> {
        RESERVED_PRESETS
            .iter()
            .map(|name| name.to_string())
            .chain(self.presets.keys().cloned())
            .collect()
    }

    /// Stored paths for `name`. Reserved and unknown names yield an empty list.
    pub fn load(&self, name: &str) -> Vec<PathBuf> {
        if is_reserved(name) {
            return Vec::new();
        }
        self.presets.get(name).cloned().unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        is_reserved(name) || self.presets.contains_key(name)
    }

    /// Create or replace a user preset and write the store to disk.
    pub fn save(&mut self, name: &str, paths: &[PathBuf]) -> Result<()> {
        let name = name.trim();
        if is_reserved(name) {
            return Err(Error::ReservedPreset(name.to_string()));
        }
        if name.is_empty() {
            return Err(Error::Preset("Preset name cannot be empty".to_string()));
        }

        self.presets.insert(name.to_string(), paths.to_vec());
        self.persist()?;
        info!("Saved preset '{}' with {} paths", name, paths.len());
        Ok(())
    }

    /// Remove a user preset. Returns `false` for reserved or unknown names.
    pub fn delete(&mut self, name: &str) -> Result<bool> {
        if is_reserved(name) {
            debug!("Refusing to delete reserved preset '{}'", name);
            return Ok(false);
        }
        if self.presets.remove(name).is_none() {
            return Ok(false);
        }
        self.persist()?;
        info!("Deleted preset '{}'", name);
        Ok(true)
    }

    fn persist(&self) -> Result<()> {
        let file = PresetFile {
            presets: self.presets.clone(),
        };
        let contents = toml::to_string_pretty(&file)
            .map_err(|e| Error::Preset(format!("Failed to serialize presets: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, contents).map_err(|e| {
            Error::Preset(format!("Failed to write {}: {}", self.path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_reload() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("presets.toml");

        let mut store = PresetStore::open(&file)?;
        let paths = vec![PathBuf::from("/music/b.mp3"), PathBuf::from("/music/a.mp3")];
        store.save("Road Trip", &paths)?;

        let reopened = PresetStore::open(&file)?;
        assert_eq!(reopened.load("Road Trip"), paths);

        let contents = std::fs::read_to_string(&file)?;
        assert!(contents.contains("[presets]"));
        Ok(())
    }

    #[test]
    fn test_reserved_presets_are_guarded() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = PresetStore::open(temp_dir.path().join("presets.toml"))?;

        let err = store
            .save("MP3 CD", &[PathBuf::from("/music/a.mp3")])
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ReservedPreset);

        assert!(!store.delete("Standard Audio CD")?);
        assert!(store.contains("Standard Audio CD"));
        assert!(store.load("MP3 CD").is_empty());
        assert!(!temp_dir.path().join("presets.toml").exists());
        Ok(())
    }

    #[test]
    fn test_unknown_preset_loads_empty() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = PresetStore::open(temp_dir.path().join("presets.toml"))?;
        assert!(store.load("Nope").is_empty());
        assert!(!store.contains("Nope"));
        Ok(())
    }

    #[test]
    fn test_names_list_reserved_first() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = PresetStore::open(temp_dir.path().join("presets.toml"))?;
        store.save("Zebra", &[])?;
        store.save("Alpha", &[])?;

        assert_eq!(
            store.names(),
            vec!["Standard Audio CD", "MP3 CD", "Alpha", "Zebra"]
        );
        Ok(())
    }

    #[test]
    fn test_delete_user_preset() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("presets.toml");
        let mut store = PresetStore::open(&file)?;
        store.save("Mix", &[PathBuf::from("/music/a.mp3")])?;

        assert!(store.delete("Mix")?);
        assert!(!store.delete("Mix")?);
        assert!(PresetStore::open(&file)?.load("Mix").is_empty());
        Ok(())
    }

    #[test]
    fn test_stored_reserved_name_is_ignored() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("presets.toml");
        std::fs::write(
            &file,
            "[presets]\n\"MP3 CD\" = [\"/x.mp3\"]\nMine = [\"/y.mp3\"]\n",
        )?;

        let store = PresetStore::open(&file)?;
        assert!(store.load("MP3 CD").is_empty());
        assert_eq!(store.load("Mine"), vec![PathBuf::from("/y.mp3")]);
        Ok(())
    }

    #[test]
    fn test_corrupt_file_is_preset_error() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("presets.toml");
        std::fs::write(&file, "[presets\nbroken")?;

        let err = PresetStore::open(&file).err().map(|e| e.kind());
        assert_eq!(err, Some(crate::ErrorKind::Preset));
        Ok(())
    }
}
