use crate::catalog::{normalize_path, Catalog};
use crate::disc::{measure_capacity, CapacityReport};
use crate::error::Result;
use crate::presets::PresetStore;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Ordered selection of cataloged tracks waiting to be burned.
#[derive(Debug, Default, Clone)]
pub struct BurnQueue {
    entries: Vec<PathBuf>,
}

impl BurnQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cataloged path. Returns `false` if it is already queued or
    /// not in the catalog.
    pub fn add(&mut self, catalog: &Catalog, path: &Path) -> Result<bool> {
        let path = normalize_path(path);
        if self.contains(&path) {
            debug!("Already queued: {}", path.display());
            return Ok(false);
        }
        if !catalog.contains(&path)? {
            debug!("Not cataloged, skipping: {}", path.display());
            return Ok(false);
        }
        self.entries.push(path);
        Ok(true)
    }

    pub fn remove(&mut self, path: &Path) -> bool {
        let path = normalize_path(path);
        let before = self.entries.len();
        self.entries.retain(|p| *p != path);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, path: &Path) -> bool {
        let path = normalize_path(path);
        self.entries.iter().any(|p| *p == path)
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the queue with a preset's paths, keeping only cataloged ones.
    /// Returns the number of paths queued.
    pub fn load_preset(&mut self, store: &PresetStore, name: &str, catalog: &Catalog) -> Result<usize> {
        let paths = store.load(name);
        self.clear();
        for path in &paths {
            self.add(catalog, path)?;
        }

        let skipped = paths.len() - self.len();
        if skipped > 0 {
            info!(
                "Preset '{}': {} of {} paths are no longer cataloged",
                name,
                skipped,
                paths.len()
            );
        }
        Ok(self.len())
    }

    pub fn save_preset(&self, store: &mut PresetStore, name: &str) -> Result<()> {
        store.save(name, &self.entries)
    }

    pub fn capacity(&self, capacity_bytes: u64) -> CapacityReport {
        measure_capacity(&self.entries, capacity_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TrackMetadata;
    use tempfile::TempDir;

    fn catalog_with(paths: &[&Path]) -> Result<Catalog> {
        let catalog = Catalog::open_in_memory()?;
        for path in paths {
            catalog.add_track(path, &TrackMetadata::default())?;
        }
        Ok(catalog)
    }

    #[test]
    fn test_add_requires_catalog_and_dedups() -> Result<()> {
        let a = Path::new("/music/a.mp3");
        let b = Path::new("/music/b.mp3");
        let catalog = catalog_with(&[a])?;
        let mut queue = BurnQueue::new();

        assert!(queue.add(&catalog, a)?);
        assert!(!queue.add(&catalog, a)?);
        assert!(!queue.add(&catalog, b)?);
        assert_eq!(queue.paths(), &[a.to_path_buf()]);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_path_matches_queued_entry() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let real_dir = temp_dir.path().join("music");
        std::fs::create_dir(&real_dir)?;
        let link_dir = temp_dir.path().join("link");
        std::os::unix::fs::symlink(&real_dir, &link_dir)?;
        let real = real_dir.join("a.mp3");
        std::fs::write(&real, b"audio")?;

        let catalog = catalog_with(&[real.as_path()])?;
        let mut queue = BurnQueue::new();
        assert!(queue.add(&catalog, &link_dir.join("a.mp3"))?);
        assert!(!queue.add(&catalog, &real)?);
        assert!(queue.contains(&real));
        assert!(queue.remove(&link_dir.join("a.mp3")));
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn test_remove_and_clear() -> Result<()> {
        let a = Path::new("/music/a.mp3");
        let b = Path::new("/music/b.mp3");
        let catalog = catalog_with(&[a, b])?;
        let mut queue = BurnQueue::new();
        queue.add(&catalog, a)?;
        queue.add(&catalog, b)?;

        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert_eq!(queue.paths(), &[b.to_path_buf()]);

        queue.clear();
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn test_load_preset_skips_uncataloged() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let a = Path::new("/music/a.mp3");
        let c = Path::new("/music/c.mp3");
        let catalog = catalog_with(&[a, c])?;

        let mut store = PresetStore::open(temp_dir.path().join("presets.toml"))?;
        store.save(
            "Mix",
            &[c.to_path_buf(), PathBuf::from("/music/gone.mp3"), a.to_path_buf()],
        )?;

        let mut queue = BurnQueue::new();
        queue.add(&catalog, a)?;
        assert_eq!(queue.load_preset(&store, "Mix", &catalog)?, 2);
        assert_eq!(queue.paths(), &[c.to_path_buf(), a.to_path_buf()]);

        assert_eq!(queue.load_preset(&store, "MP3 CD", &catalog)?, 0);
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn test_save_preset_round_trip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let a = Path::new("/music/a.mp3");
        let catalog = catalog_with(&[a])?;
        let mut store = PresetStore::open(temp_dir.path().join("presets.toml"))?;

        let mut queue = BurnQueue::new();
        queue.add(&catalog, a)?;
        queue.save_preset(&mut store, "One")?;
        assert_eq!(store.load("One"), vec![a.to_path_buf()]);

        let err = queue.save_preset(&mut store, "Standard Audio CD").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ReservedPreset);
        Ok(())
    }

    #[test]
    fn test_capacity_report() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let a = temp_dir.path().join("a.mp3");
        let b = temp_dir.path().join("b.mp3");
        std::fs::write(&a, vec![0u8; 600])?;
        std::fs::write(&b, vec![0u8; 600])?;
        let catalog = catalog_with(&[a.as_path(), b.as_path()])?;

        let mut queue = BurnQueue::new();
        queue.add(&catalog, &a)?;
        queue.add(&catalog, &b)?;

        let report = queue.capacity(1000);
        assert_eq!(report.total_bytes, 1200);
        assert_eq!(report.file_count, 2);
        assert!(report.is_over_capacity());
        Ok(())
    }
}
