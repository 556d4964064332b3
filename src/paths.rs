use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolve the XDG data directory for the application.
/// Defaults to ~/.local/share/discpress if XDG_DATA_HOME is not set.
pub fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|d| d.join("discpress"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/share/discpress")))
        .context("Could not determine data directory")
}

/// Resolve the XDG config directory for the application.
/// Defaults to ~/.config/discpress if XDG_CONFIG_HOME is not set.
pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join("discpress"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".config/discpress")))
        .context("Could not determine config directory")
}

/// Get the default catalog database path.
pub fn default_database_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("library.db"))
}

/// Get the default logs directory.
pub fn logs_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("logs"))
}

/// Get the default artwork cache directory.
pub fn default_artwork_cache_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("artwork_cache"))
}

/// Downloads land in the user's music directory when one exists.
pub fn default_download_dir() -> Result<PathBuf> {
    match dirs::audio_dir() {
        Some(dir) => Ok(dir.join("discpress")),
        None => Ok(data_dir()?.join("downloads")),
    }
}

/// Get the preset store path.
pub fn presets_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("presets.toml"))
}

/// Ensure a directory exists, creating it if necessary.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Ensure the data directory exists.
pub fn ensure_data_dir() -> Result<PathBuf> {
    let dir = data_dir()?;
    ensure_dir(&dir)?;
    ensure_dir(&logs_dir()?)?;
    Ok(dir)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir()?;
    ensure_dir(&dir)?;
    Ok(dir)
}

/// Absolute form of a path without requiring it to exist.
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Could not determine current directory")?;
    Ok(cwd.join(path))
}

/// Validate that a path exists and is a directory.
pub fn validate_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Path does not exist: {}", path.display());
    }
    if !path.is_dir() {
        anyhow::bail!("Path is not a directory: {}", path.display());
    }
    Ok(())
}

/// Expand user home directory in path (e.g., ~/path -> /home/user/path).
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/test");
        assert!(expanded.to_string_lossy().contains("test"));
        assert!(!expanded.to_string_lossy().starts_with("~"));
    }

    #[test]
    fn test_expand_tilde_leaves_plain_paths() {
        assert_eq!(expand_tilde("/srv/music"), PathBuf::from("/srv/music"));
    }

    #[test]
    fn test_absolutize() -> Result<()> {
        let abs = absolutize(Path::new("song.mp3"))?;
        assert!(abs.is_absolute());
        assert!(abs.ends_with("song.mp3"));
        assert_eq!(absolutize(Path::new("/a/b"))?, PathBuf::from("/a/b"));
        Ok(())
    }

    #[test]
    fn test_validate_dir() -> Result<()> {
        let temp_dir = TempDir::new()?;
        assert!(validate_dir(temp_dir.path()).is_ok());
        let file = temp_dir.path().join("f.txt");
        std::fs::write(&file, "x")?;
        assert!(validate_dir(&file).is_err());
        assert!(validate_dir(&temp_dir.path().join("missing")).is_err());
        Ok(())
    }
}
