use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where extracted tracks are written (defaults to ~/Music/discpress)
    pub download_dir: Option<String>,

    /// Artwork cache directory (defaults to data_dir/artwork_cache)
    pub artwork_cache_dir: Option<String>,

    /// Catalog database path (defaults to data_dir/library.db)
    pub database_path: Option<String>,

    /// Where temporary disc images are authored (defaults to the system temp dir)
    pub staging_dir: Option<String>,

    #[serde(default)]
    pub disc: DiscConfig,

    #[serde(default)]
    pub burn: BurnConfig,

    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub spotify: SpotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscConfig {
    /// Nominal disc capacity in MiB
    #[serde(default = "default_capacity_mib")]
    pub capacity_mib: u64,

    /// Volume label; generated from the date when unset
    pub volume_label: Option<String>,
}

impl Default for DiscConfig {
    fn default() -> Self {
        Self {
            capacity_mib: default_capacity_mib(),
            volume_label: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurnConfig {
    /// Burner device, e.g. /dev/sr0 or D:
    #[serde(default = "default_device")]
    pub device: String,

    /// Write speed multiplier; unset means the drive maximum
    pub speed: Option<u32>,

    /// Buffer underrun protection
    #[serde(default = "default_true")]
    pub burn_proof: bool,

    /// Simulate the write without altering media
    #[serde(default)]
    pub test_mode: bool,

    /// Override the burner executable (otherwise wodim / cdburn by platform)
    pub program: Option<String>,
}

impl Default for BurnConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            speed: None,
            burn_proof: true,
            test_mode: false,
            program: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Extractor executable
    #[serde(default = "default_extractor")]
    pub extractor: String,

    #[serde(default = "default_audio_format")]
    pub audio_format: String,

    /// Target bitrate in kbps passed to the transcoder
    #[serde(default = "default_audio_quality")]
    pub audio_quality: String,

    /// Pause between items of a playlist run
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            extractor: default_extractor(),
            audio_format: default_audio_format(),
            audio_quality: default_audio_quality(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

impl AcquisitionConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_musicbrainz_url")]
    pub musicbrainz_url: String,

    #[serde(default = "default_coverart_url")]
    pub coverart_url: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            musicbrainz_url: default_musicbrainz_url(),
            coverart_url: default_coverart_url(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpotifyConfig {
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,
}

impl SpotifyConfig {
    pub fn has_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

fn default_capacity_mib() -> u64 {
    700
}

fn default_device() -> String {
    if cfg!(windows) {
        "D:".to_string()
    } else {
        "/dev/sr0".to_string()
    }
}

fn default_true() -> bool {
    true
}

fn default_extractor() -> String {
    "yt-dlp".to_string()
}

fn default_audio_format() -> String {
    "mp3".to_string()
}

fn default_audio_quality() -> String {
    "320".to_string()
}

fn default_batch_delay_ms() -> u64 {
    1000
}

fn default_user_agent() -> String {
    format!(
        "discpress/{} ( https://github.com/discpress/discpress )",
        env!("CARGO_PKG_VERSION")
    )
}

fn default_musicbrainz_url() -> String {
    "https://musicbrainz.org/ws/2".to_string()
}

fn default_coverart_url() -> String {
    "https://coverartarchive.org".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: None,
            artwork_cache_dir: None,
            database_path: None,
            staging_dir: None,
            disc: DiscConfig::default(),
            burn: BurnConfig::default(),
            acquisition: AcquisitionConfig::default(),
            metadata: MetadataConfig::default(),
            spotify: SpotifyConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file, or return default if file doesn't exist.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save config to file.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path()?;
        paths::ensure_config_dir()?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Get the config file path.
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(paths::config_dir()?.join("config.toml"))
    }

    pub fn download_dir(&self) -> Result<PathBuf> {
        match &self.download_dir {
            Some(dir) => Ok(paths::expand_tilde(dir)),
            None => paths::default_download_dir(),
        }
    }

    pub fn artwork_cache_dir(&self) -> Result<PathBuf> {
        match &self.artwork_cache_dir {
            Some(dir) => Ok(paths::expand_tilde(dir)),
            None => paths::default_artwork_cache_dir(),
        }
    }

    /// Get the staging directory, falling back to the system temp directory.
    pub fn staging_dir(&self) -> PathBuf {
        match &self.staging_dir {
            Some(dir) => paths::expand_tilde(dir),
            None => std::env::temp_dir().join("discpress_staging"),
        }
    }

    /// Get the database path, creating default if not set.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(paths::expand_tilde(path)),
            None => paths::default_database_path(),
        }
    }

    /// Nominal disc capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.disc.capacity_mib * 1024 * 1024
    }

    /// Validate the configuration and create the directories it names.
    pub fn validate(&self) -> Result<()> {
        if self.disc.capacity_mib == 0 {
            anyhow::bail!("Disc capacity must be greater than zero");
        }

        if let Some(speed) = self.burn.speed {
            if speed == 0 || speed > 52 {
                anyhow::bail!("Burn speed must be between 1x and 52x, got {}x", speed);
            }
        }

        if self.burn.device.trim().is_empty() {
            anyhow::bail!("Burn device must not be empty");
        }

        paths::ensure_dir(&self.download_dir()?)?;
        paths::ensure_dir(&self.artwork_cache_dir()?)?;
        paths::ensure_dir(&self.staging_dir())?;

        let db_path = self.database_path()?;
        if let Some(parent) = db_path.parent() {
            paths::ensure_dir(parent)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.disc.capacity_mib, 700);
        assert_eq!(config.capacity_bytes(), 700 * 1024 * 1024);
        assert!(config.burn.burn_proof);
        assert!(!config.burn.test_mode);
        assert_eq!(config.acquisition.extractor, "yt-dlp");
        assert_eq!(config.acquisition.batch_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[burn]"));
        assert!(toml_str.contains("capacity_mib = 700"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
download_dir = "/srv/music"
[disc]
capacity_mib = 800
[burn]
device = "/dev/sr1"
speed = 16
test_mode = true
[spotify]
client_id = "id"
client_secret = "secret"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.burn.device, "/dev/sr1");
        assert_eq!(config.burn.speed, Some(16));
        assert!(config.burn.test_mode);
        assert!(config.burn.burn_proof);
        assert_eq!(config.capacity_bytes(), 800 * 1024 * 1024);
        assert!(config.spotify.has_credentials());
        assert_eq!(config.download_dir().unwrap(), PathBuf::from("/srv/music"));
        assert_eq!(config.acquisition.audio_format, "mp3");
    }

    #[test]
    fn test_staging_dir_default() {
        let config = Config::default();
        let staging = config.staging_dir();
        assert!(staging.to_string_lossy().contains("discpress_staging"));
    }

    #[test]
    fn test_database_path() -> Result<()> {
        let config = Config::default();
        let db_path = config.database_path()?;
        assert!(db_path.to_string_lossy().contains("library.db"));
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_values() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_string_lossy().to_string();

        let mut config = Config {
            download_dir: Some(format!("{}/downloads", root)),
            artwork_cache_dir: Some(format!("{}/art", root)),
            database_path: Some(format!("{}/db/library.db", root)),
            staging_dir: Some(format!("{}/staging", root)),
            ..Config::default()
        };
        config.validate()?;
        assert!(temp_dir.path().join("downloads").is_dir());
        assert!(temp_dir.path().join("db").is_dir());

        config.burn.speed = Some(0);
        assert!(config.validate().is_err());

        config.burn.speed = None;
        config.disc.capacity_mib = 0;
        assert!(config.validate().is_err());
        Ok(())
    }
}
