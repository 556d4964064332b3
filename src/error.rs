use std::path::PathBuf;
use thiserror::Error;

/// Result type for the acquisition and disc pipelines.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of pipeline failures, stable across messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Extraction,
    PlaylistResolution,
    MetadataNotFound,
    Tagging,
    ArtworkFetch,
    ImageBuild,
    BurnToolNotFound,
    BurnFailed,
    UnsupportedPlatform,
    BurnInProgress,
    Catalog,
    ReservedPreset,
    Preset,
    Io,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Extraction failed for '{reference}': {message}")]
    Extraction { reference: String, message: String },

    #[error("Playlist resolution failed: {0}")]
    PlaylistResolution(String),

    #[error("No metadata found for '{0}'")]
    MetadataNotFound(String),

    /// Lookup service failure while searching for metadata. Fatal for the item
    /// in the same way as an empty result.
    #[error("Metadata lookup failed for '{title}': {message}")]
    MetadataLookup { title: String, message: String },

    #[error("Artwork fetch failed for release {release_id}: {message}")]
    ArtworkFetch { release_id: String, message: String },

    #[error("Tagging failed for {}: {message}", path.display())]
    Tagging { path: PathBuf, message: String },

    #[error("Disc image build failed: {0}")]
    ImageBuild(String),

    #[error("Burner tool not found: {0}")]
    BurnToolNotFound(String),

    #[error("Burner exited with code {code:?}: {stderr}")]
    BurnFailed { code: Option<i32>, stderr: String },

    #[error("No burner integration for platform '{0}'")]
    UnsupportedPlatform(String),

    #[error("A burn is already in progress")]
    BurnInProgress,

    #[error("Catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("Catalog schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("'{0}' is a built-in preset and cannot be modified")]
    ReservedPreset(String),

    #[error("Preset store error: {0}")]
    Preset(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Extraction { .. } => ErrorKind::Extraction,
            Error::PlaylistResolution(_) => ErrorKind::PlaylistResolution,
            Error::MetadataNotFound(_) | Error::MetadataLookup { .. } => ErrorKind::MetadataNotFound,
            Error::Tagging { .. } => ErrorKind::Tagging,
            Error::ArtworkFetch { .. } => ErrorKind::ArtworkFetch,
            Error::ImageBuild(_) => ErrorKind::ImageBuild,
            Error::BurnToolNotFound(_) => ErrorKind::BurnToolNotFound,
            Error::BurnFailed { .. } => ErrorKind::BurnFailed,
            Error::UnsupportedPlatform(_) => ErrorKind::UnsupportedPlatform,
            Error::BurnInProgress => ErrorKind::BurnInProgress,
            Error::Catalog(_) | Error::UnsupportedSchema { .. } => ErrorKind::Catalog,
            Error::ReservedPreset(_) => ErrorKind::ReservedPreset,
            Error::Preset(_) => ErrorKind::Preset,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn extraction(reference: &str, message: impl Into<String>) -> Self {
        Error::Extraction {
            reference: reference.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn image(message: impl Into<String>) -> Self {
        Error::ImageBuild(message.into())
    }
}
