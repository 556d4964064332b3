use crate::catalog::{normalize_year, TrackMetadata};
use crate::error::{Error, Result};
use id3::frame::{Picture, PictureType};
use id3::{Frame, Tag, TagLike, Version};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One search hit from a metadata service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataCandidate {
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Release date as reported, e.g. "1997-05-12"; may be empty.
    pub date: String,
    pub genre: Option<String>,
    pub release_id: Option<String>,
}

/// Remote metadata service consulted by the tagger.
pub trait MetadataLookup: Send + Sync {
    /// Candidates for a free-text title, best match first.
    fn search(&self, title: &str) -> Result<Vec<MetadataCandidate>>;

    /// Front cover image bytes for a release.
    fn front_cover(&self, release_id: &str) -> Result<Vec<u8>>;
}

/// Artwork stored on disk as `<release-id>.jpg`.
#[derive(Debug, Clone)]
pub struct ArtworkCache {
    dir: PathBuf,
}

impl ArtworkCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, release_id: &str) -> PathBuf {
        let key: String = release_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.jpg", key))
    }

    pub fn get(&self, release_id: &str) -> Option<Vec<u8>> {
        let path = self.path_for(release_id);
        match std::fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            _ => None,
        }
    }

    pub fn store(&self, release_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(release_id);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }
}

/// A file whose tags now carry the resolved metadata.
#[derive(Debug, Clone)]
pub struct TaggedTrack {
    pub path: PathBuf,
    pub metadata: TrackMetadata,
    pub has_artwork: bool,
}

pub struct Tagger {
    lookup: Arc<dyn MetadataLookup>,
    artwork: ArtworkCache,
}

impl Tagger {
    pub fn new(lookup: Arc<dyn MetadataLookup>, artwork: ArtworkCache) -> Self {
        Self { lookup, artwork }
    }

    /// Resolve metadata for `seed_title` and embed it in the file at `path`,
    /// replacing whatever tags it carried.
    pub fn tag(&self, path: &Path, seed_title: &str) -> Result<TaggedTrack> {
        info!("Looking up metadata for '{}'", seed_title);

        let candidate = self
            .lookup
            .search(seed_title)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::MetadataNotFound(seed_title.to_string()))?;

        debug!(
            "Best match: {} - {} ({}) release {:?}",
            candidate.artist, candidate.title, candidate.album, candidate.release_id
        );

        let metadata = TrackMetadata {
            title: candidate.title,
            artist: candidate.artist,
            album: candidate.album,
            year: normalize_year(&candidate.date),
            genre: candidate.genre.unwrap_or_default(),
        }
        .normalized();

        let cover = candidate
            .release_id
            .as_deref()
            .and_then(|release_id| self.cover_art(release_id));

        write_tags(path, &metadata, cover.as_deref())?;
        info!("Tagged {} as {} - {}", path.display(), metadata.artist, metadata.title);

        Ok(TaggedTrack {
            path: path.to_path_buf(),
            metadata,
            has_artwork: cover.is_some(),
        })
    }

    /// Cached cover for a release, fetching and caching it on a miss.
    /// Failures are logged and yield no cover.
    fn cover_art(&self, release_id: &str) -> Option<Vec<u8>> {
        if let Some(bytes) = self.artwork.get(release_id) {
            debug!("Artwork cache hit for release {}", release_id);
            return Some(bytes);
        }

        let bytes = match self.lookup.front_cover(release_id) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                warn!("Empty cover art for release {}", release_id);
                return None;
            }
            Err(e) => {
                warn!("Continuing without cover art: {}", e);
                return None;
            }
        };

        if let Err(e) = self.artwork.store(release_id, &bytes) {
            warn!("Could not cache artwork for release {}: {}", release_id, e);
        }
        Some(bytes)
    }
}

/// Write a fresh ID3v2.4 tag to `path`, discarding any existing frames.
pub fn write_tags(path: &Path, metadata: &TrackMetadata, cover: Option<&[u8]>) -> Result<()> {
    let mut tag = Tag::new();
    tag.set_title(metadata.title.as_str());
    tag.set_artist(metadata.artist.as_str());
    tag.set_album(metadata.album.as_str());
    tag.add_frame(Frame::text("TDRC", metadata.year.as_str()));
    if metadata.genre != crate::catalog::UNKNOWN_GENRE {
        tag.set_genre(metadata.genre.as_str());
    }

    if let Some(data) = cover {
        tag.add_frame(Picture {
            mime_type: "image/jpeg".to_string(),
            picture_type: PictureType::CoverFront,
            description: "Cover".to_string(),
            data: data.to_vec(),
        });
    }

    tag.write_to_path(path, Version::Id3v24)
        .map_err(|e| Error::Tagging {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Read the descriptive fields embedded in a file. Untagged files yield
/// placeholder metadata rather than an error.
pub fn read_tags(path: &Path) -> Result<TrackMetadata> {
    let tag = match Tag::read_from_path(path) {
        Ok(tag) => tag,
        Err(id3::Error {
            kind: id3::ErrorKind::NoTag,
            ..
        }) => {
            debug!("No tags in {}", path.display());
            return Ok(TrackMetadata::default());
        }
        Err(e) => {
            return Err(Error::Tagging {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
    };

    // TDRC on v2.4 tags, TYER on v2.3
    let year = ["TDRC", "TYER"]
        .iter()
        .filter_map(|id| tag.get(id))
        .filter_map(|frame| frame.content().text())
        .map(normalize_year)
        .find(|year| year != crate::catalog::UNKNOWN_YEAR)
        .unwrap_or_default();

    Ok(TrackMetadata {
        title: tag.title().unwrap_or_default().to_string(),
        artist: tag.artist().unwrap_or_default().to_string(),
        album: tag.album().unwrap_or_default().to_string(),
        year,
        genre: tag.genre().unwrap_or_default().to_string(),
    }
    .normalized())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

    struct FakeLookup {
        candidates: Vec<MetadataCandidate>,
        cover: Option<Vec<u8>>,
        cover_fetches: AtomicUsize,
    }

    impl FakeLookup {
        fn new(candidates: Vec<MetadataCandidate>, cover: Option<Vec<u8>>) -> Self {
            Self {
                candidates,
                cover,
                cover_fetches: AtomicUsize::new(0),
            }
        }
    }

    impl MetadataLookup for FakeLookup {
        fn search(&self, _title: &str) -> Result<Vec<MetadataCandidate>> {
            Ok(self.candidates.clone())
        }

        fn front_cover(&self, release_id: &str) -> Result<Vec<u8>> {
            self.cover_fetches.fetch_add(1, Ordering::SeqCst);
            self.cover.clone().ok_or_else(|| Error::ArtworkFetch {
                release_id: release_id.to_string(),
                message: "HTTP 404".to_string(),
            })
        }
    }

    fn candidate(title: &str, release_id: Option<&str>) -> MetadataCandidate {
        MetadataCandidate {
            title: title.to_string(),
            artist: "Massive Attack".to_string(),
            album: "Mezzanine".to_string(),
            date: "1998-04-20".to_string(),
            genre: None,
            release_id: release_id.map(str::to_string),
        }
    }

    fn audio_file(dir: &Path, name: &str) -> Result<PathBuf> {
        let path = dir.join(name);
        std::fs::write(&path, b"not really audio")?;
        Ok(path)
    }

    #[test]
    fn test_tag_embeds_first_candidate() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = audio_file(temp_dir.path(), "teardrop.mp3")?;
        let lookup = Arc::new(FakeLookup::new(
            vec![candidate("Teardrop", Some("rel-1")), candidate("Angel", None)],
            Some(JPEG.to_vec()),
        ));
        let tagger = Tagger::new(lookup.clone(), ArtworkCache::new(temp_dir.path().join("art")));

        let tagged = tagger.tag(&file, "teardrop")?;
        assert_eq!(tagged.metadata.title, "Teardrop");
        assert_eq!(tagged.metadata.year, "1998");
        assert!(tagged.has_artwork);

        let read = read_tags(&file)?;
        assert_eq!(read.title, "Teardrop");
        assert_eq!(read.artist, "Massive Attack");
        assert_eq!(read.album, "Mezzanine");
        assert_eq!(read.year, "1998");

        let tag = Tag::read_from_path(&file).unwrap();
        let picture = tag.pictures().next().unwrap();
        assert_eq!(picture.picture_type, PictureType::CoverFront);
        assert_eq!(picture.data, JPEG);
        Ok(())
    }

    #[test]
    fn test_no_candidates_is_metadata_not_found() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = audio_file(temp_dir.path(), "unknown.mp3")?;
        let tagger = Tagger::new(
            Arc::new(FakeLookup::new(vec![], None)),
            ArtworkCache::new(temp_dir.path().join("art")),
        );

        let err = tagger.tag(&file, "zzz").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::MetadataNotFound);
        Ok(())
    }

    #[test]
    fn test_artwork_failure_is_not_fatal() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = audio_file(temp_dir.path(), "song.mp3")?;
        let tagger = Tagger::new(
            Arc::new(FakeLookup::new(vec![candidate("Song", Some("rel-2"))], None)),
            ArtworkCache::new(temp_dir.path().join("art")),
        );

        let tagged = tagger.tag(&file, "song")?;
        assert!(!tagged.has_artwork);
        assert_eq!(read_tags(&file)?.title, "Song");
        Ok(())
    }

    #[test]
    fn test_artwork_cached_by_release() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let cache = ArtworkCache::new(temp_dir.path().join("art"));
        let lookup = Arc::new(FakeLookup::new(
            vec![candidate("Song", Some("rel-3"))],
            Some(JPEG.to_vec()),
        ));
        let tagger = Tagger::new(lookup.clone(), cache.clone());

        tagger.tag(&audio_file(temp_dir.path(), "a.mp3")?, "song")?;
        tagger.tag(&audio_file(temp_dir.path(), "b.mp3")?, "song")?;

        assert_eq!(lookup.cover_fetches.load(Ordering::SeqCst), 1);
        assert!(cache.path_for("rel-3").exists());
        assert_eq!(cache.get("rel-3").unwrap(), JPEG);
        Ok(())
    }

    #[test]
    fn test_retagging_overwrites_existing_frames() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = audio_file(temp_dir.path(), "song.mp3")?;
        let old = TrackMetadata {
            title: "Old".into(),
            genre: "Polka".into(),
            ..TrackMetadata::default()
        };
        write_tags(&file, &old, Some(JPEG))?;

        let new = TrackMetadata {
            title: "New".into(),
            ..TrackMetadata::default()
        };
        write_tags(&file, &new, None)?;

        let read = read_tags(&file)?;
        assert_eq!(read.title, "New");
        assert_eq!(read.genre, crate::catalog::UNKNOWN_GENRE);
        assert_eq!(Tag::read_from_path(&file).unwrap().pictures().count(), 0);
        Ok(())
    }

    #[test]
    fn test_read_untagged_file_gives_placeholders() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = audio_file(temp_dir.path(), "raw.mp3")?;
        assert_eq!(read_tags(&file)?, TrackMetadata::default());
        Ok(())
    }

    #[test]
    fn test_artwork_cache_key_is_sanitized() {
        let cache = ArtworkCache::new("/cache");
        assert_eq!(
            cache.path_for("a1b2-c3"),
            PathBuf::from("/cache/a1b2-c3.jpg")
        );
        assert_eq!(cache.path_for("../x"), PathBuf::from("/cache/___x.jpg"));
    }
}
