use crate::error::{Error, Result};
use rayon::prelude::*;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Database schema version
const SCHEMA_VERSION: u32 = 2;

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";
pub const UNKNOWN_YEAR: &str = "0000";
pub const UNKNOWN_GENRE: &str = "Unknown";

pub const MAX_RATING: u8 = 5;

/// File extensions picked up by a rescan.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3"];

/// Descriptive fields of a track, as resolved by the tagger or read from tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub year: String,
    pub genre: String,
}

impl Default for TrackMetadata {
    fn default() -> Self {
        Self {
            title: UNKNOWN_TITLE.to_string(),
            artist: UNKNOWN_ARTIST.to_string(),
            album: UNKNOWN_ALBUM.to_string(),
            year: UNKNOWN_YEAR.to_string(),
            genre: UNKNOWN_GENRE.to_string(),
        }
    }
}

impl TrackMetadata {
    /// Replace blank fields with placeholders and reduce the year to four digits.
    pub fn normalized(self) -> Self {
        fn or_placeholder(value: String, placeholder: &str) -> String {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                placeholder.to_string()
            } else {
                trimmed.to_string()
            }
        }

        Self {
            year: normalize_year(&self.year),
            title: or_placeholder(self.title, UNKNOWN_TITLE),
            artist: or_placeholder(self.artist, UNKNOWN_ARTIST),
            album: or_placeholder(self.album, UNKNOWN_ALBUM),
            genre: or_placeholder(self.genre, UNKNOWN_GENRE),
        }
    }
}

/// Extract a 4-digit year from strings like "1997", "1997-05-12" or "1997/05".
pub fn normalize_year(raw: &str) -> String {
    let digits: String = raw.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() == 4 {
        digits
    } else {
        UNKNOWN_YEAR.to_string()
    }
}

/// Catalog row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub path: PathBuf,
    pub metadata: TrackMetadata,
    pub rating: u8,
    pub added_at: String,
}

impl Track {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Track> {
        let path: String = row.get(0)?;
        let rating: i64 = row.get(6)?;
        Ok(Track {
            path: PathBuf::from(path),
            metadata: TrackMetadata {
                title: row.get(1)?,
                artist: row.get(2)?,
                album: row.get(3)?,
                year: row.get(4)?,
                genre: row.get(5)?,
            },
            rating: rating.clamp(0, MAX_RATING as i64) as u8,
            added_at: row.get(7)?,
        })
    }
}

const TRACK_COLUMNS: &str = "filepath, title, artist, album, year, genre, rating, added_at";

/// Durable track store keyed by absolute file path.
///
/// Every mutation is a single statement issued under the connection mutex, so
/// the acquisition pipeline, rescans and rating edits can share one handle.
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Open (or create) the catalog database and run migrations if needed.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(db_path)?;
        migrate_database(&mut conn)?;

        info!("Catalog opened at: {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate_database(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied statement.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a track unless its path is already cataloged.
    ///
    /// Returns `true` when a row was inserted. A duplicate path is not an error.
    pub fn add_track(&self, path: &Path, metadata: &TrackMetadata) -> Result<bool> {
        let path = normalize_path(path);
        let meta = metadata.clone().normalized();
        let added_at = chrono::Utc::now().to_rfc3339();
        let inserted = self.conn().execute(
            "INSERT INTO tracks (filepath, title, artist, album, year, genre, rating, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
             ON CONFLICT(filepath) DO NOTHING",
            params![
                path.to_string_lossy(),
                meta.title,
                meta.artist,
                meta.album,
                meta.year,
                meta.genre,
                added_at
            ],
        )?;

        if inserted > 0 {
            debug!("Cataloged: {} ({} - {})", path.display(), meta.artist, meta.title);
        } else {
            debug!("Already cataloged: {}", path.display());
        }
        Ok(inserted > 0)
    }

    /// Overwrite the descriptive fields of an existing track.
    ///
    /// Returns `false` when the path is not cataloged.
    pub fn update_metadata(&self, path: &Path, metadata: &TrackMetadata) -> Result<bool> {
        let path = normalize_path(path);
        let meta = metadata.clone().normalized();
        let updated = self.conn().execute(
            "UPDATE tracks SET title = ?1, artist = ?2, album = ?3, year = ?4, genre = ?5
             WHERE filepath = ?6",
            params![
                meta.title,
                meta.artist,
                meta.album,
                meta.year,
                meta.genre,
                path.to_string_lossy()
            ],
        )?;
        if updated == 0 {
            warn!("Metadata update for unknown track: {}", path.display());
        }
        Ok(updated > 0)
    }

    /// Set a track's rating, clamped to 0..=5.
    pub fn update_rating(&self, path: &Path, rating: i64) -> Result<bool> {
        let path = normalize_path(path);
        let clamped = rating.clamp(0, MAX_RATING as i64);
        if clamped != rating {
            debug!("Rating {} clamped to {}", rating, clamped);
        }
        let updated = self.conn().execute(
            "UPDATE tracks SET rating = ?1 WHERE filepath = ?2",
            params![clamped, path.to_string_lossy()],
        )?;
        Ok(updated > 0)
    }

    pub fn get(&self, path: &Path) -> Result<Option<Track>> {
        let path = normalize_path(path);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tracks WHERE filepath = ?1",
            TRACK_COLUMNS
        ))?;
        let track = stmt
            .query_row(params![path.to_string_lossy()], Track::from_row)
            .optional()?;
        Ok(track)
    }

    pub fn contains(&self, path: &Path) -> Result<bool> {
        let path = normalize_path(path);
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM tracks WHERE filepath = ?1)",
            params![path.to_string_lossy()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM tracks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// All tracks ordered by artist, album, title (byte order, path breaks ties).
    pub fn list_all(&self) -> Result<Vec<Track>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tracks ORDER BY artist, album, title, filepath",
            TRACK_COLUMNS
        ))?;

        let tracks = stmt.query_map([], Track::from_row)?;

        let mut result = Vec::new();
        for track in tracks {
            result.push(track?);
        }
        Ok(result)
    }

    fn known_paths(&self) -> Result<HashSet<PathBuf>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT filepath FROM tracks")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut paths = HashSet::new();
        for row in rows {
            paths.insert(PathBuf::from(row?));
        }
        Ok(paths)
    }

    /// Catalog every audio file under `dir` that is not already present,
    /// using the tags embedded in the file. Returns the number of new tracks.
    pub fn rescan(&self, dir: &Path) -> Result<usize> {
        let root = std::fs::canonicalize(dir)?;
        info!("Rescanning library folder: {}", root.display());

        let known = self.known_paths()?;
        let candidates: Vec<PathBuf> = WalkDir::new(&root)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable entry during rescan: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && is_audio_file(entry.path()))
            .map(|entry| normalize_path(entry.path()))
            .filter(|path| !known.contains(path))
            .collect();

        debug!("Found {} uncataloged audio files", candidates.len());

        // Tag reads are independent; inserts stay sequential under the mutex.
        let mut read: Vec<(PathBuf, TrackMetadata)> = candidates
            .into_par_iter()
            .filter_map(|path| match crate::tagger::read_tags(&path) {
                Ok(meta) => Some((path, meta)),
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    None
                }
            })
            .collect();
        read.sort_by(|a, b| a.0.cmp(&b.0));

        let mut added = 0;
        for (path, meta) in &read {
            if self.add_track(path, meta)? {
                added += 1;
            }
        }

        info!("Rescan complete: {} new tracks", added);
        Ok(added)
    }
}

/// Catalog key for `path`: the canonical path when the file exists, otherwise
/// the path made absolute against the working directory.
pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// True for files with a known audio extension (case-insensitive).
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            AUDIO_EXTENSIONS.iter().any(|known| *known == ext)
        })
        .unwrap_or(false)
}

/// Migrate database to the latest schema version.
fn migrate_database(conn: &mut Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < SCHEMA_VERSION {
        info!(
            "Migrating catalog from version {} to {}",
            current_version, SCHEMA_VERSION
        );

        let tx = conn.transaction()?;
        if current_version == 0 {
            create_schema(&tx)?;
        }
        if current_version == 1 {
            migrate_v1_to_v2(&tx)?;
        }
        set_schema_version(&tx, SCHEMA_VERSION)?;
        tx.commit()?;

        info!("Catalog migration completed");
    } else if current_version > SCHEMA_VERSION {
        return Err(Error::UnsupportedSchema {
            found: current_version,
            supported: SCHEMA_VERSION,
        });
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32> {
    let table_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(tx: &Transaction, version: u32) -> Result<()> {
    tx.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER)",
        [],
    )?;
    tx.execute("DELETE FROM schema_version", [])?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![version],
    )?;
    Ok(())
}

/// Version 1 libraries predate ratings and insertion timestamps.
fn migrate_v1_to_v2(tx: &Transaction) -> Result<()> {
    info!("Migrating catalog to version 2: adding rating and added_at");

    tx.execute(
        "ALTER TABLE tracks ADD COLUMN rating INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    tx.execute(
        "ALTER TABLE tracks ADD COLUMN added_at TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    create_indexes(tx)?;
    Ok(())
}

fn create_schema(tx: &Transaction) -> Result<()> {
    tx.execute(
        "CREATE TABLE IF NOT EXISTS tracks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            filepath TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            artist TEXT NOT NULL,
            album TEXT NOT NULL,
            year TEXT NOT NULL,
            genre TEXT NOT NULL,
            rating INTEGER NOT NULL DEFAULT 0,
            added_at TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;
    create_indexes(tx)?;

    debug!("Catalog schema created");
    Ok(())
}

fn create_indexes(tx: &Transaction) -> Result<()> {
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_tracks_order ON tracks(artist, album, title)",
        [],
    )?;
    Ok(())
}
