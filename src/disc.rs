use crate::burn::{BurnOptions, Burner};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::iso::{self, FinalizedImage};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maximum Joliet identifier length in UTF-16 code units.
pub const JOLIET_MAX_UNITS: usize = 64;
/// Maximum primary volume identifier length.
pub const VOLUME_LABEL_MAX: usize = 32;

const JOLIET_FORBIDDEN: &[char] = &['*', '/', ':', ';', '?', '\\'];

/// One file placed on the disc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscEntry {
    pub source: PathBuf,
    /// 8.3 d-character name, e.g. `ALPHA_TR.MP3`.
    pub short_name: String,
    /// Case-preserving Joliet name.
    pub long_name: String,
    pub size: u64,
}

/// Ordered, de-duplicated set of files to author into one image.
#[derive(Debug, Clone)]
pub struct DiscPlan {
    pub volume_label: String,
    pub entries: Vec<DiscEntry>,
}

impl DiscPlan {
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

fn split_extension(basename: &str) -> (&str, &str) {
    match basename.rfind('.') {
        Some(i) if i > 0 => (&basename[..i], &basename[i + 1..]),
        _ => (basename, ""),
    }
}

fn d_chars(text: &str, max: usize) -> String {
    text.chars()
        .map(|c| {
            let c = c.to_ascii_uppercase();
            if c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(max)
        .collect()
}

fn join_short(stem: &str, ext: &str) -> String {
    if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{}.{}", stem, ext)
    }
}

/// Primary-volume name for `basename`: uppercase d-characters in 8.3 form,
/// numbered with `_N` when it collides with a name in `taken`.
pub fn short_name(basename: &str, taken: &HashSet<String>) -> String {
    let (stem, ext) = split_extension(basename);
    let mut stem = d_chars(stem, 8);
    if stem.is_empty() {
        stem = "FILE".to_string();
    }
    let ext = d_chars(ext, 3);

    let candidate = join_short(&stem, &ext);
    if !taken.contains(&candidate) {
        return candidate;
    }

    (1..)
        .map(|n| {
            let suffix = format!("_{}", n);
            let keep = 8usize.saturating_sub(suffix.len());
            let base: String = stem.chars().take(keep).collect();
            join_short(&format!("{}{}", base, suffix), &ext)
        })
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_default()
}

fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Shorten `stem` until `stem + rest` fits in the Joliet limit.
fn fit_joliet(stem: &str, rest: &str) -> String {
    let budget = JOLIET_MAX_UNITS.saturating_sub(utf16_len(rest));
    let mut out = String::new();
    let mut used = 0;
    for c in stem.chars() {
        let units = c.len_utf16();
        if used + units > budget {
            break;
        }
        used += units;
        out.push(c);
    }
    out.push_str(rest);
    out
}

/// Joliet name for `basename`: case preserved, forbidden characters replaced,
/// at most 64 UTF-16 units, numbered ` (N)` when it collides (ignoring case)
/// with a name in `taken`.
pub fn long_name(basename: &str, taken: &HashSet<String>) -> String {
    let clean: String = basename
        .chars()
        .map(|c| {
            if c.is_control() || JOLIET_FORBIDDEN.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    let (stem, ext) = split_extension(&clean);
    let ext = if ext.is_empty() {
        String::new()
    } else {
        format!(".{}", ext)
    };

    let candidate = fit_joliet(stem, &ext);
    if !taken.contains(&candidate.to_lowercase()) {
        return candidate;
    }

    (2..)
        .map(|n| fit_joliet(stem, &format!(" ({}){}", n, ext)))
        .find(|candidate| !taken.contains(&candidate.to_lowercase()))
        .unwrap_or_default()
}

/// Uppercase d-character volume label, at most 32 characters.
pub fn sanitize_volume_label(label: &str) -> String {
    let label = d_chars(label.trim(), VOLUME_LABEL_MAX);
    if label.is_empty() {
        "DISCPRESS".to_string()
    } else {
        label
    }
}

/// Volume label derived from a date, e.g. `DISCPRESS_20240307`.
pub fn generate_volume_label(date: chrono::NaiveDate) -> String {
    format!("DISCPRESS_{}", date.format("%Y%m%d"))
}

fn dedup_key(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Resolve names and sizes for `paths`. Repeated paths are placed once, at
/// their first position.
pub fn plan_disc(paths: &[PathBuf], volume_label: &str) -> Result<DiscPlan> {
    if paths.is_empty() {
        return Err(Error::image("no files to author"));
    }

    let mut seen = HashSet::new();
    let mut short_taken = HashSet::new();
    let mut long_taken = HashSet::new();
    let mut entries = Vec::new();

    for path in paths {
        if !seen.insert(dedup_key(path)) {
            debug!("Skipping duplicate source: {}", path.display());
            continue;
        }

        let metadata = fs::metadata(path)
            .map_err(|e| Error::image(format!("cannot read {}: {}", path.display(), e)))?;
        if !metadata.is_file() {
            return Err(Error::image(format!("not a regular file: {}", path.display())));
        }

        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::image(format!("no file name: {}", path.display())))?;

        let short = short_name(&basename, &short_taken);
        let long = long_name(&basename, &long_taken);
        short_taken.insert(short.clone());
        long_taken.insert(long.to_lowercase());

        debug!("Placing {} as {} / {}", path.display(), short, long);
        entries.push(DiscEntry {
            source: path.clone(),
            short_name: short,
            long_name: long,
            size: metadata.len(),
        });
    }

    Ok(DiscPlan {
        volume_label: sanitize_volume_label(volume_label),
        entries,
    })
}

/// Advisory comparison of a selection's size against disc capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityReport {
    pub total_bytes: u64,
    pub capacity_bytes: u64,
    pub file_count: usize,
    /// Selected paths that could not be read; not counted in the total.
    pub missing: Vec<PathBuf>,
}

impl CapacityReport {
    pub fn percent(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return if self.total_bytes == 0 { 0.0 } else { f64::INFINITY };
        }
        self.total_bytes as f64 / self.capacity_bytes as f64 * 100.0
    }

    pub fn is_over_capacity(&self) -> bool {
        self.total_bytes > self.capacity_bytes
    }

    pub fn remaining_bytes(&self) -> i64 {
        self.capacity_bytes as i64 - self.total_bytes as i64
    }
}

/// Sum the sizes of the distinct, readable files in `paths`.
pub fn measure_capacity(paths: &[PathBuf], capacity_bytes: u64) -> CapacityReport {
    let mut seen = HashSet::new();
    let mut total_bytes = 0;
    let mut file_count = 0;
    let mut missing = Vec::new();

    for path in paths {
        if !seen.insert(dedup_key(path)) {
            continue;
        }
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => {
                total_bytes += meta.len();
                file_count += 1;
            }
            _ => missing.push(path.clone()),
        }
    }

    CapacityReport {
        total_bytes,
        capacity_bytes,
        file_count,
        missing,
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Drive and media context for authoring and burning, owned by whoever
/// drives a burn rather than kept in global state.
pub struct DiscSession {
    device: String,
    options: BurnOptions,
    capacity_bytes: u64,
    staging_dir: PathBuf,
    volume_label: Option<String>,
    burner: Arc<Burner>,
}

impl DiscSession {
    pub fn new(device: impl Into<String>, burner: Arc<Burner>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            options: BurnOptions::default(),
            capacity_bytes: crate::config::DiscConfig::default().capacity_mib * 1024 * 1024,
            staging_dir: staging_dir.into(),
            volume_label: None,
            burner,
        }
    }

    pub fn from_config(config: &Config, burner: Arc<Burner>) -> Self {
        Self {
            device: config.burn.device.clone(),
            options: BurnOptions::from(&config.burn),
            capacity_bytes: config.capacity_bytes(),
            staging_dir: config.staging_dir(),
            volume_label: config.disc.volume_label.clone(),
            burner,
        }
    }

    pub fn with_options(mut self, options: BurnOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_volume_label(mut self, label: impl Into<String>) -> Self {
        self.volume_label = Some(label.into());
        self
    }

    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn options(&self) -> &BurnOptions {
        &self.options
    }

    pub fn capacity(&self, paths: &[PathBuf]) -> CapacityReport {
        measure_capacity(paths, self.capacity_bytes)
    }

    fn volume_label(&self) -> String {
        match &self.volume_label {
            Some(label) => label.clone(),
            None => generate_volume_label(chrono::Local::now().date_naive()),
        }
    }

    /// Author `paths` into a finalized image in the staging directory.
    pub fn author(&self, paths: &[PathBuf]) -> Result<FinalizedImage> {
        let plan = plan_disc(paths, &self.volume_label())?;

        let report = measure_capacity(paths, self.capacity_bytes);
        if report.is_over_capacity() {
            warn!(
                "Selection is {:.1}% of disc capacity ({} of {})",
                report.percent(),
                format_size(report.total_bytes),
                format_size(report.capacity_bytes)
            );
        }

        let output = self
            .staging_dir
            .join(format!("discpress-{}.iso", uuid::Uuid::new_v4()));
        iso::build_image(&plan, &output)
    }

    /// Author and burn in one step. The image is removed afterwards whatever
    /// the outcome.
    pub fn author_and_burn(&self, paths: &[PathBuf], progress: &mut dyn FnMut(&str)) -> Result<()> {
        let image = self.author(paths)?;
        info!(
            "Burning {} files ({}) to {}",
            image.file_count(),
            format_size(image.size()),
            self.device
        );
        self.burner.burn(&self.device, image, &self.options, progress)
    }

    /// Run [`DiscSession::author_and_burn`] on the blocking pool, streaming
    /// progress lines over a channel.
    pub fn spawn_burn(
        self: Arc<Self>,
        paths: Vec<PathBuf>,
    ) -> (JoinHandle<Result<()>>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::task::spawn_blocking(move || {
            self.author_and_burn(&paths, &mut |line| {
                let _ = tx.send(line.to_string());
            })
        });
        (handle, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn taken(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_short_name() {
        let none = HashSet::new();
        assert_eq!(short_name("alpha track.mp3", &none), "ALPHA_TR.MP3");
        assert_eq!(short_name("a.flac", &none), "A.FLA");
        assert_eq!(short_name("Ünïcödé.mp3", &none), "_N_C_D_.MP3");
        assert_eq!(short_name("README", &none), "README");
        assert_eq!(short_name(".mp3", &none), "_MP3");
        assert_eq!(short_name("!!!.mp3", &none), "___.MP3");
    }

    #[test]
    fn test_short_name_collisions() {
        let used = taken(&["ALPHA_TR.MP3"]);
        assert_eq!(short_name("alpha track 2.mp3", &used), "ALPHA__1.MP3");

        let used = taken(&["ALPHA_TR.MP3", "ALPHA__1.MP3"]);
        assert_eq!(short_name("Alpha Tribe.mp3", &used), "ALPHA__2.MP3");

        let mut used = HashSet::new();
        for _ in 0..12 {
            let name = short_name("Track.mp3", &used);
            assert!(name.len() <= 12);
            assert!(used.insert(name));
        }
        assert!(used.contains("TRACK_10.MP3"));
    }

    #[test]
    fn test_long_name() {
        let none = HashSet::new();
        assert_eq!(long_name("Zebra Song.mp3", &none), "Zebra Song.mp3");
        assert_eq!(long_name("What?: Live.mp3", &none), "What__ Live.mp3");

        let long = format!("{}.mp3", "x".repeat(100));
        let name = long_name(&long, &none);
        assert_eq!(utf16_len(&name), JOLIET_MAX_UNITS);
        assert!(name.ends_with(".mp3"));
    }

    #[test]
    fn test_long_name_collisions_ignore_case() {
        let used = taken(&["song.mp3"]);
        assert_eq!(long_name("Song.mp3", &used), "Song (2).mp3");

        let long = format!("{}.mp3", "y".repeat(100));
        let first = long_name(&long, &HashSet::new());
        let used = taken(&[&first.to_lowercase()]);
        let second = long_name(&long, &used);
        assert_ne!(first, second);
        assert!(second.ends_with(" (2).mp3"));
        assert_eq!(utf16_len(&second), JOLIET_MAX_UNITS);
    }

    #[test]
    fn test_volume_labels() {
        assert_eq!(sanitize_volume_label("road trip mix"), "ROAD_TRIP_MIX");
        assert_eq!(sanitize_volume_label("   "), "DISCPRESS");
        assert_eq!(sanitize_volume_label(&"a".repeat(40)).len(), VOLUME_LABEL_MAX);

        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(generate_volume_label(date), "DISCPRESS_20240307");
    }

    #[test]
    fn test_plan_dedups_and_orders() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let a = temp_dir.path().join("b-side.mp3");
        let b = temp_dir.path().join("A-side.mp3");
        fs::write(&a, vec![0u8; 10])?;
        fs::write(&b, vec![0u8; 20])?;

        let plan = plan_disc(&[a.clone(), b.clone(), a.clone()], "mix")?;
        assert_eq!(plan.volume_label, "MIX");
        assert_eq!(plan.entries.len(), 2);
        assert_eq!(plan.entries[0].source, a);
        assert_eq!(plan.entries[1].long_name, "A-side.mp3");
        assert_eq!(plan.total_bytes(), 30);
        Ok(())
    }

    #[test]
    fn test_plan_rejects_missing_and_empty() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let err = plan_disc(&[temp_dir.path().join("nope.mp3")], "X").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ImageBuild);
        assert!(plan_disc(&[], "X").is_err());
        assert!(plan_disc(&[temp_dir.path().to_path_buf()], "X").is_err());
        Ok(())
    }

    #[test]
    fn test_capacity_under() {
        let report = CapacityReport {
            total_bytes: 600 * MIB,
            capacity_bytes: 700 * MIB,
            file_count: 3,
            missing: vec![],
        };
        assert!((report.percent() - 85.714).abs() < 0.01);
        assert!(!report.is_over_capacity());
        assert_eq!(report.remaining_bytes(), (100 * MIB) as i64);
    }

    #[test]
    fn test_capacity_over() {
        let report = CapacityReport {
            total_bytes: 800 * MIB,
            capacity_bytes: 700 * MIB,
            file_count: 2,
            missing: vec![],
        };
        assert!((report.percent() - 114.286).abs() < 0.01);
        assert!(report.is_over_capacity());
        assert!(report.remaining_bytes() < 0);
    }

    #[test]
    fn test_measure_capacity() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let a = temp_dir.path().join("a.mp3");
        fs::write(&a, vec![0u8; 1000])?;
        let gone = temp_dir.path().join("gone.mp3");

        let report = measure_capacity(&[a.clone(), a.clone(), gone.clone()], 4000);
        assert_eq!(report.total_bytes, 1000);
        assert_eq!(report.file_count, 1);
        assert_eq!(report.missing, vec![gone]);
        assert!((report.percent() - 25.0).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(700 * MIB), "700.00 MB");
    }

    #[test]
    fn test_session_author_uses_label_and_staging() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let track = temp_dir.path().join("track.mp3");
        fs::write(&track, vec![7u8; 4096])?;

        let staging = temp_dir.path().join("staging");
        let session = DiscSession::new("/dev/null", Arc::new(Burner::new()), &staging)
            .with_volume_label("Party");
        let image = session.author(&[track])?;
        assert!(image.path().starts_with(&staging));
        assert_eq!(image.volume_label(), "PARTY");
        assert_eq!(crate::iso::read_listing(image.path())?.entries.len(), 1);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_session_burns_with_overridden_options() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let track = temp_dir.path().join("track.mp3");
        fs::write(&track, vec![7u8; 4096])?;

        let options = BurnOptions {
            speed: Some(8),
            burn_proof: false,
            test_mode: true,
        };
        let session = DiscSession::new("/dev/sr1", Arc::new(Burner::with_program("echo")), temp_dir.path())
            .with_options(options.clone());
        assert_eq!(session.options(), &options);

        let mut lines = Vec::new();
        session.author_and_burn(&[track], &mut |line| lines.push(line.to_string()))?;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("dev=/dev/sr1 speed=8 -dummy"));
        assert!(!lines[0].contains("burnfree"));
        Ok(())
    }
}
