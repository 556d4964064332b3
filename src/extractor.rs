use crate::commands;
use crate::config::AcquisitionConfig;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A decoded audio file produced from a source reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedTrack {
    pub path: PathBuf,
    /// Media title as resolved by the source, used to seed metadata lookup.
    pub title: String,
}

/// Turns a URL or "artist - title" search string into a local audio file.
pub trait TrackExtractor: Send + Sync {
    /// `progress` receives non-decreasing percentages in 0..=100.
    fn extract(&self, reference: &str, progress: &mut dyn FnMut(f32)) -> Result<ExtractedTrack>;
}

/// True when the reference should be fetched directly rather than searched.
pub fn is_url(reference: &str) -> bool {
    let r = reference.trim();
    r.starts_with("http://") || r.starts_with("https://")
}

/// Parse a `[download]  42.5% of ...` progress line.
pub fn parse_progress(line: &str) -> Option<f32> {
    let rest = line.trim_start().strip_prefix("[download]")?;
    let token = rest.split_whitespace().next()?;
    let value: f32 = token.strip_suffix('%')?.parse().ok()?;
    Some(value.clamp(0.0, 100.0))
}

/// Forwards progress values only when they advance.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: Option<f32>,
}

impl ProgressTracker {
    pub fn observe(&mut self, value: f32) -> Option<f32> {
        match self.last {
            Some(last) if value <= last => None,
            _ => {
                self.last = Some(value);
                Some(value)
            }
        }
    }
}

/// Extractor backed by yt-dlp with ffmpeg post-processing.
pub struct YtDlpExtractor {
    program: String,
    output_dir: PathBuf,
    audio_format: String,
    audio_quality: String,
}

impl YtDlpExtractor {
    pub fn new(config: &AcquisitionConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: config.extractor.clone(),
            output_dir: output_dir.into(),
            audio_format: config.audio_format.clone(),
            audio_quality: config.audio_quality.clone(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn build_args(&self, reference: &str) -> Vec<String> {
        let target = if is_url(reference) {
            reference.trim().to_string()
        } else {
            format!("ytsearch1:{}", reference.trim())
        };
        let template = self.output_dir.join("%(title)s.%(ext)s");

        vec![
            "--format".to_string(),
            "bestaudio/best".to_string(),
            "--extract-audio".to_string(),
            "--audio-format".to_string(),
            self.audio_format.clone(),
            "--audio-quality".to_string(),
            format!("{}K", self.audio_quality),
            "--no-playlist".to_string(),
            "--newline".to_string(),
            "--progress".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "--output".to_string(),
            template.to_string_lossy().to_string(),
            target,
        ]
    }
}

impl TrackExtractor for YtDlpExtractor {
    fn extract(&self, reference: &str, progress: &mut dyn FnMut(f32)) -> Result<ExtractedTrack> {
        std::fs::create_dir_all(&self.output_dir)?;
        let args = self.build_args(reference);
        info!("Extracting '{}'", reference);

        let mut tracker = ProgressTracker::default();
        let mut reported_path: Option<PathBuf> = None;

        let output = commands::stream_command(self.program.as_str(), &args_as_str(&args), |line| {
            if let Some(value) = parse_progress(line) {
                if let Some(value) = tracker.observe(value) {
                    progress(value);
                }
            } else if !line.trim().is_empty() && !line.starts_with('[') {
                reported_path = Some(PathBuf::from(line.trim()));
            }
        })
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::extraction(reference, format!("{} is not installed", self.program))
            }
            _ => Error::extraction(reference, format!("failed to run {}: {}", self.program, e)),
        })?;

        if !output.success {
            let message = output
                .stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("extractor exited with an error")
                .trim()
                .to_string();
            return Err(Error::extraction(reference, message));
        }

        let path = reported_path
            .ok_or_else(|| Error::extraction(reference, "extractor did not report an output file"))?;
        if !path.is_file() {
            return Err(Error::extraction(
                reference,
                format!("output file missing: {}", path.display()),
            ));
        }

        if tracker.observe(100.0).is_some() {
            progress(100.0);
        }

        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| reference.to_string());
        debug!("Extracted {} ({})", path.display(), title);

        Ok(ExtractedTrack { path, title })
    }
}

fn args_as_str(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}
