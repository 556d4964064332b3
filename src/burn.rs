use crate::commands;
use crate::config::BurnConfig;
use crate::error::{Error, Result};
use crate::iso::FinalizedImage;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnOptions {
    /// Write speed multiplier; `None` lets the drive choose.
    pub speed: Option<u32>,
    /// Buffer underrun protection.
    pub burn_proof: bool,
    /// Simulate the write with the laser off.
    pub test_mode: bool,
}

impl Default for BurnOptions {
    fn default() -> Self {
        Self {
            speed: None,
            burn_proof: true,
            test_mode: false,
        }
    }
}

impl From<&BurnConfig> for BurnOptions {
    fn from(config: &BurnConfig) -> Self {
        Self {
            speed: config.speed,
            burn_proof: config.burn_proof,
            test_mode: config.test_mode,
        }
    }
}

/// External burner command-line conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurnTool {
    Wodim,
    Cdburn,
}

impl BurnTool {
    pub fn for_platform(os: &str) -> Result<Self> {
        match os {
            "linux" => Ok(BurnTool::Wodim),
            "windows" => Ok(BurnTool::Cdburn),
            other => Err(Error::UnsupportedPlatform(other.to_string())),
        }
    }

    pub fn for_current_platform() -> Result<Self> {
        Self::for_platform(std::env::consts::OS)
    }

    pub fn program(&self) -> &'static str {
        match self {
            BurnTool::Wodim => "wodim",
            BurnTool::Cdburn => "cdburn",
        }
    }

    pub fn args(&self, device: &str, image: &Path, options: &BurnOptions) -> Vec<String> {
        let image = image.to_string_lossy().to_string();
        match self {
            BurnTool::Wodim => {
                let mut args = vec!["-v".to_string(), format!("dev={}", device)];
                if let Some(speed) = options.speed {
                    args.push(format!("speed={}", speed));
                }
                if options.burn_proof {
                    args.push("driveropts=burnfree".to_string());
                }
                if options.test_mode {
                    args.push("-dummy".to_string());
                }
                args.push(image);
                args
            }
            BurnTool::Cdburn => {
                let mut args = vec![device.to_string(), image];
                if let Some(speed) = options.speed {
                    args.push("-speed".to_string());
                    args.push(speed.to_string());
                }
                args
            }
        }
    }
}

/// Friendlier explanation for common burner failures.
fn failure_hint(stderr: &str) -> Option<&'static str> {
    let stderr = stderr.to_lowercase();
    if stderr.contains("no disk") || stderr.contains("wrong disk") || stderr.contains("no media") {
        Some("No writable disc found. Insert a blank CD-R and try again.")
    } else if stderr.contains("device or resource busy") {
        Some("The drive is busy. Close other disc applications and try again.")
    } else if stderr.contains("permission denied") || stderr.contains("cannot open") {
        Some("Cannot open the drive. Check the device path and that your user may access it.")
    } else if stderr.contains("not blank") || stderr.contains("cannot blank") {
        Some("The disc already contains data. Use a blank disc.")
    } else {
        None
    }
}

/// Runs the platform burner, one burn at a time.
pub struct Burner {
    program: Option<String>,
    busy: AtomicBool,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for Burner {
    fn default() -> Self {
        Self::new()
    }
}

impl Burner {
    pub fn new() -> Self {
        Self {
            program: None,
            busy: AtomicBool::new(false),
        }
    }

    /// Use `program` instead of the platform burner, passing it the same
    /// arguments.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: Some(program.into()),
            busy: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &BurnConfig) -> Self {
        match &config.program {
            Some(program) => Self::with_program(program.clone()),
            None => Self::new(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Burn `image` to `device`, forwarding each burner stdout line to
    /// `progress`. The image is deleted before returning, whatever the outcome.
    pub fn burn(
        &self,
        device: &str,
        image: FinalizedImage,
        options: &BurnOptions,
        progress: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let result = match self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                let _guard = BusyGuard(&self.busy);
                self.run(device, &image, options, progress)
            }
            Err(_) => {
                warn!("Burn requested while another burn is running");
                Err(Error::BurnInProgress)
            }
        };

        let path = image.path().to_path_buf();
        match image.discard() {
            Ok(()) => debug!("Removed disc image {}", path.display()),
            Err(e) => {
                warn!("Failed to remove disc image {}: {}", path.display(), e);
                progress(&format!(
                    "Warning: could not remove temporary image {}: {}",
                    path.display(),
                    e
                ));
            }
        }

        result
    }

    fn run(
        &self,
        device: &str,
        image: &FinalizedImage,
        options: &BurnOptions,
        progress: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let (tool, program) = match &self.program {
            Some(program) => (
                BurnTool::for_current_platform().unwrap_or(BurnTool::Wodim),
                program.clone(),
            ),
            None => {
                let tool = BurnTool::for_current_platform()?;
                (tool, tool.program().to_string())
            }
        };

        if which::which(&program).is_err() {
            return Err(Error::BurnToolNotFound(program));
        }

        if tool == BurnTool::Cdburn && options.test_mode {
            warn!("cdburn has no simulation mode; test mode ignored");
        }

        let args = tool.args(device, image.path(), options);
        info!("Burning {} to {} with {}", image.path().display(), device, program);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = commands::stream_command(program.as_str(), &arg_refs, |line| {
            debug!("{}: {}", program, line);
            progress(line);
        })
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::BurnToolNotFound(program.clone()),
            _ => Error::Io(e),
        })?;

        if !output.success {
            error!("Burn failed with exit code {:?}", output.exit_code);
            if let Some(hint) = failure_hint(&output.stderr) {
                error!("{}", hint);
                progress(hint);
            }
            return Err(Error::BurnFailed {
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        info!("Burn to {} completed", device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::plan_disc;
    use crate::iso::build_image;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn image_in(dir: &Path) -> Result<(FinalizedImage, PathBuf)> {
        let track = dir.join("track.mp3");
        std::fs::write(&track, vec![1u8; 3000])?;
        let plan = plan_disc(&[track], "TEST")?;
        let path = dir.join("burn.iso");
        let image = build_image(&plan, &path)?;
        Ok((image, path))
    }

    #[test]
    fn test_wodim_args() {
        let options = BurnOptions {
            speed: Some(16),
            burn_proof: true,
            test_mode: true,
        };
        let args = BurnTool::Wodim.args("/dev/sr0", Path::new("/tmp/a.iso"), &options);
        assert_eq!(
            args,
            vec!["-v", "dev=/dev/sr0", "speed=16", "driveropts=burnfree", "-dummy", "/tmp/a.iso"]
        );

        let args = BurnTool::Wodim.args(
            "/dev/sr1",
            Path::new("/tmp/b.iso"),
            &BurnOptions {
                burn_proof: false,
                ..BurnOptions::default()
            },
        );
        assert_eq!(args, vec!["-v", "dev=/dev/sr1", "/tmp/b.iso"]);
    }

    #[test]
    fn test_cdburn_args() {
        let options = BurnOptions {
            speed: Some(8),
            ..BurnOptions::default()
        };
        let args = BurnTool::Cdburn.args("E:", Path::new("C:\\t\\a.iso"), &options);
        assert_eq!(args, vec!["E:", "C:\\t\\a.iso", "-speed", "8"]);
    }

    #[test]
    fn test_platform_selection() {
        assert_eq!(BurnTool::for_platform("linux").unwrap(), BurnTool::Wodim);
        assert_eq!(BurnTool::for_platform("windows").unwrap(), BurnTool::Cdburn);
        let err = BurnTool::for_platform("macos").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::UnsupportedPlatform);
    }

    #[test]
    fn test_failure_hint() {
        assert!(failure_hint("wodim: No disk / Wrong disk!").is_some());
        assert!(failure_hint("Device or resource busy").is_some());
        assert!(failure_hint("something odd").is_none());
    }

    #[test]
    fn test_failed_burn_removes_image() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let (image, path) = image_in(temp_dir.path())?;
        let burner = Burner::with_program("false");

        let err = burner
            .burn("/dev/null", image, &BurnOptions::default(), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BurnFailed);
        assert!(!path.exists());
        assert!(!burner.is_busy());
        Ok(())
    }

    #[test]
    fn test_successful_burn_streams_output() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let (image, path) = image_in(temp_dir.path())?;
        let burner = Burner::with_program("echo");

        let mut lines = Vec::new();
        burner.burn("/dev/null", image, &BurnOptions::default(), &mut |line| {
            lines.push(line.to_string())
        })?;
        assert!(!path.exists());
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(&path.to_string_lossy().to_string()));
        Ok(())
    }

    #[test]
    fn test_missing_tool_removes_image() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let (image, path) = image_in(temp_dir.path())?;
        let burner = Burner::with_program("nonexistent_burner_xyz123");

        let err = burner
            .burn("/dev/null", image, &BurnOptions::default(), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BurnToolNotFound);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_concurrent_burn_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let (image, path) = image_in(temp_dir.path())?;
        let burner = Burner::with_program("true");
        burner.busy.store(true, Ordering::SeqCst);

        let err = burner
            .burn("/dev/null", image, &BurnOptions::default(), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BurnInProgress);
        assert!(!path.exists());
        // The rejected request must not release the running burn's flag
        assert!(burner.is_busy());
        Ok(())
    }
}
