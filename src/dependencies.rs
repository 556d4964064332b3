use crate::burn::BurnTool;
use crate::commands;
use crate::config::Config;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Check if a command is available in PATH.
pub fn check_command(command: &str) -> Option<PathBuf> {
    which::which(command).ok()
}

/// Transcoder the extractor hands audio to.
pub const TRANSCODER: &str = "ffmpeg";

/// Commands required for the given configuration, in check order.
///
/// The burner depends on the platform unless the config overrides it.
pub fn required_commands(config: &Config) -> Vec<String> {
    let mut commands = vec![config.acquisition.extractor.clone()];
    if config.acquisition.extractor != TRANSCODER {
        commands.push(TRANSCODER.to_string());
    }

    match &config.burn.program {
        Some(program) => commands.push(program.clone()),
        None => {
            if let Ok(tool) = BurnTool::for_current_platform() {
                commands.push(tool.program().to_string());
            }
        }
    }
    commands
}

/// Check all dependencies and return the missing ones.
pub fn check_dependencies(config: &Config) -> DependencyStatus {
    let mut missing = Vec::new();
    let mut found = Vec::new();

    for cmd in required_commands(config) {
        match check_command(&cmd) {
            Some(path) => {
                debug!("Found command: {} at {}", cmd, path.display());
                found.push((cmd, path));
            }
            None => {
                warn!("Missing command: {}", cmd);
                missing.push(cmd);
            }
        }
    }

    let burner_supported = config.burn.program.is_some() || BurnTool::for_current_platform().is_ok();

    DependencyStatus {
        missing,
        found,
        burner_supported,
    }
}

/// First line of `<command> --version`, when the tool reports one.
pub fn tool_version(command: &str) -> Option<String> {
    let stdout = commands::execute_command_capture_stdout(command, &["--version"]).ok()?;
    stdout
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
}

/// Get installation hints for common platforms.
fn installation_hint(command: &str) -> Option<&'static str> {
    match command {
        "yt-dlp" => Some("pipx install yt-dlp, or sudo apt install yt-dlp (Debian/Ubuntu)"),
        "ffmpeg" => Some("sudo apt install ffmpeg (Debian/Ubuntu) or sudo dnf install ffmpeg (Fedora/RHEL)"),
        "wodim" => Some("sudo apt install wodim (Debian/Ubuntu) or sudo dnf install wodim (Fedora/RHEL)"),
        "cdburn" => Some("Install the Windows Server Resource Kit tools and add cdburn.exe to PATH"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct DependencyStatus {
    pub missing: Vec<String>,
    pub found: Vec<(String, PathBuf)>,
    pub burner_supported: bool,
}

impl DependencyStatus {
    pub fn all_present(&self) -> bool {
        self.missing.is_empty()
    }

    /// Print a summary of dependency status.
    pub fn print_summary(&self) {
        for (cmd, path) in &self.found {
            match tool_version(cmd) {
                Some(version) => println!("✓ {} at {} ({})", cmd, path.display(), version),
                None => println!("✓ {} at {}", cmd, path.display()),
            }
        }

        for cmd in &self.missing {
            println!("✗ {} not found", cmd);
            if let Some(hint) = installation_hint(cmd) {
                println!("    Hint: {}", hint);
            }
        }

        if !self.burner_supported {
            println!("✗ Disc burning is not supported on this platform");
        }

        if self.missing.is_empty() && self.burner_supported {
            println!("\nAll dependencies are available");
        }
    }
}
