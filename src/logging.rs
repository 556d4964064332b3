use crate::paths;
use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging to both console and file.
pub fn init_logging() -> Result<()> {
    let logs_dir = paths::logs_dir()?;
    std::fs::create_dir_all(&logs_dir)?;

    // One log file per day
    let log_file = logs_dir.join(log_file_name(chrono::Local::now().date_naive()));

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)?;

    // Console subscriber
    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(true);

    // File subscriber
    let file_layer = fmt::layer()
        .with_target(true)
        .with_writer(file)
        .with_ansi(false);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!("Logging initialized. Log file: {}", log_file.display());

    Ok(())
}

fn log_file_name(date: chrono::NaiveDate) -> String {
    format!("discpress-{}.log", date.format("%Y-%m-%d"))
}
