use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use discpress::catalog::normalize_year;
use discpress::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "discpress", version, about = "Acquire, tag and catalog audio, then burn it to CD")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download, tag and catalog tracks. Each reference is a media URL,
    /// an "artist - title" search or a playlist URL.
    Acquire {
        #[arg(required = true)]
        references: Vec<String>,
    },
    /// Catalog audio files found under a directory (defaults to the download directory)
    Rescan { dir: Option<PathBuf> },
    /// List cataloged tracks
    List,
    /// Set a track's rating (0-5)
    Rate {
        path: PathBuf,
        #[arg(allow_negative_numbers = true)]
        rating: i64,
    },
    /// Edit a track's catalog metadata
    Edit {
        path: PathBuf,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        artist: Option<String>,
        #[arg(long)]
        album: Option<String>,
        #[arg(long)]
        year: Option<String>,
        #[arg(long)]
        genre: Option<String>,
    },
    /// Author a disc image from cataloged tracks and burn it
    Burn {
        files: Vec<PathBuf>,
        /// Start from a saved preset
        #[arg(long)]
        preset: Option<String>,
        #[arg(long, env = "DISCPRESS_DEVICE")]
        device: Option<String>,
        #[arg(long)]
        speed: Option<u32>,
        /// Simulate the burn with the laser off
        #[arg(long)]
        test: bool,
        #[arg(long)]
        no_burn_proof: bool,
        #[arg(long)]
        label: Option<String>,
        /// Write the image to this path instead of burning it
        #[arg(long, value_name = "ISO")]
        output: Option<PathBuf>,
    },
    /// Report how much of a disc a selection fills
    Capacity {
        files: Vec<PathBuf>,
        #[arg(long)]
        preset: Option<String>,
    },
    /// List the files in a disc image
    Inspect { image: PathBuf },
    /// Manage burn presets
    Preset {
        #[command(subcommand)]
        command: PresetCommand,
    },
    /// Check that external tools are installed
    Doctor,
}

#[derive(Subcommand)]
enum PresetCommand {
    List,
    Show { name: String },
    Save {
        name: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    Delete { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging().context("Failed to initialize logging")?;

    paths::ensure_data_dir()?;
    paths::ensure_config_dir()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Commands::Acquire { references } => acquire(&config, references).await,
        Commands::Rescan { dir } => rescan(&config, dir).await,
        Commands::List => list(&config),
        Commands::Rate { path, rating } => rate(&config, &path, rating),
        Commands::Edit {
            path,
            title,
            artist,
            album,
            year,
            genre,
        } => {
            let catalog = open_catalog(&config)?;
            let path = resolve_path(&path)?;
            let track = catalog
                .get(&path)?
                .with_context(|| format!("Not in the catalog: {}", path.display()))?;

            let mut metadata = track.metadata;
            if let Some(title) = title {
                metadata.title = title;
            }
            if let Some(artist) = artist {
                metadata.artist = artist;
            }
            if let Some(album) = album {
                metadata.album = album;
            }
            if let Some(year) = year {
                metadata.year = normalize_year(&year);
            }
            if let Some(genre) = genre {
                metadata.genre = genre;
            }

            catalog.update_metadata(&path, &metadata)?;
            println!("Updated {}", path.display());
            Ok(())
        }
        Commands::Burn {
            files,
            preset,
            device,
            speed,
            test,
            no_burn_proof,
            label,
            output,
        } => {
            let mut config = config;
            if let Some(device) = device {
                config.burn.device = device;
            }
            if label.is_some() {
                config.disc.volume_label = label;
            }
            let mut options = BurnOptions::from(&config.burn);
            if speed.is_some() {
                options.speed = speed;
            }
            options.test_mode |= test;
            if no_burn_proof {
                options.burn_proof = false;
            }
            burn(config, options, &files, preset.as_deref(), output).await
        }
        Commands::Capacity { files, preset } => capacity(&config, &files, preset.as_deref()),
        Commands::Inspect { image } => inspect(&image),
        Commands::Preset { command } => preset(&config, command),
        Commands::Doctor => {
            let config_file = Config::config_file_path()?;
            if !config_file.exists() {
                config.save()?;
                println!("Wrote default configuration");
            }
            println!("Config file: {}", config_file.display());
            println!("Catalog:     {}", config.database_path()?.display());
            println!("Downloads:   {}", config.download_dir()?.display());
            println!();
            let status = dependencies::check_dependencies(&config);
            status.print_summary();
            if !status.all_present() {
                anyhow::bail!("Missing tools: {}", status.missing.join(", "));
            }
            Ok(())
        }
    }
}

fn open_catalog(config: &Config) -> Result<Catalog> {
    let db_path = config.database_path()?;
    Catalog::open(&db_path)
        .with_context(|| format!("Failed to open catalog: {}", db_path.display()))
}

/// Catalog keys are absolute; resolve symlinks when the file exists.
fn resolve_path(path: &Path) -> Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(path) => Ok(path),
        Err(_) => paths::absolutize(path),
    }
}

fn build_manager(config: &Config) -> Result<AcquisitionManager> {
    let catalog = Arc::new(open_catalog(config)?);
    let extractor = Arc::new(YtDlpExtractor::new(&config.acquisition, config.download_dir()?));
    let lookup = Arc::new(MusicBrainzClient::new(&config.metadata)?);
    let tagger = Arc::new(Tagger::new(lookup, ArtworkCache::new(config.artwork_cache_dir()?)));
    let resolver = Arc::new(SpotifyResolver::new(config.spotify.clone())?);

    Ok(AcquisitionManager::new(
        extractor,
        tagger,
        catalog,
        config.acquisition.batch_delay(),
    )
    .with_resolver(resolver))
}

fn print_event(event: &AcquisitionEvent) {
    match event {
        AcquisitionEvent::RunStarted { total, batch: true } => {
            println!("Starting batch of {} tracks", total)
        }
        AcquisitionEvent::ItemStarted {
            index,
            total,
            reference,
        } => println!("[{}/{}] {}", index + 1, total, reference),
        AcquisitionEvent::StageChanged(stage) => info!("Stage: {:?}", stage),
        AcquisitionEvent::ItemCompleted {
            path,
            metadata,
            inserted,
            ..
        } => {
            let note = if *inserted { "" } else { " (already cataloged)" };
            println!(
                "  ✓ {} - {} [{}]{}",
                metadata.artist,
                metadata.title,
                path.display(),
                note
            );
        }
        AcquisitionEvent::ItemFailed {
            reference, message, ..
        } => println!("  ✗ {}: {}", reference, message),
        AcquisitionEvent::BatchCompleted { processed } => {
            println!("Batch complete: {} tracks", processed)
        }
        AcquisitionEvent::BatchHalted {
            reference,
            message,
            processed,
            discarded,
            ..
        } => println!(
            "  ✗ Batch halted at '{}' after {} tracks, {} skipped: {}",
            reference, processed, discarded, message
        ),
        AcquisitionEvent::RunStarted { .. } | AcquisitionEvent::Progress { .. } => {}
    }
}

async fn acquire(config: &Config, references: Vec<String>) -> Result<()> {
    let owned = config.clone();
    let manager = tokio::task::spawn_blocking(move || build_manager(&owned)).await??;
    let (handle, mut events) = AcquisitionHandle::spawn(manager);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let replies: Vec<_> = references
        .iter()
        .map(|reference| (reference.clone(), handle.submit(reference.clone())))
        .collect();

    let mut failed = 0;
    let mut inserted = 0;
    for (reference, reply) in replies {
        match reply.await {
            Ok(Ok(summary)) => inserted += summary.inserted,
            Ok(Err(e)) => {
                warn!("Acquisition of '{}' failed: {}", reference, e);
                failed += 1;
            }
            Err(_) => anyhow::bail!("Acquisition worker stopped unexpectedly"),
        }
    }

    handle.shutdown().await;
    printer.await?;

    println!("{} new tracks cataloged", inserted);
    if failed > 0 {
        anyhow::bail!("{} of {} acquisitions failed", failed, references.len());
    }
    Ok(())
}

async fn rescan(config: &Config, dir: Option<PathBuf>) -> Result<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => config.download_dir()?,
    };
    paths::validate_dir(&dir)?;

    let catalog = open_catalog(config)?;
    let added = tokio::task::spawn_blocking(move || catalog.rescan(&dir)).await??;
    println!("{} new tracks cataloged", added);
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let tracks = open_catalog(config)?.list_all()?;
    if tracks.is_empty() {
        println!("The catalog is empty");
        return Ok(());
    }

    for track in &tracks {
        let m = &track.metadata;
        println!(
            "{:<5} {} - {} ({}, {}) {}",
            "★".repeat(track.rating as usize),
            m.artist,
            m.title,
            m.album,
            m.year,
            track.path.display()
        );
    }
    println!("\n{} tracks", tracks.len());
    Ok(())
}

fn rate(config: &Config, path: &Path, rating: i64) -> Result<()> {
    let path = resolve_path(path)?;
    if !open_catalog(config)?.update_rating(&path, rating)? {
        anyhow::bail!("Not in the catalog: {}", path.display());
    }
    println!("Rated {} ({}/5)", path.display(), rating.clamp(0, 5));
    Ok(())
}

fn open_presets() -> Result<PresetStore> {
    let file = paths::presets_file()?;
    PresetStore::open(&file).with_context(|| format!("Failed to load presets: {}", file.display()))
}

fn build_queue(catalog: &Catalog, files: &[PathBuf], preset: Option<&str>) -> Result<BurnQueue> {
    let mut queue = BurnQueue::new();
    if let Some(name) = preset {
        let store = open_presets()?;
        if !store.contains(name) {
            anyhow::bail!("Unknown preset: {}", name);
        }
        let loaded = queue.load_preset(&store, name, catalog)?;
        info!("Loaded {} tracks from preset '{}'", loaded, name);
    }

    for file in files {
        let path = resolve_path(file)?;
        if !queue.add(catalog, &path)? && !queue.contains(&path) {
            warn!(
                "Skipping {}: not in the catalog (run `discpress rescan` first)",
                path.display()
            );
        }
    }
    Ok(queue)
}

fn print_capacity(report: &CapacityReport) {
    println!(
        "{} files, {} of {} ({:.1}%)",
        report.file_count,
        format_size(report.total_bytes),
        format_size(report.capacity_bytes),
        report.percent()
    );
    for path in &report.missing {
        println!("  missing: {}", path.display());
    }
    if report.is_over_capacity() {
        println!(
            "  Warning: over capacity by {}",
            format_size(report.remaining_bytes().unsigned_abs())
        );
    }
}

async fn burn(
    config: Config,
    options: BurnOptions,
    files: &[PathBuf],
    preset: Option<&str>,
    output: Option<PathBuf>,
) -> Result<()> {
    let catalog = open_catalog(&config)?;
    let queue = build_queue(&catalog, files, preset)?;
    if queue.is_empty() {
        anyhow::bail!("Nothing to burn: none of the selected files are cataloged");
    }
    print_capacity(&queue.capacity(config.capacity_bytes()));

    let burner = Arc::new(Burner::from_config(&config.burn));
    let session = Arc::new(DiscSession::from_config(&config, burner).with_options(options));
    let paths = queue.paths().to_vec();

    if let Some(output) = output {
        let image = {
            let session = Arc::clone(&session);
            tokio::task::spawn_blocking(move || session.author(&paths)).await??
        };
        let staged = image.persist();
        if std::fs::rename(&staged, &output).is_err() {
            std::fs::copy(&staged, &output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            std::fs::remove_file(&staged)?;
        }
        println!("Image written to {}", output.display());
        return Ok(());
    }

    println!("Burning to {}", session.device());
    let (task, mut progress) = session.spawn_burn(paths);
    while let Some(line) = progress.recv().await {
        println!("{}", line);
    }
    task.await??;
    println!("Burn complete");
    Ok(())
}

fn capacity(config: &Config, files: &[PathBuf], preset: Option<&str>) -> Result<()> {
    let mut selection = match preset {
        Some(name) => open_presets()?.load(name),
        None => Vec::new(),
    };
    for file in files {
        selection.push(resolve_path(file)?);
    }
    print_capacity(&measure_capacity(&selection, config.capacity_bytes()));
    Ok(())
}

fn inspect(image: &Path) -> Result<()> {
    let listing = read_listing(image)?;
    println!(
        "Volume {} ({} sectors, Joliet: {})",
        listing.volume_label,
        listing.volume_sectors,
        if listing.joliet { "yes" } else { "no" }
    );
    for entry in &listing.entries {
        println!(
            "{:>8}  {:>10}  {:<12}  {}",
            entry.lba,
            entry.size,
            entry.short_name,
            entry.long_name.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn preset(config: &Config, command: PresetCommand) -> Result<()> {
    let mut store = open_presets()?;
    match command {
        PresetCommand::List => {
            for name in store.names() {
                let note = if presets::is_reserved(&name) { " (built-in)" } else { "" };
                println!("{}{}", name, note);
            }
        }
        PresetCommand::Show { name } => {
            if !store.contains(&name) {
                anyhow::bail!("Unknown preset: {}", name);
            }
            let catalog = open_catalog(config)?;
            for path in store.load(&name) {
                let note = if catalog.contains(&path)? { "" } else { " (not cataloged)" };
                println!("{}{}", path.display(), note);
            }
        }
        PresetCommand::Save { name, files } => {
            let paths = files
                .iter()
                .map(|file| resolve_path(file))
                .collect::<Result<Vec<_>>>()?;
            store.save(&name, &paths)?;
            println!("Saved preset '{}' ({} files)", name, paths.len());
        }
        PresetCommand::Delete { name } => {
            if store.delete(&name)? {
                println!("Deleted preset '{}'", name);
            } else if presets::is_reserved(&name) {
                println!("'{}' is built-in and was left unchanged", name);
            } else {
                println!("No preset named '{}'", name);
            }
        }
    }
    Ok(())
}
