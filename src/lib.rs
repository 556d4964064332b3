pub mod acquisition;
pub mod burn;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod dependencies;
pub mod disc;
pub mod error;
pub mod extractor;
pub mod iso;
pub mod logging;
pub mod musicbrainz;
pub mod paths;
pub mod playlist;
pub mod presets;
pub mod queue;
pub mod tagger;

pub use acquisition::{AcquisitionEvent, AcquisitionHandle, AcquisitionManager, RunSummary, Stage};
pub use burn::{BurnOptions, BurnTool, Burner};
pub use catalog::{Catalog, Track, TrackMetadata};
pub use config::Config;
pub use disc::{format_size, measure_capacity, plan_disc, CapacityReport, DiscPlan, DiscSession};
pub use error::{Error, ErrorKind, Result};
pub use extractor::{TrackExtractor, YtDlpExtractor};
pub use iso::{build_image, read_listing, FinalizedImage, ImageListing};
pub use musicbrainz::MusicBrainzClient;
pub use playlist::{PlaylistResolver, SpotifyResolver};
pub use presets::PresetStore;
pub use queue::BurnQueue;
pub use tagger::{ArtworkCache, MetadataLookup, Tagger};
