//! MusicBrainz recording search and Cover Art Archive client.

use crate::config::MetadataConfig;
use crate::error::{Error, Result};
use crate::tagger::{MetadataCandidate, MetadataLookup};
use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// MusicBrainz asks for at most one request per second.
const RATE_LIMIT_MS: u64 = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    recordings: Vec<Recording>,
}

#[derive(Debug, Deserialize)]
struct Recording {
    title: String,
    #[serde(rename = "artist-credit", default)]
    artist_credit: Vec<ArtistCredit>,
    #[serde(default)]
    releases: Vec<Release>,
    #[serde(rename = "first-release-date")]
    first_release_date: Option<String>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct ArtistCredit {
    name: String,
    #[serde(default)]
    joinphrase: String,
}

#[derive(Debug, Deserialize)]
struct Release {
    id: String,
    title: String,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
    #[serde(default)]
    count: i64,
}

impl Recording {
    fn into_candidate(self) -> MetadataCandidate {
        let artist = self
            .artist_credit
            .iter()
            .map(|credit| format!("{}{}", credit.name, credit.joinphrase))
            .collect::<String>();

        let genre = self
            .tags
            .iter()
            .max_by_key(|tag| tag.count)
            .map(|tag| tag.name.clone());

        let release = self.releases.into_iter().next();
        let date = release
            .as_ref()
            .and_then(|r| r.date.clone())
            .or(self.first_release_date)
            .unwrap_or_default();

        MetadataCandidate {
            title: self.title,
            artist,
            album: release.as_ref().map(|r| r.title.clone()).unwrap_or_default(),
            date,
            genre,
            release_id: release.map(|r| r.id),
        }
    }
}

fn candidates_from_response(body: &str) -> serde_json::Result<Vec<MetadataCandidate>> {
    let response: SearchResponse = serde_json::from_str(body)?;
    Ok(response
        .recordings
        .into_iter()
        .map(Recording::into_candidate)
        .collect())
}

/// Spaces requests at least `min_interval` apart.
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval_ms: u64) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    fn wait(&self) {
        let mut last = self
            .last_request
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                debug!("Rate limiting: waiting {:?}", wait_time);
                std::thread::sleep(wait_time);
            }
        }

        *last = Some(Instant::now());
    }
}

pub struct MusicBrainzClient {
    http: reqwest::blocking::Client,
    base_url: String,
    coverart_url: String,
    rate_limiter: RateLimiter,
}

impl MusicBrainzClient {
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::MetadataLookup {
                title: String::new(),
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            base_url: config.musicbrainz_url.trim_end_matches('/').to_string(),
            coverart_url: config.coverart_url.trim_end_matches('/').to_string(),
            rate_limiter: RateLimiter::new(RATE_LIMIT_MS),
        })
    }
}

impl MetadataLookup for MusicBrainzClient {
    fn search(&self, title: &str) -> Result<Vec<MetadataCandidate>> {
        let lookup_err = |message: String| Error::MetadataLookup {
            title: title.to_string(),
            message,
        };

        self.rate_limiter.wait();
        let url = format!("{}/recording/", self.base_url);
        debug!("Querying MusicBrainz: {} query={}", url, title);

        let response = self
            .http
            .get(&url)
            .query(&[("query", title), ("limit", "1"), ("fmt", "json")])
            .send()
            .map_err(|e| lookup_err(format!("MusicBrainz request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(lookup_err(format!("MusicBrainz returned HTTP {}", status)));
        }

        let body = response
            .text()
            .map_err(|e| lookup_err(format!("Failed to read response: {}", e)))?;
        candidates_from_response(&body)
            .map_err(|e| lookup_err(format!("Failed to parse JSON: {}", e)))
    }

    fn front_cover(&self, release_id: &str) -> Result<Vec<u8>> {
        let fetch_err = |message: String| Error::ArtworkFetch {
            release_id: release_id.to_string(),
            message,
        };

        let url = format!("{}/release/{}/front", self.coverart_url, release_id);
        debug!("Fetching cover art: {}", url);

        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|e| fetch_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(format!("HTTP {}", status)));
        }

        let bytes = response.bytes().map_err(|e| fetch_err(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
