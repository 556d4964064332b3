use crate::config::SpotifyConfig;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_URL: &str = "https://api.spotify.com/v1";
const PAGE_SIZE: u32 = 100;

/// Expands a playlist reference into per-track search strings.
pub trait PlaylistResolver: Send + Sync {
    fn is_playlist(&self, reference: &str) -> bool;

    /// Ordered "artist - title" strings, one per playable track.
    fn resolve(&self, reference: &str) -> Result<Vec<String>>;
}

/// Extract the playlist id from an open.spotify.com URL or a spotify: URI.
pub fn spotify_playlist_id(reference: &str) -> Option<&str> {
    let r = reference.trim();
    let id = if let Some(rest) = r.strip_prefix("spotify:playlist:") {
        rest
    } else {
        let start = r.find("open.spotify.com/")?;
        let path = &r[start + "open.spotify.com/".len()..];
        // Locale prefixes such as /intl-de/ precede the resource type
        let path = match path.strip_prefix("intl-") {
            Some(rest) => rest.split_once('/').map(|(_, p)| p).unwrap_or(""),
            None => path,
        };
        path.strip_prefix("playlist/")?
    };

    let id = id.split(['?', '#', '/']).next().unwrap_or("");
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(id)
    } else {
        None
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct TracksPage {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    track: Option<SpotifyTrack>,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    name: String,
    #[serde(default)]
    artists: Vec<SpotifyArtist>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    name: String,
}

fn search_strings(page: TracksPage) -> (Vec<String>, Option<String>) {
    let queries = page
        .items
        .into_iter()
        .filter_map(|item| item.track)
        .filter(|track| !track.name.trim().is_empty())
        .map(|track| match track.artists.first() {
            Some(artist) => format!("{} - {}", artist.name, track.name),
            None => track.name,
        })
        .collect();
    (queries, page.next)
}

/// Spotify Web API resolver using the client-credentials flow.
pub struct SpotifyResolver {
    http: reqwest::blocking::Client,
    credentials: SpotifyConfig,
}

impl SpotifyResolver {
    pub fn new(credentials: SpotifyConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::PlaylistResolution(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, credentials })
    }

    fn access_token(&self) -> Result<String> {
        if !self.credentials.has_credentials() {
            return Err(Error::PlaylistResolution(
                "Spotify client id and secret are not configured".to_string(),
            ));
        }

        let response = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .map_err(|e| Error::PlaylistResolution(format!("Token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::PlaylistResolution(format!(
                "Spotify rejected the credentials (HTTP {})",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .map_err(|e| Error::PlaylistResolution(format!("Bad token response: {}", e)))?;
        Ok(token.access_token)
    }

    fn fetch_page(&self, url: &str, token: &str) -> Result<TracksPage> {
        debug!("Fetching playlist page: {}", url);
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .map_err(|e| Error::PlaylistResolution(format!("Playlist request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::PlaylistResolution(format!(
                "Spotify returned HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .map_err(|e| Error::PlaylistResolution(format!("Bad playlist response: {}", e)))
    }
}

impl PlaylistResolver for SpotifyResolver {
    fn is_playlist(&self, reference: &str) -> bool {
        spotify_playlist_id(reference).is_some()
    }

    fn resolve(&self, reference: &str) -> Result<Vec<String>> {
        let id = spotify_playlist_id(reference).ok_or_else(|| {
            Error::PlaylistResolution(format!("Not a Spotify playlist: {}", reference))
        })?;

        let token = self.access_token()?;
        let mut url = Some(format!(
            "{}/playlists/{}/tracks?limit={}&fields=items(track(name,artists(name))),next",
            API_URL, id, PAGE_SIZE
        ));

        let mut queries = Vec::new();
        while let Some(page_url) = url {
            let (mut page, next) = search_strings(self.fetch_page(&page_url, &token)?);
            queries.append(&mut page);
            url = next;
        }

        if queries.is_empty() {
            return Err(Error::PlaylistResolution(format!(
                "Playlist {} has no playable tracks",
                id
            )));
        }

        info!("Resolved playlist {} to {} tracks", id, queries.len());
        Ok(queries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spotify_playlist_id() {
        assert_eq!(
            spotify_playlist_id("https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M?si=abc"),
            Some("37i9dQZF1DXcBWIGoYBM5M")
        );
        assert_eq!(
            spotify_playlist_id("https://open.spotify.com/intl-de/playlist/37i9dQZF1DX"),
            Some("37i9dQZF1DX")
        );
        assert_eq!(spotify_playlist_id("spotify:playlist:abc123"), Some("abc123"));
        assert_eq!(spotify_playlist_id("https://open.spotify.com/track/abc123"), None);
        assert_eq!(spotify_playlist_id("https://www.youtube.com/watch?v=x"), None);
        assert_eq!(spotify_playlist_id("Artist - Title"), None);
    }

    #[test]
    fn test_search_strings_from_page() {
        let body = r#"{
            "items": [
                {"track": {"name": "Windowlicker", "artists": [{"name": "Aphex Twin"}]}},
                {"track": null},
                {"track": {"name": "Roygbiv", "artists": [{"name": "Boards of Canada"}, {"name": "X"}]}},
                {"track": {"name": "Untitled", "artists": []}}
            ],
            "next": "https://api.spotify.com/v1/playlists/x/tracks?offset=100"
        }"#;
        let page: TracksPage = serde_json::from_str(body).unwrap();
        let (queries, next) = search_strings(page);
        assert_eq!(
            queries,
            vec![
                "Aphex Twin - Windowlicker",
                "Boards of Canada - Roygbiv",
                "Untitled"
            ]
        );
        assert!(next.unwrap().contains("offset=100"));
    }

    #[test]
    fn test_missing_credentials_is_resolution_error() {
        let resolver = SpotifyResolver::new(SpotifyConfig::default()).unwrap();
        assert!(resolver.is_playlist("spotify:playlist:abc"));
        let err = resolver.resolve("spotify:playlist:abc").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PlaylistResolution);
    }
}
