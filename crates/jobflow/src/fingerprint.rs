//! Content fingerprints used as dedup keys.
//!
//! A fingerprint is a lowercase SHA-256 hex digest of a normalized input.
//! URLs are canonicalized first so that trivially different links to the
//! same resource (tracking parameters, fragments, query order, YouTube
//! short links) collapse onto one key.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid"];

const YOUTUBE_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
];

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),
}

/// Deterministic key of a normalized input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an already computed key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// SHA-256 of raw bytes, e.g. an uploaded file.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// SHA-256 of the canonical form of `raw`.
    pub fn of_url(raw: &str) -> Result<Self, FingerprintError> {
        let canonical = canonical_url(raw)?;
        Ok(Self::of_bytes(canonical.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for Fingerprint {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Returns the canonical string form of an http(s) URL.
pub fn canonical_url(raw: &str) -> Result<String, FingerprintError> {
    let url = Url::parse(raw.trim()).map_err(|source| FingerprintError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(FingerprintError::UnsupportedScheme(url.scheme().to_string()));
    }

    if let Some(video_id) = youtube_video_id(&url) {
        return Ok(format!("youtube:{video_id}"));
    }

    // Url already lowercases scheme and host and drops default ports.
    let mut canonical = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        canonical.push_str(&format!(":{port}"));
    }

    let path = url.path().trim_end_matches('/');
    canonical.push_str(path);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    if !pairs.is_empty() {
        let query = pairs
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!("{key}={value}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        canonical.push('?');
        canonical.push_str(&query);
    }

    Ok(canonical)
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Extracts the video id from watch, shorts, embed, live and youtu.be links.
pub fn youtube_video_id(url: &Url) -> Option<String> {
    let host = url.host_str()?;

    let candidate: Option<String> = if host == "youtu.be" {
        url.path_segments()?.next().map(str::to_string)
    } else if YOUTUBE_HOSTS.contains(&host) {
        let mut segments = url.path_segments()?;
        match segments.next() {
            Some("watch") => url
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned()),
            Some("shorts") | Some("embed") | Some("live") | Some("v") => {
                segments.next().map(str::to_string)
            }
            _ => None,
        }
    } else {
        None
    };

    candidate.filter(|id| is_video_id(id))
}

fn is_video_id(candidate: &str) -> bool {
    candidate.len() == 11
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
