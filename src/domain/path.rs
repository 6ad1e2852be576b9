//! Path resolver
//!
//! Media paths address published and subscribed media:
//! - publish: `<local>/` (a single component without trailing slash gets one appended)
//! - subscribe: `<cname>/<local>/` for every kind, or `<cname>/<local>/<kind>` for one kind
//!
//! A track path is its media path followed by the kind, e.g. `alice/cam/video`.
//! `MediaPath` and `TrackPath` can only be built through [`PathResolver`].

use crate::domain::shared::{MediaKind, Result, SessionError};
use serde::Serialize;
use std::borrow::Borrow;
use std::fmt;

/// Canonical media path, always ending with `/`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MediaPath(String);

impl MediaPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the track of `kind` under this media
    pub fn track(&self, kind: MediaKind) -> TrackPath {
        TrackPath(format!("{}{}", self.0, kind.as_str()))
    }
}

impl fmt::Display for MediaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for MediaPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Path of a single track: media path + kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TrackPath(String);

impl TrackPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> MediaKind {
        // constructed only from MediaPath::track, so the suffix is always a kind
        if self.0.ends_with(MediaKind::Audio.as_str()) {
            MediaKind::Audio
        } else {
            MediaKind::Video
        }
    }

    /// The owning media path (kind suffix stripped)
    pub fn media_path(&self) -> MediaPath {
        let kind_len = self.kind().as_str().len();
        MediaPath(self.0[..self.0.len() - kind_len].to_string())
    }

    /// First path component; the publisher's cname for subscribed tracks
    pub fn cname(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }
}

impl fmt::Display for TrackPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TrackPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Canonical subscribe target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribePath {
    /// Every kind under a media directory
    Directory(MediaPath),
    /// A single kind
    Track(TrackPath),
}

impl SubscribePath {
    /// The canonical string sent to the remote peer
    pub fn canonical(&self) -> &str {
        match self {
            SubscribePath::Directory(p) => p.as_str(),
            SubscribePath::Track(p) => p.as_str(),
        }
    }

    pub fn kind(&self) -> Option<MediaKind> {
        match self {
            SubscribePath::Directory(_) => None,
            SubscribePath::Track(p) => Some(p.kind()),
        }
    }

    pub fn media_path(&self) -> MediaPath {
        match self {
            SubscribePath::Directory(p) => p.clone(),
            SubscribePath::Track(p) => p.media_path(),
        }
    }

    /// Track paths covered by this target
    pub fn track_paths(&self) -> Vec<TrackPath> {
        match self {
            SubscribePath::Directory(p) => MediaKind::all().iter().map(|k| p.track(*k)).collect(),
            SubscribePath::Track(p) => vec![p.clone()],
        }
    }
}

/// Canonicalizes application path strings
pub struct PathResolver;

impl PathResolver {
    /// Canonical path for publishing
    pub fn publish(path: &str) -> Result<MediaPath> {
        let parsed: Vec<&str> = path.split('/').collect();
        if parsed.iter().all(|c| c.is_empty()) {
            return Err(SessionError::Configuration(format!(
                "invalid path: '{}': empty",
                path
            )));
        }
        if parsed.len() == 1 {
            return Ok(MediaPath(format!("{}/", path)));
        }
        if parsed.last().map_or(false, |c| !c.is_empty()) {
            return Err(SessionError::Configuration(format!(
                "invalid path: {}: should be ended with /",
                path
            )));
        }
        Ok(MediaPath(path.to_string()))
    }

    /// Canonical target for subscribing
    pub fn subscribe(path: &str) -> Result<SubscribePath> {
        let parsed: Vec<&str> = path.split('/').collect();
        if parsed.len() < 2 || parsed[0].is_empty() {
            return Err(SessionError::Configuration(format!(
                "invalid path: {}: at least ${{cname}}/${{single_component_local_path}} required",
                path
            )));
        }
        let last = parsed[parsed.len() - 1];
        if parsed.len() == 2 {
            if MediaKind::from_str_opt(last).is_some() {
                return Err(SessionError::Configuration(format!(
                    "invalid path: {}: has single component local_path but the component seems to be media kind",
                    path
                )));
            }
            if last.is_empty() {
                return Err(SessionError::Configuration(format!(
                    "invalid path: {}: local_path is empty",
                    path
                )));
            }
            return Ok(SubscribePath::Directory(MediaPath(format!("{}/", path))));
        }
        if last.is_empty() {
            return Ok(SubscribePath::Directory(MediaPath(path.to_string())));
        }
        match MediaKind::from_str_opt(last) {
            Some(kind) => {
                let directory = &path[..path.len() - last.len()];
                Ok(SubscribePath::Track(MediaPath(directory.to_string()).track(kind)))
            }
            None => Ok(SubscribePath::Directory(MediaPath(format!("{}/", path)))),
        }
    }

    /// Parse a track path coming from the remote peer (`mid_media_path_map`, notifications)
    pub fn track(path: &str) -> Result<TrackPath> {
        let (directory, last) = match path.rfind('/') {
            Some(i) => (&path[..=i], &path[i + 1..]),
            None => {
                return Err(SessionError::Configuration(format!(
                    "invalid track path: {}",
                    path
                )))
            }
        };
        match MediaKind::from_str_opt(last) {
            Some(kind) => Ok(MediaPath(directory.to_string()).track(kind)),
            None => Err(SessionError::Configuration(format!(
                "invalid track path: {}: no media kind",
                path
            ))),
        }
    }
}
