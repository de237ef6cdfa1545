//! Media stream handles
//!
//! Capture and rendering live outside this crate. What the call layer needs is
//! an opaque stream made of tracks that can be enabled, disabled and stopped,
//! plus an asynchronous way to acquire the local camera/microphone stream.
//!
//! Stopping a track releases the underlying device. Every teardown path must
//! stop each locally acquired track exactly once, so tracks count how often
//! `stop` was called.

use crate::types::MediaConstraints;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Local media acquisition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user refused camera/microphone access
    #[error("Permission denied")]
    PermissionDenied,

    /// No usable device
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Microphone
    Audio,
    /// Camera
    Video,
}

#[derive(Debug)]
struct TrackState {
    enabled: AtomicBool,
    stop_calls: AtomicU32,
}

impl TrackState {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            stop_calls: AtomicU32::new(0),
        }
    }
}

/// A single audio or video track
///
/// Clones share state: stopping one clone stops them all.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    state: Arc<TrackState>,
}

impl MediaTrack {
    /// Create a live, enabled track
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            state: Arc::new(TrackState::new()),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Whether the track currently carries media
    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track without releasing the device
    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop the track and release the device
    ///
    /// Returns `true` the first time.
    pub fn stop(&self) -> bool {
        self.state.stop_calls.fetch_add(1, Ordering::SeqCst) == 0
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.stop_count() > 0
    }

    /// How many times `stop` has been called
    pub fn stop_count(&self) -> u32 {
        self.state.stop_calls.load(Ordering::SeqCst)
    }
}

/// A set of tracks travelling together
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Create a stream from tracks
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Create a stream with fresh tracks matching the constraints
    pub fn from_constraints(constraints: MediaConstraints) -> Self {
        let id = Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        if constraints.has_audio() {
            tracks.push(MediaTrack::new(format!("{id}/audio"), TrackKind::Audio));
        }
        if constraints.has_video() {
            tracks.push(MediaTrack::new(format!("{id}/video"), TrackKind::Video));
        }
        Self { id, tracks }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Audio tracks
    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Audio)
    }

    /// Video tracks
    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Video)
    }

    /// Enable or disable every audio track (mute)
    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_tracks().for_each(|t| t.set_enabled(enabled));
    }

    /// Enable or disable every video track (hide camera)
    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_tracks().for_each(|t| t.set_enabled(enabled));
    }

    /// Stop every track, returning how many were newly stopped
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    /// Whether every track has been stopped
    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(MediaTrack::is_stopped)
    }

    /// The stream as seen by the receiving peer
    ///
    /// Same ids, independent state: stopping the received copy does not
    /// release the sender's devices.
    #[must_use]
    pub fn remote_view(&self) -> Self {
        Self {
            id: self.id.clone(),
            tracks: self
                .tracks
                .iter()
                .map(|t| MediaTrack::new(t.id.clone(), t.kind))
                .collect(),
        }
    }
}

/// Local media acquisition capability
///
/// Acquisition may take arbitrary time (a permission prompt) and may fail.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire a local stream matching the constraints
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError>;
}

/// Media source that fabricates streams
///
/// Stands in for a camera/microphone. Every stream it hands out is recorded
/// so callers can check that the tracks were released.
#[derive(Debug, Default)]
pub struct SyntheticMediaSource {
    delay: Option<Duration>,
    failure: Option<MediaError>,
    issued: Mutex<Vec<MediaStream>>,
}

impl SyntheticMediaSource {
    /// Source that succeeds immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Source that always fails with `error`
    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    /// Wait `delay` before answering, like a permission prompt
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Streams handed out so far
    pub fn issued(&self) -> Vec<MediaStream> {
        self.issued.lock().clone()
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.failure {
            tracing::debug!(error = %err, "Synthetic media acquisition failed");
            return Err(err.clone());
        }
        let stream = MediaStream::from_constraints(constraints);
        tracing::debug!(stream_id = %stream.id(), tracks = stream.tracks().len(), "Synthetic stream acquired");
        self.issued.lock().push(stream.clone());
        Ok(stream)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_track_stop_counts_calls() {
        let track = MediaTrack::new("t1", TrackKind::Audio);
        assert!(!track.is_stopped());
        assert!(track.stop());
        assert!(!track.stop());
        assert_eq!(track.stop_count(), 2);
    }

    #[test]
    fn test_stream_from_constraints() {
        let stream = MediaStream::from_constraints(MediaConstraints::video_call());
        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 1);

        let audio = MediaStream::from_constraints(MediaConstraints::audio_only());
        assert_eq!(audio.tracks().len(), 1);
        assert_eq!(audio.video_tracks().count(), 0);
    }

    #[test]
    fn test_mute_and_hide() {
        let stream = MediaStream::from_constraints(MediaConstraints::video_call());
        stream.set_audio_enabled(false);
        assert!(stream.audio_tracks().all(|t| !t.is_enabled()));
        assert!(stream.video_tracks().all(MediaTrack::is_enabled));

        stream.set_video_enabled(false);
        assert!(stream.video_tracks().all(|t| !t.is_enabled()));
    }

    #[test]
    fn test_remote_view_is_independent() {
        let local = MediaStream::from_constraints(MediaConstraints::video_call());
        let remote = local.remote_view();
        assert_eq!(remote.id(), local.id());

        assert_eq!(remote.stop_all(), 2);
        assert!(remote.is_stopped());
        assert!(!local.is_stopped());
    }

    #[test]
    fn test_clones_share_state() {
        let stream = MediaStream::from_constraints(MediaConstraints::audio_only());
        let clone = stream.clone();
        assert_eq!(clone.stop_all(), 1);
        assert!(stream.is_stopped());
        assert_eq!(stream.stop_all(), 0);
    }

    #[tokio::test]
    async fn test_synthetic_source_records_streams() {
        let source = SyntheticMediaSource::new();
        let stream = source.acquire(MediaConstraints::default()).await.unwrap();
        let issued = source.issued();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].id(), stream.id());
    }

    #[tokio::test]
    async fn test_synthetic_source_failure() {
        let source = SyntheticMediaSource::failing(MediaError::PermissionDenied);
        let result = source.acquire(MediaConstraints::default()).await;
        assert_eq!(result.unwrap_err(), MediaError::PermissionDenied);
        assert!(source.issued().is_empty());
    }
}
