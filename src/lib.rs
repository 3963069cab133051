use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod mix;
pub mod queue;
pub mod scheduler;
pub mod telemetry;
pub mod worker;

pub use error::{JobError, QueueError, ValidationError};

pub type JobId = Uuid;

/// Message written onto a job that was cancelled while processing.
pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

/// The rendering variants a song can be turned into. Each one implies a
/// different audio mix, see [`mix::resolve`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VideoType {
    #[default]
    #[serde(rename = "Lyrics Video")]
    LyricsVideo,
    #[serde(rename = "Vocal Only")]
    VocalOnly,
    #[serde(rename = "Instrumental Only")]
    InstrumentalOnly,
    #[serde(rename = "Little Vocal")]
    LittleVocal,
}

impl VideoType {
    /// Render order for multi-version jobs.
    pub const ALL: [VideoType; 4] = [
        VideoType::LyricsVideo,
        VideoType::VocalOnly,
        VideoType::InstrumentalOnly,
        VideoType::LittleVocal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoType::LyricsVideo => "Lyrics Video",
            VideoType::VocalOnly => "Vocal Only",
            VideoType::InstrumentalOnly => "Instrumental Only",
            VideoType::LittleVocal => "Little Vocal",
        }
    }

    /// File-name friendly form.
    pub fn slug(&self) -> &'static str {
        match self {
            VideoType::LyricsVideo => "lyrics",
            VideoType::VocalOnly => "vocal",
            VideoType::InstrumentalOnly => "instrumental",
            VideoType::LittleVocal => "little-vocal",
        }
    }
}

impl fmt::Display for VideoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Complete,
    Error,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Complete | Status::Error)
    }

    /// `pending -> processing -> {complete | error}`, nothing else.
    pub fn can_transition_to(&self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Pending, Status::Processing)
                | (Status::Processing, Status::Complete)
                | (Status::Processing, Status::Error)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyricLine {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Audio inputs of a job: the full mix plus whichever stems were uploaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSources {
    #[serde(rename = "audioFile", default)]
    pub main: String,
    #[serde(rename = "instrumentalUrl", default, skip_serializing_if = "Option::is_none")]
    pub instrumental: Option<String>,
    #[serde(rename = "vocalUrl", default, skip_serializing_if = "Option::is_none")]
    pub vocal: Option<String>,
    #[serde(rename = "littleVocalUrl", default, skip_serializing_if = "Option::is_none")]
    pub little_vocal: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongMetadata {
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub song_title: String,
    #[serde(default)]
    pub video_type: VideoType,
    /// Layout and styling knobs, handed to the renderer untouched.
    #[serde(flatten)]
    pub display: serde_json::Map<String, serde_json::Value>,
}

/// Everything a caller submits to get a job queued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(flatten)]
    pub audio: AudioSources,
    #[serde(default)]
    pub lyrics: Vec<LyricLine>,
    #[serde(default)]
    pub duration_in_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_art_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub background_images: BTreeMap<VideoType, String>,
    #[serde(default)]
    pub metadata: SongMetadata,
    #[serde(default)]
    pub single_version: bool,
}

impl JobRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.audio.main.trim().is_empty() {
            return Err(ValidationError::MissingField("audioFile"));
        }
        if self.lyrics.is_empty() {
            return Err(ValidationError::MissingField("lyrics"));
        }
        if !self.duration_in_seconds.is_finite() || self.duration_in_seconds <= 0.0 {
            return Err(ValidationError::InvalidDuration(self.duration_in_seconds));
        }
        for (index, line) in self.lyrics.iter().enumerate() {
            if line.start.is_nan() || line.end.is_nan() || line.start > line.end {
                return Err(ValidationError::InvalidLyric {
                    index,
                    start: line.start,
                    end: line.end,
                });
            }
        }
        Ok(())
    }

    /// Per-type override, then the job-wide default, then nothing.
    pub fn background_for(&self, video_type: VideoType) -> Option<&str> {
        self.background_images
            .get(&video_type)
            .or(self.background_image_url.as_ref())
            .map(String::as_str)
    }

    pub fn video_types(&self) -> Vec<VideoType> {
        if self.single_version {
            vec![self.metadata.video_type]
        } else {
            VideoType::ALL.to_vec()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderJob {
    pub id: JobId,
    pub status: Status,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_video_type: Option<VideoType>,
    pub request: JobRequest,
    pub result: BTreeMap<VideoType, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RenderJob {
    pub(crate) fn new(request: JobRequest) -> Self {
        RenderJob {
            id: Uuid::new_v4(),
            status: Status::Pending,
            progress: 0.0,
            current_video_type: None,
            request,
            result: BTreeMap::new(),
            error: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_request() -> JobRequest {
    JobRequest {
        audio: AudioSources {
            main: "/uploads/audio/1.mp3".into(),
            ..Default::default()
        },
        lyrics: vec![
            LyricLine {
                start: 0.0,
                end: 2.5,
                text: "first line".into(),
            },
            LyricLine {
                start: 2.5,
                end: 5.0,
                text: "second line".into(),
            },
        ],
        duration_in_seconds: 5.0,
        metadata: SongMetadata {
            artist: "Artist".into(),
            song_title: "Song".into(),
            ..Default::default()
        },
        ..Default::default()
    }
}
