//! Audio mix selection per video type.
//!
//! Every variant is rendered from whichever uploaded sources best match it.
//! The renderer gets an ordered list of tracks to play together.

use serde::{Deserialize, Serialize};

use crate::{AudioSources, VideoType};

/// Volume of the vocal stem when "Little Vocal" is built from separate stems.
pub const LITTLE_VOCAL_VOLUME: f64 = 0.12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub source: String,
    pub volume: f64,
}

impl AudioTrack {
    fn full(source: &str) -> Self {
        AudioTrack {
            source: source.to_string(),
            volume: 1.0,
        }
    }
}

fn available(source: &Option<String>) -> Option<&str> {
    source.as_deref().filter(|s| !s.trim().is_empty())
}

/// Picks the tracks for `video_type`. Empty when not even the main mix exists.
pub fn resolve(video_type: VideoType, sources: &AudioSources) -> Vec<AudioTrack> {
    let main = Some(sources.main.as_str()).filter(|s| !s.trim().is_empty());
    let instrumental = available(&sources.instrumental);
    let vocal = available(&sources.vocal);

    let stem = match video_type {
        VideoType::LyricsVideo => None,
        VideoType::VocalOnly => vocal,
        VideoType::InstrumentalOnly => instrumental,
        VideoType::LittleVocal => {
            if let Some(premix) = available(&sources.little_vocal) {
                Some(premix)
            } else if let (Some(instrumental), Some(vocal)) = (instrumental, vocal) {
                return vec![
                    AudioTrack::full(instrumental),
                    AudioTrack {
                        source: vocal.to_string(),
                        volume: LITTLE_VOCAL_VOLUME,
                    },
                ];
            } else {
                None
            }
        }
    };

    stem.or(main).map(AudioTrack::full).into_iter().collect()
}
