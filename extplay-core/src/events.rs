//! Typed playback events decoded from the player wire protocol.
//!
//! Every record is a JSON object with exactly one top-level key naming
//! the event; the value carries an `sts` status field (0 = success) and
//! type-specific fields. Field names are part of the external contract
//! with the player binaries and must not be renamed.
//!
//! Missing required fields make a record undecodable: it is logged and
//! dropped, never a crash and never a half-filled event.

use serde::Serialize;
use serde_json::Value;

use crate::subtitles::SubtitleCue;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AudioTrack {
    pub id: i32,
    /// ISO-639 code if the player knows it.
    pub language: String,
    /// Clear text codec description.
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubtitleTrack {
    pub id: i32,
    pub language: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoTrack {
    pub id: i32,
    pub language: String,
    pub description: String,
    pub width: i32,
    pub height: i32,
    pub framerate: i32,
    /// -1 when the player predates the `p` field.
    pub progressive: i32,
}

impl Default for VideoTrack {
    fn default() -> Self {
        VideoTrack {
            id: -1,
            language: String::new(),
            description: String::new(),
            width: -1,
            height: -1,
            framerate: -1,
            progressive: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerErrorMessage {
    pub code: i32,
    pub message: String,
}

/// One decoded wire event.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Started { ok: bool },
    /// Decoded for the log only; process exit is the authoritative stop
    /// signal.
    Stopped { ok: bool },
    Paused { ok: bool },
    Resumed { ok: bool },
    SeekDone { ok: bool },
    SeekRelativeDone { ok: bool },
    Length { ms: i64 },
    Position { ms: i64 },
    AudioList(Vec<AudioTrack>),
    AudioCurrent(AudioTrack),
    AudioSelected { ok: bool, id: i32 },
    SubtitleList(Vec<SubtitleTrack>),
    SubtitleCurrent(SubtitleTrack),
    SubtitleSelected { ok: bool, id: i32 },
    VideoCurrent(VideoTrack),
    Subtitle(SubtitleCue),
    Error(PlayerErrorMessage),
}

// ============================================================================
// Field helpers
// ============================================================================

pub(crate) fn int_field(value: &Value, key: &str) -> Option<i64> {
    value.get(key).and_then(Value::as_i64)
}

pub(crate) fn float_field(value: &Value, key: &str) -> Option<f64> {
    value.get(key).and_then(Value::as_f64)
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Start/stop/pause/continue/seek events succeed when the status field is
/// absent or zero.
pub(crate) fn status_ok(value: &Value) -> bool {
    int_field(value, "sts").unwrap_or(0) == 0
}

/// Split a record into its single top-level key and value.
pub(crate) fn single_entry(record: &Value) -> Option<(&str, &Value)> {
    let object = record.as_object()?;
    let mut entries = object.iter();
    let (key, value) = entries.next()?;
    Some((key.as_str(), value))
}

fn audio_track(value: &Value) -> Option<AudioTrack> {
    Some(AudioTrack {
        id: int_field(value, "id")? as i32,
        description: str_field(value, "e")?.to_string(),
        language: str_field(value, "n")?.to_string(),
    })
}

fn subtitle_track(value: &Value) -> Option<SubtitleTrack> {
    Some(SubtitleTrack {
        id: int_field(value, "id")? as i32,
        description: str_field(value, "e")?.to_string(),
        language: str_field(value, "n")?.to_string(),
    })
}

fn video_track(value: &Value) -> Option<VideoTrack> {
    Some(VideoTrack {
        id: int_field(value, "id")? as i32,
        description: str_field(value, "e")?.to_string(),
        language: str_field(value, "n")?.to_string(),
        width: int_field(value, "w")? as i32,
        height: int_field(value, "h")? as i32,
        framerate: int_field(value, "f")? as i32,
        // Older players do not report progressive.
        progressive: int_field(value, "p").map(|p| p as i32).unwrap_or(-1),
    })
}

/// Decode the vocabulary shared by both flavours. Returns `None` for keys
/// this table does not know, letting the flavour try its own vocabulary
/// first and log the leftovers.
pub(crate) fn decode_shared(key: &str, value: &Value) -> Option<PlayerEvent> {
    match key {
        "PLAYBACK_PLAY" => Some(PlayerEvent::Started {
            ok: status_ok(value),
        }),
        "PLAYBACK_STOP" => Some(PlayerEvent::Stopped {
            ok: status_ok(value),
        }),
        "PLAYBACK_PAUSE" => Some(PlayerEvent::Paused {
            ok: status_ok(value),
        }),
        "PLAYBACK_CONTINUE" => Some(PlayerEvent::Resumed {
            ok: status_ok(value),
        }),
        "PLAYBACK_SEEK_ABS" => Some(PlayerEvent::SeekDone {
            ok: status_ok(value),
        }),
        "PLAYBACK_SEEK" => Some(PlayerEvent::SeekRelativeDone {
            ok: status_ok(value),
        }),
        "PLAYBACK_LENGTH" => {
            if !status_ok(value) {
                return None;
            }
            let seconds = float_field(value, "length")?;
            Some(PlayerEvent::Length {
                ms: (seconds * 1000.0) as i64,
            })
        }
        "J" => Some(PlayerEvent::Position {
            ms: int_field(value, "ms")?,
        }),
        "v_c" => Some(PlayerEvent::VideoCurrent(video_track(value)?)),
        "a_c" => Some(PlayerEvent::AudioCurrent(audio_track(value)?)),
        "a_l" => {
            let items = value.as_array()?;
            let tracks = items.iter().map(audio_track).collect::<Option<Vec<_>>>()?;
            Some(PlayerEvent::AudioList(tracks))
        }
        "a_s" => {
            if status_ok(value) {
                Some(PlayerEvent::AudioSelected {
                    ok: true,
                    id: int_field(value, "id")? as i32,
                })
            } else {
                Some(PlayerEvent::AudioSelected { ok: false, id: -1 })
            }
        }
        "s_c" => Some(PlayerEvent::SubtitleCurrent(subtitle_track(value)?)),
        "s_l" => {
            let items = value.as_array()?;
            let tracks = items
                .iter()
                .map(subtitle_track)
                .collect::<Option<Vec<_>>>()?;
            Some(PlayerEvent::SubtitleList(tracks))
        }
        "s_s" => {
            if status_ok(value) {
                Some(PlayerEvent::SubtitleSelected {
                    ok: true,
                    id: int_field(value, "id")? as i32,
                })
            } else {
                Some(PlayerEvent::SubtitleSelected { ok: false, id: -1 })
            }
        }
        // Recognized but intentionally carrying no action.
        "PLAYBACK_INFO" | "PLAYBACK_FASTFORWARD" => None,
        _ => None,
    }
}
