//! # extplay-core
//!
//! Control engine for external media player processes.
//!
//! Drives `gstplayer` (GStreamer based) and `exteplayer3` (FFmpeg based)
//! child processes over a line-delimited JSON protocol: spawns the
//! player, feeds it short textual commands on stdin, reassembles and
//! decodes the JSON events it emits, and republishes them as typed
//! playback state to the embedding application. Also resolves HLS
//! master playlists into their variant streams.

// ============================================================================
// Process control / wire protocol
// ============================================================================
pub mod framing;
pub mod process;

// ============================================================================
// Player flavours
// ============================================================================
pub mod events;
pub mod exteplayer3;
pub mod gstplayer;
pub mod options;
pub mod player;

// ============================================================================
// Playback state machine
// ============================================================================
pub mod backend;
pub mod subtitles;

// ============================================================================
// Streaming / Network
// ============================================================================
pub mod m3u8;

pub use backend::{PlayerBackend, PlayerNotification, PlayerStateError};
pub use events::{AudioTrack, PlayerErrorMessage, PlayerEvent, SubtitleTrack, VideoTrack};
pub use m3u8::{is_m3u8_url, M3u8StreamInfo, VariantExplorer};
pub use options::{OptionsRegistry, PlayerKind, SettingsProfile};
pub use player::create_player;
pub use subtitles::{CueMap, SubtitleCue};
