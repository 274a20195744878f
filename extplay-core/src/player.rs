//! Player flavour abstraction and the stdin command vocabulary.
//!
//! Both supported player binaries speak the same stdin command language;
//! they differ in how they are launched, which output pipe carries the
//! JSON events and a handful of flavour-specific event keys.

use std::collections::HashMap;

use serde_json::Value;

use crate::events::PlayerEvent;
use crate::options::{OptionSet, OptionsRegistry, PlayerKind, SettingsProfile};

/// Which pipe of the child carries the JSON event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Commands written to the player's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Stop,
    Pause,
    Resume,
    UpdateLength,
    UpdatePosition,
    AudioList,
    AudioCurrent,
    AudioSelect(i32),
    SubtitleList,
    SubtitleCurrent,
    SubtitleSelect(i32),
    /// Absolute seek, seconds.
    SeekAbsolute(i32),
    /// Relative seek, signed seconds.
    SeekRelative(i32),
}

impl ControlCommand {
    /// Render the command as the newline-terminated string the player
    /// binaries expect.
    pub fn wire(&self) -> String {
        match self {
            ControlCommand::Stop => "q\n".to_string(),
            ControlCommand::Pause => "p\n".to_string(),
            ControlCommand::Resume => "c\n".to_string(),
            ControlCommand::UpdateLength => "l\n".to_string(),
            ControlCommand::UpdatePosition => "j\n".to_string(),
            ControlCommand::AudioList => "al\n".to_string(),
            ControlCommand::AudioCurrent => "ac\n".to_string(),
            ControlCommand::AudioSelect(id) => format!("a{}\n", id),
            ControlCommand::SubtitleList => "sl\n".to_string(),
            ControlCommand::SubtitleCurrent => "sc\n".to_string(),
            ControlCommand::SubtitleSelect(id) => format!("s{}\n", id),
            ControlCommand::SeekAbsolute(seconds) => format!("gc{}\n", seconds),
            ControlCommand::SeekRelative(seconds) => format!("kc{}\n", seconds),
        }
    }
}

/// The per-binary part of the player contract.
pub trait PlayerFlavour: Send {
    fn name(&self) -> &'static str;

    /// Which pipe carries JSON events. The other pipe is log noise.
    fn message_stream(&self) -> OutputStream;

    /// Mutable access to the launch option table, for per-stream
    /// overrides carried in request headers.
    fn options_mut(&mut self) -> &mut OptionSet;

    /// Full argv for launching the player against `path`, including the
    /// binary name, HTTP headers and the configured option flags.
    fn launch_argv(&self, path: &str, headers: &HashMap<String, String>) -> Vec<String>;

    /// Decode one reassembled JSON record into a playback event. `None`
    /// means the record carries nothing actionable.
    fn decode(&self, record: &Value) -> Option<PlayerEvent>;
}

/// Build the flavour selected by `kind`, configured from the registry
/// table for `profile`.
pub fn create_player(
    kind: PlayerKind,
    registry: &OptionsRegistry,
    profile: SettingsProfile,
) -> Box<dyn PlayerFlavour> {
    match kind {
        PlayerKind::Gst => Box::new(crate::gstplayer::GstPlayer::new(
            registry.options(kind, profile),
        )),
        PlayerKind::ExtEplayer3 => Box::new(crate::exteplayer3::ExtEplayer3::new(
            registry.options(kind, profile),
        )),
    }
}
