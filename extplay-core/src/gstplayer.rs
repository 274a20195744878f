//! GStreamer player flavour (`gstplayer_gst-1.0`).

use std::collections::HashMap;

use serde_json::Value;

use crate::events::{self, PlayerEvent, PlayerErrorMessage};
use crate::options::OptionSet;
use crate::player::{OutputStream, PlayerFlavour};
use crate::subtitles::SubtitleCue;

const BINARY: &str = "gstplayer_gst-1.0";

pub struct GstPlayer {
    options: OptionSet,
}

impl GstPlayer {
    pub fn new(options: OptionSet) -> Self {
        GstPlayer { options }
    }
}

impl PlayerFlavour for GstPlayer {
    fn name(&self) -> &'static str {
        "gstplayer"
    }

    fn message_stream(&self) -> OutputStream {
        OutputStream::Stdout
    }

    fn options_mut(&mut self) -> &mut OptionSet {
        &mut self.options
    }

    /// `gstplayer_gst-1.0 <uri> [-H key=value]... [option flags]...`
    fn launch_argv(&self, path: &str, headers: &HashMap<String, String>) -> Vec<String> {
        let mut argv = vec![BINARY.to_string(), path.to_string()];
        for (key, value) in headers {
            argv.push("-H".to_string());
            argv.push(format!("{}={}", key, value));
        }
        argv.extend(self.options.argv_flags());
        argv
    }

    fn decode(&self, record: &Value) -> Option<PlayerEvent> {
        let (key, value) = events::single_entry(record)?;
        match key {
            "PLAYBACK_SUBTITLE" => {
                let start = events::int_field(value, "start")? as u32;
                let duration = events::int_field(value, "duration")? as u32;
                let text = events::str_field(value, "text")?.to_string();
                Some(PlayerEvent::Subtitle(SubtitleCue {
                    start_ms: start,
                    end_ms: start + duration,
                    text,
                }))
            }
            "GST_ERROR" => Some(PlayerEvent::Error(PlayerErrorMessage {
                code: events::int_field(value, "code").unwrap_or(-1) as i32,
                message: events::str_field(value, "msg")?.to_string(),
            })),
            "GST_MISSING_PLUGIN" => Some(PlayerEvent::Error(PlayerErrorMessage {
                code: -1,
                message: format!(
                    "GStreamer plugin {} is not available!",
                    events::str_field(value, "msg")?
                ),
            })),
            _ => events::decode_shared(key, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::gst_options;

    fn player() -> GstPlayer {
        GstPlayer::new(gst_options())
    }

    #[test]
    fn argv_starts_with_binary_and_uri() {
        let mut options = gst_options();
        options.update("subtitleEnabled", "1").unwrap();
        let player = GstPlayer::new(options);

        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), "agent".to_string());

        let argv = player.launch_argv("http://host/stream.ts", &headers);
        assert_eq!(argv[0], "gstplayer_gst-1.0");
        assert_eq!(argv[1], "http://host/stream.ts");
        assert!(argv
            .windows(2)
            .any(|w| w == ["-H", "User-Agent=agent"]));
        assert!(argv.contains(&"-e".to_string()));
    }

    #[test]
    fn subtitle_event_converts_duration_to_end_time() {
        let record: Value = serde_json::from_str(
            r#"{"PLAYBACK_SUBTITLE":{"start":5000,"duration":1500,"text":"hello"}}"#,
        )
        .unwrap();
        assert_eq!(
            player().decode(&record),
            Some(PlayerEvent::Subtitle(SubtitleCue {
                start_ms: 5000,
                end_ms: 6500,
                text: "hello".to_string(),
            }))
        );
    }

    #[test]
    fn missing_plugin_is_reported_as_an_error() {
        let record: Value =
            serde_json::from_str(r#"{"GST_MISSING_PLUGIN":{"msg":"mpegtsdemux"}}"#).unwrap();
        match player().decode(&record) {
            Some(PlayerEvent::Error(e)) => {
                assert_eq!(e.message, "GStreamer plugin mpegtsdemux is not available!");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn shared_vocabulary_still_decodes() {
        let record: Value = serde_json::from_str(r#"{"J":{"ms":250}}"#).unwrap();
        assert_eq!(
            player().decode(&record),
            Some(PlayerEvent::Position { ms: 250 })
        );
    }
}
