//! FFmpeg player flavour (`exteplayer3`).

use std::collections::HashMap;

use serde_json::Value;

use crate::events::{self, PlayerEvent};
use crate::options::OptionSet;
use crate::player::{OutputStream, PlayerFlavour};
use crate::subtitles::SubtitleCue;

const BINARY: &str = "exteplayer3";

/// Separator splitting a main URI from an attached subtitle URI.
const SUBURI_SEPARATOR: &str = "&suburi=";

pub struct ExtEplayer3 {
    options: OptionSet,
}

impl ExtEplayer3 {
    pub fn new(options: OptionSet) -> Self {
        ExtEplayer3 { options }
    }
}

impl PlayerFlavour for ExtEplayer3 {
    fn name(&self) -> &'static str {
        "exteplayer3"
    }

    /// JSON events arrive on stderr; stdout carries FFmpeg log noise.
    fn message_stream(&self) -> OutputStream {
        OutputStream::Stderr
    }

    fn options_mut(&mut self) -> &mut OptionSet {
        &mut self.options
    }

    /// `exteplayer3 <uri> [-x suburi] [-u agent] [-h headers] [flags]...`
    ///
    /// The User-Agent header has its own flag; all remaining headers are
    /// folded into a single CRLF-joined `-h` argument.
    fn launch_argv(&self, path: &str, headers: &HashMap<String, String>) -> Vec<String> {
        let (main, suburi) = match path.split_once(SUBURI_SEPARATOR) {
            Some((main, sub)) => (main, Some(sub)),
            None => (path, None),
        };

        let mut argv = vec![BINARY.to_string(), main.to_string()];
        if let Some(suburi) = suburi {
            argv.push("-x".to_string());
            argv.push(suburi.to_string());
        }

        let mut extra_headers = Vec::new();
        for (key, value) in headers {
            if key.eq_ignore_ascii_case("user-agent") {
                argv.push("-u".to_string());
                argv.push(value.clone());
            } else {
                extra_headers.push(format!("{}:{}", key, value));
            }
        }
        if !extra_headers.is_empty() {
            argv.push("-h".to_string());
            argv.push(extra_headers.join("\r\n"));
        }

        argv.extend(self.options.argv_flags());
        argv
    }

    fn decode(&self, record: &Value) -> Option<PlayerEvent> {
        let (key, value) = events::single_entry(record)?;
        match key {
            "s_a" => {
                let start = events::int_field(value, "s")? as u32;
                let end = events::int_field(value, "e")? as u32;
                let text = events::str_field(value, "t")?.to_string();
                Some(PlayerEvent::Subtitle(SubtitleCue {
                    start_ms: start,
                    end_ms: end,
                    text,
                }))
            }
            _ => events::decode_shared(key, value),
        }
    }
}
