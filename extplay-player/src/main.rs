//! # extplay
//!
//! Command line front end for the extplay engine: resolves HLS master
//! playlists, launches the chosen player binary and mirrors playback
//! state to the terminal.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use extplay_core::{
    create_player, is_m3u8_url, CueMap, OptionsRegistry, PlayerBackend, PlayerKind,
    PlayerNotification, SettingsProfile, VariantExplorer,
};

struct AppOptions {
    url: String,
    kind: PlayerKind,
    headers: HashMap<String, String>,
    overrides: Vec<(String, String)>,
    duration: Option<Duration>,
    list_only: bool,
}

impl AppOptions {
    fn from_args(args: &[String]) -> Result<Self> {
        let mut url = None;
        let mut kind = PlayerKind::Gst;
        let mut headers = HashMap::new();
        let mut overrides = Vec::new();
        let mut duration = None;
        let mut list_only = false;

        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--exteplayer3" => kind = PlayerKind::ExtEplayer3,
                "--list-variants" => list_only = true,
                "-H" => {
                    let value = iter.next().context("-H needs a key=value argument")?;
                    let (key, value) = value
                        .split_once('=')
                        .context("-H argument must be key=value")?;
                    headers.insert(key.to_string(), value.to_string());
                }
                "-o" => {
                    let value = iter.next().context("-o needs a key=value argument")?;
                    let (key, value) = value
                        .split_once('=')
                        .context("-o argument must be key=value")?;
                    overrides.push((key.to_string(), value.to_string()));
                }
                "--duration" => {
                    let value = iter.next().context("--duration needs seconds")?;
                    let seconds: u64 = value.parse().context("--duration must be a number")?;
                    duration = Some(Duration::from_secs(seconds));
                }
                other if url.is_none() && !other.starts_with('-') => {
                    url = Some(other.to_string());
                }
                other => bail!("unknown argument: {}", other),
            }
        }

        Ok(AppOptions {
            url: url.context(
                "usage: extplay <url> [--exteplayer3] [-H key=value] [-o key=value] \
                 [--duration secs] [--list-variants]",
            )?,
            kind,
            headers,
            overrides,
            duration,
            list_only,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("extplay=debug")
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = AppOptions::from_args(&args)?;

    tracing::info!("extplay v{}", env!("CARGO_PKG_VERSION"));

    let mut registry = OptionsRegistry::new();
    for (key, value) in &options.overrides {
        registry
            .update(options.kind, SettingsProfile::User, key, value)
            .with_context(|| format!("bad -o override {}", key))?;
    }

    let (url, headers) = if is_m3u8_url(&options.url) {
        let explorer = VariantExplorer::new(&options.url, &options.headers);
        let variants = explorer
            .variants()
            .with_context(|| format!("resolving playlist {}", options.url))?;
        for variant in &variants {
            println!("{}", serde_json::to_string(variant)?);
        }
        if options.list_only {
            return Ok(());
        }
        // Highest bitrate first.
        let best = variants.into_iter().next().context("no variant streams")?;
        tracing::info!("playing variant {} ({} bit/s)", best.url, best.bitrate);
        (best.url, best.headers)
    } else {
        if options.list_only {
            bail!("--list-variants needs an HLS playlist url");
        }
        (options.url.clone(), options.headers.clone())
    };

    let flavour = create_player(options.kind, &registry, SettingsProfile::User);
    let mut backend = PlayerBackend::new(flavour);
    backend
        .start(&url, &headers)
        .context("launching the player")?;

    run_playback(&mut backend, options.duration);
    backend.stop();
    Ok(())
}

fn run_playback(backend: &mut PlayerBackend, duration: Option<Duration>) {
    let begin = Instant::now();
    let mut cues = CueMap::new();
    let mut last_position = 0i64;

    loop {
        if let Some(limit) = duration {
            if begin.elapsed() >= limit {
                tracing::info!("requested duration reached");
                return;
            }
        }

        match backend.poll_notification(Duration::from_millis(100)) {
            Some(PlayerNotification::Started) => {
                println!("playback started");
            }
            Some(PlayerNotification::Stopped) => {
                println!("playback stopped");
                return;
            }
            Some(PlayerNotification::Paused) => println!("paused"),
            Some(PlayerNotification::Resumed) => println!("resumed"),
            Some(PlayerNotification::VideoSizeChanged) => {
                if let Ok(video) = backend.video_track_info() {
                    println!("video size: {}x{}", video.width, video.height);
                }
            }
            Some(PlayerNotification::VideoFramerateChanged) => {
                if let Ok(video) = backend.video_track_info() {
                    println!("video framerate: {}", video.framerate);
                }
            }
            Some(PlayerNotification::VideoProgressiveChanged) => {
                if let Ok(video) = backend.video_track_info() {
                    println!("video progressive: {}", video.progressive);
                }
            }
            Some(PlayerNotification::SubtitleAvailable) => {
                for cue in backend.take_subtitles() {
                    cues.insert(cue);
                }
            }
            Some(PlayerNotification::Error) => {
                if let Some(error) = backend.error_message() {
                    eprintln!("player error {}: {}", error.code, error.message);
                }
            }
            None => {}
        }

        let Ok(position) = backend.get_position() else {
            continue;
        };
        if position / 1000 != last_position / 1000 {
            let length = backend.get_length().unwrap_or(0);
            println!("position {}s / {}s", position / 1000, length / 1000);
        }
        last_position = position;

        let due = cues
            .next_relevant(position as u32)
            .filter(|cue| cue.start_ms as i64 <= position)
            .cloned();
        if let Some(cue) = due {
            println!("subtitle: {}", cue.text);
            // Shown once; drop it together with anything already over.
            cues.prune(cue.end_ms + 1);
        } else {
            cues.prune(position as u32);
        }
    }
}
