//! Playback state machine driving one player process.
//!
//! A dedicated worker thread owns the child process and all playback
//! state transitions. Callers talk to it over a command channel; the
//! process's output chunks arrive on the same channel, so every state
//! change is applied from exactly one thread. Queries that need an
//! answer from the player (track lists, stop confirmation) carry a
//! one-shot reply channel and the caller waits on it with a timeout,
//! never indefinitely.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::events::{AudioTrack, PlayerErrorMessage, PlayerEvent, SubtitleTrack, VideoTrack};
use crate::framing::LineAssembler;
use crate::options::{apply_overrides, split_option_headers};
use crate::player::{ControlCommand, OutputStream, PlayerFlavour};
use crate::process::{Console, ConsoleEvent};
use crate::subtitles::SubtitleCue;

/// Position poll cadence while playback runs unpaused.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default grace period between asking the player to quit and killing it.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlayerStateError {
    #[error("playback has not started")]
    NotStarted,
    #[error("the player has not reported this yet")]
    NotYetKnown,
    #[error("no such track")]
    InvalidTrack,
    #[error("player worker is gone")]
    NotRunning,
}

/// State changes pushed to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerNotification {
    Started,
    Stopped,
    Paused,
    Resumed,
    VideoSizeChanged,
    VideoFramerateChanged,
    VideoProgressiveChanged,
    SubtitleAvailable,
    Error,
}

enum WorkerMsg {
    Start {
        path: String,
        headers: HashMap<String, String>,
    },
    Stop {
        done: SyncSender<()>,
    },
    Kill,
    Pause,
    Resume,
    SeekTo(i32),
    SeekRelative(i32),
    AudioSelect(i32),
    AudioList {
        reply: Option<SyncSender<()>>,
    },
    SubtitleSelect(i32),
    SubtitleList {
        reply: Option<SyncSender<()>>,
    },
    GetLength,
    Chunk(OutputStream, Vec<u8>),
    Exited(i32),
}

#[derive(Debug, Default)]
struct PlayState {
    started: bool,
    position_ms: Option<i64>,
    length_ms: Option<i64>,
    audio: Vec<AudioTrack>,
    subtitles: Vec<SubtitleTrack>,
    current_audio: Option<AudioTrack>,
    current_subtitle: Option<SubtitleTrack>,
    current_video: Option<VideoTrack>,
    error: Option<PlayerErrorMessage>,
}

/// State shared between the worker and callers. Callers only ever read
/// snapshots under the lock; the worker is the only writer.
#[derive(Default)]
struct Shared {
    state: Mutex<PlayState>,
    subtitle_fifo: Mutex<VecDeque<SubtitleCue>>,
    /// One outstanding track-list query at a time, audio or subtitle.
    list_pending: AtomicBool,
}

/// Handle to one playback session.
///
/// Dropping the backend stops the player, escalating to SIGKILL after
/// the stop timeout.
pub struct PlayerBackend {
    cmd_tx: Sender<WorkerMsg>,
    notify_rx: Receiver<PlayerNotification>,
    worker: Option<std::thread::JoinHandle<()>>,
    shared: Arc<Shared>,
    stop_timeout: Duration,
}

impl PlayerBackend {
    pub fn new(flavour: Box<dyn PlayerFlavour>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (notify_tx, notify_rx) = mpsc::channel();
        let shared = Arc::new(Shared::default());

        let worker_shared = Arc::clone(&shared);
        let worker_tx = cmd_tx.clone();
        let worker = std::thread::spawn(move || {
            Worker {
                flavour,
                cmd_rx,
                cmd_tx: worker_tx,
                notify_tx,
                shared: worker_shared,
                console: None,
                assembler: LineAssembler::new(),
                started: false,
                paused: false,
                pending_stop: None,
                pending_audio_reply: None,
                pending_subtitle_reply: None,
            }
            .run()
        });

        PlayerBackend {
            cmd_tx,
            notify_rx,
            worker: Some(worker),
            shared,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn set_stop_timeout(&mut self, timeout: Duration) {
        self.stop_timeout = timeout;
    }

    /// Launch the player against `path`. Option override headers are
    /// consumed here; the rest are forwarded to the player.
    pub fn start(
        &self,
        path: &str,
        headers: &HashMap<String, String>,
    ) -> Result<(), PlayerStateError> {
        self.send(WorkerMsg::Start {
            path: path.to_string(),
            headers: headers.clone(),
        })
    }

    /// Stop the player and join the worker. Waits `stop_timeout` for a
    /// clean exit, then kills. Safe to call more than once.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if !worker.is_finished() {
            let (done_tx, done_rx) = mpsc::sync_channel(1);
            if self.cmd_tx.send(WorkerMsg::Stop { done: done_tx }).is_ok()
                && done_rx.recv_timeout(self.stop_timeout).is_err()
            {
                tracing::warn!("player did not stop within {:?}, killing", self.stop_timeout);
                let _ = self.cmd_tx.send(WorkerMsg::Kill);
            }
        }
        let _ = worker.join();
    }

    pub fn pause(&self) -> Result<(), PlayerStateError> {
        self.require_started()?;
        self.send(WorkerMsg::Pause)
    }

    pub fn resume(&self) -> Result<(), PlayerStateError> {
        self.require_started()?;
        self.send(WorkerMsg::Resume)
    }

    pub fn seek_to(&self, seconds: i32) -> Result<(), PlayerStateError> {
        self.require_started()?;
        self.send(WorkerMsg::SeekTo(seconds))
    }

    pub fn seek_relative(&self, seconds: i32) -> Result<(), PlayerStateError> {
        self.require_started()?;
        self.send(WorkerMsg::SeekRelative(seconds))
    }

    // ------------------------------------------------------------------
    // Track queries
    // ------------------------------------------------------------------

    /// Number of audio tracks. If no list has arrived yet, one is
    /// requested and waited for up to `timeout`; a zero timeout never
    /// blocks.
    pub fn audio_num_tracks(&self, timeout: Duration) -> Result<usize, PlayerStateError> {
        self.num_tracks(timeout, true)
    }

    pub fn subtitle_num_tracks(&self, timeout: Duration) -> Result<usize, PlayerStateError> {
        self.num_tracks(timeout, false)
    }

    fn num_tracks(&self, timeout: Duration, audio: bool) -> Result<usize, PlayerStateError> {
        self.require_started()?;
        let count = |state: &PlayState| {
            if audio {
                state.audio.len()
            } else {
                state.subtitles.len()
            }
        };
        // The command is posted on every query so a list that changes
        // mid-stream is picked up; only one query may be in flight, a
        // concurrent caller reads the last-known list.
        if !self.shared.list_pending.swap(true, Ordering::SeqCst) {
            let reply = if timeout.is_zero() {
                None
            } else {
                Some(mpsc::sync_channel(1))
            };
            let msg = if audio {
                WorkerMsg::AudioList {
                    reply: reply.as_ref().map(|(tx, _)| tx.clone()),
                }
            } else {
                WorkerMsg::SubtitleList {
                    reply: reply.as_ref().map(|(tx, _)| tx.clone()),
                }
            };
            self.send(msg)?;
            if let Some((_, rx)) = reply {
                if rx.recv_timeout(timeout).is_err() {
                    // Unblock future queries even if the player stays silent.
                    self.shared.list_pending.store(false, Ordering::SeqCst);
                }
            }
        }
        Ok(count(&self.shared.state.lock()))
    }

    pub fn audio_track_info(&self, index: usize) -> Result<AudioTrack, PlayerStateError> {
        self.require_started()?;
        self.shared
            .state
            .lock()
            .audio
            .get(index)
            .cloned()
            .ok_or(PlayerStateError::InvalidTrack)
    }

    pub fn subtitle_track_info(&self, index: usize) -> Result<SubtitleTrack, PlayerStateError> {
        self.require_started()?;
        self.shared
            .state
            .lock()
            .subtitles
            .get(index)
            .cloned()
            .ok_or(PlayerStateError::InvalidTrack)
    }

    /// Select the audio track at list index `index`.
    pub fn audio_select_track(&self, index: usize) -> Result<(), PlayerStateError> {
        self.require_started()?;
        let id = {
            let state = self.shared.state.lock();
            state
                .audio
                .get(index)
                .map(|t| t.id)
                .ok_or(PlayerStateError::InvalidTrack)?
        };
        self.send(WorkerMsg::AudioSelect(id))
    }

    pub fn subtitle_select_track(&self, index: usize) -> Result<(), PlayerStateError> {
        self.require_started()?;
        let id = {
            let state = self.shared.state.lock();
            state
                .subtitles
                .get(index)
                .map(|t| t.id)
                .ok_or(PlayerStateError::InvalidTrack)?
        };
        self.send(WorkerMsg::SubtitleSelect(id))
    }

    /// List index of the currently playing audio track, 0 when unknown.
    pub fn audio_current_track_num(&self) -> usize {
        let state = self.shared.state.lock();
        state
            .current_audio
            .as_ref()
            .and_then(|current| state.audio.iter().position(|t| t.id == current.id))
            .unwrap_or(0)
    }

    pub fn subtitle_current_track_num(&self) -> usize {
        let state = self.shared.state.lock();
        state
            .current_subtitle
            .as_ref()
            .and_then(|current| state.subtitles.iter().position(|t| t.id == current.id))
            .unwrap_or(0)
    }

    pub fn video_track_info(&self) -> Result<VideoTrack, PlayerStateError> {
        self.require_started()?;
        self.shared
            .state
            .lock()
            .current_video
            .clone()
            .ok_or(PlayerStateError::NotYetKnown)
    }

    // ------------------------------------------------------------------
    // Position / length / errors
    // ------------------------------------------------------------------

    /// Stream length in milliseconds. Until the player has reported it
    /// this nudges the player and returns [`PlayerStateError::NotYetKnown`].
    pub fn get_length(&self) -> Result<i64, PlayerStateError> {
        self.require_started()?;
        match self.shared.state.lock().length_ms {
            Some(ms) => Ok(ms),
            None => {
                self.send(WorkerMsg::GetLength)?;
                Err(PlayerStateError::NotYetKnown)
            }
        }
    }

    /// Last polled playback position in milliseconds. Distinct from the
    /// not-started case, a started player that has not answered a poll
    /// yet reports [`PlayerStateError::NotYetKnown`].
    pub fn get_position(&self) -> Result<i64, PlayerStateError> {
        self.require_started()?;
        self.shared
            .state
            .lock()
            .position_ms
            .ok_or(PlayerStateError::NotYetKnown)
    }

    pub fn error_message(&self) -> Option<PlayerErrorMessage> {
        self.shared.state.lock().error.clone()
    }

    /// Drain subtitle cues received since the last call, in arrival order.
    pub fn take_subtitles(&self) -> Vec<SubtitleCue> {
        self.shared.subtitle_fifo.lock().drain(..).collect()
    }

    /// Wait up to `timeout` for the next state change notification.
    pub fn poll_notification(&self, timeout: Duration) -> Option<PlayerNotification> {
        self.notify_rx.recv_timeout(timeout).ok()
    }

    fn require_started(&self) -> Result<(), PlayerStateError> {
        if self.shared.state.lock().started {
            Ok(())
        } else {
            Err(PlayerStateError::NotStarted)
        }
    }

    fn send(&self, msg: WorkerMsg) -> Result<(), PlayerStateError> {
        self.cmd_tx
            .send(msg)
            .map_err(|_| PlayerStateError::NotRunning)
    }
}

impl Drop for PlayerBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    flavour: Box<dyn PlayerFlavour>,
    cmd_rx: Receiver<WorkerMsg>,
    cmd_tx: Sender<WorkerMsg>,
    notify_tx: Sender<PlayerNotification>,
    shared: Arc<Shared>,
    console: Option<Console>,
    assembler: LineAssembler,
    started: bool,
    paused: bool,
    pending_stop: Option<SyncSender<()>>,
    pending_audio_reply: Option<SyncSender<()>>,
    pending_subtitle_reply: Option<SyncSender<()>>,
}

impl Worker {
    fn run(mut self) {
        loop {
            // Polling doubles as the receive timeout, so a steady stream
            // of events can delay a position poll by one interval.
            let msg = if self.started && !self.paused {
                match self.cmd_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => {
                        self.write_command(ControlCommand::UpdatePosition);
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match self.cmd_rx.recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                }
            };

            match msg {
                WorkerMsg::Start { path, headers } => self.handle_start(&path, headers),
                WorkerMsg::Stop { done } => {
                    if self.console.as_ref().map_or(false, Console::is_running) {
                        self.pending_stop = Some(done);
                        self.write_command(ControlCommand::Stop);
                    } else {
                        let _ = done.try_send(());
                        self.notify(PlayerNotification::Stopped);
                        break;
                    }
                }
                WorkerMsg::Kill => match &self.console {
                    Some(console) => console.kill(),
                    None => break,
                },
                WorkerMsg::Pause => self.write_command(ControlCommand::Pause),
                WorkerMsg::Resume => self.write_command(ControlCommand::Resume),
                WorkerMsg::SeekTo(seconds) => {
                    self.write_command(ControlCommand::SeekAbsolute(seconds))
                }
                WorkerMsg::SeekRelative(seconds) => {
                    self.write_command(ControlCommand::SeekRelative(seconds))
                }
                WorkerMsg::AudioSelect(id) => self.write_command(ControlCommand::AudioSelect(id)),
                WorkerMsg::AudioList { reply } => {
                    self.pending_audio_reply = reply;
                    self.write_command(ControlCommand::AudioList);
                }
                WorkerMsg::SubtitleSelect(id) => {
                    self.write_command(ControlCommand::SubtitleSelect(id))
                }
                WorkerMsg::SubtitleList { reply } => {
                    self.pending_subtitle_reply = reply;
                    self.write_command(ControlCommand::SubtitleList);
                }
                WorkerMsg::GetLength => self.write_command(ControlCommand::UpdateLength),
                WorkerMsg::Chunk(stream, bytes) => self.handle_chunk(stream, &bytes),
                WorkerMsg::Exited(code) => {
                    self.handle_exit(code);
                    break;
                }
            }
        }
    }

    fn handle_start(&mut self, path: &str, headers: HashMap<String, String>) {
        if self.console.is_some() {
            tracing::warn!("ignoring start, player already launched");
            return;
        }
        let (clean_headers, overrides) = split_option_headers(&headers);
        apply_overrides(self.flavour.options_mut(), &overrides);

        let argv = self.flavour.launch_argv(path, &clean_headers);
        tracing::info!("launching {}: {:?}", self.flavour.name(), argv);

        // mpsc senders are handed to three reader threads, hence the lock.
        let sink_tx = Mutex::new(self.cmd_tx.clone());
        let sink = move |event: ConsoleEvent| {
            let msg = match event {
                ConsoleEvent::Stdout(bytes) => WorkerMsg::Chunk(OutputStream::Stdout, bytes),
                ConsoleEvent::Stderr(bytes) => WorkerMsg::Chunk(OutputStream::Stderr, bytes),
                ConsoleEvent::Exited(code) => WorkerMsg::Exited(code),
            };
            let _ = sink_tx.lock().send(msg);
        };

        match Console::spawn(&argv, sink) {
            Ok(console) => self.console = Some(console),
            Err(e) => {
                tracing::error!("failed to launch {}: {}", self.flavour.name(), e);
                self.shared.state.lock().error = Some(PlayerErrorMessage {
                    code: -1,
                    message: e.to_string(),
                });
                self.notify(PlayerNotification::Error);
                self.notify(PlayerNotification::Stopped);
            }
        }
    }

    fn handle_chunk(&mut self, stream: OutputStream, bytes: &[u8]) {
        if stream != self.flavour.message_stream() {
            tracing::trace!(
                "{} {:?}: {}",
                self.flavour.name(),
                stream,
                String::from_utf8_lossy(bytes).trim_end()
            );
            return;
        }
        for record in self.assembler.push(bytes) {
            let parsed: serde_json::Value = match serde_json::from_str(&record) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!("unparseable player record ({}): {}", e, record);
                    continue;
                }
            };
            match self.flavour.decode(&parsed) {
                Some(event) => self.handle_event(event),
                None => tracing::debug!("unhandled player record: {}", record),
            }
        }
    }

    fn handle_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Started { ok } => {
                if !ok {
                    tracing::warn!("player reported playback start failure");
                } else if !self.started {
                    self.started = true;
                    self.shared.state.lock().started = true;
                    self.notify(PlayerNotification::Started);
                }
            }
            // The process exit is the authoritative stop signal.
            PlayerEvent::Stopped { ok } => {
                tracing::debug!("player acknowledged stop (ok: {})", ok)
            }
            PlayerEvent::Paused { ok } => {
                if ok {
                    self.paused = true;
                    self.notify(PlayerNotification::Paused);
                }
            }
            PlayerEvent::Resumed { ok } => {
                if ok {
                    self.paused = false;
                    self.notify(PlayerNotification::Resumed);
                }
            }
            PlayerEvent::SeekDone { ok } | PlayerEvent::SeekRelativeDone { ok } => {
                if !ok {
                    tracing::warn!("player reported seek failure");
                }
            }
            PlayerEvent::Length { ms } => self.shared.state.lock().length_ms = Some(ms),
            PlayerEvent::Position { ms } => self.shared.state.lock().position_ms = Some(ms),
            PlayerEvent::AudioList(tracks) => {
                self.shared.state.lock().audio = tracks;
                self.shared.list_pending.store(false, Ordering::SeqCst);
                if let Some(reply) = self.pending_audio_reply.take() {
                    let _ = reply.try_send(());
                }
            }
            PlayerEvent::AudioCurrent(track) => {
                self.shared.state.lock().current_audio = Some(track)
            }
            PlayerEvent::AudioSelected { ok, id } => {
                if ok {
                    let mut state = self.shared.state.lock();
                    state.current_audio = state.audio.iter().find(|t| t.id == id).cloned();
                } else {
                    tracing::warn!("audio track selection failed");
                }
            }
            PlayerEvent::SubtitleList(tracks) => {
                self.shared.state.lock().subtitles = tracks;
                self.shared.list_pending.store(false, Ordering::SeqCst);
                if let Some(reply) = self.pending_subtitle_reply.take() {
                    let _ = reply.try_send(());
                }
            }
            PlayerEvent::SubtitleCurrent(track) => {
                self.shared.state.lock().current_subtitle = Some(track)
            }
            PlayerEvent::SubtitleSelected { ok, id } => {
                if ok {
                    let mut state = self.shared.state.lock();
                    state.current_subtitle = state.subtitles.iter().find(|t| t.id == id).cloned();
                } else {
                    tracing::warn!("subtitle track selection failed");
                }
            }
            PlayerEvent::VideoCurrent(video) => self.handle_video_current(video),
            PlayerEvent::Subtitle(cue) => {
                self.shared.subtitle_fifo.lock().push_back(cue);
                self.notify(PlayerNotification::SubtitleAvailable);
            }
            PlayerEvent::Error(error) => {
                tracing::warn!("player error {}: {}", error.code, error.message);
                self.shared.state.lock().error = Some(error);
                self.notify(PlayerNotification::Error);
            }
        }
    }

    /// Diff the incoming video description against the stored one and
    /// notify per changed aspect. Unknown values (zero or negative) never
    /// produce a notification.
    fn handle_video_current(&mut self, video: VideoTrack) {
        let mut notifications = Vec::new();
        {
            let mut state = self.shared.state.lock();
            let previous = state.current_video.clone().unwrap_or_default();
            if video.width > 0
                && video.height > 0
                && (video.width != previous.width || video.height != previous.height)
            {
                notifications.push(PlayerNotification::VideoSizeChanged);
            }
            if video.framerate > 0 && video.framerate != previous.framerate {
                notifications.push(PlayerNotification::VideoFramerateChanged);
            }
            if video.progressive >= 0 && video.progressive != previous.progressive {
                notifications.push(PlayerNotification::VideoProgressiveChanged);
            }
            state.current_video = Some(video);
        }
        for notification in notifications {
            self.notify(notification);
        }
    }

    fn handle_exit(&mut self, code: i32) {
        tracing::info!("{} exited with code {}", self.flavour.name(), code);
        {
            let mut state = self.shared.state.lock();
            state.started = false;
        }
        self.started = false;
        // Unblock anyone waiting on the player.
        if let Some(done) = self.pending_stop.take() {
            let _ = done.try_send(());
        }
        if let Some(reply) = self.pending_audio_reply.take() {
            let _ = reply.try_send(());
        }
        if let Some(reply) = self.pending_subtitle_reply.take() {
            let _ = reply.try_send(());
        }
        self.shared.list_pending.store(false, Ordering::SeqCst);
        self.notify(PlayerNotification::Stopped);
        self.console = None;
    }

    fn write_command(&self, command: ControlCommand) {
        let Some(console) = &self.console else {
            return;
        };
        if let Err(e) = console.write(command.wire().as_bytes()) {
            tracing::debug!("player command {:?} not delivered: {}", command, e);
        }
    }

    fn notify(&self, notification: PlayerNotification) {
        let _ = self.notify_tx.send(notification);
    }
}
