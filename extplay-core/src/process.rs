//! Child process container for the external player binaries.
//!
//! Owns the three stdio pipes of a spawned player, streams stdout/stderr
//! chunks to a sink as they arrive and reports process exit exactly once.
//! Termination is two-staged: SIGINT for a graceful shutdown request,
//! SIGKILL when the player will not die.

use std::io::Read;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {binary}: {source}")]
    SpawnFailed {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("player process is not running")]
    NotRunning,
    #[error("failed to write to player stdin: {0}")]
    WriteFailed(#[from] std::io::Error),
}

/// Asynchronous output of a running child process.
#[derive(Debug)]
pub enum ConsoleEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Delivered exactly once, after both output pipes have drained.
    Exited(i32),
}

/// Handle to a spawned player process.
pub struct Console {
    pid: i32,
    stdin: Mutex<Option<ChildStdin>>,
    running: Arc<AtomicBool>,
}

impl Console {
    /// Spawn `argv[0]` with the remaining arguments, piping all three
    /// standard streams. Output chunks and the final exit status are
    /// delivered to `sink` from background threads.
    pub fn spawn<F>(argv: &[String], sink: F) -> Result<Console, ProcessError>
    where
        F: Fn(ConsoleEvent) + Send + Sync + 'static,
    {
        let binary = argv.first().cloned().unwrap_or_default();
        let mut child = Command::new(&binary)
            .args(argv.get(1..).unwrap_or(&[]))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::SpawnFailed {
                binary: binary.clone(),
                source,
            })?;

        let pid = child.id() as i32;
        tracing::info!("spawned {} (pid {})", binary, pid);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let running = Arc::new(AtomicBool::new(true));
        let sink = Arc::new(sink);

        let out_sink = Arc::clone(&sink);
        let out_reader = std::thread::spawn(move || {
            let mut pipe = match stdout {
                Some(p) => p,
                None => return,
            };
            let mut buf = [0u8; 4096];
            while let Ok(n) = pipe.read(&mut buf) {
                if n == 0 {
                    break;
                }
                out_sink(ConsoleEvent::Stdout(buf[..n].to_vec()));
            }
        });

        let err_sink = Arc::clone(&sink);
        let err_reader = std::thread::spawn(move || {
            let mut pipe = match stderr {
                Some(p) => p,
                None => return,
            };
            let mut buf = [0u8; 4096];
            while let Ok(n) = pipe.read(&mut buf) {
                if n == 0 {
                    break;
                }
                err_sink(ConsoleEvent::Stderr(buf[..n].to_vec()));
            }
        });

        let waiter_running = Arc::clone(&running);
        std::thread::spawn(move || {
            let code = wait_for_exit(child);
            // Drain both pipes before announcing the exit, so no output
            // chunk arrives after Exited.
            let _ = out_reader.join();
            let _ = err_reader.join();
            waiter_running.store(false, Ordering::SeqCst);
            tracing::debug!("player process exited with code {}", code);
            sink(ConsoleEvent::Exited(code));
        });

        Ok(Console {
            pid,
            stdin: Mutex::new(stdin),
            running,
        })
    }

    /// Write a command to the child's stdin.
    pub fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        use std::io::Write;
        if !self.is_running() {
            return Err(ProcessError::NotRunning);
        }
        let mut guard = self.stdin.lock();
        let pipe = guard.as_mut().ok_or(ProcessError::NotRunning)?;
        pipe.write_all(data)?;
        pipe.flush()?;
        Ok(())
    }

    /// Ask the player to shut down (SIGINT).
    pub fn send_interrupt(&self) {
        if self.is_running() {
            unsafe {
                libc::kill(self.pid, libc::SIGINT);
            }
        }
    }

    /// Forcibly terminate the player (SIGKILL).
    pub fn kill(&self) {
        if self.is_running() {
            tracing::warn!("force killing player process (pid {})", self.pid);
            unsafe {
                libc::kill(self.pid, libc::SIGKILL);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn wait_for_exit(mut child: Child) -> i32 {
    match child.wait() {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            tracing::warn!("wait on player process failed: {}", e);
            -1
        }
    }
}
