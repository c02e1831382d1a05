//! Push-based relay: annotated frames are resized, buffered, and written as
//! raw BGR24 into a FIFO read by an external encoder that republishes them at
//! `rtsp://host:port/name`.
//!
//! `put_frame` never blocks the producer. The writer thread owns the FIFO's
//! write end; the encoder process owns the read end.

mod conduit;
mod encoder;

use anyhow::{bail, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::frame::{Frame, FrameSink};
use crate::task::{CancelToken, TaskHandle};

pub use conduit::{FifoConduit, FrameWriteError};
pub use encoder::{
    default_encoder_args, render_args, EncoderExit, EncoderProcess, EncoderVars,
    DEFAULT_ENCODER_PROGRAM,
};

pub const DEFAULT_RELAY_HOST: &str = "localhost";
pub const DEFAULT_RELAY_WIDTH: u32 = 640;
pub const DEFAULT_RELAY_HEIGHT: u32 = 480;
pub const DEFAULT_RELAY_FPS: u32 = 30;
pub const DEFAULT_RELAY_BUFFER: usize = 30;
pub const DEFAULT_FIFO_DIR: &str = "/tmp";
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(500);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_WRITER_POLL: Duration = Duration::from_millis(1);
pub const DEFAULT_WRITER_JOIN: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq)]
pub struct RelaySettings {
    /// Host name placed in the published URL.
    pub host: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_capacity: usize,
    pub fifo_dir: PathBuf,
    pub encoder_program: String,
    pub encoder_args: Vec<String>,
    pub drain_grace: Duration,
    pub kill_grace: Duration,
    /// Idle poll and pipe-full backoff of the writer thread.
    pub writer_poll: Duration,
    pub writer_join: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_RELAY_HOST.to_string(),
            width: DEFAULT_RELAY_WIDTH,
            height: DEFAULT_RELAY_HEIGHT,
            fps: DEFAULT_RELAY_FPS,
            buffer_capacity: DEFAULT_RELAY_BUFFER,
            fifo_dir: PathBuf::from(DEFAULT_FIFO_DIR),
            encoder_program: DEFAULT_ENCODER_PROGRAM.to_string(),
            encoder_args: default_encoder_args(),
            drain_grace: DEFAULT_DRAIN_GRACE,
            kill_grace: DEFAULT_KILL_GRACE,
            writer_poll: DEFAULT_WRITER_POLL,
            writer_join: DEFAULT_WRITER_JOIN,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Unstarted,
    Running,
    Stopped,
}

impl RelayState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RelayState::Unstarted,
            1 => RelayState::Running,
            _ => RelayState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RelayState::Unstarted => 0,
            RelayState::Running => 1,
            RelayState::Stopped => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub write_errors: u64,
}

#[derive(Default)]
struct WriterCounters {
    frames_written: AtomicU64,
    write_errors: AtomicU64,
}

struct Running {
    url: String,
    writer: TaskHandle<()>,
    encoder: EncoderProcess,
    fifo: FifoConduit,
}

// ----------------------------------------------------------------------------
// RelayConduit
// ----------------------------------------------------------------------------

/// One relay per session. Unstarted -> Running -> Stopped; never restarted.
pub struct RelayConduit {
    settings: RelaySettings,
    state: AtomicU8,
    buffer: Arc<FrameSink<Frame>>,
    counters: Arc<WriterCounters>,
    running: Mutex<Option<Running>>,
    url: Mutex<Option<String>>,
}

impl RelayConduit {
    pub fn new(settings: RelaySettings) -> Self {
        let buffer = Arc::new(FrameSink::new(settings.buffer_capacity));
        Self {
            settings,
            state: AtomicU8::new(RelayState::Unstarted.as_u8()),
            buffer,
            counters: Arc::new(WriterCounters::default()),
            running: Mutex::new(None),
            url: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn state(&self) -> RelayState {
        RelayState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn url(&self) -> Option<String> {
        lock(&self.url).clone()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            frames_written: self.counters.frames_written.load(Ordering::Relaxed),
            frames_dropped: self.buffer.dropped(),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
        }
    }

    /// Path of the FIFO for a given port and stream name. Distinct names map
    /// to distinct paths.
    pub fn fifo_path(&self, port: u16, name: &str) -> PathBuf {
        self.settings
            .fifo_dir
            .join(format!("relay_{}_{}.fifo", port, encode_name(name)))
    }

    /// Create the conduit, launch the encoder and the writer thread.
    ///
    /// Returns the published URL without waiting for the encoder to connect.
    pub fn start(&self, port: u16, name: &str) -> Result<String> {
        let mut running = lock(&self.running);
        match self.state() {
            RelayState::Unstarted => {}
            RelayState::Running => bail!("relay already running"),
            RelayState::Stopped => bail!("relay was stopped and cannot be restarted"),
        }
        if name.is_empty() {
            bail!("relay stream name is empty");
        }

        let url = format!("rtsp://{}:{}/{}", self.settings.host, port, name);
        let fifo = FifoConduit::create(&self.fifo_path(port, name))?;
        let input = fifo.path().to_string_lossy().into_owned();
        let args = render_args(
            &self.settings.encoder_args,
            &EncoderVars {
                input: &input,
                url: &url,
                width: self.settings.width,
                height: self.settings.height,
                fps: self.settings.fps,
            },
        );
        let encoder = EncoderProcess::spawn(&self.settings.encoder_program, &args)?;

        let path = fifo.path().to_path_buf();
        let buffer = Arc::clone(&self.buffer);
        let counters = Arc::clone(&self.counters);
        let poll = self.settings.writer_poll;
        let writer = match TaskHandle::spawn(format!("relay-{}", port), move |cancel| {
            run_writer(&path, &buffer, &counters, &cancel, poll)
        }) {
            Ok(writer) => writer,
            Err(err) => {
                let _ = encoder.shutdown(Duration::ZERO, self.settings.kill_grace);
                return Err(err);
            }
        };

        log::info!("relay started: {} via {}", url, input);
        *lock(&self.url) = Some(url.clone());
        *running = Some(Running {
            url: url.clone(),
            writer,
            encoder,
            fifo,
        });
        self.state
            .store(RelayState::Running.as_u8(), Ordering::SeqCst);
        Ok(url)
    }

    /// Offer a frame to the relay. Never blocks; frames are dropped when the
    /// relay is not running, cannot be resized, or the buffer is full.
    pub fn put_frame(&self, frame: &Frame) {
        if self.state() != RelayState::Running {
            return;
        }
        match frame.resized(self.settings.width, self.settings.height) {
            Ok(resized) => {
                if self.buffer.push(resized) {
                    log::trace!("relay buffer full; dropped oldest frame");
                }
            }
            Err(err) => log::debug!("relay dropped frame: {}", err),
        }
    }

    /// Stop the writer, the encoder, and remove the conduit. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let running = {
            let mut guard = lock(&self.running);
            self.state
                .store(RelayState::Stopped.as_u8(), Ordering::SeqCst);
            guard.take()
        };
        let Some(Running {
            url,
            mut writer,
            encoder,
            fifo,
        }) = running
        else {
            return Ok(());
        };

        if let Err(err) = writer.stop(self.settings.writer_join) {
            log::warn!("relay writer for {} failed: {:#}", url, err);
        }
        let exit = encoder.shutdown(self.settings.drain_grace, self.settings.kill_grace);
        drop(fifo);
        self.buffer.clear();

        let exit = exit?;
        let stats = self.stats();
        log::info!(
            "relay stopped: {} (encoder {:?}, written {}, dropped {}, errors {})",
            url,
            exit,
            stats.frames_written,
            stats.frames_dropped,
            stats.write_errors
        );
        Ok(())
    }
}

impl Drop for RelayConduit {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("relay teardown failed: {:#}", err);
        }
    }
}

fn run_writer(
    path: &Path,
    buffer: &FrameSink<Frame>,
    counters: &WriterCounters,
    cancel: &CancelToken,
    poll: Duration,
) {
    'attach: loop {
        let mut file = match conduit::open_writer_at(path, cancel, poll) {
            Ok(Some(file)) => file,
            Ok(None) => return,
            Err(err) => {
                log::error!("relay writer: {:#}", err);
                counters.write_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        log::debug!("relay writer attached to {}", path.display());

        let mut failing = false;
        while !cancel.is_cancelled() {
            let Some(frame) = buffer.pop(poll) else {
                continue;
            };
            let err = match conduit::write_frame(&mut file, frame.as_bytes(), cancel, poll) {
                Ok(true) => {
                    counters.frames_written.fetch_add(1, Ordering::Relaxed);
                    failing = false;
                    continue;
                }
                Ok(false) => return,
                Err(err) => err,
            };
            counters.write_errors.fetch_add(1, Ordering::Relaxed);
            match recovery_for(&err) {
                Recovery::Retry => {
                    if !failing {
                        log::warn!("relay write to {} failed: {}", path.display(), err);
                    }
                    failing = true;
                    std::thread::sleep(poll);
                }
                Recovery::Reattach => {
                    log::warn!(
                        "encoder closed {} ({}); waiting for a reader",
                        path.display(),
                        err
                    );
                    continue 'attach;
                }
                Recovery::Abandon => {
                    log::error!(
                        "relay conduit {} lost frame alignment ({}); writer stopped",
                        path.display(),
                        err
                    );
                    return;
                }
            }
        }
        return;
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Recovery {
    /// Nothing reached the pipe; try the next frame.
    Retry,
    /// The reader went away. Leftover bytes go with the pipe, so a new reader
    /// starts on a frame boundary.
    Reattach,
    /// A torn frame is stuck in front of a live reader.
    Abandon,
}

fn recovery_for(err: &FrameWriteError) -> Recovery {
    if err.source.kind() == std::io::ErrorKind::BrokenPipe {
        Recovery::Reattach
    } else if err.is_partial() {
        Recovery::Abandon
    } else {
        Recovery::Retry
    }
}

/// Keep `[A-Za-z0-9_-]`, percent-encode every other byte.
fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_path_encodes_name() {
        let relay = RelayConduit::new(RelaySettings {
            fifo_dir: PathBuf::from("/run/relay"),
            ..RelaySettings::default()
        });
        assert_eq!(
            relay.fifo_path(8554, "lot/north gate"),
            PathBuf::from("/run/relay/relay_8554_lot%2Fnorth%20gate.fifo")
        );
        assert_ne!(relay.fifo_path(8554, "cam.1"), relay.fifo_path(8554, "cam_1"));
        assert_ne!(relay.fifo_path(8554, "a%2E"), relay.fifo_path(8554, "a."));
    }

    #[test]
    fn write_errors_pick_recovery() {
        let err = |written, kind: std::io::ErrorKind| FrameWriteError {
            written,
            len: 100,
            source: kind.into(),
        };
        use std::io::ErrorKind::{BrokenPipe, Other};
        assert_eq!(recovery_for(&err(0, Other)), Recovery::Retry);
        assert_eq!(recovery_for(&err(40, Other)), Recovery::Abandon);
        assert_eq!(recovery_for(&err(40, BrokenPipe)), Recovery::Reattach);
        assert_eq!(recovery_for(&err(0, BrokenPipe)), Recovery::Reattach);
    }

    #[test]
    fn put_frame_before_start_is_ignored() {
        let relay = RelayConduit::new(RelaySettings::default());
        relay.put_frame(&Frame::filled(4, 4, [1, 2, 3]).unwrap());
        assert_eq!(relay.state(), RelayState::Unstarted);
        assert_eq!(relay.stats(), RelayStats::default());
    }

    #[test]
    fn stop_without_start_is_terminal() {
        let relay = RelayConduit::new(RelaySettings::default());
        relay.stop().unwrap();
        relay.stop().unwrap();
        assert_eq!(relay.state(), RelayState::Stopped);
        assert!(relay.start(8554, "cam").is_err());
    }

    #[test]
    fn missing_encoder_fails_start_and_cleans_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let relay = RelayConduit::new(RelaySettings {
            fifo_dir: dir.path().to_path_buf(),
            encoder_program: "/nonexistent/encoder".to_string(),
            ..RelaySettings::default()
        });
        assert!(relay.start(8554, "cam").is_err());
        assert!(!relay.fifo_path(8554, "cam").exists());
        assert_eq!(relay.state(), RelayState::Unstarted);
    }
}
