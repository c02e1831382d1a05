//! Frame ingestion sources.
//!
//! A source yields decoded, packed BGR24 frames at the configured ingest size:
//! - `stub://` URIs produce synthetic frames (tests, demos)
//! - everything else is decoded by an `ffmpeg` child process (RTSP, files, HTTP)
//!
//! `next_frame` returns `Ok(None)` at end of stream and `Err` on failure; the
//! session turns those into distinct terminal states.

mod ffmpeg;
mod synthetic;

use anyhow::Result;

use crate::frame::Frame;

pub use ffmpeg::FfmpegSource;
pub use synthetic::{SyntheticConfig, SyntheticSource};

pub const DEFAULT_INGEST_WIDTH: u32 = 640;
pub const DEFAULT_INGEST_HEIGHT: u32 = 480;
pub const DEFAULT_FFMPEG: &str = "ffmpeg";

/// Settings shared by every source opened by the daemon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestSettings {
    /// Frames are scaled to this size at decode time.
    pub width: u32,
    pub height: u32,
    /// Decoder executable.
    pub ffmpeg: String,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_INGEST_WIDTH,
            height: DEFAULT_INGEST_HEIGHT,
            ffmpeg: DEFAULT_FFMPEG.to_string(),
        }
    }
}

/// Statistics for a frame source, read by the session after every frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
}

/// A live or finite stream of frames. Owned by a single ingestion thread.
pub trait FrameSource: Send {
    /// Open the underlying stream. Called once, on the ingestion thread.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame. `Ok(None)` means the stream ended.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn stats(&self) -> SourceStats;
}

/// Build the source for `uri`. Nothing is opened until `connect`.
pub fn open_source(uri: &str, settings: &IngestSettings) -> Result<Box<dyn FrameSource>> {
    if uri.starts_with(synthetic::SCHEME) {
        let config = SyntheticConfig::parse(uri, settings)?;
        return Ok(Box::new(SyntheticSource::new(config)));
    }
    Ok(Box::new(FfmpegSource::new(uri, settings)?))
}
