use anyhow::{anyhow, bail, Context, Result};
use std::time::{Duration, Instant};

use super::{FrameSource, IngestSettings, SourceStats};
use crate::frame::Frame;

pub(super) const SCHEME: &str = "stub://";

/// Parameters of a `stub://name?frames=N&width=W&height=H&fps=F&fail_after=K` source.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    /// Stop after this many frames (end of stream). `None` runs forever.
    pub frames: Option<u64>,
    /// Pacing; 0 produces frames as fast as they are pulled.
    pub fps: u32,
    /// Fail with an error once this many frames were produced.
    pub fail_after: Option<u64>,
}

impl SyntheticConfig {
    pub fn parse(uri: &str, settings: &IngestSettings) -> Result<Self> {
        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| anyhow!("not a stub uri: {}", uri))?;
        let mut config = Self {
            uri: uri.to_string(),
            width: settings.width,
            height: settings.height,
            frames: None,
            fps: 30,
            fail_after: None,
        };
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(config);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let parse = |v: &str| -> Result<u64> {
                v.parse::<u64>()
                    .with_context(|| format!("invalid value '{}' for {} in {}", v, key, uri))
            };
            match key {
                "frames" => config.frames = Some(parse(value)?),
                "width" => config.width = parse(value)? as u32,
                "height" => config.height = parse(value)? as u32,
                "fps" => config.fps = parse(value)? as u32,
                "fail_after" => config.fail_after = Some(parse(value)?),
                other => bail!("unknown stub parameter '{}' in {}", other, uri),
            }
        }
        if config.width == 0 || config.height == 0 {
            bail!("stub source dimensions must be non-zero");
        }
        Ok(config)
    }
}

/// Synthetic frame source for tests and demos.
///
/// Produces a slowly shifting solid colour so consecutive frames differ.
pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            next_due: None,
        }
    }

    fn pace(&mut self) {
        if self.config.fps == 0 {
            return;
        }
        let interval = Duration::from_secs(1) / self.config.fps;
        let now = Instant::now();
        match self.next_due {
            Some(due) if due > now => {
                std::thread::sleep(due - now);
                self.next_due = Some(due + interval);
            }
            _ => self.next_due = Some(now + interval),
        }
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("SyntheticSource: connected to {}", self.config.uri);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(limit) = self.config.fail_after {
            if self.frame_count >= limit {
                bail!("synthetic failure after {} frames", limit);
            }
        }
        if let Some(limit) = self.config.frames {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        self.pace();
        let shade = (self.frame_count % 256) as u8;
        let frame = Frame::filled(
            self.config.width,
            self.config.height,
            [shade, 96, 255 - shade],
        )?;
        self.frame_count += 1;
        Ok(Some(frame))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(uri: &str) -> SyntheticSource {
        SyntheticSource::new(SyntheticConfig::parse(uri, &IngestSettings::default()).unwrap())
    }

    #[test]
    fn defaults_follow_ingest_settings() {
        let config = SyntheticConfig::parse("stub://lot", &IngestSettings::default()).unwrap();
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.frames, None);
    }

    #[test]
    fn finite_source_ends_with_none() {
        let mut src = source("stub://a?frames=3&fps=0&width=4&height=4");
        for _ in 0..3 {
            assert!(src.next_frame().unwrap().is_some());
        }
        assert!(src.next_frame().unwrap().is_none());
        assert_eq!(src.stats().frames_captured, 3);
    }

    #[test]
    fn fail_after_reports_error() {
        let mut src = source("stub://a?fail_after=1&fps=0&width=4&height=4");
        assert!(src.next_frame().unwrap().is_some());
        assert!(src.next_frame().is_err());
    }

    #[test]
    fn rejects_unknown_parameters() {
        let settings = IngestSettings::default();
        assert!(SyntheticConfig::parse("stub://a?colour=red", &settings).is_err());
        assert!(SyntheticConfig::parse("stub://a?frames=x", &settings).is_err());
        assert!(SyntheticConfig::parse("stub://a?width=0", &settings).is_err());
    }
}
