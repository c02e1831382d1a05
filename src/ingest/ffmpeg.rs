use anyhow::{anyhow, bail, Context, Result};
use std::io::{ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, Stdio};

use super::{FrameSource, IngestSettings, SourceStats};
use crate::frame::{frame_len, Frame};

/// Frames decoded by an `ffmpeg` child process writing rawvideo BGR24 to stdout.
pub struct FfmpegSource {
    uri: String,
    settings: IngestSettings,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    frame_count: u64,
}

impl FfmpegSource {
    pub fn new(uri: &str, settings: &IngestSettings) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            bail!("source uri is empty");
        }
        Ok(Self {
            uri: uri.to_string(),
            settings: settings.clone(),
            child: None,
            stdout: None,
            frame_count: 0,
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.settings.ffmpeg);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        if self.uri.starts_with("rtsp://") {
            cmd.arg("-rtsp_transport").arg("tcp");
        }
        cmd.arg("-i")
            .arg(&self.uri)
            .arg("-an")
            .arg("-vf")
            .arg(format!(
                "scale={}:{}",
                self.settings.width, self.settings.height
            ))
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }

    /// Reap the decoder after its output ended. A non-zero exit is an error.
    fn finish(&mut self) -> Result<()> {
        self.stdout = None;
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .with_context(|| format!("wait for decoder of {}", self.uri))?;
        if !status.success() {
            bail!(
                "decoder for {} exited with {} after {} frames",
                self.uri,
                status,
                self.frame_count
            );
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl FrameSource for FfmpegSource {
    fn connect(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let mut child = self
            .command()
            .spawn()
            .with_context(|| format!("spawn {} for {}", self.settings.ffmpeg, self.uri))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;
        self.child = Some(child);
        self.stdout = Some(stdout);
        log::info!("FfmpegSource: connected to {}", self.uri);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("source {} is not connected", self.uri))?;
        let mut buffer = vec![0u8; frame_len(self.settings.width, self.settings.height)];
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                self.finish()?;
                log::info!(
                    "FfmpegSource: {} ended after {} frames",
                    self.uri,
                    self.frame_count
                );
                return Ok(None);
            }
            Err(err) => {
                self.shutdown();
                return Err(err).with_context(|| format!("read frame from {}", self.uri));
            }
        }
        self.frame_count += 1;
        Frame::new(buffer, self.settings.width, self.settings.height).map(Some)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}
