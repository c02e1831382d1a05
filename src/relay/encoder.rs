//! External encoder process that republishes the raw relay feed.

use anyhow::{bail, Context, Result};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const EXIT_POLL: Duration = Duration::from_millis(10);

pub const DEFAULT_ENCODER_PROGRAM: &str = "ffmpeg";

/// Default encoder arguments. Placeholders: `{input}` `{url}` `{width}` `{height}` `{fps}`.
pub fn default_encoder_args() -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-f",
        "rawvideo",
        "-vcodec",
        "rawvideo",
        "-pix_fmt",
        "bgr24",
        "-s",
        "{width}x{height}",
        "-r",
        "{fps}",
        "-i",
        "{input}",
        "-c:v",
        "libx264",
        "-preset",
        "ultrafast",
        "-tune",
        "zerolatency",
        "-profile:v",
        "baseline",
        "-level",
        "3.0",
        "-x264-params",
        "keyint=30:min-keyint=30:scenecut=0:bframes=0",
        "-bufsize",
        "1000k",
        "-maxrate",
        "1000k",
        "-crf",
        "23",
        "-f",
        "rtsp",
        "-rtsp_transport",
        "tcp",
        "-muxdelay",
        "0.1",
        "{url}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Values substituted into the encoder argument template.
#[derive(Clone, Debug)]
pub struct EncoderVars<'a> {
    pub input: &'a str,
    pub url: &'a str,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

pub fn render_args(template: &[String], vars: &EncoderVars<'_>) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{input}", vars.input)
                .replace("{url}", vars.url)
                .replace("{width}", &vars.width.to_string())
                .replace("{height}", &vars.height.to_string())
                .replace("{fps}", &vars.fps.to_string())
        })
        .collect()
}

/// How the encoder ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderExit {
    /// Exited on its own within the drain grace period.
    Drained,
    Terminated,
    Killed,
}

#[derive(Debug)]
pub struct EncoderProcess {
    program: String,
    child: Child,
}

impl EncoderProcess {
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        if program.trim().is_empty() {
            bail!("encoder program is empty");
        }
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn encoder {}", program))?;
        log::info!("encoder {} started (pid {})", program, child.id());
        Ok(Self {
            program: program.to_string(),
            child,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Bring the encoder down and reap it.
    ///
    /// Waits `drain` for a voluntary exit (the conduit is already closed), then
    /// asks it to terminate and waits `kill_grace`, then kills it.
    pub fn shutdown(mut self, drain: Duration, kill_grace: Duration) -> Result<EncoderExit> {
        if self.wait_for_exit(drain)? {
            return Ok(EncoderExit::Drained);
        }
        self.terminate();
        if self.wait_for_exit(kill_grace)? {
            log::info!("encoder {} terminated", self.program);
            return Ok(EncoderExit::Terminated);
        }
        log::warn!(
            "encoder {} ignored termination for {:?}; killing",
            self.program,
            kill_grace
        );
        self.child
            .kill()
            .with_context(|| format!("kill encoder {}", self.program))?;
        self.child
            .wait()
            .with_context(|| format!("reap encoder {}", self.program))?;
        Ok(EncoderExit::Killed)
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self
                .child
                .try_wait()
                .with_context(|| format!("poll encoder {}", self.program))?;
            if let Some(status) = status {
                log::debug!("encoder {} exited: {}", self.program, status);
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(EXIT_POLL);
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        let Ok(pid) = libc::pid_t::try_from(self.child.id()) else {
            return;
        };
        // SAFETY: pid belongs to a child we have not reaped yet.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.kill();
    }
}
