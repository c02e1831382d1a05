//! Named-pipe conduit between the relay writer and the encoder process.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::task::CancelToken;

/// FIFO paths owned by live conduits in this process.
fn live_paths() -> MutexGuard<'static, HashSet<PathBuf>> {
    static LIVE: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// A FIFO on disk. Removed when dropped.
///
/// A path is owned by at most one live conduit; `create` refuses a path
/// another conduit still holds instead of unlinking it.
#[derive(Debug)]
pub struct FifoConduit {
    path: PathBuf,
}

impl FifoConduit {
    /// Create the FIFO at `path`, replacing any stale file left there.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create fifo directory {}", parent.display())
                })?;
            }
        }
        if !live_paths().insert(path.to_path_buf()) {
            bail!("fifo {} is in use by another relay", path.display());
        }
        // From here on, dropping `conduit` releases the claim.
        let conduit = Self {
            path: path.to_path_buf(),
        };
        match std::fs::remove_file(path) {
            Ok(()) => log::debug!("removed stale fifo {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove stale fifo {}", path.display()))
            }
        }
        make_fifo(path)?;
        Ok(conduit)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Open the write end of the FIFO at `path` without blocking.
///
/// Retries every `retry` while no reader has the FIFO open. Returns
/// `Ok(None)` if `cancel` fires first.
pub fn open_writer_at(path: &Path, cancel: &CancelToken, retry: Duration) -> Result<Option<File>> {
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        match open_nonblocking(path) {
            Ok(file) => return Ok(Some(file)),
            Err(err) if no_reader(&err) => std::thread::sleep(retry),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to open fifo {}", path.display()))
            }
        }
    }
}

impl Drop for FifoConduit {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                log::warn!("failed to remove fifo {}: {}", self.path.display(), err);
            }
        }
        live_paths().remove(&self.path);
    }
}

/// A frame write that failed after `written` of `len` bytes reached the pipe.
///
/// The conduit carries no framing, so `written > 0` means the reader is now
/// out of step with frame boundaries.
#[derive(Debug, Error)]
#[error("wrote {written} of {len} bytes: {source}")]
pub struct FrameWriteError {
    pub written: usize,
    pub len: usize,
    #[source]
    pub source: std::io::Error,
}

impl FrameWriteError {
    pub fn is_partial(&self) -> bool {
        self.written > 0 && self.written < self.len
    }
}

/// Write all of `bytes`, retrying while the pipe is full.
///
/// Returns `Ok(false)` if cancelled part-way. Cancellation only comes from
/// relay teardown, which closes the conduit right after, so the torn frame is
/// never followed by another.
pub fn write_frame(
    file: &mut File,
    bytes: &[u8],
    cancel: &CancelToken,
    retry: Duration,
) -> Result<bool, FrameWriteError> {
    let fail = |written: usize, source: std::io::Error| FrameWriteError {
        written,
        len: bytes.len(),
        source,
    };
    let mut offset = 0;
    while offset < bytes.len() {
        match file.write(&bytes[offset..]) {
            Ok(0) => return Err(fail(offset, ErrorKind::WriteZero.into())),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if cancel.is_cancelled() {
                    return Ok(false);
                }
                std::thread::sleep(retry);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(fail(offset, err)),
        }
    }
    file.flush().map_err(|err| fail(offset, err))?;
    Ok(true)
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("fifo path contains NUL: {}", path.display()))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("mkfifo {}", path.display()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_fifo(path: &Path) -> Result<()> {
    anyhow::bail!("named pipes are not supported on this platform ({})", path.display())
}

#[cfg(unix)]
fn open_nonblocking(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_nonblocking(path: &Path) -> std::io::Result<File> {
    std::fs::OpenOptions::new().write(true).open(path)
}

#[cfg(unix)]
fn no_reader(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENXIO)
}

#[cfg(not(unix))]
fn no_reader(_err: &std::io::Error) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn create_replaces_stale_file_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay_8554_cam.fifo");
        std::fs::write(&path, b"stale").unwrap();
        let fifo = FifoConduit::create(&path).unwrap();
        let meta = std::fs::metadata(fifo.path()).unwrap();
        assert!(meta.file_type().is_fifo());
        drop(fifo);
        assert!(!path.exists());
    }

    #[test]
    fn open_writer_gives_up_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = FifoConduit::create(&dir.path().join("nobody.fifo")).unwrap();
        let cancel = CancelToken::new();
        let flag = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            flag.cancel();
        });
        let opened = open_writer_at(fifo.path(), &cancel, Duration::from_millis(5)).unwrap();
        assert!(opened.is_none());
        canceller.join().unwrap();
    }

    #[test]
    fn writes_reach_reader() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let fifo = FifoConduit::create(&dir.path().join("pair.fifo")).unwrap();
        let path = fifo.path().to_path_buf();
        let reader = std::thread::spawn(move || {
            let mut file = File::open(path).unwrap();
            let mut out = Vec::new();
            file.read_to_end(&mut out).unwrap();
            out
        });
        let cancel = CancelToken::new();
        let mut writer = open_writer_at(fifo.path(), &cancel, Duration::from_millis(1))
            .unwrap()
            .unwrap();
        let payload = vec![7u8; 200_000];
        assert!(write_frame(&mut writer, &payload, &cancel, Duration::from_millis(1)).unwrap());
        drop(writer);
        assert_eq!(reader.join().unwrap(), payload);
    }

    #[test]
    fn live_path_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay_8554_cam.fifo");
        let first = FifoConduit::create(&path).unwrap();
        assert!(FifoConduit::create(&path).is_err());
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());

        drop(first);
        assert!(!path.exists());
        let second = FifoConduit::create(&path).unwrap();
        assert!(second.path().exists());
    }

    #[test]
    fn reader_leaving_mid_frame_reports_partial_write() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let fifo = FifoConduit::create(&dir.path().join("short.fifo")).unwrap();
        let path = fifo.path().to_path_buf();
        let reader = std::thread::spawn(move || {
            let mut file = File::open(path).unwrap();
            let mut head = [0u8; 10];
            file.read_exact(&mut head).unwrap();
        });
        let cancel = CancelToken::new();
        let mut writer = open_writer_at(fifo.path(), &cancel, Duration::from_millis(1))
            .unwrap()
            .unwrap();
        let payload = vec![1u8; 1 << 20];
        let err = write_frame(&mut writer, &payload, &cancel, Duration::from_millis(1)).unwrap_err();
        reader.join().unwrap();
        assert!(err.is_partial());
        assert_eq!(err.len, payload.len());
        assert_eq!(err.source.kind(), ErrorKind::BrokenPipe);
    }
}
