//! Frame types and the latest-N delivery buffer.
//!
//! - `Frame`: packed 3-byte-per-pixel image (BGR order), shared by reference count.
//! - `AnnotatedFrame`: pipeline output (image + counting snapshot). Immutable.
//! - `FrameSink<T>`: bounded drop-oldest buffer between a real-time producer and
//!   slower consumers. Used for the viewer feed and the relay feed.

use anyhow::{anyhow, Result};
use image::{imageops, ImageBuffer, Rgb};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Bytes per pixel of every frame handled by the crate.
pub const CHANNELS: usize = 3;

/// Three-channel pixel container. The channel order is BGR; `Rgb<u8>` is only
/// used as a layout-compatible carrier for the `image`/`imageproc` routines.
pub type PixelBuffer = ImageBuffer<Rgb<u8>, Vec<u8>>;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Raw packed BGR24 frame. Cloning shares the pixel allocation.
#[derive(Clone)]
pub struct Frame {
    data: Arc<Vec<u8>>,
    width: u32,
    height: u32,
}

impl Frame {
    /// Wrap a packed pixel buffer. The length must be exactly `width * height * 3`.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = frame_len(width, height);
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        if data.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{}",
                data.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            data: Arc::new(data),
            width,
            height,
        })
    }

    /// Solid-colour frame, mostly useful for synthetic sources and tests.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Result<Self> {
        let mut data = Vec::with_capacity(frame_len(width, height));
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&bgr);
        }
        Self::new(data, width, height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Pixel at (x, y) as `[b, g, r]`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * CHANNELS;
        let px = self.data.get(offset..offset + CHANNELS)?;
        Some([px[0], px[1], px[2]])
    }

    /// Take the pixels out as an image buffer. Copies only if the allocation is shared.
    pub fn into_buffer(self) -> PixelBuffer {
        let data = Arc::try_unwrap(self.data).unwrap_or_else(|shared| (*shared).clone());
        // Length was validated at construction.
        ImageBuffer::from_raw(self.width, self.height, data)
            .unwrap_or_else(|| ImageBuffer::new(self.width, self.height))
    }

    pub fn from_buffer(buffer: PixelBuffer) -> Self {
        let (width, height) = buffer.dimensions();
        Self {
            data: Arc::new(buffer.into_raw()),
            width,
            height,
        }
    }

    /// Return a frame of exactly `width` x `height`. Frames already at that size
    /// are returned without copying.
    pub fn resized(&self, width: u32, height: u32) -> Result<Frame> {
        if self.width == width && self.height == height {
            return Ok(self.clone());
        }
        if width == 0 || height == 0 {
            return Err(anyhow!("resize target must be non-zero"));
        }
        let source: ImageBuffer<Rgb<u8>, &[u8]> =
            ImageBuffer::from_raw(self.width, self.height, self.as_bytes())
                .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let scaled = imageops::resize(&source, width, height, imageops::FilterType::Triangle);
        Ok(Frame::from_buffer(scaled))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

pub fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * CHANNELS
}

// ----------------------------------------------------------------------------
// AnnotatedFrame
// ----------------------------------------------------------------------------

/// Identity assigned by the tracker. Stable while an object is continuously tracked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TrackId(pub u64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Output of one pipeline pass. Never mutated after construction; superseded
/// frames are dropped.
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    image: Frame,
    total_count: u64,
    current_ids: Vec<TrackId>,
}

impl AnnotatedFrame {
    pub fn new(image: Frame, total_count: u64, current_ids: Vec<TrackId>) -> Self {
        Self {
            image,
            total_count,
            current_ids,
        }
    }

    pub fn image(&self) -> &Frame {
        &self.image
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn current_ids(&self) -> &[TrackId] {
        &self.current_ids
    }

    pub fn current_count(&self) -> usize {
        self.current_ids.len()
    }
}

// ----------------------------------------------------------------------------
// FrameSink: bounded drop-oldest buffer
// ----------------------------------------------------------------------------

/// Bounded buffer holding the most recent items.
///
/// `push` never blocks: when full, the single oldest item is evicted first.
/// `pop` waits up to a timeout and hands out the oldest retained item.
pub struct FrameSink<T> {
    inner: Mutex<SinkInner<T>>,
    ready: Condvar,
    capacity: usize,
}

struct SinkInner<T> {
    items: VecDeque<T>,
    dropped: u64,
}

impl<T> FrameSink<T> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(SinkInner {
                items: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue an item. Returns true when an older item was evicted to make room.
    pub fn push(&self, item: T) -> bool {
        let evicted = {
            let mut inner = self.lock();
            let evicted = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.dropped += 1;
                true
            } else {
                false
            };
            inner.items.push_back(item);
            evicted
        };
        self.ready.notify_one();
        evicted
    }

    /// Remove and return the oldest item, waiting up to `timeout` for one to arrive.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items evicted by `push` since creation.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Discard everything currently buffered.
    pub fn clear(&self) {
        self.lock().items.clear();
    }

    // A panic while holding the lock cannot leave the deque in a torn state,
    // so a poisoned guard is still usable.
    fn lock(&self) -> MutexGuard<'_, SinkInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
