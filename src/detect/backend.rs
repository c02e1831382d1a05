use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Object detector backend.
///
/// Implementations wrap a model runtime (CPU or accelerator). One instance is
/// owned by each session's pipeline and only ever called from that session's
/// ingestion thread, so `&mut self` is available for scratch buffers.
///
/// Errors are propagated to the caller; the pipeline does not retry inference.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. Boxes are in pixel coordinates of `frame`.
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
