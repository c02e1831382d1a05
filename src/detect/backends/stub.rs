use anyhow::Result;

use crate::detect::backend::Detector;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Stub backend. Reports no objects; lets the stream path run without a model.
#[derive(Debug, Default)]
pub struct StubDetector;

impl StubDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_detector_reports_nothing() {
        let mut detector = StubDetector::new();
        let frame = Frame::filled(8, 8, [0, 0, 0]).unwrap();
        assert!(detector.infer(&frame).unwrap().is_empty());
        assert!(detector.infer(&frame).unwrap().is_empty());
    }
}
