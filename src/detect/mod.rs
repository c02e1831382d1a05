//! Detection capability boundary.
//!
//! The pipeline talks to detectors only through the `Detector` trait. Concrete
//! model runtimes live outside the core and are registered by name in a
//! `BackendRegistry`, which builds one detector instance per session.
mod backend;
mod backends;
mod registry;
mod result;

pub use backend::Detector;
pub use backends::StubDetector;
pub use registry::{BackendRegistry, DetectorFactory};
pub use result::{BoundingBox, Detection, ObjectClass};
