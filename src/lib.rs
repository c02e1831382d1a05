//! Vehicle stream relay.
//!
//! Ingests live video sources, runs every frame through object detection and
//! identity tracking, and delivers the annotated result two ways: a pull-based
//! latest-frame feed and a push-based relay into an external encoder that
//! republishes the stream at `rtsp://host:port/name`. Each session also keeps a
//! unique-object total and the number of objects currently visible.
//!
//! # Module Structure
//!
//! - `frame`: frames, annotated frames, the drop-oldest `FrameSink`
//! - `count`: bounded dedup window behind the total count
//! - `detect` / `track`: detector and tracker capability traits
//! - `pipeline`: detect, filter, track, annotate, count
//! - `ingest`: frame sources (`stub://`, ffmpeg)
//! - `relay`: FIFO conduit, encoder process, writer thread
//! - `session` / `registry`: per-stream lifecycle and the id table
//! - `api` / `config`: control API and daemon configuration

pub mod api;
pub mod config;
pub mod count;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod registry;
pub mod relay;
pub mod session;
pub mod task;
pub mod track;

pub use count::TrackCountWindow;
pub use detect::{BackendRegistry, BoundingBox, Detection, Detector, ObjectClass};
pub use frame::{AnnotatedFrame, Frame, FrameSink, TrackId};
pub use ingest::{open_source, FrameSource, IngestSettings};
pub use pipeline::{DefaultPipelineFactory, FramePipeline, PipelineConfig, PipelineFactory};
pub use registry::{RegistryError, RegistrySettings, SessionHandle, StreamRegistry};
pub use relay::{RelayConduit, RelaySettings, RelayState};
pub use session::{SessionSettings, SessionState, StreamInfo, StreamSession, StreamStats, Termination};
pub use track::{IouTracker, Track, TrackInput, Tracker, TrackerConfig};
