#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use vehicle_relay::{
    BoundingBox, Detection, Detector, Frame, FramePipeline, IngestSettings, IouTracker,
    ObjectClass, PipelineConfig, PipelineFactory, RegistrySettings, SessionSettings,
    StreamRegistry, TrackerConfig,
};

/// Reports one vehicle at a fixed position on every frame.
pub struct ParkedCarDetector;

impl Detector for ParkedCarDetector {
    fn name(&self) -> &'static str {
        "parked-car"
    }

    fn infer(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok(vec![Detection {
            bbox: BoundingBox::from_ltrb(4.0, 4.0, 24.0, 20.0),
            class: ObjectClass::Vehicle,
            confidence: 0.9,
        }])
    }
}

pub fn parked_car_factory() -> Arc<dyn PipelineFactory> {
    Arc::new(|_id: &str| -> Result<FramePipeline> {
        Ok(FramePipeline::new(
            Box::new(ParkedCarDetector),
            Box::new(IouTracker::new(TrackerConfig {
                min_hits: 1,
                ..TrackerConfig::default()
            })),
            PipelineConfig::default(),
        ))
    })
}

pub fn small_settings() -> RegistrySettings {
    RegistrySettings {
        ingest: IngestSettings {
            width: 64,
            height: 48,
            ..IngestSettings::default()
        },
        session: SessionSettings {
            stop_timeout: Duration::from_secs(5),
            ..SessionSettings::default()
        },
        ..RegistrySettings::default()
    }
}

pub fn registry() -> StreamRegistry {
    StreamRegistry::new(small_settings(), parked_car_factory())
}

/// Poll `check` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}
