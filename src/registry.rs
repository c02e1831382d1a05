//! Table of live stream sessions keyed by caller-supplied id.
//!
//! Only the registry inserts and removes sessions. The table lock is never
//! held while a session is built or torn down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;

use crate::frame::AnnotatedFrame;
use crate::ingest::{open_source, IngestSettings};
use crate::pipeline::PipelineFactory;
use crate::relay::{RelayConduit, RelaySettings};
use crate::session::{SessionSettings, StreamInfo, StreamSession, StreamStats};

/// Shared handle to a registered session.
pub type SessionHandle = Arc<StreamSession>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("stream '{0}' already exists")]
    DuplicateSession(String),
    #[error("stream '{0}' not found")]
    SessionNotFound(String),
    #[error(transparent)]
    Start(#[from] anyhow::Error),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrySettings {
    pub ingest: IngestSettings,
    pub relay: RelaySettings,
    pub session: SessionSettings,
}

pub struct StreamRegistry {
    settings: RegistrySettings,
    pipelines: Arc<dyn PipelineFactory>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl StreamRegistry {
    pub fn new(settings: RegistrySettings, pipelines: Arc<dyn PipelineFactory>) -> Self {
        Self {
            settings,
            pipelines,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Start a session reading `source_uri`, relayed on `relay_port` if given.
    ///
    /// An id whose previous session already stopped on its own is reused.
    pub fn start(
        &self,
        id: &str,
        source_uri: &str,
        relay_port: Option<u16>,
    ) -> Result<SessionHandle, RegistryError> {
        let relay = relay_port.map(|_| Arc::new(RelayConduit::new(self.settings.relay.clone())));
        let session = Arc::new(StreamSession::new(
            id,
            source_uri,
            relay,
            self.settings.session.clone(),
        ));

        {
            let mut sessions = self.lock();
            if let Some(existing) = sessions.get(id) {
                if existing.is_active() {
                    return Err(RegistryError::DuplicateSession(id.to_string()));
                }
                log::info!(
                    "stream {}: replacing stopped session ({:?})",
                    id,
                    existing.termination()
                );
            }
            sessions.insert(id.to_string(), Arc::clone(&session));
        }

        if let Err(err) = self.launch(&session, relay_port) {
            if let Some(relay) = session.relay() {
                if let Err(stop_err) = relay.stop() {
                    log::warn!("stream {}: relay cleanup failed: {:#}", id, stop_err);
                }
            }
            self.remove_if_same(id, &session);
            log::error!("stream {}: start failed: {:#}", id, err);
            return Err(RegistryError::Start(err));
        }
        Ok(session)
    }

    fn launch(&self, session: &StreamSession, relay_port: Option<u16>) -> anyhow::Result<()> {
        let id = session.id();
        let source = open_source(session.source_uri(), &self.settings.ingest)
            .with_context(|| format!("open source for stream {}", id))?;
        let pipeline = self
            .pipelines
            .build(id)
            .with_context(|| format!("build pipeline for stream {}", id))?;
        if let (Some(relay), Some(port)) = (session.relay(), relay_port) {
            relay
                .start(port, id)
                .with_context(|| format!("start relay for stream {}", id))?;
        }
        session.launch(source, pipeline)
    }

    /// Stop and remove a session.
    pub fn stop(&self, id: &str) -> Result<(), RegistryError> {
        let session = self.get(id)?;
        if let Err(err) = session.stop() {
            log::warn!("stream {}: {:#}", id, err);
        }
        self.remove_if_same(id, &session);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<SessionHandle, RegistryError> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))
    }

    /// Next annotated frame for `id`; waits up to `timeout` or the session default.
    pub fn latest_frame(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<AnnotatedFrame>, RegistryError> {
        let session = self.get(id)?;
        let timeout = timeout.unwrap_or(session.settings().frame_timeout);
        Ok(session.get_latest_frame(timeout))
    }

    pub fn stats(&self, id: &str) -> Result<StreamStats, RegistryError> {
        Ok(self.get(id)?.stats())
    }

    pub fn info(&self, id: &str) -> Result<StreamInfo, RegistryError> {
        Ok(self.get(id)?.info())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stop every session. Used at shutdown.
    pub fn stop_all(&self) {
        for id in self.ids() {
            match self.stop(&id) {
                Ok(()) | Err(RegistryError::SessionNotFound(_)) => {}
                Err(err) => log::warn!("stream {}: {}", id, err),
            }
        }
    }

    fn remove_if_same(&self, id: &str, session: &SessionHandle) {
        let mut sessions = self.lock();
        if sessions
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}
