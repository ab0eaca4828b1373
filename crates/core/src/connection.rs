use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use thiserror::Error;

use crate::profiles::ConnectionProfile;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ConnectionBackendError {
    message: String,
}

impl ConnectionBackendError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ConnectionBackend {
    type Connection: Send;

    async fn connect(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Self::Connection, ConnectionBackendError>;
    async fn ping(&self, connection: &mut Self::Connection) -> Result<(), ConnectionBackendError>;
    async fn disconnect(
        &self,
        connection: Self::Connection,
    ) -> Result<(), ConnectionBackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub profile_name: Option<String>,
    pub is_connected: bool,
    pub last_latency: Option<Duration>,
    pub last_health_check_at: Option<SystemTime>,
}

impl ConnectionStatus {
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            profile_name: None,
            is_connected: false,
            last_latency: None,
            last_health_check_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("active connection already exists for profile `{active_profile}`")]
    AlreadyConnected { active_profile: String },
    #[error("not connected")]
    NotConnected,
    #[error("connection backend failed: {0}")]
    Backend(#[source] ConnectionBackendError),
}

#[derive(Debug)]
struct ActiveConnection<C> {
    profile: ConnectionProfile,
    handle: C,
}

/// Tracks the one active connection behind a session's views.
///
/// Connect and test-connection are the only blocking operations in the
/// client: the connect dialog waits on them, everything else goes through
/// the background loader.
#[derive(Debug)]
pub struct ConnectionManager<B: ConnectionBackend> {
    backend: B,
    active: Option<ActiveConnection<B::Connection>>,
    last_latency: Option<Duration>,
    last_health_check_at: Option<SystemTime>,
}

impl<B: ConnectionBackend> ConnectionManager<B> {
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            active: None,
            last_latency: None,
            last_health_check_at: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            profile_name: self
                .active
                .as_ref()
                .map(|active| active.profile.name.clone()),
            is_connected: self.active.is_some(),
            last_latency: self.last_latency,
            last_health_check_at: self.last_health_check_at,
        }
    }

    #[must_use]
    pub fn active_profile(&self) -> Option<&ConnectionProfile> {
        self.active.as_ref().map(|active| &active.profile)
    }

    pub async fn connect(
        &mut self,
        profile: ConnectionProfile,
    ) -> Result<Duration, ConnectionError> {
        if let Some(active) = &self.active {
            return Err(ConnectionError::AlreadyConnected {
                active_profile: active.profile.name.clone(),
            });
        }

        let started_at = Instant::now();
        let mut handle = self
            .backend
            .connect(&profile)
            .await
            .map_err(ConnectionError::Backend)?;
        self.backend
            .ping(&mut handle)
            .await
            .map_err(ConnectionError::Backend)?;

        let latency = started_at.elapsed();
        self.last_latency = Some(latency);
        self.last_health_check_at = Some(SystemTime::now());
        self.active = Some(ActiveConnection { profile, handle });

        Ok(latency)
    }

    /// Full connect/ping/disconnect roundtrip without touching the active
    /// connection; what the "test connection" button runs.
    pub async fn test_profile(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Duration, ConnectionError> {
        let started_at = Instant::now();
        let mut handle = self
            .backend
            .connect(profile)
            .await
            .map_err(ConnectionError::Backend)?;
        self.backend
            .ping(&mut handle)
            .await
            .map_err(ConnectionError::Backend)?;
        let latency = started_at.elapsed();
        self.backend
            .disconnect(handle)
            .await
            .map_err(ConnectionError::Backend)?;
        Ok(latency)
    }

    pub async fn health_check(&mut self) -> Result<Duration, ConnectionError> {
        let active = self.active.as_mut().ok_or(ConnectionError::NotConnected)?;

        let started_at = Instant::now();
        self.backend
            .ping(&mut active.handle)
            .await
            .map_err(ConnectionError::Backend)?;

        let latency = started_at.elapsed();
        self.last_latency = Some(latency);
        self.last_health_check_at = Some(SystemTime::now());

        Ok(latency)
    }

    pub async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        self.backend
            .disconnect(active.handle)
            .await
            .map_err(ConnectionError::Backend)?;
        self.last_latency = None;
        self.last_health_check_at = None;
        Ok(())
    }
}
