use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    config::SensorConfig,
    link::{LinkError, SensorConnection, SensorLink, Subscription},
    reading::Reading,
    store::ReadingsStore,
    tp357::{self, DecodeError},
};

/// Longest wait for a notification once subscribed.
pub const NOTIFICATION_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PollError {
    #[error("failed to connect: {0}")]
    Connect(#[source] LinkError),
    #[error("connection reported as not connected")]
    NotConnected,
    #[error("direct read failed: {0}")]
    Read(#[source] LinkError),
    #[error("failed to decode payload: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to subscribe: {0}")]
    Subscribe(#[source] LinkError),
    #[error("no notification within {0:?}")]
    NotificationTimeout(Duration),
    #[error("notification stream closed")]
    NotificationsClosed,
    #[error("reading was not stored")]
    NotStored,
}

/// How a reading was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    DirectRead,
    Notification,
}

/// Runs single polling attempts against sensors and records what they
/// return in the store.
#[derive(Debug)]
pub struct SensorReader<L> {
    link: L,
    store: ReadingsStore,
    notification_wait: Duration,
}

impl<L: SensorLink> SensorReader<L> {
    pub fn new(link: L, store: ReadingsStore) -> SensorReader<L> {
        SensorReader {
            link,
            store,
            notification_wait: NOTIFICATION_WAIT,
        }
    }

    /// Polls `sensor` once. Returns `true` when a reading was stored.
    ///
    /// Failures are logged and never escape, so one broken sensor cannot
    /// stop the others from being polled.
    pub async fn poll(&self, sensor: &SensorConfig, timeout: Duration) -> bool {
        log::info!("Connecting to {} ({})", sensor.name, sensor.address);

        match self.try_poll(sensor, timeout).await {
            Ok((strategy, reading)) => {
                log::info!(
                    "{}: {:.1}°C / {:.1}°F, {}% RH (via {:?})",
                    sensor.name,
                    reading.temperature_celsius,
                    reading.temperature_fahrenheit,
                    reading.humidity_percent,
                    strategy
                );
                true
            }
            Err(e) => {
                log::warn!("Failed to read {}: {e}", sensor.name);
                false
            }
        }
    }

    async fn try_poll(
        &self,
        sensor: &SensorConfig,
        timeout: Duration,
    ) -> Result<(Strategy, Reading), PollError> {
        let conn = self
            .link
            .connect(&sensor.address, timeout)
            .await
            .map_err(PollError::Connect)?;

        let result = if conn.is_connected().await {
            self.read_with_fallback(&conn, sensor, timeout).await
        } else {
            Err(PollError::NotConnected)
        };

        if let Err(e) = conn.disconnect().await {
            log::warn!("Failed to disconnect from {}: {e}", sensor.name);
        }

        result
    }

    async fn read_with_fallback<C: SensorConnection>(
        &self,
        conn: &C,
        sensor: &SensorConfig,
        timeout: Duration,
    ) -> Result<(Strategy, Reading), PollError> {
        match self.read_direct(conn, sensor, timeout).await {
            Ok(reading) => return Ok((Strategy::DirectRead, reading)),
            Err(PollError::NotStored) => return Err(PollError::NotStored),
            Err(e) => log::debug!("{}: {e}, waiting for a notification", sensor.name),
        }

        self.read_notification(conn, sensor)
            .await
            .map(|reading| (Strategy::Notification, reading))
    }

    async fn read_direct<C: SensorConnection>(
        &self,
        conn: &C,
        sensor: &SensorConfig,
        timeout: Duration,
    ) -> Result<Reading, PollError> {
        let data = conn
            .read(tp357::REALTIME_CHAR_UUID, timeout)
            .await
            .map_err(PollError::Read)?;
        log::debug!("{}: direct read {}", sensor.name, hex::encode(&data));

        let reading = tp357::decode(&data)?;
        self.store(sensor, &reading).await?;
        Ok(reading)
    }

    async fn read_notification<C: SensorConnection>(
        &self,
        conn: &C,
        sensor: &SensorConfig,
    ) -> Result<Reading, PollError> {
        let mut subscription = conn
            .subscribe(tp357::DATA_CHAR_UUID)
            .await
            .map_err(PollError::Subscribe)?;

        let result = self.await_notification(&mut subscription, sensor).await;

        if let Err(e) = conn.unsubscribe(subscription).await {
            log::warn!("Failed to unsubscribe from {}: {e}", sensor.name);
        }

        result
    }

    /// Stores the first notification that decodes; undecodable frames are
    /// skipped until the wait runs out.
    async fn await_notification(
        &self,
        subscription: &mut Subscription,
        sensor: &SensorConfig,
    ) -> Result<Reading, PollError> {
        let deadline = Instant::now() + self.notification_wait;

        loop {
            let data = match tokio::time::timeout_at(deadline, subscription.recv()).await {
                Ok(Some(data)) => data,
                Ok(None) => return Err(PollError::NotificationsClosed),
                Err(_) => return Err(PollError::NotificationTimeout(self.notification_wait)),
            };
            log::debug!("{}: notification {}", sensor.name, hex::encode(&data));

            match tp357::decode(&data) {
                Ok(reading) => {
                    self.store(sensor, &reading).await?;
                    return Ok(reading);
                }
                Err(e) => log::debug!("{}: skipping notification: {e}", sensor.name),
            }
        }
    }

    async fn store(&self, sensor: &SensorConfig, reading: &Reading) -> Result<(), PollError> {
        let stored = self
            .store
            .update(&sensor.name, reading.clone(), Local::now())
            .await;
        if stored { Ok(()) } else { Err(PollError::NotStored) }
    }
}
