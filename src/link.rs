use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid device address {0:?}")]
    InvalidAddress(String),
    #[error("device {0} not found")]
    NotFound(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("characteristic {0} does not support this operation")]
    Unsupported(Uuid),
    #[error("device is not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Radio transport able to open connections to sensors by address.
#[async_trait]
pub trait SensorLink: Send + Sync {
    type Connection: SensorConnection;

    async fn connect(&self, address: &str, timeout: Duration)
    -> Result<Self::Connection, LinkError>;
}

/// An open connection to a single sensor.
#[async_trait]
pub trait SensorConnection: Send + Sync {
    async fn is_connected(&self) -> bool;

    async fn read(&self, characteristic: Uuid, timeout: Duration) -> Result<Vec<u8>, LinkError>;

    async fn subscribe(&self, characteristic: Uuid) -> Result<Subscription, LinkError>;

    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;
}

/// Stream of notification payloads for one characteristic.
///
/// Dropping it stops the forwarding task, if any. Call
/// [`SensorConnection::unsubscribe`] to also release the subscription on
/// the device.
#[derive(Debug)]
pub struct Subscription {
    characteristic: Uuid,
    notifications: mpsc::Receiver<Vec<u8>>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        characteristic: Uuid,
        notifications: mpsc::Receiver<Vec<u8>>,
        forwarder: Option<JoinHandle<()>>,
    ) -> Subscription {
        Subscription {
            characteristic,
            notifications,
            forwarder,
        }
    }

    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// Next payload, or `None` once the link stopped delivering.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.notifications.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

#[cfg(test)]
pub mod fake {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{LinkError, SensorConnection, SensorLink, Subscription};

    /// Scripted behaviour of one fake device.
    #[derive(Debug, Clone, Default)]
    pub struct Script {
        pub refuse: bool,
        pub report_disconnected: bool,
        pub connect_delay: Duration,
        pub read: Option<Vec<u8>>,
        pub notifications: Vec<Vec<u8>>,
        pub notification_delay: Duration,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Connect(String),
        Read(String, Uuid),
        Subscribe(String, Uuid),
        Unsubscribe(String, Uuid),
        Disconnect(String),
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeLink {
        scripts: Arc<Mutex<HashMap<String, Script>>>,
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl FakeLink {
        pub fn new() -> FakeLink {
            FakeLink::default()
        }

        pub fn script(&self, address: &str, script: Script) {
            self.scripts
                .lock()
                .unwrap()
                .insert(address.to_string(), script);
        }

        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    pub struct FakeConnection {
        address: String,
        script: Script,
        link: FakeLink,
    }

    #[async_trait]
    impl SensorLink for FakeLink {
        type Connection = FakeConnection;

        async fn connect(
            &self,
            address: &str,
            _timeout: Duration,
        ) -> Result<FakeConnection, LinkError> {
            self.record(Event::Connect(address.to_string()));
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(address)
                .cloned()
                .ok_or_else(|| LinkError::NotFound(address.to_string()))?;

            if !script.connect_delay.is_zero() {
                tokio::time::sleep(script.connect_delay).await;
            }
            if script.refuse {
                return Err(LinkError::Transport("connection refused".to_string()));
            }

            Ok(FakeConnection {
                address: address.to_string(),
                script,
                link: self.clone(),
            })
        }
    }

    #[async_trait]
    impl SensorConnection for FakeConnection {
        async fn is_connected(&self) -> bool {
            !self.script.report_disconnected
        }

        async fn read(
            &self,
            characteristic: Uuid,
            _timeout: Duration,
        ) -> Result<Vec<u8>, LinkError> {
            self.link
                .record(Event::Read(self.address.clone(), characteristic));
            self.script
                .read
                .clone()
                .ok_or(LinkError::Unsupported(characteristic))
        }

        async fn subscribe(&self, characteristic: Uuid) -> Result<Subscription, LinkError> {
            self.link
                .record(Event::Subscribe(self.address.clone(), characteristic));
            let (tx, rx) = mpsc::channel(8);
            let payloads = self.script.notifications.clone();
            let delay = self.script.notification_delay;
            let forwarder = tokio::spawn(async move {
                for payload in payloads {
                    tokio::time::sleep(delay).await;
                    if tx.send(payload).await.is_err() {
                        return;
                    }
                }
                // Keep the channel open like a live device that went quiet.
                std::future::pending::<()>().await;
            });
            Ok(Subscription::new(characteristic, rx, Some(forwarder)))
        }

        async fn unsubscribe(&self, subscription: Subscription) -> Result<(), LinkError> {
            self.link.record(Event::Unsubscribe(
                self.address.clone(),
                subscription.characteristic(),
            ));
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), LinkError> {
            self.link.record(Event::Disconnect(self.address.clone()));
            Ok(())
        }
    }
}
