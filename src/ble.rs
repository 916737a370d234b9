use std::{collections::BTreeSet, str::FromStr, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        Service,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures_util::StreamExt;
use tokio::{sync::mpsc, time::Instant};
use uuid::Uuid;

use crate::{
    link::{LinkError, SensorConnection, SensorLink, Subscription},
    tp357,
};

/// How often the scan results are checked while waiting for a device.
const DISCOVERY_POLL: Duration = Duration::from_millis(250);

const NOTIFICATION_BUFFER: usize = 8;

impl From<btleplug::Error> for LinkError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => LinkError::NotConnected,
            btleplug::Error::TimedOut(d) => LinkError::Timeout(d),
            e => LinkError::Transport(e.to_string()),
        }
    }
}

/// Bluetooth LE link through the first local adapter.
#[derive(Clone)]
pub struct BleLink {
    adapter: Adapter,
}

impl BleLink {
    /// Takes the first adapter and starts a passive scan so devices are
    /// discoverable by address.
    pub async fn new() -> Result<BleLink, anyhow::Error> {
        let manager = Manager::new()
            .await
            .context("Failed to initialize Bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await
            .context("Failed to list Bluetooth adapters")?
            .into_iter()
            .next()
            .context("No Bluetooth adapter found")?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .context("Failed to start scanning")?;

        Ok(BleLink { adapter })
    }

    async fn find(&self, address: BDAddr) -> Result<Peripheral, LinkError> {
        loop {
            for peripheral in self.adapter.peripherals().await? {
                if peripheral.address() == address {
                    return Ok(peripheral);
                }
            }
            tokio::time::sleep(DISCOVERY_POLL).await;
        }
    }
}

#[async_trait]
impl SensorLink for BleLink {
    type Connection = BleConnection;

    async fn connect(&self, address: &str, timeout: Duration) -> Result<BleConnection, LinkError> {
        let addr = BDAddr::from_str(address)
            .map_err(|_| LinkError::InvalidAddress(address.to_string()))?;
        let deadline = Instant::now() + timeout;

        let peripheral = tokio::time::timeout_at(deadline, self.find(addr))
            .await
            .map_err(|_| LinkError::NotFound(address.to_string()))??;

        let opened = tokio::time::timeout_at(deadline, async {
            peripheral.connect().await?;
            peripheral.discover_services().await
        })
        .await;

        match opened {
            Ok(Ok(())) => Ok(BleConnection { peripheral }),
            Ok(Err(e)) => {
                let _ = peripheral.disconnect().await;
                Err(e.into())
            }
            Err(_) => {
                let _ = peripheral.disconnect().await;
                Err(LinkError::Timeout(timeout))
            }
        }
    }
}

pub struct BleConnection {
    peripheral: Peripheral,
}

impl BleConnection {
    /// Services discovered on the device, with their characteristics.
    pub fn services(&self) -> BTreeSet<Service> {
        self.peripheral.services()
    }

    fn characteristic(
        &self,
        uuid: Uuid,
        needs: CharPropFlags,
    ) -> Result<Characteristic, LinkError> {
        let characteristic = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(LinkError::CharacteristicNotFound(uuid))?;

        if !characteristic.properties.intersects(needs) {
            return Err(LinkError::Unsupported(uuid));
        }
        Ok(characteristic)
    }
}

#[async_trait]
impl SensorConnection for BleConnection {
    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn read(&self, characteristic: Uuid, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        let characteristic = self.characteristic(characteristic, CharPropFlags::READ)?;
        tokio::time::timeout(timeout, self.peripheral.read(&characteristic))
            .await
            .map_err(|_| LinkError::Timeout(timeout))?
            .map_err(Into::into)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<Subscription, LinkError> {
        let characteristic = self.characteristic(
            characteristic,
            CharPropFlags::NOTIFY | CharPropFlags::INDICATE,
        )?;

        let mut stream = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&characteristic).await?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let uuid = characteristic.uuid;
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(uuid, rx, Some(forwarder)))
    }

    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), LinkError> {
        let uuid = subscription.characteristic();
        drop(subscription);

        let characteristic = self.characteristic(
            uuid,
            CharPropFlags::NOTIFY | CharPropFlags::INDICATE,
        )?;
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Connects to `address` and logs every service, characteristic and
/// descriptor it exposes.
pub async fn discover(link: &BleLink, address: &str, timeout: Duration) -> Result<(), LinkError> {
    log::info!("Connecting to {address}");
    let conn = link.connect(address, timeout).await?;
    log::info!("Connected to {address}");

    for line in describe_services(&conn.services()) {
        log::info!("{line}");
    }

    conn.disconnect().await
}

/// One line per service, characteristic and descriptor, indented by level.
/// Characteristics the poller uses are labelled.
pub fn describe_services(services: &BTreeSet<Service>) -> Vec<String> {
    let mut lines = Vec::new();
    for service in services {
        let kind = if service.primary { "primary" } else { "secondary" };
        lines.push(format!("Service {} ({kind})", service.uuid));

        for characteristic in &service.characteristics {
            let role = match characteristic.uuid {
                tp357::REALTIME_CHAR_UUID => " [direct read]",
                tp357::DATA_CHAR_UUID => " [notifications]",
                _ => "",
            };
            lines.push(format!(
                "  Characteristic {} {:?}{role}",
                characteristic.uuid, characteristic.properties
            ));

            for descriptor in &characteristic.descriptors {
                lines.push(format!("    Descriptor {}", descriptor.uuid));
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use btleplug::api::Descriptor;

    use super::*;

    const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
    const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

    fn characteristic(uuid: Uuid, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid: SERVICE_UUID,
            properties,
            descriptors: BTreeSet::from([Descriptor {
                uuid: CCCD_UUID,
                service_uuid: SERVICE_UUID,
                characteristic_uuid: uuid,
            }]),
        }
    }

    #[test]
    fn test_describe_services() {
        let services = BTreeSet::from([Service {
            uuid: SERVICE_UUID,
            primary: true,
            characteristics: BTreeSet::from([characteristic(
                tp357::DATA_CHAR_UUID,
                CharPropFlags::NOTIFY,
            )]),
        }]);

        let lines = describe_services(&services);

        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "Service 0000fff0-0000-1000-8000-00805f9b34fb (primary)"
        );
        assert!(lines[1].starts_with("  Characteristic 00010203-0405-0607-0809-0a0b0c0d2b10"));
        assert!(lines[1].contains("NOTIFY"));
        assert!(lines[1].ends_with("[notifications]"));
        assert_eq!(
            lines[2],
            "    Descriptor 00002902-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_describe_no_services() {
        assert!(describe_services(&BTreeSet::new()).is_empty());
    }
}
