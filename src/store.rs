use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Local, TimeDelta};
use tokio::sync::RwLock;

use crate::reading::Reading;

/// A sensor counts as online while its last reading is younger than this.
pub const ONLINE_WINDOW: TimeDelta = TimeDelta::seconds(60);

#[derive(Debug, Clone, Default)]
struct SensorState {
    last_reading: Option<Reading>,
    last_updated: Option<DateTime<Local>>,
}

/// Latest state of one sensor as seen by a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorStatus {
    pub name: String,
    pub reading: Option<Reading>,
    pub last_updated: Option<DateTime<Local>>,
    pub online: bool,
}

/// Latest reading per configured sensor, shared between the poller and the
/// API handlers.
///
/// Cloning is cheap; every clone sees the same state. Reading and timestamp
/// are replaced together under one write lock, so readers never see one
/// without the other.
#[derive(Debug, Clone)]
pub struct ReadingsStore {
    order: Arc<[String]>,
    states: Arc<RwLock<HashMap<String, SensorState>>>,
}

impl ReadingsStore {
    pub fn new<I, S>(names: I) -> ReadingsStore
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let order: Arc<[String]> = names.into_iter().map(Into::into).collect();
        let states = order
            .iter()
            .map(|name| (name.clone(), SensorState::default()))
            .collect();

        ReadingsStore {
            order,
            states: Arc::new(RwLock::new(states)),
        }
    }

    /// Replaces the state of `name`.
    ///
    /// `last_updated` never moves backwards: if the wall clock stepped back
    /// since the previous update, the reading is stored under the previous
    /// timestamp. Returns `false` without touching anything when `name` is
    /// not a configured sensor.
    pub async fn update(&self, name: &str, reading: Reading, timestamp: DateTime<Local>) -> bool {
        let mut states = self.states.write().await;
        let Some(state) = states.get_mut(name) else {
            log::warn!("Ignoring reading for unknown sensor {name:?}");
            return false;
        };

        let timestamp = match state.last_updated {
            Some(last) if timestamp < last => {
                log::warn!("Clock went backwards for {name}, keeping timestamp {last}");
                last
            }
            _ => timestamp,
        };

        *state = SensorState {
            last_reading: Some(reading),
            last_updated: Some(timestamp),
        };
        true
    }

    pub async fn snapshot(&self) -> Vec<SensorStatus> {
        self.snapshot_at(Local::now()).await
    }

    /// Snapshot of every configured sensor in configuration order, with
    /// liveness evaluated against `now`.
    pub async fn snapshot_at(&self, now: DateTime<Local>) -> Vec<SensorStatus> {
        let states = self.states.read().await;
        self.order
            .iter()
            .map(|name| {
                let state = states.get(name).cloned().unwrap_or_default();
                SensorStatus {
                    name: name.clone(),
                    online: is_online(state.last_updated, now),
                    reading: state.last_reading,
                    last_updated: state.last_updated,
                }
            })
            .collect()
    }
}

fn is_online(last_updated: Option<DateTime<Local>>, now: DateTime<Local>) -> bool {
    last_updated.is_some_and(|last| now.signed_duration_since(last) < ONLINE_WINDOW)
}
