use std::time::Duration;

use tokio::{sync::watch, time::Instant};

use crate::{config::SensorConfig, link::SensorLink, sensor::SensorReader};

/// Pause between two sensors so the radio stack can settle.
pub const SENSOR_GAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Polls every configured sensor in order, one cycle per `cycle_interval`.
#[derive(Debug)]
pub struct Poller<L> {
    reader: SensorReader<L>,
    sensors: Vec<SensorConfig>,
    cycle_interval: Duration,
    connection_timeout: Duration,
}

impl<L: SensorLink> Poller<L> {
    pub fn new(
        reader: SensorReader<L>,
        sensors: Vec<SensorConfig>,
        cycle_interval: Duration,
        connection_timeout: Duration,
    ) -> Poller<L> {
        Poller {
            reader,
            sensors,
            cycle_interval,
            connection_timeout,
        }
    }

    /// Runs cycles until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "Starting sensor polling ({}s cycle)",
            self.cycle_interval.as_secs()
        );

        loop {
            let Some(summary) = self.run_cycle(&mut shutdown).await else {
                break;
            };

            let delay = cycle_delay(self.cycle_interval, summary.elapsed);
            log::info!(
                "Cycle complete: {} ok, {} failed in {:.1?}, next cycle in {:.1?}",
                summary.succeeded,
                summary.failed,
                summary.elapsed,
                delay
            );

            if !sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        log::info!("Sensor polling stopped");
    }

    /// Polls each sensor once. Returns `None` if shutdown was requested
    /// before the cycle finished.
    async fn run_cycle(&self, shutdown: &mut watch::Receiver<bool>) -> Option<CycleSummary> {
        log::info!("Starting polling cycle");
        let started = Instant::now();
        let mut succeeded = 0;

        for (i, sensor) in self.sensors.iter().enumerate() {
            if is_shutdown(shutdown) {
                return None;
            }

            if self.reader.poll(sensor, self.connection_timeout).await {
                succeeded += 1;
            }

            let is_last = i + 1 == self.sensors.len();
            if !is_last && !sleep_or_shutdown(SENSOR_GAP, shutdown).await {
                return None;
            }
        }

        Some(CycleSummary {
            succeeded,
            failed: self.sensors.len() - succeeded,
            elapsed: started.elapsed(),
        })
    }
}

/// Time left in the cycle; zero once the cycle has overrun.
pub fn cycle_delay(cycle_interval: Duration, elapsed: Duration) -> Duration {
    cycle_interval.saturating_sub(elapsed)
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleeps for `duration` unless shutdown is requested first. Returns
/// `false` on shutdown.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if is_shutdown(shutdown) {
        return false;
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = wait_for_shutdown(shutdown) => false,
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}
