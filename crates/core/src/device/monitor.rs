//! Polling device monitor
//!
//! Scans every `poll_interval`, feeds the registry and forwards its events on
//! an mpsc channel. Ticks are skipped while a transaction is in flight so a
//! scan never competes with a terminal exchange.

use governor::clock::{Clock, DefaultClock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{DeviceEvent, DeviceRegistry, DeviceScanner, RegistryConfig};

pub struct DeviceMonitor<S, C: Clock = DefaultClock> {
    registry: Arc<Mutex<DeviceRegistry<C>>>,
    scanner: S,
    poll_interval: Duration,
    in_flight: Option<Arc<AtomicBool>>,
}

impl<S, C> DeviceMonitor<S, C>
where
    S: DeviceScanner + 'static,
    C: Clock + Send + Sync + 'static,
    C::Instant: Send + Sync,
{
    pub fn new(registry: Arc<Mutex<DeviceRegistry<C>>>, scanner: S, config: &RegistryConfig) -> Self {
        Self {
            registry,
            scanner,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            in_flight: None,
        }
    }

    /// Pause scanning while `flag` is set
    pub fn pause_while(mut self, flag: Arc<AtomicBool>) -> Self {
        self.in_flight = Some(flag);
        self
    }

    /// One scan and diff; returns the events it produced
    pub async fn poll_once(&self) -> Vec<DeviceEvent> {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            tracing::trace!("Transaction in flight, skipping device scan");
            return Vec::new();
        }
        match self.scanner.scan() {
            Ok(scan) => self.registry.lock().await.observe(&scan),
            Err(e) => {
                tracing::warn!("Device scan failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Run until `shutdown` is cancelled or the receiver is dropped
    pub fn spawn(
        self,
        events: mpsc::Sender<DeviceEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                for event in self.poll_once().await {
                    if events.send(event).await.is_err() {
                        tracing::debug!("Device event receiver dropped, stopping monitor");
                        return;
                    }
                }
            }
            tracing::debug!("Device monitor stopped");
        })
    }
}
