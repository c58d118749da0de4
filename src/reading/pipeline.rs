//! Packet-to-reading stage on the relay bus.
//!
//! Subscribes to [`RawPacket`], publishes one [`TypedReading`] per packet
//! that carries a measurement, and re-derives the latest reading of each
//! kind when a unit selection changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::transformer::ReadingTransformer;
use super::units::UnitPreferences;
use super::TypedReading;
use crate::bus::{RelayBus, SubscriptionId};
use crate::config::paths;
use crate::packet::{PacketKind, RawPacket};

pub struct ReadingPipeline {
    bus: Arc<RelayBus>,
    transformer: Arc<dyn ReadingTransformer>,
    units: RwLock<UnitPreferences>,
    latest: DashMap<PacketKind, (RawPacket, TypedReading)>,
    unit_subscription: Mutex<Option<SubscriptionId>>,
    published: AtomicU64,
    failed: AtomicU64,
}

impl ReadingPipeline {
    /// Create the pipeline and attach it to the bus.
    pub fn start(
        bus: Arc<RelayBus>,
        transformer: Arc<dyn ReadingTransformer>,
        units: UnitPreferences,
    ) -> Arc<Self> {
        let pipeline = Arc::new(Self {
            bus: Arc::clone(&bus),
            transformer,
            units: RwLock::new(units),
            latest: DashMap::new(),
            unit_subscription: Mutex::new(None),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        bus.register(&pipeline, |pipeline: &ReadingPipeline, packet: &RawPacket| {
            pipeline.on_packet(packet);
        });

        let weak = Arc::downgrade(&pipeline);
        let id = bus.register_path(paths::UNIT_OF_MEASURE, move |value| {
            if let Some(pipeline) = weak.upgrade() {
                pipeline.on_unit_change(&value.path, &value.value);
            }
        });
        *pipeline
            .unit_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);

        info!(?units, "Reading pipeline started");
        pipeline
    }

    pub fn units(&self) -> UnitPreferences {
        *self.units.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Readings published so far, including re-derivations.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Packets whose transform failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Detach from the bus.
    pub fn stop(self: &Arc<Self>) {
        self.bus.unregister(self);
        let id = self
            .unit_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = id {
            self.bus.unregister_path(id);
        }
        debug!("Reading pipeline stopped");
    }

    fn on_packet(&self, packet: &RawPacket) {
        let units = self.units();
        match self.transformer.transform(packet, &units) {
            Ok(Some(reading)) => {
                self.latest
                    .insert(packet.kind, (packet.clone(), reading.clone()));
                self.publish(&reading);
            }
            Ok(None) => {}
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(packet_id = %packet.id, kind = %packet.kind, error = %e, "Failed to transform packet");
            }
        }
    }

    fn on_unit_change(&self, path: &str, value: &str) {
        let units = {
            let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
            if !units.apply(path, value) {
                return;
            }
            *units
        };
        info!(path, value, "Unit selection changed, re-deriving latest readings");

        let snapshot: Vec<(RawPacket, TypedReading)> =
            self.latest.iter().map(|e| e.value().clone()).collect();

        for (packet, previous) in snapshot {
            match self.transformer.retransform(&packet, &previous, &units) {
                Ok(Some(reading)) => {
                    self.latest.insert(packet.kind, (packet, reading.clone()));
                    self.publish(&reading);
                }
                Ok(None) => {}
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(packet_id = %packet.id, error = %e, "Failed to re-derive reading");
                }
            }
        }
    }

    fn publish(&self, reading: &TypedReading) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let delivered = self.bus.send(reading);
        debug!(
            reading_id = %reading.id,
            kind = reading.measurement.kind(),
            delivered,
            "Published reading"
        );
    }
}
