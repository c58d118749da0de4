//! Reference transformer from raw JSON packets to typed readings.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::units::UnitPreferences;
use super::{
    LightningReading, Measurement, ObservationReading, PrecipitationReading, Provenance,
    TypedReading, WindReading, RETRANSFORM_SUFFIX,
};
use crate::packet::{PacketKind, RawPacket};

/// Version stamped into provenance by [`JsonReadingTransformer`].
pub const TRANSFORMER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors that can occur while deriving a reading.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Packet payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Packet is missing field '{0}'")]
    MissingField(&'static str),

    #[error("Packet has no usable event timestamp")]
    MissingTimestamp,

    #[error("Reading {reading} was not derived from packet {packet}")]
    SourceMismatch { reading: Uuid, packet: Uuid },
}

/// Derives typed readings from classified packets.
pub trait ReadingTransformer: Send + Sync {
    /// Version string for first-time transforms.
    fn version(&self) -> &str;

    /// Derive a reading, stamping `version` into its provenance.
    ///
    /// Returns `Ok(None)` for packet kinds that carry no reading.
    fn derive(
        &self,
        packet: &RawPacket,
        units: &UnitPreferences,
        version: &str,
    ) -> Result<Option<TypedReading>, TransformError>;

    fn transform(
        &self,
        packet: &RawPacket,
        units: &UnitPreferences,
    ) -> Result<Option<TypedReading>, TransformError> {
        self.derive(packet, units, self.version())
    }

    /// Derive a fresh reading from the packet `previous` came from.
    fn retransform(
        &self,
        packet: &RawPacket,
        previous: &TypedReading,
        units: &UnitPreferences,
    ) -> Result<Option<TypedReading>, TransformError> {
        if previous.source_packet_id != packet.id {
            return Err(TransformError::SourceMismatch {
                reading: previous.id,
                packet: packet.id,
            });
        }
        let version = format!("{}{}", self.version(), RETRANSFORM_SUFFIX);
        self.derive(packet, units, &version)
    }
}

/// Understands the positional arrays of the four sensor kinds.
#[derive(Debug, Clone, Default)]
pub struct JsonReadingTransformer;

fn number(values: &[Value], index: usize) -> Option<f64> {
    values.get(index).and_then(Value::as_f64)
}

fn integer(values: &[Value], index: usize) -> Option<i64> {
    values.get(index).and_then(Value::as_i64)
}

/// First positional array under `field`; `obs` nests one array per sample.
fn samples<'a>(envelope: &'a Value, field: &'static str) -> Result<&'a [Value], TransformError> {
    let outer = envelope
        .get(field)
        .and_then(Value::as_array)
        .ok_or(TransformError::MissingField(field))?;
    match outer.first() {
        Some(Value::Array(inner)) => Ok(inner),
        _ => Ok(outer),
    }
}

impl ReadingTransformer for JsonReadingTransformer {
    fn version(&self) -> &str {
        TRANSFORMER_VERSION
    }

    fn derive(
        &self,
        packet: &RawPacket,
        units: &UnitPreferences,
        version: &str,
    ) -> Result<Option<TypedReading>, TransformError> {
        let started = Utc::now();

        let (field, kind) = match packet.kind {
            PacketKind::Observation => ("obs", packet.kind),
            PacketKind::RapidWind => ("ob", packet.kind),
            PacketKind::PrecipitationEvent | PacketKind::LightningStrike => ("evt", packet.kind),
            _ => return Ok(None),
        };

        let envelope: Value = serde_json::from_str(&packet.payload)?;
        let values = samples(&envelope, field)?;
        let event_at = integer(values, 0).ok_or(TransformError::MissingTimestamp)?;

        let (measurement, source_units, target_units) = match kind {
            PacketKind::Observation => (
                Measurement::Observation(ObservationReading {
                    wind_lull: number(values, 1).map(|v| units.wind.convert(v)),
                    wind_avg: number(values, 2).map(|v| units.wind.convert(v)),
                    wind_gust: number(values, 3).map(|v| units.wind.convert(v)),
                    wind_direction: number(values, 4),
                    station_pressure: number(values, 6).map(|v| units.pressure.convert(v)),
                    air_temperature: number(values, 7).map(|v| units.temperature.convert(v)),
                    relative_humidity: number(values, 8),
                    illuminance: number(values, 9),
                    uv: number(values, 10),
                    solar_radiation: number(values, 11),
                    rain_accumulation: number(values, 12).map(|v| units.rain.convert(v)),
                    precipitation_type: integer(values, 13),
                    lightning_avg_distance: number(values, 14).map(|v| units.distance.convert(v)),
                    lightning_strike_count: integer(values, 15),
                    battery: number(values, 16),
                }),
                "celsius",
                units.temperature.as_str(),
            ),
            PacketKind::RapidWind => (
                Measurement::Wind(WindReading {
                    speed: number(values, 1).map(|v| units.wind.convert(v)),
                    direction: number(values, 2),
                }),
                "mps",
                units.wind.as_str(),
            ),
            PacketKind::LightningStrike => (
                Measurement::Lightning(LightningReading {
                    distance: number(values, 1).map(|v| units.distance.convert(v)),
                    energy: number(values, 2),
                }),
                "km",
                units.distance.as_str(),
            ),
            _ => (Measurement::Precipitation(PrecipitationReading), "", ""),
        };

        let unit_name = |name: &str| (!name.is_empty()).then(|| name.to_string());
        let udp_received_at: DateTime<Utc> =
            DateTime::from_timestamp(packet.received_at, 0).unwrap_or(started);

        Ok(Some(TypedReading {
            id: Uuid::now_v7(),
            source_packet_id: packet.id,
            serial_number: packet.serial_number.clone(),
            event_at,
            received_at: packet.received_at,
            measurement,
            provenance: Provenance {
                source_packet_id: packet.id,
                udp_received_at,
                transform_started_at: started,
                transform_finished_at: Utc::now(),
                source_units: unit_name(source_units),
                target_units: unit_name(target_units),
                transformer_version: version.to_string(),
            },
        }))
    }
}
