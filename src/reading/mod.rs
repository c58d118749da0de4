//! Typed readings derived from raw packets, with provenance.
//!
//! A reading is immutable. A unit change produces a *new* reading with a new
//! identity whose provenance marks it as a retransformation.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

mod pipeline;
mod transformer;
mod units;

pub use pipeline::ReadingPipeline;
pub use transformer::{JsonReadingTransformer, ReadingTransformer, TransformError, TRANSFORMER_VERSION};
pub use units::{DistanceUnit, PressureUnit, RainUnit, TemperatureUnit, UnitPreferences, WindUnit};

/// Version suffix marking a re-derivation from the same source packet.
pub const RETRANSFORM_SUFFIX: &str = "+retransform";

/// Diagnostic trail from source packet to reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Provenance {
    pub source_packet_id: Uuid,
    pub udp_received_at: DateTime<Utc>,
    pub transform_started_at: DateTime<Utc>,
    pub transform_finished_at: DateTime<Utc>,
    pub source_units: Option<String>,
    pub target_units: Option<String>,
    pub transformer_version: String,
}

impl Provenance {
    pub fn transform_duration(&self) -> Duration {
        self.transform_finished_at - self.transform_started_at
    }

    /// Receipt to end of transform.
    pub fn total_pipeline_duration(&self) -> Duration {
        self.transform_finished_at - self.udp_received_at
    }

    pub fn is_retransformation(&self) -> bool {
        self.transformer_version.ends_with(RETRANSFORM_SUFFIX)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationReading {
    pub wind_lull: Option<f64>,
    pub wind_avg: Option<f64>,
    pub wind_gust: Option<f64>,
    pub wind_direction: Option<f64>,
    pub station_pressure: Option<f64>,
    pub air_temperature: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub illuminance: Option<f64>,
    pub uv: Option<f64>,
    pub solar_radiation: Option<f64>,
    pub rain_accumulation: Option<f64>,
    pub precipitation_type: Option<i64>,
    pub lightning_avg_distance: Option<f64>,
    pub lightning_strike_count: Option<i64>,
    pub battery: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindReading {
    pub speed: Option<f64>,
    pub direction: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrecipitationReading;

#[derive(Debug, Clone, PartialEq)]
pub struct LightningReading {
    pub distance: Option<f64>,
    pub energy: Option<f64>,
}

/// Sensor-specific payload of a reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    Observation(ObservationReading),
    Wind(WindReading),
    Precipitation(PrecipitationReading),
    Lightning(LightningReading),
}

impl Measurement {
    pub fn kind(&self) -> &'static str {
        match self {
            Measurement::Observation(_) => "observation",
            Measurement::Wind(_) => "wind",
            Measurement::Precipitation(_) => "precipitation",
            Measurement::Lightning(_) => "lightning",
        }
    }
}

/// A typed reading, published once on the relay bus.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedReading {
    pub id: Uuid,
    pub source_packet_id: Uuid,
    pub serial_number: Option<String>,
    /// Device event time, UTC epoch seconds.
    pub event_at: i64,
    /// Receipt time, UTC epoch seconds.
    pub received_at: i64,
    pub measurement: Measurement,
    pub provenance: Provenance,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provenance(version: &str) -> Provenance {
        let received = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        Provenance {
            source_packet_id: Uuid::now_v7(),
            udp_received_at: received,
            transform_started_at: received + Duration::milliseconds(5),
            transform_finished_at: received + Duration::milliseconds(8),
            source_units: None,
            target_units: None,
            transformer_version: version.to_string(),
        }
    }

    #[test]
    fn test_durations() {
        let p = provenance("1.0.0");
        assert_eq!(p.transform_duration(), Duration::milliseconds(3));
        assert_eq!(p.total_pipeline_duration(), Duration::milliseconds(8));
    }

    #[test]
    fn test_retransformation_flag_from_version() {
        assert!(!provenance("1.0.0").is_retransformation());
        assert!(provenance("1.0.0+retransform").is_retransformation());
    }
}
