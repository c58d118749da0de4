//! Packet classification.
//!
//! Maps the `type` discriminator of an upstream datagram onto a closed set of
//! packet kinds. Classification is pure: no state, no I/O.

use std::fmt;
use std::net::SocketAddr;

use serde_json::Value;
use uuid::Uuid;

/// Result type for classification.
pub type Result<T> = std::result::Result<T, ClassifyError>;

/// Errors that can occur while reading a packet envelope.
///
/// An unknown discriminator is *not* an error; it classifies as
/// [`PacketKind::Unclassified`].
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    #[error("Envelope is not a JSON object")]
    NotAnObject,

    #[error("Envelope has no string `type` discriminator")]
    MissingDiscriminator,
}

/// Closed set of upstream packet kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Observation,
    ObservationAir,
    ObservationSky,
    RapidWind,
    PrecipitationEvent,
    LightningStrike,
    DeviceStatus,
    HubStatus,
    Unclassified,
}

/// Discriminator table. Matching is exact and case-sensitive.
const DISCRIMINATORS: &[(&str, PacketKind)] = &[
    ("obs_st", PacketKind::Observation),
    ("obs_air", PacketKind::ObservationAir),
    ("obs_sky", PacketKind::ObservationSky),
    ("rapid_wind", PacketKind::RapidWind),
    ("evt_precip", PacketKind::PrecipitationEvent),
    ("evt_strike", PacketKind::LightningStrike),
    ("device_status", PacketKind::DeviceStatus),
    ("hub_status", PacketKind::HubStatus),
];

impl PacketKind {
    /// Map a discriminator string onto a kind. Never fails.
    pub fn from_discriminator(discriminator: &str) -> Self {
        DISCRIMINATORS
            .iter()
            .find(|(name, _)| *name == discriminator)
            .map(|(_, kind)| *kind)
            .unwrap_or(PacketKind::Unclassified)
    }

    /// Stable name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Observation => "observation",
            PacketKind::ObservationAir => "observation_air",
            PacketKind::ObservationSky => "observation_sky",
            PacketKind::RapidWind => "rapid_wind",
            PacketKind::PrecipitationEvent => "precipitation_event",
            PacketKind::LightningStrike => "lightning_strike",
            PacketKind::DeviceStatus => "device_status",
            PacketKind::HubStatus => "hub_status",
            PacketKind::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of classifying one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: PacketKind,
    /// Raw discriminator as it appeared on the wire.
    pub discriminator: String,
    /// Device serial number, when the envelope carries one.
    pub serial_number: Option<String>,
    /// Hub serial number, when the envelope carries one.
    pub hub_serial_number: Option<String>,
}

/// Classify a UTF-8 JSON envelope.
pub fn classify(text: &str) -> Result<Classification> {
    let envelope: Value = serde_json::from_str(text)?;
    let object = envelope.as_object().ok_or(ClassifyError::NotAnObject)?;

    let discriminator = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ClassifyError::MissingDiscriminator)?;

    let text_field = |name: &str| object.get(name).and_then(Value::as_str).map(str::to_string);

    Ok(Classification {
        kind: PacketKind::from_discriminator(discriminator),
        discriminator: discriminator.to_string(),
        serial_number: text_field("serial_number"),
        hub_serial_number: text_field("hub_sn"),
    })
}

/// One datagram as received, classified and stamped.
///
/// Immutable once created; it is shared by reference on the relay bus.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    /// Time-ordered identity (UUID v7).
    pub id: Uuid,
    /// Receipt time, UTC epoch seconds.
    pub received_at: i64,
    /// Sender address, when known.
    pub source: Option<SocketAddr>,
    pub payload: String,
    pub kind: PacketKind,
    pub serial_number: Option<String>,
}

impl RawPacket {
    /// Decode and classify a datagram received at `received_at`.
    pub fn from_datagram(
        bytes: &[u8],
        source: Option<SocketAddr>,
        received_at: i64,
    ) -> Result<Self> {
        let payload = String::from_utf8(bytes.to_vec())?;
        let classification = classify(&payload)?;

        Ok(Self {
            id: Uuid::now_v7(),
            received_at,
            source,
            payload,
            kind: classification.kind,
            serial_number: classification.serial_number,
        })
    }
}
