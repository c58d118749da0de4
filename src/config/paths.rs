//! Hierarchical setting paths, `/services/<group>/<setting>`.
//!
//! Subscribing to a group constant receives every setting beneath it.

// Logging
pub const LOGGING: &str = "/services/logging";
pub const LOGGING_LEVEL: &str = "/services/logging/level";

// UDP listener
pub const UDP_LISTENER: &str = "/services/udpListener";
pub const UDP_LISTENER_PREFERRED_PORT: &str = "/services/udpListener/preferredPort";

// Unit-of-measure selection, one per measurement kind
pub const UNIT_OF_MEASURE: &str = "/services/unitOfMeasure";
pub const UNIT_AIR_TEMPERATURE: &str = "/services/unitOfMeasure/airTemperature/selection";
pub const UNIT_WIND_SPEED: &str = "/services/unitOfMeasure/windSpeed/selection";
pub const UNIT_PRESSURE: &str = "/services/unitOfMeasure/pressure/selection";
pub const UNIT_RAIN: &str = "/services/unitOfMeasure/rain/selection";
pub const UNIT_DISTANCE: &str = "/services/unitOfMeasure/distance/selection";

// Database connection strings
pub const DATABASE: &str = "/services/database";
pub const DATABASE_ROLLUP_CONNECTION: &str = "/services/database/rollup/connectionString";
