//! Unit selections and the small conversion table applied to readings.
//!
//! Station packets report metric base units: celsius, m/s, millibar,
//! millimetres and kilometres.

use crate::config::paths;

macro_rules! unit_enum {
    ($name:ident, base = $base:ident, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub enum $name {
            #[default]
            $base,
            $($variant),+
        }

        impl $name {
            pub fn parse(text: &str) -> Option<Self> {
                match text {
                    $($text => Some(Self::$variant),)+
                    _ if text == Self::$base.as_str() => Some(Self::$base),
                    _ => None,
                }
            }
        }
    };
}

unit_enum!(TemperatureUnit, base = Celsius, { Fahrenheit => "fahrenheit" });
unit_enum!(WindUnit, base = MetersPerSecond, { KilometersPerHour => "kph", MilesPerHour => "mph", Knots => "knots" });
unit_enum!(PressureUnit, base = Millibar, { Hectopascal => "hpa", InchesOfMercury => "inhg" });
unit_enum!(RainUnit, base = Millimeters, { Inches => "in" });
unit_enum!(DistanceUnit, base = Kilometers, { Miles => "mi" });

impl TemperatureUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "celsius",
            TemperatureUnit::Fahrenheit => "fahrenheit",
        }
    }

    pub fn convert(&self, celsius: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => celsius,
            TemperatureUnit::Fahrenheit => celsius * 9.0 / 5.0 + 32.0,
        }
    }
}

impl WindUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindUnit::MetersPerSecond => "mps",
            WindUnit::KilometersPerHour => "kph",
            WindUnit::MilesPerHour => "mph",
            WindUnit::Knots => "knots",
        }
    }

    pub fn convert(&self, mps: f64) -> f64 {
        match self {
            WindUnit::MetersPerSecond => mps,
            WindUnit::KilometersPerHour => mps * 3.6,
            WindUnit::MilesPerHour => mps * 2.236_936,
            WindUnit::Knots => mps * 1.943_844,
        }
    }
}

impl PressureUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureUnit::Millibar => "mb",
            PressureUnit::Hectopascal => "hpa",
            PressureUnit::InchesOfMercury => "inhg",
        }
    }

    pub fn convert(&self, millibar: f64) -> f64 {
        match self {
            PressureUnit::Millibar | PressureUnit::Hectopascal => millibar,
            PressureUnit::InchesOfMercury => millibar * 0.029_529_98,
        }
    }
}

impl RainUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            RainUnit::Millimeters => "mm",
            RainUnit::Inches => "in",
        }
    }

    pub fn convert(&self, millimeters: f64) -> f64 {
        match self {
            RainUnit::Millimeters => millimeters,
            RainUnit::Inches => millimeters / 25.4,
        }
    }
}

impl DistanceUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceUnit::Kilometers => "km",
            DistanceUnit::Miles => "mi",
        }
    }

    pub fn convert(&self, kilometers: f64) -> f64 {
        match self {
            DistanceUnit::Kilometers => kilometers,
            DistanceUnit::Miles => kilometers * 0.621_371,
        }
    }
}

/// The selected unit for each measurement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitPreferences {
    pub temperature: TemperatureUnit,
    pub wind: WindUnit,
    pub pressure: PressureUnit,
    pub rain: RainUnit,
    pub distance: DistanceUnit,
}

impl UnitPreferences {
    /// Build from a settings lookup; unknown or missing selections keep the base unit.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut preferences = Self::default();
        for path in [
            paths::UNIT_AIR_TEMPERATURE,
            paths::UNIT_WIND_SPEED,
            paths::UNIT_PRESSURE,
            paths::UNIT_RAIN,
            paths::UNIT_DISTANCE,
        ] {
            if let Some(value) = lookup(path) {
                preferences.apply(path, &value);
            }
        }
        preferences
    }

    /// Apply one setting change. Returns true if a selection changed.
    pub fn apply(&mut self, path: &str, value: &str) -> bool {
        let before = *self;
        match path {
            paths::UNIT_AIR_TEMPERATURE => {
                if let Some(unit) = TemperatureUnit::parse(value) {
                    self.temperature = unit;
                }
            }
            paths::UNIT_WIND_SPEED => {
                if let Some(unit) = WindUnit::parse(value) {
                    self.wind = unit;
                }
            }
            paths::UNIT_PRESSURE => {
                if let Some(unit) = PressureUnit::parse(value) {
                    self.pressure = unit;
                }
            }
            paths::UNIT_RAIN => {
                if let Some(unit) = RainUnit::parse(value) {
                    self.rain = unit;
                }
            }
            paths::UNIT_DISTANCE => {
                if let Some(unit) = DistanceUnit::parse(value) {
                    self.distance = unit;
                }
            }
            _ => {}
        }
        *self != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(TemperatureUnit::parse("fahrenheit"), Some(TemperatureUnit::Fahrenheit));
        assert_eq!(TemperatureUnit::parse("celsius"), Some(TemperatureUnit::Celsius));
        assert_eq!(WindUnit::parse("knots"), Some(WindUnit::Knots));
        assert_eq!(WindUnit::parse("furlongs"), None);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(TemperatureUnit::Fahrenheit.convert(100.0), 212.0);
        assert!((WindUnit::KilometersPerHour.convert(10.0) - 36.0).abs() < 1e-9);
        assert!((RainUnit::Inches.convert(25.4) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_apply_reports_change() {
        let mut prefs = UnitPreferences::default();
        assert!(prefs.apply(paths::UNIT_AIR_TEMPERATURE, "fahrenheit"));
        assert!(!prefs.apply(paths::UNIT_AIR_TEMPERATURE, "fahrenheit"));
        assert!(!prefs.apply(paths::UNIT_AIR_TEMPERATURE, "kelvin"));
        assert!(!prefs.apply(paths::UDP_LISTENER_PREFERRED_PORT, "1"));
    }

    #[test]
    fn test_from_lookup() {
        let prefs = UnitPreferences::from_lookup(|path| match path {
            paths::UNIT_WIND_SPEED => Some("mph".to_string()),
            _ => None,
        });
        assert_eq!(prefs.wind, WindUnit::MilesPerHour);
        assert_eq!(prefs.temperature, TemperatureUnit::Celsius);
    }
}
