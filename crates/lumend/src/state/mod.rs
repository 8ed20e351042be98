//! Last-known device state.

mod store;

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

pub use store::StateStore;

/// Properties requested from a fixture for a live state read
pub const LIVE_PROPERTIES: &[&str] = &["power", "bright", "ct", "rgb", "hue", "sat", "color_mode"];

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Power {
    On,
    Off,
    #[default]
    Unknown,
}

impl Power {
    pub fn is_on(self) -> bool {
        self == Power::On
    }
}

/// Which colour setting is currently driving the fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ColorMode {
    Rgb,
    Temperature,
    Hsv,
}

impl From<ColorMode> for u8 {
    fn from(mode: ColorMode) -> Self {
        match mode {
            ColorMode::Rgb => 1,
            ColorMode::Temperature => 2,
            ColorMode::Hsv => 3,
        }
    }
}

impl TryFrom<u8> for ColorMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ColorMode::Rgb),
            2 => Ok(ColorMode::Temperature),
            3 => Ok(ColorMode::Hsv),
            other => Err(format!("unknown color mode {}", other)),
        }
    }
}

/// State of one light fixture.
///
/// `rgb` and `ct` are mutually exclusive: in temperature mode `rgb` is
/// cleared, in rgb/hsv mode `ct` is cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    #[serde(default)]
    pub power: Power,

    /// Brightness 1-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bright: Option<u8>,

    /// Colour temperature in kelvin, 1700-6500
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ct: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rgb: Option<[u8; 3]>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hue: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sat: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_mode: Option<ColorMode>,
}

impl DeviceState {
    /// Overlay the set fields of `patch`. Returns whether anything changed.
    pub fn apply(&mut self, patch: &StatePatch) -> bool {
        let before = self.clone();

        if let Some(power) = patch.power {
            self.power = power;
        }
        if let Some(bright) = patch.bright {
            self.bright = Some(bright);
        }
        if let Some(ct) = patch.ct {
            self.ct = Some(ct);
        }
        if let Some(rgb) = patch.rgb {
            self.rgb = Some(rgb.normalize());
        }
        if let Some(hue) = patch.hue {
            self.hue = Some(hue);
        }
        if let Some(sat) = patch.sat {
            self.sat = Some(sat);
        }
        if let Some(mode) = patch.color_mode {
            self.color_mode = Some(mode);
        }

        match self.color_mode {
            Some(ColorMode::Temperature) => self.rgb = None,
            Some(ColorMode::Rgb) | Some(ColorMode::Hsv) => self.ct = None,
            None => {}
        }

        *self != before
    }
}

/// Colour as reported or requested: either the fixture's packed
/// `0xRRGGBB` integer or an `[r, g, b]` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RgbValue {
    Packed(i64),
    Triple([i64; 3]),
}

impl RgbValue {
    /// Normalise to a triple with every channel clamped to 0-255
    pub fn normalize(self) -> [u8; 3] {
        match self {
            RgbValue::Packed(value) => {
                let value = value.clamp(0, 0xFF_FFFF);
                [
                    ((value >> 16) & 0xFF) as u8,
                    ((value >> 8) & 0xFF) as u8,
                    (value & 0xFF) as u8,
                ]
            }
            RgbValue::Triple(channels) => channels.map(|c| c.clamp(0, 255) as u8),
        }
    }
}

/// Partial state update; only `Some` fields overwrite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default)]
    pub power: Option<Power>,
    #[serde(default)]
    pub bright: Option<u8>,
    #[serde(default)]
    pub ct: Option<u16>,
    #[serde(default)]
    pub rgb: Option<RgbValue>,
    #[serde(default)]
    pub hue: Option<u16>,
    #[serde(default)]
    pub sat: Option<u8>,
    #[serde(default)]
    pub color_mode: Option<ColorMode>,
}

impl StatePatch {
    pub fn power(on: bool) -> Self {
        Self {
            power: Some(if on { Power::On } else { Power::Off }),
            ..Default::default()
        }
    }

    /// Build a patch from raw fixture properties.
    ///
    /// Fixtures report every value as a string and leave unsupported ones
    /// empty; anything that does not parse is left unset. The colour field
    /// that does not belong to the reported mode is dropped.
    pub fn from_properties(props: &HashMap<String, String>) -> Self {
        fn parse<T: std::str::FromStr>(props: &HashMap<String, String>, key: &str) -> Option<T> {
            props.get(key).and_then(|v| v.trim().parse().ok())
        }

        let mut patch = Self {
            power: props.get("power").and_then(|v| match v.trim() {
                "on" => Some(Power::On),
                "off" => Some(Power::Off),
                _ => None,
            }),
            bright: parse(props, "bright"),
            ct: parse(props, "ct"),
            rgb: parse::<i64>(props, "rgb").map(RgbValue::Packed),
            hue: parse(props, "hue"),
            sat: parse(props, "sat"),
            color_mode: parse::<u8>(props, "color_mode").and_then(|m| ColorMode::try_from(m).ok()),
        };

        match patch.color_mode {
            Some(ColorMode::Temperature) => patch.rgb = None,
            Some(ColorMode::Rgb) | Some(ColorMode::Hsv) => patch.ct = None,
            None => {}
        }

        patch
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
