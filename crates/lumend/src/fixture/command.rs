use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_json::Value;

use super::Fixture;
use super::FixtureError;
use crate::state::ColorMode;
use crate::state::DeviceState;
use crate::state::Power;
use crate::state::RgbValue;
use crate::state::StatePatch;

pub const MIN_BRIGHTNESS: u8 = 1;
pub const MAX_BRIGHTNESS: u8 = 100;
pub const MIN_KELVIN: u16 = 1700;
pub const MAX_KELVIN: u16 = 6500;

/// Everything the daemon can ask a fixture to do.
///
/// Scenes store commands as `{"cmd": "set_brightness", "args": 20}`. Reading
/// also accepts the fixture's own method names (`set_bright`, `set_ct_abx`,
/// `turn_on`, ...) with `args` as a list; trailing effect parameters such as
/// `"smooth", 500` are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, strum::IntoStaticStr)]
#[serde(tag = "cmd", content = "args", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Command {
    SetPower(bool),
    SetBrightness(u8),
    SetColorTemp(u16),
    SetRgb(u8, u8, u8),
    Toggle,
    Pulse,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseCommandError {
    #[error("unknown command {0}")]
    Unknown(String),

    #[error("bad arguments for {cmd}: {args}")]
    BadArgs { cmd: String, args: Value },
}

/// A command as written in a document, before validation
#[derive(Debug, Deserialize)]
struct RawCommand {
    cmd: String,
    #[serde(default)]
    args: Value,
}

/// Positional argument `index`; a bare scalar counts as a one-element list.
fn arg(args: &Value, index: usize) -> Option<&Value> {
    match args {
        Value::Array(items) => items.get(index),
        Value::Null => None,
        scalar if index == 0 => Some(scalar),
        _ => None,
    }
}

fn int_arg(args: &Value, index: usize) -> Option<i64> {
    let value = arg(args, index)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
}

fn power_arg(args: &Value) -> Option<bool> {
    match arg(args, 0)? {
        Value::Bool(on) => Some(*on),
        Value::String(word) => match word.as_str() {
            "on" => Some(true),
            "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

impl TryFrom<RawCommand> for Command {
    type Error = ParseCommandError;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        let RawCommand { cmd, args } = raw;
        let command = match cmd.as_str() {
            "set_power" => power_arg(&args).map(Command::SetPower),
            "turn_on" => Some(Command::SetPower(true)),
            "turn_off" => Some(Command::SetPower(false)),
            "set_brightness" | "set_bright" => int_arg(&args, 0).map(Command::brightness),
            "set_color_temp" | "set_ct_abx" => int_arg(&args, 0).map(Command::color_temp),
            "set_rgb" => match (int_arg(&args, 0), int_arg(&args, 1), int_arg(&args, 2)) {
                (Some(r), Some(g), Some(b)) => Some(Command::rgb(r, g, b)),
                _ => None,
            },
            "toggle" => Some(Command::Toggle),
            "pulse" => Some(Command::Pulse),
            _ => return Err(ParseCommandError::Unknown(cmd.clone())),
        };
        command.ok_or(ParseCommandError::BadArgs { cmd, args })
    }
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawCommand::deserialize(deserializer)?;
        Command::try_from(raw).map_err(serde::de::Error::custom)
    }
}

impl Command {
    /// Brightness from user input, clamped to 1-100
    pub fn brightness(level: i64) -> Self {
        Command::SetBrightness(level.clamp(MIN_BRIGHTNESS.into(), MAX_BRIGHTNESS.into()) as u8)
    }

    /// Colour temperature from user input, clamped to 1700-6500 K
    pub fn color_temp(kelvin: i64) -> Self {
        Command::SetColorTemp(kelvin.clamp(MIN_KELVIN.into(), MAX_KELVIN.into()) as u16)
    }

    /// Colour from user input, each channel clamped to 0-255
    pub fn rgb(r: i64, g: i64, b: i64) -> Self {
        let [r, g, b] = RgbValue::Triple([r, g, b]).normalize();
        Command::SetRgb(r, g, b)
    }

    /// Pull stored values back into range (scenes are hand-edited JSON)
    pub fn clamped(self) -> Self {
        match self {
            Command::SetBrightness(level) => Command::brightness(level.into()),
            Command::SetColorTemp(kelvin) => Command::color_temp(kelvin.into()),
            other => other,
        }
    }

    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn is_power_off(&self) -> bool {
        matches!(self, Command::SetPower(false))
    }

    /// Send this command to a fixture
    pub async fn execute(&self, fixture: &mut dyn Fixture) -> Result<(), FixtureError> {
        match *self {
            Command::SetPower(on) => fixture.set_power(on).await,
            Command::SetBrightness(level) => fixture.set_brightness(level).await,
            Command::SetColorTemp(kelvin) => fixture.set_color_temp(kelvin).await,
            Command::SetRgb(r, g, b) => fixture.set_rgb(r, g, b).await,
            Command::Toggle => fixture.toggle().await,
            Command::Pulse => fixture.start_flow(&Flow::pulse()).await,
        }
    }

    /// State change implied by a successful command.
    ///
    /// `previous` is only consulted for `Toggle`, which can only be recorded
    /// when the old power state is known.
    pub fn state_patch(&self, previous: Option<&DeviceState>) -> StatePatch {
        match *self {
            Command::SetPower(on) => StatePatch::power(on),
            Command::SetBrightness(level) => StatePatch {
                bright: Some(level),
                ..Default::default()
            },
            Command::SetColorTemp(kelvin) => StatePatch {
                ct: Some(kelvin),
                color_mode: Some(ColorMode::Temperature),
                ..Default::default()
            },
            Command::SetRgb(r, g, b) => StatePatch {
                rgb: Some(RgbValue::Triple([r.into(), g.into(), b.into()])),
                color_mode: Some(ColorMode::Rgb),
                ..Default::default()
            },
            Command::Toggle => match previous.map(|state| state.power) {
                Some(Power::On) => StatePatch::power(false),
                Some(Power::Off) => StatePatch::power(true),
                _ => StatePatch::default(),
            },
            Command::Pulse => StatePatch::default(),
        }
    }
}

/// One step of a colour flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Rgb { r: u8, g: u8, b: u8, duration_ms: u32 },
    Sleep { duration_ms: u32 },
}

/// A looping sequence of transitions run on the fixture itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    /// Number of times the whole sequence repeats
    pub count: u32,
    pub transitions: Vec<Transition>,
}

impl Flow {
    /// Red/blue alert pulse, three rounds
    pub fn pulse() -> Self {
        Self {
            count: 3,
            transitions: vec![
                Transition::Rgb { r: 255, g: 0, b: 0, duration_ms: 500 },
                Transition::Sleep { duration_ms: 200 },
                Transition::Rgb { r: 0, g: 0, b: 255, duration_ms: 500 },
                Transition::Sleep { duration_ms: 200 },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_clamp() {
        assert_eq!(Command::brightness(0), Command::SetBrightness(1));
        assert_eq!(Command::brightness(250), Command::SetBrightness(100));
        assert_eq!(Command::color_temp(1000), Command::SetColorTemp(1700));
        assert_eq!(Command::color_temp(9000), Command::SetColorTemp(6500));
        assert_eq!(Command::rgb(300, -4, 12), Command::SetRgb(255, 0, 12));
        assert_eq!(Command::SetBrightness(200).clamped(), Command::SetBrightness(100));
    }

    #[test]
    fn test_scene_step_format() {
        let cmd: Command = serde_json::from_str(r#"{"cmd": "set_brightness", "args": 20}"#).unwrap();
        assert_eq!(cmd, Command::SetBrightness(20));

        let cmd: Command = serde_json::from_str(r#"{"cmd": "set_rgb", "args": [255, 0, 0]}"#).unwrap();
        assert_eq!(cmd, Command::SetRgb(255, 0, 0));

        let cmd: Command = serde_json::from_str(r#"{"cmd": "toggle"}"#).unwrap();
        assert_eq!(cmd, Command::Toggle);

        assert!(serde_json::from_str::<Command>(r#"{"cmd": "self_destruct"}"#).is_err());
    }

    #[test]
    fn test_fixture_method_names() {
        let cmd: Command = serde_json::from_str(r#"{"cmd": "set_bright", "args": [20]}"#).unwrap();
        assert_eq!(cmd, Command::SetBrightness(20));

        let cmd: Command =
            serde_json::from_str(r#"{"cmd": "set_ct_abx", "args": [2700, "smooth", 500]}"#)
                .unwrap();
        assert_eq!(cmd, Command::SetColorTemp(2700));

        let cmd: Command = serde_json::from_str(r#"{"cmd": "turn_off"}"#).unwrap();
        assert_eq!(cmd, Command::SetPower(false));

        let cmd: Command = serde_json::from_str(r#"{"cmd": "set_power", "args": ["on"]}"#).unwrap();
        assert_eq!(cmd, Command::SetPower(true));

        let cmd: Command = serde_json::from_str(r#"{"cmd": "set_bright", "args": [400]}"#).unwrap();
        assert_eq!(cmd, Command::SetBrightness(100));
    }

    #[test]
    fn test_bad_arguments_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"cmd": "set_bright"}"#).is_err());
        assert!(serde_json::from_str::<Command>(r#"{"cmd": "set_rgb", "args": [1, 2]}"#).is_err());
        assert!(
            serde_json::from_str::<Command>(r#"{"cmd": "set_power", "args": "dim"}"#).is_err()
        );
    }

    #[test]
    fn test_serialized_form_reads_back() {
        let value = serde_json::to_value(Command::SetRgb(1, 2, 3)).unwrap();
        assert_eq!(value, serde_json::json!({"cmd": "set_rgb", "args": [1, 2, 3]}));
        assert_eq!(
            serde_json::from_value::<Command>(value).unwrap(),
            Command::SetRgb(1, 2, 3)
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(Command::SetColorTemp(2700).name(), "set_color_temp");
        assert_eq!(Command::Pulse.name(), "pulse");
    }

    #[test]
    fn test_toggle_patch_needs_known_power() {
        let on = DeviceState {
            power: Power::On,
            ..Default::default()
        };
        assert_eq!(Command::Toggle.state_patch(Some(&on)), StatePatch::power(false));
        assert!(Command::Toggle.state_patch(None).is_empty());
    }
}
