//! Presence automation: turn the lights on when a phone shows up.

mod monitor;

use chrono::DateTime;
use chrono::Local;
use chrono::NaiveTime;
use chrono::Timelike;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;

pub use monitor::MonitorHandle;
pub use monitor::PresenceMonitor;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresenceError {
    #[error("invalid time window {start:?}-{end:?}")]
    InvalidTimeWindow { start: String, end: String },

    #[error("no device_name configured")]
    MissingDeviceName,

    #[error("trigger failed: {0}")]
    Trigger(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub enabled: bool,

    /// Host name or address probed for presence
    pub device_name: Option<String>,

    /// Window start, `HH:MM`
    pub start_time: String,

    /// Window end, `HH:MM`; earlier than `start_time` wraps past midnight
    pub end_time: String,

    pub target: String,

    /// Routine started on arrival; lights are just switched on without one
    pub routine: Option<String>,

    pub poll_interval_sec: u64,
    pub cooldown_sec: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device_name: None,
            start_time: "18:00".to_string(),
            end_time: "02:00".to_string(),
            target: crate::registry::ALL_TARGET.to_string(),
            routine: Some("welcome".to_string()),
            poll_interval_sec: 30,
            cooldown_sec: 300,
        }
    }
}

impl PresenceConfig {
    pub fn window(&self) -> Result<TimeWindow, PresenceError> {
        TimeWindow::parse(&self.start_time, &self.end_time)
    }

    /// The probed host, if one is configured
    pub fn device(&self) -> Option<&str> {
        self.device_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

/// Partial update of [`PresenceConfig`]; only supplied fields change.
///
/// `device_name` and `routine` can be cleared with an explicit `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PresenceUpdate {
    pub enabled: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    pub device_name: Option<Option<String>>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub target: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub routine: Option<Option<String>>,
    pub poll_interval_sec: Option<u64>,
    pub cooldown_sec: Option<u64>,
}

/// A supplied field, `null` included; absent fields fall to `default`
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl PresenceUpdate {
    pub fn apply_to(self, config: &mut PresenceConfig) {
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(device_name) = self.device_name {
            config.device_name = device_name;
        }
        if let Some(start_time) = self.start_time {
            config.start_time = start_time;
        }
        if let Some(end_time) = self.end_time {
            config.end_time = end_time;
        }
        if let Some(target) = self.target {
            config.target = target;
        }
        if let Some(routine) = self.routine {
            config.routine = routine;
        }
        if let Some(poll_interval_sec) = self.poll_interval_sec {
            config.poll_interval_sec = poll_interval_sec;
        }
        if let Some(cooldown_sec) = self.cooldown_sec {
            config.cooldown_sec = cooldown_sec;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceStatus {
    pub present: bool,
    pub last_seen: Option<DateTime<Local>>,
    pub last_trigger: Option<DateTime<Local>>,
    pub last_error: Option<String>,
}

/// Daily `[start, end)` window in minutes since midnight.
///
/// Wraps past midnight when `start > end`; `start == end` covers the whole
/// day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: u32,
    end: u32,
}

impl TimeWindow {
    pub fn parse(start: &str, end: &str) -> Result<Self, PresenceError> {
        match (minute_of_day(start), minute_of_day(end)) {
            (Some(start), Some(end)) => Ok(Self { start, end }),
            _ => Err(PresenceError::InvalidTimeWindow {
                start: start.to_string(),
                end: end.to_string(),
            }),
        }
    }

    pub fn contains(&self, minute: u32) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= minute && minute < self.end
        } else {
            minute >= self.start || minute < self.end
        }
    }

    pub fn contains_time(&self, time: NaiveTime) -> bool {
        self.contains(time.hour() * 60 + time.minute())
    }
}

fn minute_of_day(text: &str) -> Option<u32> {
    let time = NaiveTime::parse_from_str(text.trim(), "%H:%M").ok()?;
    Some(time.hour() * 60 + time.minute())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(text: &str) -> NaiveTime {
        NaiveTime::parse_from_str(text, "%H:%M").unwrap()
    }

    #[test]
    fn test_window_wraps_midnight() {
        let window = TimeWindow::parse("19:00", "06:00").unwrap();
        assert!(window.contains_time(time("23:30")));
        assert!(window.contains_time(time("02:00")));
        assert!(window.contains_time(time("19:00")));
        assert!(!window.contains_time(time("06:00")));
        assert!(!window.contains_time(time("12:00")));
    }

    #[test]
    fn test_window_same_day() {
        let window = TimeWindow::parse("08:00", "17:30").unwrap();
        assert!(window.contains_time(time("08:00")));
        assert!(window.contains_time(time("17:29")));
        assert!(!window.contains_time(time("17:30")));
        assert!(!window.contains_time(time("23:00")));
    }

    #[test]
    fn test_equal_bounds_cover_whole_day() {
        let window = TimeWindow::parse("07:00", "07:00").unwrap();
        assert!(window.contains_time(time("00:00")));
        assert!(window.contains_time(time("06:59")));
        assert!(window.contains_time(time("23:59")));
    }

    #[test]
    fn test_invalid_window() {
        assert_eq!(
            TimeWindow::parse("25:00", "06:00"),
            Err(PresenceError::InvalidTimeWindow {
                start: "25:00".to_string(),
                end: "06:00".to_string(),
            })
        );
        assert!(TimeWindow::parse("evening", "06:00").is_err());
    }

    #[test]
    fn test_partial_update() {
        let mut config = PresenceConfig::default();
        let update: PresenceUpdate =
            serde_json::from_str(r#"{"enabled": true, "device_name": "phone.lan"}"#).unwrap();
        update.apply_to(&mut config);

        assert!(config.enabled);
        assert_eq!(config.device(), Some("phone.lan"));
        assert_eq!(config.start_time, "18:00");
        assert_eq!(config.routine.as_deref(), Some("welcome"));
        assert_eq!(config.cooldown_sec, 300);
    }

    #[test]
    fn test_null_clears_optional_fields() {
        let mut config = PresenceConfig {
            device_name: Some("phone.lan".to_string()),
            ..Default::default()
        };

        let update: PresenceUpdate = serde_json::from_str(r#"{"routine": null}"#).unwrap();
        assert_eq!(update.routine, Some(None));
        update.apply_to(&mut config);
        assert_eq!(config.routine, None);
        assert_eq!(config.device(), Some("phone.lan"));

        let update: PresenceUpdate = serde_json::from_str(r#"{"device_name": null}"#).unwrap();
        update.apply_to(&mut config);
        assert_eq!(config.device(), None);
        assert_eq!(config.routine, None);
    }

    #[test]
    fn test_blank_device_name_is_missing() {
        let config = PresenceConfig {
            device_name: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(config.device(), None);
    }
}
