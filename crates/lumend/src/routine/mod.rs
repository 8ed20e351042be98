//! Timed brightness/colour-temperature transitions ("routines").

mod scheduler;

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::dispatch::UnknownTarget;
use crate::fixture::command::MAX_BRIGHTNESS;
use crate::fixture::command::MAX_KELVIN;
use crate::fixture::command::MIN_BRIGHTNESS;
use crate::fixture::command::MIN_KELVIN;
use crate::registry::ALL_TARGET;
use crate::store::StoreError;

pub use scheduler::RoutineScheduler;
pub use scheduler::RoutineStatus;
pub use scheduler::SchedulerSettings;

/// Shortest run, in steps
const MIN_STEPS: u32 = 60;

#[derive(Debug, thiserror::Error)]
pub enum RoutineError {
    #[error("unknown routine {0}")]
    UnknownRoutine(String),

    #[error("routine {running} is already running")]
    Busy { running: String },

    #[error(transparent)]
    UnknownTarget(#[from] UnknownTarget),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A transition from one brightness/colour temperature to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineDefinition {
    /// Device, group or `all`
    pub target: String,
    pub duration_min: u32,
    pub start_bright: u8,
    pub end_bright: u8,
    pub start_ct: u16,
    pub end_ct: u16,
}

impl RoutineDefinition {
    fn builtin(name: &str) -> Option<Self> {
        let (duration_min, start_bright, end_bright, start_ct, end_ct) = match name {
            "sunrise" => (20, 1, 100, 1700, 5000),
            "sunset" => (30, 100, 1, 4000, 1700),
            "welcome" => (1, 20, 100, 2700, 4000),
            _ => return None,
        };
        Some(Self {
            target: ALL_TARGET.to_string(),
            duration_min,
            start_bright,
            end_bright,
            start_ct,
            end_ct,
        })
    }

    fn merged(mut self, over: &RoutineOverride) -> Self {
        if let Some(target) = &over.target {
            self.target = target.clone();
        }
        if let Some(duration_min) = over.duration_min {
            self.duration_min = duration_min;
        }
        if let Some(start_bright) = over.start_bright {
            self.start_bright = start_bright;
        }
        if let Some(end_bright) = over.end_bright {
            self.end_bright = end_bright;
        }
        if let Some(start_ct) = over.start_ct {
            self.start_ct = start_ct;
        }
        if let Some(end_ct) = over.end_ct {
            self.end_ct = end_ct;
        }
        self
    }
}

/// User changes to a built-in routine; unset fields keep the default
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_bright: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_bright: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ct: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ct: Option<u16>,
}

impl RoutineOverride {
    /// Lay `patch` over `self`, keeping fields `patch` leaves unset
    fn merge(&mut self, patch: RoutineOverride) {
        if patch.target.is_some() {
            self.target = patch.target;
        }
        if patch.duration_min.is_some() {
            self.duration_min = patch.duration_min;
        }
        if patch.start_bright.is_some() {
            self.start_bright = patch.start_bright;
        }
        if patch.end_bright.is_some() {
            self.end_bright = patch.end_bright;
        }
        if patch.start_ct.is_some() {
            self.start_ct = patch.start_ct;
        }
        if patch.end_ct.is_some() {
            self.end_ct = patch.end_ct;
        }
    }
}

/// Built-in routines plus the persisted overrides
#[derive(Debug, Clone, Default)]
pub struct RoutineBook {
    overrides: BTreeMap<String, RoutineOverride>,
}

impl RoutineBook {
    pub const NAMES: &'static [&'static str] = &["sunrise", "sunset", "welcome"];

    pub fn new(overrides: BTreeMap<String, RoutineOverride>) -> Self {
        Self { overrides }
    }

    pub fn overrides(&self) -> &BTreeMap<String, RoutineOverride> {
        &self.overrides
    }

    pub fn get(&self, name: &str) -> Option<RoutineDefinition> {
        let builtin = RoutineDefinition::builtin(name)?;
        Some(match self.overrides.get(name) {
            Some(over) => builtin.merged(over),
            None => builtin,
        })
    }

    pub fn all(&self) -> BTreeMap<String, RoutineDefinition> {
        Self::NAMES
            .iter()
            .filter_map(|name| Some((name.to_string(), self.get(name)?)))
            .collect()
    }

    pub fn configure(
        &mut self,
        name: &str,
        patch: RoutineOverride,
    ) -> Result<RoutineDefinition, RoutineError> {
        if RoutineDefinition::builtin(name).is_none() {
            return Err(RoutineError::UnknownRoutine(name.to_string()));
        }
        self.overrides
            .entry(name.to_string())
            .or_default()
            .merge(patch);
        self.get(name)
            .ok_or_else(|| RoutineError::UnknownRoutine(name.to_string()))
    }
}

/// Values sent to every target device in one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub bright: u8,
    pub ct: u16,
}

/// Linear interpolation of a routine, one frame per step
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    steps: u32,
    bright: (f64, f64),
    ct: (f64, f64),
}

impl TransitionPlan {
    pub fn new(definition: &RoutineDefinition) -> Self {
        let clamp_bright = |b: u8| f64::from(b.clamp(MIN_BRIGHTNESS, MAX_BRIGHTNESS));
        let clamp_ct = |k: u16| f64::from(k.clamp(MIN_KELVIN, MAX_KELVIN));

        Self {
            steps: definition.duration_min.saturating_mul(60).max(MIN_STEPS),
            bright: (
                clamp_bright(definition.start_bright),
                clamp_bright(definition.end_bright),
            ),
            ct: (clamp_ct(definition.start_ct), clamp_ct(definition.end_ct)),
        }
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn frame(&self, step: u32) -> Frame {
        let t = if self.steps <= 1 {
            1.0
        } else {
            f64::from(step.min(self.steps - 1)) / f64::from(self.steps - 1)
        };
        let lerp = |(start, end): (f64, f64)| (start + (end - start) * t).round();

        Frame {
            bright: lerp(self.bright) as u8,
            ct: lerp(self.ct) as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let book = RoutineBook::default();
        let sunrise = book.get("sunrise").unwrap();
        assert_eq!(sunrise.target, "all");
        assert_eq!(sunrise.duration_min, 20);
        assert_eq!((sunrise.start_ct, sunrise.end_ct), (1700, 5000));
        assert!(book.get("disco").is_none());
        assert_eq!(book.all().len(), 3);
    }

    #[test]
    fn test_overrides_merge_field_by_field() {
        let mut book = RoutineBook::default();
        book.configure(
            "sunset",
            RoutineOverride {
                duration_min: Some(10),
                ..Default::default()
            },
        )
        .unwrap();
        let sunset = book
            .configure(
                "sunset",
                RoutineOverride {
                    target: Some("bedroom".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(sunset.target, "bedroom");
        assert_eq!(sunset.duration_min, 10);
        assert_eq!(sunset.start_bright, 100);
        assert_eq!(sunset.end_ct, 1700);
    }

    #[test]
    fn test_configure_unknown_routine() {
        let mut book = RoutineBook::default();
        let err = book
            .configure("disco", RoutineOverride::default())
            .unwrap_err();
        assert!(matches!(err, RoutineError::UnknownRoutine(name) if name == "disco"));
        assert!(book.overrides().is_empty());
    }

    #[test]
    fn test_brightness_ramp_is_monotonic() {
        let plan = TransitionPlan::new(&RoutineDefinition {
            target: "all".to_string(),
            duration_min: 2,
            start_bright: 20,
            end_bright: 100,
            start_ct: 2700,
            end_ct: 4000,
        });

        assert_eq!(plan.steps(), 120);
        let frames: Vec<Frame> = (0..plan.steps()).map(|i| plan.frame(i)).collect();
        assert_eq!(frames[0], Frame { bright: 20, ct: 2700 });
        assert_eq!(frames[119], Frame { bright: 100, ct: 4000 });
        assert!(frames.windows(2).all(|w| w[0].bright <= w[1].bright));
        assert!(frames.windows(2).all(|w| w[0].ct <= w[1].ct));
    }

    #[test]
    fn test_plan_clamps_bounds_and_minimum_length() {
        let plan = TransitionPlan::new(&RoutineDefinition {
            target: "all".to_string(),
            duration_min: 0,
            start_bright: 0,
            end_bright: 200,
            start_ct: 1000,
            end_ct: 9000,
        });

        assert_eq!(plan.steps(), 60);
        assert_eq!(plan.frame(0), Frame { bright: 1, ct: 1700 });
        assert_eq!(plan.frame(59), Frame { bright: 100, ct: 6500 });
    }
}
