use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::fixture::Command;

/// One step of a scene, e.g.
/// `{"target": "tv", "cmd": "set_brightness", "args": 20, "sleep_ms": 500}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneStep {
    pub target: String,

    #[serde(flatten)]
    pub command: Command,

    /// Pause after this step
    #[serde(default, alias = "sleep", skip_serializing_if = "is_zero")]
    pub sleep_ms: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Scene name to its steps, as stored in `scenes.json`
pub type Scenes = BTreeMap<String, Vec<SceneStep>>;

/// Build scenes from the raw document, one step at a time.
///
/// A step that does not parse is logged and dropped; the rest of its scene
/// is kept. A scene that is not a list is dropped whole.
pub fn parse_scenes(document: BTreeMap<String, Value>) -> Scenes {
    let mut scenes = Scenes::new();
    for (name, steps) in document {
        let Value::Array(steps) = steps else {
            warn!("Scene {} is not a list of steps, ignoring it", name);
            continue;
        };

        let steps = steps
            .into_iter()
            .enumerate()
            .filter_map(|(i, step)| match SceneStep::deserialize(&step) {
                Ok(step) => Some(step),
                Err(e) => {
                    warn!("Skipping step {} of scene {}: {}", i, name, e);
                    None
                }
            })
            .collect();
        scenes.insert(name, steps);
    }
    scenes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_document() {
        let scenes: Scenes = serde_json::from_str(
            r#"{
                "movie": [
                    {"target": "tv", "cmd": "set_brightness", "args": 20},
                    {"target": "tv", "cmd": "set_color_temp", "args": 2700, "sleep": 500},
                    {"target": "hall", "cmd": "set_power", "args": false}
                ]
            }"#,
        )
        .unwrap();

        let movie = &scenes["movie"];
        assert_eq!(movie.len(), 3);
        assert_eq!(movie[0].command, Command::SetBrightness(20));
        assert_eq!(movie[0].sleep_ms, 0);
        assert_eq!(movie[1].sleep_ms, 500);
        assert_eq!(movie[2].target, "hall");
        assert_eq!(movie[2].command, Command::SetPower(false));
    }

    #[test]
    fn test_fixture_method_scene_document() {
        let document = serde_json::from_value(serde_json::json!({
            "movie": [
                {"target": "tv", "cmd": "set_bright", "args": [20]},
                {"target": "tv", "cmd": "set_ct_abx", "args": [2700, "smooth", 500]}
            ]
        }))
        .unwrap();

        let scenes = parse_scenes(document);
        assert_eq!(
            scenes["movie"],
            vec![
                SceneStep {
                    target: "tv".to_string(),
                    command: Command::SetBrightness(20),
                    sleep_ms: 0,
                },
                SceneStep {
                    target: "tv".to_string(),
                    command: Command::SetColorTemp(2700),
                    sleep_ms: 0,
                },
            ]
        );
    }

    #[test]
    fn test_bad_steps_are_dropped() {
        let document = serde_json::from_value(serde_json::json!({
            "party": [
                {"target": "tv", "cmd": "set_hsv", "args": [120, 100]},
                {"cmd": "toggle"},
                {"target": "tv", "cmd": "toggle", "sleep": 250}
            ],
            "broken": {"target": "tv"}
        }))
        .unwrap();

        let scenes = parse_scenes(document);
        assert_eq!(scenes.len(), 1);
        assert_eq!(
            scenes["party"],
            vec![SceneStep {
                target: "tv".to_string(),
                command: Command::Toggle,
                sleep_ms: 250,
            }]
        );
    }

    #[test]
    fn test_step_serialization() {
        let step = SceneStep {
            target: "desk".to_string(),
            command: Command::Toggle,
            sleep_ms: 0,
        };
        assert_eq!(
            serde_json::to_value(&step).unwrap(),
            serde_json::json!({"target": "desk", "cmd": "toggle"})
        );
    }
}
