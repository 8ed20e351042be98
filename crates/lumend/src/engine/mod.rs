mod engine;
mod scene;

use crate::dispatch::UnknownTarget;
use crate::routine::RoutineError;
use crate::store::StoreError;

pub use engine::Collaborators;
pub use engine::Engine;
pub use engine::EngineSettings;
pub use engine::GroupPower;
pub use engine::StateReport;
pub use scene::SceneStep;
pub use scene::Scenes;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    UnknownTarget(#[from] UnknownTarget),

    #[error("unknown scene {0}")]
    UnknownScene(String),

    #[error(transparent)]
    Routine(#[from] RoutineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
