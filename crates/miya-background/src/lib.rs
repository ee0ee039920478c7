pub mod admission;
pub mod completion;
pub mod config;
pub mod delegation;
pub mod error;
pub mod event_bus;
pub mod fallback;
pub mod manager;
pub mod platform;
pub mod registry;

pub use admission::AdmissionController;
pub use completion::{extract_result, parent_notice, NO_OUTPUT};
pub use config::{
    AgentOverride, BackgroundConfig, ConfigLoader, FallbackConfig, PluginConfig,
    DEFAULT_FALLBACK_TIMEOUT_MS,
};
pub use delegation::*;
pub use error::{BackgroundError, Result};
pub use event_bus::*;
pub use fallback::{
    AttemptFailure, FallbackError, FallbackExecutor, FallbackSuccess, DEFAULT_MODEL_LABEL,
};
pub use manager::{BackgroundTaskManager, ManagerOptions, TaskHandle, CREATE_SESSION_FAILED};
pub use platform::SessionPlatform;
pub use registry::{SessionBindings, TaskOutcome, TaskRegistry};

pub use miya_types;
