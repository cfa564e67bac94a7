//! Progress reporting for environment deployment.
//!
//! Provides [`EnvProgressPhase`] events covering the lifecycle of a
//! deployment (cache check, venv creation, per-package installs, ready) and a
//! [`ProgressHandler`] trait that consumers implement to route events to
//! their output.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::packages::Registry;

/// Progress phases during environment deployment.
///
/// Serializable so consumers can forward them as JSON lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum EnvProgressPhase {
    /// Starting deployment.
    Starting { env_path: String },
    /// Reusing a previously completed environment.
    CacheHit { env_path: String },
    /// Creating the virtual environment (venv backend only).
    CreatingVenv { tool: String },
    /// Installing one package.
    InstallingPackage {
        name: String,
        registry: Registry,
        /// 1-based position in the install sequence.
        index: usize,
        total: usize,
    },
    /// Environment is ready.
    Ready {
        env_path: String,
        python_path: String,
    },
    /// An error occurred.
    Error { message: String },
}

/// Trait for receiving environment progress events.
pub trait ProgressHandler: Send + Sync {
    /// Called for each progress phase.
    ///
    /// `env_type` is `"conda"` or `"venv"`.
    fn on_progress(&self, env_type: &str, phase: EnvProgressPhase);
}

/// Log-only progress handler.
pub struct LogHandler;

impl ProgressHandler for LogHandler {
    fn on_progress(&self, env_type: &str, phase: EnvProgressPhase) {
        match &phase {
            EnvProgressPhase::Starting { env_path } => {
                log::info!("[{env_type}] Deploying environment at {env_path}");
            }
            EnvProgressPhase::CacheHit { env_path } => {
                log::info!("[{env_type}] Cache hit: {env_path}");
            }
            EnvProgressPhase::CreatingVenv { tool } => {
                log::info!("[{env_type}] Creating virtual environment with {tool}...");
            }
            EnvProgressPhase::InstallingPackage {
                name,
                registry,
                index,
                total,
            } => {
                log::info!("[{env_type}] Installing {name} from {registry} ({index}/{total})");
            }
            EnvProgressPhase::Ready {
                env_path,
                python_path,
            } => {
                log::info!("[{env_type}] Ready: env={env_path} python={python_path}");
            }
            EnvProgressPhase::Error { message } => {
                log::error!("[{env_type}] Error: {message}");
            }
        }
    }
}

/// Collects events in memory, mainly for tests and dry runs.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<(String, EnvProgressPhase)>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<(String, EnvProgressPhase)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProgressHandler for RecordingHandler {
    fn on_progress(&self, env_type: &str, phase: EnvProgressPhase) {
        if let Ok(mut events) = self.events.lock() {
            events.push((env_type.to_string(), phase));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serializes_with_tag() {
        let phase = EnvProgressPhase::InstallingPackage {
            name: "numpy".into(),
            registry: Registry::Conda,
            index: 2,
            total: 5,
        };
        let json = serde_json::to_value(&phase).unwrap();
        assert_eq!(json["phase"], "installing_package");
        assert_eq!(json["registry"], "conda");
        assert_eq!(json["index"], 2);
    }

    #[test]
    fn test_recording_handler_keeps_order() {
        let handler = RecordingHandler::default();
        handler.on_progress("venv", EnvProgressPhase::CreatingVenv { tool: "uv".into() });
        handler.on_progress(
            "venv",
            EnvProgressPhase::Error {
                message: "boom".into(),
            },
        );
        let events = handler.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "venv");
        assert!(matches!(events[1].1, EnvProgressPhase::Error { .. }));
    }
}
