//! Engine error types.

use thiserror::Error;

use crate::engine::SlotState;
use crate::hal::GpuError;

/// Errors surfaced by the compute engine, transfer queue and presenters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// No adapter offers every capability the pipeline needs.
    #[error("no capable device: missing {}", missing.join(", "))]
    NoCapableDevice {
        /// Names of the absent capabilities.
        missing: Vec<&'static str>,
    },

    /// A compute program failed to build.
    #[error("failed to create {program} program: {reason}")]
    ProgramCreation {
        program: &'static str,
        reason: String,
    },

    /// Transfer destination is not a queue family of this device.
    #[error("queue family {0} is not exposed by the device")]
    UnsupportedQueueFamily(u32),

    /// Scene groups, counts or transform indices disagree.
    #[error("invalid scene: {0}")]
    InvalidScene(String),

    #[error("frame slot cannot move from {from:?} to {to:?}")]
    InvalidSlotTransition { from: SlotState, to: SlotState },

    /// The presentation object was dropped while the engine still used it.
    #[error("presentation layer is gone")]
    PresentationGone,

    #[error("presentation layer does not support on-screen output")]
    PresentationUnsupported,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Gpu(#[from] GpuError),
}

pub type EngineResult<T> = Result<T, EngineError>;
