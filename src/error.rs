//! Renderer error types and the fatal-error policy.
//!
//! Every failure surfaced by the renderer is unrecoverable for the frame that
//! produced it. The library reports them as [`RenderError`] values; an
//! application terminates through [`fatal`] or [`OrFatal::or_fatal`].

use thiserror::Error;

use crate::backend::BackendError;

/// Errors produced by the renderer core.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Invalid renderer configuration: {0}")]
    InvalidConfig(String),
    #[error("Draw command capacity of {capacity} exceeded")]
    DrawCommandCapacityExceeded { capacity: usize },
    #[error("Descriptor table exhausted: {requested} slots requested, {available} of {capacity} left")]
    DescriptorCapacityExceeded {
        requested: u32,
        available: u32,
        capacity: u32,
    },
    #[error("Barrier batch of {capacity} transitions is full")]
    BarrierBatchFull { capacity: usize },
    #[error("Texture handle {0} does not name a live texture")]
    InvalidTexture(String),
    #[error("Pixel data for {name} is {actual} bytes, expected {expected}")]
    PixelDataSizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("No frame is being recorded")]
    FrameNotRecording,
    #[error("Frame {0} is already being recorded")]
    FrameAlreadyRecording(usize),
    #[error("Frame handle {serial} is stale, frame {current} is recording")]
    StaleFrameHandle { serial: u64, current: u64 },
    #[error("Failed to load shader {name}: {reason}")]
    ShaderLoad { name: String, reason: String },
}

pub type RenderResult<T> = Result<T, RenderError>;

/// Log `error` with `context` and terminate the process.
///
/// Termination goes through [`std::process::abort`], so an attached debugger
/// stops on the resulting `SIGABRT` (or the fail-fast exception on Windows)
/// with this frame on the stack.
pub fn fatal(context: &str, error: &RenderError) -> ! {
    log::error!("Fatal renderer error in {context}: {error}");
    std::process::abort()
}

/// Converts renderer results into the fatal policy at application level.
pub trait OrFatal<T> {
    fn or_fatal(self, context: &str) -> T;
}

impl<T> OrFatal<T> for RenderResult<T> {
    fn or_fatal(self, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(error) => fatal(context, &error),
        }
    }
}
