//! Backend abstraction layer
//!
//! Provides the device trait and shared types the software and Vulkan
//! backends implement.

pub mod software;
pub mod traits;
pub mod types;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub use traits::*;
pub use types::*;
