//! Job handlers shipped with the `autoflow` binary.
//!
//! `fork` is registered by the runtime itself.

pub mod determine_renditions;

use autoflow_core::queue::registry::JobRegistry;

/// Registry holding every built-in handler.
pub fn builtin_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register(
        determine_renditions::BINDING,
        determine_renditions::DetermineRenditionsJob,
    );
    registry
}
