//! A minimal typed configuration registry.
//!
//! The core treats configuration as a narrow external collaborator: a
//! typed value lookup keyed by dotted name. This is modeled on sylar's
//! `ConfigVar<T>` / `Config::Lookup<T>` (a YAML-backed registry with a
//! default value and a docstring per entry), scaled down to the one
//! value the core actually reads (`fiber.stack_size`) plus the
//! machinery to register more. No YAML parser ships here: the core
//! never reads a config *file*, only typed values, and applications
//! that want YAML-backed config can populate this registry themselves
//! at startup.
use std::any::Any;
use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;

/// Default stack size for fibers that don't request one explicitly, in
/// bytes. Matches sylar's `Config::Lookup<uint32_t>("fiber.stack_size",
/// 1024 * 1024, ...)`.
pub const DEFAULT_FIBER_STACK_SIZE: u32 = 1024 * 1024;

static REGISTRY: Lazy<RwLock<HashMap<&'static str, Box<dyn Any + Send + Sync>>>> =
    Lazy::new(|| {
        let mut map = HashMap::new();
        map.insert(
            "fiber.stack_size",
            Box::new(DEFAULT_FIBER_STACK_SIZE) as Box<dyn Any + Send + Sync>,
        );
        RwLock::new(map)
    });

/// Looks up a typed config value by its dotted name, falling back to
/// `default` if the name was never registered or was registered with a
/// different type.
pub fn get<T: Clone + Send + Sync + 'static>(name: &str, default: T) -> T {
    REGISTRY
        .read()
        .unwrap()
        .get(name)
        .and_then(|v| v.downcast_ref::<T>())
        .cloned()
        .unwrap_or(default)
}

/// Overrides a config value. Applications call this at startup before
/// spawning fibers/schedulers; the core itself never writes to the
/// registry.
pub fn set<T: Send + Sync + 'static>(name: &'static str, value: T) {
    REGISTRY
        .write()
        .unwrap()
        .insert(name, Box::new(value) as Box<dyn Any + Send + Sync>);
}

/// Convenience accessor for the one value the core reads directly.
pub fn fiber_stack_size() -> u32 {
    get("fiber.stack_size", DEFAULT_FIBER_STACK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stack_size() {
        assert_eq!(get("fiber.stack_size", 0u32), DEFAULT_FIBER_STACK_SIZE);
    }

    #[test]
    fn unregistered_name_falls_back() {
        assert_eq!(get::<u32>("does.not.exist", 42), 42);
    }
}
