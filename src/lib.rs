//! Cobalt - an embedding host for a V8-backed JavaScript engine.
//!
//! This crate wraps `v8` with the Runtime-Context-App hierarchy, a module
//! loader and resolver, a cooperative task-scheduling platform, and a code
//! cache, so an embedding application can run ES modules without touching
//! the VM's raw API directly.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod app;
pub mod assets;
pub mod code_cache;
pub mod context;
pub mod module_loader;
pub mod platform;
pub mod runtime;
pub mod threading;
pub mod time;

pub use app::{App, AppConfig, AppError};
pub use context::{Context, ContextError};
pub use module_loader::{AssertionInfo, ModuleError, ModuleIndex, ModuleType};
pub use platform::Platform;
pub use runtime::{Runtime, RuntimeConfig, RuntimeError};

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the V8 platform.
///
/// This must be called once before creating any runtime instances. This
/// function is thread-safe and will only initialize V8 once.
pub fn init_v8() {
    runtime::init_v8_platform();
}

/// Shut down the V8 platform.
///
/// # Safety
/// Must only be called when no runtimes are active.
pub unsafe fn shutdown_v8() {
    runtime::shutdown_v8_platform();
}
