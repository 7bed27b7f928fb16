//! Runtime: one VM isolate plus its foreground task runner, template
//! registry, and named contexts, spec.md §4.K.
//!
//! Grounded in `examples/ishechuan-ferrum/src/runtime.rs` for the overall
//! shape (`RuntimeError`, the `PLATFORM: OnceLock` global-init pattern,
//! `#[cfg(test)]`'s `init_v8_for_tests`) and in
//! `original_source/src/libs/jsRuntime/src/JSRuntime.cc` for the isolate
//! lifecycle itself: the embedder weak-pointer slot, template registry,
//! context map, and `DisposeRuntime`'s teardown order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{debug, error};
use v8::CreateParams;

use crate::context::Context;
use crate::module_loader;
use crate::platform::{Platform, RuntimeId};
use crate::threading::foreground_task_runner::{ForegroundTaskRunner, TaskRunScope};

/// Errors raised by [`Runtime`] operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The VM failed to produce a context for the given name.
    #[error("context creation helper failed for '{0}'")]
    ContextCreationFailed(String),

    /// No context is registered under that name.
    #[error("no context named '{0}'")]
    NoSuchContext(String),

    /// A VM-level execution error, with the exception's string rendering.
    #[error("V8 execution error: {0}")]
    ExecutionError(String),

    /// A VM-level compilation error.
    #[error("V8 compilation error: {0}")]
    CompilationError(String),

    /// Module loading failed; wraps the module-loader's own error.
    #[error("module error: {0}")]
    Module(#[from] module_loader::ModuleError),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Global V8 platform, initialized once per process.
static PLATFORM: OnceLock<v8::SharedRef<v8::Platform>> = OnceLock::new();

/// Initialize the V8 platform. Thread-safe; subsequent calls are no-ops.
pub fn init_v8_platform() {
    PLATFORM.get_or_init(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();
        platform
    });
}

/// Whether [`init_v8_platform`] has run.
pub fn is_v8_platform_initialized() -> bool {
    PLATFORM.get().is_some()
}

/// # Safety
/// Must only be called once no [`Runtime`] is alive.
pub unsafe fn shutdown_v8_platform() {
    if PLATFORM.get().is_some() {
        v8::V8::dispose();
    }
}

#[allow(non_camel_case_types)]
type intptr_t = isize;

/// Configuration consulted by [`Runtime::create`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Whether idle tasks are dispatched for this runtime.
    pub idle_tasks_enabled: bool,
    /// Startup snapshot blob, if resuming from one.
    pub snapshot: Option<Vec<u8>>,
    /// External reference table paired with `snapshot`.
    pub external_references: Option<&'static [intptr_t]>,
    /// Whether this runtime is building a snapshot rather than running.
    pub for_snapshot: bool,
}

type ContextCreationHelper = dyn Fn(&Runtime, &str, &str, &str) -> RuntimeResult<Rc<RefCell<Context>>>;

/// One VM isolate, its foreground task runner, template registry, and named
/// contexts. Installs a weak back-pointer to itself in isolate embedder slot
/// 0 so VM callbacks (and [`Context`]) can recover the owning `Runtime`.
pub struct Runtime {
    self_weak: Weak<Runtime>,
    name: String,
    isolate: RefCell<v8::OwnedIsolate>,
    platform: Arc<Platform>,
    platform_id: RuntimeId,
    foreground: Arc<ForegroundTaskRunner>,
    object_templates: RefCell<HashMap<usize, v8::Global<v8::ObjectTemplate>>>,
    function_templates: RefCell<HashMap<usize, v8::Global<v8::FunctionTemplate>>>,
    global_template: RefCell<Option<v8::Global<v8::ObjectTemplate>>>,
    contexts: RefCell<HashMap<String, Rc<RefCell<Context>>>>,
    context_creation: RefCell<Option<Box<ContextCreationHelper>>>,
    snapshot_closers: RefCell<Vec<Weak<RefCell<Context>>>>,
    for_snapshot: bool,
}

/// Isolate embedder-data slot a runtime's weak back-pointer lives in.
pub const RUNTIME_WEAK_PTR_SLOT: u32 = 0;

impl Runtime {
    /// Allocate a VM isolate (optionally for-snapshot), install the weak
    /// self-pointer, enable uncaught-exception stack capture, register with
    /// `platform` for scheduling, and install module-loader callbacks.
    pub fn create(platform: Arc<Platform>, name: impl Into<String>, config: RuntimeConfig) -> Rc<Runtime> {
        let name = name.into();
        let mut params = CreateParams::default();
        if let Some(snapshot) = &config.snapshot {
            params = params.snapshot_blob(snapshot.clone());
        }

        let mut isolate = v8::Isolate::new(params);
        isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);

        let (platform_id, foreground) = platform.register_runtime(config.idle_tasks_enabled);

        let runtime = Rc::new_cyclic(|self_weak| Runtime {
            self_weak: self_weak.clone(),
            name: name.clone(),
            isolate: RefCell::new(isolate),
            platform,
            platform_id,
            foreground,
            object_templates: RefCell::new(HashMap::new()),
            function_templates: RefCell::new(HashMap::new()),
            global_template: RefCell::new(None),
            contexts: RefCell::new(HashMap::new()),
            context_creation: RefCell::new(None),
            snapshot_closers: RefCell::new(Vec::new()),
            for_snapshot: config.for_snapshot,
        });

        runtime.with_isolate_scope(|isolate| {
            let weak: Weak<Runtime> = runtime.self_weak.clone();
            let boxed = Box::new(weak);
            // SAFETY: `Isolate::set_data` stores an opaque pointer we own and clear in `dispose`.
            unsafe {
                isolate.set_data(RUNTIME_WEAK_PTR_SLOT, Box::into_raw(boxed) as *mut std::ffi::c_void);
            }
            module_loader::install_callbacks(isolate);
        });

        debug!(name = %name, "runtime created");
        runtime
    }

    /// The runtime's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A weak handle to this runtime, for children (contexts) that need to
    /// hand back an owning reference without an unstable `&Rc<Self>` receiver.
    pub fn self_weak(&self) -> Weak<Runtime> {
        self.self_weak.clone()
    }

    /// Look up the owning `Runtime` from a raw isolate pointer via its
    /// embedder-slot weak pointer.
    pub fn from_isolate(isolate: &v8::Isolate) -> Option<Rc<Runtime>> {
        // SAFETY: the slot is only ever populated by `create` above.
        let raw = unsafe { isolate.get_data(RUNTIME_WEAK_PTR_SLOT) };
        if raw.is_null() {
            return None;
        }
        let weak = unsafe { &*(raw as *const Weak<Runtime>) };
        weak.upgrade()
    }

    /// Run `f` with the isolate locked and scoped. Used by every VM-touching
    /// operation on this runtime and by [`Context`].
    pub fn with_isolate_scope<R>(&self, f: impl FnOnce(&mut v8::HandleScope<'_, ()>) -> R) -> R {
        let mut isolate = self.isolate.borrow_mut();
        let scope = &mut v8::HandleScope::new(&mut isolate);
        f(scope)
    }

    /// Install the configured *context creation helper* (§6), used by
    /// [`Runtime::create_context`].
    pub fn set_context_creation_helper(&self, helper: Box<ContextCreationHelper>) {
        *self.context_creation.borrow_mut() = Some(helper);
    }

    /// Store an `ObjectTemplate` under a caller-chosen stable address used as
    /// a type tag.
    pub fn set_object_template(&self, tag: usize, template: v8::Global<v8::ObjectTemplate>) {
        self.object_templates.borrow_mut().insert(tag, template);
    }

    /// Store a `FunctionTemplate` under a caller-chosen stable address.
    pub fn set_function_template(&self, tag: usize, template: v8::Global<v8::FunctionTemplate>) {
        self.function_templates.borrow_mut().insert(tag, template);
    }

    /// Dequeue and run foreground tasks while any remain. Nested
    /// `process_tasks` is supported via [`TaskRunScope`]'s depth counter.
    pub fn process_tasks(&self) {
        while self.foreground.may_have_tasks() {
            if let Some(task) = self.foreground.get_next_task() {
                let _scope = TaskRunScope::enter(&self.foreground);
                task();
            } else {
                break;
            }
        }
    }

    /// Dequeue and run idle tasks until `time_budget_sec` elapses or none
    /// remain. No-op when idle tasks are disabled for this runtime.
    pub fn process_idle_tasks(&self, time_budget_sec: f64) {
        if !self.platform.idle_tasks_enabled(self.platform_id) {
            return;
        }
        let deadline = self.platform.monotonically_increasing_time() + time_budget_sec;
        while self.platform.monotonically_increasing_time() < deadline && self.foreground.may_have_idle_tasks() {
            if let Some(task) = self.foreground.get_next_idle_task() {
                let _scope = TaskRunScope::enter(&self.foreground);
                task(deadline);
            } else {
                break;
            }
        }
    }

    /// Build a new named [`Context`] via the configured creation helper,
    /// register it, and (when this runtime is `for_snapshot`) track it as a
    /// snapshot-handle closer.
    pub fn create_context(&self, name: &str, namespace: &str, entry_point: &str) -> Option<Rc<RefCell<Context>>> {
        let helper = self.context_creation.borrow();
        let Some(helper) = helper.as_ref() else {
            error!(name, "no context creation helper configured");
            return None;
        };
        match helper(self, name, namespace, entry_point) {
            Ok(context) => {
                self.contexts.borrow_mut().insert(name.to_string(), context.clone());
                if self.for_snapshot {
                    self.snapshot_closers.borrow_mut().push(Rc::downgrade(&context));
                }
                Some(context)
            }
            Err(e) => {
                error!(name, error = %e, "context creation helper failed");
                None
            }
        }
    }

    /// Look up a registered context by name.
    pub fn get_context_by_name(&self, name: &str) -> Option<Rc<RefCell<Context>>> {
        self.contexts.borrow().get(name).cloned()
    }

    /// Unregister and dispose a named context.
    pub fn dispose_context(&self, name: &str) {
        let Some(context) = self.contexts.borrow_mut().remove(name) else {
            return;
        };
        self.snapshot_closers.borrow_mut().retain(|c| !std::ptr::eq(c.as_ptr(), Rc::as_ptr(&context)));
        context.borrow_mut().dispose();
    }

    /// Reset the global template and every registered template, then invoke
    /// every registered snapshot-handle closer once. Meaningful only for
    /// `for_snapshot` runtimes.
    pub fn close_open_handles_for_snapshot(&self) {
        if !self.for_snapshot {
            return;
        }
        self.global_template.borrow_mut().take();
        self.object_templates.borrow_mut().clear();
        self.function_templates.borrow_mut().clear();
        for closer in self.snapshot_closers.borrow_mut().drain(..) {
            if let Some(context) = closer.upgrade() {
                context.borrow_mut().dispose();
            }
        }
    }

    /// Tear down in the order `JSRuntime::DisposeRuntime` does: templates and
    /// contexts first, then the embedder weak-pointer slot, then the isolate.
    pub fn dispose(&self) {
        self.global_template.borrow_mut().take();
        self.snapshot_closers.borrow_mut().clear();
        self.with_isolate_scope(|isolate| {
            self.object_templates.borrow_mut().clear();
            self.function_templates.borrow_mut().clear();
            self.contexts.borrow_mut().clear();
            // SAFETY: the slot was populated by `create` and is only ever read here and in
            // `from_isolate`.
            let raw = unsafe { isolate.get_data(RUNTIME_WEAK_PTR_SLOT) };
            if !raw.is_null() {
                unsafe {
                    drop(Box::from_raw(raw as *mut Weak<Runtime>));
                    isolate.set_data(RUNTIME_WEAK_PTR_SLOT, std::ptr::null_mut());
                }
            }
        });
        self.platform.unregister_runtime(self.platform_id);
        debug!(name = %self.name, "runtime disposed");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::StubTimeSource;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn init_v8_for_tests() {
        INIT.call_once(init_v8_platform);
    }

    fn test_runtime() -> Rc<Runtime> {
        init_v8_for_tests();
        let platform = Platform::with_clock(Arc::new(StubTimeSource::new()));
        Runtime::create(platform, "test", RuntimeConfig::default())
    }

    #[test]
    fn runtime_creation_installs_weak_pointer() {
        let rt = test_runtime();
        rt.with_isolate_scope(|isolate| {
            assert!(Runtime::from_isolate(isolate).is_some());
        });
    }

    #[test]
    fn process_tasks_drains_posted_foreground_work() {
        let rt = test_runtime();
        let ran = Rc::new(RefCell::new(false));
        let ran_clone = ran.clone();
        rt.foreground.post_task(Box::new(move || {
            *ran_clone.borrow_mut() = true;
        }));
        rt.process_tasks();
        assert!(*ran.borrow());
    }

    #[test]
    fn create_context_without_helper_returns_none() {
        let rt = test_runtime();
        assert!(rt.create_context("main", "", "main.js").is_none());
    }
}
