//! App, spec.md §4.N: the top-level composition object.
//!
//! Grounded in `original_source/libs/jsRuntime/src/JSApp.cc`: `initialize` is
//! `JSApp::Initialize` (process-wide VM startup plus asset-root discovery),
//! `create_js_runtime` is `JSApp::CreateJSRuntime`, and `dispose` mirrors
//! `JSApp::~JSApp`'s reverse-order runtime teardown.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

use crate::assets::{AssetRootError, AssetRootIndex};
use crate::code_cache::CodeCache;
use crate::context::Context;
use crate::module_loader;
use crate::platform::Platform;
use crate::runtime::{Runtime, RuntimeConfig, RuntimeError};

/// Configuration consulted by [`App::initialize`].
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Filesystem root containing `js/`, `modules/`, and `resources/`.
    pub app_root: PathBuf,
    /// Whether runtimes created by this App run idle tasks by default.
    pub idle_tasks_enabled: bool,
}

/// Errors raised by [`App`] operations.
#[derive(Error, Debug)]
pub enum AppError {
    /// The configured app root failed asset-root discovery.
    #[error("failed to index app root: {0}")]
    AssetRoot(#[from] AssetRootError),

    /// A named runtime already exists.
    #[error("runtime '{0}' already exists")]
    DuplicateRuntime(String),

    /// Context creation failed for the runtime's default helper.
    #[error("default context creation failed: {0}")]
    Context(#[from] crate::context::ContextError),

    /// Propagated from a runtime operation.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Top-level composition object: owns the process-wide asset-root index,
/// code cache, and every named [`Runtime`] it has created. `initialize`
/// performs VM process-level startup exactly once; `dispose` tears
/// runtimes down in reverse creation order.
pub struct App {
    platform: Arc<Platform>,
    asset_roots: Rc<RefCell<AssetRootIndex>>,
    code_cache: Rc<RefCell<CodeCache>>,
    idle_tasks_enabled: bool,
    runtimes: RefCell<Vec<Rc<Runtime>>>,
    disposed: RefCell<bool>,
}

impl App {
    /// Initialize the V8 platform (process-wide, idempotent), index
    /// `config.app_root`, and build an empty App ready to create runtimes.
    pub fn initialize(config: AppConfig) -> Result<Rc<App>, AppError> {
        crate::runtime::init_v8_platform();

        let mut asset_roots = AssetRootIndex::new();
        asset_roots.set_app_root(&config.app_root)?;

        let app = Rc::new(App {
            platform: Platform::new(),
            asset_roots: Rc::new(RefCell::new(asset_roots)),
            code_cache: Rc::new(RefCell::new(CodeCache::new())),
            idle_tasks_enabled: config.idle_tasks_enabled,
            runtimes: RefCell::new(Vec::new()),
            disposed: RefCell::new(false),
        });

        debug!(app_root = %config.app_root.display(), "app initialized");
        Ok(app)
    }

    /// The process-wide asset-root index every runtime's contexts consult.
    pub fn asset_roots(&self) -> Rc<RefCell<AssetRootIndex>> {
        self.asset_roots.clone()
    }

    /// The process-wide code cache every runtime's contexts consult.
    pub fn code_cache(&self) -> Rc<RefCell<CodeCache>> {
        self.code_cache.clone()
    }

    /// Construct a named [`Runtime`], wire its default context-creation
    /// helper (which calls [`Context::create`] and then
    /// [`Context::set_loader_deps`] with this App's asset roots and code
    /// cache), and install the shadow-realm callback on its isolate. The
    /// runtime's own module-loader host callbacks are installed by
    /// [`Runtime::create`] itself.
    pub fn create_js_runtime(&self, name: impl Into<String>) -> Result<Rc<Runtime>, AppError> {
        let name = name.into();
        if self.runtimes.borrow().iter().any(|r| r.name() == name) {
            error!(name = %name, "runtime already exists");
            return Err(AppError::DuplicateRuntime(name));
        }

        let config = RuntimeConfig {
            idle_tasks_enabled: self.idle_tasks_enabled,
            ..Default::default()
        };
        let runtime = Runtime::create(self.platform.clone(), name.clone(), config);

        let asset_roots = self.asset_roots.clone();
        let code_cache = self.code_cache.clone();
        runtime.set_context_creation_helper(Box::new(move |runtime, name, namespace, entry_point| {
            let context = Rc::new(RefCell::new(Context::new(
                runtime.self_weak(),
                name,
                namespace,
                entry_point,
            )));
            context.borrow_mut().set_loader_deps(asset_roots.clone(), code_cache.clone());
            Context::create(&context).map_err(|e| RuntimeError::ContextCreationFailed(e.to_string()))?;
            Ok(context)
        }));

        runtime.with_isolate_scope(|isolate| {
            isolate.set_host_create_shadow_realm_context_callback(Context::create_shadow_realm_context);
            module_loader::install_callbacks(isolate);
        });

        self.runtimes.borrow_mut().push(runtime.clone());
        debug!(name = %name, "js runtime created");
        Ok(runtime)
    }

    /// Look up a previously created runtime by name.
    pub fn get_runtime(&self, name: &str) -> Option<Rc<Runtime>> {
        self.runtimes.borrow().iter().find(|r| r.name() == name).cloned()
    }

    /// Dispose every runtime in reverse creation order. Idempotent.
    pub fn dispose(&self) {
        if *self.disposed.borrow() {
            return;
        }
        for runtime in self.runtimes.borrow_mut().drain(..).rev() {
            runtime.dispose();
        }
        *self.disposed.borrow_mut() = true;
        debug!("app disposed");
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;
    use tempfile::tempdir;

    static INIT: Once = Once::new();

    fn init_v8_for_tests() {
        INIT.call_once(crate::runtime::init_v8_platform);
    }

    fn fixture_app_root() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("js")).unwrap();
        std::fs::create_dir(dir.path().join("modules")).unwrap();
        std::fs::create_dir(dir.path().join("resources")).unwrap();
        dir
    }

    #[test]
    fn initialize_indexes_app_root() {
        init_v8_for_tests();
        let dir = fixture_app_root();
        let app = App::initialize(AppConfig {
            app_root: dir.path().to_path_buf(),
            idle_tasks_enabled: false,
        })
        .unwrap();
        assert!(app.asset_roots().borrow().app_root().is_some());
    }

    #[test]
    fn create_js_runtime_rejects_duplicate_names() {
        init_v8_for_tests();
        let dir = fixture_app_root();
        let app = App::initialize(AppConfig {
            app_root: dir.path().to_path_buf(),
            idle_tasks_enabled: false,
        })
        .unwrap();
        app.create_js_runtime("main").unwrap();
        assert!(matches!(app.create_js_runtime("main"), Err(AppError::DuplicateRuntime(_))));
    }

    #[test]
    fn dispose_is_idempotent() {
        init_v8_for_tests();
        let dir = fixture_app_root();
        let app = App::initialize(AppConfig {
            app_root: dir.path().to_path_buf(),
            idle_tasks_enabled: false,
        })
        .unwrap();
        app.create_js_runtime("main").unwrap();
        app.dispose();
        app.dispose();
    }
}
