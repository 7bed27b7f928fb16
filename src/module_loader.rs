//! Module loader and resolver, spec.md §4.M.
//!
//! Grounded in `original_source/libs/jsRuntime/src/JSContextModules.cc`:
//! `parse_assertions` is `GetModuleAssertionInfo`, `resolve_module_path` is
//! `BuildModulePath`, `load_module_tree` mirrors `LoadModuleTree`, and
//! `resolve_module_callback`/`host_import_module_dynamically` follow the
//! same referrer-lookup-then-join shape as `ResolveModuleCallback`/
//! `HostImportModuleDynamically`. The original's bodies for these last three
//! are commented out in the shipped source (the project never finished
//! them); this is a complete implementation of what both it and the
//! distilled behavior describe, rather than a port of working code.
//! `install_callbacks`, `create_script_origin`, and the dynamic-import
//! promise plumbing follow the confirmed idiom in `rsvim-rsvim`'s
//! `src/js/hook.rs` and `src/js/module.rs` (`v8::ScriptOrigin::new`,
//! `PromiseResolver`, `module.get_module_requests()`,
//! `request.get_specifier()`).

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, error};

use crate::assets::asset_root_index::{ROOT_JS, ROOT_MODULES, ROOT_RESOURCES};
use crate::assets::{AssetRootIndex, Version};
use crate::context::Context;

/// A module's declared type, from its import attributes' `"type"` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleType {
    Js,
    Json,
    Native,
    Invalid,
}

impl ModuleType {
    fn from_type_string(s: &str) -> Self {
        match s {
            "json" => ModuleType::Json,
            "js" => ModuleType::Js,
            "native" => ModuleType::Native,
            _ => ModuleType::Invalid,
        }
    }
}

impl Default for ModuleType {
    fn default() -> Self {
        ModuleType::Js
    }
}

/// Parsed import-attribute bag for one import (spec.md §4.M).
#[derive(Debug, Clone, Default)]
pub struct AssertionInfo {
    pub module_type: ModuleType,
    pub type_string: String,
    pub version: Option<Version>,
    pub module: Option<String>,
}

impl AssertionInfo {
    /// The default assertion set used for entry points: plain JS, no version
    /// or module override.
    pub fn js_default() -> Self {
        Self {
            module_type: ModuleType::Js,
            type_string: "js".to_string(),
            version: None,
            module: None,
        }
    }
}

/// The identity a module is cached under: its resolved absolute path plus
/// its declared type. Distinct types of the same path are distinct modules.
pub type ModuleKey = (PathBuf, ModuleType);

/// Errors raised while resolving, loading, instantiating, or evaluating a
/// module.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// The specifier did not resolve under any known asset root.
    #[error("import specifier could not be resolved: {0}")]
    UnresolvedSpecifier(String),

    /// The import attributes declared a `"type"` this loader doesn't know.
    #[error("import '{specifier}' had an invalid type of '{type_string}'")]
    InvalidType { specifier: String, type_string: String },

    /// A module-root import named a module/version with no asset root.
    #[error("module '{0}' has no registered root")]
    UnknownModuleVersion(String),

    /// An asserted `module` attribute disagreed with the module-root import
    /// it was attached to.
    #[error("asserted module '{asserted}' does not match imported module '{resolved}'")]
    AssertionMismatch { asserted: String, resolved: String },

    /// The VM failed to compile the module's source.
    #[error("failed to compile module '{0}'")]
    CompileFailed(PathBuf),

    /// The VM failed to instantiate the module graph.
    #[error("failed to instantiate module '{0}'")]
    InstantiateFailed(PathBuf),

    /// A dependency could not be resolved, or evaluation failed.
    #[error("unresolvable import or evaluation error: {0}")]
    ResolveFailed(String),

    /// The owning context or runtime has already been disposed.
    #[error("context backing this module load has already been disposed")]
    ContextGone,

    /// Propagated from the code cache.
    #[error(transparent)]
    CodeCache(#[from] crate::code_cache::CodeCacheError),
}

/// Per-context module graph: the `(path, type) <-> VM module` bimap,
/// spec.md invariant 3, plus the JSON-module parsed-value side table
/// (`m_JSONModuleToParsedMap` in the original).
#[derive(Default)]
pub struct ModuleIndex {
    by_specifier: HashMap<ModuleKey, v8::Global<v8::Module>>,
    by_handle: HashMap<i32, ModuleKey>,
    json_values: HashMap<i32, v8::Global<v8::Value>>,
}

impl ModuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ModuleKey) -> Option<v8::Global<v8::Module>> {
        self.by_specifier.get(key).cloned()
    }

    pub fn contains(&self, key: &ModuleKey) -> bool {
        self.by_specifier.contains_key(key)
    }

    pub fn specifier_for_handle(&self, handle: i32) -> Option<&ModuleKey> {
        self.by_handle.get(&handle)
    }

    pub fn insert(&mut self, key: ModuleKey, handle: i32, module: v8::Global<v8::Module>) {
        self.by_specifier.insert(key.clone(), module);
        self.by_handle.insert(handle, key);
    }

    pub fn len(&self) -> usize {
        self.by_specifier.len()
    }

    /// Record the parsed value backing a JSON module's default export,
    /// keyed by the synthetic module's identity hash. Mirrors
    /// `AddJSONModule`.
    pub fn set_json_value(&mut self, handle: i32, value: v8::Global<v8::Value>) {
        self.json_values.insert(handle, value);
    }

    /// Look up a JSON module's parsed value by identity hash. Mirrors
    /// `GetJSONByModule`.
    pub fn json_value(&self, handle: i32) -> Option<&v8::Global<v8::Value>> {
        self.json_values.get(&handle)
    }
}

/// Read one import-attributes `FixedArray` (alternating key/value strings)
/// into an [`AssertionInfo`]. Mirrors `GetModuleAssertionInfo`.
pub fn parse_assertions<'s>(scope: &mut v8::HandleScope<'s>, assertions: v8::Local<v8::FixedArray>) -> AssertionInfo {
    let mut info = AssertionInfo::js_default();

    let mut i = 0;
    while i + 1 < assertions.length() {
        let Some(key) = assertions.get(scope, i).and_then(|v| v8::Local::<v8::String>::try_from(v).ok()) else {
            i += 2;
            continue;
        };
        let Some(value) = assertions.get(scope, i + 1).and_then(|v| v8::Local::<v8::String>::try_from(v).ok()) else {
            i += 2;
            continue;
        };
        let key = key.to_rust_string_lossy(scope);
        let value = value.to_rust_string_lossy(scope);

        match key.as_str() {
            "type" => {
                info.type_string = value.clone();
                info.module_type = ModuleType::from_type_string(&value);
            }
            "version" => {
                let version = Version::parse(&value);
                if !version.is_valid() {
                    info.module_type = ModuleType::Invalid;
                    return info;
                }
                info.version = Some(version);
            }
            "module" => info.module = Some(value),
            _ => {}
        }
        i += 2;
    }

    // version only means something paired with module
    if info.version.is_some() && info.module.is_none() {
        info.version = None;
    }
    info
}

/// Join a raw import specifier onto the directory of its importing module,
/// expressed relative to the app root (spec.md §4.M resolve-callback step).
/// `importer_relative_dir` is empty for the entry point.
pub fn join_specifier(importer_relative_dir: &Path, raw_specifier: &str) -> PathBuf {
    use path_clean::PathClean;
    importer_relative_dir.join(raw_specifier).clean()
}

/// Resolve an app-root-relative specifier (e.g. `js/main.js`,
/// `widgets/1.0.0/index.js`) to an absolute filesystem path, honoring
/// well-known roots, module versioning, and asserted-module overrides.
/// Mirrors `BuildModulePath`.
pub fn resolve_module_path(specifier: &Path, assertion: &AssertionInfo, asset_roots: &AssetRootIndex) -> Result<PathBuf, ModuleError> {
    let mut components = specifier.components();
    let first = components
        .next()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .ok_or_else(|| ModuleError::UnresolvedSpecifier(specifier.display().to_string()))?;

    let (root_key, remainder): (String, PathBuf) = if first == ROOT_JS || first == ROOT_RESOURCES {
        (first, components.as_path().to_path_buf())
    } else {
        let module_name = if first == ROOT_MODULES {
            components
                .next()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .ok_or_else(|| ModuleError::UnresolvedSpecifier(specifier.display().to_string()))?
        } else {
            first
        };

        let mut lookahead = components.clone();
        let version = match lookahead.next() {
            Some(candidate_component) => {
                let candidate = Version::parse(&candidate_component.as_os_str().to_string_lossy());
                if candidate.is_valid() {
                    components.next();
                    candidate
                } else {
                    asset_roots
                        .latest_version(&module_name)
                        .cloned()
                        .ok_or_else(|| ModuleError::UnknownModuleVersion(module_name.clone()))?
                }
            }
            None => asset_roots
                .latest_version(&module_name)
                .cloned()
                .ok_or_else(|| ModuleError::UnknownModuleVersion(module_name.clone()))?,
        };

        let qualified = format!("{module_name}/{version}");
        if asset_roots.find_module_root(&qualified).is_none() {
            return Err(ModuleError::UnknownModuleVersion(qualified));
        }
        (qualified, components.as_path().to_path_buf())
    };

    let module_root_import = root_key != ROOT_JS && root_key != ROOT_RESOURCES;

    let final_root_key = match &assertion.module {
        None => root_key,
        Some(asserted_module) => {
            let asserted_version = match &assertion.version {
                Some(v) => v.clone(),
                None => asset_roots
                    .latest_version(asserted_module)
                    .cloned()
                    .ok_or_else(|| ModuleError::UnknownModuleVersion(asserted_module.clone()))?,
            };
            let asserted_key = format!("{asserted_module}/{asserted_version}");
            if module_root_import {
                if asserted_key != root_key {
                    return Err(ModuleError::AssertionMismatch {
                        asserted: asserted_key,
                        resolved: root_key,
                    });
                }
                root_key
            } else {
                asserted_key
            }
        }
    };

    let root_path = asset_roots
        .find_module_root(&final_root_key)
        .ok_or_else(|| ModuleError::UnknownModuleVersion(final_root_key.clone()))?;

    let absolute = if remainder.as_os_str().is_empty() {
        root_path.to_path_buf()
    } else {
        root_path.join(&remainder)
    };
    Ok(asset_roots.replace_tokens(absolute))
}

fn create_script_origin<'s>(scope: &mut v8::HandleScope<'s>, resource_name: &str) -> v8::ScriptOrigin<'s> {
    let name = v8::String::new(scope, resource_name).expect("resource name string");
    let source_map = v8::undefined(scope);
    v8::ScriptOrigin::new(
        scope,
        name.into(),
        0,
        0,
        false,
        0,
        Some(source_map.into()),
        false,
        false,
        true,
        None,
    )
}

/// VM callback for a JSON module's (sole) evaluation step: looks up the
/// parsed value stashed in the context's `ModuleIndex` by this module's
/// identity hash and installs it as the `default` export. Mirrors
/// `GetJSONByModule` feeding `JSContextModules`'s synthetic-module wiring.
extern "C" fn json_module_evaluation_steps<'s>(context: v8::Local<'s, v8::Context>, module: v8::Local<'s, v8::Module>) -> Option<v8::Local<'s, v8::Value>> {
    let scope = &mut unsafe { v8::CallbackScope::new(context) };
    let scope = &mut v8::HandleScope::new(scope);

    let context_rc = Context::get_context_from_vm_context(context)?;
    let modules = context_rc.borrow().modules();
    let handle = module.get_identity_hash();
    let value = modules.borrow().json_value(handle).cloned()?;
    let local_value = v8::Local::new(scope, &value);

    let export_name = v8::String::new(scope, "default")?;
    module.set_synthetic_module_export(scope, export_name, local_value);
    Some(v8::undefined(scope).into())
}

/// Parse `text` as JSON via the VM's own parser and wrap it in a synthetic
/// module with a single `default` export. Mirrors `AddJSONModule`.
fn compile_json_module<'s>(
    scope: &mut v8::HandleScope<'s>,
    absolute_path: &Path,
    text: &str,
    modules: &Rc<RefCell<ModuleIndex>>,
) -> Result<v8::Local<'s, v8::Module>, ModuleError> {
    let source = v8::String::new(scope, text).ok_or_else(|| ModuleError::CompileFailed(absolute_path.to_path_buf()))?;
    let parsed = v8::json::parse(scope, source).ok_or_else(|| ModuleError::CompileFailed(absolute_path.to_path_buf()))?;

    let module_name = v8::String::new(scope, &absolute_path.to_string_lossy()).expect("module name string");
    let default_export = v8::String::new(scope, "default").expect("export name string");
    let module = v8::Module::create_synthetic_module(scope, module_name, &[default_export], json_module_evaluation_steps);

    let handle = module.get_identity_hash();
    let value_global = v8::Global::new(scope, parsed);
    modules.borrow_mut().set_json_value(handle, value_global);

    Ok(module)
}

/// Compile `specifier` (and recursively, everything it statically imports)
/// into this context's [`ModuleIndex`]. Mirrors `LoadModuleTree`: the
/// `ModuleIndex` check happens before recursing, so import cycles terminate
/// on the second visit.
pub fn load_module_tree<'s>(
    scope: &mut v8::HandleScope<'s>,
    context_rc: &Rc<RefCell<Context>>,
    specifier: &Path,
    assertion: &AssertionInfo,
) -> Result<v8::Global<v8::Module>, ModuleError> {
    if assertion.module_type == ModuleType::Invalid {
        return Err(ModuleError::InvalidType {
            specifier: specifier.display().to_string(),
            type_string: assertion.type_string.clone(),
        });
    }

    let (asset_roots, code_cache, modules) = {
        let ctx = context_rc.borrow();
        (
            ctx.asset_roots().ok_or(ModuleError::ContextGone)?,
            ctx.code_cache().ok_or(ModuleError::ContextGone)?,
            ctx.modules(),
        )
    };

    let absolute_path = resolve_module_path(specifier, assertion, &asset_roots.borrow())?;
    if absolute_path.as_os_str().is_empty() {
        return Err(ModuleError::UnresolvedSpecifier(specifier.display().to_string()));
    }
    let key: ModuleKey = (absolute_path.clone(), assertion.module_type);

    if let Some(existing) = modules.borrow().get(&key) {
        return Ok(existing);
    }

    let module = if assertion.module_type == ModuleType::Json {
        let text = std::fs::read_to_string(&absolute_path).map_err(|_| ModuleError::CompileFailed(absolute_path.clone()))?;
        compile_json_module(scope, &absolute_path, &text, &modules)?
    } else {
        let source = code_cache.borrow_mut().load_script_source(&absolute_path, &asset_roots.borrow())?;
        let origin = create_script_origin(scope, &absolute_path.to_string_lossy());
        let source_str = v8::String::new(scope, &source.source_bytes).expect("source string");
        let mut compile_source = v8::script_compiler::Source::new(source_str, Some(&origin));
        v8::script_compiler::compile_module(scope, &mut compile_source).ok_or_else(|| ModuleError::CompileFailed(absolute_path.clone()))?
    };

    let handle = module.get_identity_hash();
    let global = v8::Global::new(scope, module);
    modules.borrow_mut().insert(key, handle, global.clone());

    let app_root_relative_dir = asset_roots
        .borrow()
        .make_relative_to_app_root(absolute_path.parent().unwrap_or_else(|| Path::new("")))
        .to_path_buf();

    let requests = module.get_module_requests();
    for i in 0..requests.length() {
        let Some(request) = requests.get(scope, i) else { continue };
        let Ok(request) = v8::Local::<v8::ModuleRequest>::try_from(request) else { continue };
        let request_specifier = request.get_specifier().to_rust_string_lossy(scope);
        let request_attributes = request.get_import_attributes();
        let request_assertion = parse_assertions(scope, request_attributes);
        let joined = join_specifier(&app_root_relative_dir, &request_specifier);
        load_module_tree(scope, context_rc, &joined, &request_assertion)?;
    }

    debug!(path = %absolute_path.display(), "module compiled and indexed");
    Ok(global)
}

/// Throw a VM `Error` with `message` in `scope`.
fn throw_error(scope: &mut v8::HandleScope, message: &str) {
    let text = v8::String::new(scope, message).expect("error message string");
    let exception = v8::Exception::error(scope, text);
    scope.throw_exception(exception);
}

/// Resolve a module request during `Module::instantiate_module`. Mirrors
/// `ResolveModuleCallback`: looks up the referrer's own key, joins its
/// directory with `specifier`, resolves that path, and fetches the
/// already-loaded module by key. `load_module_tree` already compiled every
/// statically-reachable module, so this is a pure lookup.
pub fn resolve_module_callback<'a>(
    context: v8::Local<'a, v8::Context>,
    specifier: v8::Local<'a, v8::String>,
    import_attributes: v8::Local<'a, v8::FixedArray>,
    referrer: v8::Local<'a, v8::Module>,
) -> Option<v8::Local<'a, v8::Module>> {
    // SAFETY: called synchronously by the VM during instantiation, with `context` live.
    let scope = &mut unsafe { v8::CallbackScope::new(context) };

    let Some(context_rc) = Context::get_context_from_vm_context(context) else {
        throw_error(scope, "module resolution ran with no owning context");
        return None;
    };
    let (asset_roots, modules) = {
        let ctx = context_rc.borrow();
        let Some(asset_roots) = ctx.asset_roots() else {
            throw_error(scope, "module resolution ran with no asset roots configured");
            return None;
        };
        (asset_roots, ctx.modules())
    };

    let referrer_handle = referrer.get_identity_hash();
    let referrer_key = {
        let idx = modules.borrow();
        idx.specifier_for_handle(referrer_handle).cloned()
    };
    let Some((referrer_path, _)) = referrer_key else {
        throw_error(scope, "unknown referrer module during resolution");
        return None;
    };

    let assertion = parse_assertions(scope, import_attributes);
    let specifier_str = specifier.to_rust_string_lossy(scope);

    let importer_relative_dir = asset_roots
        .borrow()
        .make_relative_to_app_root(referrer_path.parent().unwrap_or_else(|| Path::new("")))
        .to_path_buf();
    let joined = join_specifier(&importer_relative_dir, &specifier_str);

    let resolved = match resolve_module_path(&joined, &assertion, &asset_roots.borrow()) {
        Ok(path) => path,
        Err(e) => {
            throw_error(scope, &format!("unresolvable import '{specifier_str}': {e}"));
            return None;
        }
    };
    let key: ModuleKey = (resolved, assertion.module_type);

    let found = modules.borrow().get(&key);
    match found {
        Some(global) => Some(v8::Local::new(scope, &global)),
        None => {
            throw_error(scope, &format!("unresolvable import '{specifier_str}'"));
            None
        }
    }
}

/// `Module::instantiate_module` with [`resolve_module_callback`].
pub fn instantiate<'s>(scope: &mut v8::HandleScope<'s>, module: v8::Local<'s, v8::Module>) -> Result<(), ModuleError> {
    let ok = module.instantiate_module(scope, resolve_module_callback).unwrap_or(false);
    if ok {
        Ok(())
    } else {
        Err(ModuleError::InstantiateFailed(PathBuf::new()))
    }
}

/// `Module::evaluate`, draining microtasks until any returned promise
/// settles, and logging the stack trace on rejection.
pub fn evaluate<'s>(scope: &mut v8::HandleScope<'s>, module: v8::Local<'s, v8::Module>) -> Result<(), ModuleError> {
    let result = module.evaluate(scope);
    scope.perform_microtask_checkpoint();

    if module.get_status() == v8::ModuleStatus::Errored {
        let exception = module.get_exception();
        let message = exception.to_rust_string_lossy(scope);
        error!(error = %message, "module evaluation failed");
        return Err(ModuleError::ResolveFailed(message));
    }

    if let Some(result) = result {
        if let Ok(promise) = v8::Local::<v8::Promise>::try_from(result) {
            while promise.state() == v8::PromiseState::Pending {
                scope.perform_microtask_checkpoint();
            }
            if promise.state() == v8::PromiseState::Rejected {
                let reason = promise.result(scope);
                let message = reason.to_rust_string_lossy(scope);
                error!(error = %message, "module's top-level promise rejected");
                return Err(ModuleError::ResolveFailed(message));
            }
        }
    }
    Ok(())
}

/// Compile, instantiate, and evaluate `entry_point` (an app-root-relative
/// specifier) as the root module of `context_rc`. Mirrors `LoadEntryPoint`.
pub fn load_entry_point<'s>(scope: &mut v8::HandleScope<'s>, context_rc: &Rc<RefCell<Context>>, entry_point: &Path) -> Result<v8::Global<v8::Module>, ModuleError> {
    let vm_context = {
        let ctx = context_rc.borrow();
        ctx.vm_context().cloned().ok_or(ModuleError::ContextGone)?
    };
    let local_context = v8::Local::new(scope, &vm_context);
    let context_scope = &mut v8::ContextScope::new(scope, local_context);

    let global = load_module_tree(context_scope, context_rc, entry_point, &AssertionInfo::js_default())?;
    let module = v8::Local::new(context_scope, &global);
    instantiate(context_scope, module)?;
    evaluate(context_scope, module)?;
    Ok(global)
}

/// The VM calls this synchronously for `import(specifier)` expressions. The
/// original's design defers the actual work to a separately enqueued
/// microtask capturing `{context, resource_name, specifier, resolver,
/// attributes}`; since exactly one runs per call and nothing else touches
/// the isolate in between (single-threaded per isolate), doing the
/// equivalent work inline before returning the promise is observationally
/// identical and avoids a second isolate re-entry.
pub fn host_import_module_dynamically<'s>(
    scope: &mut v8::HandleScope<'s>,
    _host_defined_options: v8::Local<'s, v8::Data>,
    resource_name: v8::Local<'s, v8::Value>,
    specifier: v8::Local<'s, v8::String>,
    import_attributes: v8::Local<'s, v8::FixedArray>,
) -> Option<v8::Local<'s, v8::Promise>> {
    let resolver = v8::PromiseResolver::new(scope)?;
    let promise = resolver.get_promise(scope);

    if resource_name.is_null() {
        let message = v8::String::new(scope, "Resource name is empty")?;
        let exception = v8::Exception::type_error(scope, message);
        resolver.reject(scope, exception);
        return Some(promise);
    }

    let context = scope.get_current_context();
    let Some(context_rc) = Context::get_context_from_vm_context(context) else {
        let message = v8::String::new(scope, "dynamic import ran with no owning context")?;
        let exception = v8::Exception::error(scope, message);
        resolver.reject(scope, exception);
        return Some(promise);
    };

    let assertion = parse_assertions(scope, import_attributes);
    if assertion.module_type == ModuleType::Invalid {
        let specifier_str = specifier.to_rust_string_lossy(scope);
        let message = v8::String::new(scope, &format!("Import '{specifier_str}' had an invalid type of '{}'", assertion.type_string))?;
        let exception = v8::Exception::type_error(scope, message);
        resolver.reject(scope, exception);
        return Some(promise);
    }

    let referrer_path = resource_name.to_rust_string_lossy(scope);
    if referrer_path.is_empty() {
        let message = v8::String::new(scope, "Import path was empty.")?;
        let exception = v8::Exception::error(scope, message);
        resolver.reject(scope, exception);
        return Some(promise);
    }

    let asset_roots = match context_rc.borrow().asset_roots() {
        Some(roots) => roots,
        None => {
            let message = v8::String::new(scope, "dynamic import ran with no asset roots configured")?;
            let exception = v8::Exception::error(scope, message);
            resolver.reject(scope, exception);
            return Some(promise);
        }
    };
    let importer_relative_dir = asset_roots
        .borrow()
        .make_relative_to_app_root(Path::new(&referrer_path).parent().unwrap_or_else(|| Path::new("")))
        .to_path_buf();
    let specifier_str = specifier.to_rust_string_lossy(scope);
    let joined = join_specifier(&importer_relative_dir, &specifier_str);

    let module = match load_module_tree(scope, &context_rc, &joined, &assertion) {
        Ok(global) => v8::Local::new(scope, &global),
        Err(e) => {
            let message = v8::String::new(scope, &e.to_string())?;
            let exception = v8::Exception::error(scope, message);
            resolver.reject(scope, exception);
            return Some(promise);
        }
    };

    if !module.instantiate_module(scope, resolve_module_callback).unwrap_or(false) {
        let exception = scope.exception().unwrap_or_else(|| v8::undefined(scope).into());
        resolver.reject(scope, exception);
        return Some(promise);
    }

    let result = module.evaluate(scope);
    scope.perform_microtask_checkpoint();

    let Some(result) = result else {
        let exception = scope.exception().unwrap_or_else(|| v8::undefined(scope).into());
        resolver.reject(scope, exception);
        return Some(promise);
    };

    match v8::Local::<v8::Promise>::try_from(result) {
        Ok(inner) => {
            let namespace = module.get_module_namespace();
            match inner.state() {
                v8::PromiseState::Fulfilled => {
                    resolver.resolve(scope, namespace);
                }
                v8::PromiseState::Rejected => {
                    let reason = inner.result(scope);
                    resolver.reject(scope, reason);
                }
                v8::PromiseState::Pending => {
                    let resolver_global = v8::Global::new(scope, resolver);
                    let namespace_global = v8::Global::new(scope, namespace);
                    settle_on_module_promise(scope, inner, resolver_global, namespace_global);
                }
            }
        }
        Err(_) => {
            let namespace = module.get_module_namespace();
            resolver.resolve(scope, namespace);
        }
    }

    Some(promise)
}

/// Drain microtask checkpoints until `inner` settles, then resolve/reject
/// `resolver` with the module's namespace or the rejection reason.
fn settle_on_module_promise(scope: &mut v8::HandleScope, inner: v8::Local<v8::Promise>, resolver: v8::Global<v8::PromiseResolver>, namespace: v8::Global<v8::Value>) {
    let mut state = inner.state();
    while state == v8::PromiseState::Pending {
        scope.perform_microtask_checkpoint();
        state = inner.state();
    }
    let resolver = v8::Local::new(scope, &resolver);
    match state {
        v8::PromiseState::Fulfilled => {
            let namespace = v8::Local::new(scope, &namespace);
            resolver.resolve(scope, namespace);
        }
        v8::PromiseState::Rejected => {
            let reason = inner.result(scope);
            resolver.reject(scope, reason);
        }
        v8::PromiseState::Pending => unreachable!("loop only exits once settled"),
    }
}

/// VM callback invoked lazily the first time a module's `import.meta` is
/// accessed. Sets `import.meta.url` to the module's resolved path.
pub extern "C" fn initialize_import_meta(context: v8::Local<v8::Context>, module: v8::Local<v8::Module>, meta: v8::Local<v8::Object>) {
    let scope = &mut unsafe { v8::CallbackScope::new(context) };
    let scope = &mut v8::HandleScope::new(scope);

    let Some(context_rc) = Context::get_context_from_vm_context(context) else {
        return;
    };
    let modules = context_rc.borrow().modules();
    let handle = module.get_identity_hash();
    let url = modules
        .borrow()
        .specifier_for_handle(handle)
        .map(|(path, _)| path.to_string_lossy().into_owned())
        .unwrap_or_default();

    let Some(key) = v8::String::new(scope, "url") else { return };
    let Some(value) = v8::String::new(scope, &url) else { return };
    meta.create_data_property(scope, key.into(), value.into());
}

/// Install the module-loader host callbacks on an isolate: dynamic import,
/// import-meta initialization. Called once per isolate by `Runtime::create`.
pub fn install_callbacks(isolate: &mut v8::Isolate) {
    isolate.set_host_import_module_dynamically_callback(host_import_module_dynamically);
    isolate.set_host_initialize_import_meta_object_callback(initialize_import_meta);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixture() -> (tempfile::TempDir, AssetRootIndex) {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("js")).unwrap();
        std::fs::create_dir(dir.path().join("resources")).unwrap();
        let modules = dir.path().join("modules");
        std::fs::create_dir(&modules).unwrap();
        std::fs::create_dir_all(modules.join("widgets/1.0.0")).unwrap();
        std::fs::create_dir_all(modules.join("widgets/1.2.0")).unwrap();
        let mut roots = AssetRootIndex::new();
        roots.set_app_root(dir.path()).unwrap();
        (dir, roots)
    }

    #[test]
    fn resolves_plain_js_path() {
        let (dir, roots) = fixture();
        let resolved = resolve_module_path(Path::new("js/main.js"), &AssertionInfo::js_default(), &roots).unwrap();
        assert_eq!(resolved, dir.path().join("js/main.js"));
    }

    #[test]
    fn resolves_module_root_to_latest_version_by_default() {
        let (dir, roots) = fixture();
        let resolved = resolve_module_path(Path::new("widgets/index.js"), &AssertionInfo::js_default(), &roots).unwrap();
        assert_eq!(resolved, dir.path().join("modules/widgets/1.2.0/index.js"));
    }

    #[test]
    fn resolves_explicit_module_version() {
        let (dir, roots) = fixture();
        let resolved = resolve_module_path(Path::new("widgets/1.0.0/index.js"), &AssertionInfo::js_default(), &roots).unwrap();
        assert_eq!(resolved, dir.path().join("modules/widgets/1.0.0/index.js"));
    }

    #[test]
    fn rejects_unknown_module() {
        let (_dir, roots) = fixture();
        let err = resolve_module_path(Path::new("nonexistent/index.js"), &AssertionInfo::js_default(), &roots);
        assert!(matches!(err, Err(ModuleError::UnknownModuleVersion(_))));
    }

    #[test]
    fn asserted_module_must_match_resolved_module_root() {
        let (_dir, roots) = fixture();
        let assertion = AssertionInfo {
            module_type: ModuleType::Js,
            type_string: "js".to_string(),
            version: None,
            module: Some("other".to_string()),
        };
        let err = resolve_module_path(Path::new("widgets/1.0.0/index.js"), &assertion, &roots);
        assert!(matches!(err, Err(ModuleError::UnknownModuleVersion(_)) | Err(ModuleError::AssertionMismatch { .. })));
    }

    #[test]
    fn join_specifier_normalizes_parent_dir() {
        let joined = join_specifier(Path::new("js/lib"), "../main.js");
        assert_eq!(joined, PathBuf::from("js/main.js"));
    }

    #[test]
    fn module_index_bimap_starts_empty() {
        let index = ModuleIndex::new();
        assert_eq!(index.len(), 0);
        assert!(!index.contains(&(PathBuf::from("a.js"), ModuleType::Js)));
    }
}
