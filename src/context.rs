//! Context, spec.md §4.L.
//!
//! Grounded in `original_source/src/libs/jsRuntime/src/JSContext.cc`:
//! `create_context`/`dispose_context`/`move_context`/`generate_shadow_name`
//! map 1:1 to `JSContext::CreateContext`/`DisposeContext`/`MoveContext`/
//! `GenerateShadowName`. `create_shadow_realm_context` fixes a bug in the
//! original's `HostCreateShadowRealmContext`, which returns the initiator's
//! own context instead of the freshly created shadow's — resolved as an Open
//! Question in favor of returning the child, which is what the VM's
//! `HostCreateShadowRealmContextCallback` contract requires.

use std::rc::{Rc, Weak};

use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use crate::assets::AssetRootIndex;
use crate::code_cache::CodeCache;
use crate::module_loader::ModuleIndex;
use crate::runtime::Runtime;

/// The embedder-data slot index a VM context's weak back-pointer lives in.
pub const CONTEXT_WEAK_PTR_SLOT: usize = 0;

/// Errors raised by [`Context`] operations.
#[derive(Error, Debug)]
pub enum ContextError {
    /// The VM failed to produce a context object (e.g. out of memory).
    #[error("VM returned an empty context for '{0}'")]
    EmptyVmContext(String),

    /// The owning runtime's isolate is gone.
    #[error("runtime backing this context has already been disposed")]
    RuntimeGone,
}

/// A named JavaScript realm within a [`Runtime`]'s isolate: a VM context, its
/// module graph, and the weak back-pointer installed in the VM context's
/// embedder data so VM callbacks can find their way back to this object.
pub struct Context {
    runtime: Weak<Runtime>,
    name: String,
    namespace: String,
    entry_point: String,
    vm_context: Option<v8::Global<v8::Context>>,
    modules: Rc<std::cell::RefCell<ModuleIndex>>,
    asset_roots: Option<Rc<std::cell::RefCell<AssetRootIndex>>>,
    code_cache: Option<Rc<std::cell::RefCell<CodeCache>>>,
    security_token: Option<Uuid>,
    initialized: bool,
}

impl Context {
    /// Build an uninitialized context. Call [`Context::create`] before use.
    pub fn new(runtime: Weak<Runtime>, name: impl Into<String>, namespace: impl Into<String>, entry_point: impl Into<String>) -> Self {
        let mut name = name.into();
        // the ':' separator is reserved for shadow-realm naming
        name.retain(|c| c != ':');
        Self {
            runtime,
            name,
            namespace: namespace.into(),
            entry_point: entry_point.into(),
            vm_context: None,
            modules: Rc::new(std::cell::RefCell::new(ModuleIndex::new())),
            asset_roots: None,
            code_cache: None,
            security_token: None,
            initialized: false,
        }
    }

    /// Wire this context's module loader to the asset-root index and code
    /// cache it should consult. Set once by the context-creation helper
    /// before [`Context::create`].
    pub fn set_loader_deps(
        &mut self,
        asset_roots: Rc<std::cell::RefCell<AssetRootIndex>>,
        code_cache: Rc<std::cell::RefCell<CodeCache>>,
    ) {
        self.asset_roots = Some(asset_roots);
        self.code_cache = Some(code_cache);
    }

    /// The asset-root index this context's module loader consults, once set.
    pub fn asset_roots(&self) -> Option<Rc<std::cell::RefCell<AssetRootIndex>>> {
        self.asset_roots.clone()
    }

    /// The code cache this context's module loader consults, once set.
    pub fn code_cache(&self) -> Option<Rc<std::cell::RefCell<CodeCache>>> {
        self.code_cache.clone()
    }

    /// This context's name (shadow-realm separator already stripped).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The namespace this context was created under.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The module specifier this context's entry point resolves to.
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Whether [`Context::create`] has completed successfully.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The per-context module graph.
    pub fn modules(&self) -> Rc<std::cell::RefCell<ModuleIndex>> {
        self.modules.clone()
    }

    /// The context's fresh security token, once created.
    pub fn security_token(&self) -> Option<Uuid> {
        self.security_token
    }

    /// A cloned handle to the VM context, once created.
    pub fn vm_context(&self) -> Option<&v8::Global<v8::Context>> {
        self.vm_context.as_ref()
    }

    /// Build the VM-side context: empty global template, fresh security
    /// token, and a weak back-pointer installed in embedder slot
    /// [`CONTEXT_WEAK_PTR_SLOT`] so [`Context::get_context_from_vm_context`]
    /// and the shadow-realm/module-resolve callbacks can find their owner.
    ///
    /// `self` must already be held behind an `Rc` so the weak pointer stored
    /// in the VM slot stays valid for exactly this context's lifetime.
    pub fn create(self_rc: &Rc<std::cell::RefCell<Self>>) -> Result<(), ContextError> {
        let runtime = {
            let this = self_rc.borrow();
            this.runtime.upgrade().ok_or(ContextError::RuntimeGone)?
        };

        let vm_context = runtime.with_isolate_scope(|scope| {
            let global_template = v8::ObjectTemplate::new(scope);
            let context = v8::Context::new(scope, v8::ContextOptions {
                global_template: Some(global_template),
                ..Default::default()
            });
            v8::Global::new(scope, context)
        });

        let name = self_rc.borrow().name.clone();
        runtime.with_isolate_scope(|scope| {
            let local = v8::Local::new(scope, &vm_context);
            let weak: Weak<std::cell::RefCell<Context>> = Rc::downgrade(self_rc);
            let boxed = Box::new(weak);
            local.set_aligned_pointer_in_embedder_data(
                CONTEXT_WEAK_PTR_SLOT as i32,
                Box::into_raw(boxed) as *mut std::ffi::c_void,
            );

            let token = Uuid::new_v4();
            let token_str = v8::String::new(scope, &token.to_string())
                .ok_or_else(|| ContextError::EmptyVmContext(name.clone()))?;
            local.set_security_token(token_str.into());

            let mut this = self_rc.borrow_mut();
            this.security_token = Some(token);
            Ok::<(), ContextError>(())
        })?;

        let mut this = self_rc.borrow_mut();
        this.vm_context = Some(vm_context);
        this.initialized = true;
        debug!(name = %this.name, "context created");
        Ok(())
    }

    /// Idempotent: tear down the embedder weak-pointer slot and release the
    /// VM context handle.
    pub fn dispose(&mut self) {
        if !self.initialized {
            return;
        }
        if let (Some(vm_context), Some(runtime)) = (self.vm_context.take(), self.runtime.upgrade()) {
            runtime.with_isolate_scope(|scope| {
                let local = v8::Local::new(scope, &vm_context);
                let raw = local.get_aligned_pointer_from_embedder_data(CONTEXT_WEAK_PTR_SLOT as i32);
                if !raw.is_null() {
                    // SAFETY: only this context ever installs a pointer at this slot, and it
                    // was boxed by `create` above.
                    unsafe {
                        drop(Box::from_raw(raw as *mut Weak<std::cell::RefCell<Context>>));
                    }
                    local.set_aligned_pointer_in_embedder_data(CONTEXT_WEAK_PTR_SLOT as i32, std::ptr::null_mut());
                }
            });
        }
        self.runtime = Weak::new();
        self.initialized = false;
        debug!(name = %self.name, "context disposed");
    }

    /// Transfer ownership of another context's fields into `self`, re-seating
    /// the embedder-slot weak pointer so the VM-visible identity tracks the
    /// new owner. Used by reparenting/test code paths.
    pub fn move_context(self_rc: &Rc<std::cell::RefCell<Self>>, other: Context) {
        let mut this = self_rc.borrow_mut();
        this.runtime = other.runtime;
        this.namespace = other.namespace;
        this.entry_point = other.entry_point;
        this.modules = other.modules;
        this.asset_roots = other.asset_roots;
        this.code_cache = other.code_cache;
        this.security_token = other.security_token;
        this.initialized = other.initialized;
        this.vm_context = other.vm_context;
        this.name = other.name;
        drop(this);

        if let Some(runtime) = self_rc.borrow().runtime.upgrade() {
            if let Some(vm_context) = self_rc.borrow().vm_context.clone() {
                runtime.with_isolate_scope(|scope| {
                    let local = v8::Local::new(scope, &vm_context);
                    let old = local.get_aligned_pointer_from_embedder_data(CONTEXT_WEAK_PTR_SLOT as i32);
                    if !old.is_null() {
                        unsafe {
                            drop(Box::from_raw(old as *mut Weak<std::cell::RefCell<Context>>));
                        }
                    }
                    let weak: Weak<std::cell::RefCell<Context>> = Rc::downgrade(self_rc);
                    let boxed = Box::new(weak);
                    local.set_aligned_pointer_in_embedder_data(
                        CONTEXT_WEAK_PTR_SLOT as i32,
                        Box::into_raw(boxed) as *mut std::ffi::c_void,
                    );
                });
            }
        }
    }

    /// `"{base}:shadow:{n}"`, where `base` is this name up to the first `:`
    /// and `n` is one more than the integer after the second `:` (default 0).
    pub fn generate_shadow_name(&self) -> String {
        let mut parts = self.name.splitn(3, ':');
        let base = parts.next().unwrap_or("");
        let count = match (parts.next(), parts.next()) {
            (Some(_), Some(n)) => n.parse::<u32>().unwrap_or(0),
            _ => 0,
        };
        format!("{base}:shadow:{}", count + 1)
    }

    /// Retrieve the owning [`Context`] from a live VM context handle, via its
    /// embedder-slot weak pointer. `None` if the slot is empty or expired.
    pub fn get_context_from_vm_context(vm_context: v8::Local<v8::Context>) -> Option<Rc<std::cell::RefCell<Context>>> {
        let raw = vm_context.get_aligned_pointer_from_embedder_data(CONTEXT_WEAK_PTR_SLOT as i32);
        if raw.is_null() {
            return None;
        }
        // SAFETY: the slot is only ever populated by `create`/`move_context` above.
        let weak = unsafe { &*(raw as *const Weak<std::cell::RefCell<Context>>) };
        weak.upgrade()
    }

    /// VM callback for `ShadowRealm` construction: derives a child context
    /// named via [`Context::generate_shadow_name`], copies the initiator's
    /// security token, and returns the **child's** VM context (the original
    /// v8App source returns the initiator's own context here, which this
    /// crate treats as a bug).
    pub fn create_shadow_realm_context<'s>(
        scope: &mut v8::HandleScope<'s>,
        initiator: v8::Local<'s, v8::Context>,
    ) -> Option<v8::Local<'s, v8::Context>> {
        let initiator_ctx = Self::get_context_from_vm_context(initiator)?;
        let (runtime, shadow_name) = {
            let ctx = initiator_ctx.borrow();
            (ctx.runtime.upgrade()?, ctx.generate_shadow_name())
        };

        let shadow = runtime.create_context(&shadow_name, "", "")?;
        let shadow_vm_context = shadow.borrow().vm_context.clone()?;
        let local = v8::Local::new(scope, &shadow_vm_context);
        local.set_security_token(initiator.get_security_token());
        Some(local)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_shadow_name_starts_at_one() {
        let ctx = Context::new(Weak::new(), "main", "ns", "main.js");
        assert_eq!(ctx.generate_shadow_name(), "main:shadow:1");
    }

    #[test]
    fn generate_shadow_name_increments_existing_count() {
        let ctx = Context::new(Weak::new(), "main:shadow:3", "ns", "main.js");
        assert_eq!(ctx.generate_shadow_name(), "main:shadow:4");
    }

    #[test]
    fn name_strips_colon_separator_on_construction() {
        let ctx = Context::new(Weak::new(), "foo:bar", "ns", "main.js");
        assert_eq!(ctx.name(), "foobar");
    }
}
