// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport catalog: the set of PSMX instances available to a domain.
//!
//! Each configured transport is resolved in this order:
//! 1. a builtin factory registered under the transport name
//! 2. a shared library (`library` path, or `libpsmx_<name>.so`) exporting
//!    `<name>_create_virtual_interface`
//!
//! A transport that fails to load is recorded in [`TransportCatalog::failures`]
//! and logged once; the other transports stay usable.
//!
//! # Plugin ABI
//!
//! ```text
//! bool <name>_create_virtual_interface(void **out, uint32_t id, const char *config);
//! ```
//!
//! On success `*out` holds a `Box<Arc<dyn PsmxInstance>>` turned into a raw
//! pointer. Plugins must be built against the same `hdds-psmx` version;
//! [`create_interface_with`] implements the export side.

use super::{instance_fini, InstanceId, PsmxInstance};
use crate::config::{PsmxConfig, TransportConfig};
use crate::error::{Error, Result};
use crate::psmx::fingerprint::fnv1a_32;
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;

/// Signature of a plugin's exported factory.
pub type CreateVirtualInterfaceFn =
    unsafe extern "C" fn(out: *mut *mut c_void, identifier: u32, config: *const c_char) -> bool;

/// In-process factory for a builtin transport.
pub type PsmxFactory =
    Arc<dyn Fn(InstanceId, &TransportConfig) -> Result<Arc<dyn PsmxInstance>> + Send + Sync>;

/// Identifier assigned to the transport `name`.
#[must_use]
pub fn instance_id_for(name: &str) -> InstanceId {
    fnv1a_32(name.as_bytes())
}

/// A transport that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginLoadFailure {
    pub name: String,
    pub reason: String,
}

/// A loaded instance plus its effective priority.
pub struct InstanceEntry {
    instance: Arc<dyn PsmxInstance>,
    priority: i32,
    library: Option<dynlib::PluginLibrary>,
}

impl InstanceEntry {
    #[must_use]
    pub fn instance(&self) -> &Arc<dyn PsmxInstance> {
        &self.instance
    }

    /// Configured priority, or the plugin's own when none was configured.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.library.is_some()
    }
}

impl std::fmt::Debug for InstanceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceEntry")
            .field("name", &self.instance.name())
            .field("instance_id", &self.instance.instance_id())
            .field("priority", &self.priority)
            .field("dynamic", &self.library.is_some())
            .finish()
    }
}

/// Builder collecting builtin factories before loading a configuration.
#[derive(Default)]
pub struct TransportCatalogBuilder {
    builtins: HashMap<String, PsmxFactory>,
}

impl TransportCatalogBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory served without a shared library.
    #[must_use]
    pub fn register_builtin<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(InstanceId, &TransportConfig) -> Result<Arc<dyn PsmxInstance>> + Send + Sync + 'static,
    {
        self.builtins.insert(name.into(), Arc::new(factory));
        self
    }

    /// Register the transports shipped with this crate (`loopback`).
    #[must_use]
    pub fn with_builtin_transports(self) -> Self {
        self.register_builtin(super::loopback::LOOPBACK_NAME, |id, config| {
            super::loopback::LoopbackInstance::create(id, config)
        })
    }

    /// Instantiate every configured transport.
    ///
    /// Only an invalid configuration is an error; individual load failures
    /// are recorded in the catalog.
    pub fn load(self, config: &PsmxConfig) -> Result<TransportCatalog> {
        config.validate()?;
        let mut catalog = TransportCatalog::empty();
        for transport in &config.transports {
            let id = instance_id_for(&transport.name);
            let loaded = match self.builtins.get(&transport.name) {
                Some(factory) => factory(id, transport).map(|instance| (instance, None)),
                None => load_plugin(transport, id).map(|(lib, instance)| (instance, Some(lib))),
            };
            match loaded {
                Ok((instance, library)) => {
                    let priority = if transport.priority != 0 {
                        transport.priority
                    } else {
                        instance.priority()
                    };
                    log::debug!(
                        "[psmx] loaded transport '{}' (id={:#010x}, priority={}, dynamic={})",
                        transport.name,
                        instance.instance_id(),
                        priority,
                        library.is_some()
                    );
                    catalog.instances.push(InstanceEntry {
                        instance,
                        priority,
                        library,
                    });
                }
                Err(e) => {
                    log::error!("[psmx] transport '{}' disabled: {}", transport.name, e);
                    catalog.failures.push(PluginLoadFailure {
                        name: transport.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        catalog.instances.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.instance.instance_id().cmp(&b.instance.instance_id()))
        });
        Ok(catalog)
    }
}

/// Loaded PSMX instances, ordered by descending priority.
#[derive(Debug, Default)]
pub struct TransportCatalog {
    instances: Vec<InstanceEntry>,
    failures: Vec<PluginLoadFailure>,
}

impl TransportCatalog {
    /// Catalog without transports.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> TransportCatalogBuilder {
        TransportCatalogBuilder::new()
    }

    /// Builtins plus dynamic plugins for `config`.
    pub fn from_config(config: &PsmxConfig) -> Result<Self> {
        Self::builder().with_builtin_transports().load(config)
    }

    #[must_use]
    pub fn instances(&self) -> &[InstanceEntry] {
        &self.instances
    }

    #[must_use]
    pub fn instance(&self, id: InstanceId) -> Option<&Arc<dyn PsmxInstance>> {
        self.instances
            .iter()
            .map(InstanceEntry::instance)
            .find(|i| i.instance_id() == id)
    }

    #[must_use]
    pub fn instance_by_name(&self, name: &str) -> Option<&Arc<dyn PsmxInstance>> {
        self.instances
            .iter()
            .map(InstanceEntry::instance)
            .find(|i| i.name() == name)
    }

    #[must_use]
    pub fn failures(&self) -> &[PluginLoadFailure] {
        &self.failures
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Tear down every instance (endpoints, topics, instance), then unload
    /// plugin libraries no longer referenced. Returns the first failure.
    pub fn shutdown(&mut self) -> Result<()> {
        let mut first_err = None;
        for entry in self.instances.drain(..) {
            if let Err(e) = instance_fini(entry.instance.as_ref()) {
                log::warn!("[psmx] shutdown of '{}' failed: {}", entry.instance.name(), e);
                first_err.get_or_insert(e);
            }
            let InstanceEntry {
                instance, library, ..
            } = entry;
            let sole_owner = Arc::strong_count(&instance) == 1;
            let name = instance.name().to_string();
            drop(instance);
            if let Some(library) = library {
                if sole_owner {
                    drop(library);
                } else {
                    log::warn!(
                        "[psmx] '{}' still referenced at shutdown, keeping its library mapped",
                        name
                    );
                    std::mem::forget(library);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for TransportCatalog {
    fn drop(&mut self) {
        if !self.instances.is_empty() {
            if let Err(e) = self.shutdown() {
                log::debug!("[psmx] catalog drop: {}", e);
            }
        }
    }
}

fn load_plugin(
    transport: &TransportConfig,
    id: InstanceId,
) -> Result<(dynlib::PluginLibrary, Arc<dyn PsmxInstance>)> {
    let fail = |reason: String| Error::PluginLoad {
        name: transport.name.clone(),
        reason,
    };
    let path = transport.library_path();
    let library = dynlib::PluginLibrary::open(&path).map_err(fail)?;
    let create = library.factory(&transport.factory_symbol()).map_err(fail)?;
    let config = CString::new(transport.config.as_str())
        .map_err(|_| fail("config string contains NUL".into()))?;

    let mut out: *mut c_void = std::ptr::null_mut();
    // SAFETY:
    // - `create` was resolved from a loaded library that stays mapped while
    //   `library` is alive
    // - `out` is a valid pointer to a null-initialized slot
    // - `config` is a valid NUL-terminated string outliving the call
    let ok = unsafe { create(&mut out, id, config.as_ptr()) };
    if !ok || out.is_null() {
        return Err(fail(format!("{} returned failure", transport.factory_symbol())));
    }
    // SAFETY:
    // - per the plugin ABI, a successful factory stores a pointer obtained
    //   from `Box::into_raw(Box<Arc<dyn PsmxInstance>>)` in `out`
    // - ownership of that box is transferred to us exactly once
    let instance = unsafe { *Box::from_raw(out.cast::<Arc<dyn PsmxInstance>>()) };
    Ok((library, instance))
}

/// Export-side helper for plugin factories.
///
/// ```ignore
/// #[no_mangle]
/// pub unsafe extern "C" fn mytransport_create_virtual_interface(
///     out: *mut *mut c_void,
///     id: u32,
///     config: *const c_char,
/// ) -> bool {
///     create_interface_with(out, id, config, MyInstance::from_config)
/// }
/// ```
///
/// # Safety
///
/// `out` must be null or valid for a pointer write; `config` must be null
/// or a valid NUL-terminated string.
pub unsafe fn create_interface_with<F>(
    out: *mut *mut c_void,
    identifier: u32,
    config: *const c_char,
    ctor: F,
) -> bool
where
    F: FnOnce(InstanceId, &str) -> Result<Arc<dyn PsmxInstance>>,
{
    if out.is_null() {
        return false;
    }
    let config = if config.is_null() {
        ""
    } else {
        // SAFETY: caller guarantees a valid NUL-terminated string.
        match unsafe { CStr::from_ptr(config) }.to_str() {
            Ok(s) => s,
            Err(_) => {
                log::error!("[psmx] plugin config is not valid UTF-8");
                return false;
            }
        }
    };
    match ctor(identifier, config) {
        Ok(instance) => {
            // SAFETY: `out` is non-null and valid for writes per the contract.
            unsafe { *out = Box::into_raw(Box::new(instance)).cast::<c_void>() };
            true
        }
        Err(e) => {
            log::error!("[psmx] plugin factory failed: {}", e);
            false
        }
    }
}

#[cfg(unix)]
mod dynlib {
    use super::CreateVirtualInterfaceFn;
    use std::ffi::{c_void, CStr, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};

    /// A `dlopen`ed plugin; `dlclose`d on drop.
    pub struct PluginLibrary {
        handle: *mut c_void,
        path: PathBuf,
    }

    // SAFETY: a dlopen handle is a process-global token; dlsym/dlclose are
    // thread-safe per POSIX.
    unsafe impl Send for PluginLibrary {}
    unsafe impl Sync for PluginLibrary {}

    impl PluginLibrary {
        pub fn open(path: &Path) -> Result<Self, String> {
            let c_path = CString::new(path.as_os_str().as_bytes())
                .map_err(|_| format!("library path {:?} contains NUL", path))?;
            // SAFETY:
            // - c_path is a valid NUL-terminated string
            // - dlopen returns null on failure (checked below)
            let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
            if handle.is_null() {
                return Err(last_dl_error());
            }
            log::debug!("[psmx] dlopen {:?}", path);
            Ok(Self {
                handle,
                path: path.to_path_buf(),
            })
        }

        pub fn factory(&self, symbol: &str) -> Result<CreateVirtualInterfaceFn, String> {
            let c_symbol =
                CString::new(symbol).map_err(|_| format!("symbol {symbol:?} contains NUL"))?;
            // SAFETY:
            // - self.handle is a live handle from a successful dlopen
            // - dlerror() is called first to clear any stale error
            let sym = unsafe {
                libc::dlerror();
                libc::dlsym(self.handle, c_symbol.as_ptr())
            };
            if sym.is_null() {
                return Err(format!("{} not found in {:?}: {}", symbol, self.path, last_dl_error()));
            }
            // SAFETY: the plugin ABI fixes the exported symbol's signature.
            Ok(unsafe { std::mem::transmute::<*mut c_void, CreateVirtualInterfaceFn>(sym) })
        }
    }

    impl Drop for PluginLibrary {
        fn drop(&mut self) {
            // SAFETY: handle came from a successful dlopen and is closed once.
            unsafe { libc::dlclose(self.handle) };
            log::debug!("[psmx] dlclose {:?}", self.path);
        }
    }

    fn last_dl_error() -> String {
        // SAFETY: dlerror returns null or a valid NUL-terminated string.
        let msg = unsafe { libc::dlerror() };
        if msg.is_null() {
            "unknown dynamic loader error".to_string()
        } else {
            // SAFETY: non-null dlerror result is a valid C string.
            unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
        }
    }
}

#[cfg(not(unix))]
mod dynlib {
    use super::CreateVirtualInterfaceFn;
    use std::path::Path;

    pub struct PluginLibrary;

    impl PluginLibrary {
        pub fn open(path: &Path) -> Result<Self, String> {
            Err(format!(
                "cannot load {:?}: dynamic plugins are not supported on this platform",
                path
            ))
        }

        pub fn factory(&self, _symbol: &str) -> Result<CreateVirtualInterfaceFn, String> {
            Err("dynamic plugins are not supported on this platform".into())
        }
    }
}
