//! Scan modules and their registries.
//!
//! A module contributes phase hooks to the scan pipeline. Block modules
//! run for every device in registration order; a type module runs only
//! for devices its subsystem owns. The dynamic loader is out of scope
//! here: the core consumes registries of trait objects the binary
//! registered at startup.

use std::sync::Arc;

use indexmap::IndexMap;
use sid_kv::key::canonicalize_module_name;

use crate::error::UbridgeError;
use crate::scan::ScanCtx;

/// Phase hooks of one scan module. Every hook defaults to a no-op;
/// type modules are expected to identify their devices in [`ident`].
///
/// [`ident`]: UcmdModule::ident
pub trait UcmdModule {
	/// Full module name; `-` is canonicalized to `_` on registration.
	fn name(&self) -> &str;

	/// Identify the device.
	fn ident(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
		Ok(())
	}

	/// Before-scan hook; may set device readiness.
	fn scan_pre(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
		Ok(())
	}

	/// Scan on behalf of the current layer; may set device readiness.
	fn scan_current(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
		Ok(())
	}

	/// Scan on behalf of the next layer; may set device reservation.
	fn scan_next(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
		Ok(())
	}

	/// After-scan hook for the current layer.
	fn scan_post_current(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
		Ok(())
	}

	/// After-scan hook for the next layer.
	fn scan_post_next(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
		Ok(())
	}

	/// Trigger-action hook for the current layer.
	fn trigger_action_current(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
		Ok(())
	}

	/// Trigger-action hook for the next layer.
	fn trigger_action_next(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
		Ok(())
	}

	/// Called when any non-fatal phase failed.
	fn error(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
		Ok(())
	}
}

/// Ordered module registry with optional per-module subregistries.
#[derive(Default)]
pub struct ModuleRegistry {
	name: String,
	modules: IndexMap<String, Arc<dyn UcmdModule>>,
	subregistries: IndexMap<String, ModuleRegistry>,
}

impl ModuleRegistry {
	/// Creates an empty registry.
	#[must_use]
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			modules: IndexMap::new(),
			subregistries: IndexMap::new(),
		}
	}

	/// Registry name.
	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Registers a module under its canonicalized name.
	pub fn register(&mut self, module: Arc<dyn UcmdModule>) {
		let name = canonicalize_module_name(module.name());
		tracing::debug!(registry = %self.name, module = %name, "registered module");
		self.modules.insert(name, module);
	}

	/// Looks up a module by canonicalized name.
	#[must_use]
	pub fn get(&self, name: &str) -> Option<Arc<dyn UcmdModule>> {
		self.modules.get(&canonicalize_module_name(name)).cloned()
	}

	/// Iterates modules in registration order.
	pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn UcmdModule>> {
		self.modules.values()
	}

	/// Number of registered modules.
	#[must_use]
	pub fn len(&self) -> usize {
		self.modules.len()
	}

	/// Whether the registry is empty.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.modules.is_empty()
	}

	/// Attaches a subregistry under a registered module.
	pub fn add_subregistry(
		&mut self,
		module: &str,
		registry: ModuleRegistry,
	) -> Result<(), UbridgeError> {
		let name = canonicalize_module_name(module);
		if !self.modules.contains_key(&name) {
			return Err(UbridgeError::NotFound);
		}
		self.subregistries.insert(name, registry);
		Ok(())
	}

	/// Looks up the subregistry attached to a module.
	#[must_use]
	pub fn subregistry(&self, module: &str) -> Option<&ModuleRegistry> {
		self.subregistries.get(&canonicalize_module_name(module))
	}

	/// Module names in registration order.
	pub fn module_names(&self) -> impl Iterator<Item = &str> {
		self.modules.keys().map(String::as_str)
	}
}

/// The two aggregated registries the scan pipeline dispatches over.
#[derive(Default)]
pub struct Registries {
	/// Modules run for every block device.
	pub block: ModuleRegistry,
	/// Per-subsystem modules resolved by device module name.
	pub types: ModuleRegistry,
}

impl Registries {
	/// Creates the standard `block`/`type` registry pair.
	#[must_use]
	pub fn new() -> Self {
		Self {
			block: ModuleRegistry::new("block"),
			types: ModuleRegistry::new("type"),
		}
	}
}
