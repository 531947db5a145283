//! The seven-field key grammar.
//!
//! Rendered form: `<op>:<dom>:<ns>:<ns_part>:<id>:<id_part>:<core>`.
//! Empty fields render as empty between the `:` separators; the op and
//! namespace fields use single-character prefixes from fixed tables.

/// Field separator in rendered keys.
pub const KEY_JOIN: char = ':';

/// Leading byte of sync-index alias keys.
pub const SYNC_PREFIX: char = '>';

/// Exclusive upper bound for sync-index range iteration (the byte right
/// after [`SYNC_PREFIX`]).
pub const SYNC_END: char = '?';

/// Prefix of internal system core names, forbidden in the public API.
pub const SYS_PREFIX: char = '#';

/// Distinguished owner of core-authored records.
pub const OWNER_CORE: &str = "#core";

/// Store generation counter (GLOBAL namespace).
pub const KEY_DB_GENERATION: &str = "#DBGEN";
/// System boot id sentinel (GLOBAL namespace).
pub const KEY_BOOT_ID: &str = "#BOOTID";
/// Device readiness state (DEVICE namespace).
pub const KEY_DEV_READY: &str = "#RDY";
/// Device reservation state (DEVICE namespace).
pub const KEY_DEV_RESERVED: &str = "#RES";
/// Device type-module name (DEVICE namespace).
pub const KEY_DEV_MOD: &str = "#MOD";
/// Group membership vector on the group's key.
pub const KEY_GROUP_MEMBERS: &str = "#GMB";
/// Reciprocal group vector on each member device.
pub const KEY_GROUP_IN: &str = "#GIN";

/// Layer domain used for device hierarchy records.
pub const DOM_LAYER: &str = "LYR";
/// User domain used for module-set records.
pub const DOM_USER: &str = "USR";

/// Key operation, the first key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Op {
	/// Plain set.
	#[default]
	Set,
	/// Incremental addition to a vector key.
	Plus,
	/// Incremental removal from a vector key.
	Minus,
	/// Illegal operation marker.
	Illegal,
}

impl Op {
	/// Single-character key prefix.
	#[must_use]
	pub fn prefix(self) -> &'static str {
		match self {
			Self::Set => "",
			Self::Plus => "+",
			Self::Minus => "-",
			Self::Illegal => "X",
		}
	}
}

/// Record namespace, the third key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Namespace {
	/// Not a valid namespace for user records.
	#[default]
	Undefined,
	/// Per-device properties mirrored from and to the event source.
	Udev,
	/// Per-device internal records.
	Device,
	/// Per-module records.
	Module,
	/// Process-wide records.
	Global,
}

impl Namespace {
	/// Single-character key prefix.
	#[must_use]
	pub fn prefix(self) -> &'static str {
		match self {
			Self::Undefined => "",
			Self::Udev => "U",
			Self::Device => "D",
			Self::Module => "M",
			Self::Global => "G",
		}
	}

	fn from_prefix(s: &str) -> Self {
		match s {
			"U" => Self::Udev,
			"D" => Self::Device,
			"M" => Self::Module,
			"G" => Self::Global,
			_ => Self::Undefined,
		}
	}
}

/// Key field selector for [`parse_part`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPart {
	/// Operation field.
	Op = 0,
	/// Domain field.
	Dom = 1,
	/// Namespace field.
	Ns = 2,
	/// Namespace part field.
	NsPart = 3,
	/// Id field.
	Id = 4,
	/// Id part field.
	IdPart = 5,
	/// Core field.
	Core = 6,
}

/// Structured key specification; composes into the rendered string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeySpec<'a> {
	/// Operation.
	pub op: Op,
	/// Domain (`LYR`, `USR` or empty).
	pub dom: &'a str,
	/// Namespace.
	pub ns: Namespace,
	/// Namespace part (device id, module name or empty).
	pub ns_part: &'a str,
	/// Id for hierarchical layering (group id or empty).
	pub id: &'a str,
	/// Id part (empty unless layered further).
	pub id_part: &'a str,
	/// Core key name.
	pub core: &'a str,
}

impl<'a> KeySpec<'a> {
	/// Renders the full key.
	#[must_use]
	pub fn compose(&self) -> String {
		let mut key = self.compose_prefix();
		key.push(KEY_JOIN);
		key.push_str(self.core);
		key
	}

	/// Renders the key prefix, without the `:core` tail.
	#[must_use]
	pub fn compose_prefix(&self) -> String {
		let mut key = String::with_capacity(
			8 + self.dom.len() + self.ns_part.len() + self.id.len() + self.id_part.len(),
		);
		key.push_str(self.op.prefix());
		key.push(KEY_JOIN);
		key.push_str(self.dom);
		key.push(KEY_JOIN);
		key.push_str(self.ns.prefix());
		key.push(KEY_JOIN);
		key.push_str(self.ns_part);
		key.push(KEY_JOIN);
		key.push_str(self.id);
		key.push(KEY_JOIN);
		key.push_str(self.id_part);
		key
	}

	/// Returns the same spec with a different operation.
	#[must_use]
	pub fn with_op(&self, op: Op) -> KeySpec<'a> {
		KeySpec { op, ..*self }
	}
}

/// Extracts one field from a rendered key.
///
/// The core field spans to the end of the key; all other fields end at the
/// next separator. Returns `None` when the key has too few fields.
#[must_use]
pub fn parse_part(key: &str, part: KeyPart) -> Option<&str> {
	key.splitn(7, KEY_JOIN).nth(part as usize)
}

/// Reads the operation from a rendered key's leading byte.
#[must_use]
pub fn op_from_key(key: &str) -> Op {
	match key.as_bytes().first() {
		Some(b'+') => Op::Plus,
		Some(b'-') => Op::Minus,
		_ => Op::Set,
	}
}

/// Reads the namespace field from a rendered key.
#[must_use]
pub fn ns_from_key(key: &str) -> Namespace {
	parse_part(key, KeyPart::Ns)
		.map(Namespace::from_prefix)
		.unwrap_or_default()
}

/// Strips the operation prefix from a rendered key, turning a `+`/`-` key
/// into its bare form.
#[must_use]
pub fn strip_op(key: &str) -> &str {
	match op_from_key(key) {
		Op::Plus | Op::Minus => &key[1..],
		_ => key,
	}
}

/// Canonicalizes a module name (`-` becomes `_`).
#[must_use]
pub fn canonicalize_module_name(name: &str) -> String {
	name.replace('-', "_")
}

/// Canonicalizes a `major:minor` device number into a key part
/// (`:` becomes `_`).
#[must_use]
pub fn canonicalize_dev_key(devno: &str) -> String {
	devno.trim().replace(':', "_")
}
