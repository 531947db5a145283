//! Output formatting for client-facing command results.
//!
//! Every result is built as a JSON value first; the table and env
//! renderings derive from the same structure.

use sid_kv::{KvFlags, Payload, Record};
use sid_proto::types::OutputFormat;

/// Renders a value in the requested output format.
#[must_use]
pub fn render(format: OutputFormat, value: &serde_json::Value) -> Vec<u8> {
	let mut out = match format {
		OutputFormat::Json => {
			serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
		}
		OutputFormat::Table => {
			let mut out = String::new();
			render_table(value, 0, &mut out);
			out
		}
		OutputFormat::Env => {
			let mut out = String::new();
			render_env(value, "", &mut out);
			out
		}
	};
	if !out.ends_with('\n') {
		out.push('\n');
	}
	out.into_bytes()
}

fn render_table(value: &serde_json::Value, level: usize, out: &mut String) {
	let indent = "  ".repeat(level);
	match value {
		serde_json::Value::Object(map) => {
			for (k, v) in map {
				match v {
					serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
						out.push_str(&format!("{indent}{k}:\n"));
						render_table(v, level + 1, out);
					}
					_ => out.push_str(&format!("{indent}{k}: {}\n", scalar_str(v))),
				}
			}
		}
		serde_json::Value::Array(items) => {
			for item in items {
				match item {
					serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
						render_table(item, level, out);
						out.push('\n');
					}
					_ => out.push_str(&format!("{indent}{}\n", scalar_str(item))),
				}
			}
		}
		_ => out.push_str(&format!("{indent}{}\n", scalar_str(value))),
	}
}

fn render_env(value: &serde_json::Value, prefix: &str, out: &mut String) {
	match value {
		serde_json::Value::Object(map) => {
			for (k, v) in map {
				let key = env_key(prefix, k);
				render_env(v, &key, out);
			}
		}
		serde_json::Value::Array(items) => {
			for (i, item) in items.iter().enumerate() {
				let key = env_key(prefix, &i.to_string());
				render_env(item, &key, out);
			}
		}
		_ => out.push_str(&format!("{prefix}={}\n", scalar_str(value))),
	}
}

fn env_key(prefix: &str, k: &str) -> String {
	let part = k.replace([' ', '-'], "_").to_uppercase();
	if prefix.is_empty() {
		part
	} else {
		format!("{prefix}_{part}")
	}
}

fn scalar_str(value: &serde_json::Value) -> String {
	match value {
		serde_json::Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

fn bytes_value(data: &[u8]) -> serde_json::Value {
	match std::str::from_utf8(data) {
		Ok(s) => serde_json::Value::String(s.to_string()),
		Err(_) => {
			let hex: String = data.iter().map(|b| format!("{b:02x}")).collect();
			serde_json::Value::String(format!("0x{hex}"))
		}
	}
}

/// One record rendered into the common dump structure.
#[must_use]
pub fn record_value(index: usize, key: &str, rec: &Record) -> serde_json::Value {
	let value = match &rec.payload {
		Payload::Scalar(data) => bytes_value(data),
		Payload::Vector(items) => {
			serde_json::Value::Array(items.iter().map(|i| bytes_value(i)).collect())
		}
	};

	serde_json::json!({
		"RECORD": index,
		"key": key,
		"gennum": rec.generation,
		"seqnum": rec.sequence,
		"flags": {
			"KV_SYNC": rec.flags.contains(KvFlags::SYNC),
			"KV_PERSISTENT": rec.flags.contains(KvFlags::PERSISTENT),
			"KV_MOD_PROTECTED": rec.flags.contains(KvFlags::MOD_PROTECTED),
			"KV_MOD_PRIVATE": rec.flags.contains(KvFlags::MOD_PRIVATE),
			"KV_MOD_RESERVED": rec.flags.contains(KvFlags::MOD_RESERVED),
		},
		"owner": rec.owner,
		"value": value,
	})
}

/// Accumulates formatted dump records into one document.
pub struct DumpWriter {
	format: OutputFormat,
	records: Vec<serde_json::Value>,
}

impl DumpWriter {
	/// Creates a writer for the requested format.
	#[must_use]
	pub fn new(format: OutputFormat) -> Self {
		Self {
			format,
			records: Vec::new(),
		}
	}

	/// Appends one record.
	pub fn record(&mut self, key: &str, rec: &Record) {
		let index = self.records.len();
		self.records.push(record_value(index, key, rec));
	}

	/// Renders the accumulated document.
	#[must_use]
	pub fn finish(self) -> Vec<u8> {
		let doc = serde_json::json!({ "siddb": self.records });
		render(self.format, &doc)
	}
}

/// Version block shared by the daemon and the tool.
#[must_use]
pub fn version_value(label: &str) -> serde_json::Value {
	serde_json::json!({
		label: {
			"SID_PROTOCOL": sid_proto::types::PROTOCOL,
			"SID_MAJOR": sid_proto::types::VERSION_MAJOR,
			"SID_MINOR": sid_proto::types::VERSION_MINOR,
			"SID_RELEASE": sid_proto::types::VERSION_RELEASE,
		}
	})
}

/// Store statistics block.
#[must_use]
pub fn dbstats_value(stats: &sid_kv::DbStats) -> serde_json::Value {
	serde_json::json!({
		"STATS": {
			"KEYS_SIZE": stats.key_size,
			"VALUES_SIZE": stats.value_size,
			"VALUES_DATA_SIZE": stats.value_data_size,
			"META_SIZE": stats.meta_size,
			"NR_KV_PAIRS": stats.nr_kv_pairs,
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn env_rendering_flattens() {
		let doc = serde_json::json!({"STATS": {"NR_KV_PAIRS": 3}});
		let out = String::from_utf8(render(OutputFormat::Env, &doc)).unwrap();
		assert_eq!(out, "STATS_NR_KV_PAIRS=3\n");
	}

	#[test]
	fn table_rendering_indents() {
		let doc = serde_json::json!({"a": {"b": "c"}});
		let out = String::from_utf8(render(OutputFormat::Table, &doc)).unwrap();
		assert_eq!(out, "a:\n  b: c\n");
	}

	#[test]
	fn json_rendering_is_valid() {
		let rec = Record::scalar(1, 2, KvFlags::SYNC, "m", b"v".to_vec());
		let mut writer = DumpWriter::new(OutputFormat::Json);
		writer.record("::U:8_0:::K", &rec);
		let out = writer.finish();

		let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
		assert_eq!(parsed["siddb"][0]["key"], "::U:8_0:::K");
		assert_eq!(parsed["siddb"][0]["flags"]["KV_SYNC"], true);
	}

	#[test]
	fn binary_values_render_as_hex() {
		let value = bytes_value(&[0xde, 0xad, 0xff]);
		assert_eq!(value, serde_json::Value::String("0xdeadff".into()));
	}
}
