//! Resource tree description for the `resources` command.

use sid_proto::types::OutputFormat;

/// One node of the component tree.
#[derive(Debug, Clone)]
pub struct ResourceNode {
	/// Component kind, e.g. `ubridge` or `worker-proxy`.
	pub kind: &'static str,
	/// Instance id.
	pub id: String,
	/// Child components, destroyed before their parent.
	pub children: Vec<ResourceNode>,
}

impl ResourceNode {
	/// Creates a leaf node.
	#[must_use]
	pub fn new(kind: &'static str, id: impl Into<String>) -> Self {
		Self {
			kind,
			id: id.into(),
			children: Vec::new(),
		}
	}

	/// Appends a child, builder style.
	#[must_use]
	pub fn child(mut self, node: ResourceNode) -> Self {
		self.children.push(node);
		self
	}

	fn to_value(&self) -> serde_json::Value {
		serde_json::json!({
			"type": self.kind,
			"id": self.id,
			"children": self.children.iter().map(Self::to_value).collect::<Vec<_>>(),
		})
	}

	/// Renders the tree in the requested format.
	#[must_use]
	pub fn render(&self, format: OutputFormat) -> Vec<u8> {
		crate::fmt::render(format, &self.to_value())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tree_renders_nested() {
		let tree = ResourceNode::new("ubridge", "ubr").child(
			ResourceNode::new("common", "cmn").child(ResourceNode::new("kv-store", "main")),
		);

		let out = String::from_utf8(tree.render(OutputFormat::Table)).unwrap();
		assert!(out.contains("ubridge"));
		assert!(out.contains("kv-store"));

		let json = tree.render(OutputFormat::Json);
		let parsed: serde_json::Value = serde_json::from_slice(&json).unwrap();
		assert_eq!(parsed["children"][0]["children"][0]["id"], "main");
	}
}
