use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;

use crate::node::NodeRef;

/// Resident nodes by id.
///
/// Nodes refer to their parent by id only, and the cache is where such an
/// id is turned back into a node. Dropping the last handle of an evicted node
/// returns its memory to the budget.
#[derive(Default)]
pub struct NodeCache {
	nodes: RwLock<HashMap<u64, NodeRef>>,
}

impl NodeCache {
	pub fn new() -> Self {
		Self {
			nodes: RwLock::new(HashMap::new()),
		}
	}

	pub fn len(&self) -> usize {
		self.nodes.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn insert(&self, node: NodeRef) {
		self.nodes.write().insert(node.id(), node);
	}

	pub fn get(&self, id: u64) -> Option<NodeRef> {
		self.nodes.read().get(&id).cloned()
	}

	pub fn remove(&self, id: u64) -> Option<NodeRef> {
		self.nodes.write().remove(&id)
	}

	/// Ids of the cached nodes, BINs first.
	pub fn ids(&self) -> Vec<u64> {
		let nodes = self.nodes.read();
		let mut ids: Vec<(bool, u64)> = nodes.values().map(|n| (!n.is_bin(), n.id())).collect();
		ids.sort_unstable();
		ids.into_iter().map(|(_, id)| id).collect()
	}

	pub fn bins(&self) -> Vec<NodeRef> {
		self.nodes.read().values().filter(|n| n.is_bin()).cloned().collect()
	}
}

impl std::fmt::Debug for NodeCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NodeCache").field("len", &self.len()).finish()
	}
}
