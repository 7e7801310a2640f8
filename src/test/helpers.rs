//! Shared setup for scenario tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::env::{ExtinctPrefixes, LockTable, MemoryLog, NodeEnv, NodeHooks};
use crate::node::NodeRef;
use crate::options::Options;
use crate::tree::Tree;

pub type Action = Box<dyn FnOnce() + Send>;

/// Hooks that run a queued action inside the next unlatched fetch window.
#[derive(Default)]
pub struct InterleavingHooks {
	windows: AtomicUsize,
	action: Mutex<Option<Action>>,
	freeze_identifier_keys: bool,
}

impl InterleavingHooks {
	pub fn frozen_identifier_keys() -> Self {
		Self {
			freeze_identifier_keys: true,
			..Default::default()
		}
	}

	pub fn queue(&self, action: Action) {
		*self.action.lock() = Some(action);
	}

	pub fn windows(&self) -> usize {
		self.windows.load(Ordering::SeqCst)
	}
}

impl NodeHooks for InterleavingHooks {
	fn allow_identifier_key_update(&self) -> bool {
		!self.freeze_identifier_keys
	}

	fn fetch_window(&self, _parent_id: u64, _child_index: usize) {
		self.windows.fetch_add(1, Ordering::SeqCst);
		let action = self.action.lock().take();
		if let Some(action) = action {
			action();
		}
	}
}

/// Everything a scenario needs to poke at besides the tree itself.
pub struct Fixture {
	pub env: Arc<NodeEnv>,
	pub log: Arc<MemoryLog>,
	pub locks: Arc<LockTable>,
	pub extinct: Arc<ExtinctPrefixes>,
	pub hooks: Arc<InterleavingHooks>,
}

impl Fixture {
	pub fn new(options: Options) -> Self {
		Self::with_hooks(options, InterleavingHooks::default())
	}

	pub fn with_hooks(options: Options, hooks: InterleavingHooks) -> Self {
		let log = Arc::new(MemoryLog::new());
		let locks = Arc::new(LockTable::new());
		let extinct = Arc::new(ExtinctPrefixes::new());
		let hooks = Arc::new(hooks);
		let env = NodeEnv::builder(options, log.clone())
			.with_locks(locks.clone())
			.with_extinction(extinct.clone())
			.with_hooks(hooks.clone())
			.build()
			.unwrap();
		Self {
			env,
			log,
			locks,
			extinct,
			hooks,
		}
	}

	pub fn tree(&self) -> Tree {
		Tree::new(self.env.clone())
	}

	/// Writes `tree` out and opens a second tree over the same log, with
	/// nothing below the root resident.
	pub fn reopen(&self, tree: &Tree) -> Tree {
		let root_lsn = tree.checkpoint().unwrap();
		Tree::open(self.env.clone(), root_lsn).unwrap()
	}
}

pub fn key(i: usize) -> Vec<u8> {
	format!("key{i:04}").into_bytes()
}

pub fn value(i: usize) -> Vec<u8> {
	format!("value-{i:04}-padded-past-embedding").into_bytes()
}

pub fn fill(tree: &Tree, n: usize) {
	for i in 0..n {
		tree.put(&key(i), &value(i)).unwrap();
	}
}

/// Every cached node, latched one at a time.
pub fn cached_nodes(tree: &Tree) -> Vec<NodeRef> {
	tree.cache().ids().into_iter().filter_map(|id| tree.cache().get(id)).collect()
}
