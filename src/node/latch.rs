//! Node latches.
//!
//! Every cached node sits behind a reader/writer latch. Guards own a clone of
//! the node handle, so a guard can outlive the borrow it was created from and
//! latch coupling can hand a child guard up while the parent guard drops.
//! BINs only support exclusive latching.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};

use super::Node;

/// Marks "no parent" in [`NodeRef::parent_id`].
pub const NO_PARENT: u64 = 0;

pub(crate) struct NodeCell {
	id: u64,
	bin: bool,
	// Id of the IN whose slot refers to this node. Not an owning reference.
	parent: AtomicU64,
	latch: Arc<RwLock<Node>>,
}

/// Shared handle to a cached node.
#[derive(Clone)]
pub struct NodeRef(Arc<NodeCell>);

impl NodeRef {
	pub fn new(node: Node) -> Self {
		NodeRef(Arc::new(NodeCell {
			id: node.id,
			bin: node.is_bin(),
			parent: AtomicU64::new(NO_PARENT),
			latch: Arc::new(RwLock::new(node)),
		}))
	}

	pub fn id(&self) -> u64 {
		self.0.id
	}

	pub fn is_bin(&self) -> bool {
		self.0.bin
	}

	pub fn parent_id(&self) -> u64 {
		self.0.parent.load(Ordering::Acquire)
	}

	/// Only called with the new parent latched exclusively.
	pub(crate) fn set_parent_id(&self, parent: u64) {
		self.0.parent.store(parent, Ordering::Release);
	}

	pub fn ptr_eq(&self, other: &NodeRef) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}

	/// Latches for reading. BINs are latched exclusively instead.
	pub fn latch_shared(&self) -> NodeGuard {
		if self.is_bin() {
			NodeGuard::Exclusive(self.latch_exclusive())
		} else {
			NodeGuard::Shared(SharedGuard {
				guard: self.0.latch.read_arc(),
				node: self.clone(),
			})
		}
	}

	pub fn latch_exclusive(&self) -> ExclusiveGuard {
		ExclusiveGuard {
			guard: self.0.latch.write_arc(),
			node: self.clone(),
		}
	}

	/// Latches exclusively if nobody else holds the latch.
	pub fn try_latch_exclusive(&self) -> Option<ExclusiveGuard> {
		self.0.latch.try_write_arc().map(|guard| ExclusiveGuard {
			guard,
			node: self.clone(),
		})
	}

	pub fn is_latched(&self) -> bool {
		self.0.latch.is_locked()
	}
}

impl fmt::Debug for NodeRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("NodeRef")
			.field("id", &self.0.id)
			.field("bin", &self.0.bin)
			.field("parent", &self.parent_id())
			.finish()
	}
}

pub struct SharedGuard {
	guard: ArcRwLockReadGuard<RawRwLock, Node>,
	node: NodeRef,
}

impl SharedGuard {
	pub fn node_ref(&self) -> &NodeRef {
		&self.node
	}
}

impl Deref for SharedGuard {
	type Target = Node;

	fn deref(&self) -> &Node {
		&self.guard
	}
}

pub struct ExclusiveGuard {
	guard: ArcRwLockWriteGuard<RawRwLock, Node>,
	node: NodeRef,
}

impl ExclusiveGuard {
	pub fn node_ref(&self) -> &NodeRef {
		&self.node
	}
}

impl Deref for ExclusiveGuard {
	type Target = Node;

	fn deref(&self) -> &Node {
		&self.guard
	}
}

impl DerefMut for ExclusiveGuard {
	fn deref_mut(&mut self) -> &mut Node {
		&mut self.guard
	}
}

/// A latch held in either mode.
pub enum NodeGuard {
	Shared(SharedGuard),
	Exclusive(ExclusiveGuard),
}

impl NodeGuard {
	pub fn node_ref(&self) -> &NodeRef {
		match self {
			NodeGuard::Shared(g) => g.node_ref(),
			NodeGuard::Exclusive(g) => g.node_ref(),
		}
	}

	pub fn is_exclusive(&self) -> bool {
		matches!(self, NodeGuard::Exclusive(_))
	}
}

impl Deref for NodeGuard {
	type Target = Node;

	fn deref(&self) -> &Node {
		match self {
			NodeGuard::Shared(g) => g,
			NodeGuard::Exclusive(g) => g,
		}
	}
}
