//! Tree verification.
//!
//! A verification pass walks every node reachable from the root, reading
//! non-resident nodes and records from the log without caching them. Problems
//! are collected instead of failing the pass, so one damaged entry does not
//! hide the rest.

use std::fmt;

use log::{debug, warn};

use crate::error::Error;
use crate::ln::Ln;
use crate::lsn::{Lsn, NULL_LSN};
use crate::node::Node;
use crate::tree::Tree;

#[derive(Clone, Debug)]
pub struct VerifyError {
	pub node_id: u64,
	/// Slot of the entry that failed, if the problem is not the node itself.
	pub slot: Option<usize>,
	pub lsn: Lsn,
	pub error: Error,
}

impl fmt::Display for VerifyError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.slot {
			Some(slot) => {
				write!(f, "node {} slot {} at {}: {}", self.node_id, slot, self.lsn, self.error)
			}
			None => write!(f, "node {} at {}: {}", self.node_id, self.lsn, self.error),
		}
	}
}

#[derive(Debug, Default)]
pub struct VerifyReport {
	pub nodes: usize,
	/// Live records checked.
	pub records: usize,
	pub errors: Vec<VerifyError>,
}

impl VerifyReport {
	pub fn is_ok(&self) -> bool {
		self.errors.is_empty()
	}

	fn push(&mut self, node: &Node, slot: Option<usize>, lsn: Lsn, error: Error) {
		warn!("verify: node {} slot {:?} at {lsn}: {error}", node.id(), slot);
		self.errors.push(VerifyError {
			node_id: node.id(),
			slot,
			lsn,
			error,
		});
	}
}

impl Tree {
	/// Checks slot order, identifier keys, memory counters and log
	/// readability for the whole tree.
	pub fn verify(&self) -> VerifyReport {
		let mut report = VerifyReport::default();
		let root = self.root_node();
		let guard = root.latch_shared();
		self.verify_node(&guard, true, &mut report);
		drop(guard);
		debug!(
			"verified {} nodes and {} records, {} errors",
			report.nodes,
			report.records,
			report.errors.len()
		);
		report
	}

	fn verify_node(&self, node: &Node, resident: bool, report: &mut VerifyReport) {
		report.nodes += 1;
		if let Err(e) = node.check_order() {
			report.push(node, None, node.last_full_lsn(), e);
		}
		if resident {
			if let Err(e) = node.verify_memory_size() {
				report.push(node, None, NULL_LSN, e);
			}
		}
		if node.is_bin() {
			self.verify_records(node, report);
			return;
		}
		for idx in 0..node.n_entries() {
			let lsn = node.lsn(idx);
			if let Some(child) = node.child(idx) {
				let guard = child.latch_shared();
				self.verify_child_key(node, idx, &guard, report);
				self.verify_node(&guard, true, report);
				continue;
			}
			match Node::fetch(&self.env, lsn) {
				Ok(child) => {
					self.verify_child_key(node, idx, &child, report);
					self.verify_node(&child, false, report);
				}
				Err(e) => report.push(node, Some(idx), lsn, e),
			}
		}
	}

	/// A child's identifier key must route back to the slot referring to it.
	fn verify_child_key(&self, parent: &Node, idx: usize, child: &Node, report: &mut VerifyReport) {
		if child.n_entries() == 0 {
			return;
		}
		let routed = parent.find_entry(child.identifier_key(), false).map(|f| f.index);
		if routed != Some(idx) {
			let error = Error::Corruption(format!(
				"identifier key of node {} routes to slot {routed:?}, not {idx}",
				child.id()
			));
			report.push(parent, Some(idx), parent.lsn(idx), error);
		}
	}

	fn verify_records(&self, bin: &Node, report: &mut VerifyReport) {
		let now = self.env.now_millis();
		for idx in 0..bin.n_entries() {
			if bin.is_known_deleted(idx) {
				continue;
			}
			report.records += 1;
			if bin.is_embedded(idx) || bin.record(idx).is_some() {
				continue;
			}
			let lsn = bin.lsn(idx);
			if let Err(e) = Ln::fetch(&self.env, lsn) {
				let absent = bin.is_defunct(idx, now) || self.env.is_extinct(&bin.key(idx));
				if e.is_log_integrity() && absent {
					continue;
				}
				report.push(bin, Some(idx), lsn, e);
			}
		}
	}
}
