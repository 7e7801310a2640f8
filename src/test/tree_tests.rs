use std::sync::Arc;
use std::thread;

use test_log::test;

use crate::env::EntryKind;
use crate::error::Error;
use crate::node::{Node, SlotState};
use crate::options::Options;
use crate::test::helpers::{cached_nodes, fill, key, value, Fixture, InterleavingHooks};
use crate::tree::DeleteMode;

#[test]
fn small_bin_through_the_tree() {
	let fx = Fixture::new(Options::default().with_max_entries(4));
	let tree = fx.tree();
	for k in [b"b", b"d", b"f", b"a"] {
		tree.put(k, k).unwrap();
	}
	{
		let root = tree.root_node();
		let bin = root.latch_exclusive();
		assert!(bin.is_bin());
		assert_eq!(bin.n_entries(), 4);
		assert_eq!(bin.key(0), b"a");
	}
	assert!(tree.delete(b"d", DeleteMode::Committed).unwrap());
	let stats = tree.compress_all().unwrap();
	assert_eq!(stats.removed, 1);
	assert_eq!(stats.incomplete, 0);
	let bin = tree.find_bin(b"a").unwrap();
	let keys: Vec<Vec<u8>> = (0..bin.n_entries()).map(|i| bin.key(i)).collect();
	assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"f".to_vec()]);
}

#[test]
fn stale_parent_restarts_descent() {
	let fx = Fixture::new(Options::default().with_max_entries(4));
	let tree = fx.tree();
	fill(&tree, 24);
	let reopened = fx.reopen(&tree);
	let root = reopened.root_node();
	assert!(!root.is_bin());
	let idx = root.latch_shared().find_entry(&key(0), false).unwrap().index;

	// Re-log the child the read is about to fetch and point the root at the
	// new copy while the root latch is released.
	let env = fx.env.clone();
	let parent = root.clone();
	fx.hooks.queue(Box::new(move || {
		let mut parent = parent.latch_exclusive();
		let mut child = Node::fetch(&env, parent.lsn(idx)).unwrap();
		let pos = child.log(true, false).unwrap();
		parent.update_slot_lsn(idx, pos.lsn, pos.size);
	}));

	let windows = fx.hooks.windows();
	assert_eq!(reopened.get(&key(0)).unwrap(), Some(value(0).into()));
	assert_eq!(reopened.restarts(), 1);
	assert!(fx.hooks.windows() >= windows + 2);
}

#[test]
fn unreadable_records_are_classified() {
	let options = Options::default().with_max_embedded_ln(0).with_database_id(3);
	let fx = Fixture::new(options);
	let tree = fx.tree();
	for k in [&b"a"[..], b"b", b"c", b"gone/x"] {
		tree.put(k, b"data").unwrap();
	}
	let reopened = fx.reopen(&tree);
	let lsn_of = |k: &[u8]| {
		let bin = reopened.find_bin(k).unwrap();
		bin.lsn(bin.find_entry(k, true).unwrap().index)
	};

	// live record: the log is damaged
	assert!(fx.log.corrupt(lsn_of(b"a")));
	let err = reopened.get(b"a").unwrap_err();
	assert!(matches!(err, Error::Corruption(_)), "{err}");
	assert!(err.is_fatal());

	assert!(fx.log.remove(lsn_of(b"c")));
	assert!(matches!(reopened.get(b"c"), Err(Error::Corruption(_))));

	// deleted or extinct records: simply absent
	assert!(reopened.delete(b"b", DeleteMode::Pending).unwrap());
	assert!(fx.log.corrupt(lsn_of(b"b")));
	assert_eq!(reopened.get(b"b").unwrap(), None);
	// the prefix dies after the last full write, so the slot is still there
	let gone = lsn_of(b"gone/x");
	fx.extinct.add(3, b"gone/");
	assert!(fx.log.corrupt(gone));
	assert_eq!(reopened.get(b"gone/x").unwrap(), None);
}

#[test]
fn budget_matches_cached_nodes() {
	let fx = Fixture::new(Options::default().with_max_entries(4));
	let tree = fx.tree();
	fill(&tree, 60);
	tree.checkpoint().unwrap();
	for id in tree.cache().ids() {
		tree.partial_evict(id).unwrap();
	}
	let bins: Vec<u64> = tree.cache().bins().iter().map(|n| n.id()).take(5).collect();
	for id in bins {
		assert!(tree.evict_node(id).unwrap());
	}
	tree.get(&key(30)).unwrap();

	let sum: i64 = cached_nodes(&tree)
		.iter()
		.map(|n| {
			let node = n.latch_exclusive();
			node.verify_memory_size().unwrap();
			node.memory_size() as i64
		})
		.sum();
	assert_eq!(fx.env.budget().total(), sum);
}

#[test]
fn evicted_tree_still_verifies() {
	let fx = Fixture::new(Options::default().with_max_entries(4));
	let tree = fx.tree();
	fill(&tree, 40);
	tree.checkpoint().unwrap();
	loop {
		let mut evicted = 0;
		for id in tree.cache().ids() {
			if tree.evict_node(id).unwrap() {
				evicted += 1;
			}
		}
		if evicted == 0 {
			break;
		}
	}
	assert_eq!(tree.cache().len(), 1);

	let report = tree.verify();
	assert!(report.is_ok(), "{:?}", report.errors);
	assert_eq!(report.records, 40);
	for i in 0..40 {
		assert_eq!(tree.get(&key(i)).unwrap(), Some(value(i).into()));
	}
}

#[test]
fn blind_insert_into_delta() {
	let fx = Fixture::new(Options::default().with_max_entries(32).with_bin_delta_percent(25));
	let tree = fx.tree();
	for i in 0..20 {
		tree.put(&key(i * 2), &value(i * 2)).unwrap();
	}
	tree.checkpoint().unwrap();
	tree.put(&key(4), b"changed").unwrap();
	assert!(tree.mutate_to_delta(tree.root_node().id()).unwrap());

	let candidate = (0..20)
		.map(|i| key(i * 2 + 1))
		.find(|k| tree.find_bin(k).unwrap().definitely_absent_from_full(k))
		.unwrap();
	tree.put(&candidate, b"blind").unwrap();
	{
		let bin = tree.find_bin(&candidate).unwrap();
		assert!(bin.is_delta());
		assert_eq!(bin.n_entries(), 2);
	}
	assert_eq!(tree.get(&candidate).unwrap().as_deref(), Some(&b"blind"[..]));

	let deltas = fx.log.count(EntryKind::BinDelta);
	tree.checkpoint().unwrap();
	assert_eq!(fx.log.count(EntryKind::BinDelta), deltas + 1);

	// a key only the full version has forces a merge
	assert_eq!(tree.get(&key(6)).unwrap(), Some(value(6).into()));
	assert!(!tree.find_bin(&key(6)).unwrap().is_delta());
	assert_eq!(tree.get(&key(4)).unwrap().as_deref(), Some(&b"changed"[..]));
	assert_eq!(tree.get(&candidate).unwrap().as_deref(), Some(&b"blind"[..]));
}

/// Deletes the first key of a BIN that is not the first child of its parent
/// and compresses. Returns the parent's slot key before, the slot key after
/// the next checkpoint and the BIN's new first key.
fn compress_first_key(fx: &Fixture) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
	let tree = fx.tree();
	fill(&tree, 12);
	let bin = tree.find_bin(&key(7)).unwrap().node_ref().clone();
	let (parent, idx) = tree.latch_parent(&bin).unwrap().unwrap();
	assert!(idx > 0);
	let before = parent.key(idx);
	let (first, second) = {
		let guard = bin.latch_exclusive();
		(guard.key(0), guard.key(1))
	};
	drop(parent);
	assert_eq!(before, first);

	assert!(tree.delete(&first, DeleteMode::Committed).unwrap());
	assert_eq!(tree.compress_all().unwrap().removed, 1);
	{
		let (parent, at) = tree.latch_parent(&bin).unwrap().unwrap();
		assert_eq!(at, idx);
		assert!(parent.state(idx).contains(SlotState::UPDATE_KEY_ON_LOG));
	}
	tree.checkpoint().unwrap();
	let (parent, _) = tree.latch_parent(&bin).unwrap().unwrap();
	assert!(!parent.state(idx).contains(SlotState::UPDATE_KEY_ON_LOG));
	(before, parent.key(idx), second)
}

#[test]
fn compressed_first_key_raises_parent_key() {
	let fx = Fixture::new(Options::default().with_max_entries(4));
	let (_, after, second) = compress_first_key(&fx);
	assert_eq!(after, second);
}

#[test]
fn frozen_identifier_keeps_parent_key() {
	let fx = Fixture::with_hooks(
		Options::default().with_max_entries(4),
		InterleavingHooks::frozen_identifier_keys(),
	);
	let (before, after, _) = compress_first_key(&fx);
	assert_eq!(after, before);
}

#[test]
fn locked_delete_survives_compression() {
	let fx = Fixture::new(Options::default().with_max_entries(8));
	let tree = fx.tree();
	fill(&tree, 6);
	assert!(tree.delete(&key(2), DeleteMode::Committed).unwrap());
	assert!(tree.delete(&key(3), DeleteMode::Committed).unwrap());
	let lsn = {
		let bin = tree.find_bin(&key(2)).unwrap();
		bin.lsn(bin.find_entry(&key(2), true).unwrap().index)
	};
	fx.locks.lock(lsn);

	let stats = tree.compress_all().unwrap();
	assert_eq!(stats.removed, 1);
	assert_eq!(stats.incomplete, 1);
	assert!(tree.find_bin(&key(2)).unwrap().find_entry(&key(2), true).is_some());

	fx.locks.unlock(lsn);
	let stats = tree.compress_all().unwrap();
	assert_eq!(stats.removed, 1);
	assert_eq!(stats.incomplete, 0);
}

#[test]
fn concurrent_traffic_with_eviction_and_checkpoints() {
	let fx = Fixture::new(Options::default().with_max_entries(8).with_bin_delta_percent(50));
	let tree = Arc::new(fx.tree());
	let writers = 3;
	let per_writer = 200;
	let mut handles = vec![];

	for w in 0..writers {
		let tree = Arc::clone(&tree);
		handles.push(thread::spawn(move || {
			for i in (w * per_writer)..((w + 1) * per_writer) {
				tree.put(&key(i), &value(i)).unwrap();
				assert_eq!(tree.get(&key(i)).unwrap(), Some(value(i).into()));
				if i % 7 == 0 {
					let earlier = i - i % per_writer / 2;
					assert_eq!(tree.get(&key(earlier)).unwrap(), Some(value(earlier).into()));
				}
			}
		}));
	}

	let maintenance = {
		let tree = Arc::clone(&tree);
		thread::spawn(move || {
			for _ in 0..30 {
				tree.checkpoint().unwrap();
				for id in tree.cache().ids() {
					tree.mutate_to_delta(id).unwrap();
					tree.evict_node(id).unwrap();
				}
				thread::yield_now();
			}
		})
	};

	for h in handles {
		h.join().unwrap();
	}
	maintenance.join().unwrap();

	for i in 0..writers * per_writer {
		assert_eq!(tree.get(&key(i)).unwrap(), Some(value(i).into()), "key {i}");
	}
	let report = tree.verify();
	assert!(report.is_ok(), "{:?}", report.errors);
	assert_eq!(report.records, writers * per_writer);
}
