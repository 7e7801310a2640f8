use std::sync::Arc;

use btnode::{MemoryLog, Node, NodeEnv, Options, SlotEntry, Tree, NULL_LSN};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::seq::SliceRandom;

fn env(options: Options) -> Arc<NodeEnv> {
	NodeEnv::builder(options, Arc::new(MemoryLog::new())).build().unwrap()
}

fn generate_keys(size: usize) -> Vec<Vec<u8>> {
	(0..size).map(|i| format!("key{i:010}").into_bytes()).collect()
}

fn benchmark_tree_put(c: &mut Criterion) {
	let mut group = c.benchmark_group("tree_put");

	for size in [1000, 10000].iter() {
		group.throughput(Throughput::Elements(*size as u64));

		group.bench_with_input(BenchmarkId::new("sequential", size), size, |b, &size| {
			let keys = generate_keys(size);
			b.iter(|| {
				let tree = Tree::new(env(Options::default()));
				for key in &keys {
					tree.put(black_box(key), black_box(b"value")).unwrap();
				}
			});
		});

		group.bench_with_input(BenchmarkId::new("random", size), size, |b, &size| {
			let mut keys = generate_keys(size);
			keys.shuffle(&mut rand::rng());
			b.iter(|| {
				let tree = Tree::new(env(Options::default()));
				for key in &keys {
					tree.put(black_box(key), black_box(b"value")).unwrap();
				}
			});
		});
	}

	group.finish();
}

fn benchmark_tree_get(c: &mut Criterion) {
	let mut group = c.benchmark_group("tree_get");
	let size = 10000;
	let keys = generate_keys(size);
	let tree = Tree::new(env(Options::default()));
	for key in &keys {
		tree.put(key, b"value").unwrap();
	}
	group.throughput(Throughput::Elements(size as u64));
	group.bench_function("resident", |b| {
		b.iter(|| {
			for key in &keys {
				black_box(tree.get(key).unwrap());
			}
		});
	});
	group.finish();
}

fn benchmark_bin_search(c: &mut Criterion) {
	let mut group = c.benchmark_group("bin_find_entry");

	for compact in [0, 16] {
		let options = Options::default().with_compact_max_key_length(compact);
		let mut bin = Node::new_bin(env(options), Vec::new());
		let keys = generate_keys(128);
		for key in &keys {
			bin.insert_entry(SlotEntry::new(key.clone(), NULL_LSN)).unwrap();
		}
		if compact > 0 {
			bin.compact_memory();
		}
		group.bench_function(BenchmarkId::new("compact_key_len", compact), |b| {
			b.iter(|| {
				for key in &keys {
					black_box(bin.find_entry(black_box(key), true));
				}
			});
		});
	}

	group.finish();
}

fn benchmark_bin_log(c: &mut Criterion) {
	let mut group = c.benchmark_group("bin_log");
	let e = env(Options::default().with_bin_delta_percent(50));
	let mut bin = Node::new_bin(e, Vec::new());
	for key in generate_keys(128) {
		bin.insert_entry(SlotEntry::new(key, NULL_LSN)).unwrap();
	}
	bin.log(false, false).unwrap();

	group.bench_function("full", |b| {
		b.iter(|| {
			bin.prohibit_next_delta();
			black_box(bin.log(false, true).unwrap());
		});
	});
	group.bench_function("delta", |b| {
		b.iter(|| {
			for i in (0..128).step_by(8) {
				bin.set_known_deleted(i);
			}
			black_box(bin.log(false, true).unwrap());
		});
	});

	group.finish();
}

criterion_group!(
	benches,
	benchmark_tree_put,
	benchmark_tree_get,
	benchmark_bin_search,
	benchmark_bin_log
);
criterion_main!(benches);
