//! Comparator implementations for key ordering.

use std::cmp::Ordering;

/// A trait for comparing keys stored in tree nodes.
///
/// Nodes may strip a shared prefix from every stored key, so the comparator is
/// also asked to compare a search key against a key given in two parts.
pub trait Comparator: Send + Sync {
	/// Compares two keys `a` and `b`.
	fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

	/// Compares `search` against the key formed by `prefix` followed by
	/// `suffix`.
	///
	/// The default implementation materializes the full key. Comparators that
	/// are plain byte orders can override it to avoid the allocation.
	fn compare_prefixed(&self, search: &[u8], prefix: &[u8], suffix: &[u8]) -> Ordering {
		if prefix.is_empty() {
			return self.compare(search, suffix);
		}
		let mut full = Vec::with_capacity(prefix.len() + suffix.len());
		full.extend_from_slice(prefix);
		full.extend_from_slice(suffix);
		self.compare(search, &full)
	}

	/// Retrieves the name of the comparator.
	fn name(&self) -> &str;
}

/// A bytewise comparator that compares keys lexicographically.
#[derive(Default, Clone, Copy)]
pub struct BytewiseComparator {}

impl Comparator for BytewiseComparator {
	#[inline]
	fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
		a.cmp(b)
	}

	#[inline]
	fn compare_prefixed(&self, search: &[u8], prefix: &[u8], suffix: &[u8]) -> Ordering {
		let head = search.len().min(prefix.len());
		match search[..head].cmp(&prefix[..head]) {
			Ordering::Equal => {}
			ord => return ord,
		}
		if search.len() < prefix.len() {
			// search is a proper prefix of the stored key
			return Ordering::Less;
		}
		search[prefix.len()..].cmp(suffix)
	}

	#[inline]
	fn name(&self) -> &'static str {
		"btnode.BytewiseComparator"
	}
}

/// Returns the length of the longest common prefix of `a` and `b`.
pub(crate) fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
	a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
	use test_log::test;

	use super::*;

	struct Reverse;

	impl Comparator for Reverse {
		fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
			b.cmp(a)
		}

		fn name(&self) -> &str {
			"reverse"
		}
	}

	#[test]
	fn bytewise_prefixed_matches_full_compare() {
		let c = BytewiseComparator::default();
		let cases: &[(&[u8], &[u8], &[u8])] = &[
			(b"apple", b"app", b"le"),
			(b"app", b"app", b"le"),
			(b"ap", b"app", b"le"),
			(b"apricot", b"app", b"le"),
			(b"b", b"app", b""),
			(b"", b"", b""),
			(b"applesauce", b"app", b"le"),
		];
		for (search, prefix, suffix) in cases {
			let mut full = prefix.to_vec();
			full.extend_from_slice(suffix);
			assert_eq!(
				c.compare_prefixed(search, prefix, suffix),
				c.compare(search, &full),
				"search={search:?} prefix={prefix:?} suffix={suffix:?}"
			);
		}
	}

	#[test]
	fn default_prefixed_uses_custom_order() {
		let c = Reverse;
		assert_eq!(c.compare_prefixed(b"ab", b"a", b"c"), Ordering::Greater);
		assert_eq!(c.compare_prefixed(b"ac", b"a", b"c"), Ordering::Equal);
	}

	#[test]
	fn common_prefix() {
		assert_eq!(common_prefix_len(b"abcd", b"abxy"), 2);
		assert_eq!(common_prefix_len(b"abc", b"abc"), 3);
		assert_eq!(common_prefix_len(b"", b"abc"), 0);
	}
}
