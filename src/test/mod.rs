//! Scenario tests for the node layer
//!
//! These drive nodes and trees through whole workflows: inserts and splits,
//! delta logging and merging, compression against live locks, eviction, and
//! reads that race with changes to the parent node.

#[cfg(test)]
pub mod helpers;
#[cfg(test)]
pub mod tree_tests;
