// backuptool/src/restore/mod.rs
//! Restore workflow: hands the cluster manager a restore directive and
//! rebuilds the cluster identity around the restored data.

mod logic;
