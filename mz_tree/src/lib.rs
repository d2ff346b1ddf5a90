//! Implementation of a disk-based spatial index for mass spectrometry point clouds (mzTree).
//!
//! Intended for LC-MS datasets of billions of (m/z, retention time, intensity) points. Leaves
//! own contiguous blocks of a flat point file, internal nodes keep an intensity-aware summary of
//! their subtree, so a viewer can ask for "at most N representative points in this box" at a
//! cost bounded by tree depth rather than dataset size.
//!
//! Every point carries a trace label and traces can be grouped into isotopic envelopes. Labels
//! are edited through an undoable command log, and an intensity index hands out the most
//! intense unlabelled point for automatic segmentation.
//!
//! - [x] standard and partitioned construction
//! - [x] exact and level-of-detail range queries
//! - [x] trace/envelope labelling with undo
//! - [ ] concurrent readers across one shared tree
//!
pub mod error;
pub mod layout;
pub mod data;
pub mod io;
pub mod database;
pub mod cache;
pub mod summarize;
pub mod node;
pub mod tree;
pub mod intensity;
pub mod edit_log;
pub mod source;
pub mod export;
pub mod progress;
pub mod connection;
