//! Status reporting for long running tree operations
//!
//! `build` and `open` take a callback and call it whenever the phase or the amount of finished
//! work changes, so a caller can drive a progress bar without the tree knowing about it.

use serde::{Serialize, Deserialize};

use std::fmt;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum BuildStatus {
    None,
    Parsing,
    Converting,
    Indexing,
    Writing,
    Error,
    LoadingTree,
    Ready,
}

impl fmt::Display for BuildStatus {

    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {

        let label = match self {
            BuildStatus::None => "No file loaded",
            BuildStatus::Parsing => "Reading points",
            BuildStatus::Converting => "Building tree",
            BuildStatus::Indexing => "Indexing intensities",
            BuildStatus::Writing => "Saving tree",
            BuildStatus::Error => "Error",
            BuildStatus::LoadingTree => "Loading tree",
            BuildStatus::Ready => "Ready",
        };

        write!(f, "{}", label)
    }
}

#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct Progress {
    pub status: BuildStatus,
    pub work_done: u64,
    pub total_work: u64,
}

impl Progress {

    pub fn new(status: BuildStatus, work_done: u64, total_work: u64) -> Self {

        return Self { status, work_done, total_work };
    }

    /// Finished fraction of the current phase, 0 when the phase has no known size
    pub fn fraction(&self) -> f64 {

        if self.total_work == 0 {
            return 0.0;
        }
        return self.work_done as f64 / self.total_work as f64;
    }
}

impl fmt::Display for Progress {

    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}/{})", self.status, self.work_done, self.total_work)
    }
}

pub type ProgressFn<'a> = dyn FnMut(&Progress) + 'a;

/// Callback that ignores every report
pub fn ignore(_: &Progress) {}

/// Tracks the current phase of an operation and forwards every change to a callback
pub struct Reporter<'a, 'b> {
    callback: &'a mut ProgressFn<'b>,
    current: Progress,
}

impl<'a, 'b> Reporter<'a, 'b> {

    pub fn new(callback: &'a mut ProgressFn<'b>) -> Self {

        return Self {
            callback,
            current: Progress::new(BuildStatus::None, 0, 0),
        };
    }

    /// Starts a new phase of `total_work` units
    pub fn phase(&mut self, status: BuildStatus, total_work: u64) {

        self.current = Progress::new(status, 0, total_work);
        (self.callback)(&self.current);
    }

    pub fn advance(&mut self, work: u64) {

        self.current.work_done += work;
        (self.callback)(&self.current);
    }

    pub fn current(&self) -> Progress {
        return self.current;
    }
}
