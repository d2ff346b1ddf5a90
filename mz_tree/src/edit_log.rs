//! Undoable label edits
//!
//! Every command carries the label state it replaces, captured when the command is created.
//! All points (or traces) a command targets are assumed to share one prior trace (or envelope),
//! callers are responsible for keeping it that way.

use log::{debug, warn};

use std::collections::VecDeque;

use crate::data::{DataRange, EnvelopeId, PointId, TraceId, LEGACY_NO_TRACE, NO_ENVELOPE, NO_TRACE};
use crate::error::{Error, Result};
use crate::tree::Tree;

/// Commands kept for undo, the oldest is dropped beyond this
pub const MAX_UNDO_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Points of a box moved from `from_trace` to `to_trace`
    ReassignRegion {
        point_ids: Vec<PointId>,
        from_trace: TraceId,
        to_trace: TraceId,
        creates_trace: bool,
    },
    /// An explicit set of points moved from `old_trace` to `new_trace`
    ReassignPoints {
        point_ids: Vec<PointId>,
        old_trace: TraceId,
        new_trace: TraceId,
        creates_trace: bool,
    },
    ReassignEnvelope {
        trace_ids: Vec<TraceId>,
        old_envelope: EnvelopeId,
        new_envelope: EnvelopeId,
    },
}

impl Command {

    /// Adds every untraced point of `range` to `trace_id`, or with `is_add == false` removes
    /// every point of `range` in `trace_id` from it
    pub fn reassign_region(tree: &mut Tree, trace_id: TraceId, range: &DataRange, is_add: bool) -> Result<Self> {

        let (from_trace, to_trace) = match is_add {
            true => (NO_TRACE, trace_id),
            false => (trace_id, NO_TRACE),
        };

        let point_ids: Vec<PointId> = tree.query_range(range)?
            .iter()
            .filter(|p| p.trace_id == from_trace || (from_trace == NO_TRACE && p.trace_id == LEGACY_NO_TRACE))
            .map(|p| p.id)
            .collect();

        let creates_trace = is_add && !tree.trace_map().contains_key(&to_trace);

        return Ok(Command::ReassignRegion { point_ids, from_trace, to_trace, creates_trace });
    }

    /// Moves `point_ids` into `new_trace`, creating the trace if it does not exist yet
    pub fn reassign_points(tree: &mut Tree, new_trace: TraceId, point_ids: &[PointId]) -> Result<Self> {

        //one prior trace for the whole set, read off its first point
        let old_trace = match point_ids.first() {
            Some(id) => tree.point(*id)?.trace_id,
            None => NO_TRACE,
        };

        let creates_trace = !tree.trace_map().contains_key(&new_trace);

        return Ok(Command::ReassignPoints { point_ids: point_ids.to_vec(), old_trace, new_trace, creates_trace });
    }

    pub fn reassign_envelope(tree: &Tree, new_envelope: EnvelopeId, trace_ids: &[TraceId]) -> Self {

        let old_envelope = trace_ids.first()
            .and_then(|id| tree.trace_map().get(id).copied())
            .unwrap_or(NO_ENVELOPE);

        return Command::ReassignEnvelope { trace_ids: trace_ids.to_vec(), old_envelope, new_envelope };
    }

    pub fn apply(&self, tree: &mut Tree) -> Result<()> {

        match self {
            Command::ReassignRegion { point_ids, to_trace, creates_trace, .. } => {
                move_points(tree, point_ids, *to_trace, *creates_trace)
            },
            Command::ReassignPoints { point_ids, new_trace, creates_trace, .. } => {
                move_points(tree, point_ids, *new_trace, *creates_trace)
            },
            Command::ReassignEnvelope { trace_ids, new_envelope, .. } => {
                tree.update_envelopes(*new_envelope, trace_ids)
            },
        }
    }

    pub fn revert(&self, tree: &mut Tree) -> Result<()> {

        match self {
            Command::ReassignRegion { point_ids, from_trace, to_trace, creates_trace } => {
                restore_points(tree, point_ids, *from_trace, *to_trace, *creates_trace)
            },
            Command::ReassignPoints { point_ids, old_trace, new_trace, creates_trace } => {
                restore_points(tree, point_ids, *old_trace, *new_trace, *creates_trace)
            },
            Command::ReassignEnvelope { trace_ids, old_envelope, .. } => {
                tree.update_envelopes(*old_envelope, trace_ids)
            },
        }
    }
}

fn move_points(tree: &mut Tree, point_ids: &[PointId], trace_id: TraceId, creates_trace: bool) -> Result<()> {

    if creates_trace {
        tree.insert_trace(trace_id, NO_ENVELOPE)?;
    }

    return tree.update_traces(trace_id, point_ids);
}

fn restore_points(tree: &mut Tree, point_ids: &[PointId], old_trace: TraceId, created_trace: TraceId, creates_trace: bool) -> Result<()> {

    tree.update_traces(old_trace, point_ids)?;

    if creates_trace {
        tree.delete_trace(created_trace)?;
    }

    Ok(())
}

/// Undo and redo logs of executed label edits
#[derive(Debug, Default)]
pub struct CommandStack {
    undo_log: VecDeque<Command>,
    redo_log: Vec<Command>,
}

impl CommandStack {

    pub fn new() -> Self {

        return Self {
            undo_log: VecDeque::with_capacity(MAX_UNDO_DEPTH + 1),
            redo_log: Vec::new(),
        };
    }

    pub fn undo_len(&self) -> usize {
        return self.undo_log.len();
    }

    pub fn redo_len(&self) -> usize {
        return self.redo_log.len();
    }

    /// Applies `command` and logs it for undo, clearing the redo log
    pub fn execute(&mut self, tree: &mut Tree, command: Command) -> Result<()> {

        command.apply(tree)?;

        self.undo_log.push_back(command);
        if self.undo_log.len() > MAX_UNDO_DEPTH {
            self.undo_log.pop_front();
        }

        self.redo_log.clear();

        Ok(())
    }

    /// Reverts the last executed command, `false` when there was nothing to undo
    ///
    /// A command whose inverse fails stays on the undo log.
    pub fn undo(&mut self, tree: &mut Tree) -> Result<bool> {

        let command = match self.undo_log.pop_back() {
            Some(command) => command,
            None => return Ok(false),
        };

        if let Err(e) = command.revert(tree) {
            warn!("Undo failed, keeping command: {}", e);
            self.undo_log.push_back(command);
            return Err(Error::InconsistentCommand(Box::new(e)));
        }

        debug!("Undid {:?}", command);
        self.redo_log.push(command);

        return Ok(true);
    }

    /// Re-applies the last undone command, `false` when there was nothing to redo
    pub fn redo(&mut self, tree: &mut Tree) -> Result<bool> {

        let command = match self.redo_log.pop() {
            Some(command) => command,
            None => return Ok(false),
        };

        if let Err(e) = command.apply(tree) {
            warn!("Redo failed, keeping command: {}", e);
            self.redo_log.push(command);
            return Err(Error::InconsistentCommand(Box::new(e)));
        }

        self.undo_log.push_back(command);

        return Ok(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Point;
    use crate::progress;
    use crate::source::MemorySource;
    use crate::tree::TreeConfig;
    use kdam::tqdm;
    use rand::prelude::*;

    fn build(dir: &tempfile::TempDir, points: Vec<Point>, node_capacity: usize) -> Tree {

        let mut config = TreeConfig::default();
        config.node_capacity = node_capacity;

        let mut source = MemorySource::new(points);
        return Tree::build(&dir.path().join("edits.mzTree"), &mut source, config, &mut progress::ignore).unwrap();
    }

    fn traces(tree: &mut Tree) -> Vec<TraceId> {

        let mut points = tree.query(0.0, 0.0, 0.0, 0.0, 0).unwrap();
        points.sort_by_key(|p| p.id);
        return points.iter().map(|p| p.trace_id).collect();
    }

    #[test]
    fn quick_highest_untraced_follows_undo() {

        let dir = tempfile::tempdir().unwrap();
        let points = vec![
            Point::new(1.0, 1.0, 10.0),
            Point::new(1.0, 2.0, 5.0),
            Point::new(9.0, 9.0, 1.0),
        ];
        let mut tree = build(&dir, points, 2);
        let mut stack = CommandStack::new();

        let p1 = tree.highest_untraced().unwrap().unwrap();
        assert_eq!(p1.intensity, 10.0);

        let command = Command::reassign_points(&mut tree, 1, &[p1.id]).unwrap();
        stack.execute(&mut tree, command).unwrap();
        assert_eq!(tree.highest_untraced().unwrap().unwrap().intensity, 5.0);
        assert!(tree.trace_map().contains_key(&1));

        assert!(stack.undo(&mut tree).unwrap());
        assert_eq!(tree.highest_untraced().unwrap().unwrap().id, p1.id);
        assert!(!tree.trace_map().contains_key(&1));

        assert!(stack.redo(&mut tree).unwrap());
        assert_eq!(tree.highest_untraced().unwrap().unwrap().intensity, 5.0);
        assert_eq!(tree.point(p1.id).unwrap().trace_id, 1);
    }

    #[test]
    fn quick_region_undo_redo_round_trip() {

        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(12);
        let points: Vec<Point> = (0..2000).map(|_| Point::new(rng.gen_range(100.0..200.0), rng.gen_range(0.0..10.0), rng.gen_range(1.0..100.0))).collect();

        let mut tree = build(&dir, points, 64);
        let mut stack = CommandStack::new();

        let range = DataRange::new(120.0, 150.0, 2.0, 6.0);
        let before = traces(&mut tree);

        let command = Command::reassign_region(&mut tree, 7, &range, true).unwrap();
        stack.execute(&mut tree, command).unwrap();
        let after = traces(&mut tree);

        let in_box = tree.query_range(&range).unwrap();
        assert!(!in_box.is_empty());
        assert!(in_box.iter().all(|p| p.trace_id == 7));

        //removing part of the trace again
        let inner = DataRange::new(130.0, 140.0, 3.0, 5.0);
        let command = Command::reassign_region(&mut tree, 7, &inner, false).unwrap();
        stack.execute(&mut tree, command).unwrap();
        assert!(tree.query_range(&inner).unwrap().iter().all(|p| p.trace_id == NO_TRACE));

        stack.undo(&mut tree).unwrap();
        assert_eq!(traces(&mut tree), after);

        stack.undo(&mut tree).unwrap();
        assert_eq!(traces(&mut tree), before);
        assert!(!tree.trace_map().contains_key(&7));

        stack.redo(&mut tree).unwrap();
        assert_eq!(traces(&mut tree), after);
        assert_eq!(stack.redo_len(), 1);

        //a new command drops what could still be redone
        let command = Command::reassign_envelope(&tree, 3, &[7]);
        stack.execute(&mut tree, command).unwrap();
        assert_eq!(stack.redo_len(), 0);
        assert_eq!(tree.trace_map().get(&7), Some(&3));

        stack.undo(&mut tree).unwrap();
        assert_eq!(tree.trace_map().get(&7), Some(&0));
    }

    #[test]
    fn quick_undo_depth_is_capped() {

        let dir = tempfile::tempdir().unwrap();
        let points: Vec<Point> = (0..100).map(|i| Point::new(100.0 + i as f64, i as f32, 1.0)).collect();
        let mut tree = build(&dir, points, 16);
        let mut stack = CommandStack::new();

        for i in tqdm!(0..15u32) {
            let command = Command::reassign_points(&mut tree, i as i32 + 1, &[i]).unwrap();
            stack.execute(&mut tree, command).unwrap();
        }

        assert_eq!(stack.undo_len(), MAX_UNDO_DEPTH);

        let mut undone = 0;
        while stack.undo(&mut tree).unwrap() {
            undone += 1;
        }

        assert_eq!(undone, MAX_UNDO_DEPTH);
        assert_eq!(tree.point(4).unwrap().trace_id, 5);
        assert_eq!(tree.point(5).unwrap().trace_id, NO_TRACE);
        assert!(!stack.undo(&mut tree).unwrap());
    }

    #[test]
    fn quick_failed_undo_keeps_command() {

        let dir = tempfile::tempdir().unwrap();
        let points: Vec<Point> = (0..10).map(|i| Point::new(100.0 + i as f64, i as f32, 1.0)).collect();
        let mut tree = build(&dir, points, 4);
        let mut stack = CommandStack::new();

        stack.undo_log.push_back(Command::ReassignPoints {
            point_ids: vec![10_000],
            old_trace: NO_TRACE,
            new_trace: 2,
            creates_trace: false,
        });

        let result = stack.undo(&mut tree);
        assert!(matches!(result, Err(Error::InconsistentCommand(_))));
        assert_eq!(stack.undo_len(), 1);
        assert_eq!(stack.redo_len(), 0);
    }
}
