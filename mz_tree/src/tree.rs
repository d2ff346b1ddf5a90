//! Implementation of mzTree creation, loading and querying
//!
//! A tree lives in three co-located files: the sqlite metadata file at `path`, the flat point
//! file at `<path>-points` and the optional intensity index at `<path>-intensity`. Leaves own a
//! contiguous block of the point file, internal nodes carry a summary of their children drawn
//! with the configured summarization strategy.

use log::{debug, info, warn};
use serde::{Serialize, Deserialize};

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::cache::PointCache;
use crate::data::{DataRange, Envelope, EnvelopeId, Point, PointId, TraceId, TraceRecord, TraceStats, is_unassigned, NO_ENVELOPE, UNSAVED_POINT};
use crate::database::{MetadataStore, NodeRow};
use crate::error::{Error, Result};
use crate::intensity::{self, IntensityIndex, IntensityIndexWriter};
use crate::io::PointStore;
use crate::layout;
use crate::node::{LeafBlock, Node, NodeArena, NodeIndex};
use crate::progress::{BuildStatus, ProgressFn, Reporter};
use crate::source::PointSource;
use crate::summarize::{Strategy, Summarizer};

//points read per block while scanning the whole point file
const SCAN_CHUNK_POINTS: usize = 65536;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TreeConfig {
    pub node_capacity: usize,
    pub tree_height: u32,
    pub min_branching_factor: usize,
    pub memory_budget_bytes: u64,
    pub build_memory_fraction: f64,
    pub cache_memory_fraction: f64,
    pub point_memory_footprint: usize,
    pub strategy: Strategy,
    pub seed: u64,
    pub track_intensity: bool,
}

impl Default for TreeConfig {

    fn default() -> Self {

        return Self {
            node_capacity: 8192,
            tree_height: 4,
            min_branching_factor: 4,
            memory_budget_bytes: 1 << 30,
            build_memory_fraction: 0.5,
            cache_memory_fraction: 0.8,
            point_memory_footprint: 90,
            strategy: Strategy::WeightedStriding,
            seed: 0,
            track_intensity: true,
        };
    }
}

impl TreeConfig {

    pub fn from_file(filename: &Path) -> Result<Self> {

        let serialized = fs::read_to_string(filename)?;

        let deserialized: Self = serde_yaml::from_str(&serialized)?;
        deserialized.validate()?;

        return Ok(deserialized);
    }

    pub fn to_file(&self, filename: &Path) -> Result<()> {

        let serialized = serde_yaml::to_string(&self)?;
        let mut file = File::create(filename)?;

        file.write_all(serialized.as_bytes())?;

        Ok(())
    }

    /// Rejects settings no build can work with
    pub fn validate(&self) -> Result<()> {

        if self.node_capacity == 0 {
            return Err(Error::InvalidConfig("node_capacity must be at least 1".to_string()));
        }
        if self.tree_height == 0 {
            return Err(Error::InvalidConfig("tree_height must be at least 1".to_string()));
        }
        if self.memory_budget_bytes == 0 {
            return Err(Error::InvalidConfig("memory_budget_bytes must be positive".to_string()));
        }
        if self.point_memory_footprint == 0 {
            return Err(Error::InvalidConfig("point_memory_footprint must be positive".to_string()));
        }

        for (name, fraction) in [("build_memory_fraction", self.build_memory_fraction), ("cache_memory_fraction", self.cache_memory_fraction)] {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(Error::InvalidConfig(format!("{} must be in (0, 1], got {}", name, fraction)));
            }
        }

        Ok(())
    }

    /// Points a build may hold in memory at once
    pub fn max_points_in_ram(&self) -> usize {

        let points = (self.memory_budget_bytes as f64 * self.build_memory_fraction / self.point_memory_footprint as f64).floor() as usize;
        return points.max(1);
    }
}

fn side_path(path: &Path, suffix: &str) -> PathBuf {

    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    return PathBuf::from(name);
}

/// Location of the point file belonging to the metadata file at `path`
pub fn points_path(path: &Path) -> PathBuf {
    return side_path(path, layout::POINTS_SUFFIX);
}

/// Location of the intensity index belonging to the metadata file at `path`
pub fn intensity_path(path: &Path) -> PathBuf {
    return side_path(path, layout::INTENSITY_SUFFIX);
}

fn not_found(path: &Path) -> Error {

    return Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, format!("no mzTree file at {:?}", path)));
}

/// Struct to represent the mzTree
///
/// Created either by building from a point source or by opening existing files. Owns every
/// storage handle, all mutation goes through `&mut self`.
#[derive(Debug)]
pub struct Tree {
    pub config: TreeConfig,
    path: PathBuf,
    metadata: MetadataStore,
    points: PointStore,
    cache: PointCache,
    arena: NodeArena,
    root: Option<NodeIndex>,
    branching_factor: usize,
    tree_height: usize,
    trace_map: HashMap<TraceId, EnvelopeId>,
    intensity: Option<IntensityIndex>,
    summarizer: Summarizer,
    status: BuildStatus,
}

impl Tree {

    fn new(path: &Path, config: TreeConfig, metadata: MetadataStore, points: PointStore) -> Self {

        let cache = PointCache::with_budget(config.memory_budget_bytes, config.cache_memory_fraction, config.point_memory_footprint);
        let summarizer = Summarizer::new(config.strategy, config.seed);

        return Self {
            config,
            path: path.to_path_buf(),
            metadata,
            points,
            cache,
            arena: NodeArena::new(),
            root: None,
            branching_factor: 0,
            tree_height: 0,
            trace_map: HashMap::new(),
            intensity: None,
            summarizer,
            status: BuildStatus::None,
        };
    }

    /// Builds a new tree at `path` from every point of `source`, replacing any existing file
    ///
    /// Chooses a partitioned build when the source holds more points than the configured memory
    /// budget allows at once.
    pub fn build(path: &Path, source: &mut dyn PointSource, config: TreeConfig, progress: &mut ProgressFn) -> Result<Self> {

        config.validate()?;

        let mut reporter = Reporter::new(progress);
        let start = Instant::now();

        reporter.phase(BuildStatus::Parsing, 0);
        let num_points = source.count_points()?;

        for existing in [path.to_path_buf(), points_path(path), intensity_path(path)] {
            if existing.exists() {
                info!("Replacing existing file {:?}", existing);
                fs::remove_file(&existing)?;
            }
        }

        let metadata = MetadataStore::open(path)?;
        let mut points = PointStore::new(&points_path(path), true)?;
        points.reserve(num_points)?;

        let mut tree = Self::new(path, config, metadata, points);

        let max_points_in_ram = tree.config.max_points_in_ram();
        let branching_factor = (num_points + max_points_in_ram - 1) / max_points_in_ram;

        let built = match branching_factor > 1 {
            true => tree.partitioned_build(source, num_points, branching_factor, &mut reporter),
            false => tree.standard_build(source, num_points, &mut reporter),
        };

        if let Err(e) = built {
            reporter.phase(BuildStatus::Error, 0);
            return Err(e);
        }

        //committed once below with the rest of the build
        let traces = source.take_traces();
        for (trace_id, envelope_id) in traces.iter() {
            tree.metadata.insert_trace(*trace_id, *envelope_id)?;
            tree.trace_map.insert(*trace_id, *envelope_id);
        }

        tree.flush()?;

        if let Some(root) = tree.root {
            tree.tree_height = tree.arena.height(root);
        }

        info!("Built mzTree of {} points, {} nodes, height {} in {:?}", num_points, tree.arena.len(), tree.tree_height, start.elapsed());

        tree.status = BuildStatus::Ready;
        reporter.phase(BuildStatus::Ready, 0);

        return Ok(tree);
    }

    fn standard_build(&mut self, source: &mut dyn PointSource, num_points: usize, reporter: &mut Reporter) -> Result<()> {

        let mut dataset = source.read_all()?;

        info!("Building mzTree from {} points", dataset.len());

        let num_leaves = (dataset.len() + self.config.node_capacity - 1) / self.config.node_capacity;
        self.branching_factor = ((num_leaves as f64).powf(1.0 / self.config.tree_height as f64).ceil() as usize).max(2);

        let root = self.arena.add_node(Node::new(None));
        self.root = Some(root);

        //rt ordered input needs no sort at the root, anything else is sorted by rt first
        let root_sort = match source.is_rt_ordered() {
            true => None,
            false => Some(true),
        };

        reporter.phase(BuildStatus::Converting, num_points as u64);
        self.divide(root_sort, &mut dataset, root, reporter)?;

        if self.config.track_intensity {
            reporter.phase(BuildStatus::Indexing, 1);
            let mut writer = IntensityIndexWriter::create(&intensity_path(&self.path), 1)?;
            writer.add_run(&intensity::intensity_run(&dataset))?;
            self.intensity = Some(writer.finish()?);
            reporter.advance(1);
        }

        return self.save_nodes(root, reporter);
    }

    fn partitioned_build(&mut self, source: &mut dyn PointSource, num_points: usize, branching_factor: usize, reporter: &mut Reporter) -> Result<()> {

        self.branching_factor = branching_factor.max(self.config.min_branching_factor);
        let partition_size = num_points / self.branching_factor;

        info!("Partitioned load w/ {} partitions of {} points", self.branching_factor, partition_size);

        let root = self.arena.add_node(Node::new(None));
        self.root = Some(root);

        let mut writer = match self.config.track_intensity {
            true => Some(IntensityIndexWriter::create(&intensity_path(&self.path), self.branching_factor)?),
            false => None,
        };

        reporter.phase(BuildStatus::Converting, num_points as u64);

        for i in 0..self.branching_factor {

            //the last partition takes the remainder
            let wanted = match i + 1 == self.branching_factor {
                true => num_points - partition_size * i,
                false => partition_size,
            };

            let mut partition = source.read_partition(wanted)?;

            let level_one = self.arena.add_node(Node::new(Some(root)));
            self.divide(Some(true), &mut partition, level_one, reporter)?;
            self.arena.add_child(root, level_one);

            if let Some(writer) = writer.as_mut() {
                writer.add_run(&intensity::intensity_run(&partition))?;
            }

            info!("Completed partition {}", i);
        }

        if let Some(writer) = writer {
            reporter.phase(BuildStatus::Indexing, 1);
            self.intensity = Some(writer.finish()?);
            reporter.advance(1);
        }

        self.summarize_from_children(root)?;
        self.cache.clear();

        return self.save_nodes(root, reporter);
    }

    /// Recursively divides `dataset` below `index`, a depth first construction
    ///
    /// `sort_by_rt` picks the axis this level is sorted on before slicing, `None` keeps the
    /// incoming order. Children alternate the axis.
    fn divide(&mut self, sort_by_rt: Option<bool>, dataset: &mut [Point], index: NodeIndex, reporter: &mut Reporter) -> Result<()> {

        if dataset.len() <= self.config.node_capacity {

            match self.points.append_block(dataset) {
                Ok(file_offset) => {
                    let block = LeafBlock { file_offset, count: dataset.len() as u32 };
                    self.arena.get_node_mut(index).init_leaf(dataset, Some(block));
                },
                Err(e) => {
                    warn!("Could not save points for leaf node {}: {}", self.arena.get_node(index), e);
                    self.arena.get_node_mut(index).point_ids = Some(Vec::new());

                    //keeps them out of the intensity index
                    for point in dataset.iter_mut() {
                        point.id = UNSAVED_POINT;
                    }
                },
            }

            reporter.advance(dataset.len() as u64);
            return Ok(());
        }

        match sort_by_rt {
            Some(true) => dataset.sort_by(|a, b| a.rt.total_cmp(&b.rt)),
            Some(false) => dataset.sort_by(|a, b| a.mz.total_cmp(&b.mz)),
            None => {},
        }

        let partition_size = (dataset.len() + self.branching_factor - 1) / self.branching_factor;
        let child_sort_by_rt = !sort_by_rt.unwrap_or(true);

        for partition in dataset.chunks_mut(partition_size) {

            let child = self.arena.add_node(Node::new(Some(index)));
            self.divide(Some(child_sort_by_rt), partition, child, reporter)?;
            self.arena.add_child(index, child);
        }

        self.summarize_from_children(index)?;
        self.cache.clear();

        Ok(())
    }

    /// Sets a node's summary from the union of its children's summaries
    fn summarize_from_children(&mut self, index: NodeIndex) -> Result<()> {

        let children = self.arena.get_node(index).children.clone();

        let mut candidate_ids: Vec<PointId> = Vec::new();
        for child in children.iter() {
            self.ensure_point_ids(*child)?;
            if let Some(ids) = self.arena.get_node(*child).point_ids.as_ref() {
                candidate_ids.extend_from_slice(ids);
            }
        }

        let candidates = self.cache.get_many(&candidate_ids, &mut self.points)?;
        let summary = self.summarizer.summarize(&candidates, self.config.node_capacity);

        self.arena.get_node_mut(index).point_ids = Some(summary.iter().map(|p| p.id).collect());

        Ok(())
    }

    /// Saves every node below and including `root` in pre-order, then commits
    fn save_nodes(&mut self, root: NodeIndex, reporter: &mut Reporter) -> Result<()> {

        reporter.phase(BuildStatus::Writing, self.arena.len() as u64);

        let mut to_visit: Vec<(NodeIndex, Option<i64>)> = vec![(root, None)];

        while let Some((index, parent_id)) = to_visit.pop() {

            let node = self.arena.get_node(index);
            let children = node.children.clone();

            let node_id = self.metadata.insert_node(&node.bounds, node.block, parent_id)?;
            self.metadata.update_node_point_ids(node_id, node.point_ids.as_deref().unwrap_or(&[]))?;

            self.arena.get_node_mut(index).node_id = Some(node_id);

            for child in children.iter().rev() {
                to_visit.push((*child, Some(node_id)));
            }

            reporter.advance(1);
        }

        self.metadata.flush()?;
        self.points.flush()?;

        Ok(())
    }

    /// Opens an existing tree, node point ids are loaded lazily by the first query touching them
    pub fn open(path: &Path, config: TreeConfig, progress: &mut ProgressFn) -> Result<Self> {

        config.validate()?;

        let mut reporter = Reporter::new(progress);

        if !path.exists() {
            return Err(not_found(path));
        }

        reporter.phase(BuildStatus::LoadingTree, 0);

        let metadata = MetadataStore::open(path)?;
        let points = PointStore::new(&points_path(path), false)?;

        let mut tree = Self::new(path, config, metadata, points);

        let root_row = match tree.metadata.load_root()? {
            Some(row) => row,
            None => return Err(Error::NotReady),
        };

        let root = tree.arena.add_node(Self::node_from_row(&root_row, None));
        tree.root = Some(root);

        let mut to_visit: Vec<(NodeIndex, i64)> = vec![(root, root_row.node_id)];
        while let Some((index, node_id)) = to_visit.pop() {

            for row in tree.metadata.load_children(node_id)?.iter() {
                let child = tree.arena.add_node(Self::node_from_row(row, Some(index)));
                tree.arena.add_child(index, child);
                to_visit.push((child, row.node_id));
            }
            reporter.advance(1);
        }

        tree.tree_height = tree.arena.height(root);
        tree.trace_map = tree.metadata.load_trace_map()?;

        let intensity_file = intensity_path(path);
        if intensity_file.exists() {
            tree.intensity = Some(IntensityIndex::open(&intensity_file)?);
        }

        info!("Opened mzTree {:?}: {} nodes, height {}, {} points, {} traces", path, tree.arena.len(), tree.tree_height, tree.points.len(), tree.trace_map.len());

        tree.status = BuildStatus::Ready;
        reporter.phase(BuildStatus::Ready, 0);

        return Ok(tree);
    }

    fn node_from_row(row: &NodeRow, parent: Option<NodeIndex>) -> Node {

        let mut node = Node::new(parent);
        node.node_id = Some(row.node_id);
        node.bounds = row.bounds;
        node.block = row.block;
        return node;
    }

    pub fn path(&self) -> &Path {
        return &self.path;
    }

    pub fn status(&self) -> BuildStatus {
        return self.status;
    }

    pub fn height(&self) -> usize {
        return self.tree_height;
    }

    pub fn num_nodes(&self) -> usize {
        return self.arena.len();
    }

    pub fn num_points(&self) -> usize {
        return self.points.len();
    }

    pub fn arena(&self) -> &NodeArena {
        return &self.arena;
    }

    pub fn root(&self) -> Option<NodeIndex> {
        return self.root;
    }

    pub fn cache(&self) -> &PointCache {
        return &self.cache;
    }

    fn ensure_point_ids(&mut self, index: NodeIndex) -> Result<()> {

        let node = self.arena.get_node(index);
        if node.point_ids.is_some() {
            return Ok(());
        }

        let ids = match node.node_id {
            Some(node_id) => self.metadata.load_node_point_ids(node_id)?,
            None => Vec::new(),
        };

        self.arena.get_node_mut(index).point_ids = Some(ids);

        Ok(())
    }

    //**** queries ****

    /// Points inside the inclusive box, a bound of 0 stands for the data bound on that side
    ///
    /// A `budget` of 0 returns every point in the box. Any other budget returns at most
    /// `budget` points drawn from the shallowest level whose summaries hold enough of them.
    pub fn query(&mut self, mz_min: f64, mz_max: f64, rt_min: f32, rt_max: f32, budget: usize) -> Result<Vec<Point>> {

        let root = self.root.ok_or(Error::NotReady)?;
        let start = Instant::now();

        let range = DataRange::new(mz_min, mz_max, rt_min, rt_max)
            .or_bounds_of(&self.arena.get_node(root).bounds.to_range());

        let use_summary = budget > 0;

        let mut frontier: Vec<NodeIndex> = vec![root];
        let mut level_points: Vec<Point> = Vec::new();
        let mut level = 0;

        loop {

            if use_summary {
                level_points = self.collect_points_in_range(&frontier, &range)?;
                if level_points.len() >= budget {
                    break;
                }
            }

            if frontier.iter().all(|index| self.arena.get_node(*index).is_leaf()) {
                break;
            }

            frontier = self.collect_next_level(&frontier, &range);
            level += 1;
        }

        if use_summary {

            debug!("Summary query stopped at level {} with {} points in {:?}", level, level_points.len(), start.elapsed());

            if level_points.len() <= budget {
                return Ok(level_points);
            }
            return Ok(self.summarizer.summarize(&level_points, budget));
        }

        let found = self.load_leaves_in_range(&frontier, &range)?;

        debug!("Exact query read {} leaves, found {} points in {:?}", frontier.len(), found.len(), start.elapsed());

        return Ok(found);
    }

    /// Every point of the tree in the box, read from the leaves
    pub fn query_range(&mut self, range: &DataRange) -> Result<Vec<Point>> {

        return self.query(range.mz_min, range.mz_max, range.rt_min, range.rt_max, 0);
    }

    //children of the frontier overlapping the box, leaves above the leaf level carry over
    fn collect_next_level(&self, frontier: &[NodeIndex], range: &DataRange) -> Vec<NodeIndex> {

        let mut next: Vec<NodeIndex> = Vec::new();

        for index in frontier.iter() {
            let node = self.arena.get_node(*index);

            match node.is_leaf() {
                true => next.push(*index),
                false => {
                    for child in node.children.iter() {
                        if self.arena.get_node(*child).bounds.overlaps(range) {
                            next.push(*child);
                        }
                    }
                },
            }
        }

        return next;
    }

    fn collect_points_in_range(&mut self, nodes: &[NodeIndex], range: &DataRange) -> Result<Vec<Point>> {

        let mut ids: Vec<PointId> = Vec::new();
        for index in nodes.iter() {
            self.ensure_point_ids(*index)?;
            if let Some(node_ids) = self.arena.get_node(*index).point_ids.as_ref() {
                ids.extend_from_slice(node_ids);
            }
        }

        let points = self.cache.get_many(&ids, &mut self.points)?;

        return Ok(points.into_iter().filter(|p| p.in_range(range)).collect());
    }

    //one block read per leaf, leaves without a block fall back to their point ids
    fn load_leaves_in_range(&mut self, leaves: &[NodeIndex], range: &DataRange) -> Result<Vec<Point>> {

        let mut found: Vec<Point> = Vec::new();

        for index in leaves.iter() {

            let node = self.arena.get_node(*index);
            if !node.bounds.overlaps(range) {
                continue;
            }

            let leaf_points = match node.block {
                Some(block) => self.points.read_block(block.file_offset, block.count as usize)?,
                None => {
                    self.ensure_point_ids(*index)?;
                    let ids = self.arena.get_node(*index).point_ids.clone().unwrap_or_default();
                    self.cache.get_many(&ids, &mut self.points)?
                },
            };

            found.extend(leaf_points.into_iter().filter(|p| p.in_range(range)));
        }

        return Ok(found);
    }

    /// One point, through the cache
    pub fn point(&mut self, id: PointId) -> Result<Point> {

        return self.cache.get(id, &mut self.points);
    }

    /// Several points in the order of `ids`, through the cache
    pub fn points(&mut self, ids: &[PointId]) -> Result<Vec<Point>> {

        return self.cache.get_many(ids, &mut self.points);
    }

    /// The m/z by RT box of all data, `None` before anything was built
    pub fn data_bounds(&self) -> Option<DataRange> {

        let root = self.arena.get_node(self.root?);
        if root.bounds.is_empty() {
            return None;
        }
        return Some(root.bounds.to_range());
    }

    /// Lowest and highest intensity of all data
    pub fn intensity_range(&self) -> Option<(f64, f64)> {

        let root = self.arena.get_node(self.root?);
        if root.bounds.is_empty() {
            return None;
        }
        return Some((root.bounds.int_min, root.bounds.int_max));
    }

    //**** labels ****

    pub fn trace_map(&self) -> &HashMap<TraceId, EnvelopeId> {
        return &self.trace_map;
    }

    /// Moves the given points into `trace_id`
    pub fn update_traces(&mut self, trace_id: TraceId, point_ids: &[PointId]) -> Result<()> {

        for id in point_ids.iter() {
            self.cache.shallow_update_trace(*id, trace_id);
            self.points.write_trace(*id, trace_id)?;
        }

        //points went back to untraced, cursors only move forward
        if is_unassigned(trace_id) {
            self.reset_intensity_cursors()?;
        }

        Ok(())
    }

    pub fn insert_trace(&mut self, trace_id: TraceId, envelope_id: EnvelopeId) -> Result<()> {

        self.metadata.insert_trace(trace_id, envelope_id)?;
        self.metadata.flush()?;
        self.trace_map.insert(trace_id, envelope_id);

        Ok(())
    }

    /// Deletes a trace and resets every point that referenced it
    pub fn delete_trace(&mut self, trace_id: TraceId) -> Result<()> {

        self.metadata.delete_trace(trace_id)?;
        self.metadata.flush()?;
        self.trace_map.remove(&trace_id);

        let cleared = self.points.clear_trace(trace_id)?;
        if cleared > 0 {
            self.cache.clear();
            self.reset_intensity_cursors()?;
        }

        Ok(())
    }

    pub fn delete_traces(&mut self) -> Result<()> {

        self.metadata.delete_traces()?;
        self.metadata.flush()?;
        self.trace_map.clear();

        let cleared = self.points.clear_traces()?;
        info!("Deleted all traces, {} points reset", cleared);

        self.cache.clear();
        self.reset_intensity_cursors()?;

        Ok(())
    }

    /// Moves the given traces into `envelope_id`
    pub fn update_envelopes(&mut self, envelope_id: EnvelopeId, trace_ids: &[TraceId]) -> Result<()> {

        self.metadata.update_envelopes(envelope_id, trace_ids)?;
        self.metadata.flush()?;
        for trace_id in trace_ids.iter() {
            self.trace_map.insert(*trace_id, envelope_id);
        }

        Ok(())
    }

    pub fn insert_envelope(&mut self, envelope: &Envelope) -> Result<()> {

        self.metadata.insert_envelope(envelope)?;
        return self.metadata.flush();
    }

    pub fn envelopes(&self) -> Result<Vec<Envelope>> {

        return self.metadata.load_envelopes();
    }

    /// Deletes the given envelopes, or all of them, detaching their traces
    pub fn delete_envelopes(&mut self, envelope_ids: Option<&[EnvelopeId]>) -> Result<()> {

        self.metadata.delete_envelopes(envelope_ids)?;
        self.metadata.flush()?;

        for envelope in self.trace_map.values_mut() {
            let deleted = match envelope_ids {
                Some(ids) => ids.contains(envelope),
                None => true,
            };
            if deleted {
                *envelope = NO_ENVELOPE;
            }
        }

        Ok(())
    }

    pub fn update_trace_stats(&mut self, trace_id: TraceId, stats: &TraceStats) -> Result<()> {

        self.metadata.update_trace_stats(trace_id, stats)?;
        return self.metadata.flush();
    }

    pub fn traces(&self) -> Result<Vec<TraceRecord>> {

        return self.metadata.load_traces(false);
    }

    pub fn traces_have_been_compiled(&self) -> Result<bool> {

        return self.metadata.traces_have_been_compiled();
    }

    /// Computes centroid m/z, RT extent and intensity sum of every known trace from its points
    pub fn compile_traces(&mut self) -> Result<Vec<TraceRecord>> {

        //weighted mz sum, plain mz sum, count, stats
        let mut accumulated: HashMap<TraceId, (f64, f64, usize, TraceStats)> = HashMap::new();

        let total = self.points.len();
        let mut first = 0;

        while first < total {

            let n = SCAN_CHUNK_POINTS.min(total - first);
            let block = self.points.read_block(layout::point_offset(first as u32), n)?;

            for point in block.iter().filter(|p| p.is_traced()) {
                let entry = accumulated.entry(point.trace_id).or_insert((0.0, 0.0, 0, TraceStats {
                    centroid_mz: 0.0,
                    min_rt: f32::MAX,
                    max_rt: f32::MIN,
                    intensity_sum: 0.0,
                }));

                entry.0 += point.mz * point.intensity;
                entry.1 += point.mz;
                entry.2 += 1;
                entry.3.min_rt = entry.3.min_rt.min(point.rt);
                entry.3.max_rt = entry.3.max_rt.max(point.rt);
                entry.3.intensity_sum += point.intensity;
            }

            first += n;
        }

        let mut trace_ids: Vec<TraceId> = accumulated.keys().copied().collect();
        trace_ids.sort_unstable();

        let mut compiled: Vec<TraceRecord> = Vec::with_capacity(trace_ids.len());

        for trace_id in trace_ids.iter() {

            let envelope_id = match self.trace_map.get(trace_id) {
                Some(envelope_id) => *envelope_id,
                None => {
                    debug!("Points reference unknown trace {}, skipping", trace_id);
                    continue;
                },
            };

            let (weighted_mz, plain_mz, count, mut stats) = accumulated[trace_id];
            stats.centroid_mz = match stats.intensity_sum > 0.0 {
                true => weighted_mz / stats.intensity_sum,
                false => plain_mz / count as f64,
            };

            self.metadata.update_trace_stats(*trace_id, &stats)?;

            compiled.push(TraceRecord {
                trace_id: *trace_id,
                envelope_id,
                centroid_mz: Some(stats.centroid_mz),
                min_rt: Some(stats.min_rt),
                max_rt: Some(stats.max_rt),
                intensity_sum: Some(stats.intensity_sum),
            });
        }

        self.metadata.flush()?;

        info!("Compiled {} traces", compiled.len());

        return Ok(compiled);
    }

    //**** intensity index ****

    /// The most intense point without a trace, `None` once all points are traced
    pub fn highest_untraced(&mut self) -> Result<Option<Point>> {

        let index = self.intensity.as_mut().ok_or(Error::NotReady)?;

        return index.get_highest_untraced(&self.cache, &mut self.points);
    }

    /// Fraction of points already worked through in descending intensity order
    pub fn progress(&mut self) -> Result<f64> {

        let index = self.intensity.as_mut().ok_or(Error::NotReady)?;

        return index.get_progress(&self.cache, &mut self.points);
    }

    pub fn reset_intensity_cursors(&mut self) -> Result<()> {

        if let Some(index) = self.intensity.as_mut() {
            index.init_candidate_indexes(&self.cache, &mut self.points)?;
        }

        Ok(())
    }

    //**** persistence ****

    /// Commits pending metadata and syncs the point file
    pub fn flush(&mut self) -> Result<()> {

        self.metadata.flush()?;
        self.points.flush()?;

        Ok(())
    }

    //(source, target) pairs of every file the tree consists of
    fn file_pairs(&self, target: &Path) -> Vec<(PathBuf, PathBuf)> {

        let mut pairs = vec![
            (self.path.clone(), target.to_path_buf()),
            (points_path(&self.path), points_path(target)),
        ];

        if self.intensity.is_some() {
            pairs.push((intensity_path(&self.path), intensity_path(target)));
        }

        return pairs;
    }

    fn copy_to(&self, target: &Path) -> Result<(MetadataStore, PointStore, Option<IntensityIndex>)> {

        let pairs = self.file_pairs(target);

        //never copy over an existing tree, this one included
        for (_, to) in pairs.iter() {
            if to.exists() {
                return Err(Error::AlreadyExists(to.clone()));
            }
        }

        let mut copied: Vec<&Path> = Vec::new();
        for (from, to) in pairs.iter() {
            if let Err(e) = fs::copy(from, to) {
                for path in copied.iter() {
                    fs::remove_file(path).ok();
                }
                return Err(Error::Io(e));
            }
            copied.push(to.as_path());
        }

        let intensity = match self.intensity.is_some() {
            true => Some(IntensityIndex::open(&intensity_path(target))?),
            false => None,
        };

        let metadata = MetadataStore::open(target)?;
        let points = PointStore::new(&points_path(target), false)?;

        return Ok((metadata, points, intensity));
    }

    /// Copies every file of the tree to `target` and continues working on the copy
    ///
    /// Fails with `AlreadyExists` when any target file exists, the tree's own files included.
    /// On failure the tree stays on its current files.
    pub fn save_as(&mut self, target: &Path) -> Result<()> {

        self.flush()?;

        let (metadata, points, intensity) = match self.copy_to(target) {
            Ok(handles) => handles,
            Err(e) => {
                warn!("Could not create copy at {:?}, staying on {:?}: {}", target, self.path, e);
                return Err(e);
            },
        };

        //switch every handle before releasing the old ones
        let previous = std::mem::replace(&mut self.metadata, metadata);
        self.points = points;
        self.intensity = intensity;
        self.path = target.to_path_buf();
        self.cache.clear();

        info!("Saved mzTree as {:?}", target);

        //already flushed, the tree keeps working on the copy either way
        if let Err(e) = previous.close() {
            warn!("Could not close previous metadata file: {}", e);
            return Err(e);
        }

        Ok(())
    }

    /// Commits everything and releases the files
    pub fn close(mut self) -> Result<()> {

        self.points.flush()?;
        self.metadata.close()?;

        info!("Closed mzTree {:?}", self.path);

        Ok(())
    }
}
