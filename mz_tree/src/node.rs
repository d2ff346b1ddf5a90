//! Holds structs and methods for representing nodes (root, internal and leaf) of the tree.
//!
//! Nodes live in an arena and refer to each other by index, which lines up with how they are
//! persisted: every row of the node table carries its parent's id.

use crate::data::{Point, PointId, DataRange};

use std::fmt;

pub type NodeIndex = usize;

/// Bounding box of a node over m/z, RT and intensity
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Bounds {
    pub mz_min: f64,
    pub mz_max: f64,
    pub rt_min: f32,
    pub rt_max: f32,
    pub int_min: f64,
    pub int_max: f64,
}

impl Default for Bounds {

    /// Starts at the extremes so that the first included point sets every edge
    fn default() -> Self {

        return Self {
            mz_min: f64::MAX,
            mz_max: f64::MIN,
            rt_min: f32::MAX,
            rt_max: f32::MIN,
            int_min: f64::MAX,
            int_max: f64::MIN,
        };
    }
}

impl Bounds {

    pub fn is_empty(&self) -> bool {

        return self.mz_min > self.mz_max;
    }

    pub fn include_point(&mut self, point: &Point) {

        self.mz_min = self.mz_min.min(point.mz);
        self.mz_max = self.mz_max.max(point.mz);
        self.rt_min = self.rt_min.min(point.rt);
        self.rt_max = self.rt_max.max(point.rt);
        self.int_min = self.int_min.min(point.intensity);
        self.int_max = self.int_max.max(point.intensity);
    }

    pub fn include(&mut self, other: &Bounds) {

        if other.is_empty() {
            return;
        }

        self.mz_min = self.mz_min.min(other.mz_min);
        self.mz_max = self.mz_max.max(other.mz_max);
        self.rt_min = self.rt_min.min(other.rt_min);
        self.rt_max = self.rt_max.max(other.rt_max);
        self.int_min = self.int_min.min(other.int_min);
        self.int_max = self.int_max.max(other.int_max);
    }

    pub fn from_points(points: &[Point]) -> Self {

        let mut bounds = Self::default();
        for point in points {
            bounds.include_point(point);
        }
        return bounds;
    }

    /// 1D interval overlap on m/z and on RT, intensity is ignored
    pub fn overlaps(&self, range: &DataRange) -> bool {

        return self.mz_min <= range.mz_max && self.mz_max >= range.mz_min
            && self.rt_min <= range.rt_max && self.rt_max >= range.rt_min;
    }

    pub fn to_range(&self) -> DataRange {

        return DataRange::new(self.mz_min, self.mz_max, self.rt_min, self.rt_max);
    }
}

/// Location of a leaf's points in the point file
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct LeafBlock {
    pub file_offset: u64,
    pub count: u32,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Node {
    /// Row id in the node table, `None` until the node has been saved
    pub node_id: Option<i64>,
    pub parent: Option<NodeIndex>,
    pub children: Vec<NodeIndex>,
    pub bounds: Bounds,
    pub block: Option<LeafBlock>,
    /// Members of a leaf, or the summary of an internal node. `None` until lazily loaded.
    pub point_ids: Option<Vec<PointId>>,
}

impl Node {

    pub fn new(parent: Option<NodeIndex>) -> Self {

        return Self {
            node_id: None,
            parent,
            children: Vec::new(),
            bounds: Bounds::default(),
            block: None,
            point_ids: None,
        };
    }

    pub fn is_leaf(&self) -> bool {
        return self.children.is_empty();
    }

    /// Collects the member ids and the bounding box of a freshly written leaf
    pub fn init_leaf(&mut self, points: &[Point], block: Option<LeafBlock>) {

        self.point_ids = Some(points.iter().map(|p| p.id).collect());
        self.bounds = Bounds::from_points(points);
        self.block = block;
    }
}

impl fmt::Display for Node {

    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {

        let kind = match self.is_leaf() {
            true => "LEAF",
            false => "NODE",
        };

        write!(f, "{} {:?} mz [{}, {}] rt [{}, {}] children {}",
            kind,
            self.node_id,
            self.bounds.mz_min,
            self.bounds.mz_max,
            self.bounds.rt_min,
            self.bounds.rt_max,
            self.children.len())
    }
}

/// Owns every node of one tree, children and parents are indexes into `store`
#[derive(Debug, Default)]
pub struct NodeArena {
    pub store: Vec<Node>,
}

impl NodeArena {

    pub fn new() -> Self {

        return Self { store: Vec::new() };
    }

    pub fn len(&self) -> usize {
        return self.store.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.store.is_empty();
    }

    pub fn add_node(&mut self, node: Node) -> NodeIndex {

        self.store.push(node);
        return self.store.len() - 1;
    }

    pub fn get_node(&self, index: NodeIndex) -> &Node {
        return &self.store[index];
    }

    pub fn get_node_mut(&mut self, index: NodeIndex) -> &mut Node {
        return &mut self.store[index];
    }

    /// Links `child` under `parent` and widens the parent's box to cover it
    pub fn add_child(&mut self, parent: NodeIndex, child: NodeIndex) {

        let child_bounds = self.store[child].bounds;

        self.store[child].parent = Some(parent);

        let parent_node = &mut self.store[parent];
        parent_node.children.push(child);
        parent_node.bounds.include(&child_bounds);
    }

    /// Depth of the deepest leaf below `index`, a lone leaf has height 0
    pub fn height(&self, index: NodeIndex) -> usize {

        let mut deepest = 0;
        let mut to_visit: Vec<(NodeIndex, usize)> = vec![(index, 0)];

        while let Some((curr, depth)) = to_visit.pop() {

            let node = &self.store[curr];
            match node.is_leaf() {
                true => deepest = deepest.max(depth),
                false => {
                    for child in node.children.iter() {
                        to_visit.push((*child, depth + 1));
                    }
                },
            }
        }

        return deepest;
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Node> {

        return self.store.iter().filter(|n| n.is_leaf());
    }
}
