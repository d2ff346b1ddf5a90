//! Point access for an automatic trace segmentation algorithm
//!
//! The algorithm repeatedly asks for the most intense unassigned point, grows a trace around it
//! and writes the result back, so the interface only needs a handful of operations.

use log::debug;

use std::collections::HashMap;

use crate::data::{DataRange, Point, PointId, TraceId, NO_ENVELOPE};
use crate::error::{Error, Result};
use crate::tree::Tree;

/// Width in m/z of the buckets resolution estimates are cached for
pub const RESOLUTION_BUCKET_WIDTH: f64 = 5.0;

//only gaps below this count as neighbouring peaks of one scan
const MAX_RESOLUTION_GAP: f64 = 1.0;

pub trait PointDatabase {

    /// Points of `range` with an intensity above `min_intensity`, all of them when it is 0
    fn all_points(&mut self, range: &DataRange, min_intensity: f64) -> Result<Vec<Point>>;

    fn min_intensity(&self) -> Result<f64>;

    fn max_intensity(&self) -> Result<f64>;

    fn highest_unassigned(&mut self) -> Result<Option<Point>>;

    /// One above the highest trace id in use
    fn next_trace_id(&self) -> TraceId;

    /// Assigns a point to a trace, creating the trace if needed
    fn write_point(&mut self, trace_id: TraceId, point_id: PointId) -> Result<()>;

    /// Typical m/z distance between neighbouring points of one scan near `near_mz`
    fn mz_resolution(&mut self, near_mz: f64) -> Result<f64>;

    fn delete_traces(&mut self) -> Result<()>;
}

/// `PointDatabase` over an open tree
#[derive(Debug)]
pub struct TreeDatabase<'a> {
    tree: &'a mut Tree,
    resolutions: HashMap<i64, f64>,
}

impl<'a> TreeDatabase<'a> {

    pub fn new(tree: &'a mut Tree) -> Self {

        return Self {
            tree,
            resolutions: HashMap::new(),
        };
    }

    /// Median gap between successive same-RT points within one m/z of `mz`
    fn compute_mz_resolution(&mut self, mz: f64) -> Result<f64> {

        let bounds = self.tree.data_bounds().ok_or(Error::NotReady)?;

        let mut points = self.tree.query(mz - 1.0, mz + 1.0, bounds.rt_min, bounds.rt_max, 0)?;
        points.sort_by(|a, b| a.rt.total_cmp(&b.rt).then(a.mz.total_cmp(&b.mz)));

        let mut gaps: Vec<f64> = points.windows(2)
            .filter(|w| w[0].rt == w[1].rt)
            .map(|w| w[1].mz - w[0].mz)
            .filter(|gap| *gap < MAX_RESOLUTION_GAP)
            .collect();

        if gaps.is_empty() {
            return Err(Error::NoResolution(mz));
        }

        gaps.sort_by(|a, b| a.total_cmp(b));

        return Ok(gaps[gaps.len() / 2]);
    }
}

impl PointDatabase for TreeDatabase<'_> {

    fn all_points(&mut self, range: &DataRange, min_intensity: f64) -> Result<Vec<Point>> {

        let points = self.tree.query_range(range)?;

        if min_intensity == 0.0 {
            return Ok(points);
        }

        return Ok(points.into_iter().filter(|p| p.intensity > min_intensity).collect());
    }

    fn min_intensity(&self) -> Result<f64> {

        let (min, _) = self.tree.intensity_range().ok_or(Error::NotReady)?;
        return Ok(min);
    }

    fn max_intensity(&self) -> Result<f64> {

        let (_, max) = self.tree.intensity_range().ok_or(Error::NotReady)?;
        return Ok(max);
    }

    fn highest_unassigned(&mut self) -> Result<Option<Point>> {

        return self.tree.highest_untraced();
    }

    fn next_trace_id(&self) -> TraceId {

        let highest = self.tree.trace_map().keys().copied().max().unwrap_or(0);
        return highest.max(0) + 1;
    }

    fn write_point(&mut self, trace_id: TraceId, point_id: PointId) -> Result<()> {

        if !self.tree.trace_map().contains_key(&trace_id) {
            self.tree.insert_trace(trace_id, NO_ENVELOPE)?;
        }

        return self.tree.update_traces(trace_id, &[point_id]);
    }

    fn mz_resolution(&mut self, near_mz: f64) -> Result<f64> {

        let bucket = (near_mz / RESOLUTION_BUCKET_WIDTH) as i64;

        if let Some(resolution) = self.resolutions.get(&bucket) {
            return Ok(*resolution);
        }

        let resolution = self.compute_mz_resolution(bucket as f64 * RESOLUTION_BUCKET_WIDTH)?;
        debug!("m/z resolution near {}: {}", near_mz, resolution);

        self.resolutions.insert(bucket, resolution);

        return Ok(resolution);
    }

    fn delete_traces(&mut self) -> Result<()> {

        return self.tree.delete_traces();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress;
    use crate::source::MemorySource;
    use crate::tree::TreeConfig;
    use assert_approx_eq::assert_approx_eq;

    //scans every 0.5 RT with peaks every 0.01 m/z between 98 and 102
    fn scans() -> Vec<Point> {

        let mut points = Vec::new();
        for scan in 0..10 {
            for peak in 0..400 {
                let intensity = 1.0 + ((scan * 400 + peak) % 97) as f64;
                points.push(Point::new(98.0 + peak as f64 * 0.01, scan as f32 * 0.5, intensity));
            }
        }
        return points;
    }

    fn build(dir: &tempfile::TempDir) -> Tree {

        let mut config = TreeConfig::default();
        config.node_capacity = 128;

        let mut source = MemorySource::new(scans());
        return Tree::build(&dir.path().join("segment.mzTree"), &mut source, config, &mut progress::ignore).unwrap();
    }

    #[test]
    fn quick_segmentation_round() {

        let dir = tempfile::tempdir().unwrap();
        let mut tree = build(&dir);
        let mut database = TreeDatabase::new(&mut tree);

        assert_eq!(database.min_intensity().unwrap(), 1.0);
        assert_eq!(database.max_intensity().unwrap(), 97.0);
        assert_eq!(database.next_trace_id(), 1);

        let highest = database.highest_unassigned().unwrap().unwrap();
        assert_eq!(highest.intensity, 97.0);

        let trace_id = database.next_trace_id();
        database.write_point(trace_id, highest.id).unwrap();
        assert_eq!(database.next_trace_id(), 2);

        let next = database.highest_unassigned().unwrap().unwrap();
        assert_ne!(next.id, highest.id);
        assert!(next.intensity <= highest.intensity);

        let range = DataRange::new(98.995, 99.505, 0.9, 2.1);
        let all = database.all_points(&range, 0.0).unwrap();
        let bright = database.all_points(&range, 50.0).unwrap();
        assert_eq!(all.len(), 51 * 3);
        assert!(bright.iter().all(|p| p.intensity > 50.0));
        assert!(bright.len() < all.len());

        database.delete_traces().unwrap();
        assert_eq!(database.next_trace_id(), 1);
        assert_eq!(database.highest_unassigned().unwrap().unwrap().intensity, 97.0);
    }

    #[test]
    fn quick_mz_resolution_is_median_gap() {

        let dir = tempfile::tempdir().unwrap();
        let mut tree = build(&dir);
        let mut database = TreeDatabase::new(&mut tree);

        assert_approx_eq!(database.mz_resolution(100.3).unwrap(), 0.01, 1e-6);
        assert_eq!(database.resolutions.len(), 1);

        //same bucket, served from the cache
        assert_approx_eq!(database.mz_resolution(101.0).unwrap(), 0.01, 1e-6);
        assert_eq!(database.resolutions.len(), 1);

        assert!(matches!(database.mz_resolution(500.0), Err(Error::NoResolution(_))));
    }
}
