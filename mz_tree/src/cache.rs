//! In-memory point cache in front of the point file
//!
//! Eviction is clear-on-overflow: when an insert would push the cache past its limit the whole
//! map is dropped. Workloads are phase based (a build touches a cold set once, browsing re-touches
//! a warm set), so there is no LRU bookkeeping.

use dashmap::DashMap;
use log::debug;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::data::{Point, PointId, TraceId};
use crate::error::Result;
use crate::io::PointStore;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {

    pub fn hit_rate(&self) -> f64 {

        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        return self.hits as f64 / total as f64;
    }
}

#[derive(Debug)]
pub struct PointCache {
    points: DashMap<PointId, Point>,
    limit: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PointCache {

    pub fn new(limit: usize) -> Self {

        return Self {
            points: DashMap::new(),
            limit,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };
    }

    /// Sizes the cache as a fraction of a memory budget, `footprint` bytes per cached point
    pub fn with_budget(budget_bytes: u64, fraction: f64, footprint: usize) -> Self {

        let limit = (budget_bytes as f64 * fraction / footprint as f64) as usize;
        return Self::new(limit);
    }

    pub fn len(&self) -> usize {
        return self.points.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.points.is_empty();
    }

    pub fn limit(&self) -> usize {
        return self.limit;
    }

    pub fn stats(&self) -> CacheStats {

        return CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.points.len(),
            capacity: self.limit,
        };
    }

    pub fn clear(&self) {
        self.points.clear();
    }

    //drops everything when `n` more points would not fit
    fn make_room(&self, n: usize) {

        if self.points.len() + n > self.limit {
            debug!("Point cache full ({} of {}), clearing", self.points.len(), self.limit);
            self.points.clear();
        }
    }

    pub fn put(&self, point: Point) {

        self.make_room(1);
        self.points.insert(point.id, point);
    }

    pub fn put_many(&self, points: &[Point]) {

        self.make_room(points.len());
        for point in points.iter() {
            self.points.insert(point.id, *point);
        }
    }

    /// Cached copy of a point, `None` on a miss
    pub fn peek(&self, id: PointId) -> Option<Point> {

        return self.points.get(&id).map(|entry| *entry.value());
    }

    /// Returns a point from the cache, loading and caching it from `store` on a miss
    pub fn get(&self, id: PointId, store: &mut PointStore) -> Result<Point> {

        if let Some(point) = self.peek(id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(point);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);

        let point = store.read(id)?;
        self.put(point);

        return Ok(point);
    }

    /// Returns the points of `ids` in order, misses are batched into one bulk read
    pub fn get_many(&self, ids: &[PointId], store: &mut PointStore) -> Result<Vec<Point>> {

        let mut found: Vec<Option<Point>> = Vec::with_capacity(ids.len());
        let mut missing: Vec<PointId> = Vec::new();

        for id in ids.iter() {
            let cached = self.peek(*id);
            if cached.is_none() {
                missing.push(*id);
            }
            found.push(cached);
        }

        self.hits.fetch_add((ids.len() - missing.len()) as u64, Ordering::Relaxed);
        self.misses.fetch_add(missing.len() as u64, Ordering::Relaxed);

        if missing.is_empty() {
            return Ok(found.into_iter().flatten().collect());
        }

        let loaded = store.read_many(&missing)?;
        self.put_many(&loaded);

        let mut loaded_iter = loaded.into_iter();
        let mut points: Vec<Point> = Vec::with_capacity(ids.len());
        for slot in found.into_iter() {
            match slot {
                Some(point) => points.push(point),
                None => {
                    if let Some(point) = loaded_iter.next() {
                        points.push(point);
                    }
                },
            }
        }

        return Ok(points);
    }

    /// Updates the trace of a cached point, leaves the cache alone when the point is absent
    pub fn shallow_update_trace(&self, id: PointId, trace_id: TraceId) {

        if let Some(mut entry) = self.points.get_mut(&id) {
            entry.trace_id = trace_id;
        }
    }
}
