//! Strategies that shrink a point set to a representative sample of a given size
//!
//! Used bottom-up during construction to fill every internal node's summary, and at query time
//! to cut a level-of-detail result down to the caller's budget.

use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Serialize, Deserialize};

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;

use crate::data::Point;

//fixed non-1 stride so that selection is decorrelated from any rt or mz presort
const STRIDE_LENGTH: usize = 43;

//accumulator tolerance for weighted striding
const ACCUMULATION_EPSILON: f64 = 1.0e-5;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Strategy {
    IntensityCutoff,
    UniformStriding,
    WeightedStriding,
    UniformSampling,
    WeightedSampling,
    WeightedReservoirSampling,
}

impl Strategy {

    pub const ALL: [Strategy; 6] = [
        Strategy::IntensityCutoff,
        Strategy::UniformStriding,
        Strategy::WeightedStriding,
        Strategy::UniformSampling,
        Strategy::WeightedSampling,
        Strategy::WeightedReservoirSampling,
    ];
}

impl Default for Strategy {

    fn default() -> Self {
        return Strategy::WeightedStriding;
    }
}

impl fmt::Display for Strategy {

    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for Strategy {

    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {

        return Strategy::ALL.iter()
            .find(|strategy| strategy.to_string().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown summarization strategy: {}", s));
    }
}

/// A strategy together with the random state it draws from
#[derive(Debug, Clone)]
pub struct Summarizer {
    pub strategy: Strategy,
    rng: StdRng,
}

impl Summarizer {

    pub fn new(strategy: Strategy, seed: u64) -> Self {

        return Self {
            strategy,
            rng: StdRng::seed_from_u64(seed),
        };
    }

    /// Returns `n` points drawn from `points`, or all of them when there are not more than `n`
    pub fn summarize(&mut self, points: &[Point], n: usize) -> Vec<Point> {

        if n >= points.len() {
            return points.to_vec();
        }

        if n == 0 {
            return Vec::new();
        }

        return match self.strategy {
            Strategy::IntensityCutoff => intensity_cutoff(points, n),
            Strategy::UniformStriding => uniform_striding(points, n),
            Strategy::WeightedStriding => weighted_striding(points, n),
            Strategy::UniformSampling => uniform_sampling(points, n, &mut self.rng),
            Strategy::WeightedSampling => weighted_sampling(points, n, &mut self.rng),
            Strategy::WeightedReservoirSampling => weighted_reservoir_sampling(points, n, &mut self.rng),
        };
    }
}

fn sum_intensity(points: &[Point]) -> f64 {
    return points.iter().map(|p| p.intensity).sum();
}

/// The `n` most intense points, in ascending intensity order
fn intensity_cutoff(points: &[Point], n: usize) -> Vec<Point> {

    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.intensity.total_cmp(&b.intensity));

    return sorted.split_off(sorted.len() - n);
}

fn uniform_striding(points: &[Point], n: usize) -> Vec<Point> {

    let stride = points.len() / n;

    return (0..n).map(|i| points[i * stride]).collect();
}

/// Strides through the points accumulating intensity, and selects a point each time the
/// accumulation crosses `total / n`. Points skipped in one pass are revisited in the next.
fn weighted_striding(points: &[Point], n: usize) -> Vec<Point> {

    let threshold = sum_intensity(points) / n as f64;

    let mut selection: Vec<Point> = Vec::with_capacity(n);
    let mut remaining: Vec<Point> = points.to_vec();
    let mut accumulation = 0.0;

    while selection.len() < n {

        let selected_before = selection.len();
        let mut skipped: Vec<Point> = Vec::new();

        'pass: for offset in 0..STRIDE_LENGTH.min(remaining.len()) {
            let mut i = offset;
            while i < remaining.len() {

                if selection.len() == n {
                    break 'pass;
                }

                let point = remaining[i];
                accumulation += point.intensity;

                if accumulation >= threshold - ACCUMULATION_EPSILON {
                    selection.push(point);
                    accumulation -= threshold;
                } else {
                    skipped.push(point);
                }

                i += STRIDE_LENGTH;
            }
        }

        //a pass that selects nothing would repeat forever on zero intensity points
        if selection.len() == selected_before {
            let missing = n - selection.len();
            selection.extend(skipped.into_iter().take(missing));
            break;
        }

        remaining = skipped;
    }

    return selection;
}

/// Partial Fisher-Yates shuffle, the first `n` slots end up uniformly sampled
fn uniform_sampling(points: &[Point], n: usize, rng: &mut StdRng) -> Vec<Point> {

    let mut shuffled = points.to_vec();

    for i in 0..n {
        let j = rng.gen_range(i..shuffled.len());
        shuffled.swap(i, j);
    }

    shuffled.truncate(n);
    return shuffled;
}

/// Bernoulli inclusion with probability proportional to intensity, cycling until `n` accepted
fn weighted_sampling(points: &[Point], n: usize, rng: &mut StdRng) -> Vec<Point> {

    let total = sum_intensity(points);

    if total <= 0.0 {
        return uniform_sampling(points, n, rng);
    }

    let f = n as f64 / total;

    let mut taken = vec![false; points.len()];
    let mut selection: Vec<Point> = Vec::with_capacity(n);

    while selection.len() < n {

        let selected_before = selection.len();

        for (i, point) in points.iter().enumerate() {

            if selection.len() == n {
                break;
            }

            if taken[i] {
                continue;
            }

            if rng.gen::<f64>() <= f * point.intensity / 2.0 {
                taken[i] = true;
                selection.push(*point);
            }
        }

        //only zero intensity points left, or a cycle without luck
        if selection.len() == selected_before {
            let missing = n - selection.len();
            selection.extend(points.iter().enumerate().filter(|(i, _)| !taken[*i]).map(|(_, p)| *p).take(missing));
        }
    }

    return selection;
}

struct Weighted {
    priority: f64,
    index: usize,
}

impl PartialEq for Weighted {

    fn eq(&self, other: &Self) -> bool {
        return self.priority.total_cmp(&other.priority) == Ordering::Equal;
    }
}

impl Eq for Weighted {}

impl PartialOrd for Weighted {

    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        return Some(self.cmp(other));
    }
}

impl Ord for Weighted {

    fn cmp(&self, other: &Self) -> Ordering {
        return self.priority.total_cmp(&other.priority);
    }
}

/// A-Res: one pass keeping the `n` highest priorities `u^(1/intensity)` in a min-heap
fn weighted_reservoir_sampling(points: &[Point], n: usize, rng: &mut StdRng) -> Vec<Point> {

    let mut heap: BinaryHeap<Reverse<Weighted>> = BinaryHeap::with_capacity(n + 1);

    for (index, point) in points.iter().enumerate() {

        let u: f64 = rng.gen();
        let priority = match point.intensity > 0.0 {
            true => u.powf(1.0 / point.intensity),
            false => 0.0,
        };

        if heap.len() < n {
            heap.push(Reverse(Weighted { priority, index }));
            continue;
        }

        let lowest = match heap.peek() {
            Some(Reverse(lowest)) => lowest.priority,
            None => continue,
        };

        if lowest < priority {
            heap.pop();
            heap.push(Reverse(Weighted { priority, index }));
        }
    }

    return heap.into_iter().map(|Reverse(w)| points[w.index]).collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn random_points(n: usize, seed: u64) -> Vec<Point> {

        let mut rng = StdRng::seed_from_u64(seed);

        return (0..n).map(|i| {
            let mut point = Point::new(rng.gen_range(100.0..2000.0), rng.gen_range(0.0..60.0), rng.gen_range(1.0..1e5));
            point.id = i as u32;
            point
        }).collect();
    }

    #[test]
    fn quick_every_strategy_returns_exactly_n() {

        for strategy in Strategy::ALL.iter() {
            let mut summarizer = Summarizer::new(*strategy, 3);

            for (len, n) in [(10, 1), (10, 9), (40, 7), (100, 43), (1000, 100), (5000, 8)] {
                let points = random_points(len, len as u64);
                let summary = summarizer.summarize(&points, n);
                assert_eq!(summary.len(), n, "{} on {} points", strategy, len);

                let ids: HashSet<u32> = summary.iter().map(|p| p.id).collect();
                assert_eq!(ids.len(), n, "{} repeated a point", strategy);
            }
        }
    }

    #[test]
    fn quick_small_sets_are_returned_whole() {

        let points = random_points(5, 1);

        for strategy in Strategy::ALL.iter() {
            let mut summarizer = Summarizer::new(*strategy, 0);
            assert_eq!(summarizer.summarize(&points, 5), points);
            assert_eq!(summarizer.summarize(&points, 50), points);
        }
    }

    #[test]
    fn quick_intensity_cutoff_keeps_top_n() {

        let points = random_points(500, 11);
        let mut summarizer = Summarizer::new(Strategy::IntensityCutoff, 0);

        let summary = summarizer.summarize(&points, 50);

        let mut sorted = points.clone();
        sorted.sort_by(|a, b| b.intensity.total_cmp(&a.intensity));
        let expected: HashSet<u32> = sorted[..50].iter().map(|p| p.id).collect();
        let got: HashSet<u32> = summary.iter().map(|p| p.id).collect();

        assert_eq!(got, expected);
    }

    #[test]
    fn quick_weighted_striding_handles_zero_intensity() {

        let points: Vec<Point> = (0..20).map(|i| {
            let mut point = Point::new(i as f64, 1.0, 0.0);
            point.id = i;
            point
        }).collect();

        for strategy in [Strategy::WeightedStriding, Strategy::WeightedSampling, Strategy::WeightedReservoirSampling] {
            let mut summarizer = Summarizer::new(strategy, 0);
            assert_eq!(summarizer.summarize(&points, 6).len(), 6);
        }
    }

    #[test]
    fn quick_same_seed_same_sample() {

        let points = random_points(2000, 5);

        let mut a = Summarizer::new(Strategy::UniformSampling, 99);
        let mut b = Summarizer::new(Strategy::UniformSampling, 99);
        assert_eq!(a.summarize(&points, 100), b.summarize(&points, 100));
    }

    #[test]
    fn quick_strategy_names_parse() {

        assert_eq!("weightedstriding".parse::<Strategy>().unwrap(), Strategy::WeightedStriding);
        assert_eq!("IntensityCutoff".parse::<Strategy>().unwrap(), Strategy::IntensityCutoff);
        assert!("Median".parse::<Strategy>().is_err());
    }
}
