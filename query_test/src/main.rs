use mz_tree::data::{DataRange, Point};
use mz_tree::error::Result;
use mz_tree::progress;
use mz_tree::tree::{self, TreeConfig};

use clap::Parser;
use glob::glob;
use log::{info, warn};
use rand::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser, Debug)] #[command(author, version, about, long_about = None)]
struct Args {

    //Glob matching the tree files to benchmark
    #[arg(short, long)]
    pattern: String,

    //Random boxes per tree
    #[arg(short, long, default_value_t = 10)]
    num_queries: usize,

    //Box width as a fraction of each data axis
    #[arg(short, long, default_value_t = 0.1)]
    fraction: f64,

    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    //Writes the points of the last exact query as JSON
    #[arg(short, long)]
    dump_filename: Option<PathBuf>,
}

fn main() {

    env_logger::init();

    let args = Args::parse();

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut last_result: Vec<Point> = Vec::new();

    let entries = match glob(&args.pattern) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Bad pattern {}: {}", args.pattern, e);
            return;
        },
    };

    for entry in entries.flatten() {

        //side files of a tree match too
        let name = entry.to_string_lossy();
        if name.ends_with(mz_tree::layout::POINTS_SUFFIX) || name.ends_with(mz_tree::layout::INTENSITY_SUFFIX) {
            continue;
        }

        match param_sweep(&entry, &args, &mut rng) {
            Ok(points) => last_result = points,
            Err(e) => warn!("Skipping {:?}: {}", entry, e),
        }
    }

    if let Some(dump_filename) = &args.dump_filename {
        match File::create(dump_filename).map_err(serde_json::Error::io).and_then(|file| serde_json::to_writer_pretty(file, &last_result)) {
            Ok(()) => info!("Wrote {} points to {:?}", last_result.len(), dump_filename),
            Err(e) => warn!("Could not write {:?}: {}", dump_filename, e),
        }
    }
}

fn random_box(bounds: &DataRange, fraction: f64, rng: &mut StdRng) -> DataRange {

    let mz_width = (bounds.mz_max - bounds.mz_min) * fraction;
    let rt_width = (bounds.rt_max - bounds.rt_min) * fraction as f32;

    let mz_min = bounds.mz_min + rng.gen::<f64>() * (bounds.mz_max - bounds.mz_min - mz_width);
    let rt_min = bounds.rt_min + rng.gen::<f32>() * (bounds.rt_max - bounds.rt_min - rt_width);

    return DataRange::new(mz_min, mz_min + mz_width, rt_min, rt_min + rt_width);
}

fn param_sweep(filename: &Path, args: &Args, rng: &mut StdRng) -> Result<Vec<Point>> {

    let start = Instant::now();
    let mut tree = tree::Tree::open(filename, TreeConfig::default(), &mut progress::ignore)?;
    info!("{:?} opened in {}", filename, start.elapsed().as_secs_f64());

    let bounds = match tree.data_bounds() {
        Some(bounds) => bounds,
        None => return Ok(Vec::new()),
    };

    let mut last_result = Vec::new();

    for _ in 0..args.num_queries {

        let range = random_box(&bounds, args.fraction, rng);

        for budget in [0, 1000, 5000, 20000].into_iter() {

            let start = Instant::now();

            let points = tree.query(range.mz_min, range.mz_max, range.rt_min, range.rt_max, budget)?;

            let duration = start.elapsed();

            info!("{:?} budget {}: {} points in {}", filename, budget, points.len(), duration.as_secs_f64());

            if budget == 0 {
                last_result = points;
            }
        }
    }

    let stats = tree.cache().stats();
    info!("{:?} cache hit rate {:.3} ({} of {} slots)", filename, stats.hit_rate(), stats.size, stats.capacity);

    tree.close()?;

    return Ok(last_result);
}
