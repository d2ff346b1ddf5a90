use mz_tree::error::Result;
use mz_tree::data::DataRange;
use mz_tree::export::CsvExporter;
use mz_tree::progress::{BuildStatus, Progress};
use mz_tree::source::CsvSource;
use mz_tree::summarize::Strategy;
use mz_tree::tree::{Tree, TreeConfig};

use kdam::{tqdm, BarExt};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;


use clap::Parser;
#[derive(Parser, Debug)] #[command(author, version, about, long_about = None)]
struct Args {

    //CSV of mz,rt,intensity[,traceID[,envelopeID]] rows
    #[arg(short, long)]
    input_filename: PathBuf,

    //Tree file to create, the point and intensity files are placed next to it
    #[arg(short, long)]
    output_filename: PathBuf,

    //YAML tree config, defaults are used when absent
    #[arg(short, long)]
    config_filename: Option<PathBuf>,

    //Overrides the summarization strategy of the config
    #[arg(short, long)]
    strategy: Option<Strategy>,

    //Writes the effective config next to the tree
    #[arg(short, long)]
    write_config: bool,

    //Exports every point of the finished tree back to CSV
    #[arg(short, long)]
    export_filename: Option<PathBuf>,
}

fn main() -> ExitCode {

    env_logger::init();

    let args = Args::parse();

    match build_from_file(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Build of {:?} failed: {}", args.output_filename, e);
            ExitCode::FAILURE
        },
    }
}

fn build_from_file(args: &Args) -> Result<()> {

    let mut config = match &args.config_filename {
        Some(filename) => TreeConfig::from_file(filename)?,
        None => TreeConfig::default(),
    };

    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }

    info!("Building {:?} from {:?} with {:?}", args.output_filename, args.input_filename, config);

    let mut source = CsvSource::new(&args.input_filename)?;

    let mut pb = tqdm!(total = 0);
    let mut status = BuildStatus::None;

    let mut report = |progress: &Progress| {
        if progress.status != status {
            status = progress.status;
            pb.reset(Some(progress.total_work as usize));
            pb.set_description(progress.status.to_string());
        }
        pb.update_to(progress.work_done as usize).ok();
    };

    let start = Instant::now();
    let mut tree = Tree::build(&args.output_filename, &mut source, config.clone(), &mut report)?;

    info!("Built {} points into {} nodes (height {}) in {:?}", tree.num_points(), tree.num_nodes(), tree.height(), start.elapsed());

    if args.write_config {
        let config_filename = args.output_filename.with_extension("yaml");
        config.to_file(&config_filename)?;
        info!("Wrote config to {:?}", config_filename);
    }

    if let Some(export_filename) = &args.export_filename {
        let mut exporter = CsvExporter::create(export_filename)?;
        exporter.export(&mut tree, &[DataRange::new(0.0, 0.0, 0.0, 0.0)], false)?;
        exporter.close()?;
    }

    return tree.close();
}
