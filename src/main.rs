use clap::Parser;
use contfilter::config::FilterConfig;
use contfilter::cursor::SortedCursor;
use contfilter::engine::ContaminationFilter;
use contfilter::error::FilterError;
use contfilter::process::Samtools;
use contfilter::report;
use contfilter::sink::RecordSink;
use log::{error, info, warn};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;

/// Remove reads that align at least as well to a contamination reference as
/// to the sample reference.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// BAM file of the sample to filter, sorted by read name. SAM text is read
    /// from standard input when omitted.
    #[clap(short = 's', long, value_parser)]
    sample: Option<PathBuf>,

    /// BAM files of the same reads mapped to contamination references, sorted by read name
    #[clap(value_parser, required = true, num_args = 1..)]
    contamination: Vec<PathBuf>,

    /// Output BAM file for the reads that survive filtering
    #[clap(short = 'o', long, value_parser)]
    output: PathBuf,

    /// Minimum alignment length
    #[clap(short = 'l', long, value_parser, default_value_t = 60)]
    min_length: usize,

    /// Maximum edit distance of a sample alignment
    #[clap(short = 'd', long, value_parser, default_value_t = 5)]
    max_distance: u32,

    /// Score penalty per edit
    #[clap(long, value_parser, default_value_t = 2.0)]
    penalty: f64,

    /// Reject a read when a contamination score comes within this margin of the sample score
    #[clap(long, value_parser, default_value_t = 1.0)]
    margin: f64,

    /// Stop after this many sample reads
    #[clap(short = 'n', long, value_parser)]
    limit: Option<u64>,

    /// Drop reads mapped to ERCC spike-in controls
    #[clap(long, action)]
    exclude_ercc: bool,

    /// SAM tag holding the edit distance
    #[clap(long, value_parser, default_value = "nM")]
    distance_tag: String,

    /// Write the decision for every read to this file
    #[clap(long, value_parser)]
    read_log: Option<PathBuf>,

    /// samtools executable used to decode and encode BAM files
    #[clap(long, value_parser, default_value = "samtools")]
    samtools: PathBuf,

    /// Additional compression threads for writing the output
    #[clap(short = 't', long, value_parser, default_value_t = 0)]
    threads: usize,

    /// Verbosity level (0 = error, 1 = info, 2 = debug)
    #[clap(short, long, default_value = "0")]
    verbose: u8,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    let config = FilterConfig {
        min_length: args.min_length,
        max_distance: args.max_distance,
        penalty: args.penalty,
        margin: args.margin,
        limit: args.limit,
        exclude_ercc: args.exclude_ercc,
        distance_tag: args.distance_tag.clone(),
    };
    config.validate()?;
    info!("{:?}", config);

    run(&args, config).map_err(|e| {
        error!("{}", e);
        io::Error::from(e)
    })
}

fn run(args: &Args, config: FilterConfig) -> Result<(), FilterError> {
    let samtools = Samtools::new(&args.samtools).with_threads(args.threads);

    let sample = match &args.sample {
        Some(path) => SortedCursor::open(path, &samtools, &config.distance_tag)?,
        None => SortedCursor::from_stdin(&config.distance_tag)?,
    };
    let contaminants = args
        .contamination
        .iter()
        .map(|path| SortedCursor::open(path, &samtools, &config.distance_tag))
        .collect::<Result<Vec<_>, _>>()?;

    let read_log = match &args.read_log {
        Some(path) => {
            let file = File::create(path).map_err(|e| FilterError::Open {
                source: path.display().to_string(),
                reason: e.to_string(),
            })?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    if sample.header().is_empty() {
        warn!(
            "No header found for '{}'; the output may not be readable",
            sample.source()
        );
    }
    let mut sink = RecordSink::open(&args.output, &samtools)?;
    sink.write_header(sample.header())?;

    let mut engine = ContaminationFilter::new(config, sample, contaminants);
    if let Some(read_log) = read_log {
        engine = engine.with_read_log(Box::new(read_log));
    }

    // Every process is joined whether or not the run succeeded
    let outcome = engine.run(&mut sink);
    let sources = engine.source_names();
    let closed = engine.close();
    let written = sink.close();

    outcome?;
    let stats = closed?;
    written?;

    print!("{}", report::summary(&stats, &sources));
    Ok(())
}
