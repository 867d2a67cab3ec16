use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use lincluster::config::{parse_config_file, Config, Sensitivity};
use lincluster::logging::init_logger;

#[derive(Parser)]
#[command(name = "lincluster")]
#[command(about = "External-memory linear-time clustering of protein sequence sets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster a sequence database; run the same command from several
    /// machines with a shared job directory to add workers
    Cluster {
        /// Input database: FASTA/FASTQ file or .vol manifest
        #[arg(short, long)]
        database: Option<PathBuf>,
        /// Output clustering table (representative <TAB> member)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Job working directory on shared storage (default: <output>.job)
        #[arg(long)]
        job_dir: Option<PathBuf>,
        /// Worker threads per process
        #[arg(short, long)]
        threads: Option<usize>,
        /// Force a single round at this sensitivity (faster, fast, default,
        /// sensitive)
        #[arg(short, long)]
        sensitivity: Option<Sensitivity>,
        /// Per-sequence seed sketch cap (0 = preset default)
        #[arg(long)]
        sketch_size: Option<usize>,
        /// Uni-directional member coverage percentage
        #[arg(long)]
        member_cover: Option<f64>,
        /// Enable bi-directional coverage at this percentage
        #[arg(long)]
        mutual_cover: Option<f64>,
        /// Approximate identity floor selecting the round sequence
        #[arg(long)]
        approx_min_id: Option<f64>,
        /// Target residue mass per chunk (byte expression, e.g. 8G)
        #[arg(long)]
        chunk_size: Option<String>,
        /// Skip seed groups larger than db_size / ratio (0 = off)
        #[arg(long)]
        promiscuous_seed_ratio: Option<i64>,
        /// Radix bits of the bucket layout
        #[arg(long)]
        radix_bits: Option<u32>,
        /// In-memory budget for the external sort (byte expression)
        #[arg(long)]
        sort_memory: Option<String>,
        /// TOML file supplying any of the above; flags win
        #[arg(long)]
        config: Option<PathBuf>,
        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Cluster {
            database,
            output,
            job_dir,
            threads,
            sensitivity,
            sketch_size,
            member_cover,
            mutual_cover,
            approx_min_id,
            chunk_size,
            promiscuous_seed_ratio,
            radix_bits,
            sort_memory,
            config,
            verbose,
        } => {
            init_logger(verbose);

            let file = match &config {
                Some(path) => parse_config_file(path)?,
                None => Default::default(),
            };
            let file_sensitivity = file
                .sensitivity
                .as_deref()
                .map(str::parse::<Sensitivity>)
                .transpose()?;
            let file_sort_memory = file
                .sort_memory
                .as_deref()
                .map(lincluster::config::parse_bytes)
                .transpose()?;
            let cli_sort_memory = sort_memory
                .as_deref()
                .map(lincluster::config::parse_bytes)
                .transpose()?;

            let output_file = output.or(file.output).unwrap_or_default();
            let job_dir = job_dir.or(file.job_dir).unwrap_or_else(|| {
                let mut dir = output_file.as_os_str().to_owned();
                dir.push(".job");
                PathBuf::from(dir)
            });
            let cfg = Config {
                database: database.or(file.database).unwrap_or_default(),
                output_file,
                job_dir,
                threads: threads
                    .or(file.threads)
                    .unwrap_or_else(num_threads_default),
                sensitivity: sensitivity.or(file_sensitivity),
                sketch_size: sketch_size.or(file.sketch_size).unwrap_or(0),
                member_cover: member_cover.or(file.member_cover).unwrap_or(80.0),
                mutual_cover: mutual_cover.or(file.mutual_cover),
                approx_min_id: approx_min_id.or(file.approx_min_id).unwrap_or(0.0),
                linclust_chunk_size: chunk_size
                    .or(file.chunk_size)
                    .unwrap_or_else(|| "8G".to_string()),
                promiscuous_seed_ratio: promiscuous_seed_ratio
                    .or(file.promiscuous_seed_ratio)
                    .unwrap_or(32),
                radix_bits: radix_bits.or(file.radix_bits).unwrap_or(8),
                sort_memory: cli_sort_memory
                    .or(file_sort_memory)
                    .unwrap_or(1 << 30),
            };
            cfg.validate()?;

            rayon::ThreadPoolBuilder::new()
                .num_threads(cfg.threads)
                .build_global()
                .ok();

            lincluster::run(&cfg)
        }
    }
}

fn num_threads_default() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
