use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pdf_squeeze::{analyze_path, CompressOptions, CompressionPolicy, Compressor, KIB};

/// Shrink a PDF to a target size
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compress INPUT into OUTPUT
    Compress {
        /// Input PDF file
        input: PathBuf,

        /// Output PDF file
        output: PathBuf,

        /// Target size in KB (default: half the input)
        #[arg(long)]
        target_kb: Option<u64>,

        /// Tier ladder to search
        #[arg(long, value_enum, default_value_t = Policy::Standard)]
        policy: Policy,

        /// Give up on further tiers after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Fail instead of copying the input through when nothing got smaller
        #[arg(long)]
        strict: bool,
    },
    /// Print page, image and size information about INPUT
    Analyze {
        /// Input PDF file
        input: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Policy {
    Standard,
    Gentle,
}

impl From<Policy> for CompressionPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Standard => CompressionPolicy::standard(),
            Policy::Gentle => CompressionPolicy::gentle(),
        }
    }
}

fn kb(bytes: u64) -> f64 {
    bytes as f64 / KIB as f64
}

fn target_bytes(target_kb: Option<u64>) -> Option<u64> {
    target_kb.map(|k| k.saturating_mul(KIB))
}

fn run_compress(
    input: PathBuf,
    output: PathBuf,
    target_kb: Option<u64>,
    policy: Policy,
    timeout_secs: Option<u64>,
    strict: bool,
) -> Result<()> {
    let options = CompressOptions {
        target_size_bytes: target_bytes(target_kb),
        policy: policy.into(),
        timeout: timeout_secs.map(Duration::from_secs),
        fail_on_no_reduction: strict,
        ..CompressOptions::default()
    };

    println!("Compressing PDF: {:?}", input);
    let start = Instant::now();
    let report = Compressor::new(options)
        .compress(&input, &output)
        .with_context(|| format!("Failed to compress {:?}", input))?;
    println!("Finished in {:.2?}", start.elapsed());

    for attempt in &report.attempts {
        let size = match attempt.size_bytes {
            Some(size) => format!("{:.0} KB", kb(size)),
            None => "-".to_string(),
        };
        let status = match &attempt.error {
            Some(error) => error.clone(),
            None => "ok".to_string(),
        };
        println!(
            "  {:<11} q{:<3} {:>3} dpi  {:>10}  {} images replaced  {}",
            attempt.tier.label,
            attempt.tier.quality,
            attempt.tier.max_dimension_dpi,
            size,
            attempt.images.replaced,
            status
        );
    }

    println!("Outcome:       {}", report.outcome);
    println!("Target size:   {:.0} KB", kb(report.budget.bytes));
    println!("Original size: {:.0} KB", kb(report.original_size_bytes));
    println!(
        "New size:      {:.0} KB ({:.1}% smaller)",
        kb(report.compressed_size_bytes),
        report.reduction_percent()
    );

    Ok(())
}

fn run_analyze(input: PathBuf) -> Result<()> {
    let analysis =
        analyze_path(&input).with_context(|| format!("Failed to analyze {:?}", input))?;

    println!("File size:      {:.0} KB", kb(analysis.file_size_bytes));
    println!("Pages:          {}", analysis.page_count);
    println!("Images:         {}", analysis.image_count);
    println!("Image data:     {:.0} KB", kb(analysis.total_image_bytes()));
    println!("Scanned:        {}", if analysis.is_scanned { "yes" } else { "no" });
    println!(
        "Sensible floor: {:.0} KB",
        kb(analysis.estimated_min_size_bytes())
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match args.command {
        Command::Compress {
            input,
            output,
            target_kb,
            policy,
            timeout_secs,
            strict,
        } => run_compress(input, output, target_kb, policy, timeout_secs, strict),
        Command::Analyze { input } => run_analyze(input),
    }
}
