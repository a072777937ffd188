//! Command line entry point for bulk imports from CSV files.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use sombra_import::{
    batch_importer,
    import::{BadCollector, ImportReport},
    input::{csv::CsvInput, IdType},
    staging::{ExecutionMonitor, ProgressMonitor, SilentMonitor},
    storage::BatchingStores,
    ImportConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sombra-import",
    version,
    about = "Bulk import CSV nodes and relationships into empty record stores"
)]
struct Cli {
    #[arg(long, value_name = "DIR", help = "Directory the stores are created in")]
    into: PathBuf,

    #[arg(long, value_name = "FILE", num_args = 1.., required = true, help = "Node CSV files")]
    nodes: Vec<PathBuf>,

    #[arg(long, value_name = "FILE", num_args = 1.., help = "Relationship CSV files")]
    relationships: Vec<PathBuf>,

    #[arg(long, value_name = "FILE", env = "SOMBRA_IMPORT_CONFIG", help = "TOML import configuration")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "How input ids are interpreted")]
    id_type: Option<IdType>,

    #[arg(long, help = "Degree at which a node becomes dense")]
    dense_node_threshold: Option<u32>,

    #[arg(long = "dense-label", value_name = "LABEL", help = "Treat nodes with this label as dense")]
    dense_labels: Vec<String>,

    #[arg(long, value_name = "BYTES", help = "Memory budget for import caches")]
    max_memory: Option<u64>,

    #[arg(long, help = "Worker threads per step")]
    processors: Option<usize>,

    #[arg(long, help = "Bad entities tolerated before the import fails")]
    bad_tolerance: Option<u64>,

    #[arg(long, value_name = "FILE", help = "Write rejected entities to this file")]
    report: Option<PathBuf>,

    #[arg(long, default_value = ",", value_parser = parse_delimiter, help = "CSV field delimiter")]
    delimiter: u8,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text, help = "Output format of the final report")]
    format: OutputFormat,

    #[arg(long, help = "Disable progress output")]
    quiet: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value.as_bytes() {
        [byte] => Ok(*byte),
        _ if value == "\\t" || value == "tab" => Ok(b'\t'),
        _ => Err(format!("delimiter must be a single byte, got {value:?}")),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    let input = CsvInput::new(cli.nodes.clone(), cli.relationships.clone(), config.id_type)
        .with_delimiter(cli.delimiter);
    let mut collector = BadCollector::new(config.bad_tolerance, config.max_retained_bad_entries);
    if let Some(path) = &cli.report {
        collector = collector.with_report(Box::new(BufWriter::new(File::create(path)?)));
    }
    let monitor: Box<dyn ExecutionMonitor> = if cli.quiet {
        Box::new(SilentMonitor)
    } else {
        Box::new(ProgressMonitor::new())
    };

    let stores = BatchingStores::create(&cli.into)?;
    let importer = batch_importer(config);
    let outcome = importer.do_import(&input, &stores, &collector, monitor.as_ref());
    collector.flush()?;
    let report = outcome?;
    emit(cli.format, &report)?;
    Ok(())
}

fn build_config(cli: &Cli) -> Result<ImportConfig, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => ImportConfig::from_toml_file(path)?,
        None => ImportConfig::default(),
    };
    if let Some(id_type) = cli.id_type {
        config = config.id_type(id_type);
    }
    if let Some(threshold) = cli.dense_node_threshold {
        config = config.dense_node_threshold(threshold);
    }
    for label in &cli.dense_labels {
        config = config.dense_label(label.clone());
    }
    if let Some(bytes) = cli.max_memory {
        config = config.max_memory(bytes);
    }
    if let Some(processors) = cli.processors {
        config = config.max_processors(processors);
    }
    if cli.bad_tolerance.is_some() {
        config = config.bad_tolerance(cli.bad_tolerance);
    }
    config.validate()?;
    Ok(config)
}

fn emit(format: OutputFormat, report: &ImportReport) -> Result<(), Box<dyn Error>> {
    match format {
        OutputFormat::Text => {
            println!("{}", report.summary_line());
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}
