//! Command line entry point: parses flags, loads `.env`, runs the pipeline and
//! writes `report.json`, `records.jsonl` and `records.parquet`.

use std::fs::create_dir_all;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kpi_extract::config::{parse_kpi_list, require_api_key, API_KEY_VAR, DEFAULT_BASE_URL};
use kpi_extract::report::{write_json, write_jsonl, write_parquet};
use kpi_extract::{render_chunks, InputKind, LlmConfig, OpenAiExtractor, Pipeline, RunConfig, SchemaErrorPolicy, ValidatorConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum InputKindArg {
    Xlsx,
    Csv,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SchemaErrorArg {
    SkipChunk,
    AbortFile,
}

#[derive(Debug, Parser)]
#[command(name = "kpi-extract", version, about = "Extract financial KPIs from spreadsheets and validate them against the source")]
struct Cli {
    /// Directory holding the input files
    #[arg(long, value_name = "DIR")]
    input_dir: PathBuf,

    /// Comma-separated KPI names (e.g., "Revenue,EBITDA")
    #[arg(long, value_name = "CSV")]
    kpis: String,

    /// Workbooks (searched recursively) or pre-converted CSV files (top level only)
    #[arg(long, value_enum, default_value = "xlsx")]
    input_kind: InputKindArg,

    /// Output directory (report JSON, JSONL, Parquet)
    #[arg(long, value_name = "DIR", default_value = "./out")]
    out_dir: PathBuf,

    /// OpenAI model ID
    #[arg(long, default_value = "gpt-5")]
    model: String,

    /// OpenAI-compatible API base URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Data rows per chunk
    #[arg(long, default_value_t = 40)]
    chunk_rows: usize,

    /// Rendered characters per chunk before it is split further
    #[arg(long, default_value_t = 10_000)]
    max_chunk_chars: usize,

    /// Max attempts per API call
    #[arg(long, default_value_t = 3)]
    max_retries: usize,

    /// Parallel chunk requests within a file (1 = sequential)
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Overall HTTP request timeout in seconds
    #[arg(long, default_value_t = 120)]
    timeout_seconds: u64,

    /// Absolute tolerance for numeric comparison
    #[arg(long, default_value_t = 1e-9)]
    tolerance: f64,

    /// Magnitude above which a value is reported as implausible
    #[arg(long, default_value_t = 1e12)]
    sanity_threshold: f64,

    /// What a schema-violating model answer does to its file
    #[arg(long, value_enum, default_value = "skip-chunk")]
    on_schema_error: SchemaErrorArg,

    /// Also write each normalized sheet to <file dir>/converted_csvs/
    #[arg(long, default_value_t = false)]
    export_csv: bool,

    /// Normalize and chunk only; write rendered chunks to <out-dir>/chunks/
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Hide the progress bar
    #[arg(long, default_value_t = false)]
    no_progress: bool,
}

impl Cli {
    fn run_config(&self) -> RunConfig {
        let mut config = RunConfig::new(&self.input_dir, parse_kpi_list(&self.kpis));
        config.input_kind = match self.input_kind {
            InputKindArg::Xlsx => InputKind::Spreadsheet,
            InputKindArg::Csv => InputKind::Csv,
        };
        config.chunk_rows = self.chunk_rows;
        config.max_chunk_chars = self.max_chunk_chars;
        config.concurrency = self.concurrency;
        config.on_schema_error = match self.on_schema_error {
            SchemaErrorArg::SkipChunk => SchemaErrorPolicy::SkipChunk,
            SchemaErrorArg::AbortFile => SchemaErrorPolicy::AbortFile,
        };
        config.export_csv = self.export_csv;
        config.show_progress = !self.no_progress;
        config.validator = ValidatorConfig {
            tolerance: self.tolerance,
            sanity_threshold: self.sanity_threshold,
        };
        config
    }
}

fn main() -> Result<()> {
    // ---- Logging setup ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    dotenvy::dotenv().ok(); // loads variables from .env if present

    let config = cli.run_config();
    config.validate().context("Invalid configuration")?;
    create_dir_all(&cli.out_dir).context("Failed to create out-dir")?;

    info!("🎯 KPIs: {}", config.kpis.join(", "));
    info!(
        "⚙️  ChunkRows={}, MaxChunkChars={}, Concurrency={}",
        config.chunk_rows, config.max_chunk_chars, config.concurrency
    );

    if cli.dry_run {
        let written = render_chunks(&config, &cli.out_dir).context("Dry run failed")?;
        info!("🧪 Dry run: wrote {written} chunks to {}", cli.out_dir.join("chunks").display());
        return Ok(());
    }

    // ---- Resolve OpenAI API key ----
    let api_key = require_api_key(std::env::var(API_KEY_VAR).ok()).context("Cannot call the model")?;
    let mut llm = LlmConfig::new(api_key, &cli.model);
    llm.base_url = cli.base_url.clone();
    llm.max_retries = cli.max_retries;
    llm.timeout_seconds = cli.timeout_seconds;
    info!("🧠 Model: {} ({})", llm.model, llm.base_url);

    let extractor = OpenAiExtractor::new(llm).context("Failed to build the extraction client")?;
    let pipeline = Pipeline::new(config, Box::new(extractor)).context("Failed to build the pipeline")?;
    let report = pipeline.run(&cli.model).context("Pipeline run failed")?;
    info!("🆔 Run ID: {}", report.run_id);

    if report.files.is_empty() {
        warn!("No input files found. Nothing extracted.");
    }

    // ---- Write outputs ----
    let report_path = cli.out_dir.join("report.json");
    let jsonl_path = cli.out_dir.join("records.jsonl");
    let parquet_path = cli.out_dir.join("records.parquet");

    let flat = report.flatten();
    write_json(&report, &report_path).context("Failed to write report")?;
    write_jsonl(&flat, &jsonl_path).context("Failed to write JSONL")?;
    write_parquet(&flat, &parquet_path).context("Failed to write Parquet")?;

    info!("📦 Outputs:");
    info!("  • Report:  {}", report_path.display());
    info!("  • JSONL:   {}", jsonl_path.display());
    info!("  • Parquet: {}", parquet_path.display());

    info!("✅ All done.");
    Ok(())
}
