//! Pipeline coordinator.
//!
//! Each input file walks an explicit state machine
//! `Discover → Normalize → Chunk → Extract → Dedup → Validate → Done`,
//! dropping to `Failed` when the file cannot be read or the schema-error
//! policy aborts it. Files are processed one after another in sorted order;
//! the chunks of one file may be extracted in parallel on a rayon pool, and
//! their results are always collected in chunk order before dedup.

use std::fs;
use std::path::{Component, Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::chunk::{chunk_table, render_chunk};
use crate::config::{InputKind, RunConfig, SchemaErrorPolicy};
use crate::dedup::dedup;
use crate::error::{ExtractError, Result};
use crate::extract::KpiExtractor;
use crate::normalize::{export_csv, load_tables, EXPORT_DIR};
use crate::record::CandidateRecord;
use crate::report::{FileReport, FileStatus, Report};
use crate::table::{SourceTable, TableChunk};
use crate::validate::{FileValidation, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discover,
    Normalize,
    Chunk,
    Extract,
    Dedup,
    Validate,
    Done,
    Failed,
}

/// Lists the input files of `dir` in sorted order.
///
/// Workbooks are matched recursively by case-sensitive `.xlsx`/`.xls` suffix,
/// skipping the CSV export directory; CSV files only at the top level.
pub fn discover_files(dir: &Path, kind: InputKind) -> Result<Vec<PathBuf>> {
    let dir = &input_root(dir);
    let base = glob::Pattern::escape(&dir.to_string_lossy());
    let patterns: Vec<String> = match kind {
        InputKind::Spreadsheet => vec![format!("{base}/**/*.xlsx"), format!("{base}/**/*.xls")],
        InputKind::Csv => vec![format!("{base}/*.csv")],
    };

    let mut files = Vec::new();
    for pattern in patterns {
        for entry in glob::glob(&pattern)? {
            let path = input_root(&entry?);
            let in_export_dir = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .components()
                .any(|c| c == Component::Normal(EXPORT_DIR.as_ref()));
            if path.is_file() && !in_export_dir {
                files.push(path);
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// `dir` without leading `./` components, which glob drops from the paths it yields.
fn input_root(dir: &Path) -> PathBuf {
    let root: PathBuf = dir
        .components()
        .skip_while(|c| *c == Component::CurDir)
        .collect();
    if root.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        root
    }
}

/// Report key of `path`: its location relative to the input directory.
fn report_key(dir: &Path, path: &Path) -> String {
    path.strip_prefix(input_root(dir))
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

pub struct Pipeline {
    config: RunConfig,
    extractor: Box<dyn KpiExtractor>,
    pool: rayon::ThreadPool,
}

/// Per-file working state, owned by the coordinator while the file is processed.
#[derive(Default)]
struct FileRun {
    key: String,
    tables: Vec<SourceTable>,
    chunks: Vec<TableChunk>,
    extracted: Vec<CandidateRecord>,
    unique: Vec<CandidateRecord>,
    validation: FileValidation,
    sheet_issues: Vec<String>,
    failures: Vec<String>,
    error: Option<String>,
}

impl Pipeline {
    pub fn new(config: RunConfig, extractor: Box<dyn KpiExtractor>) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.concurrency.max(1))
            .build()?;
        Ok(Self {
            config,
            extractor,
            pool,
        })
    }

    /// Processes every discovered file and assembles the report.
    pub fn run(&self, model: &str) -> Result<Report> {
        let files = discover_files(&self.config.input_dir, self.config.input_kind)?;
        info!("📂 Discovered {} input files in {}", files.len(), self.config.input_dir.display());

        let progress = self.progress_bar();
        let mut report = Report::new(model, self.config.kpis.clone());
        for path in &files {
            let key = report_key(&self.config.input_dir, path);
            progress.set_message(key.clone());
            let file_report = self.process_file(path, &key, &progress);
            report.files.insert(key, file_report);
        }
        progress.finish_with_message("done");

        let failed = report.files.values().filter(|f| f.status == FileStatus::Failed).count();
        let (valid, total) = report.totals();
        info!("🧮 {} files ({failed} failed), {valid}/{total} records valid", report.files.len());
        Ok(report)
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}")
            .map(|s| s.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb
    }

    /// Drives one file through the stage machine. Never fails: problems end up in the file report.
    pub fn process_file(&self, path: &Path, key: &str, progress: &ProgressBar) -> FileReport {
        let mut run = FileRun {
            key: key.to_string(),
            ..FileRun::default()
        };
        let mut stage = Stage::Discover;
        loop {
            let next = match stage {
                Stage::Discover => Stage::Normalize,
                Stage::Normalize => self.normalize(path, &mut run),
                Stage::Chunk => self.chunk(&mut run, progress),
                Stage::Extract => self.extract(&mut run, progress),
                Stage::Dedup => {
                    run.unique = dedup(&run.extracted);
                    info!("🧹 {}: {} records after dedup ({} extracted)", run.key, run.unique.len(), run.extracted.len());
                    Stage::Validate
                }
                Stage::Validate => {
                    let validator = Validator::new(&self.config.kpis, self.config.validator);
                    let source = load_tables(path).map(|loaded| loaded.tables);
                    run.validation = validator.validate_file(&run.extracted, &run.unique, source);
                    Stage::Done
                }
                Stage::Done | Stage::Failed => break,
            };
            debug!("{}: {stage:?} -> {next:?}", run.key);
            stage = next;
        }

        if stage == Stage::Failed {
            let error = run.error.unwrap_or_else(|| "failed".to_string());
            error!("❌ {}: {error}", run.key);
            return FileReport::failed(error, run.failures);
        }
        let mut issues = run.sheet_issues;
        issues.extend(run.validation.issues);
        FileReport {
            status: FileStatus::Done,
            error: None,
            validated_kpis: run.validation.validated_kpis,
            unextracted_numbers: run.validation.unextracted_numbers,
            issues,
            extraction_failures: run.failures,
        }
    }

    fn normalize(&self, path: &Path, run: &mut FileRun) -> Stage {
        info!("📄 Normalizing {}", run.key);
        let loaded = match load_tables(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                run.error = Some(e.to_string());
                return Stage::Failed;
            }
        };
        run.sheet_issues = loaded
            .sheet_errors
            .iter()
            .map(|e| format!("Sheet skipped: {e}"))
            .collect();
        if self.config.export_csv {
            if let Err(e) = export_csv(path, &loaded.tables) {
                warn!("⚠️ CSV export of {} failed: {e}", run.key);
            }
        }
        run.tables = loaded.tables;
        Stage::Chunk
    }

    fn chunk(&self, run: &mut FileRun, progress: &ProgressBar) -> Stage {
        run.chunks = run
            .tables
            .iter()
            .flat_map(|t| chunk_table(t, self.config.chunk_rows, self.config.max_chunk_chars))
            .collect();
        info!("🪚 {}: {} tables, {} chunks", run.key, run.tables.len(), run.chunks.len());
        progress.inc_length(run.chunks.len() as u64);
        Stage::Extract
    }

    fn extract(&self, run: &mut FileRun, progress: &ProgressBar) -> Stage {
        let kpis = &self.config.kpis;
        let outcomes: Vec<std::result::Result<Vec<CandidateRecord>, ExtractError>> = self.pool.install(|| {
            run.chunks
                .par_iter()
                .map(|chunk| {
                    let outcome = self.extractor.extract(chunk, kpis);
                    progress.inc(1);
                    outcome
                })
                .collect()
        });

        for (chunk, outcome) in run.chunks.iter().zip(outcomes) {
            match outcome {
                Ok(records) => {
                    run.extracted.extend(records.into_iter().map(|mut r| {
                        r.source_file = run.key.clone();
                        r
                    }));
                }
                Err(ExtractError::ContractNotInvoked(reason)) => {
                    warn!("⚠️ {}: model skipped the output contract ({reason}); treating chunk as empty", chunk.chunk_id);
                }
                Err(e @ ExtractError::Schema(_)) => {
                    let failure = format!("{}: {e}", chunk.chunk_id);
                    match self.config.on_schema_error {
                        SchemaErrorPolicy::SkipChunk => {
                            warn!("⚠️ Skipping chunk {failure}");
                            run.failures.push(failure);
                        }
                        SchemaErrorPolicy::AbortFile => {
                            run.error = Some(format!("schema violation aborted the file: {failure}"));
                            run.failures.push(failure);
                            return Stage::Failed;
                        }
                    }
                }
                Err(e) => {
                    error!("❌ Extraction failed on {}: {e}", chunk.chunk_id);
                    run.failures.push(format!("{}: {e}", chunk.chunk_id));
                }
            }
        }
        Stage::Dedup
    }
}

/// Normalizes and chunks every input file without calling the model, writing
/// each rendered chunk to `<out_dir>/chunks/`. Returns the number of chunks written.
pub fn render_chunks(config: &RunConfig, out_dir: &Path) -> Result<usize> {
    let chunk_dir = out_dir.join("chunks");
    fs::create_dir_all(&chunk_dir)?;

    let mut written = 0usize;
    for path in discover_files(&config.input_dir, config.input_kind)? {
        let key = report_key(&config.input_dir, &path);
        let loaded = match load_tables(&path) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("❌ {key}: {e}");
                continue;
            }
        };
        for table in &loaded.tables {
            let chunks = chunk_table(table, config.chunk_rows, config.max_chunk_chars);
            info!(
                "🪚 {key} / {}: {} rows, {} chunks, largest {} chars",
                table.sheet_id,
                table.rows.len(),
                chunks.len(),
                chunks.iter().map(|c| render_chunk(c).len()).max().unwrap_or(0)
            );
            for chunk in chunks {
                let name = format!("{}__{}.md", file_safe(&key), file_safe(&chunk.chunk_id));
                fs::write(chunk_dir.join(name), render_chunk(&chunk))?;
                written += 1;
            }
        }
    }
    Ok(written)
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::record::KpiValue;
    use crate::report::ValidationStatus;

    type Script = dyn Fn(&TableChunk) -> std::result::Result<Vec<CandidateRecord>, ExtractError> + Send + Sync;

    /// In-process extractor answering from a closure.
    struct ScriptedExtractor {
        script: Box<Script>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedExtractor {
        fn new(
            script: impl Fn(&TableChunk) -> std::result::Result<Vec<CandidateRecord>, ExtractError> + Send + Sync + 'static,
        ) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    script: Box::new(script),
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl KpiExtractor for ScriptedExtractor {
        fn extract(&self, chunk: &TableChunk, _kpis: &[String]) -> std::result::Result<Vec<CandidateRecord>, ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.script)(chunk)
        }
    }

    /// Reports a Revenue record for every row labelled Revenue, using the chunk's own coordinates.
    fn honest(chunk: &TableChunk) -> std::result::Result<Vec<CandidateRecord>, ExtractError> {
        Ok(chunk
            .rows
            .iter()
            .filter(|r| r.cells.first().map(String::as_str) == Some("Revenue"))
            .map(|r| {
                CandidateRecord::new("Revenue", KpiValue::Text(r.cells[1].clone()), &chunk.header[1], r.index as i64, 2)
                    .with_sheet(&chunk.sheet_id)
            })
            .collect())
    }

    fn csv_config(dir: &Path, kpis: &[&str]) -> RunConfig {
        let mut config = RunConfig::new(dir, kpis.iter().map(|k| k.to_string()).collect());
        config.input_kind = InputKind::Csv;
        config
    }

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn csv_discovery_is_flat_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.csv", "x");
        write(dir.path(), "a.csv", "x");
        write(dir.path(), "nested/c.csv", "x");
        write(dir.path(), "notes.txt", "x");
        let files = discover_files(dir.path(), InputKind::Csv).unwrap();
        let names: Vec<_> = files.iter().map(|p| report_key(dir.path(), p)).collect();
        assert_eq!(names, vec!["a.csv", "b.csv"]);
    }

    #[test]
    fn dot_relative_input_dir_still_yields_relative_keys() {
        let dir = tempfile::tempdir_in(".").unwrap();
        assert!(dir.path().starts_with("."));
        write(dir.path(), "a.csv", "KPI,2023Q1\nRevenue,100\n");
        write(dir.path(), "converted_csvs/a_a.csv", "x");

        let files = discover_files(dir.path(), InputKind::Csv).unwrap();
        let keys: Vec<_> = files.iter().map(|p| report_key(dir.path(), p)).collect();
        assert_eq!(keys, vec!["a.csv"]);

        let (extractor, _) = ScriptedExtractor::new(honest);
        let report = Pipeline::new(csv_config(dir.path(), &["Revenue"]), Box::new(extractor))
            .unwrap()
            .run("m")
            .unwrap();
        let file = &report.files["a.csv"];
        assert_eq!(file.validated_kpis[0].record.source_file, "a.csv");
    }

    #[test]
    fn input_root_drops_leading_current_dir() {
        assert_eq!(input_root(Path::new("./data/in")), PathBuf::from("data/in"));
        assert_eq!(input_root(Path::new(".")), PathBuf::from("."));
        assert_eq!(input_root(Path::new("/abs/in")), PathBuf::from("/abs/in"));
    }

    #[test]
    fn workbook_discovery_is_recursive_and_case_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "z.xlsx", "x");
        write(dir.path(), "deep/er/a.xls", "x");
        write(dir.path(), "upper.XLSX", "x");
        write(dir.path(), "converted_csvs/old.xlsx", "x");
        let files = discover_files(dir.path(), InputKind::Spreadsheet).unwrap();
        let names: Vec<_> = files.iter().map(|p| report_key(dir.path(), p)).collect();
        assert_eq!(names, vec!["deep/er/a.xls", "z.xlsx"]);
    }

    #[test]
    fn scenario_a_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "q1.csv", "KPI,2023Q1,2023Q2\nRevenue,100000,110000\n");
        let (extractor, calls) = ScriptedExtractor::new(honest);
        let pipeline = Pipeline::new(csv_config(dir.path(), &["Revenue", "EBITDA"]), Box::new(extractor)).unwrap();

        let report = pipeline.run("scripted").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let file = &report.files["q1.csv"];
        assert_eq!(file.status, FileStatus::Done);
        assert_eq!(file.validated_kpis.len(), 1);
        let v = &file.validated_kpis[0];
        assert_eq!(v.validation_status, ValidationStatus::Valid);
        assert_eq!(v.record.source_file, "q1.csv");
        assert_eq!(v.record.sheet.as_deref(), Some("q1"));
        assert_eq!(file.unextracted_numbers, vec!["110000"]);
        assert_eq!(file.issues, vec!["Missing KPI: EBITDA"]);
        assert_eq!(report.model, "scripted");
    }

    #[test]
    fn chunks_are_collected_in_order_under_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = String::from("KPI,2023Q1\n");
        for i in 0..12 {
            body.push_str(&format!("Line {i},{i}\n"));
        }
        write(dir.path(), "t.csv", &body);
        let (extractor, _) = ScriptedExtractor::new(|chunk: &TableChunk| {
            let first = &chunk.rows[0];
            Ok(vec![CandidateRecord::new(
                "Revenue",
                KpiValue::Text(first.cells[1].clone()),
                &format!("P{}", first.index),
                first.index as i64,
                2,
            )
            .with_sheet(&chunk.sheet_id)])
        });
        let mut config = csv_config(dir.path(), &["Revenue"]);
        config.chunk_rows = 1;
        config.concurrency = 4;
        let report = Pipeline::new(config, Box::new(extractor)).unwrap().run("m").unwrap();

        let headers: Vec<_> = report.files["t.csv"]
            .validated_kpis
            .iter()
            .map(|v| v.record.header.clone().unwrap_or_default())
            .collect();
        assert_eq!(headers, (1..=12).map(|i| format!("P{i}")).collect::<Vec<_>>());
    }

    fn two_chunk_file(dir: &Path) {
        write(dir, "t.csv", "KPI,2023Q1\nRevenue,100\nEBITDA,7\n");
    }

    fn schema_error_on_first_chunk(chunk: &TableChunk) -> std::result::Result<Vec<CandidateRecord>, ExtractError> {
        if chunk.start_row_offset == 1 {
            Err(ExtractError::Schema("value must be number or string".into()))
        } else {
            Ok(vec![CandidateRecord::new("EBITDA", KpiValue::Number(7.0), "2023Q1", 2, 2).with_sheet(&chunk.sheet_id)])
        }
    }

    #[test]
    fn schema_errors_skip_the_chunk_by_default() {
        let dir = tempfile::tempdir().unwrap();
        two_chunk_file(dir.path());
        let (extractor, _) = ScriptedExtractor::new(schema_error_on_first_chunk);
        let mut config = csv_config(dir.path(), &["EBITDA"]);
        config.chunk_rows = 1;
        let report = Pipeline::new(config, Box::new(extractor)).unwrap().run("m").unwrap();

        let file = &report.files["t.csv"];
        assert_eq!(file.status, FileStatus::Done);
        assert_eq!(file.extraction_failures.len(), 1);
        assert!(file.extraction_failures[0].starts_with("t-chunk-0: "));
        assert_eq!(file.validated_kpis.len(), 1);
        assert!(file.validated_kpis[0].validated);
    }

    #[test]
    fn schema_errors_can_abort_the_file() {
        let dir = tempfile::tempdir().unwrap();
        two_chunk_file(dir.path());
        let (extractor, _) = ScriptedExtractor::new(schema_error_on_first_chunk);
        let mut config = csv_config(dir.path(), &["EBITDA"]);
        config.chunk_rows = 1;
        config.on_schema_error = SchemaErrorPolicy::AbortFile;
        let report = Pipeline::new(config, Box::new(extractor)).unwrap().run("m").unwrap();

        let file = &report.files["t.csv"];
        assert_eq!(file.status, FileStatus::Failed);
        assert!(file.error.as_deref().unwrap_or_default().contains("schema violation"));
        assert!(file.validated_kpis.is_empty());
    }

    #[test]
    fn contract_misses_and_transport_errors_do_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        two_chunk_file(dir.path());
        let (extractor, _) = ScriptedExtractor::new(|chunk: &TableChunk| {
            if chunk.start_row_offset == 1 {
                Err(ExtractError::ContractNotInvoked("refusal".into()))
            } else {
                Err(ExtractError::Api {
                    status: 503,
                    attempts: 3,
                    body: "unavailable".into(),
                })
            }
        });
        let mut config = csv_config(dir.path(), &["Revenue"]);
        config.chunk_rows = 1;
        let report = Pipeline::new(config, Box::new(extractor)).unwrap().run("m").unwrap();

        let file = &report.files["t.csv"];
        assert_eq!(file.status, FileStatus::Done);
        assert_eq!(file.extraction_failures.len(), 1);
        assert!(file.extraction_failures[0].contains("503"));
        assert_eq!(file.issues, vec!["Missing KPI: Revenue"]);
        assert_eq!(file.unextracted_numbers, vec!["100"]);
    }

    #[test]
    fn unreadable_file_fails_alone() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "broken.xlsx", "not a zip");
        write(dir.path(), "empty.xls", "");
        let (extractor, calls) = ScriptedExtractor::new(honest);
        let config = RunConfig::new(dir.path(), vec!["Revenue".into()]);
        let report = Pipeline::new(config, Box::new(extractor)).unwrap().run("m").unwrap();

        assert_eq!(report.files.len(), 2);
        for file in report.files.values() {
            assert_eq!(file.status, FileStatus::Failed);
            assert!(file.error.is_some());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dry_run_writes_rendered_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        two_chunk_file(dir.path());
        let mut config = csv_config(dir.path(), &["Revenue"]);
        config.chunk_rows = 1;

        assert_eq!(render_chunks(&config, out.path()).unwrap(), 2);
        let first = fs::read_to_string(out.path().join("chunks/t.csv__t-chunk-0.md")).unwrap();
        assert!(first.contains("| 1 | Revenue | 100 |"));
    }

    #[test]
    fn csv_export_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        two_chunk_file(dir.path());
        let (extractor, _) = ScriptedExtractor::new(honest);
        let mut config = csv_config(dir.path(), &["Revenue"]);
        config.export_csv = true;
        Pipeline::new(config, Box::new(extractor)).unwrap().run("m").unwrap();
        assert!(dir.path().join("converted_csvs/t_t.csv").is_file());
    }
}
