//! Consolidation pipeline for multi-year cooperative-sector filings.
//!
//! The regulator publishes monthly filings as zip archives whose inner
//! formats drift across the years: semicolon-delimited text, tab-delimited
//! text with comma decimals, wide per-institution spreadsheets, and
//! macro-enabled workbooks whose indicators live only in pivot caches.
//! This crate reads all of them, canonicalizes institution names and
//! segments, resolves year-to-date accumulation, and merges everything
//! into three deduplicated Parquet datasets (balance, income statement,
//! CAMEL indicators) that downstream dashboards read directly.
//!
//! The pipeline is batch-oriented and idempotent: reprocessing an archive
//! replaces the rows it contributes, and merge order never changes the
//! result.

pub mod accumulate;
pub mod dates;
pub mod error;
pub mod merge;
pub mod normalize;
pub mod pivot_cache;
pub mod reader;
pub mod schema;
pub mod segments;
pub mod store;
pub mod workbook;

pub use error::{EtlError, Result};
pub use merge::{Dataset, MergeStats, NewRow};
pub use normalize::{EntityNormalizer, NormalizerConfig};
pub use pivot_cache::IndicatorMap;
pub use schema::{
    CamelCategory, CanonicalRecord, IndicatorRecord, IndicatorValue, PygValue, RawRow, Segment,
    SourceFormat,
};

use log::{info, warn};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Workbooks for second-tier institutions that file alongside the
/// cooperatives but do not belong in the datasets.
const IGNORED_WORKBOOKS: [&str; 2] = ["CONAFIPS", "FINANCOOP"];

const BALANCE_FILE: &str = "balance.parquet";
const PYG_FILE: &str = "pyg.parquet";
const INDICATORS_FILE: &str = "indicadores.parquet";

/// Where the pipeline finds its input archives. The downloading
/// collaborator sits behind this seam; tests supply fixture directories.
pub trait ArchiveSupplier {
    fn balance_archives(&self) -> Result<Vec<PathBuf>>;
    fn indicator_archives(&self) -> Result<Vec<PathBuf>>;
}

/// Supplier that scans two directories for `*.zip` archives.
pub struct DirectorySupplier {
    balance_dir: PathBuf,
    indicator_dir: PathBuf,
}

impl DirectorySupplier {
    pub fn new(balance_dir: impl Into<PathBuf>, indicator_dir: impl Into<PathBuf>) -> Self {
        DirectorySupplier {
            balance_dir: balance_dir.into(),
            indicator_dir: indicator_dir.into(),
        }
    }

    fn scan(dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut archives: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .map(|ext| ext.eq_ignore_ascii_case("zip"))
                    .unwrap_or(false)
            })
            .collect();
        archives.sort();
        Ok(archives)
    }
}

impl ArchiveSupplier for DirectorySupplier {
    fn balance_archives(&self) -> Result<Vec<PathBuf>> {
        DirectorySupplier::scan(&self.balance_dir)
    }

    fn indicator_archives(&self) -> Result<Vec<PathBuf>> {
        DirectorySupplier::scan(&self.indicator_dir)
    }
}

/// Outcome of one pipeline stage. Per-file failures are collected rather
/// than aborting the stage; `aborted` is set only when the stage stopped
/// early (indicator extraction finding no usable cache).
#[derive(Debug, Clone, Default)]
pub struct StageSummary {
    pub rows_merged: usize,
    pub rows_replaced: usize,
    pub files_failed: Vec<(String, String)>,
    pub unmatched_entities: Vec<String>,
    pub aborted: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub balance: StageSummary,
    pub pyg: StageSummary,
    pub indicators: StageSummary,
}

/// Batch pipeline: balance stage, then income statement, then indicators.
/// Single writer of the output directory by contract.
pub struct Pipeline {
    output_dir: PathBuf,
    normalizer: EntityNormalizer,
    indicator_map: IndicatorMap,
}

impl Pipeline {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Pipeline::with_config(output_dir, NormalizerConfig::default(), IndicatorMap::default())
    }

    pub fn with_config(
        output_dir: impl Into<PathBuf>,
        normalizer: NormalizerConfig,
        indicator_map: IndicatorMap,
    ) -> Self {
        Pipeline {
            output_dir: output_dir.into(),
            normalizer: EntityNormalizer::new(normalizer),
            indicator_map,
        }
    }

    /// Resolve a raw observation into its canonical form: the entity name
    /// the datasets key on, with the segment label from the source kept
    /// for the ledger.
    pub fn canonicalize(&self, raw: RawRow) -> CanonicalRecord {
        CanonicalRecord {
            entity: self.normalizer.canonical(&raw.entity_raw, raw.segment_raw),
            segment: raw.segment_raw,
            period: raw.period,
            account_code: raw.account_code,
            value: raw.value,
        }
    }

    pub fn run<S: ArchiveSupplier>(&self, supplier: &S) -> Result<RunSummary> {
        std::fs::create_dir_all(&self.output_dir)?;

        let (balance, pyg, balance_entities) =
            self.balance_and_pyg_stages(&supplier.balance_archives()?)?;
        let indicators =
            self.indicator_stage(&supplier.indicator_archives()?, &balance_entities)?;

        Ok(RunSummary {
            balance,
            pyg,
            indicators,
        })
    }

    /// Parse every balance archive, then merge into the balance and income
    /// statement datasets. Parsing happens fully before merging so a run
    /// that fails mid-parse leaves the outputs untouched.
    fn balance_and_pyg_stages(
        &self,
        archives: &[PathBuf],
    ) -> Result<(StageSummary, StageSummary, BTreeSet<String>)> {
        let mut failed: Vec<(String, String)> = Vec::new();
        let mut raw_rows: Vec<RawRow> = Vec::new();

        for archive in archives {
            info!("reading balance archive {}", archive.display());
            if let Err(err) = read_balance_archive(archive, &mut raw_rows, &mut failed) {
                warn!("skipping archive {}: {}", archive.display(), err);
                failed.push((archive.display().to_string(), err.to_string()));
            }
        }
        info!("parsed {} raw rows from {} archives", raw_rows.len(), archives.len());

        let mut balance_rows: Vec<NewRow<f64>> = Vec::new();
        let mut pyg_rows: Vec<NewRow<PygValue>> = Vec::new();
        for raw in raw_rows.drain(..) {
            let record = self.canonicalize(raw);
            if schema::is_income_statement_code(&record.account_code) {
                pyg_rows.push(NewRow {
                    entity: record.entity,
                    segment: record.segment,
                    period: record.period,
                    code: record.account_code,
                    value: PygValue::cumulative(record.value),
                });
            } else {
                balance_rows.push(NewRow {
                    entity: record.entity,
                    segment: record.segment,
                    period: record.period,
                    code: record.account_code,
                    value: record.value,
                });
            }
        }

        let balance_path = self.output_dir.join(BALANCE_FILE);
        let mut balance_dataset = if balance_path.exists() {
            store::read_balance(&balance_path)?
        } else {
            Dataset::new()
        };
        let balance_stats = balance_dataset.merge(balance_rows);
        balance_dataset.recompact();
        store::write_balance(&balance_dataset, &balance_path)?;

        let pyg_path = self.output_dir.join(PYG_FILE);
        let mut pyg_dataset = if pyg_path.exists() {
            store::read_pyg(&pyg_path)?
        } else {
            Dataset::new()
        };
        let pyg_stats = pyg_dataset.merge(pyg_rows);
        pyg_dataset.recompact();
        // Derived columns are recomputed over the full merged history, so
        // incremental runs and full rebuilds agree.
        accumulate::resolve(&mut pyg_dataset);
        store::write_pyg(&pyg_dataset, &pyg_path)?;

        let entities: BTreeSet<String> =
            balance_dataset.entity_names().map(str::to_string).collect();

        let balance = StageSummary {
            rows_merged: balance_stats.total(),
            rows_replaced: balance_stats.replaced,
            files_failed: failed.clone(),
            ..StageSummary::default()
        };
        let pyg = StageSummary {
            rows_merged: pyg_stats.total(),
            rows_replaced: pyg_stats.replaced,
            files_failed: failed,
            ..StageSummary::default()
        };
        Ok((balance, pyg, entities))
    }

    /// Recover CAMEL indicators from the macro-enabled workbooks. A
    /// workbook without the indicator cache aborts the whole stage: it
    /// means the publication layout changed and silently writing a partial
    /// dataset would be worse than keeping the previous one.
    fn indicator_stage(
        &self,
        archives: &[PathBuf],
        balance_entities: &BTreeSet<String>,
    ) -> Result<StageSummary> {
        let mut summary = StageSummary::default();
        let mut rows: Vec<NewRow<IndicatorValue>> = Vec::new();

        for archive in archives {
            info!("reading indicator archive {}", archive.display());
            let entries = match read_zip_entries(archive, &["xlsm"]) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("skipping archive {}: {}", archive.display(), err);
                    summary
                        .files_failed
                        .push((archive.display().to_string(), err.to_string()));
                    continue;
                }
            };
            for (name, bytes) in entries {
                if is_ignored_workbook(&name) {
                    info!("ignoring {}", name);
                    continue;
                }
                let fallback_segment = Segment::from_label(&name);
                let extracted = workbook::Workbook::from_bytes(bytes).and_then(|mut wb| {
                    pivot_cache::extract_indicators(
                        &mut wb,
                        fallback_segment,
                        &self.normalizer,
                        &self.indicator_map,
                    )
                });
                match extracted {
                    Ok(records) => {
                        rows.extend(records.into_iter().map(|r| NewRow {
                            entity: r.entity,
                            segment: r.segment,
                            period: r.period,
                            code: r.indicator_code,
                            value: IndicatorValue {
                                category: r.category,
                                ratio: r.value_ratio,
                            },
                        }));
                    }
                    Err(err @ EtlError::Extraction(_)) => {
                        warn!("indicator stage aborted at {}: {}", name, err);
                        summary.aborted = Some(format!("{}: {}", name, err));
                        return Ok(summary);
                    }
                    Err(err) => {
                        warn!("skipping workbook {}: {}", name, err);
                        summary.files_failed.push((name, err.to_string()));
                    }
                }
            }
        }

        let path = self.output_dir.join(INDICATORS_FILE);
        let mut dataset = if path.exists() {
            store::read_indicators(&path)?
        } else {
            Dataset::new()
        };
        let stats = dataset.merge(rows);
        dataset.recompact();
        store::write_indicators(&dataset, &path)?;

        summary.rows_merged = stats.total();
        summary.rows_replaced = stats.replaced;
        summary.unmatched_entities = dataset
            .entity_names()
            .filter(|entity| !balance_entities.contains(*entity))
            .map(str::to_string)
            .collect();
        if !summary.unmatched_entities.is_empty() {
            warn!(
                "{} indicator entities have no balance counterpart: {:?}",
                summary.unmatched_entities.len(),
                summary.unmatched_entities
            );
        }
        Ok(summary)
    }
}

fn is_ignored_workbook(name: &str) -> bool {
    let upper = name.to_uppercase();
    IGNORED_WORKBOOKS.iter().any(|token| upper.contains(token))
}

/// Read the parseable entries of one balance archive, accumulating rows
/// and per-entry failures.
fn read_balance_archive(
    archive: &Path,
    rows: &mut Vec<RawRow>,
    failed: &mut Vec<(String, String)>,
) -> Result<()> {
    let archive_year = archive
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| dates::year_from_name(n).ok());

    for (name, bytes) in read_zip_entries(archive, &["csv", "txt", "xlsx"])? {
        let year_hint = dates::year_from_name(&name)
            .ok()
            .or(archive_year)
            .unwrap_or(0);
        match reader::read_source(&name, &bytes, year_hint) {
            Ok(parsed) => rows.extend(parsed),
            Err(err) => {
                warn!("skipping {}: {}", name, err);
                failed.push((name, err.to_string()));
            }
        }
    }
    Ok(())
}

/// Extract entries matching the given extensions from a zip archive.
fn read_zip_entries(path: &Path, extensions: &[&str]) -> Result<Vec<(String, Vec<u8>)>> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let matches = Path::new(&name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
            .unwrap_or(false);
        if !matches {
            continue;
        }
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        entries.push((name, bytes));
    }
    Ok(entries)
}
