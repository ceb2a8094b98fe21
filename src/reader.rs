//! Source-format detection and normalization of raw filings into long-form
//! rows.
//!
//! Two delimited vintages exist (the regulator changed the export format in
//! 2022) plus a wide spreadsheet layout used for mutualist balances, one
//! column per institution. Format is decided from the bytes and entry name,
//! never from caller intent.

use crate::dates::{month_end, parse_date_text, period_from_name};
use crate::error::{EtlError, Result};
use crate::schema::{RawRow, Segment, SourceFormat};
use crate::workbook::{Cell, Workbook};
use log::{debug, warn};

/// Case-insensitive tokens that must both appear in the wide-layout sheet
/// name.
const SHEET_TOKENS: [&str; 2] = ["balance", "mutualista"];

/// Header phrase marking the wide-layout header row (accent-folded).
const HEADER_MARKER: &str = "CODIGO";

/// ZIP local-file signature; spreadsheet containers are ZIP packages.
pub fn is_spreadsheet_container(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04")
}

/// Parse one source file into raw rows, picking the branch from the file
/// signature and extension. `year_hint` (from the archive name) orders the
/// delimited-policy candidates.
pub fn read_source(entry_name: &str, bytes: &[u8], year_hint: i32) -> Result<Vec<RawRow>> {
    if is_spreadsheet_container(bytes) {
        read_wide_workbook(entry_name, bytes)
    } else {
        read_delimited(entry_name, bytes, year_hint)
    }
}

#[derive(Debug, Clone, Copy)]
struct DelimitedPolicy {
    delimiter: u8,
    decimal_comma: bool,
    headers_spaced: bool,
    format: SourceFormat,
}

const POLICY_PRE_2022: DelimitedPolicy = DelimitedPolicy {
    delimiter: b';',
    decimal_comma: false,
    headers_spaced: false,
    format: SourceFormat::DelimitedSemicolon,
};

const POLICY_2022_ON: DelimitedPolicy = DelimitedPolicy {
    delimiter: b'\t',
    decimal_comma: true,
    headers_spaced: true,
    format: SourceFormat::DelimitedTab,
};

fn policies_for_year(year: i32) -> [DelimitedPolicy; 2] {
    if year >= 2022 {
        [POLICY_2022_ON, POLICY_PRE_2022]
    } else {
        [POLICY_PRE_2022, POLICY_2022_ON]
    }
}

/// Column layout of a delimited filing, as header indices.
struct ColumnMap {
    period: usize,
    segment: usize,
    entity: usize,
    code: usize,
    desc: usize,
    value: usize,
}

fn expected_headers(spaced: bool) -> [&'static str; 6] {
    if spaced {
        [
            "FECHA DE CORTE",
            "SEGMENTO",
            "RAZON SOCIAL",
            "CUENTA",
            "DESCRIPCION CUENTA",
            "SALDO (USD)",
        ]
    } else {
        [
            "FECHA_DE_CORTE",
            "SEGMENTO",
            "RAZON_SOCIAL",
            "CUENTA",
            "DESCRIPCION_CUENTA",
            "SALDO_USD",
        ]
    }
}

fn map_columns(headers: &csv::StringRecord, policy: &DelimitedPolicy) -> Option<ColumnMap> {
    let normalized: Vec<String> = headers
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_uppercase())
        .collect();
    let find = |name: &str| normalized.iter().position(|h| h == name);

    let names = expected_headers(policy.headers_spaced);
    Some(ColumnMap {
        period: find(names[0])?,
        segment: find(names[1])?,
        entity: find(names[2])?,
        code: find(names[3])?,
        desc: find(names[4])?,
        value: find(names[5])?,
    })
}

/// Delimited-text branch. Tries the policy matching the archive's year
/// first, then the other vintage; a header matching neither known column
/// set is a format error for this file.
pub fn read_delimited(entry_name: &str, bytes: &[u8], year_hint: i32) -> Result<Vec<RawRow>> {
    for policy in policies_for_year(year_hint) {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(policy.delimiter)
            .flexible(true)
            .from_reader(bytes);

        let headers = csv_reader.headers()?.clone();
        let columns = match map_columns(&headers, &policy) {
            Some(columns) => columns,
            None => continue,
        };

        debug!("{}: parsing as {:?}", entry_name, policy.format);
        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            let Some(row) = parse_record(&record, &columns, &policy) else {
                continue;
            };
            rows.push(row);
        }
        return Ok(rows);
    }

    Err(EtlError::format(
        entry_name,
        "header matches no known delimited column set",
    ))
}

fn parse_record(
    record: &csv::StringRecord,
    columns: &ColumnMap,
    policy: &DelimitedPolicy,
) -> Option<RawRow> {
    let field = |idx: usize| record.get(idx).unwrap_or("").trim();

    let period = match parse_date_text(field(columns.period)) {
        Some(date) => month_end(date),
        None => {
            debug!("skipping row with unparseable cut date '{}'", field(columns.period));
            return None;
        }
    };

    let code = field(columns.code).to_string();
    if code.is_empty() {
        return None;
    }

    let raw_value = field(columns.value);
    let value = if policy.decimal_comma {
        raw_value.replace(',', ".").parse::<f64>().unwrap_or(0.0)
    } else {
        raw_value.parse::<f64>().unwrap_or(0.0)
    };

    Some(RawRow {
        entity_raw: field(columns.entity).to_string(),
        segment_raw: Segment::from_label(field(columns.segment)),
        period,
        account_code: code,
        account_desc: field(columns.desc).to_string(),
        value,
        source_format: policy.format,
    })
}

/// Spreadsheet-container branch: locate the wide balance sheet, find its
/// header row by the marker phrase, read the as-of date, and reshape the
/// institution columns into long rows.
pub fn read_wide_workbook(entry_name: &str, bytes: &[u8]) -> Result<Vec<RawRow>> {
    let mut workbook = Workbook::from_bytes(bytes.to_vec())?;

    let sheet_name = workbook
        .sheet_names()?
        .into_iter()
        .find(|name| {
            let lower = name.to_lowercase();
            SHEET_TOKENS.iter().all(|token| lower.contains(token))
        })
        .ok_or_else(|| EtlError::format(entry_name, "no sheet with the wide-balance tokens"))?;

    let grid = workbook.read_sheet(&sheet_name)?;

    let header_idx = grid
        .iter()
        .position(|row| {
            row.iter()
                .filter_map(Cell::as_text)
                .any(|text| fold_upper(text).starts_with(HEADER_MARKER))
        })
        .ok_or_else(|| EtlError::format(entry_name, "no header row with the marker phrase"))?;

    // The as-of date sits in a date-typed cell above the header; the file
    // name is the fallback.
    let period = grid[..header_idx]
        .iter()
        .rev()
        .flat_map(|row| row.iter())
        .find_map(Cell::as_date)
        .or_else(|| period_from_name(entry_name))
        .ok_or_else(|| EtlError::format(entry_name, "no as-of date in sheet or file name"))?;
    let period = month_end(period);

    let header = &grid[header_idx];
    let code_col = header
        .iter()
        .position(|cell| {
            cell.as_text()
                .map(|text| fold_upper(text).starts_with(HEADER_MARKER))
                .unwrap_or(false)
        })
        .unwrap_or(0);
    let desc_col = code_col + 1;

    let entities: Vec<(usize, String)> = header
        .iter()
        .enumerate()
        .skip(desc_col + 1)
        .filter_map(|(col, cell)| {
            cell.as_text()
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(|text| (col, text.to_string()))
        })
        .collect();

    if entities.is_empty() {
        return Err(EtlError::format(entry_name, "no institution columns"));
    }

    let segment = Segment::from_label(entry_name);
    if segment == Segment::Unknown {
        warn!("{}: segment not encoded in file name", entry_name);
    }

    let mut rows = Vec::new();
    for row in &grid[header_idx + 1..] {
        let Some(code) = account_code_cell(row.get(code_col)) else {
            continue;
        };
        let desc = row
            .get(desc_col)
            .and_then(|cell| cell.as_text())
            .unwrap_or("")
            .trim()
            .to_string();

        for (col, entity) in &entities {
            let Some(value) = row.get(*col).and_then(Cell::as_number) else {
                continue;
            };
            rows.push(RawRow {
                entity_raw: entity.clone(),
                segment_raw: segment,
                period,
                account_code: code.clone(),
                account_desc: desc.clone(),
                value,
                source_format: SourceFormat::WideWorkbook,
            });
        }
    }

    Ok(rows)
}

/// Account codes appear as text or as numeric cells; either way they are
/// digit strings.
fn account_code_cell(cell: Option<&Cell>) -> Option<String> {
    match cell? {
        Cell::Text(s) => {
            let trimmed = s.trim();
            if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
                Some(trimmed.to_string())
            } else {
                None
            }
        }
        Cell::Number(n) if n.fract() == 0.0 && *n >= 0.0 => Some(format!("{}", *n as u64)),
        _ => None,
    }
}

/// Uppercase with the Spanish accents folded away, for marker matching.
fn fold_upper(text: &str) -> String {
    text.trim()
        .to_uppercase()
        .chars()
        .map(|c| match c {
            'Á' => 'A',
            'É' => 'E',
            'Í' => 'I',
            'Ó' => 'O',
            'Ú' => 'U',
            'Ü' => 'U',
            other => other,
        })
        .collect()
}
