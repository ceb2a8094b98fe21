//! Minimal access to spreadsheet containers (`.xlsx`/`.xlsm`).
//!
//! Handles only the parts of the OOXML package this pipeline needs: sheet
//! discovery, shared strings, a plain cell grid, and raw XML part access
//! for the pivot cache. It is intentionally not a general-purpose reader.

use crate::dates::{excel_serial_to_date, parse_date_text};
use crate::error::{EtlError, Result};
use chrono::NaiveDate;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{Cursor, Read};
use zip::ZipArchive;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            Cell::Text(s) => s.trim().parse().ok(),
            Cell::Empty => None,
        }
    }

    /// Interpret the cell as a date: Excel serial numbers within a
    /// plausible filing range, or date-formatted text.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Cell::Number(n) => {
                let date = excel_serial_to_date(*n)?;
                if (1990..2100).contains(&chrono::Datelike::year(&date)) {
                    Some(date)
                } else {
                    None
                }
            }
            Cell::Text(s) => parse_date_text(s),
            Cell::Empty => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }
}

pub struct Workbook {
    archive: ZipArchive<Cursor<Vec<u8>>>,
}

impl Workbook {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let archive = ZipArchive::new(Cursor::new(bytes))?;
        Ok(Workbook { archive })
    }

    /// All entry paths inside the container, sorted.
    pub fn entry_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.archive.file_names().any(|n| n == name)
    }

    /// Read one XML part as UTF-8 text.
    pub fn read_entry(&mut self, name: &str) -> Result<String> {
        let mut file = self.archive.by_name(name)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        Ok(content)
    }

    /// Sheet names in workbook order.
    pub fn sheet_names(&mut self) -> Result<Vec<String>> {
        Ok(self.sheet_index()?.into_iter().map(|(n, _)| n).collect())
    }

    /// Read a worksheet into a row-major cell grid. Shared strings are
    /// resolved; missing cells become `Cell::Empty`.
    pub fn read_sheet(&mut self, sheet_name: &str) -> Result<Vec<Vec<Cell>>> {
        let sheets = self.sheet_index()?;
        let rid = sheets
            .iter()
            .find(|(name, _)| name == sheet_name)
            .map(|(_, rid)| rid.clone())
            .ok_or_else(|| {
                EtlError::Extraction(format!("worksheet '{}' not present", sheet_name))
            })?;

        let rels = self.read_entry("xl/_rels/workbook.xml.rels")?;
        let target = relationship_target(&rels, &rid)?.ok_or_else(|| {
            EtlError::Extraction(format!("no relationship target for sheet '{}'", sheet_name))
        })?;
        let part = if target.starts_with('/') {
            target.trim_start_matches('/').to_string()
        } else {
            format!("xl/{}", target)
        };

        let shared = if self.has_entry("xl/sharedStrings.xml") {
            let xml = self.read_entry("xl/sharedStrings.xml")?;
            parse_shared_strings(&xml)?
        } else {
            Vec::new()
        };

        let xml = self.read_entry(&part)?;
        parse_sheet(&xml, &shared)
    }

    fn sheet_index(&mut self) -> Result<Vec<(String, String)>> {
        let xml = self.read_entry("xl/workbook.xml")?;
        let mut reader = Reader::from_str(&xml);
        let mut sheets = Vec::new();
        loop {
            match reader.read_event()? {
                Event::Start(ref e) | Event::Empty(ref e)
                    if local_name(e.name().as_ref()) == "sheet" =>
                {
                    let mut name = None;
                    let mut rid = None;
                    for attr in e.attributes().flatten() {
                        let key = local_name(attr.key.as_ref());
                        let value = String::from_utf8_lossy(&attr.value).to_string();
                        match key {
                            "name" => name = Some(value),
                            "id" => rid = Some(value),
                            _ => {}
                        }
                    }
                    if let (Some(name), Some(rid)) = (name, rid) {
                        sheets.push((name, rid));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(sheets)
    }
}

/// Resolve a relationship id to its target path inside the rels part.
fn relationship_target(rels_xml: &str, rid: &str) -> Result<Option<String>> {
    let mut reader = Reader::from_str(rels_xml);
    loop {
        match reader.read_event()? {
            Event::Start(ref e) | Event::Empty(ref e)
                if local_name(e.name().as_ref()) == "Relationship" =>
            {
                let mut id = None;
                let mut target = None;
                for attr in e.attributes().flatten() {
                    let key = local_name(attr.key.as_ref());
                    let value = String::from_utf8_lossy(&attr.value).to_string();
                    match key {
                        "Id" => id = Some(value),
                        "Target" => target = Some(value),
                        _ => {}
                    }
                }
                if id.as_deref() == Some(rid) {
                    return Ok(target);
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn parse_shared_strings(xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    loop {
        match reader.read_event()? {
            Event::Start(ref e) => match local_name(e.name().as_ref()) {
                "si" => {
                    in_si = true;
                    current.clear();
                }
                "t" if in_si => in_t = true,
                _ => {}
            },
            Event::Text(ref e) if in_t => {
                if let Ok(text) = e.unescape() {
                    current.push_str(&text);
                }
            }
            Event::End(ref e) => match local_name(e.name().as_ref()) {
                "t" => in_t = false,
                "si" => {
                    in_si = false;
                    strings.push(current.clone());
                }
                _ => {}
            },
            Event::Empty(ref e) if in_si && local_name(e.name().as_ref()) == "t" => {}
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(strings)
}

fn parse_sheet(xml: &str, shared: &[String]) -> Result<Vec<Vec<Cell>>> {
    let mut reader = Reader::from_str(xml);
    let mut rows: Vec<Vec<Cell>> = Vec::new();
    let mut row: Vec<Cell> = Vec::new();
    let mut cell_col: usize = 0;
    let mut cell_type = String::new();
    let mut in_v = false;
    let mut in_inline_t = false;
    let mut value = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(ref e) | Event::Empty(ref e)
                if local_name(e.name().as_ref()) == "c" =>
            {
                cell_col = row.len();
                cell_type.clear();
                value.clear();
                for attr in e.attributes().flatten() {
                    let key = local_name(attr.key.as_ref());
                    let attr_value = String::from_utf8_lossy(&attr.value).to_string();
                    match key {
                        "r" => {
                            if let Some(col) = column_index(&attr_value) {
                                cell_col = col;
                            }
                        }
                        "t" => cell_type = attr_value,
                        _ => {}
                    }
                }
            }
            Event::Start(ref e) => match local_name(e.name().as_ref()) {
                "v" => {
                    in_v = true;
                    value.clear();
                }
                "t" => {
                    in_inline_t = true;
                }
                "row" => row.clear(),
                _ => {}
            },
            Event::Text(ref e) if in_v || in_inline_t => {
                if let Ok(text) = e.unescape() {
                    value.push_str(&text);
                }
            }
            Event::End(ref e) => match local_name(e.name().as_ref()) {
                "v" => in_v = false,
                "t" => in_inline_t = false,
                "c" => {
                    let cell = materialize_cell(&cell_type, &value, shared);
                    place_cell(&mut row, cell_col, cell);
                }
                "row" => rows.push(std::mem::take(&mut row)),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(rows)
}

fn materialize_cell(cell_type: &str, value: &str, shared: &[String]) -> Cell {
    if value.is_empty() {
        return Cell::Empty;
    }
    match cell_type {
        "s" => value
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|i| shared.get(i))
            .map(|s| Cell::Text(s.clone()))
            .unwrap_or(Cell::Empty),
        "str" | "inlineStr" => Cell::Text(value.to_string()),
        _ => match value.trim().parse::<f64>() {
            Ok(n) => Cell::Number(n),
            Err(_) => Cell::Text(value.to_string()),
        },
    }
}

fn place_cell(row: &mut Vec<Cell>, col: usize, cell: Cell) {
    while row.len() < col {
        row.push(Cell::Empty);
    }
    if row.len() == col {
        row.push(cell);
    } else {
        row[col] = cell;
    }
}

/// Zero-based column index from an `A1`-style reference.
pub fn column_index(cell_ref: &str) -> Option<usize> {
    let letters: String = cell_ref
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let mut index: usize = 0;
    for c in letters.chars() {
        index = index * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    Some(index - 1)
}

pub(crate) fn local_name(qname: &[u8]) -> &str {
    let name = std::str::from_utf8(qname).unwrap_or("");
    match name.rfind(':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_index() {
        assert_eq!(column_index("A1"), Some(0));
        assert_eq!(column_index("C12"), Some(2));
        assert_eq!(column_index("Z3"), Some(25));
        assert_eq!(column_index("AA1"), Some(26));
        assert_eq!(column_index("12"), None);
    }

    #[test]
    fn test_parse_shared_strings() {
        let xml = r#"<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
            <si><t>CODIGO DE CUENTA</t></si>
            <si><r><t>Mutualista </t></r><r><t>Ambato</t></r></si>
        </sst>"#;
        let strings = parse_shared_strings(xml).unwrap();
        assert_eq!(strings, vec!["CODIGO DE CUENTA", "Mutualista Ambato"]);
    }

    #[test]
    fn test_parse_sheet_with_shared_and_numbers() {
        let shared = vec!["CUENTA".to_string(), "ACTIVO".to_string()];
        let xml = r#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="s"><v>0</v></c><c r="C1"><v>45107</v></c></row>
            <row r="2"><c r="A2" t="s"><v>1</v></c><c r="B2"><v>12.5</v></c></row>
        </sheetData></worksheet>"#;
        let rows = parse_sheet(xml, &shared).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Cell::Text("CUENTA".to_string()));
        assert_eq!(rows[0][1], Cell::Empty);
        assert_eq!(rows[0][2], Cell::Number(45107.0));
        assert_eq!(rows[1][1], Cell::Number(12.5));
    }

    #[test]
    fn test_cell_as_date() {
        assert_eq!(
            Cell::Number(45107.0).as_date(),
            chrono::NaiveDate::from_ymd_opt(2023, 6, 30)
        );
        assert_eq!(
            Cell::Text("2023-06-30".to_string()).as_date(),
            chrono::NaiveDate::from_ymd_opt(2023, 6, 30)
        );
        // Small numbers are not plausible filing dates.
        assert_eq!(Cell::Number(12.0).as_date(), None);
    }
}
