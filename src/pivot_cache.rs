//! Financial-indicator recovery from embedded pivot caches.
//!
//! The regulator publishes CAMEL indicators only inside macro-enabled
//! workbooks, as pivot tables whose backing cache carries the raw
//! per-institution rows. The cache part number varies by publication year,
//! so the right cache is found by inspecting field names for marker
//! indicators rather than by trusting any fixed part name.

use crate::dates::{month_end, parse_date_text};
use crate::error::{EtlError, Result};
use crate::normalize::EntityNormalizer;
use crate::schema::{CamelCategory, IndicatorRecord, Segment};
use crate::workbook::{local_name, Workbook};
use log::{debug, warn};
use quick_xml::events::Event;
use quick_xml::Reader;

/// Indicator fields whose joint presence identifies the cache holding the
/// per-institution indicator rows (as opposed to the caches behind the
/// workbook's other pivot tables).
const MARKER_FIELDS: [&str; 2] = ["I28_ROE", "I29_ROA"];

const ENTITY_FIELD: &str = "NOM_RAZON_SOCIAL";
const DATE_FIELD: &str = "FEC_CORTE";
const SEGMENT_FIELD: &str = "SEGMENTO";

/// Row labels carrying system-wide totals rather than institutions.
const TOTAL_PREFIX: &str = "VT_TOTAL";

/// One value from a pivot cache: shared item or inline record item.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Text(String),
    Number(f64),
    Missing,
}

impl CacheValue {
    fn as_text(&self) -> Option<&str> {
        match self {
            CacheValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            CacheValue::Number(n) => Some(*n),
            CacheValue::Text(s) => s.trim().parse().ok(),
            CacheValue::Missing => None,
        }
    }
}

/// A cache field: its name plus the shared-item lookup table that record
/// `x` references index into.
#[derive(Debug, Clone)]
pub struct CacheField {
    pub name: String,
    pub shared: Vec<CacheValue>,
}

/// Maps pivot-cache field names to indicator codes and their CAMEL
/// category. Fields vary by publication year; unmapped fields are ignored.
#[derive(Debug, Clone)]
pub struct IndicatorMap {
    entries: Vec<(String, String, CamelCategory)>,
}

impl IndicatorMap {
    pub fn lookup(&self, field: &str) -> Option<(&str, CamelCategory)> {
        self.entries
            .iter()
            .find(|(name, _, _)| name == field)
            .map(|(_, code, category)| (code.as_str(), *category))
    }
}

impl Default for IndicatorMap {
    fn default() -> Self {
        use CamelCategory::*;
        let table: [(&str, &str, CamelCategory); 41] = [
            ("I1_suficiencia_patrimonial", "SUF_PAT", Capital),
            ("I2_prop_act_impr_net", "ACT_IMPR", AssetQuality),
            ("I3_prop_act_prod_net", "ACT_PROD", AssetQuality),
            ("I4_uti_pas_cost_prod_gene", "AP_PC", AssetQuality),
            ("I5_Moros_carte", "MOR_TOT", AssetQuality),
            ("Moros_carte_consu", "MOR_CONS", AssetQuality),
            ("I8_Moros_carte_inmob", "MOR_INMOB", AssetQuality),
            ("I9_Moros_carte_micro", "MOR_MICRO", AssetQuality),
            ("I10_Moros_carte_produ", "MOR_PROD", AssetQuality),
            ("I13_Moros_carte_vivi_ip", "MOR_VIV_IP", AssetQuality),
            ("I14_Moros_carte_educ", "MOR_EDU", AssetQuality),
            ("I15_Cober_carte", "COB_TOT", AssetQuality),
            ("Cober_carte_consu", "COB_CONS", AssetQuality),
            ("I18_Cober_carte_inmob", "COB_INMOB", AssetQuality),
            ("I19_Cober_carte_micro", "COB_MICRO", AssetQuality),
            ("I20_Cober_carte_produ", "COB_PROD", AssetQuality),
            ("I23_Cober_carte_vivi_ip", "COB_VIV_IP", AssetQuality),
            ("I24_Cober_carte_educ", "COB_EDU", AssetQuality),
            ("I25_Efici_opera", "GO_ACT", Management),
            ("I26_Grad_abso", "GO_MNF", Management),
            ("I27_Efic_adm_pers", "GP_ACT", Management),
            ("I28_ROE", "ROE", Earnings),
            ("I29_ROA", "ROA", Earnings),
            ("I30_Interm_fin", "INTERM", Earnings),
            ("I31_Marg_inter_est_patri", "MARG_PAT", Earnings),
            ("I32_Marg_inter_est_activ", "MARG_ACT", Earnings),
            ("I34_Rend_cart_consu_x_venc", "REND_CONS", Earnings),
            ("I35_Rend_cart_inmob_x_venc", "REND_INMOB", Earnings),
            ("I36_Rend_cart_micro_x_venc", "REND_MICRO", Earnings),
            ("I37_Rend_cart_prod_x_venc", "REND_PROD", Earnings),
            ("I40_Rend_cart_vivie_x_venc", "REND_VIV", Earnings),
            ("I41_Rend_cart_educ_x_venc", "REND_EDU", Earnings),
            ("I42_Cart_cred_ref_xven", "CART_REF", AssetQuality),
            ("I43_Cart_cred_reest", "CART_REEST", AssetQuality),
            ("I44_cartera_x_vencer", "CART_VENCER", AssetQuality),
            ("I45_Fond_dis_sob_total_depo_cort_plz", "LIQ", Liquidity),
            // Patrimonial-vulnerability ratios are capital-adequacy
            // measures, so they file under Capital.
            ("I46_Carte_impro_descu_rela_patri_resul", "VULN_PAT", Capital),
            ("I47_Carte_impr_patri_dic", "CART_IMPR_PAT", Capital),
            ("I48_FK", "FK", Capital),
            ("I49_FI", "FI", Capital),
            ("I50_Indi_capi_neto", "CAP_NETO", Capital),
        ];
        IndicatorMap {
            entries: table
                .into_iter()
                .map(|(field, code, category)| (field.to_string(), code.to_string(), category))
                .collect(),
        }
    }
}

/// Locate the indicator cache inside a workbook: candidates are every
/// `pivotCacheDefinitionN.xml` in ascending `N`, and the first whose field
/// names contain all marker indicators wins.
pub fn find_indicator_cache(workbook: &mut Workbook) -> Result<(String, String)> {
    let mut candidates: Vec<(u32, String)> = workbook
        .entry_names()
        .into_iter()
        .filter_map(|name| cache_definition_number(&name).map(|n| (n, name)))
        .collect();
    candidates.sort();

    for (number, definition) in candidates {
        let xml = workbook.read_entry(&definition)?;
        let fields = match parse_cache_fields(&xml) {
            Ok(fields) => fields,
            Err(err) => {
                debug!("skipping unreadable cache {}: {}", definition, err);
                continue;
            }
        };
        let has_markers = MARKER_FIELDS
            .iter()
            .all(|marker| fields.iter().any(|f| f.name == *marker));
        if has_markers {
            let records = format!("xl/pivotCache/pivotCacheRecords{}.xml", number);
            if workbook.has_entry(&records) {
                debug!("indicator cache is part {}", number);
                return Ok((definition, records));
            }
        }
    }
    Err(EtlError::Extraction(
        "no pivot cache carries the indicator marker fields".to_string(),
    ))
}

fn cache_definition_number(entry: &str) -> Option<u32> {
    entry
        .strip_prefix("xl/pivotCache/pivotCacheDefinition")?
        .strip_suffix(".xml")?
        .parse()
        .ok()
}

/// Parse the cache definition into named fields with their shared-item
/// lookup tables.
pub fn parse_cache_fields(xml: &str) -> Result<Vec<CacheField>> {
    let mut reader = Reader::from_str(xml);
    let mut fields: Vec<CacheField> = Vec::new();
    let mut in_shared = false;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) | Event::Empty(ref e)
                if local_name(e.name().as_ref()) == "cacheField" =>
            {
                let mut name = String::new();
                for attr in e.attributes().flatten() {
                    if local_name(attr.key.as_ref()) == "name" {
                        name = String::from_utf8_lossy(&attr.value).to_string();
                    }
                }
                fields.push(CacheField {
                    name,
                    shared: Vec::new(),
                });
                in_shared = false;
            }
            Event::Start(ref e) if local_name(e.name().as_ref()) == "sharedItems" => {
                in_shared = true;
            }
            Event::End(ref e) if local_name(e.name().as_ref()) == "sharedItems" => {
                in_shared = false;
            }
            Event::Start(ref e) | Event::Empty(ref e) if in_shared => {
                let name = e.name();
                let value = item_value(local_name(name.as_ref()), e);
                if let Some(field) = fields.last_mut() {
                    field.shared.push(value);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(fields)
}

/// Parse the cache records part: each `<r>` is one tuple, positionally
/// aligned with the field list, with `x` items indexing shared values.
pub fn parse_cache_records(xml: &str, fields: &[CacheField]) -> Result<Vec<Vec<CacheValue>>> {
    let mut reader = Reader::from_str(xml);
    let mut rows: Vec<Vec<CacheValue>> = Vec::new();
    let mut row: Vec<CacheValue> = Vec::new();
    let mut in_record = false;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) if local_name(e.name().as_ref()) == "r" => {
                in_record = true;
                row.clear();
            }
            Event::End(ref e) if local_name(e.name().as_ref()) == "r" => {
                in_record = false;
                rows.push(std::mem::take(&mut row));
            }
            Event::Start(ref e) | Event::Empty(ref e) if in_record => {
                let name = e.name();
                let tag = local_name(name.as_ref());
                let value = if tag == "x" {
                    let shared = fields.get(row.len()).map(|f| f.shared.as_slice());
                    resolve_shared(e, shared)
                } else {
                    item_value(tag, e)
                };
                row.push(value);
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(rows)
}

fn v_attr(e: &quick_xml::events::BytesStart<'_>) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| local_name(attr.key.as_ref()) == "v")
        .map(|attr| String::from_utf8_lossy(&attr.value).to_string())
}

/// Interpret one shared or inline item by its element kind: `s` and `d`
/// carry text, `n` numbers, `m` and `e` missing values. Unrecognized kinds
/// (`b`, `i`, future additions) keep their `v` attribute as text so every
/// item still occupies its position in the tuple.
fn item_value(tag: &str, e: &quick_xml::events::BytesStart<'_>) -> CacheValue {
    match tag {
        "s" | "d" => CacheValue::Text(v_attr(e).unwrap_or_default()),
        "n" => CacheValue::Number(
            v_attr(e).and_then(|v| v.trim().parse().ok()).unwrap_or(0.0),
        ),
        "m" | "e" => CacheValue::Missing,
        _ => CacheValue::Text(v_attr(e).unwrap_or_default()),
    }
}

fn resolve_shared(
    e: &quick_xml::events::BytesStart<'_>,
    shared: Option<&[CacheValue]>,
) -> CacheValue {
    let idx: usize = match v_attr(e).and_then(|v| v.trim().parse().ok()) {
        Some(idx) => idx,
        None => 0,
    };
    shared
        .and_then(|items| items.get(idx))
        .cloned()
        .unwrap_or(CacheValue::Missing)
}

/// Extract indicator records from a workbook. `fallback_segment` is the
/// segment encoded in the workbook's file name, used when the cache has no
/// usable `SEGMENTO` column.
pub fn extract_indicators(
    workbook: &mut Workbook,
    fallback_segment: Segment,
    normalizer: &EntityNormalizer,
    map: &IndicatorMap,
) -> Result<Vec<IndicatorRecord>> {
    let (definition, records_part) = find_indicator_cache(workbook)?;
    let fields = parse_cache_fields(&workbook.read_entry(&definition)?)?;
    let records = parse_cache_records(&workbook.read_entry(&records_part)?, &fields)?;

    let column = |name: &str| fields.iter().position(|f| f.name == name);
    let entity_col = column(ENTITY_FIELD).ok_or_else(|| {
        EtlError::Extraction(format!("indicator cache has no {} field", ENTITY_FIELD))
    })?;
    let date_col = column(DATE_FIELD).ok_or_else(|| {
        EtlError::Extraction(format!("indicator cache has no {} field", DATE_FIELD))
    })?;
    let segment_col = column(SEGMENT_FIELD);

    let indicator_cols: Vec<(usize, &str, CamelCategory)> = fields
        .iter()
        .enumerate()
        .filter_map(|(i, field)| {
            map.lookup(&field.name)
                .map(|(code, category)| (i, code, category))
        })
        .collect();
    if indicator_cols.is_empty() {
        return Err(EtlError::Extraction(
            "indicator cache has no mapped indicator fields".to_string(),
        ));
    }

    let mut out = Vec::new();
    let mut skipped_rows = 0usize;
    for record in &records {
        let entity_raw = match record.get(entity_col).and_then(CacheValue::as_text) {
            Some(text) if !text.trim().is_empty() => text.trim(),
            _ => {
                skipped_rows += 1;
                continue;
            }
        };
        if entity_raw.starts_with(TOTAL_PREFIX) {
            continue;
        }

        let period = match record
            .get(date_col)
            .and_then(CacheValue::as_text)
            .and_then(parse_date_text)
        {
            Some(date) => month_end(date),
            None => {
                skipped_rows += 1;
                continue;
            }
        };

        let segment = segment_col
            .and_then(|col| record.get(col))
            .and_then(CacheValue::as_text)
            .map(Segment::from_label)
            .filter(|s| *s != Segment::Unknown)
            .unwrap_or(fallback_segment);

        let entity = normalizer.canonical(entity_raw, segment);

        for (col, code, category) in &indicator_cols {
            if let Some(value) = record.get(*col).and_then(CacheValue::as_number) {
                out.push(IndicatorRecord {
                    entity: entity.clone(),
                    segment,
                    period,
                    indicator_code: (*code).to_string(),
                    category: *category,
                    value_ratio: value,
                });
            }
        }
    }

    if skipped_rows > 0 {
        warn!("skipped {} cache rows without entity or date", skipped_rows);
    }
    debug!("extracted {} indicator values", out.len());
    Ok(out)
}
