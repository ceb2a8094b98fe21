//! Year-to-date desaccumulation and trailing-12-month totals.
//!
//! Income-statement filings report cumulative balances that reset each
//! January. The monthly figure is the delta against the previous observed
//! period of the same calendar year; the first observation of a year is
//! taken as-is. Trailing-12-month totals are only defined over twelve
//! consecutive observed month-ends.

use crate::dates::months_between;
use crate::merge::Dataset;
use crate::schema::PygValue;
use chrono::{Datelike, NaiveDate};
use log::debug;

/// Monthly deltas for one `(entity, code)` series of cumulative balances,
/// sorted ascending by period with no duplicate periods.
pub fn monthly_deltas(series: &[(NaiveDate, f64)]) -> Vec<f64> {
    let mut deltas = Vec::with_capacity(series.len());
    for (i, (period, cumulative)) in series.iter().enumerate() {
        let delta = match i.checked_sub(1).map(|j| &series[j]) {
            Some((prev_period, prev_cumulative)) if prev_period.year() == period.year() => {
                cumulative - prev_cumulative
            }
            // January, or the first observed period of a year with earlier
            // months missing: the cumulative is the monthly figure.
            _ => *cumulative,
        };
        deltas.push(delta);
    }
    deltas
}

/// Trailing-12-month totals over the monthly deltas. `None` until twelve
/// observations exist, and `None` whenever the twelve-observation window
/// spans a gap in the month sequence.
pub fn trailing_12m(periods: &[NaiveDate], deltas: &[f64]) -> Vec<Option<f64>> {
    debug_assert_eq!(periods.len(), deltas.len());
    let mut out = Vec::with_capacity(deltas.len());
    for i in 0..deltas.len() {
        let trailing = match i.checked_sub(11) {
            // Twelve sorted distinct month-ends spanning exactly eleven
            // months are necessarily consecutive.
            Some(start) if months_between(periods[start], periods[i]) == 11 => {
                Some(deltas[start..=i].iter().sum())
            }
            _ => None,
        };
        out.push(trailing);
    }
    out
}

/// Recompute the monthly and trailing-12m columns of every series in the
/// dataset from the cumulative column. Runs over the merged history, so
/// the derived columns never depend on which batch a row arrived in.
pub fn resolve(dataset: &mut Dataset<PygValue>) {
    // Rows are keyed (entity, code, period), so each series is a
    // contiguous key range.
    let mut series_key: Option<(u32, u32)> = None;
    let mut periods: Vec<NaiveDate> = Vec::new();
    let mut keys: Vec<(u32, u32, NaiveDate)> = Vec::new();
    let mut cumulatives: Vec<(NaiveDate, f64)> = Vec::new();
    let mut resolved: Vec<((u32, u32, NaiveDate), f64, Option<f64>)> = Vec::new();
    let mut series_count = 0usize;

    let flush = |periods: &mut Vec<NaiveDate>,
                 keys: &mut Vec<(u32, u32, NaiveDate)>,
                 cumulatives: &mut Vec<(NaiveDate, f64)>,
                 resolved: &mut Vec<((u32, u32, NaiveDate), f64, Option<f64>)>| {
        if keys.is_empty() {
            return;
        }
        let deltas = monthly_deltas(cumulatives);
        let trailing = trailing_12m(periods, &deltas);
        for ((key, delta), t12) in keys.drain(..).zip(deltas).zip(trailing) {
            resolved.push((key, delta, t12));
        }
        periods.clear();
        cumulatives.clear();
    };

    for (&(entity_id, code_id, period), value) in dataset.rows().iter() {
        if series_key != Some((entity_id, code_id)) {
            flush(&mut periods, &mut keys, &mut cumulatives, &mut resolved);
            series_key = Some((entity_id, code_id));
            series_count += 1;
        }
        periods.push(period);
        keys.push((entity_id, code_id, period));
        cumulatives.push((period, value.cumulative));
    }
    flush(&mut periods, &mut keys, &mut cumulatives, &mut resolved);

    let rows = dataset.rows_mut();
    for (key, monthly, trailing) in resolved {
        if let Some(value) = rows.get_mut(&key) {
            value.monthly = monthly;
            value.trailing_12m = trailing;
        }
    }
    debug!("resolved accumulation for {} series", series_count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::NewRow;
    use crate::schema::Segment;

    fn eom(y: i32, m: u32) -> NaiveDate {
        crate::dates::last_day_of_month(y, m)
    }

    #[test]
    fn test_desaccumulation_within_year() {
        let series = vec![
            (eom(2023, 1), 100.0),
            (eom(2023, 2), 220.0),
            (eom(2023, 3), 220.0),
        ];
        assert_eq!(monthly_deltas(&series), vec![100.0, 120.0, 0.0]);
    }

    #[test]
    fn test_january_resets_accumulation() {
        let series = vec![
            (eom(2022, 11), 500.0),
            (eom(2022, 12), 640.0),
            (eom(2023, 1), 90.0),
        ];
        assert_eq!(monthly_deltas(&series), vec![500.0, 140.0, 90.0]);
    }

    #[test]
    fn test_first_observed_period_after_gap_taken_as_is() {
        // March missing: April's delta would mix two months, so the first
        // observation of the year stands alone and April's is the delta
        // against February.
        let series = vec![(eom(2023, 2), 50.0), (eom(2023, 4), 80.0)];
        assert_eq!(monthly_deltas(&series), vec![50.0, 30.0]);
    }

    #[test]
    fn test_trailing_needs_twelve_observations() {
        let periods: Vec<NaiveDate> = (1..=12).map(|m| eom(2023, m)).collect();
        let deltas = vec![10.0; 12];
        let trailing = trailing_12m(&periods, &deltas);
        assert!(trailing[..11].iter().all(Option::is_none));
        assert_eq!(trailing[11], Some(120.0));
    }

    #[test]
    fn test_trailing_window_slides() {
        let periods: Vec<NaiveDate> = (1..=12)
            .map(|m| eom(2023, m))
            .chain(std::iter::once(eom(2024, 1)))
            .collect();
        let mut deltas = vec![10.0; 12];
        deltas.push(22.0);
        let trailing = trailing_12m(&periods, &deltas);
        // Feb 2023 .. Jan 2024: drops the first 10.0, gains 22.0.
        assert_eq!(trailing[12], Some(132.0));
    }

    #[test]
    fn test_gap_invalidates_trailing_window() {
        // 13 observations but June 2023 missing: every window spanning the
        // gap covers more than eleven calendar months.
        let periods: Vec<NaiveDate> = (1..=5)
            .map(|m| eom(2023, m))
            .chain((7..=12).map(|m| eom(2023, m)))
            .chain([eom(2024, 1), eom(2024, 2)])
            .collect();
        let deltas = vec![10.0; 13];
        let trailing = trailing_12m(&periods, &deltas);
        assert!(trailing.iter().all(Option::is_none));
    }

    #[test]
    fn test_resolve_dataset_end_to_end() {
        let mut ds: Dataset<PygValue> = Dataset::new();
        let rows: Vec<NewRow<PygValue>> = [
            (eom(2023, 1), 100.0),
            (eom(2023, 2), 220.0),
            (eom(2023, 3), 220.0),
        ]
        .into_iter()
        .map(|(period, cumulative)| NewRow {
            entity: "ANDINA LTDA".to_string(),
            segment: Segment::One,
            period,
            code: "51".to_string(),
            value: PygValue::cumulative(cumulative),
        })
        .collect();
        ds.merge(rows);

        resolve(&mut ds);

        let monthly: Vec<f64> = ds.iter().map(|r| r.value.monthly).collect();
        assert_eq!(monthly, vec![100.0, 120.0, 0.0]);
        assert!(ds.iter().all(|r| r.value.trailing_12m.is_none()));
    }

    #[test]
    fn test_reprocessing_identical_filing_is_not_a_conflict() {
        let row = |cumulative: f64| NewRow {
            entity: "A".to_string(),
            segment: Segment::One,
            period: eom(2023, 1),
            code: "51".to_string(),
            value: PygValue::cumulative(cumulative),
        };

        let mut ds: Dataset<PygValue> = Dataset::new();
        ds.merge(vec![row(100.0)]);
        resolve(&mut ds);

        // Re-ingesting the unchanged filing replaces the row but is no
        // conflict, even though the derived columns were populated.
        let stats = ds.merge(vec![row(100.0)]);
        assert_eq!(stats.replaced, 1);
        assert_eq!(stats.conflicting, 0);

        // A corrected cumulative still registers.
        let stats = ds.merge(vec![row(150.0)]);
        assert_eq!(stats.conflicting, 1);
    }

    #[test]
    fn test_resolve_is_batch_independent() {
        let all: Vec<(NaiveDate, f64)> =
            (1..=6).map(|m| (eom(2023, m), (m as f64) * 100.0)).collect();

        let make_row = |(period, cumulative): (NaiveDate, f64)| NewRow {
            entity: "A".to_string(),
            segment: Segment::Two,
            period,
            code: "41".to_string(),
            value: PygValue::cumulative(cumulative),
        };

        let mut one_shot: Dataset<PygValue> = Dataset::new();
        one_shot.merge(all.iter().copied().map(make_row).collect());
        resolve(&mut one_shot);

        let mut incremental: Dataset<PygValue> = Dataset::new();
        for chunk in all.chunks(2) {
            incremental.merge(chunk.iter().copied().map(make_row).collect());
            resolve(&mut incremental);
        }

        let collect = |ds: &Dataset<PygValue>| -> Vec<(NaiveDate, f64, f64)> {
            ds.iter()
                .map(|r| (r.period, r.value.cumulative, r.value.monthly))
                .collect()
        };
        assert_eq!(collect(&one_shot), collect(&incremental));
    }
}
