//! Multi-year UTC stitching.
//!
//! Each local-time result file covers a local calendar year, so its UTC
//! timestamps spill into the neighbouring years. For target year `Y` the
//! files for `Y-1`, `Y` and `Y+1` are concatenated, sorted by UTC and merged
//! against a canonical grid of the 8760 UTC hours of `Y` (Feb 29 excluded).
//! Every grid hour gets exactly one row; hours with no source row are filled
//! with `0` (numeric columns) or an empty string (text columns).

use std::path::Path;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use tracing::{error, info, warn};

use crate::config::{Config, MissingAdjacentPolicy};
use crate::errors::{PipelineError, Result};
use crate::models::results::{COL_LOCAL, Scenario};
use crate::services::local_time::{LOCAL_FORMAT, format_utc};
use crate::services::site_selection::read_dictionary;

pub const CANONICAL_HOURS: usize = 8760;
const STITCHED_LOCAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

/// A result file as raw text: header plus rows, first column the timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::MissingInput(path.to_path_buf()));
        }
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let headers = reader.headers()?.iter().map(str::to_string).collect();
        let rows = reader
            .records()
            .map(|r| r.map(|rec| rec.iter().map(str::to_string).collect()))
            .collect::<std::result::Result<Vec<Vec<String>>, _>>()?;
        Ok(Self { headers, rows })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("partial");
        {
            let mut writer = csv::Writer::from_path(&tmp)?;
            writer.write_record(&self.headers)?;
            for row in &self.rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// Result of stitching one site-year.
#[derive(Debug, Clone, PartialEq)]
pub struct Stitched {
    pub table: RawTable,
    /// Source rows whose timestamp could not be parsed.
    pub unparseable: usize,
    /// Grid hours with no source row.
    pub filled: usize,
}

/// Parses a result-file timestamp into UTC. Accepts an explicit offset
/// (`+00:00`, `+0000`, `Z`) or a naive value, which is taken as UTC.
pub fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%z", "%Y-%m-%d %H:%M:%S %z"] {
        if let Ok(t) = DateTime::parse_from_str(raw, fmt) {
            return Some(t.with_timezone(&Utc));
        }
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Every hour of `year` in UTC at `minute` past the hour, Feb 29 excluded.
pub fn canonical_grid(year: i32, minute: u32) -> Vec<DateTime<Utc>> {
    let Some(start) = NaiveDate::from_ymd_opt(year, 1, 1).and_then(|d| d.and_hms_opt(0, minute.min(59), 0)) else {
        return Vec::new();
    };
    let start = Utc.from_utc_datetime(&start);
    let mut grid = Vec::with_capacity(CANONICAL_HOURS);
    let mut t = start;
    while t.year() == year {
        if !(t.month() == 2 && t.day() == 29) {
            grid.push(t);
        }
        t += Duration::hours(1);
    }
    grid
}

/// Re-renders `2022-01-01 00:30:00 -0500` as `2022-01-01 00:30:00-05:00`.
pub fn reformat_local(raw: &str) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }
    DateTime::parse_from_str(raw.trim(), LOCAL_FORMAT)
        .map(|t| t.format(STITCHED_LOCAL_FORMAT).to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// Stitches one year from the current-year table and its optional neighbours.
pub fn stitch_year(current: &RawTable, prior: Option<&RawTable>, next: Option<&RawTable>, year: i32) -> Stitched {
    let headers = current.headers.clone();
    let width = headers.len();

    let mut unparseable = 0usize;
    let mut minute = None;
    let mut timed: Vec<(DateTime<Utc>, Vec<String>)> = Vec::new();
    for (table, is_current) in [(prior, false), (Some(current), true), (next, false)] {
        let Some(table) = table else { continue };
        let mapping: Vec<Option<usize>> = headers
            .iter()
            .enumerate()
            .map(|(i, name)| if i == 0 { Some(0) } else { table.column(name) })
            .collect();
        for row in &table.rows {
            let Some(utc) = row.first().and_then(|raw| parse_utc(raw)) else {
                unparseable += 1;
                continue;
            };
            if is_current && minute.is_none() {
                minute = Some(utc.minute());
            }
            let aligned = mapping
                .iter()
                .map(|idx| idx.and_then(|i| row.get(i)).cloned().unwrap_or_default())
                .collect();
            timed.push((utc, aligned));
        }
    }
    // Stable: equal timestamps keep prior, current, next order.
    timed.sort_by_key(|(utc, _)| *utc);

    let local_col = headers.iter().position(|h| h == COL_LOCAL);
    let text_cols: Vec<bool> = (0..width)
        .map(|c| {
            c == 0
                || Some(c) == local_col
                || timed.iter().any(|(_, row)| {
                    let v = row[c].trim();
                    !v.is_empty() && v.parse::<f64>().is_err()
                })
        })
        .collect();

    let grid = canonical_grid(year, minute.unwrap_or(0));
    let mut rows = Vec::with_capacity(grid.len());
    let mut filled = 0usize;
    let mut cursor = 0usize;
    for slot in &grid {
        while cursor < timed.len() && timed[cursor].0 < *slot {
            cursor += 1;
        }
        let mut row = if cursor < timed.len() && timed[cursor].0 == *slot {
            let row = timed[cursor].1.clone();
            cursor += 1;
            row
        } else {
            filled += 1;
            text_cols
                .iter()
                .map(|&text| if text { String::new() } else { "0".to_string() })
                .collect()
        };
        if let Some(first) = row.first_mut() {
            *first = format_utc(slot);
        }
        if let Some(c) = local_col {
            row[c] = reformat_local(&row[c]);
        }
        rows.push(row);
    }

    Stitched { table: RawTable { headers, rows }, unparseable, filled }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StitchOutcome {
    Written,
    Skipped,
}

/// Loads a neighbour-year file according to the missing-year policy.
/// `Ok(None)` means the neighbour contributes nothing.
fn load_adjacent(path: &Path, policy: MissingAdjacentPolicy, project: &str) -> Result<Option<RawTable>> {
    match RawTable::read(path) {
        Ok(table) => Ok(Some(table)),
        Err(PipelineError::MissingInput(p)) => match policy {
            MissingAdjacentPolicy::ContributeNothing => {
                warn!(project, path = %p.display(), "adjacent year missing, contributing no rows");
                Ok(None)
            }
            MissingAdjacentPolicy::SkipSite => Err(PipelineError::MissingInput(p)),
        },
        Err(e) => Err(e),
    }
}

pub fn stitch_site(config: &Config, project: &str, year: i32, scenario: Scenario) -> Result<StitchOutcome> {
    let policy = config.stitch.missing_adjacent;
    let current = RawTable::read(&config.local_results_path(scenario, year, project))?;
    let prior = match load_adjacent(&config.local_results_path(scenario, year - 1, project), policy, project) {
        Ok(t) => t,
        Err(PipelineError::MissingInput(p)) => {
            warn!(project, path = %p.display(), "prior year missing, skipping site");
            return Ok(StitchOutcome::Skipped);
        }
        Err(e) => return Err(e),
    };
    let next = match load_adjacent(&config.local_results_path(scenario, year + 1, project), policy, project) {
        Ok(t) => t,
        Err(PipelineError::MissingInput(p)) => {
            warn!(project, path = %p.display(), "next year missing, skipping site");
            return Ok(StitchOutcome::Skipped);
        }
        Err(e) => return Err(e),
    };

    let stitched = stitch_year(&current, prior.as_ref(), next.as_ref(), year);
    if stitched.unparseable > 0 {
        warn!(project, rows = stitched.unparseable, "discarded rows with unparseable timestamps");
    }
    if stitched.filled > 0 {
        warn!(project, hours = stitched.filled, "grid hours had no source row and were zero-filled");
    }
    let output = config.utc_results_path(scenario, year, project);
    stitched.table.write(&output)?;
    info!(project, %scenario, rows = stitched.table.rows.len(), path = %output.display(), "UTC series written");
    Ok(StitchOutcome::Written)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StitchSummary {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub fn run(config: &Config, year: i32) -> Result<StitchSummary> {
    let sites = read_dictionary(&config.dictionary_path(year))?;
    let mut summary = StitchSummary::default();
    for scenario in Scenario::ALL {
        for (index, site) in &sites {
            match stitch_site(config, &site.project_name, year, scenario) {
                Ok(StitchOutcome::Written) => summary.written += 1,
                Ok(StitchOutcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!(site = index, project = %site.project_name, %scenario, error = %e, "stitching failed");
                }
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADERS: [&str; 4] = ["UTC", "DC Inverter Input Power [W]", "poa", "Local Datetime"];

    /// A local-calendar-year result table for New York standard time (no DST),
    /// `hours` rows starting at local Jan 1 00:30.
    fn local_year(year: i32, hours: usize, value: &str) -> RawTable {
        let start = Utc.with_ymd_and_hms(year, 1, 1, 5, 30, 0).unwrap();
        let rows = (0..hours as i64)
            .map(|h| {
                let utc = start + Duration::hours(h);
                let local = utc - Duration::hours(5);
                vec![
                    format_utc(&utc),
                    value.to_string(),
                    "1.5".to_string(),
                    format!("{} -0500", local.format("%Y-%m-%d %H:%M:%S")),
                ]
            })
            .collect();
        RawTable { headers: HEADERS.iter().map(|h| h.to_string()).collect(), rows }
    }

    fn config(base: &Path, policy: &str) -> Config {
        serde_json::from_value(serde_json::json!({
            "base_dir": base,
            "year": 2021,
            "sites": { "registry": "unused.csv" },
            "stitch": { "missing_adjacent": policy }
        }))
        .unwrap()
    }

    #[test]
    fn test_grid_has_8760_hours() {
        for year in [2019, 2020, 2021, 2024] {
            let grid = canonical_grid(year, 30);
            assert_eq!(grid.len(), CANONICAL_HOURS, "year {}", year);
            assert!(grid.iter().all(|t| !(t.month() == 2 && t.day() == 29)));
            assert_eq!(format_utc(&grid[0]), format!("{}-01-01 00:30:00+00:00", year));
            assert_eq!(format_utc(&grid[8759]), format!("{}-12-31 23:30:00+00:00", year));
        }
    }

    #[test]
    fn test_parse_utc_variants() {
        let expected = Utc.with_ymd_and_hms(2022, 1, 1, 5, 30, 0).unwrap();
        assert_eq!(parse_utc("2022-01-01 05:30:00+00:00"), Some(expected));
        assert_eq!(parse_utc("2022-01-01 00:30:00-05:00"), Some(expected));
        assert_eq!(parse_utc("2022-01-01T05:30:00Z"), Some(expected));
        assert_eq!(parse_utc("2022-01-01 05:30:00"), Some(expected));
        assert_eq!(parse_utc("not a time"), None);
    }

    #[test]
    fn test_full_stitch_uses_neighbours_and_window() {
        let prior = local_year(2020, 8784, "7");
        let current = local_year(2021, 8760, "8");
        let next = local_year(2022, 8760, "9");
        let out = stitch_year(&current, Some(&prior), Some(&next), 2021);

        assert_eq!(out.table.rows.len(), CANONICAL_HOURS);
        assert_eq!(out.filled, 0);
        // The first five UTC hours of 2021 are the end of local 2020.
        assert_eq!(out.table.rows[0][0], "2021-01-01 00:30:00+00:00");
        assert_eq!(out.table.rows[0][1], "7");
        assert_eq!(out.table.rows[5][1], "8");
        let last = &out.table.rows[8759];
        assert_eq!(last[0], "2021-12-31 23:30:00+00:00");
        assert_eq!(last[1], "8");
        assert_eq!(last[3], "2021-12-31 18:30:00-05:00");
        assert!(out.table.rows.iter().all(|r| r[0].starts_with("2021-")));
    }

    #[test]
    fn test_current_year_only_is_padded() {
        let current = local_year(2021, 8760, "8");
        let out = stitch_year(&current, None, None, 2021);
        assert_eq!(out.table.rows.len(), CANONICAL_HOURS);
        assert_eq!(out.filled, 5);
        assert_eq!(out.table.rows[0][1], "0");
        assert_eq!(out.table.rows[0][2], "0");
        assert_eq!(out.table.rows[0][3], "");
        assert_eq!(out.table.rows[5][1], "8");
    }

    #[test]
    fn test_missing_hour_is_zero_filled() {
        let prior = local_year(2020, 8784, "7");
        let mut current = local_year(2021, 8760, "8");
        current.rows.remove(1000);
        assert_eq!(current.rows.len(), 8759);
        let next = local_year(2022, 8760, "9");

        let out = stitch_year(&current, Some(&prior), Some(&next), 2021);
        assert_eq!(out.table.rows.len(), CANONICAL_HOURS);
        assert_eq!(out.filled, 1);
        let gap = &out.table.rows[1005];
        assert_eq!(gap[1], "0");
        assert_eq!(gap[3], "");
        assert_eq!(out.table.rows[1004][1], "8");
    }

    #[test]
    fn test_short_current_year_alone_still_has_8760_rows() {
        let mut current = local_year(2021, 8760, "5");
        current.rows.remove(1000);
        assert_eq!(current.rows.len(), 8759);

        let out = stitch_year(&current, None, None, 2021);
        assert_eq!(out.table.rows.len(), CANONICAL_HOURS);
        // Five leading hours from the missing prior year, plus the gap.
        assert_eq!(out.filled, 6);
        let gap = &out.table.rows[1005];
        assert_eq!(gap[0], "2021-02-11 21:30:00+00:00");
        assert_eq!(gap[1], "0");
        assert_eq!(gap[2], "0");
        assert_eq!(gap[3], "");
        assert_eq!(out.table.rows[1004][1], "5");
        assert_eq!(out.table.rows[1006][1], "5");
        assert_eq!(out.table.rows[8759][1], "5");
    }

    #[test]
    fn test_duplicates_keep_first_occurrence() {
        let mut current = local_year(2021, 10, "8");
        let mut dup = current.rows[6].clone();
        dup[1] = "999".into();
        current.rows.insert(7, dup);
        let out = stitch_year(&current, None, None, 2021);
        assert_eq!(out.table.rows.len(), CANONICAL_HOURS);
        assert_eq!(out.table.rows[6 + 5][1], "8");
        assert!(out.table.rows.iter().all(|r| r[1] != "999"));
    }

    #[test]
    fn test_leap_year_drops_feb_29() {
        let current = local_year(2020, 8784, "8");
        let out = stitch_year(&current, None, None, 2020);
        assert_eq!(out.table.rows.len(), CANONICAL_HOURS);
        assert!(out.table.rows.iter().all(|r| !r[0].starts_with("2020-02-29")));
    }

    #[test]
    fn test_unparseable_rows_are_counted() {
        let mut current = local_year(2021, 8760, "8");
        current.rows[100][0] = "garbage".into();
        current.rows[200][0] = String::new();
        let out = stitch_year(&current, None, None, 2021);
        assert_eq!(out.unparseable, 2);
        assert_eq!(out.table.rows.len(), CANONICAL_HOURS);
    }

    #[test]
    fn test_reformat_local() {
        assert_eq!(reformat_local("2022-07-01 12:30:00 -0400"), "2022-07-01 12:30:00-04:00");
        assert_eq!(reformat_local(""), "");
    }

    #[test]
    fn test_stitch_site_policies() {
        let dir = tempfile::tempdir().unwrap();
        let missing = config(dir.path(), "contribute_nothing");
        assert!(matches!(
            stitch_site(&missing, "Solar One", 2021, Scenario::NoSnow),
            Err(PipelineError::MissingInput(_))
        ));

        let current_path = missing.local_results_path(Scenario::NoSnow, 2021, "Solar One");
        local_year(2021, 8760, "8").write(&current_path).unwrap();

        let out = stitch_site(&missing, "Solar One", 2021, Scenario::NoSnow).unwrap();
        assert_eq!(out, StitchOutcome::Written);
        let written = RawTable::read(&missing.utc_results_path(Scenario::NoSnow, 2021, "Solar One")).unwrap();
        assert_eq!(written.rows.len(), CANONICAL_HOURS);
        assert_eq!(written.headers, HEADERS);

        let strict = config(dir.path(), "skip_site");
        let strict_out = stitch_site(&strict, "Solar One", 2021, Scenario::NoSnow).unwrap();
        assert_eq!(strict_out, StitchOutcome::Skipped);
    }
}
