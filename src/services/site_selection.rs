use std::path::Path;

use tracing::{info, warn};

use crate::config::{Config, SiteSelectionConfig};
use crate::errors::{PipelineError, Result};
use crate::models::site::{SiteDictionary, SiteRecord};

/// Reads the registry CSV, ignoring its last `drop_trailing` columns.
pub fn load_registry(path: &Path, drop_trailing: usize) -> Result<Vec<SiteRecord>> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(path.to_path_buf()));
    }
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let full_headers = reader.headers()?.clone();
    let keep = full_headers.len().saturating_sub(drop_trailing);
    let headers: csv::StringRecord = full_headers.iter().take(keep).collect();

    let mut sites = Vec::new();
    let mut rejected = 0usize;
    for (line, row) in reader.records().enumerate() {
        let row = row?;
        let row: csv::StringRecord = row.iter().take(keep).collect();
        match row.deserialize::<SiteRecord>(Some(&headers)) {
            Ok(site) => sites.push(site),
            Err(e) => {
                rejected += 1;
                warn!(row = line + 2, error = %e, "registry row rejected");
            }
        }
    }
    info!(path = %path.display(), sites = sites.len(), rejected, "site registry loaded");
    Ok(sites)
}

fn keeps_all(filter: &[String]) -> bool {
    filter.iter().any(|f| f == "All")
}

/// Applies the operating-year, tracking, region and state filters.
pub fn filter_sites(records: Vec<SiteRecord>, filter: &SiteSelectionConfig, year: i32) -> Vec<SiteRecord> {
    let regions: Vec<String> = filter.regions.iter().map(|r| r.trim().to_lowercase()).collect();
    records
        .into_iter()
        .filter(|s| !filter.operating_by_year || s.cod_year.is_some_and(|cod| cod <= year))
        .filter(|s| keeps_all(&filter.tracking_types) || filter.tracking_types.contains(&s.tracking_type))
        .filter(|s| keeps_all(&filter.regions) || regions.contains(&s.region.trim().to_lowercase()))
        .filter(|s| keeps_all(&filter.states) || filter.states.contains(&s.state))
        .collect()
}

/// Indexes the filtered sites densely from 0.
pub fn build_dictionary(records: Vec<SiteRecord>) -> SiteDictionary {
    records.into_iter().enumerate().collect()
}

pub fn write_dictionary(path: &Path, dictionary: &SiteDictionary) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(dictionary)?)?;
    Ok(())
}

pub fn read_dictionary(path: &Path) -> Result<SiteDictionary> {
    let content = std::fs::read_to_string(path).map_err(|_| PipelineError::MissingInput(path.to_path_buf()))?;
    Ok(serde_json::from_str(&content)?)
}

/// The selected sites as a flat CSV, one row per dictionary entry.
pub fn write_site_metadata_csv(path: &Path, dictionary: &SiteDictionary) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for site in dictionary.values() {
        writer.serialize(site)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn run(config: &Config, year: i32) -> Result<SiteDictionary> {
    let registry = load_registry(&config.sites.registry, config.sites.drop_trailing_columns)?;
    let total = registry.len();
    let dictionary = build_dictionary(filter_sites(registry, &config.sites, year));
    info!(year, total, selected = dictionary.len(), "sites selected");

    let dict_path = config.dictionary_path(year);
    write_dictionary(&dict_path, &dictionary)?;
    info!(path = %dict_path.display(), "site dictionary saved");

    let csv_path = config.site_metadata_path(year);
    write_site_metadata_csv(&csv_path, &dictionary)?;
    info!(path = %csv_path.display(), "site metadata saved");
    Ok(dictionary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = "\
Project Name,State,Region,Latitude,Longitude,Solar Capacity MW-DC,Tracking Type,Mount,Tilt,Solar COD Year,Extra A,Extra B
Alpha,MI,MISO,42.1,-84.3,5.2,Fixed Tilt,Fixed Tilt,25,2015,x,y
Bravo,NY,nyiso ,43.0,-76.1,,Single Axis,Tracking, ,2019.0,x,y
Charlie,CA,CAISO,35.0,-119.0,100,Single Axis,Tracking, ,2012,x,y
Delta,PA,PJM,40.2,-77.1,12,Fixed Tilt,Fixed Tilt,,2023,x,y
Echo,GA,Southeast (non-ISO),33.1,-84.0,80,Single Axis,Tracking,,,x,y
";

    fn selection() -> SiteSelectionConfig {
        serde_json::from_str(r#"{ "registry": "unused.csv", "drop_trailing_columns": 2 }"#).unwrap()
    }

    fn load() -> Vec<SiteRecord> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.csv");
        std::fs::write(&path, REGISTRY).unwrap();
        load_registry(&path, 2).unwrap()
    }

    #[test]
    fn test_load_registry_parses_rows() {
        let sites = load();
        assert_eq!(sites.len(), 5);
        assert_eq!(sites[0].capacity_mw_dc, Some(5.2));
        assert_eq!(sites[1].capacity_mw_dc, None);
        assert_eq!(sites[1].cod_year, Some(2019));
        assert_eq!(sites[4].cod_year, None);
    }

    #[test]
    fn test_filter_by_year_and_region() {
        let kept = filter_sites(load(), &selection(), 2022);
        let names: Vec<_> = kept.iter().map(|s| s.project_name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Bravo"]);
    }

    #[test]
    fn test_tracking_and_state_filters() {
        let mut filter = selection();
        filter.operating_by_year = false;
        filter.tracking_types = vec!["Single Axis".into()];
        let kept = filter_sites(load(), &filter, 2022);
        let names: Vec<_> = kept.iter().map(|s| s.project_name.as_str()).collect();
        assert_eq!(names, vec!["Bravo", "Echo"]);

        filter.states = vec!["GA".into()];
        assert_eq!(filter_sites(load(), &filter, 2022).len(), 1);
    }

    #[test]
    fn test_dictionary_files() {
        let dir = tempfile::tempdir().unwrap();
        let dict = build_dictionary(filter_sites(load(), &selection(), 2022));
        assert_eq!(dict.keys().copied().collect::<Vec<_>>(), vec![0, 1]);

        let json = dir.path().join("json").join("2022 Test Analysis.json");
        write_dictionary(&json, &dict).unwrap();
        assert_eq!(read_dictionary(&json).unwrap(), dict);

        let csv_path = dir.path().join("meta.csv");
        write_site_metadata_csv(&csv_path, &dict).unwrap();
        let text = std::fs::read_to_string(&csv_path).unwrap();
        assert!(text.starts_with("Project Name,State,Region,Latitude,Longitude"));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_missing_registry_is_fatal() {
        assert!(matches!(
            load_registry(Path::new("/no/such/registry.csv"), 19),
            Err(PipelineError::MissingInput(_))
        ));
    }
}
