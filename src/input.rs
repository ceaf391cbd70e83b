//! Service, cone and replay files

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::coords::PositionSpec;
use crate::error::{ProbeError, Result};
use crate::models::{Cone, RecordedCone, ServiceDescriptor, ServiceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Csv,
}

fn format_of(path: &Path) -> Result<Format> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "json" => Ok(Format::Json),
        "py" => Err(ProbeError::InvalidInput(format!(
            "{}: Python literal lists are not supported, use .json or .csv",
            path.display()
        ))),
        _ => Ok(Format::Csv),
    }
}

fn read_csv_rows(path: &Path) -> Result<Vec<BTreeMap<String, String>>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

fn non_empty(row: &BTreeMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| row.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_float(row: &BTreeMap<String, String>, key: &str, path: &Path) -> Result<Option<f64>> {
    match non_empty(row, &[key]) {
        None => Ok(None),
        Some(text) => text.parse::<f64>().map(Some).map_err(|_| {
            ProbeError::InvalidInput(format!("{}: {} is not a number: '{}'", path.display(), key, text))
        }),
    }
}

fn service_from_row(row: &BTreeMap<String, String>, path: &Path) -> Result<ServiceDescriptor> {
    let kind: ServiceKind = non_empty(row, &["service_type", "service_kind"])
        .ok_or_else(|| {
            ProbeError::InvalidInput(format!("{}: row without service_type", path.display()))
        })?
        .parse()?;
    Ok(ServiceDescriptor {
        base_name: non_empty(row, &["base_name"]).unwrap_or_else(|| "Unnamed".to_string()),
        kind,
        access_url: non_empty(row, &["access_url"]),
        query_template: non_empty(row, &["adql", "ADQL"]),
        recorded: None,
    })
}

/// Service list from a `.json` array or a `.csv` table
pub fn load_services(path: &Path) -> Result<Vec<ServiceDescriptor>> {
    let services = match format_of(path)? {
        Format::Json => {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str::<Vec<ServiceDescriptor>>(&text).map_err(|e| {
                ProbeError::InvalidInput(format!("{}: {}", path.display(), e))
            })?
        }
        Format::Csv => read_csv_rows(path)?
            .iter()
            .map(|row| service_from_row(row, path))
            .collect::<Result<Vec<_>>>()?,
    };
    info!(path = %path.display(), count = services.len(), "Loaded services");
    Ok(services)
}

#[derive(Debug, Deserialize)]
struct ConeRow {
    #[serde(default, alias = "RA")]
    ra: Option<f64>,
    #[serde(default, alias = "DEC")]
    dec: Option<f64>,
    #[serde(default)]
    position: Option<String>,
    radius: f64,
}

impl ConeRow {
    fn into_cone(self, path: &Path) -> Result<Cone> {
        match (self.ra, self.dec, self.position) {
            (Some(ra), Some(dec), _) => Ok(Cone::new(ra, dec, self.radius)),
            (_, _, Some(position)) if !position.trim().is_empty() => {
                Ok(Cone::named(position.trim(), self.radius))
            }
            _ => Err(ProbeError::InvalidInput(format!(
                "{}: cone needs ra and dec, or position",
                path.display()
            ))),
        }
    }
}

/// Cone list: `{ra, dec, radius}` or `{position, radius}` entries
pub fn load_cones(path: &Path) -> Result<Vec<Cone>> {
    let rows: Vec<ConeRow> = match format_of(path)? {
        Format::Json => {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str(&text)
                .map_err(|e| ProbeError::InvalidInput(format!("{}: {}", path.display(), e)))?
        }
        Format::Csv => {
            let mut reader = csv::Reader::from_path(path)?;
            let mut rows = Vec::new();
            for row in reader.deserialize() {
                rows.push(row?);
            }
            rows
        }
    };
    let cones = rows
        .into_iter()
        .map(|row| row.into_cone(path))
        .collect::<Result<Vec<_>>>()?;
    info!(path = %path.display(), count = cones.len(), "Loaded cones");
    Ok(cones)
}

/// Statistics file from an earlier run, as services with recorded positions
pub fn load_replay(path: &Path) -> Result<Vec<ServiceDescriptor>> {
    if format_of(path)? != Format::Csv {
        return Err(ProbeError::InvalidInput(format!(
            "{}: replay expects a statistics .csv file",
            path.display()
        )));
    }

    let mut services = Vec::new();
    for row in read_csv_rows(path)? {
        let mut service = service_from_row(&row, path)?;
        service.recorded = Some(RecordedCone {
            ra: parse_float(&row, "RA", path)?,
            dec: parse_float(&row, "DEC", path)?,
            sr: parse_float(&row, "SR", path)?,
        });
        services.push(service);
    }
    info!(path = %path.display(), count = services.len(), "Loaded replay");
    Ok(services)
}

/// Write cones as a JSON list readable by [`load_cones`]
pub fn write_cones(path: &Path, cones: &[Cone]) -> Result<()> {
    let entries: Vec<Value> = cones
        .iter()
        .map(|cone| match &cone.position {
            PositionSpec::Degrees { ra, dec } => json!({"ra": ra, "dec": dec, "radius": cone.radius}),
            PositionSpec::Resolved(coord) => {
                json!({"ra": coord.ra(), "dec": coord.dec(), "radius": cone.radius})
            }
            PositionSpec::Text(text) => json!({"position": text, "radius": cone.radius}),
        })
        .collect();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&entries)?)?;
    info!(path = %path.display(), count = cones.len(), "Wrote cones");
    Ok(())
}
