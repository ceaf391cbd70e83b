//! Core domain models: service descriptors, cones and execution modes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::coords::{PositionSpec, SkyCoord};
use crate::error::{ProbeError, Result};

/// Kind of remote endpoint being timed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    /// Simple cone search: RA/DEC/SR passed as query parameters
    #[serde(rename = "cone")]
    PlainCone,
    /// Cone search whose position lives in the access URL template
    #[serde(rename = "xcone")]
    ExtendedCone,
    /// Table Access Protocol service queried with an ADQL template
    #[serde(rename = "tap")]
    Tap,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::PlainCone => "cone",
            ServiceKind::ExtendedCone => "xcone",
            ServiceKind::Tap => "tap",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cone" => Ok(ServiceKind::PlainCone),
            "xcone" => Ok(ServiceKind::ExtendedCone),
            "tap" => Ok(ServiceKind::Tap),
            other => Err(ProbeError::InvalidInput(format!(
                "unknown service_type '{}', expected cone, xcone or tap",
                other
            ))),
        }
    }
}

/// How TAP queries are submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapMode {
    Sync,
    #[default]
    Async,
}

impl TapMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TapMode::Sync => "sync",
            TapMode::Async => "async",
        }
    }
}

impl fmt::Display for TapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TapMode {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(TapMode::Sync),
            "async" => Ok(TapMode::Async),
            other => Err(ProbeError::Config(format!(
                "invalid tap mode '{}', expected sync or async",
                other
            ))),
        }
    }
}

/// RA/DEC/SR taken verbatim from a previously recorded statistics row
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordedCone {
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub sr: Option<f64>,
}

/// Declarative description of one remote endpoint.
///
/// The same `base_name` may appear on several descriptors (one per variant).
/// Replayed descriptors carry a `recorded` cone and an already substituted
/// query in `query_template`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    #[serde(default = "default_base_name")]
    pub base_name: String,
    #[serde(rename = "service_type", alias = "service_kind", alias = "kind")]
    pub kind: ServiceKind,
    #[serde(default)]
    pub access_url: Option<String>,
    #[serde(
        default,
        rename = "adql",
        alias = "ADQL",
        alias = "query_template",
        deserialize_with = "empty_as_none"
    )]
    pub query_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded: Option<RecordedCone>,
}

fn default_base_name() -> String {
    "Unnamed".to_string()
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

impl ServiceDescriptor {
    /// Create a descriptor for a live (templated) service
    pub fn new(base_name: impl Into<String>, kind: ServiceKind, access_url: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
            kind,
            access_url: Some(access_url.into()),
            query_template: None,
            recorded: None,
        }
    }

    /// Attach an ADQL template (TAP only)
    pub fn with_query_template(mut self, template: impl Into<String>) -> Self {
        self.query_template = Some(template.into());
        self
    }

    /// Attach literal RA/DEC/SR from a previous run
    pub fn with_recorded(mut self, recorded: RecordedCone) -> Self {
        self.recorded = Some(recorded);
        self
    }

    /// Check the descriptor invariants that must hold before any query runs.
    pub fn validate(&self) -> Result<()> {
        match self.access_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {}
            _ => return Err(ProbeError::MissingAccessUrl(self.base_name.clone())),
        }

        let has_template = self
            .query_template
            .as_deref()
            .map_or(false, |t| !t.trim().is_empty());
        match (self.kind, has_template) {
            (ServiceKind::Tap, false) => {
                Err(ProbeError::MissingAdqlTemplate(self.base_name.clone()))
            }
            (ServiceKind::PlainCone | ServiceKind::ExtendedCone, true) => {
                Err(ProbeError::Config(format!(
                    "service {} is of type {} but carries an ADQL template",
                    self.base_name, self.kind
                )))
            }
            _ => Ok(()),
        }
    }
}

/// One sky position to query, with its search radius in degrees
#[derive(Debug, Clone, PartialEq)]
pub struct Cone {
    pub position: PositionSpec,
    pub radius: f64,
}

impl Cone {
    pub fn new(ra: f64, dec: f64, radius: f64) -> Self {
        Self {
            position: PositionSpec::Degrees { ra, dec },
            radius,
        }
    }

    pub fn named(name: impl Into<String>, radius: f64) -> Self {
        Self {
            position: PositionSpec::Text(name.into()),
            radius,
        }
    }

    pub fn resolved(coord: SkyCoord, radius: f64) -> Self {
        Self {
            position: PositionSpec::Resolved(coord),
            radius,
        }
    }
}

impl fmt::Display for Cone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} r={}", self.position, self.radius)
    }
}
