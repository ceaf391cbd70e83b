//! Plugin registry
//!
//! Two kinds of plugins are known: result writers and timed queries. The
//! builtins are registered up front; JSON manifests found in a plugin
//! directory (or a single manifest file) add named presets of existing
//! plugins with default keyword arguments.
//!
//! Plugins are addressed by a textual spec:
//!
//! ```text
//! spec   := name | name ":" kwarg ("," kwarg)*
//! kwarg  := key "=" value
//! ```
//!
//! Whitespace is ignored; keys contain no `=` or `,`, values contain no `,`.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ProbeError, Result};
use crate::query::{StandardTimedQuery, TimedQuery};
use crate::state::ProbeState;
use crate::writers::{self, check_kwargs, Kwargs, ResultWriter};

pub const TIMED_QUERY: &str = "timed_query";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    ResultWriter,
    TimedQuery,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::ResultWriter => "result_writer",
            PluginKind::TimedQuery => "timed_query",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A parsed plugin spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    pub kwargs: Kwargs,
}

pub fn parse_spec(spec: &str) -> Result<PluginSpec> {
    let invalid = || ProbeError::InvalidPluginSpec(spec.to_string());

    let stripped: String = spec.chars().filter(|c| !c.is_whitespace()).collect();
    let (name, rest) = match stripped.split_once(':') {
        Some((name, rest)) => (name, Some(rest)),
        None => (stripped.as_str(), None),
    };
    if name.is_empty() {
        return Err(invalid());
    }

    let mut kwargs = Kwargs::new();
    if let Some(rest) = rest {
        let kwarg = Regex::new(r"^([^=,]+)=([^,]+)$").map_err(|e| ProbeError::Config(e.to_string()))?;
        for pair in rest.split(',') {
            let caps = kwarg.captures(pair).ok_or_else(invalid)?;
            kwargs.insert(caps[1].to_string(), caps[2].to_string());
        }
    }

    Ok(PluginSpec {
        name: name.to_string(),
        kwargs,
    })
}

/// Substitute strftime elements (`%Y-%m-%d` and so on) with `now`.
/// A spec containing an invalid element is returned unchanged.
pub fn expand_time_elements<Tz>(spec: &str, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    if !spec.contains('%') {
        return spec.to_string();
    }
    let items: Vec<Item<'_>> = StrftimeItems::new(spec).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return spec.to_string();
    }
    now.format_with_items(items.into_iter()).to_string()
}

type WriterFactory = fn(&Kwargs) -> Result<Box<dyn ResultWriter>>;
type QueryFactory = fn(&Kwargs, &ProbeState) -> Result<Arc<dyn TimedQuery>>;

#[derive(Clone, Copy)]
enum Factory {
    Writer(WriterFactory),
    Query(QueryFactory),
}

impl Factory {
    fn kind(&self) -> PluginKind {
        match self {
            Factory::Writer(_) => PluginKind::ResultWriter,
            Factory::Query(_) => PluginKind::TimedQuery,
        }
    }
}

#[derive(Clone)]
struct PluginEntry {
    description: String,
    factory: Factory,
    defaults: Kwargs,
    base: Option<String>,
}

/// Listing entry for the `plugins` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub kind: PluginKind,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
}

/// On-disk preset of an existing plugin
#[derive(Debug, Deserialize)]
struct PluginManifest {
    name: String,
    kind: PluginKind,
    base: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    kwargs: BTreeMap<String, Value>,
}

fn standard_timed_query(kwargs: &Kwargs, state: &ProbeState) -> Result<Arc<dyn TimedQuery>> {
    check_kwargs(TIMED_QUERY, kwargs, &[])?;
    Ok(Arc::new(StandardTimedQuery::new(state.clone())))
}

pub struct PluginRegistry {
    entries: BTreeMap<(PluginKind, String), PluginEntry>,
}

impl PluginRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self {
            entries: BTreeMap::new(),
        };
        registry.insert(
            writers::csv_writer::NAME,
            writers::csv_writer::DESCRIPTION,
            Factory::Writer(writers::CsvWriter::from_kwargs),
        );
        registry.insert(
            writers::http_writer::NAME,
            writers::http_writer::DESCRIPTION,
            Factory::Writer(writers::HttpWriter::from_kwargs),
        );
        registry.insert(
            writers::postgres_writer::NAME,
            writers::postgres_writer::DESCRIPTION,
            Factory::Writer(writers::PostgresWriter::from_kwargs),
        );
        registry.insert(
            TIMED_QUERY,
            "Times cone, xcone and TAP queries and records their result metadata.",
            Factory::Query(standard_timed_query),
        );
        registry
    }

    fn insert(&mut self, name: &str, description: &str, factory: Factory) {
        self.entries.insert(
            (factory.kind(), name.to_string()),
            PluginEntry {
                description: description.to_string(),
                factory,
                defaults: Kwargs::new(),
                base: None,
            },
        );
    }

    /// Load manifests from a directory (every `*.json`) or a single file.
    ///
    /// A missing path is an error only when `required`. Returns the number of
    /// plugins registered.
    pub fn load_path(&mut self, path: &Path, required: bool) -> Result<usize> {
        if !path.exists() {
            if required {
                return Err(ProbeError::Config(format!(
                    "plugin path {} does not exist",
                    path.display()
                )));
            }
            debug!(path = %path.display(), "No plugin directory");
            return Ok(0);
        }

        if path.is_dir() {
            let mut files = Vec::new();
            for entry in std::fs::read_dir(path)? {
                let file = entry?.path();
                if file.is_file() && file.extension().map_or(false, |ext| ext == "json") {
                    files.push(file);
                }
            }
            files.sort();
            for file in &files {
                self.load_manifest(file)?;
            }
            Ok(files.len())
        } else if path.extension().map_or(false, |ext| ext == "json") {
            self.load_manifest(path)?;
            Ok(1)
        } else {
            Err(ProbeError::Config(format!(
                "plugin file {} is not a .json manifest",
                path.display()
            )))
        }
    }

    fn load_manifest(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let manifest: PluginManifest = serde_json::from_str(&text).map_err(|e| {
            ProbeError::Config(format!("invalid plugin manifest {}: {}", path.display(), e))
        })?;

        let base = self
            .entries
            .get(&(manifest.kind, manifest.base.clone()))
            .cloned()
            .ok_or_else(|| {
                ProbeError::UnknownPlugin(format!(
                    "{} (base of {} in {})",
                    manifest.base,
                    manifest.name,
                    path.display()
                ))
            })?;

        let mut defaults = base.defaults;
        for (key, value) in manifest.kwargs {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            defaults.insert(key, value);
        }

        let key = (manifest.kind, manifest.name.clone());
        if self.entries.contains_key(&key) {
            warn!(plugin = %manifest.name, path = %path.display(), "Plugin redefined");
        }
        info!(plugin = %manifest.name, kind = %manifest.kind, base = %manifest.base, "Loaded plugin");
        self.entries.insert(
            key,
            PluginEntry {
                description: manifest.description.unwrap_or(base.description),
                factory: base.factory,
                defaults,
                base: Some(manifest.base),
            },
        );
        Ok(())
    }

    /// Every registered plugin, sorted by kind then name
    pub fn list(&self) -> Vec<PluginInfo> {
        self.entries
            .iter()
            .map(|((kind, name), entry)| PluginInfo {
                name: name.clone(),
                kind: *kind,
                description: entry.description.clone(),
                base: entry.base.clone(),
            })
            .collect()
    }

    /// Manifest defaults overridden by the spec's kwargs. With `now`, time
    /// elements in the defaults are expanded too.
    fn lookup(&self, kind: PluginKind, spec: &PluginSpec, now: Option<&DateTime<Local>>) -> Result<(Factory, Kwargs)> {
        let entry = self
            .entries
            .get(&(kind, spec.name.clone()))
            .ok_or_else(|| ProbeError::UnknownPlugin(format!("{} ({})", spec.name, kind)))?;
        let mut kwargs: Kwargs = match now {
            Some(now) => entry
                .defaults
                .iter()
                .map(|(k, v)| (k.clone(), expand_time_elements(v, now)))
                .collect(),
            None => entry.defaults.clone(),
        };
        kwargs.extend(spec.kwargs.clone());
        Ok((entry.factory, kwargs))
    }

    /// Instantiate a result writer; time elements in `spec` are expanded first
    pub fn create_writer(&self, spec: &str) -> Result<Box<dyn ResultWriter>> {
        let now = Local::now();
        let parsed = parse_spec(&expand_time_elements(spec, &now))?;
        match self.lookup(PluginKind::ResultWriter, &parsed, Some(&now))? {
            (Factory::Writer(factory), kwargs) => factory(&kwargs),
            (Factory::Query(_), _) => Err(ProbeError::UnknownPlugin(parsed.name)),
        }
    }

    pub fn create_timed_query(&self, spec: &str, state: &ProbeState) -> Result<Arc<dyn TimedQuery>> {
        let parsed = parse_spec(spec)?;
        match self.lookup(PluginKind::TimedQuery, &parsed, None)? {
            (Factory::Query(factory), kwargs) => factory(&kwargs, state),
            (Factory::Writer(_), _) => Err(ProbeError::UnknownPlugin(parsed.name)),
        }
    }
}
