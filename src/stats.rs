//! Per-query statistics records
//!
//! A [`StatisticsRecord`] is one row of output: identity, request shape,
//! phase durations, result metadata and accumulated error text. Its column
//! set depends only on its [`StatsLayout`], so every record produced with the
//! same layout serializes under the same header.

use chrono::{DateTime, Local};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{ProbeError, Result};
use crate::models::ServiceKind;

/// Default number of extra named-duration slots per record
pub const DEFAULT_MAX_EXTRA_DURATIONS: usize = 8;

/// Lexically sortable wall-clock format for start/end times
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Timing labels
pub mod labels {
    pub const DO_QUERY: &str = "do_query";
    pub const STREAM_TO_FILE: &str = "stream_to_file";
    pub const QUERY_TOTAL: &str = "query_total";

    // Async TAP sub-phases, in protocol order
    pub const TAP_SUBMIT: &str = "tap_submit";
    pub const TAP_RUN: &str = "tap_run";
    pub const TAP_WAIT: &str = "tap_wait";
    pub const TAP_RAISE_IF_ERROR: &str = "tap_raise_if_error";
    pub const TAP_FETCH_RESPONSE: &str = "tap_fetch_response";
    pub const TAP_DELETE: &str = "tap_delete";
}

/// Result metadata registered by the timed executor
pub const RESULT_META_FIELDS: [&str; 4] = ["status", "size", "num_rows", "num_columns"];

/// A closed timing phase
#[derive(Debug, Clone, PartialEq)]
pub struct NamedDuration {
    pub label: String,
    pub seconds: f64,
}

impl NamedDuration {
    pub fn new(label: impl Into<String>, seconds: f64) -> Self {
        Self {
            label: label.into(),
            seconds,
        }
    }
}

/// Stopwatch for one phase; stopping it yields the phase duration.
#[derive(Debug)]
pub struct PhaseTimer {
    label: &'static str,
    started: Instant,
}

impl PhaseTimer {
    pub fn start(label: &'static str) -> Self {
        Self {
            label,
            started: Instant::now(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn stop(self) -> NamedDuration {
        NamedDuration::new(self.label, self.started.elapsed().as_secs_f64())
    }
}

/// Destination for closed phases
pub trait PhaseRecorder: Send {
    fn record_phase(&mut self, phase: NamedDuration) -> Result<()>;

    /// Stop `timer` and record it
    fn close(&mut self, timer: PhaseTimer) -> Result<()> {
        self.record_phase(timer.stop())
    }
}

impl PhaseRecorder for Vec<NamedDuration> {
    fn record_phase(&mut self, phase: NamedDuration) -> Result<()> {
        self.push(phase);
        Ok(())
    }
}

/// Column configuration shared by all records of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsLayout {
    max_extra_durations: usize,
    result_meta_fields: Vec<String>,
}

impl Default for StatsLayout {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EXTRA_DURATIONS, &RESULT_META_FIELDS)
    }
}

impl StatsLayout {
    pub fn new(max_extra_durations: usize, result_meta_fields: &[&str]) -> Self {
        Self {
            max_extra_durations,
            result_meta_fields: result_meta_fields.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[inline]
    pub fn max_extra_durations(&self) -> usize {
        self.max_extra_durations
    }

    pub fn result_meta_fields(&self) -> &[String] {
        &self.result_meta_fields
    }

    /// Ordered column names
    pub fn columns(&self) -> Vec<String> {
        let mut cols: Vec<String> = [
            "name",
            "start_time",
            "end_time",
            "do_query_duration",
            "stream_to_file_duration",
            "query_total_duration",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        for i in 0..self.max_extra_durations {
            cols.push(format!("extra_dur{}_name", i));
            cols.push(format!("extra_dur{}_value", i));
        }

        cols.extend(
            [
                "base_name",
                "service_kind",
                "RA",
                "DEC",
                "SR",
                "ADQL",
                "other_params",
                "access_url",
                "errmsg",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        cols.extend(self.result_meta_fields.iter().cloned());
        cols
    }
}

/// Request parameters as recorded: the fixed RA/DEC/SR/ADQL set plus anything else
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub sr: Option<f64>,
    pub adql: Option<String>,
    pub other: BTreeMap<String, Value>,
}

impl QueryParams {
    pub fn cone(ra: Option<f64>, dec: Option<f64>, sr: Option<f64>) -> Self {
        Self {
            ra,
            dec,
            sr,
            ..Self::default()
        }
    }
}

/// One row per executed (service, position) attempt
#[derive(Debug, Clone)]
pub struct StatisticsRecord {
    layout: Arc<StatsLayout>,
    name: String,
    base_name: String,
    service_kind: ServiceKind,
    access_url: String,
    params: QueryParams,
    start_time: Option<DateTime<Local>>,
    end_time: Option<DateTime<Local>>,
    do_query_duration: Option<f64>,
    stream_to_file_duration: Option<f64>,
    query_total_duration: Option<f64>,
    extra_durations: Vec<NamedDuration>,
    result_meta: BTreeMap<String, Value>,
    errmsg: String,
}

impl StatisticsRecord {
    pub fn new(
        layout: Arc<StatsLayout>,
        name: impl Into<String>,
        base_name: impl Into<String>,
        service_kind: ServiceKind,
        access_url: impl Into<String>,
        params: QueryParams,
    ) -> Self {
        Self {
            layout,
            name: name.into(),
            base_name: base_name.into(),
            service_kind,
            access_url: access_url.into(),
            params,
            start_time: None,
            end_time: None,
            do_query_duration: None,
            stream_to_file_duration: None,
            query_total_duration: None,
            extra_durations: Vec::new(),
            result_meta: BTreeMap::new(),
            errmsg: String::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn service_kind(&self) -> ServiceKind {
        self.service_kind
    }

    pub fn access_url(&self) -> &str {
        &self.access_url
    }

    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    pub fn layout(&self) -> &StatsLayout {
        &self.layout
    }

    pub fn mark_start_time(&mut self) {
        self.start_time = Some(Local::now());
    }

    pub fn mark_end_time(&mut self) {
        self.end_time = Some(Local::now());
    }

    pub fn start_time(&self) -> Option<DateTime<Local>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Local>> {
        self.end_time
    }

    pub fn do_query_duration(&self) -> Option<f64> {
        self.do_query_duration
    }

    pub fn stream_to_file_duration(&self) -> Option<f64> {
        self.stream_to_file_duration
    }

    pub fn query_total_duration(&self) -> Option<f64> {
        self.query_total_duration
    }

    pub fn extra_durations(&self) -> &[NamedDuration] {
        &self.extra_durations
    }

    /// Append a named duration; fails once the layout's slots are used up.
    pub fn add_named_duration(&mut self, label: impl Into<String>, seconds: f64) -> Result<()> {
        let max = self.layout.max_extra_durations();
        if self.extra_durations.len() >= max {
            return Err(ProbeError::TooManyDurations(max));
        }
        self.extra_durations.push(NamedDuration::new(label, seconds));
        Ok(())
    }

    /// Accumulated error text; empty means success.
    pub fn errmsg(&self) -> &str {
        &self.errmsg
    }

    pub fn is_success(&self) -> bool {
        self.errmsg.is_empty()
    }

    /// Add an error message without discarding earlier ones
    pub fn append_error(&mut self, msg: impl AsRef<str>) {
        if !self.errmsg.is_empty() {
            self.errmsg.push_str("; ");
        }
        self.errmsg.push_str(msg.as_ref());
    }

    /// Set a registered result metadata field. Unregistered keys are ignored
    /// so the column set stays fixed.
    pub fn set_result_meta(&mut self, key: &str, value: impl Into<Value>) -> bool {
        if !self.layout.result_meta_fields().iter().any(|f| f == key) {
            return false;
        }
        self.result_meta.insert(key.to_string(), value.into());
        true
    }

    /// `None` when the field is null
    pub fn result_meta(&self, key: &str) -> Option<&Value> {
        self.result_meta.get(key).filter(|v| !v.is_null())
    }

    pub fn columns(&self) -> Vec<String> {
        self.layout.columns()
    }

    /// Values keyed by column name; unset values are `Value::Null`.
    pub fn row_values(&self) -> Map<String, Value> {
        let mut row = Map::new();

        row.insert("name".into(), Value::String(self.name.clone()));
        row.insert("start_time".into(), format_time(self.start_time));
        row.insert("end_time".into(), format_time(self.end_time));
        row.insert("do_query_duration".into(), number(self.do_query_duration));
        row.insert(
            "stream_to_file_duration".into(),
            number(self.stream_to_file_duration),
        );
        row.insert("query_total_duration".into(), number(self.query_total_duration));

        for i in 0..self.layout.max_extra_durations() {
            let (name, value) = match self.extra_durations.get(i) {
                Some(d) => (Value::String(d.label.clone()), number(Some(d.seconds))),
                None => (Value::Null, Value::Null),
            };
            row.insert(format!("extra_dur{}_name", i), name);
            row.insert(format!("extra_dur{}_value", i), value);
        }

        row.insert("base_name".into(), Value::String(self.base_name.clone()));
        row.insert(
            "service_kind".into(),
            Value::String(self.service_kind.to_string()),
        );
        row.insert("RA".into(), number(self.params.ra));
        row.insert("DEC".into(), number(self.params.dec));
        row.insert("SR".into(), number(self.params.sr));
        row.insert(
            "ADQL".into(),
            Value::String(self.params.adql.clone().unwrap_or_default()),
        );
        row.insert(
            "other_params".into(),
            Value::Object(self.params.other.clone().into_iter().collect()),
        );
        row.insert("access_url".into(), Value::String(self.access_url.clone()));
        row.insert("errmsg".into(), Value::String(self.errmsg.clone()));

        for field in self.layout.result_meta_fields() {
            let value = self.result_meta.get(field).cloned().unwrap_or(Value::Null);
            row.insert(field.clone(), value);
        }

        row
    }
}

impl PhaseRecorder for StatisticsRecord {
    fn record_phase(&mut self, phase: NamedDuration) -> Result<()> {
        match phase.label.as_str() {
            labels::DO_QUERY => self.do_query_duration = Some(phase.seconds),
            labels::STREAM_TO_FILE => self.stream_to_file_duration = Some(phase.seconds),
            labels::QUERY_TOTAL => self.query_total_duration = Some(phase.seconds),
            _ => return self.add_named_duration(phase.label, phase.seconds),
        }
        Ok(())
    }
}

fn number(value: Option<f64>) -> Value {
    value
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn format_time(time: Option<DateTime<Local>>) -> Value {
    time.map(|t| Value::String(t.format(TIME_FORMAT).to_string()))
        .unwrap_or(Value::Null)
}
