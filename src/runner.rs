//! Batch runner: positions × services, every record to every writer

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::DEFAULT_CONE_LIMIT;
use crate::error::Result;
use crate::metrics::{RunMetrics, RunSummary};
use crate::models::{Cone, ServiceDescriptor};
use crate::query::TimedQuery;
use crate::stats::StatisticsRecord;
use crate::writers::{ResultWriter, RunInfo};

/// Check the service list before anything runs.
///
/// Broken descriptors are an error. Returns advisories for an empty list and
/// for mixed service kinds; those are logged and the run goes ahead.
pub fn validate_services(services: &[ServiceDescriptor]) -> Result<Vec<String>> {
    for service in services {
        service.validate()?;
    }

    let mut advisories = Vec::new();
    match services.split_first() {
        None => advisories.push("Service list is empty. Nothing will be timed.".to_string()),
        Some((first, rest)) => {
            if rest.iter().any(|s| s.kind != first.kind) {
                advisories.push(
                    "Differing service_type values found in service list. Some result writers may fail."
                        .to_string(),
                );
            }
        }
    }
    for advisory in &advisories {
        warn!("{}", advisory);
    }
    Ok(advisories)
}

pub struct BatchRunner {
    query: Arc<dyn TimedQuery>,
    writers: Vec<Box<dyn ResultWriter>>,
    metrics: Arc<RunMetrics>,
    start_index: usize,
    cone_limit: usize,
}

impl BatchRunner {
    pub fn new(query: Arc<dyn TimedQuery>, writers: Vec<Box<dyn ResultWriter>>, metrics: Arc<RunMetrics>) -> Self {
        Self {
            query,
            writers,
            metrics,
            start_index: 0,
            cone_limit: DEFAULT_CONE_LIMIT,
        }
    }

    /// Skip the first `start_index` positions, then process at most `cone_limit`.
    /// Without positions the window applies to the service list.
    pub fn with_window(mut self, start_index: usize, cone_limit: usize) -> Self {
        self.start_index = start_index;
        self.cone_limit = cone_limit;
        self
    }

    /// Run every (position, service) pair in order.
    ///
    /// `cones` of `None` runs each service once with no position. Per-query
    /// failures become records; a fatal error stops the batch after the
    /// writers have been ended.
    pub async fn run(
        &mut self,
        run: &RunInfo,
        services: &[ServiceDescriptor],
        cones: Option<&[Cone]>,
    ) -> Result<RunSummary> {
        self.metrics.reset();
        if let Err(e) = validate_services(services) {
            if e.is_configuration() {
                error!(error = %e, "Service list rejected, nothing was queried");
            }
            return Err(e);
        }

        for writer in self.writers.iter_mut() {
            writer.begin(run).await?;
        }
        info!(run_id = %run.run_id, services = services.len(), "Starting run");

        let outcome = self.run_pairs(services, cones).await;

        for writer in self.writers.iter_mut() {
            if let Err(e) = writer.end().await {
                warn!(writer = writer.name(), error = %e, "Writer failed to finish");
            }
        }

        let summary = self.metrics.snapshot();
        match &outcome {
            Ok(()) => info!(%summary, "Run complete"),
            Err(e) => error!(%summary, error = %e, "Run aborted"),
        }
        outcome.map(|_| summary)
    }

    async fn run_pairs(&mut self, services: &[ServiceDescriptor], cones: Option<&[Cone]>) -> Result<()> {
        match cones {
            Some(cones) => {
                for cone in cones.iter().skip(self.start_index).take(self.cone_limit) {
                    for service in services {
                        let stats = self.query.execute(service, Some(cone)).await?;
                        self.deliver(&stats).await;
                    }
                }
            }
            None => {
                for service in services.iter().skip(self.start_index).take(self.cone_limit) {
                    let stats = self.query.execute(service, None).await?;
                    self.deliver(&stats).await;
                }
            }
        }
        Ok(())
    }

    /// Hand one record to every writer; a failing writer does not stop the others
    async fn deliver(&mut self, stats: &StatisticsRecord) {
        self.metrics.inc_attempted();
        if stats.is_success() {
            info!(query = stats.name(), duration = ?stats.query_total_duration(), "Query done");
        } else {
            self.metrics.inc_failed();
            warn!(query = stats.name(), errmsg = stats.errmsg(), "Query failed");
        }

        for writer in self.writers.iter_mut() {
            match writer.one_result(stats).await {
                Ok(()) => self.metrics.inc_delivered(),
                Err(e) => {
                    self.metrics.inc_delivery_failures();
                    error!(
                        writer = writer.name(),
                        query = stats.name(),
                        error = %e,
                        "Unable to write stats"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryOptions;
    use crate::coords::testing::FixedNames;
    use crate::error::ProbeError;
    use crate::http::testing::{StubBackend, SMALL_VOTABLE};
    use crate::http::{HttpRequest, HttpResponse};
    use crate::models::ServiceKind;
    use crate::query::StandardTimedQuery;
    use crate::state::ProbeState;
    use crate::writers::testing::RecordingWriter;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::path::Path;

    #[derive(Clone, Default)]
    struct CollectingWriter {
        records: Arc<Mutex<Vec<StatisticsRecord>>>,
    }

    #[async_trait]
    impl ResultWriter for CollectingWriter {
        fn name(&self) -> &str {
            "collecting"
        }

        async fn begin(&mut self, _run: &RunInfo) -> Result<()> {
            Ok(())
        }

        async fn one_result(&mut self, stats: &StatisticsRecord) -> Result<()> {
            self.records.lock().push(stats.clone());
            Ok(())
        }

        async fn end(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn state(dir: &Path, fail_at: Option<usize>) -> ProbeState {
        let backend = StubBackend::new(move |req: &HttpRequest, index| {
            if Some(index) == fail_at {
                return Err(ProbeError::Http("connection refused".into()));
            }
            Ok(HttpResponse::from_bytes(200, req.url.clone(), SMALL_VOTABLE))
        });
        let options = QueryOptions {
            result_dir: dir.to_path_buf(),
            ..QueryOptions::default()
        };
        ProbeState::new(Arc::new(backend), Arc::new(FixedNames::empty()), options)
    }

    fn services() -> Vec<ServiceDescriptor> {
        vec![
            ServiceDescriptor::new("HSC", ServiceKind::PlainCone, "http://h/scs?"),
            ServiceDescriptor::new("GALEX", ServiceKind::PlainCone, "http://g/scs?"),
        ]
    }

    fn cones() -> Vec<Cone> {
        vec![
            Cone::new(10.0, 20.0, 0.1),
            Cone::new(11.0, 21.0, 0.1),
            Cone::new(12.0, 22.0, 0.1),
        ]
    }

    #[tokio::test]
    async fn test_one_failure_still_yields_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), Some(3));
        let collected = CollectingWriter::default();
        let mut runner = BatchRunner::new(
            Arc::new(StandardTimedQuery::new(state.clone())),
            vec![Box::new(collected.clone())],
            state.metrics.clone(),
        );

        let run = RunInfo::new("services.json", dir.path(), false);
        let summary = runner.run(&run, &services(), Some(&cones())).await.unwrap();

        let records = collected.records.lock();
        assert_eq!(records.len(), 6);
        let failed: Vec<&StatisticsRecord> = records.iter().filter(|r| !r.is_success()).collect();
        assert_eq!(failed.len(), 1);
        let failed = failed[0];
        assert_eq!(failed.name(), "GALEX_cone_11_21_0.1");
        assert!(failed.errmsg().contains("connection refused"));
        for field in ["status", "size", "num_rows", "num_columns"] {
            assert!(failed.result_meta(field).map_or(true, |v| v.is_null()));
        }

        // Positions are the outer loop
        let names: Vec<&str> = records.iter().map(|r| r.name()).collect();
        assert_eq!(names[0], "HSC_cone_10_20_0.1");
        assert_eq!(names[1], "GALEX_cone_10_20_0.1");
        assert_eq!(names[2], "HSC_cone_11_21_0.1");
        assert_eq!(records[0].result_meta("num_rows"), Some(&json!(2)));

        assert_eq!(summary.queries_attempted, 6);
        assert_eq!(summary.queries_failed, 1);
        assert_eq!(summary.records_delivered, 6);
        assert_eq!(summary.delivery_failures, 0);
    }

    #[tokio::test]
    async fn test_failing_writer_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), None);
        let flaky = RecordingWriter {
            fail_on: Some(1),
            ..RecordingWriter::default()
        };
        let steady = RecordingWriter::default();
        let mut runner = BatchRunner::new(
            Arc::new(StandardTimedQuery::new(state.clone())),
            vec![Box::new(flaky.clone()), Box::new(steady.clone())],
            state.metrics.clone(),
        );

        let run = RunInfo::new("services.json", dir.path(), false);
        let summary = runner.run(&run, &services(), Some(&cones()[..1])).await.unwrap();

        assert_eq!(
            *flaky.events.lock(),
            vec!["begin", "row:HSC_cone_10_20_0.1", "row:failed", "end"]
        );
        assert_eq!(
            *steady.events.lock(),
            vec!["begin", "row:HSC_cone_10_20_0.1", "row:GALEX_cone_10_20_0.1", "end"]
        );
        assert_eq!(summary.records_delivered, 3);
        assert_eq!(summary.delivery_failures, 1);
    }

    #[tokio::test]
    async fn test_start_index_and_cone_limit() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), None);
        let writer = RecordingWriter::default();
        let mut runner = BatchRunner::new(
            Arc::new(StandardTimedQuery::new(state.clone())),
            vec![Box::new(writer.clone())],
            state.metrics.clone(),
        )
        .with_window(1, 1);

        let run = RunInfo::new("services.json", dir.path(), false);
        runner.run(&run, &services(), Some(&cones())).await.unwrap();

        assert_eq!(
            *writer.events.lock(),
            vec!["begin", "row:HSC_cone_11_21_0.1", "row:GALEX_cone_11_21_0.1", "end"]
        );
    }

    #[tokio::test]
    async fn test_services_only_window_applies_to_services() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), None);
        let writer = RecordingWriter::default();
        let services: Vec<ServiceDescriptor> = ["A", "B", "C"]
            .iter()
            .map(|name| ServiceDescriptor::new(*name, ServiceKind::PlainCone, "http://h/scs?RA=1&DEC=2&SR=0.1"))
            .collect();
        let mut runner = BatchRunner::new(
            Arc::new(StandardTimedQuery::new(state.clone())),
            vec![Box::new(writer.clone())],
            state.metrics.clone(),
        )
        .with_window(1, 5);

        let run = RunInfo::new("services.json", dir.path(), false);
        runner.run(&run, &services, None).await.unwrap();

        assert_eq!(*writer.events.lock(), vec!["begin", "row:B_cone", "row:C_cone", "end"]);
    }

    #[test]
    fn test_validate_services_advisories() {
        assert_eq!(validate_services(&[]).unwrap().len(), 1);
        assert!(validate_services(&services()).unwrap().is_empty());

        let mut mixed = services();
        mixed.push(
            ServiceDescriptor::new("PS1", ServiceKind::Tap, "http://p/tap").with_query_template("SELECT 1"),
        );
        let advisories = validate_services(&mixed).unwrap();
        assert_eq!(advisories.len(), 1);
        assert!(advisories[0].contains("Differing service_type"));

        let broken = vec![ServiceDescriptor::new("PS1", ServiceKind::Tap, "http://p/tap")];
        assert!(matches!(
            validate_services(&broken),
            Err(ProbeError::MissingAdqlTemplate(_))
        ));
    }

    struct ExhaustedQuery;

    #[async_trait]
    impl TimedQuery for ExhaustedQuery {
        async fn execute(&self, _service: &ServiceDescriptor, _cone: Option<&Cone>) -> Result<StatisticsRecord> {
            Err(ProbeError::TooManyDurations(8))
        }
    }

    #[tokio::test]
    async fn test_fatal_error_ends_writers_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RecordingWriter::default();
        let mut runner = BatchRunner::new(
            Arc::new(ExhaustedQuery),
            vec![Box::new(writer.clone())],
            Arc::new(RunMetrics::new()),
        );

        let run = RunInfo::new("services.json", dir.path(), false);
        let result = runner.run(&run, &services(), Some(&cones())).await;

        assert!(matches!(result, Err(ProbeError::TooManyDurations(8))));
        assert_eq!(*writer.events.lock(), vec!["begin", "end"]);
    }
}
