//! Timed executor: one (service, position) attempt
//!
//! A [`Query`] resolves its position, builds the request, runs it under named
//! phase timers, streams the response to `<result_dir>[/<base_name>]/<name>.xml`
//! and reads back row and column counts. Failures end up in the record's
//! `errmsg`; only capacity errors escape [`Query::run`].

use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};

use crate::coords::PositionSpec;
use crate::error::{ProbeError, Result};
use crate::http::{BodyStream, HttpRequest, HttpResponse, STREAM_CHUNK_SIZE};
use crate::models::{Cone, ServiceDescriptor, ServiceKind, TapMode};
use crate::request::{build_request, html_unescape, BuiltRequest, ConeTarget};
use crate::state::ProbeState;
use crate::stats::{labels, PhaseRecorder, PhaseTimer, QueryParams, StatisticsRecord};
use crate::tap::TapClient;
use crate::votable;

/// Deterministic query name: `base_kind[-tapmode][_ra_dec_sr]`
pub fn query_name(base_name: &str, kind: ServiceKind, tap_mode: TapMode, params: &QueryParams) -> String {
    let mut name = format!("{}_{}", base_name, kind);
    if kind == ServiceKind::Tap {
        name.push('-');
        name.push_str(tap_mode.as_str());
    }
    if let (Some(ra), Some(dec), Some(sr)) = (params.ra, params.dec, params.sr) {
        name.push_str(&format!("_{}_{}_{}", ra, dec, sr));
    }
    name
}

pub struct Query {
    state: ProbeState,
    request: BuiltRequest,
    path: PathBuf,
    stats: StatisticsRecord,
    /// Status of the response that was (at least partly) stored
    response_status: Option<u16>,
}

impl Query {
    /// Resolve the position and build the request. Nothing is sent yet.
    pub async fn prepare(service: &ServiceDescriptor, cone: Option<&Cone>, state: &ProbeState) -> Result<Self> {
        let coord = state.resolver.resolve(cone.map(|c| &c.position)).await?;
        let target = match (coord, cone) {
            (Some(coord), Some(cone)) => Some(ConeTarget::new(coord, cone.radius)),
            _ => None,
        };
        let request = build_request(service, target.as_ref())?;

        let options = &state.options;
        let name = query_name(&service.base_name, service.kind, options.tap_mode, &request.params);
        let dir = if options.use_subdir {
            options.result_dir.join(&service.base_name)
        } else {
            options.result_dir.clone()
        };
        let path = dir.join(format!("{}.xml", name));

        let stats = StatisticsRecord::new(
            state.layout.clone(),
            name,
            service.base_name.clone(),
            service.kind,
            request.access_url.clone(),
            request.params.clone(),
        );

        Ok(Self {
            state: state.clone(),
            request,
            path,
            stats,
            response_status: None,
        })
    }

    pub fn name(&self) -> &str {
        self.stats.name()
    }

    /// Where the result is streamed to
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> &StatisticsRecord {
        &self.stats
    }

    /// Execute the query and return its completed record.
    pub async fn run(mut self) -> Result<StatisticsRecord> {
        info!(query = %self.stats.name(), url = %self.request.access_url, "Running query");

        self.stats.mark_start_time();
        let total = PhaseTimer::start(labels::QUERY_TOTAL);
        let outcome = self.execute().await;
        let closed = self.stats.close(total);
        self.stats.mark_end_time();
        closed?;

        if let Err(e) = outcome {
            if e.is_fatal() {
                return Err(e);
            }
            let msg = format!(
                "Query error for service {}: {}",
                self.stats.base_name(),
                e
            );
            error!(query = %self.stats.name(), error = %e, "Query failed");
            self.stats.append_error(msg);
        }

        if let Some(status) = self.response_status {
            self.gather_response_metadata(status);
        }

        info!(
            query = %self.stats.name(),
            duration = self.stats.query_total_duration().unwrap_or_default(),
            rows = ?self.stats.result_meta("num_rows"),
            ok = self.stats.is_success(),
            "Query finished"
        );
        Ok(self.stats)
    }

    async fn execute(&mut self) -> Result<()> {
        let http = self.state.http.clone();
        let timeout = self.state.options.poll.total_timeout;

        match self.request.kind {
            ServiceKind::PlainCone | ServiceKind::ExtendedCone => {
                let mut request = HttpRequest::get(self.request.access_url.clone()).timeout(timeout);
                if self.request.kind == ServiceKind::PlainCone {
                    for (key, value) in self.request.cone_query() {
                        request = request.query(key, value);
                    }
                }

                let timer = PhaseTimer::start(labels::DO_QUERY);
                let response = http.send(request).await;
                self.stats.close(timer)?;
                self.stream_to_file(response?).await
            }
            ServiceKind::Tap => {
                let options = &self.state.options;
                let client = TapClient::new(http, &self.request.access_url)
                    .with_format(options.result_format.clone())
                    .with_poll_policy(options.poll.clone());
                let adql = self.request.params.adql.clone().unwrap_or_default();

                match options.tap_mode {
                    TapMode::Sync => {
                        let timer = PhaseTimer::start(labels::DO_QUERY);
                        let response = client.run_sync(&adql).await;
                        self.stats.close(timer)?;
                        self.stream_to_file(response?).await
                    }
                    TapMode::Async => {
                        let delete_jobs = options.delete_jobs;

                        let timer = PhaseTimer::start(labels::DO_QUERY);
                        let result = client.run_async(&adql, &mut self.stats).await;
                        self.stats.close(timer)?;
                        let (response, job) = result?;

                        let streamed = self.stream_to_file(response).await;

                        if delete_jobs {
                            let timer = PhaseTimer::start(labels::TAP_DELETE);
                            let deleted = client.delete(&job).await;
                            self.stats.close(timer)?;
                            if let Err(e) = deleted {
                                warn!(job = %job.url(), error = %e, "Could not delete TAP job");
                            }
                        }
                        streamed
                    }
                }
            }
        }
    }

    async fn stream_to_file(&mut self, response: HttpResponse) -> Result<()> {
        self.response_status = Some(response.status);
        if !response.is_success() {
            warn!(query = %self.stats.name(), status = response.status, "Non-success status, storing body");
        }

        let timer = PhaseTimer::start(labels::STREAM_TO_FILE);
        let written = write_body(&self.path, response.body).await;
        self.stats.close(timer)?;

        let bytes = written?;
        debug!(path = %self.path.display(), bytes = bytes, "Result stored");
        Ok(())
    }

    /// Fill status, size and table shape. A result that cannot be read
    /// leaves the shape null and the file in place.
    fn gather_response_metadata(&mut self, status: u16) {
        self.stats.set_result_meta("status", status);

        let summary = votable::inspect_file(&self.path).and_then(|summary| {
            let size = std::fs::metadata(&self.path)?.len();
            Ok((summary, size))
        });

        match summary {
            Ok((summary, size)) => {
                self.stats.set_result_meta("size", size);
                self.stats.set_result_meta("num_rows", summary.num_rows);
                self.stats.set_result_meta("num_columns", summary.num_columns);

                if !self.state.options.save_results {
                    if let Err(e) = std::fs::remove_file(&self.path) {
                        warn!(path = %self.path.display(), error = %e, "Could not remove result file");
                        self.stats.append_error(format!(
                            "In {}, error removing result file: {}",
                            self.stats.name(),
                            e
                        ));
                    }
                }
            }
            Err(e) => {
                let msg = format!("In {}, error reading result table: {}", self.stats.name(), e);
                error!(query = %self.stats.name(), error = %e, "Could not read result table");
                self.stats.append_error(msg);
            }
        }
    }
}

async fn write_body(path: &Path, mut body: BodyStream) -> Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::File::create(path).await?;
    let mut writer = BufWriter::with_capacity(STREAM_CHUNK_SIZE, file);

    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    writer.flush().await?;
    Ok(written)
}

/// Record for an attempt that failed before any request could be built
pub fn failed_record(
    service: &ServiceDescriptor,
    cone: Option<&Cone>,
    state: &ProbeState,
    error: &ProbeError,
) -> StatisticsRecord {
    let params = match cone {
        Some(Cone {
            position: PositionSpec::Degrees { ra, dec },
            radius,
        }) => QueryParams::cone(Some(*ra), Some(*dec), Some(*radius)),
        Some(Cone {
            position: PositionSpec::Resolved(coord),
            radius,
        }) => QueryParams::cone(Some(coord.ra()), Some(coord.dec()), Some(*radius)),
        _ => match &service.recorded {
            Some(rec) => QueryParams::cone(rec.ra, rec.dec, rec.sr),
            None => QueryParams::default(),
        },
    };
    let name = query_name(&service.base_name, service.kind, state.options.tap_mode, &params);
    let access_url = service.access_url.as_deref().map(html_unescape).unwrap_or_default();

    let mut stats = StatisticsRecord::new(
        state.layout.clone(),
        name,
        service.base_name.clone(),
        service.kind,
        access_url,
        params,
    );
    stats.mark_start_time();
    stats.append_error(format!(
        "Query error for service {}: {}",
        service.base_name, error
    ));
    stats.mark_end_time();
    stats
}

/// Executes one (service, position) pair and yields its record.
///
/// Only fatal errors are returned as `Err`; everything else is a record with
/// a non-empty `errmsg`.
#[async_trait]
pub trait TimedQuery: Send + Sync {
    async fn execute(&self, service: &ServiceDescriptor, cone: Option<&Cone>) -> Result<StatisticsRecord>;
}

/// The builtin `timed_query` plugin
pub struct StandardTimedQuery {
    state: ProbeState,
}

impl StandardTimedQuery {
    pub fn new(state: ProbeState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl TimedQuery for StandardTimedQuery {
    async fn execute(&self, service: &ServiceDescriptor, cone: Option<&Cone>) -> Result<StatisticsRecord> {
        match Query::prepare(service, cone, &self.state).await {
            Ok(query) => query.run().await,
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!(service = %service.base_name, error = %e, "Could not prepare query");
                Ok(failed_record(service, cone, &self.state, &e))
            }
        }
    }
}
