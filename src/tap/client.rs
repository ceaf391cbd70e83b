//! TAP client: sync queries and the UWS async job lifecycle

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::job::{parse_job_document, AsyncJob, JobPhase};
use crate::error::{ProbeError, Result};
use crate::http::{resolve_location, HttpBackend, HttpRequest, HttpResponse};
use crate::stats::{labels, PhaseRecorder, PhaseTimer};

/// Polling behaviour while waiting for an async job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// First sleep between plain (UWS 1.0) polls, and the minimum gap between
    /// blocking polls
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Wall-clock ceiling for the whole wait
    pub total_timeout: Duration,
    /// Timeout for each plain poll
    pub request_timeout: Duration,
    /// Extra client-side time allowed on top of a blocking WAIT
    pub wait_slack: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs_f64(1.0),
            multiplier: 1.2,
            max_interval: Duration::from_secs(120),
            total_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            wait_slack: Duration::from_secs(5),
        }
    }
}

impl PollPolicy {
    pub fn with_total_timeout(mut self, total: Duration) -> Self {
        self.total_timeout = total;
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_interval)
    }
}

pub struct TapClient {
    http: Arc<dyn HttpBackend>,
    base_url: String,
    format: String,
    poll: PollPolicy,
}

impl TapClient {
    pub fn new(http: Arc<dyn HttpBackend>, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            format: "votable".to_string(),
            poll: PollPolicy::default(),
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn query_form(&self, adql: &str) -> Vec<(String, String)> {
        vec![
            ("REQUEST".into(), "doQuery".into()),
            ("LANG".into(), "ADQL".into()),
            ("FORMAT".into(), self.format.clone()),
            ("QUERY".into(), adql.to_string()),
        ]
    }

    /// Synchronous query; the streamed response is the result
    pub async fn run_sync(&self, adql: &str) -> Result<HttpResponse> {
        let url = format!("{}/sync", self.base_url);
        debug!(url = %url, "Submitting sync TAP query");

        let request = HttpRequest::post(url)
            .form(self.query_form(adql))
            .timeout(self.poll.total_timeout);
        self.http.send(request).await?.error_for_status()
    }

    /// Create an async job; its URL comes from the `Location` header
    pub async fn submit(&self, adql: &str) -> Result<AsyncJob> {
        let url = format!("{}/async", self.base_url);
        let request = HttpRequest::post(url.clone())
            .form(self.query_form(adql))
            .timeout(self.poll.request_timeout)
            .no_redirects();

        let response = self.http.send(request).await?.error_for_status()?;
        let location = response.location.clone().ok_or_else(|| {
            ProbeError::Protocol(format!(
                "async submission to {} returned status {} without a Location header",
                url, response.status
            ))
        })?;
        let job_url = resolve_location(&response.url, &location)?;

        info!(job = %job_url, "Async TAP job created");
        Ok(AsyncJob::new(job_url))
    }

    /// Ask the service to start a (possibly paused) job
    pub async fn start(&self, job: &AsyncJob) -> Result<()> {
        let url = format!("{}/phase", job.url().trim_end_matches('/'));
        let request = HttpRequest::post(url)
            .form(vec![("PHASE".into(), "RUN".into())])
            .timeout(self.poll.request_timeout)
            .no_redirects();

        // 303 back to the job is the usual answer
        let response = self.http.send(request).await?.error_for_status()?;
        debug!(job = %job.url(), status = response.status, "Job started");
        Ok(())
    }

    /// Fetch the job document once, optionally blocking server-side for `wait`
    pub async fn refresh(&self, job: &mut AsyncJob, wait: Option<Duration>) -> Result<()> {
        let mut request = HttpRequest::get(job.url());
        request = match wait {
            Some(wait) => request
                .query("WAIT", wait.as_secs().max(1))
                .timeout(wait + self.poll.wait_slack),
            None => request.timeout(self.poll.request_timeout),
        };

        let body = self.http.send(request).await?.error_for_status()?.bytes().await?;
        let info = parse_job_document(&body)?;
        job.update(info);
        debug!(job = %job.url(), phase = %job.phase(), "Job polled");
        Ok(())
    }

    /// Poll until the job reaches a terminal phase.
    ///
    /// UWS 1.1 services get blocking `WAIT` polls; older ones are polled with
    /// exponential backoff. Blocking polls that return early are spaced at
    /// least `initial_interval` apart. Both are bounded by the policy's total
    /// timeout.
    pub async fn wait(&self, job: &mut AsyncJob) -> Result<JobPhase> {
        let started = Instant::now();
        let total = self.poll.total_timeout;
        let mut interval = self.poll.initial_interval;

        loop {
            let remaining = total.saturating_sub(started.elapsed());
            let wait = if job.supports_wait() {
                Some(remaining.max(Duration::from_secs(1)))
            } else {
                None
            };

            let polled_at = Instant::now();
            self.refresh(job, wait).await?;

            let phase = job.phase();
            if !phase.is_active() {
                return Err(ProbeError::JobNotActive {
                    url: job.url().to_string(),
                    phase: phase.to_string(),
                });
            }
            if phase.is_terminal() {
                return Ok(phase);
            }

            let elapsed = started.elapsed();
            if elapsed >= total {
                warn!(job = %job.url(), elapsed = elapsed.as_secs_f64(), "Async job timed out");
                return Err(ProbeError::AsyncTimeout {
                    url: job.url().to_string(),
                    timeout_secs: total.as_secs_f64(),
                });
            }

            if job.supports_wait() {
                // Services that ignore WAIT answer at once
                let floor = self.poll.initial_interval.saturating_sub(polled_at.elapsed());
                tokio::time::sleep(floor.min(total - elapsed)).await;
            } else {
                tokio::time::sleep(interval.min(total - elapsed)).await;
                interval = self.poll.next_interval(interval);
            }
        }
    }

    pub fn raise_if_error(&self, job: &AsyncJob) -> Result<()> {
        if job.phase().is_failure() {
            if let Some(message) = job.error_message() {
                warn!(job = %job.url(), phase = %job.phase(), message = %message, "Job failed");
            }
            return Err(ProbeError::QueryExecution {
                phase: job.phase().to_string(),
                url: job.url().to_string(),
            });
        }
        Ok(())
    }

    /// GET the job's result as a stream
    pub async fn fetch_result(&self, job: &AsyncJob) -> Result<HttpResponse> {
        let request = HttpRequest::get(job.result_uri()).timeout(self.poll.total_timeout);
        match self.http.send(request).await.and_then(HttpResponse::error_for_status) {
            Ok(response) => Ok(response),
            Err(e) => {
                self.raise_if_error(job)?;
                Err(e)
            }
        }
    }

    /// Remove the job from the service
    pub async fn delete(&self, job: &AsyncJob) -> Result<()> {
        let request = HttpRequest::delete(job.url()).timeout(self.poll.request_timeout);
        self.http.send(request).await?.error_for_status()?;
        debug!(job = %job.url(), "Job deleted");
        Ok(())
    }

    /// Full async lifecycle: submit, run, wait, error check and fetch.
    ///
    /// Each step is closed into `recorder` as it finishes, failed or not.
    pub async fn run_async(
        &self,
        adql: &str,
        recorder: &mut dyn PhaseRecorder,
    ) -> Result<(HttpResponse, AsyncJob)> {
        let timer = PhaseTimer::start(labels::TAP_SUBMIT);
        let submitted = self.submit(adql).await;
        recorder.close(timer)?;
        let mut job = submitted?;

        let timer = PhaseTimer::start(labels::TAP_RUN);
        let started = self.start(&job).await;
        recorder.close(timer)?;
        started?;

        let timer = PhaseTimer::start(labels::TAP_WAIT);
        let waited = self.wait(&mut job).await;
        recorder.close(timer)?;
        waited?;

        let timer = PhaseTimer::start(labels::TAP_RAISE_IF_ERROR);
        let checked = self.raise_if_error(&job);
        recorder.close(timer)?;
        checked?;

        let timer = PhaseTimer::start(labels::TAP_FETCH_RESPONSE);
        let fetched = self.fetch_result(&job).await;
        recorder.close(timer)?;

        Ok((fetched?, job))
    }
}
