//! `http_writer`: statistics rows posted as JSON to a collection endpoint

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::{check_kwargs, Kwargs, ResultWriter, RunInfo};
use crate::error::{ProbeError, Result};
use crate::http::{default_user_agent, HttpBackend, HttpRequest, ReqwestBackend};
use crate::stats::StatisticsRecord;

pub const NAME: &str = "http_writer";
pub const DESCRIPTION: &str = "Posts results as JSON to a remote collection service.";

pub struct HttpWriter {
    http: Arc<dyn HttpBackend>,
    url: String,
    admin_url: Option<String>,
    location: String,
    run: Option<RunInfo>,
}

impl HttpWriter {
    pub fn new(http: Arc<dyn HttpBackend>, url: impl Into<String>, admin_url: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            admin_url,
            location: host_name(),
            run: None,
        }
    }

    pub fn from_kwargs(kwargs: &Kwargs) -> Result<Box<dyn ResultWriter>> {
        check_kwargs(NAME, kwargs, &["url", "admin_url"])?;
        let url = kwargs
            .get("url")
            .cloned()
            .ok_or_else(|| ProbeError::Config("http_writer requires a url argument".into()))?;
        let http = Arc::new(ReqwestBackend::new(&default_user_agent())?);
        Ok(Box::new(Self::new(http, url, kwargs.get("admin_url").cloned())))
    }

    async fn post(&self, url: &str, body: Value) -> Result<()> {
        let response = self.http.send(HttpRequest::post(url).json(body)).await?;
        let response = response.error_for_status()?;
        debug!(url = %url, status = response.status, "Posted");
        Ok(())
    }

    async fn post_admin(&self, state: &str) -> Result<()> {
        let (Some(admin_url), Some(run)) = (&self.admin_url, &self.run) else {
            return Ok(());
        };
        let endtime = if state == "end" {
            chrono::Local::now().to_rfc3339()
        } else {
            String::new()
        };
        let message = json!({
            "state": state,
            "run_id": run.run_id,
            "hostname": self.location,
            "pid": std::process::id(),
            "starttime": run.started.to_rfc3339(),
            "endtime": endtime,
        });
        self.post(admin_url, message).await
    }
}

#[async_trait]
impl ResultWriter for HttpWriter {
    fn name(&self) -> &str {
        NAME
    }

    async fn begin(&mut self, run: &RunInfo) -> Result<()> {
        self.run = Some(run.clone());
        info!(url = %self.url, run_id = %run.run_id, "Posting statistics");
        self.post_admin("begin").await
    }

    async fn one_result(&mut self, stats: &StatisticsRecord) -> Result<()> {
        let mut row = stats.row_values();
        row.insert("location".into(), Value::String(self.location.clone()));
        if let Some(run) = &self.run {
            row.insert("run_id".into(), Value::String(run.run_id.to_string()));
        }
        self.post(&self.url, Value::Object(row)).await
    }

    async fn end(&mut self) -> Result<()> {
        self.post_admin("end").await
    }
}

fn host_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().trim().to_string())
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
