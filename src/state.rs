//! Shared handles for the executor and the runner

use std::sync::Arc;

use crate::config::QueryOptions;
use crate::coords::{CoordinateResolver, NameResolver, SesameResolver};
use crate::error::Result;
use crate::http::{HttpBackend, ReqwestBackend};
use crate::metrics::RunMetrics;
use crate::stats::StatsLayout;

/// State shared by every query of a run
#[derive(Clone)]
pub struct ProbeState {
    /// Transport for services, TAP jobs and name resolution
    pub http: Arc<dyn HttpBackend>,
    pub resolver: Arc<CoordinateResolver>,
    pub options: Arc<QueryOptions>,
    /// Column layout every record of the run is built with
    pub layout: Arc<StatsLayout>,
    pub metrics: Arc<RunMetrics>,
}

impl ProbeState {
    pub fn new(http: Arc<dyn HttpBackend>, names: Arc<dyn NameResolver>, options: QueryOptions) -> Self {
        let layout = Arc::new(options.layout());
        Self {
            http,
            resolver: Arc::new(CoordinateResolver::new(names)),
            options: Arc::new(options),
            layout,
            metrics: Arc::new(RunMetrics::new()),
        }
    }

    /// reqwest transport and the Sesame name resolver
    pub fn connect(options: QueryOptions) -> Result<Self> {
        let http: Arc<dyn HttpBackend> = Arc::new(ReqwestBackend::new(&options.user_agent)?);
        let names = Arc::new(SesameResolver::new(http.clone()));
        Ok(Self::new(http, names, options))
    }
}
