//! `csv_writer`: statistics rows appended to a CSV file or stdout

use async_trait::async_trait;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use super::{check_kwargs, ordered_values, Kwargs, ResultWriter, RunInfo};
use crate::error::{ProbeError, Result};
use crate::stats::StatisticsRecord;

pub const NAME: &str = "csv_writer";
pub const DESCRIPTION: &str = "Writes results to a csv file.";

type Sink = csv::Writer<Box<dyn Write + Send>>;

pub struct CsvWriter {
    outfile: Option<String>,
    path: Option<PathBuf>,
    sink: Option<Sink>,
    needs_header: bool,
}

impl CsvWriter {
    /// `outfile`: a path, or `stdout`. Defaults to a timestamped file in the
    /// result directory named after the service list.
    pub fn new(outfile: Option<String>) -> Self {
        Self {
            outfile,
            path: None,
            sink: None,
            needs_header: true,
        }
    }

    pub fn from_kwargs(kwargs: &Kwargs) -> Result<Box<dyn ResultWriter>> {
        check_kwargs(NAME, kwargs, &["outfile"])?;
        Ok(Box::new(Self::new(kwargs.get("outfile").cloned())))
    }

    /// Output file, `None` for stdout; known after `begin`
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    fn output_path(&self, run: &RunInfo) -> Option<PathBuf> {
        match self.outfile.as_deref() {
            Some("stdout") => None,
            Some(path) => Some(PathBuf::from(path)),
            None => {
                let stamp = run.started.format("%Y-%m-%d %H:%M:%S%.6f");
                let file = format!("{}_{}.csv", run.services_stem(), stamp);
                Some(run.result_dir.join(file))
            }
        }
    }
}

#[async_trait]
impl ResultWriter for CsvWriter {
    fn name(&self) -> &str {
        NAME
    }

    async fn begin(&mut self, run: &RunInfo) -> Result<()> {
        let path = self.output_path(run);

        let out: Box<dyn Write + Send> = match &path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                // Appending to an existing statistics file keeps its header
                self.needs_header = file.metadata()?.len() == 0;
                info!(path = %path.display(), "Writing statistics");
                Box::new(file)
            }
            None => {
                self.needs_header = true;
                Box::new(std::io::stdout())
            }
        };

        self.sink = Some(csv::WriterBuilder::new().has_headers(false).from_writer(out));
        self.path = path;
        Ok(())
    }

    async fn one_result(&mut self, stats: &StatisticsRecord) -> Result<()> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| ProbeError::Config("csv_writer used before begin".into()))?;

        let values = ordered_values(stats);
        if self.needs_header {
            sink.write_record(values.iter().map(|(col, _)| col.as_str()))?;
            self.needs_header = false;
        }
        sink.write_record(values.iter().map(|(_, v)| cell(v)))?;
        sink.flush()?;
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.flush()?;
        }
        Ok(())
    }
}

/// Null is an empty cell; maps are written as JSON
fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writers::testing::sample_record;

    #[tokio::test]
    async fn test_header_once_and_rows_appended() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stats").join("run.csv");
        let run = RunInfo::new("services.json", dir.path(), false);

        let mut writer = CsvWriter::new(Some(out.to_string_lossy().into_owned()));
        writer.begin(&run).await.unwrap();
        writer.one_result(&sample_record("a", None)).await.unwrap();
        writer.one_result(&sample_record("b", Some("SELECT 1"))).await.unwrap();
        writer.end().await.unwrap();

        // A second run appends without repeating the header
        let mut writer = CsvWriter::new(Some(out.to_string_lossy().into_owned()));
        writer.begin(&run).await.unwrap();
        writer.one_result(&sample_record("c", None)).await.unwrap();
        writer.end().await.unwrap();

        let mut reader = csv::Reader::from_path(&out).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "name");
        assert_eq!(headers.len(), sample_record("x", None).columns().len());

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        let idx = |name: &str| headers.iter().position(|h| h == name).unwrap();
        assert_eq!(&rows[0][idx("name")], "a");
        assert_eq!(&rows[1][idx("ADQL")], "SELECT 1");
        assert_eq!(&rows[0][idx("num_columns")], "");
        assert_eq!(&rows[0][idx("status")], "200");
        assert_eq!(&rows[0][idx("extra_dur0_name")], "tap_submit");
        assert_eq!(&rows[0][idx("other_params")], "{}");
    }

    #[tokio::test]
    async fn test_default_path_uses_services_stem() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunInfo::new("input/cone_services.json", dir.path(), false);

        let mut writer = CsvWriter::new(None);
        writer.begin(&run).await.unwrap();
        writer.one_result(&sample_record("a", None)).await.unwrap();
        writer.end().await.unwrap();

        let path = writer.path().unwrap();
        assert_eq!(path.parent().unwrap(), dir.path());
        let file_name = path.file_name().unwrap().to_string_lossy();
        assert!(file_name.starts_with("cone_services_"));
        assert!(file_name.ends_with(".csv"));
        assert!(path.exists());
    }

    #[test]
    fn test_rejects_unknown_kwargs() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("bogus".into(), "1".into());
        assert!(CsvWriter::from_kwargs(&kwargs).is_err());
    }
}
