//! UWS job state and job-document parsing

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::cmp::Ordering;
use std::fmt;

use crate::error::{ProbeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPhase {
    Pending,
    Queued,
    Executing,
    Run,
    Completed,
    Error,
    Aborted,
    Unknown,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Pending => "PENDING",
            JobPhase::Queued => "QUEUED",
            JobPhase::Executing => "EXECUTING",
            JobPhase::Run => "RUN",
            JobPhase::Completed => "COMPLETED",
            JobPhase::Error => "ERROR",
            JobPhase::Aborted => "ABORTED",
            JobPhase::Unknown => "UNKNOWN",
        }
    }

    /// Anything unrecognised (HELD, SUSPENDED, ARCHIVED, junk) is `Unknown`
    pub fn from_uws(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => JobPhase::Pending,
            "QUEUED" => JobPhase::Queued,
            "EXECUTING" => JobPhase::Executing,
            "RUN" => JobPhase::Run,
            "COMPLETED" => JobPhase::Completed,
            "ERROR" => JobPhase::Error,
            "ABORTED" => JobPhase::Aborted,
            _ => JobPhase::Unknown,
        }
    }

    /// Phases that may still lead to a result and are worth polling
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobPhase::Queued
                | JobPhase::Executing
                | JobPhase::Run
                | JobPhase::Completed
                | JobPhase::Error
                | JobPhase::Unknown
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Error | JobPhase::Aborted)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobPhase::Error | JobPhase::Aborted)
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields read from a UWS job document
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub version: Option<String>,
    pub job_id: Option<String>,
    pub phase: JobPhase,
    pub result_href: Option<String>,
    pub error_message: Option<String>,
}

/// One asynchronous TAP submission, owned by a single query attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncJob {
    url: String,
    phase: JobPhase,
    version: Option<String>,
    job_id: Option<String>,
    result_href: Option<String>,
    error_message: Option<String>,
}

impl AsyncJob {
    /// A freshly submitted job; the phase is `Pending` until the first poll
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            phase: JobPhase::Pending,
            version: None,
            job_id: None,
            result_href: None,
            error_message: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Result location; UWS' conventional `results/result` when not advertised
    pub fn result_uri(&self) -> String {
        match &self.result_href {
            Some(href) => href.clone(),
            None => format!("{}/results/result", self.url.trim_end_matches('/')),
        }
    }

    /// Blocking WAIT polls need UWS 1.1 or later
    pub fn supports_wait(&self) -> bool {
        self.version
            .as_deref()
            .map_or(false, |v| compare_versions(v, "1.1") != Ordering::Less)
    }

    pub fn update(&mut self, info: JobInfo) {
        self.phase = info.phase;
        // A missing version attribute means UWS 1.0
        self.version = Some(info.version.unwrap_or_else(|| "1.0".to_string()));
        if info.job_id.is_some() {
            self.job_id = info.job_id;
        }
        if info.result_href.is_some() {
            self.result_href = info.result_href;
        }
        self.error_message = info.error_message;
    }
}

/// Parse a UWS job document, matching elements by local name.
pub fn parse_job_document(xml: &[u8]) -> Result<JobInfo> {
    read_job_document(xml).map_err(|e| match e {
        ProbeError::ResultParse(msg) => {
            ProbeError::Protocol(format!("malformed job document: {}", msg))
        }
        other => other,
    })
}

fn read_job_document(xml: &[u8]) -> Result<JobInfo> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut saw_job = false;

    let mut version = None;
    let mut job_id = None;
    let mut phase = None;
    let mut results: Vec<(Option<String>, String)> = Vec::new();
    let mut error_message: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                handle_element(&e, &name, &mut saw_job, &mut version, &mut results)?;
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = e.local_name().as_ref().to_vec();
                handle_element(&e, &name, &mut saw_job, &mut version, &mut results)?;
            }
            Event::Text(t) => {
                let text = t.unescape()?.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                match stack.last().map(Vec::as_slice) {
                    Some(b"phase") => phase = Some(JobPhase::from_uws(&text)),
                    Some(b"jobId") => job_id = Some(text),
                    Some(b"message")
                        if stack.iter().any(|n| n.as_slice() == b"errorSummary") =>
                    {
                        error_message = Some(text)
                    }
                    _ => {}
                }
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_job {
        return Err(ProbeError::Protocol("response is not a UWS job document".into()));
    }

    let result_href = results
        .iter()
        .find(|(id, _)| id.as_deref() == Some("result"))
        .or_else(|| results.first())
        .map(|(_, href)| href.clone());

    Ok(JobInfo {
        version,
        job_id,
        phase: phase.unwrap_or(JobPhase::Unknown),
        result_href,
        error_message,
    })
}

fn handle_element(
    e: &BytesStart<'_>,
    name: &[u8],
    saw_job: &mut bool,
    version: &mut Option<String>,
    results: &mut Vec<(Option<String>, String)>,
) -> Result<()> {
    match name {
        b"job" => {
            *saw_job = true;
            *version = attribute(e, b"version")?;
        }
        b"result" => {
            if let Some(href) = attribute(e, b"href")? {
                results.push((attribute(e, b"id")?, href));
            }
        }
        _ => {}
    }
    Ok(())
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Compare dotted version strings numerically ("1.10" > "1.9")
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.trim()
            .split('.')
            .map(|part| {
                part.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
pub(crate) mod testing {
    /// Minimal UWS job document
    pub fn job_xml(version: Option<&str>, phase: &str, result_href: Option<&str>) -> String {
        let version = version
            .map(|v| format!(" version=\"{}\"", v))
            .unwrap_or_default();
        let results = result_href
            .map(|h| {
                format!(
                    "<uws:results><uws:result id=\"result\" xlink:href=\"{}\"/></uws:results>",
                    h
                )
            })
            .unwrap_or_default();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<uws:job xmlns:uws="http://www.ivoa.net/xml/UWS/v1.0" xmlns:xlink="http://www.w3.org/1999/xlink"{}>
  <uws:jobId>abc123</uws:jobId>
  <uws:phase>{}</uws:phase>
  {}
</uws:job>"#,
            version, phase, results
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::job_xml;
    use super::*;

    #[test]
    fn test_phase_sets() {
        for p in ["QUEUED", "EXECUTING", "RUN", "COMPLETED", "ERROR", "UNKNOWN"] {
            assert!(JobPhase::from_uws(p).is_active(), "{} should be active", p);
        }
        assert!(!JobPhase::Pending.is_active());
        assert!(!JobPhase::Aborted.is_active());
        assert_eq!(JobPhase::from_uws("HELD"), JobPhase::Unknown);
        assert_eq!(JobPhase::from_uws(" executing "), JobPhase::Executing);
        assert!(JobPhase::Aborted.is_terminal());
        assert!(!JobPhase::Run.is_terminal());
    }

    #[test]
    fn test_parse_job_document() {
        let xml = job_xml(Some("1.1"), "COMPLETED", Some("http://h/tap/async/abc123/results/result"));
        let info = parse_job_document(xml.as_bytes()).unwrap();
        assert_eq!(info.version.as_deref(), Some("1.1"));
        assert_eq!(info.job_id.as_deref(), Some("abc123"));
        assert_eq!(info.phase, JobPhase::Completed);
        assert_eq!(
            info.result_href.as_deref(),
            Some("http://h/tap/async/abc123/results/result")
        );
    }

    #[test]
    fn test_parse_error_summary_and_defaults() {
        let xml = r#"<job><phase>ERROR</phase>
            <errorSummary type="fatal"><message>Table not found</message></errorSummary>
            </job>"#;
        let info = parse_job_document(xml.as_bytes()).unwrap();
        assert_eq!(info.phase, JobPhase::Error);
        assert_eq!(info.version, None);
        assert_eq!(info.error_message.as_deref(), Some("Table not found"));

        let mut job = AsyncJob::new("http://h/tap/async/7/");
        job.update(info);
        assert_eq!(job.version(), Some("1.0"));
        assert!(!job.supports_wait());
        assert_eq!(job.result_uri(), "http://h/tap/async/7/results/result");

        assert!(parse_job_document(b"<VOTABLE/>").is_err());
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.1", "1.1"), Ordering::Equal);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.0", "1.1"), Ordering::Less);
        assert_eq!(compare_versions("2", "1.1"), Ordering::Greater);
        assert_eq!(compare_versions("1.1.0", "1.1"), Ordering::Equal);
    }
}
