//! HTTP transport used by the executor, the TAP client and the name resolver

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::error::{ProbeError, Result};

/// Chunk size used when buffering a streamed body to storage
pub const STREAM_CHUNK_SIZE: usize = 8096;

/// Default User-Agent sent with every request
pub fn default_user_agent() -> String {
    format!(
        "voprobe/{} (IVOA-monitor) rust",
        env!("CARGO_PKG_VERSION")
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
            Method::Delete => f.write_str("DELETE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

/// One outbound request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub timeout: Option<Duration>,
    pub follow_redirects: bool,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            body: None,
            timeout: None,
            follow_redirects: true,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn form(mut self, params: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(params));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(value));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    /// Value of a query or form parameter, for inspection in logs and tests
    pub fn param(&self, key: &str) -> Option<&str> {
        let form = match &self.body {
            Some(RequestBody::Form(params)) => params.as_slice(),
            _ => &[],
        };
        self.query
            .iter()
            .chain(form.iter())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// A response whose body has not been read yet
pub struct HttpResponse {
    pub status: u16,
    pub url: String,
    pub location: Option<String>,
    pub body: BodyStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("url", &self.url)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Build a response from an in-memory body
    pub fn from_bytes(status: u16, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            url: url.into(),
            location: None,
            body: stream::once(async move { Ok(body) }).boxed(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// Turn 4xx/5xx statuses into `HttpStatus` errors
    pub fn error_for_status(self) -> Result<Self> {
        if self.status >= 400 {
            return Err(ProbeError::HttpStatus {
                status: self.status,
                url: self.url,
            });
        }
        Ok(self)
    }

    /// Read the whole body into memory
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Transport capability reached by URL
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Production transport on top of reqwest
#[derive(Clone)]
pub struct ReqwestBackend {
    client: reqwest::Client,
    no_redirect: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()?;
        let no_redirect = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(Policy::none())
            .build()?;
        Ok(Self {
            client,
            no_redirect,
        })
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let client = if request.follow_redirects {
            &self.client
        } else {
            &self.no_redirect
        };

        debug!(method = %request.method, url = %request.url, "Sending request");

        let mut builder = match request.method {
            Method::Get => client.get(&request.url),
            Method::Post => client.post(&request.url),
            Method::Delete => client.delete(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match &request.body {
            Some(RequestBody::Form(params)) => builder.form(params),
            Some(RequestBody::Json(value)) => builder.json(value),
            None => builder,
        };
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        debug!(status = status, url = %url, "Response received");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ProbeError::from))
            .boxed();

        Ok(HttpResponse {
            status,
            url,
            location,
            body,
        })
    }
}

/// Resolve `location` against the URL of the request that produced it
pub fn resolve_location(base: &str, location: &str) -> Result<String> {
    let base = url::Url::parse(base)
        .map_err(|e| ProbeError::Protocol(format!("invalid URL {}: {}", base, e)))?;
    let joined = base
        .join(location)
        .map_err(|e| ProbeError::Protocol(format!("invalid Location {}: {}", location, e)))?;
    Ok(joined.to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    type Handler = dyn Fn(&HttpRequest, usize) -> Result<HttpResponse> + Send + Sync;

    /// Scripted backend: every request is recorded and answered by the handler,
    /// which also receives the zero-based index of the request.
    pub struct StubBackend {
        handler: Box<Handler>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl StubBackend {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&HttpRequest, usize) -> Result<HttpResponse> + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl HttpBackend for StubBackend {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            let index = {
                let mut requests = self.requests.lock();
                requests.push(request.clone());
                requests.len() - 1
            };
            (self.handler)(&request, index)
        }
    }

    pub const SMALL_VOTABLE: &str = r#"<?xml version="1.0"?>
<VOTABLE version="1.4" xmlns="http://www.ivoa.net/xml/VOTable/v1.3">
  <RESOURCE type="results">
    <TABLE>
      <FIELD name="ra" datatype="double"/>
      <FIELD name="dec" datatype="double"/>
      <FIELD name="mag" datatype="float"/>
      <DATA>
        <TABLEDATA>
          <TR><TD>10.1</TD><TD>41.2</TD><TD>12.5</TD></TR>
          <TR><TD>10.2</TD><TD>41.3</TD><TD>13.0</TD></TR>
        </TABLEDATA>
      </DATA>
    </TABLE>
  </RESOURCE>
</VOTABLE>"#;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_params() {
        let req = HttpRequest::post("http://x/tap/async")
            .query("WAIT", 30)
            .form(vec![("QUERY".into(), "SELECT 1".into())]);
        assert_eq!(req.param("WAIT"), Some("30"));
        assert_eq!(req.param("QUERY"), Some("SELECT 1"));
        assert_eq!(req.param("LANG"), None);
    }

    #[tokio::test]
    async fn test_response_helpers() {
        let resp = HttpResponse::from_bytes(200, "http://x", "hello");
        assert!(resp.is_success());
        assert_eq!(resp.text().await.unwrap(), "hello");

        let resp = HttpResponse::from_bytes(503, "http://x", "busy");
        match resp.error_for_status() {
            Err(ProbeError::HttpStatus { status, .. }) => assert_eq!(status, 503),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_resolve_location() {
        assert_eq!(
            resolve_location("http://h/tap/async", "/tap/async/42").unwrap(),
            "http://h/tap/async/42"
        );
        assert_eq!(
            resolve_location("http://h/tap/async", "http://other/job/1").unwrap(),
            "http://other/job/1"
        );
    }
}
