//! HTTP backend (`http://` / `https://` descriptors).
//!
//! The byte contract is mapped onto REST: `write(path)` issues `GET base_url/path` and
//! buffers the response body, which subsequent `read`/`readline` calls drain. Full
//! verb access goes through [`Backend::request`].

use super::{drain_buffer, drain_line, Backend, BackendState, HttpBody, HttpMethod, HttpRequest};
use crate::error::{AppResult, LabError};
use reqwest::blocking::Client;
use std::time::Duration;
use tracing::{debug, info};

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// REST transport
pub struct HttpBackend {
    base_url: String,
    state: BackendState,
    client: Option<Client>,
    buffer: Vec<u8>,
}

impl HttpBackend {
    /// `base_url` must not end with `/`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            state: BackendState::Unopened,
            client: None,
            buffer: Vec::new(),
        }
    }

    /// `base_url/path` with exactly one separating slash.
    pub fn url_for(&self, path: &str) -> String {
        let path = path.trim().trim_start_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn client(&self) -> AppResult<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| LabError::ChannelClosed(self.base_url.clone()))
    }

    fn execute(&mut self, req: &HttpRequest) -> AppResult<Vec<u8>> {
        self.open()?;
        let url = self.url_for(&req.path);
        let client = self.client()?;
        let builder = match req.method {
            HttpMethod::Get => client.get(&url),
            HttpMethod::Put => client.put(&url),
            HttpMethod::Post => client.post(&url),
            HttpMethod::Delete => client.delete(&url),
        };
        let builder = match &req.body {
            Some(HttpBody::Json(value)) => builder.json(value),
            Some(HttpBody::Bytes(bytes)) => builder.body(bytes.clone()),
            None => builder,
        };
        let response = builder.send()?.error_for_status()?;
        let body = response.bytes()?.to_vec();
        debug!(method = req.method.as_str(), %url, bytes = body.len(), "HTTP request");
        Ok(body)
    }
}

impl Backend for HttpBackend {
    fn descriptor(&self) -> &str {
        &self.base_url
    }

    fn open(&mut self) -> AppResult<()> {
        if self.state.needs_open(&self.base_url)? {
            let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
            self.client = Some(client);
            self.state = BackendState::Open;
            info!(base_url = %self.base_url, "HTTP client ready");
        }
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        self.client = None;
        self.buffer.clear();
        self.state = BackendState::Closed;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state == BackendState::Open
    }

    fn write(&mut self, data: &[u8]) -> AppResult<usize> {
        let path = String::from_utf8_lossy(data).into_owned();
        self.buffer = self.execute(&HttpRequest::new(HttpMethod::Get, path))?;
        Ok(data.len())
    }

    fn read(&mut self, size: Option<usize>) -> AppResult<Vec<u8>> {
        self.open()?;
        Ok(drain_buffer(&mut self.buffer, size))
    }

    fn readline(&mut self) -> AppResult<Vec<u8>> {
        self.open()?;
        Ok(drain_line(&mut self.buffer))
    }

    fn request(&mut self, req: &HttpRequest) -> AppResult<Vec<u8>> {
        self.execute(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        let backend = HttpBackend::new("http://10.7.0.4:8345/");
        assert_eq!(backend.descriptor(), "http://10.7.0.4:8345");
        assert_eq!(backend.url_for("full-state"), "http://10.7.0.4:8345/full-state");
        assert_eq!(
            backend.url_for("/dac4D/vsource/"),
            "http://10.7.0.4:8345/dac4D/vsource/"
        );
        assert_eq!(backend.url_for(""), "http://10.7.0.4:8345");
    }

    #[test]
    fn test_closed_backend_rejects_requests() {
        let mut backend = HttpBackend::new("http://127.0.0.1:9");
        backend.close().unwrap();
        assert!(matches!(
            backend.request(&HttpRequest::new(HttpMethod::Get, "x")),
            Err(LabError::ChannelClosed(_))
        ));
    }
}
