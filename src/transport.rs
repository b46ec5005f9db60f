use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::collections::HashMap;
use tracing::trace;

use crate::error::{Error, Result, TransportError};
use crate::request::{ExecutionResult, Operation};

/// Issues a single HTTP call. Retries, pacing and status policy live above this.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        operation: &Operation,
    ) -> std::result::Result<ExecutionResult, TransportError>;
}

/// Transport backed by a `reqwest` client with bearer-token authorization.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ReqwestTransport {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self, operation: &Operation) -> std::result::Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();

        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| TransportError::new(format!("invalid API key header: {}", e)))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (name, value) in operation.headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::new(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::new(format!("invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        Ok(headers)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        operation: &Operation,
    ) -> std::result::Result<ExecutionResult, TransportError> {
        let url = format!("{}{}", self.base_url, operation.path());
        trace!(method = %operation.method(), url = %url, "sending request");

        let mut request = self
            .client
            .request(operation.method().clone(), &url)
            .headers(self.headers(operation)?);

        if !operation.query().is_empty() {
            request = request.query(operation.query());
        }
        if !operation.body().is_empty() {
            request = request.body(operation.body().to_vec());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();

        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_ascii_lowercase())
                    .or_default()
                    .push(value.to_string());
            }
        }

        let body = response.bytes().await?.to_vec();

        Ok(ExecutionResult {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let transport = ReqwestTransport::new("https://api.sendgrid.com/", "key").unwrap();
        assert_eq!(transport.base_url(), "https://api.sendgrid.com");
    }

    #[test]
    fn test_operation_headers_are_merged() {
        let transport = ReqwestTransport::new("https://api.sendgrid.com", "SG.secret").unwrap();
        let operation = Operation::get("/v3/api_keys/abc").with_header("on-behalf-of", "alice");

        let headers = transport.headers(&operation).unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer SG.secret");
        assert_eq!(headers["on-behalf-of"], "alice");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        let transport = ReqwestTransport::new("https://api.sendgrid.com", "key").unwrap();
        let operation = Operation::get("/").with_header("bad header", "x");
        assert!(transport.headers(&operation).is_err());
    }
}
