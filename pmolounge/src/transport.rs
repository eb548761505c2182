//! HTTP execution of prepared requests
//!
//! Non-2xx replies are returned as ordinary [`HttpReply`] values: the lounge
//! service reports session health through status codes, so only socket-level
//! failures surface as errors.

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::time::Duration;
use tracing::trace;
use url::Url;

/// HTTP method of a prepared request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
        }
    }
}

/// One HTTP call as described by a channel's pre-request hook
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub method: HttpMethod,
    pub url: Url,
    /// Form-encoded body fields, in order
    pub form: Option<Vec<(String, String)>>,
}

impl RequestDescriptor {
    pub fn get(url: Url) -> Self {
        Self {
            method: HttpMethod::Get,
            url,
            form: None,
        }
    }

    pub fn post(url: Url, form: Vec<(String, String)>) -> Self {
        Self {
            method: HttpMethod::Post,
            url,
            form: Some(form),
        }
    }

    #[cfg(test)]
    pub(crate) fn form_value(&self, key: &str) -> Option<&str> {
        self.form
            .as_ref()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value of a query parameter, if present
    pub fn query_value(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}

/// A completed HTTP exchange, whatever its status
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpReply {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Shared executor wrapping the session's `reqwest::Client`
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
    timeout: Duration,
}

impl HttpExecutor {
    /// `timeout` bounds each request, including reading the body
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub async fn execute(&self, request: &RequestDescriptor) -> Result<HttpReply, reqwest::Error> {
        trace!(method = %request.method, url = %request.url, "Sending request");

        let builder = match request.method {
            HttpMethod::Get => self.client.get(request.url.clone()),
            HttpMethod::Post => {
                let builder = self.client.post(request.url.clone());
                match &request.form {
                    Some(form) => builder.form(form),
                    None => builder,
                }
            }
        };

        let response = builder.timeout(self.timeout).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        trace!(%status, bytes = body.len(), "Received reply");
        Ok(HttpReply { status, body })
    }
}
