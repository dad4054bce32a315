// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP transport contract and the reqwest-backed implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, error};

use crate::errors::TransportError;

const BEACON_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

/// A completed HTTP exchange. Header names are lowercase.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        HttpResponse {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;

    async fn post(&self, url: &str, body: String) -> Result<HttpResponse, TransportError>;
}

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Builds a client with `timeout` applied to every request and an optional https proxy.
    pub fn new(timeout: Duration, proxy_https: Option<&str>) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Some(Duration::from_secs(270)))
            .tcp_keepalive(Some(Duration::from_secs(120)));
        if let Some(proxy) = proxy_https {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }
        Ok(ReqwestClient {
            client: builder.build()?,
        })
    }

    /// Like [`ReqwestClient::new`], but an invalid proxy falls back to a direct connection.
    #[must_use]
    pub fn new_or_direct(timeout: Duration, proxy_https: Option<&str>) -> Self {
        match ReqwestClient::new(timeout, proxy_https) {
            Ok(client) => client,
            Err(e) => {
                error!("Unable to parse proxy configuration: {e}, falling back to direct connection");
                match ReqwestClient::new(timeout, None) {
                    Ok(client) => client,
                    Err(inner) => {
                        error!("Failed to build HTTP client: {inner}, using reqwest defaults");
                        ReqwestClient {
                            client: reqwest::Client::new(),
                        }
                    }
                }
            }
        }
    }

    async fn read(response: reqwest::Response) -> Result<HttpResponse, TransportError> {
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let body = response.text().await?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        debug!("GET {url}");
        let response = self.client.get(url).send().await?;
        ReqwestClient::read(response).await
    }

    async fn post(&self, url: &str, body: String) -> Result<HttpResponse, TransportError> {
        debug!("POST {url} ({} bytes)", body.len());
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, BEACON_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        ReqwestClient::read(response).await
    }
}
