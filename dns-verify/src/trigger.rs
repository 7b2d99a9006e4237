// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asking a DNS provider to publish pending records
//!
//! Providers that keep DNS data in their own database only make new records
//! visible to resolvers after an export/reload.  [`Trigger::trigger`] issues
//! that request once.  It does not retry: if the provider rejects or never
//! sees the request, the caller decides what to do about it.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{StatusCode, Url};
use slog::{debug, info, warn};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Bytes of a rejected response's body kept for diagnostics
const MAX_BODY_SNIPPET: usize = 512;

#[derive(Debug, Error)]
pub enum TriggerError {
    /// The request never got a response: connection refused, DNS failure for
    /// the provider host, TLS error, or a timeout.
    #[error("DNS provider at {url} is unreachable")]
    Unreachable {
        url: String,
        #[source]
        err: reqwest::Error,
    },

    #[error(
        "DNS provider at {url} rejected export request with \
         {status_code}: {body:?}"
    )]
    RejectedByProvider {
        url: String,
        status_code: StatusCode,
        body: String,
    },
}

impl TriggerError {
    /// Status code returned by the provider, if it answered at all
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            TriggerError::Unreachable { .. } => None,
            TriggerError::RejectedByProvider { status_code, .. } => {
                Some(*status_code)
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidRequest {
    #[error("endpoint {0} must be an absolute http or https URL")]
    Endpoint(String),
    #[error("export path {0:?} does not form a valid URL with the endpoint")]
    ExportPath(String),
    #[error("invalid header name {0:?}")]
    HeaderName(String),
    #[error("invalid value for header {0:?}")]
    HeaderValue(String),
}

/// The request that makes the provider export and reload its zone data
///
/// Immutable once built; headers are validated up front so that firing the
/// request can only fail for transport or provider reasons.
#[derive(Clone, Debug)]
pub struct ReconciliationRequest {
    target: Url,
    payload: String,
    headers: HeaderMap,
}

impl ReconciliationRequest {
    /// The request is sent to `endpoint` with `export_path` appended.
    pub fn new(
        endpoint: Url,
        export_path: &str,
        payload: String,
        headers: &BTreeMap<String, String>,
    ) -> Result<ReconciliationRequest, InvalidRequest> {
        if !matches!(endpoint.scheme(), "http" | "https")
            || endpoint.cannot_be_a_base()
        {
            return Err(InvalidRequest::Endpoint(endpoint.to_string()));
        }

        let base = endpoint.as_str().trim_end_matches('/');
        let path = export_path.trim_start_matches('/');
        let target = Url::parse(&format!("{}/{}", base, path))
            .map_err(|_| InvalidRequest::ExportPath(export_path.to_string()))?;

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| InvalidRequest::HeaderName(name.clone()))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| InvalidRequest::HeaderValue(name.clone()))?;
            header_map.insert(header_name, header_value);
        }

        Ok(ReconciliationRequest { target, payload, headers: header_map })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Fires reconciliation requests at a DNS provider
#[derive(Clone)]
pub struct Trigger {
    log: slog::Logger,
    client: reqwest::Client,
}

impl Trigger {
    /// Construct a trigger whose requests give up after `timeout`.
    pub fn new(
        log: slog::Logger,
        timeout: Duration,
    ) -> Result<Trigger, reqwest::Error> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(timeout.min(Duration::from_secs(15)))
            .timeout(timeout)
            .build()?;
        Ok(Trigger { log, client })
    }

    pub fn new_with_client(
        log: slog::Logger,
        client: reqwest::Client,
    ) -> Trigger {
        Trigger { log, client }
    }

    /// POST the configured payload and headers to the provider's export
    /// endpoint.  Any 2xx response is success; the body is not interpreted.
    pub async fn trigger(
        &self,
        request: &ReconciliationRequest,
    ) -> Result<(), TriggerError> {
        let url = request.target().to_string();
        debug!(self.log, "requesting DNS export"; "url" => &url);

        let response = self
            .client
            .post(request.target().clone())
            .headers(request.headers().clone())
            .body(request.payload().to_owned())
            .send()
            .await
            .map_err(|err| {
                warn!(self.log, "DNS export request failed";
                    "url" => &url,
                    "error" => %err,
                );
                TriggerError::Unreachable { url: url.clone(), err }
            })?;

        let status = response.status();
        if status.is_success() {
            info!(self.log, "DNS provider accepted export request";
                "url" => &url,
                "status" => status.as_u16(),
            );
            return Ok(());
        }

        // The body is diagnostic only; failing to read it does not change
        // the outcome.
        let body = response.text().await.unwrap_or_default();
        let body = truncate(&body, MAX_BODY_SNIPPET).to_string();
        warn!(self.log, "DNS provider rejected export request";
            "url" => &url,
            "status" => status.as_u16(),
            "body" => &body,
        );
        Err(TriggerError::RejectedByProvider { url, status_code: status, body })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn target_joins_endpoint_and_path() {
        let cases = [
            (
                "http://dnsapi.example.com",
                "/export",
                "http://dnsapi.example.com/export",
            ),
            (
                "http://dnsapi.example.com/",
                "export",
                "http://dnsapi.example.com/export",
            ),
            (
                "https://dnsapi.example.com:8443/v1/",
                "/bind/export",
                "https://dnsapi.example.com:8443/v1/bind/export",
            ),
        ];
        for (endpoint, path, expected) in cases {
            let request = ReconciliationRequest::new(
                Url::parse(endpoint).unwrap(),
                path,
                String::new(),
                &BTreeMap::new(),
            )
            .unwrap();
            assert_eq!(request.target().as_str(), expected);
        }
    }

    #[test]
    fn bad_requests_are_rejected_up_front() {
        let endpoint = Url::parse("http://dnsapi.example.com").unwrap();
        assert_matches!(
            ReconciliationRequest::new(
                Url::parse("ftp://dnsapi.example.com").unwrap(),
                "/export",
                String::new(),
                &BTreeMap::new(),
            ),
            Err(InvalidRequest::Endpoint(_))
        );
        assert_matches!(
            ReconciliationRequest::new(
                endpoint.clone(),
                "/export",
                String::new(),
                &headers(&[("bad header", "x")]),
            ),
            Err(InvalidRequest::HeaderName(_))
        );
        assert_matches!(
            ReconciliationRequest::new(
                endpoint,
                "/export",
                String::new(),
                &headers(&[("X-Token", "line\nbreak")]),
            ),
            Err(InvalidRequest::HeaderValue(_))
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 512), "short");
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("héllo", 3), "hé");
    }
}
