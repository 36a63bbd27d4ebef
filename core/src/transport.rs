//! The seam between the bindings and the network.
//!
//! # Design
//! Bindings never perform I/O themselves; they hand an `HttpRequest` to a
//! `Transport` and get back either the `HttpResponse` the server sent (any
//! status) or a `TransportFailure` when nothing usable came back. Status
//! interpretation stays in the bindings so every transport classifies the
//! same way.

use async_trait::async_trait;

use crate::error::TransportFailure;
use crate::http::{HttpRequest, HttpResponse};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportFailure>;
}

/// Run `request` and turn a non-2xx answer into a failure carrying both
/// request and response.
pub(crate) async fn send(
    transport: &dyn Transport,
    request: HttpRequest,
) -> Result<HttpResponse, TransportFailure> {
    let response = transport.execute(request.clone()).await?;
    if response.is_success() {
        Ok(response)
    } else {
        Err(TransportFailure::status(request, response))
    }
}

#[cfg(feature = "ureq")]
pub use self::blocking::UreqTransport;

#[cfg(feature = "ureq")]
mod blocking {
    use super::*;
    use crate::http::HttpMethod;

    /// `Transport` backed by a blocking `ureq` agent, run on tokio's blocking
    /// pool.
    ///
    /// Status codes are never turned into errors by `ureq`; 4xx/5xx responses
    /// come back as data so the bindings can classify them.
    #[derive(Clone)]
    pub struct UreqTransport {
        agent: ureq::Agent,
    }

    impl UreqTransport {
        pub fn new() -> Self {
            let agent = ureq::Agent::config_builder()
                .http_status_as_error(false)
                .build()
                .new_agent();
            Self { agent }
        }
    }

    impl Default for UreqTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Transport for UreqTransport {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportFailure> {
            let agent = self.agent.clone();
            let sent = request.clone();
            tokio::task::spawn_blocking(move || execute_blocking(&agent, request))
                .await
                .map_err(|e| TransportFailure::no_response(e.to_string(), sent))?
        }
    }

    fn execute_blocking(
        agent: &ureq::Agent,
        request: HttpRequest,
    ) -> Result<HttpResponse, TransportFailure> {
        let url = request.path.as_str();
        let result = match request.method {
            HttpMethod::Get => with_headers(agent.get(url), &request.headers).call(),
            HttpMethod::Options => with_headers(agent.options(url), &request.headers).call(),
            HttpMethod::Delete => with_headers(agent.delete(url), &request.headers).call(),
            HttpMethod::Post => send_body(with_headers(agent.post(url), &request.headers), &request.body),
            HttpMethod::Put => send_body(with_headers(agent.put(url), &request.headers), &request.body),
            HttpMethod::Patch => send_body(with_headers(agent.patch(url), &request.headers), &request.body),
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => return Err(TransportFailure::no_response(e.to_string(), request)),
        };

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| TransportFailure::no_response(e.to_string(), request.clone()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn with_headers<B>(
        mut builder: ureq::RequestBuilder<B>,
        headers: &[(String, String)],
    ) -> ureq::RequestBuilder<B> {
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    fn send_body(
        builder: ureq::RequestBuilder<ureq::typestate::WithBody>,
        body: &Option<String>,
    ) -> Result<ureq::http::Response<ureq::Body>, ureq::Error> {
        match body {
            Some(body) => builder.send(body.as_bytes()),
            None => builder.send_empty(),
        }
    }
}
