//! Error types and the default failure classifier.
//!
//! # Design
//! A `TransportFailure` is whatever went wrong below the bindings: it may
//! carry the request that was sent and the response that came back. The
//! classifier folds it into exactly one `HttpError` variant, which is what
//! the bindings store in their state and hand to callers.

use std::sync::Arc;

use serde_json::Value;

use crate::http::{HttpRequest, HttpResponse};

/// Raw failure reported by a transport or by the binding itself.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportFailure {
    pub message: String,
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
}

impl TransportFailure {
    /// A failure with neither request nor response, e.g. an aborted call.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            request: None,
            response: None,
        }
    }

    /// The request went out but nothing came back.
    pub fn no_response(message: impl Into<String>, request: HttpRequest) -> Self {
        Self {
            message: message.into(),
            request: Some(request),
            response: None,
        }
    }

    /// The server answered with a non-success status.
    pub fn status(request: HttpRequest, response: HttpResponse) -> Self {
        Self {
            message: format!("request failed with status code {}", response.status),
            request: Some(request),
            response: Some(response),
        }
    }
}

/// Classified HTTP failure stored in binding state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HttpError {
    /// The request was sent but no response arrived.
    #[error("no response for {}: {raw}", request.path)]
    ResponseMissing { raw: String, request: HttpRequest },

    /// 401, 403 or 405.
    #[error("not authorized (HTTP {status})")]
    Unauthorized {
        raw: String,
        request: Option<HttpRequest>,
        status: u16,
        reason: Value,
        response: HttpResponse,
    },

    /// Any other 4xx.
    #[error("client error (HTTP {status})")]
    ClientError {
        raw: String,
        request: Option<HttpRequest>,
        status: u16,
        reason: Value,
        response: HttpResponse,
    },

    #[error("server error (HTTP {status})")]
    ServerError {
        raw: String,
        request: Option<HttpRequest>,
        status: u16,
        reason: Value,
        response: HttpResponse,
    },

    #[error("unknown failure: {raw}")]
    Unknown { raw: String },
}

/// Discriminant of `HttpError`, handy for assertions and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ResponseMissing,
    Unauthorized,
    ClientError,
    ServerError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ResponseMissing => "responseMissing",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::ClientError => "clientError",
            ErrorKind::ServerError => "serverError",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl HttpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HttpError::ResponseMissing { .. } => ErrorKind::ResponseMissing,
            HttpError::Unauthorized { .. } => ErrorKind::Unauthorized,
            HttpError::ClientError { .. } => ErrorKind::ClientError,
            HttpError::ServerError { .. } => ErrorKind::ServerError,
            HttpError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Unauthorized { status, .. }
            | HttpError::ClientError { status, .. }
            | HttpError::ServerError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Payload of the error response as sent by the server.
    pub fn reason(&self) -> Option<&Value> {
        match self {
            HttpError::Unauthorized { reason, .. }
            | HttpError::ClientError { reason, .. }
            | HttpError::ServerError { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            HttpError::ResponseMissing { raw, .. }
            | HttpError::Unauthorized { raw, .. }
            | HttpError::ClientError { raw, .. }
            | HttpError::ServerError { raw, .. }
            | HttpError::Unknown { raw } => raw,
        }
    }
}

/// Caller-supplied replacement for [`classify`].
pub type Classifier = Arc<dyn Fn(&TransportFailure) -> HttpError + Send + Sync>;

/// Default mapping from a raw failure to an `HttpError`.
pub fn classify(failure: &TransportFailure) -> HttpError {
    let raw = failure.message.clone();
    if let Some(response) = &failure.response {
        let status = response.status;
        let reason = parse_reason(&response.body);
        let request = failure.request.clone();
        let response = response.clone();
        return match status {
            401 | 403 | 405 => HttpError::Unauthorized {
                raw,
                request,
                status,
                reason,
                response,
            },
            400..=499 => HttpError::ClientError {
                raw,
                request,
                status,
                reason,
                response,
            },
            _ => HttpError::ServerError {
                raw,
                request,
                status,
                reason,
                response,
            },
        };
    }
    match &failure.request {
        Some(request) => HttpError::ResponseMissing {
            raw,
            request: request.clone(),
        },
        None => HttpError::Unknown { raw },
    }
}

fn parse_reason(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;

    fn failure_with_status(status: u16, body: &str) -> TransportFailure {
        TransportFailure::status(
            HttpRequest::new(HttpMethod::Get, "/api/records"),
            HttpResponse {
                status,
                headers: Vec::new(),
                body: body.to_string(),
            },
        )
    }

    #[test]
    fn not_found_is_client_error() {
        let err = classify(&failure_with_status(404, "Page not found"));
        assert_eq!(err.kind(), ErrorKind::ClientError);
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.reason(), Some(&Value::String("Page not found".to_string())));
    }

    #[test]
    fn forbidden_and_friends_are_unauthorized() {
        for status in [401, 403, 405] {
            let err = classify(&failure_with_status(status, "Forbidden"));
            assert_eq!(err.kind(), ErrorKind::Unauthorized, "status {status}");
            assert_eq!(err.status(), Some(status));
        }
    }

    #[test]
    fn five_hundreds_are_server_errors() {
        let err = classify(&failure_with_status(503, r#"{"message":"down"}"#));
        assert_eq!(err.kind(), ErrorKind::ServerError);
        assert_eq!(err.reason().unwrap()["message"], "down");
    }

    #[test]
    fn missing_response_keeps_request() {
        let req = HttpRequest::new(HttpMethod::Get, "http://localhost:1/x");
        let err = classify(&TransportFailure::no_response("connection refused", req.clone()));
        match err {
            HttpError::ResponseMissing { request, raw } => {
                assert_eq!(request, req);
                assert_eq!(raw, "connection refused");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn abort_is_unknown() {
        let err = classify(&TransportFailure::aborted("Request aborted"));
        assert_eq!(err, HttpError::Unknown { raw: "Request aborted".to_string() });
        assert_eq!(err.kind().as_str(), "unknown");
    }
}
