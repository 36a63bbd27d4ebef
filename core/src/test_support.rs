//! Scripted in-memory transport for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::TransportFailure;
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::transport::Transport;

/// Canned answer for a scripted route.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Json(u16, Value),
    Text(u16, String),
    Located(u16, Value, String),
    /// Neither request nor response reach the caller.
    Abort,
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub(crate) fn ok(body: Value) -> Self {
        Reply::Json(200, body)
    }

    pub(crate) fn after(self, millis: u64) -> Self {
        Reply::Delayed(Duration::from_millis(millis), Box::new(self))
    }
}

struct Route {
    method: HttpMethod,
    path: Option<String>,
    replies: VecDeque<Reply>,
    sticky: bool,
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer the next matching request once. `None` matches any path.
    pub(crate) fn once(&self, method: HttpMethod, path: Option<&str>, reply: Reply) {
        self.push(method, path, reply, false);
    }

    /// Answer every matching request.
    pub(crate) fn always(&self, method: HttpMethod, path: Option<&str>, reply: Reply) {
        self.push(method, path, reply, true);
    }

    fn push(&self, method: HttpMethod, path: Option<&str>, reply: Reply, sticky: bool) {
        self.routes.lock().push(Route {
            method,
            path: path.map(str::to_string),
            replies: VecDeque::from([reply]),
            sticky,
        });
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn count(&self, method: HttpMethod, path: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    fn next_reply(&self, request: &HttpRequest) -> Option<Reply> {
        let mut routes = self.routes.lock();
        let idx = routes.iter().position(|r| {
            r.method == request.method
                && !r.replies.is_empty()
                && r.path.as_deref().map_or(true, |p| p == request.path)
        })?;
        let route = &mut routes[idx];
        if route.sticky {
            route.replies.front().cloned()
        } else {
            let reply = route.replies.pop_front();
            if route.replies.is_empty() {
                routes.remove(idx);
            }
            reply
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportFailure> {
        self.requests.lock().push(request.clone());
        let mut reply = self.next_reply(&request).unwrap_or(Reply::Text(404, "no route".into()));
        while let Reply::Delayed(delay, inner) = reply {
            tokio::time::sleep(delay).await;
            reply = *inner;
        }
        match reply {
            Reply::Abort => Err(TransportFailure::aborted("Request aborted")),
            Reply::Json(status, body) => Ok(HttpResponse {
                status,
                headers: vec![("content-type".into(), "application/json".into())],
                body: body.to_string(),
            }),
            Reply::Text(status, body) => Ok(HttpResponse {
                status,
                headers: Vec::new(),
                body,
            }),
            Reply::Located(status, body, location) => Ok(HttpResponse {
                status,
                headers: vec![("Location".into(), location)],
                body: body.to_string(),
            }),
            Reply::Delayed(..) => unreachable!("delays are unwrapped above"),
        }
    }
}
