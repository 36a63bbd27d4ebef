//! Resource binding: one URL + query, fetched through a revalidating cache.
//!
//! # Design
//! All observable state sits in a `tokio::sync::watch` channel. Every
//! mutation goes through `Resource::update`, which recomputes the
//! fingerprint (`{method}:{force counter}:{full url}`) inside the state lock.
//! When the fingerprint changes to a new key a fetch task is spawned after
//! the lock is released; the task applies its result only if its key is
//! still the current fingerprint, so results for superseded keys are
//! dropped.
//!
//! Mutating calls (`op`, `post`, `patch`, `remove`) go straight to the
//! transport and do not coordinate with an in-flight GET on the same binding.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use crate::cache::{RetryPolicy, SwrCache};
use crate::error::{classify, Classifier, HttpError, TransportFailure};
use crate::http::{HttpMethod, HttpRequest};
use crate::query::{action_url, full_url, Query};
use crate::transport::{send, Transport};
use crate::types::PatchOperation;

/// Anything a binding can hold as its data.
pub trait Payload: DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: DeserializeOwned + Clone + Send + Sync + 'static {}

/// Inputs to a `keep_data` decision.
pub struct KeepDataContext<'a, T> {
    pub data: &'a T,
    pub error: Option<&'a HttpError>,
    pub old_url: &'a str,
    pub old_query: &'a Query,
    pub new_url: &'a str,
    pub new_query: &'a Query,
}

/// Decides whether the previous data stay visible (as stale) while a load
/// with a new url/query is in flight.
pub type KeepDataFn<T> = Arc<dyn Fn(&KeepDataContext<'_, T>) -> bool + Send + Sync>;

/// Builds the sibling binding returned by `return_new` mutations.
pub type Factory<T> =
    Arc<dyn Fn(Option<String>, Query, ResourceOptions<T>) -> Resource<T> + Send + Sync>;

type Listener<T> = Arc<dyn Fn(&Resource<T>) + Send + Sync>;

/// Construction options of a [`Resource`].
pub struct ResourceOptions<T> {
    /// `Get` (default) or `Options`.
    pub method: HttpMethod,
    /// Fetch as soon as the binding is created.
    pub load_initial: bool,
    /// Headers sent with every request.
    pub headers: Vec<(String, String)>,
    pub keep_data: Option<KeepDataFn<T>>,
    /// Replaces [`classify`] when set.
    pub classifier: Option<Classifier>,
    pub retry: RetryPolicy,
    /// Cache to fetch through. A private one is created when unset.
    pub cache: Option<SwrCache<T>>,
}

impl<T> Default for ResourceOptions<T> {
    fn default() -> Self {
        Self {
            method: HttpMethod::Get,
            load_initial: false,
            headers: Vec::new(),
            keep_data: None,
            classifier: None,
            retry: RetryPolicy::default(),
            cache: None,
        }
    }
}

impl<T> Clone for ResourceOptions<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            method: self.method,
            load_initial: self.load_initial,
            headers: self.headers.clone(),
            keep_data: self.keep_data.clone(),
            classifier: self.classifier.clone(),
            retry: self.retry,
            cache: self.cache.clone(),
        }
    }
}

/// Snapshot of a binding's observable state.
#[derive(Debug, Clone)]
pub struct ResourceState<T> {
    pub load_enabled: bool,
    pub url: Option<String>,
    pub query: Query,
    /// Previous data are shown while a new fetch is in flight.
    pub stale: bool,
    pub loading: bool,
    /// At least one successful load since the last non-keeping load.
    pub loaded: bool,
    pub data: Option<T>,
    pub error: Option<HttpError>,
    pub finished_at: Option<DateTime<Utc>>,
    pub headers: Vec<(String, String)>,
    pub force_counter: u64,
    /// Cache key of the current request, `None` while loading is disabled
    /// or there is no url.
    pub fingerprint: Option<String>,
    /// Bumped on every data write.
    pub data_version: u64,
    keep_previous: bool,
}

impl<T> ResourceState<T> {
    fn new(url: Option<String>, query: Query, headers: Vec<(String, String)>) -> Self {
        Self {
            load_enabled: false,
            url,
            query,
            stale: false,
            loading: false,
            loaded: false,
            data: None,
            error: None,
            finished_at: None,
            headers,
            force_counter: 1,
            fingerprint: None,
            data_version: 0,
            keep_previous: false,
        }
    }

    /// Base url joined with the canonical query.
    pub fn full_url(&self) -> Option<String> {
        self.url.as_deref().map(|url| full_url(url, &self.query))
    }

    fn compute_fingerprint(&self, method: HttpMethod) -> Option<String> {
        if !self.load_enabled {
            return None;
        }
        let url = self.full_url()?;
        Some(format!("{method}:{}:{url}", self.force_counter))
    }

    fn fingerprint_for(&self, method: HttpMethod, query: &Query) -> Option<String> {
        let url = self.url.as_deref()?;
        Some(format!("{method}:{}:{}", self.force_counter, full_url(url, query)))
    }
}

/// Arguments of [`Resource::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// New base url. Without one the load is always forced.
    pub url: Option<String>,
    /// Replaces the current query; empty when unset.
    pub query: Option<Query>,
    pub force: bool,
    /// Explicit stale-while-revalidate choice; falls back to `keep_data`.
    pub keep_previous: Option<bool>,
}

impl LoadOptions {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn keep_previous(mut self, keep: bool) -> Self {
        self.keep_previous = Some(keep);
        self
    }
}

/// Failure of an awaited load.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Http(#[from] HttpError),
    /// Another awaited load, or a change of url/query, replaced this one.
    #[error("load superseded by a newer request")]
    Superseded,
    #[error("no url to load")]
    NoUrl,
    #[error("binding dropped before the load settled")]
    Dropped,
}

/// Future returned by [`Resource::load_promise`].
pub struct PendingLoad<T> {
    rx: oneshot::Receiver<Result<T, LoadError>>,
}

impl<T> Future for PendingLoad<T> {
    type Output = Result<T, LoadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(LoadError::Dropped)))
    }
}

struct Pending<T> {
    key: String,
    tx: oneshot::Sender<Result<T, LoadError>>,
}

/// Arguments shared by `op`, `post` and `patch`.
pub struct MutationOptions<T> {
    pub data: Value,
    /// Path segment appended to the binding's url.
    pub action: Option<String>,
    /// Extra headers; they override the binding's headers.
    pub headers: Vec<(String, String)>,
    /// Store the result into this binding.
    pub replace_content: bool,
    /// Store the result into a new sibling binding and return it.
    pub return_new: bool,
    pub factory: Option<Factory<T>>,
}

impl<T> MutationOptions<T> {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            action: None,
            headers: Vec::new(),
            replace_content: false,
            return_new: false,
            factory: None,
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn replace_content(mut self) -> Self {
        self.replace_content = true;
        self
    }

    pub fn return_new(mut self) -> Self {
        self.return_new = true;
        self
    }

    pub fn factory(mut self, factory: Factory<T>) -> Self {
        self.factory = Some(factory);
        self
    }
}

/// Result of a mutation.
pub struct OpOutcome<T> {
    /// The binding the result was stored into: this one, or the sibling
    /// created for `return_new`.
    pub binding: Resource<T>,
    /// Decoded response (or the sent data when the response was empty).
    pub result: Result<Option<T>, HttpError>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    pub action: Option<String>,
    pub headers: Vec<(String, String)>,
}

struct FetchTarget {
    key: String,
    request: HttpRequest,
}

struct Inner<T> {
    transport: Arc<dyn Transport>,
    options: ResourceOptions<T>,
    cache: SwrCache<T>,
    state: watch::Sender<ResourceState<T>>,
    pending: Mutex<Option<Pending<T>>>,
    listeners: Mutex<Vec<Listener<T>>>,
}

/// Handle to a resource binding. Clones share the same state.
pub struct Resource<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Resource")
            .field("url", &state.url)
            .field("fingerprint", &state.fingerprint)
            .field("loading", &state.loading)
            .finish()
    }
}

impl<T: Payload> Resource<T> {
    /// Create a binding. With `load_initial` the first fetch is scheduled
    /// immediately, which requires a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        url: Option<&str>,
        query: Query,
        options: ResourceOptions<T>,
    ) -> Self {
        let cache = options.cache.clone().unwrap_or_default();
        let state = ResourceState::new(url.map(str::to_string), query, options.headers.clone());
        let (state, _) = watch::channel(state);
        let load_initial = options.load_initial;
        let resource = Self {
            inner: Arc::new(Inner {
                transport,
                options,
                cache,
                state,
                pending: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
            }),
        };
        if load_initial {
            resource.set_load_enabled(true);
        }
        resource
    }

    // ---------------------------------------------------------------------
    // Observation
    // ---------------------------------------------------------------------

    pub fn state(&self) -> ResourceState<T> {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceState<T>> {
        self.inner.state.subscribe()
    }

    /// Register a callback run after every state change, in the context
    /// that made the change. Callbacks may call back into the binding.
    pub fn watch<F>(&self, callback: F)
    where
        F: Fn(&Resource<T>) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().push(Arc::new(callback));
    }

    /// Wait until no fetch for the current fingerprint is outstanding.
    pub async fn settled(&self) -> ResourceState<T> {
        let mut rx = self.inner.state.subscribe();
        let result = rx.wait_for(|s| !s.loading).await.map(|s| s.clone());
        result.unwrap_or_else(|_| self.state())
    }

    pub fn data(&self) -> Option<T> {
        self.inner.state.borrow().data.clone()
    }

    /// Read the current data without cloning it. `f` runs under the state
    /// lock and must not call back into the binding.
    pub fn map_data<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.state.borrow().data.as_ref().map(f)
    }

    pub fn error(&self) -> Option<HttpError> {
        self.inner.state.borrow().error.clone()
    }

    pub fn loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    pub fn loaded(&self) -> bool {
        self.inner.state.borrow().loaded
    }

    pub fn stale(&self) -> bool {
        self.inner.state.borrow().stale
    }

    pub fn url(&self) -> Option<String> {
        self.inner.state.borrow().url.clone()
    }

    pub fn query(&self) -> Query {
        self.inner.state.borrow().query.clone()
    }

    pub fn full_url(&self) -> Option<String> {
        self.inner.state.borrow().full_url()
    }

    pub fn load_enabled(&self) -> bool {
        self.inner.state.borrow().load_enabled
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.borrow().finished_at
    }

    pub fn fingerprint(&self) -> Option<String> {
        self.inner.state.borrow().fingerprint.clone()
    }

    pub fn data_version(&self) -> u64 {
        self.inner.state.borrow().data_version
    }

    pub fn cache(&self) -> &SwrCache<T> {
        &self.inner.cache
    }

    pub fn options(&self) -> &ResourceOptions<T> {
        &self.inner.options
    }

    // ---------------------------------------------------------------------
    // Setters
    // ---------------------------------------------------------------------

    pub fn set_url(&self, url: Option<String>) {
        self.update(|s| s.url = url);
    }

    pub fn set_query(&self, query: Query) {
        self.update(|s| s.query = query);
    }

    /// Edit the query in place. Nothing happens when `f` leaves it equal.
    pub fn update_query<F>(&self, f: F)
    where
        F: FnOnce(&mut Query),
    {
        let mut query = self.query();
        f(&mut query);
        if query != self.query() {
            self.set_query(query);
        }
    }

    pub fn set_load_enabled(&self, enabled: bool) {
        self.update(|s| s.load_enabled = enabled);
    }

    pub fn set_headers(&self, headers: Vec<(String, String)>) {
        self.update(|s| s.headers = headers);
    }

    // ---------------------------------------------------------------------
    // Loading
    // ---------------------------------------------------------------------

    pub fn load(&self, opts: LoadOptions) {
        self.start_load(opts, None);
    }

    /// Like [`load`](Self::load), but returns a future settling with the
    /// outcome of the fetch for the fingerprint this call produces.
    ///
    /// Only one awaited load is tracked per binding; starting another one,
    /// or changing the fingerprint before it settles, resolves the earlier
    /// future with [`LoadError::Superseded`].
    pub fn load_promise(&self, opts: LoadOptions) -> PendingLoad<T> {
        let (tx, rx) = oneshot::channel();
        self.start_load(opts, Some(tx));
        PendingLoad { rx }
    }

    /// Force a fresh fetch of the current url and query.
    pub fn reload(&self, keep_previous: Option<bool>) {
        self.load(self.reload_options(keep_previous));
    }

    pub fn reload_promise(&self, keep_previous: Option<bool>) -> PendingLoad<T> {
        self.load_promise(self.reload_options(keep_previous))
    }

    fn reload_options(&self, keep_previous: Option<bool>) -> LoadOptions {
        LoadOptions {
            url: None,
            query: Some(self.query()),
            force: true,
            keep_previous,
        }
    }

    fn start_load(&self, opts: LoadOptions, promise: Option<oneshot::Sender<Result<T, LoadError>>>) {
        let keep = self.resolve_keep_previous(&opts);
        let LoadOptions {
            url, query, force, ..
        } = opts;
        let bump = force || url.is_none();

        self.update_then(
            |s| {
                s.keep_previous = keep;
                if !keep {
                    s.loaded = false;
                }
                s.query = query.unwrap_or_default();
                if let Some(url) = url {
                    s.url = Some(url);
                }
                if bump {
                    s.force_counter += 1;
                }
                s.load_enabled = true;
            },
            |s| {
                let Some(tx) = promise else { return };
                let Some(key) = s.fingerprint.clone() else {
                    let _ = tx.send(Err(LoadError::NoUrl));
                    return;
                };
                if !s.loading {
                    let settled = match (&s.error, &s.data) {
                        (Some(err), _) => Err(LoadError::Http(err.clone())),
                        (None, Some(data)) => Ok(data.clone()),
                        (None, None) => Err(LoadError::Dropped),
                    };
                    let _ = tx.send(settled);
                    return;
                }
                let previous = self.inner.pending.lock().replace(Pending { key, tx });
                if let Some(previous) = previous {
                    let _ = previous.tx.send(Err(LoadError::Superseded));
                }
            },
        );
    }

    fn resolve_keep_previous(&self, opts: &LoadOptions) -> bool {
        if let Some(keep) = opts.keep_previous {
            return keep;
        }
        let Some(keep_data) = &self.inner.options.keep_data else {
            return false;
        };
        let state = self.inner.state.borrow();
        match (&state.data, &state.url) {
            (Some(data), Some(old_url)) => keep_data(&KeepDataContext {
                data,
                error: state.error.as_ref(),
                old_url,
                old_query: &state.query,
                new_url: opts.url.as_deref().unwrap_or(old_url),
                new_query: opts.query.as_ref().unwrap_or(&state.query),
            }),
            _ => false,
        }
    }

    /// Seed the cache with `data` for the current url under `query` (the
    /// current query when `None`), then switch to that query. No request is
    /// made for the seeded key.
    pub async fn prefetch(&self, data: T, query: Option<Query>) {
        let method = self.inner.options.method;
        let (query, key) = {
            let state = self.inner.state.borrow();
            let query = query.unwrap_or_else(|| state.query.clone());
            let key = state.fingerprint_for(method, &query);
            (query, key)
        };
        if let Some(key) = key {
            self.inner.cache.mutate(&key, data).await;
        }
        self.set_query(query);
    }

    /// Write a result into this binding without a GET round-trip.
    pub async fn store(&self, data: Option<T>, error: Option<HttpError>) {
        if let Some(data) = data {
            self.prefetch(data.clone(), None).await;
            self.update(|s| {
                s.finished_at = Some(Utc::now());
                s.data = Some(data);
                s.data_version += 1;
                s.loaded = true;
                s.error = None;
            });
        }
        if let Some(error) = error {
            self.update(|s| {
                s.finished_at = Some(Utc::now());
                s.error = Some(error);
                s.loaded = false;
            });
        }
    }

    // ---------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------

    /// Send `opts.data` with `method` to the binding's url (plus action).
    pub async fn op(&self, method: HttpMethod, opts: MutationOptions<T>) -> OpOutcome<T> {
        let (url, query, headers) = {
            let s = self.inner.state.borrow();
            (s.url.clone(), s.query.clone(), s.headers.clone())
        };

        let sibling = if opts.return_new && !opts.replace_content {
            let mut options = self.inner.options.clone();
            options.load_initial = false;
            options.cache = Some(self.inner.cache.clone());
            Some(match &opts.factory {
                Some(factory) => factory(url.clone(), query.clone(), options),
                None => Resource::new(
                    Arc::clone(&self.inner.transport),
                    url.as_deref(),
                    query.clone(),
                    options,
                ),
            })
        } else {
            None
        };
        let target = if opts.replace_content {
            Some(self.clone())
        } else {
            sibling
        };

        let result = self
            .send_mutation(method, url, &query, headers, &opts)
            .await;

        let (result, location) = match result {
            Ok((payload, location)) => (Ok(payload), location),
            Err(err) => (Err(err), None),
        };

        if let Some(target) = &target {
            match &result {
                Ok(payload) => {
                    if let Some(payload) = payload {
                        target.store(Some(payload.clone()), None).await;
                    }
                    if let Some(location) = &location {
                        let location = location.clone();
                        target.update(|s| {
                            s.load_enabled = false;
                            s.url = Some(location);
                        });
                    }
                }
                Err(err) => target.store(None, Some(err.clone())).await,
            }
        }

        OpOutcome {
            binding: target.unwrap_or_else(|| self.clone()),
            result,
            location,
        }
    }

    async fn send_mutation(
        &self,
        method: HttpMethod,
        url: Option<String>,
        query: &Query,
        headers: Vec<(String, String)>,
        opts: &MutationOptions<T>,
    ) -> Result<(Option<T>, Option<String>), HttpError> {
        let path = action_url(url.as_deref(), opts.action.as_deref(), query)
            .ok_or_else(|| self.classify(&TransportFailure::aborted("no url to send the request to")))?;
        let mut request = HttpRequest::new(method, path);
        request.headers = headers;
        for (name, value) in &opts.headers {
            request.set_header(name, value);
        }
        if !opts.data.is_null() {
            request.body = Some(opts.data.to_string());
        }

        tracing::debug!(%method, path = %request.path, "sending mutation");
        let response = send(self.inner.transport.as_ref(), request)
            .await
            .map_err(|failure| self.classify(&failure))?;
        let location = response.location().map(str::to_string);

        let payload = if response.body.trim().is_empty() {
            serde_json::from_value::<T>(opts.data.clone()).ok()
        } else {
            Some(
                serde_json::from_str::<T>(&response.body)
                    .map_err(|e| self.classify(&invalid_body(e)))?,
            )
        };
        Ok((payload, location))
    }

    /// POST `opts.data` as JSON.
    pub async fn post(&self, mut opts: MutationOptions<T>) -> OpOutcome<T> {
        prepend_content_type(&mut opts.headers, "application/json");
        self.op(HttpMethod::Post, opts).await
    }

    /// PATCH with a JSON-Patch document built from `operations`.
    pub async fn patch(
        &self,
        operations: Vec<PatchOperation>,
        mut opts: MutationOptions<T>,
    ) -> OpOutcome<T> {
        opts.data = serde_json::to_value(&operations).unwrap_or_default();
        prepend_content_type(&mut opts.headers, "application/json-patch+json");
        self.op(HttpMethod::Patch, opts).await
    }

    /// DELETE the current full url (plus action). Unlike the other
    /// mutations, failures are returned rather than stored.
    pub async fn remove(&self, opts: RemoveOptions) -> Result<Value, HttpError> {
        let (url, query, headers) = {
            let s = self.inner.state.borrow();
            (s.url.clone(), s.query.clone(), s.headers.clone())
        };
        let path = action_url(url.as_deref(), opts.action.as_deref(), &query)
            .ok_or_else(|| self.classify(&TransportFailure::aborted("no url to delete")))?;
        let mut request = HttpRequest::new(HttpMethod::Delete, path);
        request.headers = headers;
        for (name, value) in &opts.headers {
            request.set_header(name, value);
        }
        let response = send(self.inner.transport.as_ref(), request)
            .await
            .map_err(|failure| self.classify(&failure))?;
        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&response.body).or_else(|_| Ok(Value::String(response.body)))
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn classify(&self, failure: &TransportFailure) -> HttpError {
        classify_with(self.inner.options.classifier.as_ref(), failure)
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ResourceState<T>),
    {
        self.update_then(f, |_| {});
    }

    /// Apply `f`, recompute the fingerprint, then run `after` while the
    /// state is still locked. A changed fingerprint schedules a fetch once
    /// the lock is released.
    fn update_then<F, G>(&self, f: F, after: G)
    where
        F: FnOnce(&mut ResourceState<T>),
        G: FnOnce(&ResourceState<T>),
    {
        let method = self.inner.options.method;
        let mut trigger = None;
        self.inner.state.send_modify(|s| {
            f(s);
            let next = s.compute_fingerprint(method);
            if next != s.fingerprint {
                s.fingerprint = next.clone();
                self.supersede_pending(next.as_deref());
                match next {
                    Some(key) => {
                        s.loading = true;
                        s.stale = s.keep_previous && s.data.is_some();
                        trigger = Some(fetch_target(key, s, method));
                    }
                    None => {
                        s.loading = false;
                        s.stale = false;
                    }
                }
            }
            after(s);
        });
        self.notify();
        if let Some(target) = trigger {
            self.spawn_fetch(target);
        }
    }

    fn supersede_pending(&self, key: Option<&str>) {
        let mut pending = self.inner.pending.lock();
        if pending.as_ref().is_some_and(|p| Some(p.key.as_str()) != key) {
            if let Some(previous) = pending.take() {
                let _ = previous.tx.send(Err(LoadError::Superseded));
            }
        }
    }

    fn notify(&self) {
        let listeners: Vec<Listener<T>> = self.inner.listeners.lock().clone();
        for listener in listeners {
            listener(self);
        }
    }

    fn spawn_fetch(&self, target: FetchTarget) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %target.key, "no tokio runtime, fetch not scheduled");
            let err = self.classify(&TransportFailure::aborted("no tokio runtime to run the fetch"));
            self.settle(&target.key, Err(err));
            return;
        };
        let resource = self.clone();
        handle.spawn(async move { resource.run_fetch(target).await });
    }

    async fn run_fetch(self, target: FetchTarget) {
        let retry = self.inner.options.retry;
        let mut attempt = 0;
        loop {
            tracing::debug!(key = %target.key, attempt, "fetching");
            let loader = load_payload::<T>(
                Arc::clone(&self.inner.transport),
                self.inner.options.classifier.clone(),
                target.request.clone(),
            );
            let result = self.inner.cache.fetch(&target.key, loader).await;
            let failed = result.is_err();
            if !self.settle(&target.key, result) {
                return;
            }
            if !failed || attempt >= retry.count {
                return;
            }
            attempt += 1;
            tokio::time::sleep(retry.interval).await;
            let still_current = self.inner.state.send_if_modified(|s| {
                if s.fingerprint.as_deref() != Some(target.key.as_str()) {
                    return false;
                }
                s.loading = true;
                true
            });
            if !still_current {
                return;
            }
        }
    }

    /// Apply a fetch result if `key` is still current. Returns whether it
    /// was applied.
    fn settle(&self, key: &str, result: Result<T, HttpError>) -> bool {
        let applied = self.inner.state.send_if_modified(|s| {
            if s.fingerprint.as_deref() != Some(key) {
                return false;
            }
            s.loading = false;
            s.stale = false;
            s.finished_at = Some(Utc::now());
            match &result {
                Ok(data) => {
                    s.data = Some(data.clone());
                    s.data_version += 1;
                    s.loaded = true;
                    s.error = None;
                }
                Err(err) => s.error = Some(err.clone()),
            }
            true
        });
        if !applied {
            tracing::debug!(key, "discarding result for superseded fingerprint");
            return false;
        }
        if let Err(err) = &result {
            tracing::warn!(key, kind = err.kind().as_str(), "fetch failed: {err}");
        }
        self.notify();

        let pending = {
            let mut slot = self.inner.pending.lock();
            match slot.as_ref() {
                Some(p) if p.key == key => slot.take(),
                _ => None,
            }
        };
        if let Some(pending) = pending {
            let _ = pending.tx.send(result.map_err(LoadError::Http));
        }
        true
    }
}

fn fetch_target<T>(key: String, state: &ResourceState<T>, method: HttpMethod) -> FetchTarget {
    let mut request = HttpRequest::new(method, state.full_url().unwrap_or_default());
    request.headers = state.headers.clone();
    FetchTarget { key, request }
}

async fn load_payload<T: Payload>(
    transport: Arc<dyn Transport>,
    classifier: Option<Classifier>,
    request: HttpRequest,
) -> Result<T, HttpError> {
    let response = send(transport.as_ref(), request)
        .await
        .map_err(|failure| classify_with(classifier.as_ref(), &failure))?;
    let body = if response.body.trim().is_empty() {
        "null"
    } else {
        response.body.as_str()
    };
    serde_json::from_str(body).map_err(|e| classify_with(classifier.as_ref(), &invalid_body(e)))
}

fn classify_with(classifier: Option<&Classifier>, failure: &TransportFailure) -> HttpError {
    match classifier {
        Some(classifier) => classifier(failure),
        None => classify(failure),
    }
}

fn invalid_body(err: serde_json::Error) -> TransportFailure {
    TransportFailure::aborted(format!("invalid response body: {err}"))
}

/// Put `content_type` first so caller-supplied headers still win.
fn prepend_content_type(headers: &mut Vec<(String, String)>, content_type: &str) {
    if !headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
    {
        headers.insert(0, ("Content-Type".to_string(), content_type.to_string()));
    }
}
