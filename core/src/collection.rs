//! Paginated, faceted listing built from three resource bindings.
//!
//! # Design
//! - `http` fetches the current page (`page`, `size` and `facets` in the
//!   query), `http_facets` fetches aggregations only (`size=0`) and
//!   `http_options` asks the endpoint for its facet definitions with an
//!   OPTIONS call through a long-lived cache.
//! - `page` and `page_size` are plain fields mirrored into the listing query.
//!   Writes go field → query through [`Collection::set_page`] and
//!   [`Collection::set_page_size`]; a listener on the listing binding copies
//!   query → field. Both directions skip writes that would not change
//!   anything, so the pair settles after one round.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use url::Url;

use crate::cache::{SwrCache, OPTIONS_TTL};
use crate::http::{replace_header, HttpMethod};
use crate::query::{int_param, query, Query, QueryValue};
use crate::resource::{LoadOptions, Payload, PendingLoad, Resource, ResourceOptions};
use crate::transport::Transport;
use crate::types::{
    CollectionHttpOptions, CollectionPage, CollectionRecord, FacetDefinition, FacetDefinitions,
    Facets,
};

pub const DEFAULT_PAGE_SIZE: i64 = 10;

pub type RecordTransformer<M> =
    Arc<dyn Fn(CollectionRecord<M>) -> CollectionRecord<M> + Send + Sync>;
pub type FacetsTransformer = Arc<dyn Fn(Facets) -> Facets + Send + Sync>;
pub type FacetDefinitionTransformer = Arc<dyn Fn(FacetDefinitions) -> FacetDefinitions + Send + Sync>;

/// Construction options of a [`Collection`].
pub struct CollectionOptions<M> {
    /// Options of the listing binding. `headers`, `classifier`, `retry` and
    /// `load_initial` also apply to the options binding; `Accept:
    /// application/json` is always added.
    pub resource: ResourceOptions<CollectionPage<M>>,
    pub record_transformer: Option<RecordTransformer<M>>,
    pub facets_transformer: Option<FacetsTransformer>,
    pub facet_definition_transformer: Option<FacetDefinitionTransformer>,
    /// Cache for OPTIONS responses; share one between collections to fetch
    /// the facet definitions of an endpoint once. Defaults to a fresh cache
    /// with a one day lifetime.
    pub options_cache: Option<SwrCache<CollectionHttpOptions>>,
}

impl<M> Default for CollectionOptions<M> {
    fn default() -> Self {
        Self {
            resource: ResourceOptions::default(),
            record_transformer: None,
            facets_transformer: None,
            facet_definition_transformer: None,
            options_cache: None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PageField {
    Page,
    Size,
}

impl PageField {
    fn key(self) -> &'static str {
        match self {
            PageField::Page => "page",
            PageField::Size => "size",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pagination {
    page: i64,
    page_size: i64,
}

struct CollectionInner<M> {
    http: Resource<CollectionPage<M>>,
    http_facets: Resource<CollectionPage<M>>,
    http_options: Resource<CollectionHttpOptions>,
    pagination: Mutex<Pagination>,
    record_transformer: Option<RecordTransformer<M>>,
    facets_transformer: Option<FacetsTransformer>,
    facet_definition_transformer: Option<FacetDefinitionTransformer>,
}

/// Handle to a paginated collection. Clones share the same bindings.
pub struct Collection<M> {
    inner: Arc<CollectionInner<M>>,
}

impl<M> Clone for Collection<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Payload> Collection<M> {
    /// Create the collection for `url`. `page` and `size` are read from
    /// `initial_query` (defaults 1 and 10); everything in it is sent with
    /// every listing request.
    pub fn new(
        transport: Arc<dyn Transport>,
        url: &str,
        initial_query: Query,
        options: CollectionOptions<M>,
    ) -> Self {
        let CollectionOptions {
            resource,
            record_transformer,
            facets_transformer,
            facet_definition_transformer,
            options_cache,
        } = options;

        let page_size = int_param(&initial_query, "size")
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let page = int_param(&initial_query, "page")
            .filter(|n| *n > 0)
            .unwrap_or(1);

        let mut headers = resource.headers.clone();
        replace_header(&mut headers, "Accept", "application/json");

        let mut listing_query = query([
            ("page", page.to_string().into()),
            ("size", page_size.to_string().into()),
        ]);
        listing_query.extend(initial_query.clone());

        let mut facets_query = initial_query.clone();
        facets_query.insert("size".into(), "0".into());

        let mut options_query = initial_query;
        options_query.insert("facets".into(), QueryValue::Null);

        let options_binding = ResourceOptions {
            method: HttpMethod::Options,
            load_initial: resource.load_initial,
            headers: headers.clone(),
            keep_data: None,
            classifier: resource.classifier.clone(),
            retry: resource.retry,
            cache: Some(options_cache.unwrap_or_else(|| SwrCache::with_ttl(OPTIONS_TTL))),
        };
        let facets_binding = ResourceOptions {
            method: HttpMethod::Get,
            load_initial: false,
            headers: headers.clone(),
            ..resource.clone()
        };
        let listing_binding = ResourceOptions {
            method: HttpMethod::Get,
            headers,
            ..resource
        };

        let inner = Arc::new(CollectionInner {
            http: Resource::new(transport.clone(), Some(url), listing_query, listing_binding),
            http_facets: Resource::new(transport.clone(), Some(url), facets_query, facets_binding),
            http_options: Resource::new(transport, Some(url), options_query, options_binding),
            pagination: Mutex::new(Pagination { page, page_size }),
            record_transformer,
            facets_transformer,
            facet_definition_transformer,
        });

        let weak: Weak<CollectionInner<M>> = Arc::downgrade(&inner);
        inner.http.watch(move |http| {
            if let Some(inner) = weak.upgrade() {
                Collection { inner }.sync_from_query(&http.query());
            }
        });

        Self { inner }
    }

    /// The listing binding.
    pub fn http(&self) -> &Resource<CollectionPage<M>> {
        &self.inner.http
    }

    /// The facets-only binding (`size=0`).
    pub fn http_facets(&self) -> &Resource<CollectionPage<M>> {
        &self.inner.http_facets
    }

    /// The OPTIONS binding holding facet definitions and filters.
    pub fn http_options(&self) -> &Resource<CollectionHttpOptions> {
        &self.inner.http_options
    }

    /// Load the listing with facets. `opts.query` is merged over the current
    /// query. Options are fetched first if they never loaded.
    pub fn load(&self, opts: LoadOptions) {
        let opts = self.listing_load(opts);
        self.inner.http.load(opts);
    }

    pub fn load_promise(&self, opts: LoadOptions) -> PendingLoad<CollectionPage<M>> {
        let opts = self.listing_load(opts);
        self.inner.http.load_promise(opts)
    }

    fn listing_load(&self, opts: LoadOptions) -> LoadOptions {
        if !self.inner.http_options.loaded() {
            self.inner.http_options.reload(None);
        }
        let mut merged = self.inner.http.query();
        merged.extend(opts.query.clone().unwrap_or_default());
        merged.insert("facets".into(), QueryValue::Bool(true));
        LoadOptions {
            query: Some(merged),
            ..opts
        }
    }

    /// Fetch aggregations for the given facet codes only.
    pub fn load_facets(&self, selected_facets: Vec<String>) {
        let mut q = self.inner.http_facets.query();
        q.insert("facets".into(), selected_facets.into());
        self.inner
            .http_facets
            .load(LoadOptions::default().with_query(q));
    }

    /// Point every binding at `url`, refetch options and reload the listing
    /// with its current query.
    pub fn set_url(&self, url: impl Into<String>) {
        let url = url.into();
        tracing::debug!(%url, "repointing collection");

        self.inner.http_facets.set_load_enabled(false);
        self.inner.http_facets.set_url(Some(url.clone()));

        self.inner.http_options.load(LoadOptions {
            url: Some(url.clone()),
            query: Some(self.inner.http_options.query()),
            force: true,
            keep_previous: Some(false),
        });
        self.inner.http.load(LoadOptions {
            url: Some(url),
            query: Some(self.inner.http.query()),
            force: true,
            keep_previous: Some(false),
        });
    }

    // ---------------------------------------------------------------------
    // Pagination
    // ---------------------------------------------------------------------

    pub fn page(&self) -> i64 {
        self.inner.pagination.lock().page
    }

    pub fn page_size(&self) -> i64 {
        self.inner.pagination.lock().page_size
    }

    /// Go to `page`, clamped to `1..=pages` once the page count is known.
    pub fn set_page(&self, page: i64) {
        self.sync_field(PageField::Page, page);
    }

    /// Change the page size; non-positive sizes fall back to 10.
    pub fn set_page_size(&self, page_size: i64) {
        self.sync_field(PageField::Size, page_size);
    }

    /// Number of pages for the current total and page size, 0 before the
    /// first page arrives.
    pub fn pages(&self) -> i64 {
        let Some(total) = self.total() else {
            return 0;
        };
        let size = self.page_size().max(1) as u64;
        total.div_ceil(size) as i64
    }

    fn total(&self) -> Option<u64> {
        self.inner.http.map_data(|page| page.hits.total.value())
    }

    /// Field → query.
    fn sync_field(&self, field: PageField, value: i64) {
        let pages = self.pages();
        let value = {
            let mut pagination = self.inner.pagination.lock();
            match field {
                PageField::Page => {
                    let mut page = value.max(1);
                    if pages > 0 && page > pages {
                        page = pages;
                    }
                    pagination.page = page;
                    page
                }
                PageField::Size => {
                    let size = if value <= 0 { DEFAULT_PAGE_SIZE } else { value };
                    pagination.page_size = size;
                    size
                }
            }
        };
        self.inner.http.update_query(|q| {
            q.insert(field.key().to_string(), value.to_string().into());
        });
    }

    /// Query → field.
    fn sync_from_query(&self, query: &Query) {
        for field in [PageField::Size, PageField::Page] {
            let Some(value) = int_param(query, field.key()) else {
                continue;
            };
            let current = match field {
                PageField::Page => self.page(),
                PageField::Size => self.page_size(),
            };
            if value != current {
                self.sync_field(field, value);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Derived data
    // ---------------------------------------------------------------------

    /// Hits of the current page. Records without a `ui` link get the path
    /// of their `self` link.
    pub fn records(&self) -> Vec<CollectionRecord<M>> {
        let Some(page) = self.inner.http.data() else {
            return Vec::new();
        };
        page.hits
            .hits
            .into_iter()
            .map(|mut record| {
                if !record.links.contains_key("ui") {
                    if let Some(ui) = record.links.get("self").and_then(|s| url_path(s)) {
                        record.links.insert("ui".to_string(), ui);
                    }
                }
                match &self.inner.record_transformer {
                    Some(transform) => transform(record),
                    None => record,
                }
            })
            .collect()
    }

    pub fn records_count(&self) -> u64 {
        self.total().unwrap_or(0)
    }

    /// Facet definitions from the OPTIONS response, keyed by code. Each
    /// carries `label` (from `facet.label`) and its position as `order`,
    /// then every field the server sent.
    pub fn facet_definitions(&self) -> FacetDefinitions {
        let options = self.inner.http_options.data();
        let mut definitions = FacetDefinitions::new();
        for (order, raw) in options.iter().flat_map(|o| o.facets.iter()).enumerate() {
            let Some(code) = raw.get("code").and_then(Value::as_str) else {
                continue;
            };
            let label = raw
                .get("facet")
                .and_then(|facet| facet.get("label"))
                .cloned()
                .unwrap_or(Value::Null);
            let mut definition = FacetDefinition::new();
            definition.insert("label".to_string(), label);
            definition.insert("order".to_string(), Value::from(order));
            definition.extend(raw.clone());
            definitions.insert(code.to_string(), definition);
        }
        match &self.inner.facet_definition_transformer {
            Some(transform) => transform(definitions),
            None => definitions,
        }
    }

    /// Aggregations of the current page, keyed by facet code.
    pub fn facets(&self) -> Facets {
        let facets: Facets = match self.inner.http.data().map(|page| page.aggregations) {
            Some(Value::Object(map)) => map.into_iter().collect(),
            _ => Facets::new(),
        };
        match &self.inner.facets_transformer {
            Some(transform) => transform(facets),
            None => facets,
        }
    }

    pub fn stale(&self) -> bool {
        self.inner.http.stale()
    }

    pub fn loading(&self) -> bool {
        self.inner.http.loading()
    }

    pub fn loaded(&self) -> bool {
        self.inner.http.loaded()
    }
}

/// Path of an absolute URL: `https://host/api/x?q=1` → `/api/x`.
/// Path of a record's `self` link. Relative links resolve against the site
/// root; dot segments are normalized.
fn url_path(link: &str) -> Option<String> {
    let root = Url::parse("http://localhost/").ok()?;
    let url = root.join(link).ok()?;
    Some(url.path().to_string())
}
