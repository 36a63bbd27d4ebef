//! Stale-while-revalidate fetch core for a paginated, faceted search API.
//!
//! # Overview
//! A [`Resource`] binds one URL and query to observable state (`loading`,
//! `data`, `error`, ...). Changing the url, the query or the force counter
//! changes the binding's fingerprint, and every new fingerprint is fetched
//! once through a shared [`SwrCache`]. [`Collection`] layers pagination,
//! facets and endpoint options on three resources; [`Record`] adds a
//! detachable draft of a single record's metadata.
//!
//! # Design
//! - Network I/O lives behind the [`Transport`] trait. The crate ships a
//!   `ureq` implementation; tests plug in their own.
//! - State is published through `tokio::sync::watch`; fetches run as tokio
//!   tasks and results for superseded fingerprints are dropped.
//! - Failures are classified into [`HttpError`] and stored in state rather
//!   than returned, except for `remove` and awaited loads.
//! - Payload types are defined independently from the mock-server crate;
//!   integration tests catch schema drift.

pub mod cache;
pub mod collection;
pub mod error;
pub mod http;
pub mod query;
pub mod record;
pub mod resource;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

pub use cache::{RetryPolicy, SwrCache};
pub use collection::{Collection, CollectionOptions};
pub use error::{classify, ErrorKind, HttpError, TransportFailure};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use query::{canonicalize, Query, QueryValue};
pub use record::{DraftModel, Record, RecordOptions};
pub use resource::{
    LoadError, LoadOptions, MutationOptions, OpOutcome, PendingLoad, RemoveOptions, Resource,
    ResourceOptions, ResourceState,
};
pub use transport::Transport;
#[cfg(feature = "ureq")]
pub use transport::UreqTransport;
pub use types::{CollectionPage, CollectionRecord, PatchOperation};
