//! Single-record binding with a detachable draft of its metadata.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::http::{replace_header, HttpMethod};
use crate::query::Query;
use crate::resource::{Payload, Resource, ResourceOptions};
use crate::transport::Transport;
use crate::types::CollectionRecord;

/// Construction options of a [`Record`].
pub type RecordOptions<M> = ResourceOptions<CollectionRecord<M>>;

/// Editable copy of a record's metadata, shared by every holder of the
/// handle. Edits never touch the binding's data.
#[derive(Debug)]
pub struct DraftModel<M> {
    value: Arc<Mutex<M>>,
}

impl<M> Clone for DraftModel<M> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
        }
    }
}

impl<M: Clone> DraftModel<M> {
    fn new(value: M) -> Self {
        Self {
            value: Arc::new(Mutex::new(value)),
        }
    }

    pub fn get(&self) -> M {
        self.value.lock().clone()
    }

    pub fn set(&self, value: M) {
        *self.value.lock() = value;
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut M),
    {
        f(&mut self.value.lock());
    }

    /// Whether both handles point at the same draft.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

struct DraftSlot<M> {
    draft: Option<DraftModel<M>>,
    /// `data_version` of the metadata the draft was last copied from.
    version: u64,
}

/// Handle to a single record fetched from its URL.
pub struct Record<M> {
    http: Resource<CollectionRecord<M>>,
    slot: Arc<Mutex<DraftSlot<M>>>,
}

impl<M> Clone for Record<M> {
    fn clone(&self) -> Self {
        Self {
            http: self.http.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<M: Payload> Record<M> {
    pub fn new(transport: Arc<dyn Transport>, url: &str, mut options: RecordOptions<M>) -> Self {
        options.method = HttpMethod::Get;
        replace_header(&mut options.headers, "Accept", "application/json");
        let http = Resource::new(transport, Some(url), Query::new(), options);
        let slot = Arc::new(Mutex::new(DraftSlot {
            draft: None,
            version: 0,
        }));

        let weak: Weak<Mutex<DraftSlot<M>>> = Arc::downgrade(&slot);
        http.watch(move |http| {
            if let Some(slot) = weak.upgrade() {
                refresh_draft(&slot, http);
            }
        });

        Self { http, slot }
    }

    pub fn http(&self) -> &Resource<CollectionRecord<M>> {
        &self.http
    }

    /// Metadata of the loaded record.
    pub fn metadata(&self) -> Option<M> {
        self.http.map_data(|record| record.metadata.clone())
    }

    pub fn set_url(&self, url: impl Into<String>) {
        self.http.set_url(Some(url.into()));
    }

    /// Return the draft, creating it from the current metadata on first
    /// use. `None` while there is no metadata to copy.
    pub fn create_model(&self) -> Option<DraftModel<M>> {
        let mut slot = self.slot.lock();
        if let Some(draft) = &slot.draft {
            return Some(draft.clone());
        }
        let version = self.http.data_version();
        let draft = DraftModel::new(self.metadata()?);
        slot.draft = Some(draft.clone());
        slot.version = version;
        Some(draft)
    }

    /// Drop the draft; the next `create_model` copies fresh metadata.
    pub fn release_model(&self) {
        self.slot.lock().draft = None;
    }
}

/// Overwrite an existing draft when the binding has stored new data.
fn refresh_draft<M: Payload>(slot: &Mutex<DraftSlot<M>>, http: &Resource<CollectionRecord<M>>) {
    let version = http.data_version();
    let mut slot = slot.lock();
    if slot.version == version {
        return;
    }
    slot.version = version;
    let Some(draft) = &slot.draft else {
        return;
    };
    if let Some(metadata) = http.map_data(|record| record.metadata.clone()) {
        tracing::debug!(version, "refreshing draft from fetched metadata");
        draft.set(metadata);
    }
}
