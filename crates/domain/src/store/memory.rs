//! In-memory document store.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::errors::{StoreError, StoreResult};
use crate::{Collection, DocumentId};

use super::{compare_values, DocumentStore, Filter, FindOptions, SortOrder, ID_FIELD};

type Documents = Vec<Map<String, Value>>;

/// In-memory document store.
///
/// Documents are kept per collection in insertion order. Contents are lost
/// when the process exits; unique constraints are enforced on insert.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<Collection, Documents>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently held in `collection`.
    pub fn len(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .map(|c| c.get(&collection).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("lock poisoned".to_owned())
}

fn document_id(collection: Collection, document: &Map<String, Value>) -> StoreResult<DocumentId> {
    let raw = document
        .get(ID_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Malformed {
            collection,
            reason: format!("missing string '{ID_FIELD}'"),
        })?;
    raw.parse().map_err(|_| StoreError::Malformed {
        collection,
        reason: format!("'{ID_FIELD}' is not a document id: {raw}"),
    })
}

fn violates(existing: &Map<String, Value>, candidate: &Map<String, Value>, fields: &[&str]) -> bool {
    fields.iter().all(|field| {
        let a = existing.get(*field).unwrap_or(&Value::Null);
        let b = candidate.get(*field).unwrap_or(&Value::Null);
        match compare_values(a, b) {
            Some(ordering) => ordering == Ordering::Equal,
            None => a == b,
        }
    })
}

fn sort_documents(documents: &mut [Map<String, Value>], keys: &[(String, SortOrder)]) {
    if keys.is_empty() {
        return;
    }
    documents.sort_by(|a, b| {
        for (field, order) in keys {
            let ordering = match (a.get(field), b.get(field)) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = match order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn apply_fields(document: &mut Map<String, Value>, fields: &Map<String, Value>) {
    for (key, value) in fields {
        if key != ID_FIELD {
            document.insert(key.clone(), value.clone());
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(
        &self,
        collection: Collection,
        document: Map<String, Value>,
    ) -> StoreResult<()> {
        let id = document_id(collection, &document)?;
        let mut collections = self.collections.write().map_err(poisoned)?;
        let documents = collections.entry(collection).or_default();

        let id_value = Value::String(id.to_string());
        if documents.iter().any(|d| d.get(ID_FIELD) == Some(&id_value)) {
            return Err(StoreError::DuplicateId { collection, id });
        }
        for fields in collection.unique_constraints() {
            if documents.iter().any(|d| violates(d, &document, fields)) {
                return Err(StoreError::DuplicateKey {
                    collection,
                    fields: fields.join(","),
                });
            }
        }

        documents.push(document);
        Ok(())
    }

    async fn get(
        &self,
        collection: Collection,
        id: DocumentId,
    ) -> StoreResult<Option<Map<String, Value>>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let filter = Filter::by_id(id);
        Ok(collections
            .get(&collection)
            .and_then(|docs| docs.iter().find(|d| filter.matches(d)))
            .cloned())
    }

    async fn find(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> StoreResult<Vec<Map<String, Value>>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let mut matched: Vec<_> = collections
            .get(&collection)
            .map(|docs| docs.iter().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default();
        drop(collections);

        sort_documents(&mut matched, &options.sort);
        let limit = if options.limit == 0 {
            usize::MAX
        } else {
            options.limit
        };
        Ok(matched.into_iter().skip(options.skip).take(limit).collect())
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        fields: Map<String, Value>,
    ) -> StoreResult<bool> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        let Some(document) = collections
            .get_mut(&collection)
            .and_then(|docs| docs.iter_mut().find(|d| filter.matches(d)))
        else {
            return Ok(false);
        };
        apply_fields(document, &fields);
        Ok(true)
    }

    async fn update_many(
        &self,
        collection: Collection,
        filter: &Filter,
        fields: Map<String, Value>,
    ) -> StoreResult<u64> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        let mut matched = 0;
        if let Some(documents) = collections.get_mut(&collection) {
            for document in documents.iter_mut().filter(|d| filter.matches(d)) {
                apply_fields(document, &fields);
                matched += 1;
            }
        }
        Ok(matched)
    }

    async fn delete(&self, collection: Collection, id: DocumentId) -> StoreResult<bool> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        let Some(documents) = collections.get_mut(&collection) else {
            return Ok(false);
        };
        let filter = Filter::by_id(id);
        let before = documents.len();
        documents.retain(|d| !filter.matches(d));
        Ok(documents.len() < before)
    }
}
