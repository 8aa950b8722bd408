//! Document storage port.
//!
//! The [`DocumentStore`] trait is the seam between the domain and whatever
//! holds the documents. It works on JSON objects keyed by `_id`; typed access
//! goes through [`crate::SensorRepository`]. [`MemoryStore`] is the in-process
//! implementation used by the producer and by tests.

mod memory;

pub use memory::MemoryStore;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::StoreResult;
use crate::{Collection, DocumentId};

/// Key under which every document stores its identifier.
pub const ID_FIELD: &str = "_id";

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// A single field condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field equals the value.
    Eq(String, Value),
    /// Field is present and differs from the value.
    Ne(String, Value),
    /// Field is greater than or equal to the value.
    Gte(String, Value),
    /// Field is less than or equal to the value.
    Lte(String, Value),
}

impl Condition {
    /// Returns `true` if `document` satisfies this condition.
    ///
    /// A missing field never satisfies a condition.
    pub fn matches(&self, document: &Map<String, Value>) -> bool {
        let (field, expected) = match self {
            Self::Eq(f, v) | Self::Ne(f, v) | Self::Gte(f, v) | Self::Lte(f, v) => (f, v),
        };
        let Some(actual) = document.get(field) else {
            return false;
        };
        match self {
            Self::Eq(..) => values_equal(actual, expected),
            Self::Ne(..) => !values_equal(actual, expected),
            Self::Gte(..) => matches!(
                compare_values(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lte(..) => matches!(
                compare_values(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

/// A conjunction of [`Condition`]s. The empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    /// Creates a filter that matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter matching the document with the given identifier.
    #[must_use]
    pub fn by_id(id: DocumentId) -> Self {
        Self::new().eq(ID_FIELD, id)
    }

    /// Requires `field == value`.
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Serialize) -> Self {
        self.conditions
            .push(Condition::Eq(field.into(), to_value(value)));
        self
    }

    /// Requires `field != value`.
    #[must_use]
    pub fn ne(mut self, field: impl Into<String>, value: impl Serialize) -> Self {
        self.conditions
            .push(Condition::Ne(field.into(), to_value(value)));
        self
    }

    /// Requires `field >= value`.
    #[must_use]
    pub fn gte(mut self, field: impl Into<String>, value: impl Serialize) -> Self {
        self.conditions
            .push(Condition::Gte(field.into(), to_value(value)));
        self
    }

    /// Requires `field <= value`.
    #[must_use]
    pub fn lte(mut self, field: impl Into<String>, value: impl Serialize) -> Self {
        self.conditions
            .push(Condition::Lte(field.into(), to_value(value)));
        self
    }

    /// The conditions making up this filter.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Returns `true` if `document` satisfies every condition.
    pub fn matches(&self, document: &Map<String, Value>) -> bool {
        self.conditions.iter().all(|c| c.matches(document))
    }
}

// Serialising identifiers, timestamps and primitives into a Value cannot fail;
// anything exotic degrades to Null, which matches nothing.
fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Sorting and paging for [`DocumentStore::find`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Sort keys, applied in order.
    pub sort: Vec<(String, SortOrder)>,
    /// Number of matching documents to skip.
    pub skip: usize,
    /// Maximum number of documents to return; `0` means no limit.
    pub limit: usize,
}

impl FindOptions {
    /// No sorting, no paging.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorts newest-first on a timestamp field.
    #[must_use]
    pub fn newest_first(field: impl Into<String>) -> Self {
        Self::new().sort_by(field, SortOrder::Descending)
    }

    /// Adds a sort key.
    #[must_use]
    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    /// Skips the first `skip` matches.
    #[must_use]
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Returns at most `limit` matches.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

// ---------------------------------------------------------------------------
// Value comparison
// ---------------------------------------------------------------------------

/// Orders two stored values.
///
/// Numbers compare numerically; strings that both parse as RFC 3339 compare
/// chronologically, other strings lexically. Mixed or unordered types
/// (booleans, objects, arrays) yield `None`.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (parse_time(x), parse_time(y)) {
            (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
            _ => Some(x.cmp(y)),
        },
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match compare_values(a, b) {
        Some(ordering) => ordering == Ordering::Equal,
        None => a == b,
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Store port
// ---------------------------------------------------------------------------

/// Backend that persists JSON documents in named collections.
///
/// Every document is a JSON object carrying its identifier under
/// [`ID_FIELD`]. Implementations enforce the unique constraints declared by
/// [`Collection::unique_constraints`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts a new document.
    ///
    /// Fails with `DuplicateId` if the `_id` is taken, or `DuplicateKey` if a
    /// unique constraint would be violated.
    async fn insert(&self, collection: Collection, document: Map<String, Value>)
        -> StoreResult<()>;

    /// Returns the document with the given identifier, if present.
    async fn get(
        &self,
        collection: Collection,
        id: DocumentId,
    ) -> StoreResult<Option<Map<String, Value>>>;

    /// Returns documents matching `filter`, sorted and paged per `options`.
    async fn find(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> StoreResult<Vec<Map<String, Value>>>;

    /// Sets `fields` on the first document matching `filter`.
    ///
    /// Returns `true` if a document matched.
    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        fields: Map<String, Value>,
    ) -> StoreResult<bool>;

    /// Sets `fields` on every document matching `filter`.
    ///
    /// Returns the number of matched documents.
    async fn update_many(
        &self,
        collection: Collection,
        filter: &Filter,
        fields: Map<String, Value>,
    ) -> StoreResult<u64>;

    /// Deletes the document with the given identifier.
    ///
    /// Returns `true` if a document was deleted.
    async fn delete(&self, collection: Collection, id: DocumentId) -> StoreResult<bool>;
}
