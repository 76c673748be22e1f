//! Storage backend abstraction
//!
//! The `Store` trait is the boundary to the managed key-value store holding
//! the audit table. The table is keyed by `(SessionID, EventIndex)` and has
//! a time search index keyed by `(CreatedAtDate, CreatedAt)`.
//!
//! ```text
//!              ┌──────────────┐  put / update / scan   ┌───────────────┐
//!  AuditLog ──►│ Store (trait)│───────────────────────►│ table         │
//!              │              │  query(date, filter)   ├───────────────┤
//!              │              │───────────────────────►│ timesearchV2  │
//!              └──────────────┘                        └───────────────┘
//! ```
//!
//! `MemoryStore` is the in-process implementation used by tests and the CLI.

mod expr;
mod memory;

use std::collections::BTreeMap;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AuditResult;
use crate::types::{Item, ItemKey, Order};

pub use expr::Condition;
pub use memory::{Fault, MemoryStore, DEFAULT_MAX_ITEM_BYTES, DEFAULT_MAX_PAGE_BYTES};

/// Name of the time search index
pub const TIME_SEARCH_INDEX: &str = "timesearchV2";

/// Maximum number of keys in one batch delete
pub const MAX_BATCH_SIZE: usize = 25;

/// Store-native position for continuing a query or scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Key condition on the time search index:
/// `CreatedAtDate = date AND CreatedAt BETWEEN created_from AND created_to`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCondition {
    pub date: String,
    pub created_from: i64,
    pub created_to: i64,
}

/// A native filter expression with its placeholder bindings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterExpression {
    pub expression: String,
    /// `#name` placeholders to attribute names
    pub names: BTreeMap<String, String>,
    /// `:value` placeholders to values
    pub values: BTreeMap<String, Value>,
}

/// One bounded query against a single index partition
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub index: String,
    pub key: KeyCondition,
    pub filter: Option<FilterExpression>,
    /// Maximum number of items evaluated (before filtering)
    pub limit: Option<usize>,
    pub order: Order,
    pub start_key: Option<ContinuationToken>,
}

/// Items matched by one query, plus where to continue if it stopped early
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub items: Vec<Item>,
    pub next: Option<ContinuationToken>,
}

/// In-place change of one item: set some attributes, remove others
///
/// Attributes not named are left as they are, so concurrent writers touching
/// other attributes do not overwrite each other.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemUpdate {
    pub key: ItemKey,
    pub set: Item,
    pub remove: Vec<String>,
    /// Must hold for the current item or nothing is written
    pub condition: Option<FilterExpression>,
}

impl ItemUpdate {
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            set: Item::new(),
            remove: Vec::new(),
            condition: None,
        }
    }

    pub fn set(mut self, attribute: impl Into<String>, value: Value) -> Self {
        self.set.insert(attribute.into(), value);
        self
    }

    pub fn remove(mut self, attribute: impl Into<String>) -> Self {
        self.remove.push(attribute.into());
        self
    }

    /// Only apply when `expression` holds, `values` binding its placeholders
    pub fn when(mut self, expression: impl Into<String>, values: BTreeMap<String, Value>) -> Self {
        self.condition = Some(FilterExpression {
            expression: expression.into(),
            names: BTreeMap::new(),
            values,
        });
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<Item>,
    pub next: Option<ContinuationToken>,
}

/// Operations the audit log needs from the underlying store
///
/// Every call may suspend on I/O. Writes are single-item and durable once
/// the call returns.
#[async_trait]
pub trait Store: Send + Sync {
    /// Write an item, replacing any item with the same key
    async fn put(&self, item: Item) -> AuditResult<()>;

    /// Apply an in-place update to an existing item
    ///
    /// Returns `false` without writing when the item is gone or the update's
    /// condition does not hold for its current state.
    async fn update(&self, update: &ItemUpdate) -> AuditResult<bool>;

    /// Query one partition of an index
    async fn query(&self, request: &QueryRequest) -> AuditResult<QueryPage>;

    /// Read one page of the whole table in key order
    async fn scan(
        &self,
        page_size: usize,
        start_key: Option<&ContinuationToken>,
    ) -> AuditResult<ScanPage>;

    /// Delete up to `MAX_BATCH_SIZE` items
    async fn delete(&self, keys: &[ItemKey]) -> AuditResult<()>;

    /// Whether `index` exists on `table`; `NotFound` if the table does not
    async fn index_exists(&self, table: &str, index: &str) -> AuditResult<bool>;
}

/// Lazily scan the table one page at a time
pub fn scan_pages<'a, S>(
    store: &'a S,
    page_size: usize,
) -> impl Stream<Item = AuditResult<Vec<Item>>> + Send + 'a
where
    S: Store + ?Sized,
{
    try_stream! {
        let mut start: Option<ContinuationToken> = None;
        loop {
            let page = store.scan(page_size, start.as_ref()).await?;
            yield page.items;
            match page.next {
                Some(next) => start = Some(next),
                None => break,
            }
        }
    }
}
