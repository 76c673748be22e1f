//! In-memory store
//!
//! Emulates the parts of the managed store the audit log depends on: the
//! date-partitioned time search index, per-query evaluated-item limits, the
//! per-page byte limit that forces continuation, opaque continuation tokens,
//! server-side filter evaluation and transient failures.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    Condition, ContinuationToken, ItemUpdate, QueryPage, QueryRequest, ScanPage, Store,
    MAX_BATCH_SIZE, TIME_SEARCH_INDEX,
};
use crate::error::{AuditError, AuditResult};
use crate::types::{attr, Item, ItemKey, Order};

/// Bytes of item data one query or scan page may evaluate
pub const DEFAULT_MAX_PAGE_BYTES: usize = 1024 * 1024;

/// Largest item the table accepts
pub const DEFAULT_MAX_ITEM_BYTES: usize = 400 * 1024;

/// Failure injected into the next store request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Throttled,
    Unavailable,
}

/// Position of an item in the time search index
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct IndexPosition {
    created_at: i64,
    event_index: i64,
    session_id: String,
}

impl IndexPosition {
    fn from_item(item: &Item) -> Option<(String, Self)> {
        let date = item.get(attr::CREATED_AT_DATE)?.as_str()?;
        let created_at = item.get(attr::CREATED_AT)?.as_i64()?;
        let key = ItemKey::from_item(item)?;
        Some((
            date.to_string(),
            Self {
                created_at,
                event_index: key.event_index,
                session_id: key.session_id,
            },
        ))
    }
}

fn encode_token<T: Serialize>(position: &T) -> AuditResult<ContinuationToken> {
    Ok(ContinuationToken::new(serde_json::to_string(position)?))
}

fn decode_token<T: for<'de> Deserialize<'de>>(token: &ContinuationToken) -> AuditResult<T> {
    serde_json::from_str(token.as_str()).map_err(|e| {
        AuditError::BadParameter(format!("invalid continuation token {:?}: {}", token.as_str(), e))
    })
}

fn item_size(item: &Item) -> usize {
    serde_json::to_vec(item).map(|b| b.len()).unwrap_or(0)
}

/// Table held in process memory
pub struct MemoryStore {
    table_name: String,
    indexes: BTreeSet<String>,
    items: RwLock<BTreeMap<ItemKey, Item>>,
    max_page_bytes: usize,
    max_item_bytes: usize,
    faults: Mutex<VecDeque<Fault>>,
    writes: AtomicU64,
    requests: AtomicU64,
}

impl MemoryStore {
    /// Create an empty table carrying the time search index
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            indexes: BTreeSet::from([TIME_SEARCH_INDEX.to_string()]),
            items: RwLock::new(BTreeMap::new()),
            max_page_bytes: DEFAULT_MAX_PAGE_BYTES,
            max_item_bytes: DEFAULT_MAX_ITEM_BYTES,
            faults: Mutex::new(VecDeque::new()),
            writes: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        }
    }

    /// Add a secondary index name
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.indexes.insert(index.into());
        self
    }

    pub fn with_max_page_bytes(mut self, bytes: usize) -> Self {
        self.max_page_bytes = bytes;
        self
    }

    pub fn with_max_item_bytes(mut self, bytes: usize) -> Self {
        self.max_item_bytes = bytes;
        self
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Snapshot of every item in key order
    pub fn items(&self) -> Vec<Item> {
        self.items.read().values().cloned().collect()
    }

    pub fn get(&self, key: &ItemKey) -> Option<Item> {
        self.items.read().get(key).cloned()
    }

    /// Number of successful writes (puts, updates and deletes) so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of requests received so far, failed ones included
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Make the next `count` requests fail with `fault`
    pub fn inject_faults(&self, fault: Fault, count: usize) {
        let mut faults = self.faults.lock();
        faults.extend(std::iter::repeat(fault).take(count));
    }

    fn begin_request(&self, operation: &str) -> AuditResult<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match self.faults.lock().pop_front() {
            None => Ok(()),
            Some(Fault::Throttled) => Err(AuditError::Throttled(format!(
                "{} on table {}: provisioned throughput exceeded",
                operation, self.table_name
            ))),
            Some(Fault::Unavailable) => Err(AuditError::StoreUnavailable(format!(
                "{} on table {}: service unavailable",
                operation, self.table_name
            ))),
        }
    }

    fn check_size(&self, key: &ItemKey, item: &Item) -> AuditResult<()> {
        let size = item_size(item);
        if size > self.max_item_bytes {
            return Err(AuditError::BadParameter(format!(
                "item {} is {} bytes, limit is {}",
                key, size, self.max_item_bytes
            )));
        }
        Ok(())
    }

    fn insert(&self, item: Item) -> AuditResult<()> {
        let key = ItemKey::from_item(&item).ok_or_else(|| {
            AuditError::BadParameter(format!(
                "item is missing key attributes {} and {}",
                attr::SESSION_ID,
                attr::EVENT_INDEX
            ))
        })?;
        self.check_size(&key, &item)?;
        self.items.write().insert(key, item);
        Ok(())
    }

    /// Load a table dump, one JSON item per line
    pub fn load_jsonl<P: AsRef<Path>>(
        table_name: impl Into<String>,
        path: P,
    ) -> AuditResult<Self> {
        let store = Self::new(table_name);
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let item = match serde_json::from_str::<Value>(&line) {
                Ok(Value::Object(item)) => item,
                Ok(_) => {
                    warn!(line = line_num + 1, "Skipping non-object line in table dump");
                    continue;
                }
                Err(e) => {
                    warn!(line = line_num + 1, error = %e, "Skipping unparseable line in table dump");
                    continue;
                }
            };
            if let Err(e) = store.insert(item) {
                warn!(line = line_num + 1, error = %e, "Skipping invalid item in table dump");
            }
        }

        Ok(store)
    }

    /// Write the table as JSONL, atomically replacing `path`
    pub fn save_jsonl<P: AsRef<Path>>(&self, path: P) -> AuditResult<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&temp_path)?;
            for item in self.items.read().values() {
                writeln!(file, "{}", serde_json::to_string(item)?)?;
            }
            file.sync_all()?;
        }
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, item: Item) -> AuditResult<()> {
        self.begin_request("put")?;
        self.insert(item)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, update: &ItemUpdate) -> AuditResult<bool> {
        self.begin_request("update")?;
        if update.set.contains_key(attr::SESSION_ID) || update.set.contains_key(attr::EVENT_INDEX) {
            return Err(AuditError::BadParameter(format!(
                "update of {} may not change key attributes",
                update.key
            )));
        }
        let condition = update.condition.as_ref().map(Condition::parse).transpose()?;

        let mut items = self.items.write();
        let Some(current) = items.get(&update.key) else {
            return Ok(false);
        };
        if !condition.as_ref().map_or(true, |c| c.matches(current)) {
            return Ok(false);
        }

        let mut updated = current.clone();
        for (name, value) in &update.set {
            updated.insert(name.clone(), value.clone());
        }
        for name in &update.remove {
            updated.remove(name);
        }
        self.check_size(&update.key, &updated)?;

        items.insert(update.key.clone(), updated);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn query(&self, request: &QueryRequest) -> AuditResult<QueryPage> {
        self.begin_request("query")?;

        if !self.indexes.contains(&request.index) {
            return Err(AuditError::NotFound(format!(
                "index {} on table {}",
                request.index, self.table_name
            )));
        }
        if request.limit == Some(0) {
            return Err(AuditError::BadParameter("query limit must be positive".to_string()));
        }

        let condition = request.filter.as_ref().map(Condition::parse).transpose()?;
        let start: Option<IndexPosition> =
            request.start_key.as_ref().map(decode_token).transpose()?;

        let items = self.items.read();
        let mut rows: Vec<(IndexPosition, &Item)> = items
            .values()
            .filter_map(|item| {
                let (date, position) = IndexPosition::from_item(item)?;
                let in_range = date == request.key.date
                    && position.created_at >= request.key.created_from
                    && position.created_at <= request.key.created_to;
                in_range.then_some((position, item))
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        if request.order == Order::Descending {
            rows.reverse();
        }

        let begin = match &start {
            Some(start) => rows
                .iter()
                .position(|(position, _)| match request.order {
                    Order::Ascending => position > start,
                    Order::Descending => position < start,
                })
                .unwrap_or(rows.len()),
            None => 0,
        };

        let mut page = QueryPage::default();
        let mut evaluated = 0;
        let mut bytes = 0;
        let mut last = None;

        for (position, item) in &rows[begin..] {
            if request.limit.is_some_and(|limit| evaluated >= limit) {
                break;
            }
            let size = item_size(item);
            if evaluated > 0 && bytes + size > self.max_page_bytes {
                break;
            }
            evaluated += 1;
            bytes += size;
            last = Some(position);

            if condition.as_ref().map_or(true, |c| c.matches(item)) {
                page.items.push((*item).clone());
            }
        }

        if begin + evaluated < rows.len() {
            page.next = last.map(encode_token).transpose()?;
        }

        debug!(
            partition = %request.key.date,
            evaluated,
            matched = page.items.len(),
            more = page.next.is_some(),
            "Served query page"
        );
        Ok(page)
    }

    async fn scan(
        &self,
        page_size: usize,
        start_key: Option<&ContinuationToken>,
    ) -> AuditResult<ScanPage> {
        self.begin_request("scan")?;
        if page_size == 0 {
            return Err(AuditError::BadParameter("scan page size must be positive".to_string()));
        }

        let start: Option<ItemKey> = start_key.map(decode_token).transpose()?;
        let items = self.items.read();
        let mut remaining: Box<dyn Iterator<Item = (&ItemKey, &Item)>> = match &start {
            Some(start) => Box::new(
                items.range::<ItemKey, _>((
                    std::ops::Bound::Excluded(start),
                    std::ops::Bound::Unbounded,
                )),
            ),
            None => Box::new(items.iter()),
        };

        let mut page = ScanPage::default();
        let mut bytes = 0;
        let mut last = None;
        for (key, item) in remaining.by_ref() {
            let size = item_size(item);
            if !page.items.is_empty() && bytes + size > self.max_page_bytes {
                page.next = last.map(encode_token).transpose()?;
                return Ok(page);
            }
            bytes += size;
            last = Some(key);
            page.items.push(item.clone());
            if page.items.len() == page_size {
                break;
            }
        }

        if remaining.next().is_some() {
            page.next = last.map(encode_token).transpose()?;
        }
        Ok(page)
    }

    async fn delete(&self, keys: &[ItemKey]) -> AuditResult<()> {
        self.begin_request("delete")?;
        if keys.len() > MAX_BATCH_SIZE {
            return Err(AuditError::BadParameter(format!(
                "batch of {} keys exceeds limit of {}",
                keys.len(),
                MAX_BATCH_SIZE
            )));
        }

        let mut items = self.items.write();
        for key in keys {
            if items.remove(key).is_some() {
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn index_exists(&self, table: &str, index: &str) -> AuditResult<bool> {
        self.begin_request("describe table")?;
        if table != self.table_name {
            return Err(AuditError::NotFound(format!("table {}", table)));
        }
        Ok(self.indexes.contains(index))
    }
}
