//! Pagination engine
//!
//! A search walks the day partitions of its time range in the requested
//! order. Each partition may take several bounded store queries chained by
//! the store's continuation token. Results are accumulated until the caller's
//! limit or the response byte budget is reached, at which point the exact
//! resume position is returned as an opaque checkpoint.
//!
//! ```text
//!  days:   2021-04-10 ──► 2021-04-11 ──► 2021-04-12
//!                           │
//!  pages:                 [p0] ─next─► [p1] ─next─► [p2]
//!                                        ▲     ▲
//!  checkpoint:   { date: 2021-04-11, iterator: p1, event_key: last delivered }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::checkpoint::Checkpoint;
use super::condition::build_filter;
use super::days::days_between;
use crate::backend::{KeyCondition, QueryRequest, Store, DEFAULT_MAX_PAGE_BYTES, TIME_SEARCH_INDEX};
use crate::error::{AuditError, AuditResult, ResultExt};
use crate::types::{EventRecord, Item, Order, WhereExpr};

/// Optional narrowing of a search beyond time range and namespace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Match any of these event types; empty matches all
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Predicate over the event payload
    #[serde(default)]
    pub condition: Option<WhereExpr>,
}

/// One page request of a search
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// `None` searches every namespace
    pub namespace: Option<String>,
    pub filter: SearchFilter,
    /// Maximum events in the page; 0 means no count limit
    pub limit: usize,
    pub order: Order,
    /// Checkpoint returned by the previous page, empty for the first one
    pub start_key: String,
}

impl SearchRequest {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            namespace: None,
            filter: SearchFilter::default(),
            limit: 0,
            order: Order::Ascending,
            start_key: String::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_event_types<I, T>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.filter.event_types = event_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_condition(mut self, condition: WhereExpr) -> Self {
        self.filter.condition = Some(condition);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn with_start_key(mut self, start_key: impl Into<String>) -> Self {
        self.start_key = start_key.into();
        self
    }
}

/// Events of one page plus the checkpoint for the next; empty when done
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub events: Vec<EventRecord>,
    pub checkpoint: String,
}

impl SearchPage {
    pub fn is_last(&self) -> bool {
        self.checkpoint.is_empty()
    }
}

/// Store-facing knobs of the engine
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub index_name: String,
    /// Byte budget of one page of results
    pub max_response_bytes: usize,
    /// Cap on items evaluated per store query
    pub query_page_limit: Option<usize>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            index_name: TIME_SEARCH_INDEX.to_string(),
            max_response_bytes: DEFAULT_MAX_PAGE_BYTES,
            query_page_limit: None,
        }
    }
}

struct Accumulator {
    events: Vec<EventRecord>,
    bytes: usize,
    remaining: Option<usize>,
}

impl Accumulator {
    fn new(limit: usize) -> Self {
        Self {
            events: Vec::new(),
            bytes: 0,
            remaining: (limit > 0).then_some(limit),
        }
    }

    fn push(&mut self, record: EventRecord, size: usize) {
        self.events.push(record);
        self.bytes += size;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
    }

    fn is_full(&self) -> bool {
        self.remaining == Some(0)
    }

    fn query_limit(&self, page_limit: Option<usize>) -> Option<usize> {
        match (self.remaining, page_limit) {
            (Some(remaining), Some(page)) => Some(remaining.min(page)),
            (Some(remaining), None) => Some(remaining),
            (None, page) => page,
        }
    }

    fn finish(self, checkpoint: Option<Checkpoint>) -> AuditResult<SearchPage> {
        let checkpoint = match checkpoint {
            Some(checkpoint) => checkpoint.encode()?,
            None => String::new(),
        };
        debug!(
            events = self.events.len(),
            bytes = self.bytes,
            more = !checkpoint.is_empty(),
            "Search page complete"
        );
        Ok(SearchPage {
            events: self.events,
            checkpoint,
        })
    }
}

fn item_size(item: &Item) -> usize {
    serde_json::to_vec(item).map(|b| b.len()).unwrap_or(0)
}

/// Fetch one page of events in `[from, to]`, resuming from `start_key`.
///
/// Chaining the returned checkpoints yields every matching event exactly
/// once, in order, as long as the range is not modified meanwhile. On
/// cancellation the events gathered so far are returned together with a
/// checkpoint at the next unread position.
pub async fn search_events_raw<S>(
    store: &S,
    settings: &SearchSettings,
    request: &SearchRequest,
    cancel: &CancellationToken,
) -> AuditResult<SearchPage>
where
    S: Store + ?Sized,
{
    let order = request.order;
    let mut days = days_between(request.from, request.to);
    if order == Order::Descending {
        days.reverse();
    }

    let resume = Checkpoint::decode(&request.start_key)?;
    let first = match &resume {
        None => 0,
        Some(checkpoint) => {
            if checkpoint.order != order {
                return Err(AuditError::CheckpointInvalid(format!(
                    "checkpoint was issued for {} order, search is {}",
                    checkpoint.order, order
                )));
            }
            days.iter()
                .position(|day| *day == checkpoint.date)
                .ok_or_else(|| {
                    AuditError::CheckpointInvalid(format!(
                        "partition {} is outside the requested range",
                        checkpoint.date
                    ))
                })?
        }
    };

    let filter = build_filter(
        request.namespace.as_deref(),
        &request.filter.event_types,
        request.filter.condition.as_ref(),
    )?;
    let mut acc = Accumulator::new(request.limit);

    for (pos, date) in days.iter().enumerate().skip(first) {
        let (mut iterator, mut skip_until) = match &resume {
            Some(checkpoint) if pos == first => {
                (checkpoint.iterator.clone(), checkpoint.event_key.clone())
            }
            _ => (None, None),
        };
        // Only the first query of the resumed partition uses a caller-supplied token.
        let mut resumed = iterator.is_some();

        loop {
            if cancel.is_cancelled() {
                warn!(partition = %date, events = acc.events.len(), "Search cancelled");
                return acc.finish(Some(Checkpoint {
                    date: date.clone(),
                    iterator,
                    event_key: skip_until,
                    order,
                }));
            }

            let query = QueryRequest {
                index: settings.index_name.clone(),
                key: KeyCondition {
                    date: date.clone(),
                    created_from: request.from.timestamp(),
                    created_to: request.to.timestamp(),
                },
                filter: filter.clone(),
                limit: acc.query_limit(settings.query_page_limit),
                order,
                start_key: iterator.clone(),
            };
            let page = match store.query(&query).await {
                Ok(page) => page,
                Err(err) if resumed && matches!(err.root(), AuditError::BadParameter(_)) => {
                    return Err(AuditError::CheckpointInvalid(format!(
                        "store rejected the resume position in partition {}: {}",
                        date, err
                    )));
                }
                Err(err) => return Err(err).with_context(|| format!("query partition {}", date)),
            };
            resumed = false;
            debug!(
                partition = %date,
                items = page.items.len(),
                more = page.next.is_some(),
                "Fetched partition page"
            );

            // Resume point inside this page: the last item handed out from it.
            let mut anchor = skip_until.clone();
            let count = page.items.len();

            for (i, item) in page.items.into_iter().enumerate() {
                let record = EventRecord::from_item(&item)
                    .with_context(|| format!("decode event in partition {}", date))?;
                let key = record.key();

                if let Some(skip) = &skip_until {
                    if *skip == key {
                        skip_until = None;
                    }
                    continue;
                }

                let size = item_size(&item);
                if !acc.events.is_empty() && acc.bytes + size > settings.max_response_bytes {
                    return acc.finish(Some(Checkpoint {
                        date: date.clone(),
                        iterator,
                        event_key: anchor,
                        order,
                    }));
                }

                acc.push(record, size);
                anchor = Some(key);

                if acc.is_full() {
                    let checkpoint = if i + 1 < count {
                        Some(Checkpoint {
                            date: date.clone(),
                            iterator,
                            event_key: anchor,
                            order,
                        })
                    } else if let Some(next) = page.next {
                        Some(Checkpoint {
                            date: date.clone(),
                            iterator: Some(next),
                            event_key: None,
                            order,
                        })
                    } else {
                        days.get(pos + 1)
                            .map(|next_day| Checkpoint::at_partition(next_day.clone(), order))
                    };
                    return acc.finish(checkpoint);
                }
            }

            match page.next {
                Some(next) => iterator = Some(next),
                None => break,
            }
        }

        if let Some(missing) = skip_until {
            return Err(AuditError::CheckpointInvalid(format!(
                "event {} no longer exists in partition {}",
                missing, date
            )));
        }
    }

    acc.finish(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::backend::{
        ContinuationToken, Fault, ItemUpdate, MemoryStore, QueryPage, ScanPage,
    };
    use crate::types::{EventFields, ItemKey, DEFAULT_NAMESPACE};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 4, 10, 8, 5, 0).unwrap()
    }

    fn record(index: i64, at: DateTime<Utc>, user: &str) -> EventRecord {
        let mut fields = EventFields::new();
        fields.insert("user".to_string(), json!(user));
        EventRecord {
            session_id: "session".to_string(),
            event_index: index,
            event_type: if index % 2 == 0 { "user.login" } else { "session.end" }.to_string(),
            created_at: at.timestamp(),
            created_at_date: Some(at.format("%Y-%m-%d").to_string()),
            event_namespace: DEFAULT_NAMESPACE.to_string(),
            fields_map: Some(fields),
            fields: None,
            expires: None,
        }
    }

    /// Eighteen events four hours apart, spread over 2021-04-10..=2021-04-13
    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new("events");
        for i in 0..18 {
            let at = start() + Duration::hours(4 * i);
            let user = if i % 3 == 0 { "alice" } else { "bob" };
            store.put(record(i, at, user).to_item().unwrap()).await.unwrap();
        }
        store
    }

    fn full_range() -> SearchRequest {
        SearchRequest::new(start() - Duration::hours(1), start() + Duration::days(4))
    }

    async fn collect_all(
        store: &MemoryStore,
        settings: &SearchSettings,
        request: SearchRequest,
    ) -> (Vec<i64>, usize) {
        let cancel = CancellationToken::new();
        let mut request = request;
        let mut indexes = Vec::new();
        let mut pages = 0;
        loop {
            let page = search_events_raw(store, settings, &request, &cancel).await.unwrap();
            pages += 1;
            indexes.extend(page.events.iter().map(|e| e.event_index));
            if page.is_last() {
                return (indexes, pages);
            }
            request.start_key = page.checkpoint;
        }
    }

    #[tokio::test]
    async fn test_full_range_both_orders() {
        let store = seeded_store().await;
        let settings = SearchSettings::default();

        let (asc, pages) = collect_all(&store, &settings, full_range()).await;
        assert_eq!(asc, (0..18).collect::<Vec<_>>());
        assert_eq!(pages, 1);

        let (desc, _) = collect_all(&store, &settings, full_range().with_order(Order::Descending)).await;
        assert_eq!(desc, (0..18).rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_chained_limits_cover_everything_once() {
        let store = seeded_store().await;

        for limit in [1, 2, 5, 6, 7, 17] {
            for page_limit in [None, Some(1), Some(4)] {
                let settings = SearchSettings {
                    query_page_limit: page_limit,
                    ..SearchSettings::default()
                };
                let (asc, _) =
                    collect_all(&store, &settings, full_range().with_limit(limit)).await;
                assert_eq!(asc, (0..18).collect::<Vec<_>>(), "limit {} page {:?}", limit, page_limit);

                let (desc, _) = collect_all(
                    &store,
                    &settings,
                    full_range().with_limit(limit).with_order(Order::Descending),
                )
                .await;
                assert_eq!(desc, (0..18).rev().collect::<Vec<_>>());
            }
        }
    }

    #[tokio::test]
    async fn test_changing_limit_between_pages() {
        let store = seeded_store().await;
        let settings = SearchSettings::default();
        let cancel = CancellationToken::new();

        let first = search_events_raw(&store, &settings, &full_range().with_limit(4), &cancel)
            .await
            .unwrap();
        let second = search_events_raw(
            &store,
            &settings,
            &full_range().with_limit(3).with_start_key(first.checkpoint),
            &cancel,
        )
        .await
        .unwrap();

        let indexes: Vec<i64> = first
            .events
            .iter()
            .chain(&second.events)
            .map(|e| e.event_index)
            .collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_byte_budget_breaks_pages() {
        let store = seeded_store().await;
        let one_event = item_size(&record(0, start(), "alice").to_item().unwrap());
        let settings = SearchSettings {
            max_response_bytes: one_event * 3,
            ..SearchSettings::default()
        };

        let (asc, pages) = collect_all(&store, &settings, full_range()).await;
        assert_eq!(asc, (0..18).collect::<Vec<_>>());
        assert!(pages >= 6);
    }

    #[tokio::test]
    async fn test_store_page_limit_forces_continuation() {
        let store = MemoryStore::new("events").with_max_page_bytes(700);
        for i in 0..12 {
            let at = start() + Duration::minutes(i);
            store.put(record(i, at, "bob").to_item().unwrap()).await.unwrap();
        }
        let requests_before = store.request_count();

        let (asc, pages) = collect_all(&store, &SearchSettings::default(), full_range()).await;

        assert_eq!(asc, (0..12).collect::<Vec<_>>());
        assert_eq!(pages, 1);
        assert!(store.request_count() - requests_before > 1);
    }

    #[tokio::test]
    async fn test_filters_apply_across_partitions() {
        let store = seeded_store().await;
        let settings = SearchSettings::default();

        let (alice, _) = collect_all(
            &store,
            &settings,
            full_range()
                .with_limit(2)
                .with_condition(WhereExpr::equals(WhereExpr::field("user"), WhereExpr::literal("alice"))),
        )
        .await;
        assert_eq!(alice, vec![0, 3, 6, 9, 12, 15]);

        let (ends, _) = collect_all(
            &store,
            &settings,
            full_range().with_event_types(["session.end"]).with_namespace(DEFAULT_NAMESPACE),
        )
        .await;
        assert_eq!(ends, vec![1, 3, 5, 7, 9, 11, 13, 15, 17]);

        let (other_ns, _) = collect_all(&store, &settings, full_range().with_namespace("tenant-b")).await;
        assert!(other_ns.is_empty());
    }

    #[tokio::test]
    async fn test_time_bounds_inside_partitions() {
        let store = seeded_store().await;
        // Events 1..=4 fall in [start + 4h, start + 16h].
        let request = SearchRequest::new(start() + Duration::hours(4), start() + Duration::hours(16));

        let (indexes, _) = collect_all(&store, &SearchSettings::default(), request).await;
        assert_eq!(indexes, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_limit_at_partition_end_points_to_next_day() {
        let store = seeded_store().await;
        let cancel = CancellationToken::new();

        // 2021-04-10 holds events 0..=3 (08:05, 12:05, 16:05, 20:05).
        let page = search_events_raw(&store, &SearchSettings::default(), &full_range().with_limit(4), &cancel)
            .await
            .unwrap();
        assert_eq!(page.events.len(), 4);

        let checkpoint = Checkpoint::decode(&page.checkpoint).unwrap().unwrap();
        assert_eq!(checkpoint, Checkpoint::at_partition("2021-04-11", Order::Ascending));
    }

    #[tokio::test]
    async fn test_invalid_checkpoints() {
        let store = seeded_store().await;
        let settings = SearchSettings::default();
        let cancel = CancellationToken::new();

        let garbage = full_range().with_start_key("definitely-not-a-checkpoint");
        let err = search_events_raw(&store, &settings, &garbage, &cancel).await.unwrap_err();
        assert!(err.is_checkpoint_invalid());

        let first = search_events_raw(&store, &settings, &full_range().with_limit(2), &cancel)
            .await
            .unwrap();

        let reversed = full_range()
            .with_limit(2)
            .with_order(Order::Descending)
            .with_start_key(first.checkpoint.clone());
        let err = search_events_raw(&store, &settings, &reversed, &cancel).await.unwrap_err();
        assert!(err.is_checkpoint_invalid());

        let narrowed = SearchRequest::new(start() + Duration::days(2), start() + Duration::days(3))
            .with_start_key(first.checkpoint.clone());
        let err = search_events_raw(&store, &settings, &narrowed, &cancel).await.unwrap_err();
        assert!(err.is_checkpoint_invalid());

        // A byte break leaves the resume point in the middle of a store page.
        let one_event = item_size(&record(0, start(), "alice").to_item().unwrap());
        let tight = SearchSettings {
            max_response_bytes: one_event * 2 + one_event / 2,
            ..SearchSettings::default()
        };
        let partial = search_events_raw(&store, &tight, &full_range(), &cancel).await.unwrap();
        assert_eq!(partial.events.len(), 2);

        // The last delivered event disappears before the next page is read.
        store.delete(&[partial.events[1].key()]).await.unwrap();
        let resumed = full_range().with_start_key(partial.checkpoint);
        let err = search_events_raw(&store, &tight, &resumed, &cancel).await.unwrap_err();
        assert!(err.is_checkpoint_invalid());

        // Well-formed checkpoint whose store position is damaged.
        let damaged = Checkpoint {
            date: "2021-04-10".to_string(),
            iterator: Some(ContinuationToken::new("garbage")),
            event_key: None,
            order: Order::Ascending,
        };
        let request = full_range().with_start_key(damaged.encode().unwrap());
        let err = search_events_raw(&store, &settings, &request, &cancel).await.unwrap_err();
        assert!(err.is_checkpoint_invalid(), "{}", err);
    }

    #[tokio::test]
    async fn test_cancellation_returns_resumable_progress() {
        let store = seeded_store().await;
        let settings = SearchSettings::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let page = search_events_raw(&store, &settings, &full_range(), &cancel).await.unwrap();
        assert!(page.events.is_empty());
        assert!(!page.is_last());

        let resumed = full_range().with_start_key(page.checkpoint);
        let (indexes, _) = collect_all(&store, &settings, resumed).await;
        assert_eq!(indexes, (0..18).collect::<Vec<_>>());
    }

    /// Cancels its token once the given number of queries was served
    struct CancellingStore {
        inner: MemoryStore,
        cancel: CancellationToken,
        after: usize,
        queries: AtomicUsize,
    }

    #[async_trait]
    impl Store for CancellingStore {
        async fn put(&self, item: Item) -> AuditResult<()> {
            self.inner.put(item).await
        }

        async fn update(&self, update: &ItemUpdate) -> AuditResult<bool> {
            self.inner.update(update).await
        }

        async fn query(&self, request: &QueryRequest) -> AuditResult<QueryPage> {
            let page = self.inner.query(request).await?;
            if self.queries.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                self.cancel.cancel();
            }
            Ok(page)
        }

        async fn scan(
            &self,
            page_size: usize,
            start_key: Option<&ContinuationToken>,
        ) -> AuditResult<ScanPage> {
            self.inner.scan(page_size, start_key).await
        }

        async fn delete(&self, keys: &[ItemKey]) -> AuditResult<()> {
            self.inner.delete(keys).await
        }

        async fn index_exists(&self, table: &str, index: &str) -> AuditResult<bool> {
            self.inner.index_exists(table, index).await
        }
    }

    #[tokio::test]
    async fn test_cancellation_mid_partition_resumes_exactly() {
        let settings = SearchSettings {
            query_page_limit: Some(2),
            ..SearchSettings::default()
        };

        for order in [Order::Ascending, Order::Descending] {
            let mut expected: Vec<i64> = (0..18).collect();
            if order == Order::Descending {
                expected.reverse();
            }

            for after in 1..=11 {
                let store = CancellingStore {
                    inner: seeded_store().await,
                    cancel: CancellationToken::new(),
                    after,
                    queries: AtomicUsize::new(0),
                };
                let mut request = full_range().with_limit(5).with_order(order);
                let mut indexes = Vec::new();

                loop {
                    // Once the store cancelled, resume with a live token.
                    let cancel = if store.cancel.is_cancelled() {
                        CancellationToken::new()
                    } else {
                        store.cancel.clone()
                    };
                    let page = search_events_raw(&store, &settings, &request, &cancel)
                        .await
                        .unwrap();
                    indexes.extend(page.events.iter().map(|e| e.event_index));
                    if page.is_last() {
                        break;
                    }
                    request.start_key = page.checkpoint;
                }

                assert_eq!(indexes, expected, "{} order, cancelled after {} queries", order, after);
                if after <= 8 {
                    assert!(store.cancel.is_cancelled());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_store_errors_carry_partition() {
        let store = seeded_store().await;
        store.inject_faults(Fault::Throttled, 1);

        let err = search_events_raw(&store, &SearchSettings::default(), &full_range(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(err.to_string().starts_with("query partition 2021-04-10"));
    }

    #[tokio::test]
    async fn test_empty_and_inverted_ranges() {
        let store = seeded_store().await;
        let cancel = CancellationToken::new();

        let inverted = SearchRequest::new(start() + Duration::days(1), start());
        let page = search_events_raw(&store, &SearchSettings::default(), &inverted, &cancel)
            .await
            .unwrap();
        assert!(page.events.is_empty());
        assert!(page.is_last());

        let before = SearchRequest::new(start() - Duration::days(10), start() - Duration::days(9));
        let page = search_events_raw(&store, &SearchSettings::default(), &before, &cancel)
            .await
            .unwrap();
        assert!(page.events.is_empty());
        assert!(page.is_last());
    }
}
