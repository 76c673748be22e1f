//! AuditLog - the audit event store facade
//!
//! Owns the configuration, a shared handle to the store and the
//! cancellation token of every long-running call it starts. All store-facing
//! operations run under the configured retry policy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::{ContinuationToken, Store, MAX_BATCH_SIZE};
use crate::error::{AuditError, AuditResult, ResultExt};
use crate::query::{self, SearchFilter, SearchPage, SearchRequest};
use crate::types::{
    AuditEvent, EventRecord, ItemKey, Order, WhereExpr, DEFAULT_NAMESPACE, SESSION_END_EVENT,
};
use crate::utils::{format_date, retry_transient};

use super::config::AuditLogConfig;
use super::migration::{convert_fields_to_map, migrate_date_attribute, MigrationReport};

/// Audit event storage over a `Store`
pub struct AuditLog<S: ?Sized> {
    config: AuditLogConfig,
    store: Arc<S>,
    cancel: CancellationToken,
}

impl<S: ?Sized> Clone for AuditLog<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            cancel: self.cancel.clone(),
        }
    }
}

impl<S> AuditLog<S>
where
    S: Store + ?Sized,
{
    /// Create an audit log, validating the configuration
    pub fn new(config: AuditLogConfig, store: Arc<S>) -> AuditResult<Self> {
        config.validate()?;
        info!(
            table = %config.table_name,
            index = %config.index_name,
            "Audit log ready"
        );
        Ok(Self {
            config,
            store,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &AuditLogConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Stop in-flight searches and migrations at their next store request
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Build the stored form of an event, filling in what the caller left out
    fn to_record(&self, event: &AuditEvent) -> AuditResult<EventRecord> {
        if event.event_type.is_empty() {
            return Err(AuditError::BadParameter("event type is empty".to_string()));
        }

        let now = self.config.clock.now();
        let created_at = event.time.unwrap_or(now).timestamp();
        let created_at_date = format_date(created_at).ok_or_else(|| {
            AuditError::BadParameter(format!("event time {} is out of range", created_at))
        })?;

        let expires = match self.config.retention_period {
            Some(period) => {
                let period = chrono::Duration::from_std(period).map_err(|e| {
                    AuditError::BadParameter(format!("retention period: {}", e))
                })?;
                Some((now + period).timestamp())
            }
            None => None,
        };

        Ok(EventRecord {
            session_id: if event.session_id.is_empty() {
                self.config.uid.new_id()
            } else {
                event.session_id.clone()
            },
            event_index: event.index,
            event_type: event.event_type.clone(),
            created_at,
            created_at_date: Some(created_at_date),
            event_namespace: if event.namespace.is_empty() {
                DEFAULT_NAMESPACE.to_string()
            } else {
                event.namespace.clone()
            },
            fields_map: Some(event.fields.clone()),
            fields: None,
            expires,
        })
    }

    /// Persist one audit event
    pub async fn emit_audit_event(&self, event: &AuditEvent) -> AuditResult<()> {
        let record = self.to_record(event)?;
        let item = record.to_item()?;

        retry_transient(&self.config.retry, "emit audit event", &self.cancel, || {
            self.store.put(item.clone())
        })
        .await
        .with_context(|| format!("emit event {}", record.key()))
    }

    /// One page of raw records matching `request`
    pub async fn search_events_raw(&self, request: &SearchRequest) -> AuditResult<SearchPage> {
        let settings = self.config.search_settings();
        let page = retry_transient(&self.config.retry, "search events", &self.cancel, || {
            query::search_events_raw(self.store.as_ref(), &settings, request, &self.cancel)
        })
        .await?;

        info!(
            from = %request.from,
            to = %request.to,
            events = page.events.len(),
            more = !page.is_last(),
            "Searched audit events"
        );
        Ok(page)
    }

    /// One page of events of the given types in `[from, to]`
    ///
    /// `namespace: None` searches every namespace and an empty `event_types`
    /// matches every type. `limit == 0` returns as many events as fit in one
    /// response. Pass the returned checkpoint back as `start_key` for the
    /// next page; it is empty once the search is exhausted.
    #[allow(clippy::too_many_arguments)]
    pub async fn search_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        namespace: Option<&str>,
        event_types: &[String],
        limit: usize,
        order: Order,
        start_key: &str,
    ) -> AuditResult<(Vec<AuditEvent>, String)> {
        let request = SearchRequest {
            from,
            to,
            namespace: namespace.map(str::to_string),
            filter: SearchFilter {
                event_types: event_types.to_vec(),
                condition: None,
            },
            limit,
            order,
            start_key: start_key.to_string(),
        };
        self.search_events_page(&request).await
    }

    /// One page of session end events in the default namespace, optionally
    /// narrowed by a predicate over their fields
    pub async fn search_session_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
        order: Order,
        start_key: &str,
        condition: Option<WhereExpr>,
    ) -> AuditResult<(Vec<AuditEvent>, String)> {
        let request = SearchRequest {
            from,
            to,
            namespace: Some(DEFAULT_NAMESPACE.to_string()),
            filter: SearchFilter {
                event_types: vec![SESSION_END_EVENT.to_string()],
                condition,
            },
            limit,
            order,
            start_key: start_key.to_string(),
        };
        self.search_events_page(&request).await
    }

    async fn search_events_page(
        &self,
        request: &SearchRequest,
    ) -> AuditResult<(Vec<AuditEvent>, String)> {
        let page = self.search_events_raw(request).await?;
        let events = page
            .events
            .iter()
            .map(AuditEvent::from_record)
            .collect::<AuditResult<Vec<_>>>()?;
        Ok((events, page.checkpoint))
    }

    /// Bring every stored record up to the current schema
    ///
    /// Runs the date backfill, then the payload conversion. Each is retried
    /// as a whole on transient failures, which is safe because both only
    /// rewrite records that still need it.
    pub async fn migrate(&self) -> AuditResult<Vec<MigrationReport>> {
        let options = self.config.migration_options();
        let store = self.store.as_ref();

        let dates = retry_transient(&self.config.retry, "date attribute migration", &self.cancel, || {
            migrate_date_attribute(store, &options, &self.cancel)
        })
        .await?;
        let fields = retry_transient(&self.config.retry, "fields map migration", &self.cancel, || {
            convert_fields_to_map(store, &options, &self.cancel)
        })
        .await?;

        Ok(vec![dates, fields])
    }

    /// Whether `index` exists on `table`
    pub async fn index_exists(&self, table: &str, index: &str) -> AuditResult<bool> {
        retry_transient(&self.config.retry, "describe table", &self.cancel, || {
            self.store.index_exists(table, index)
        })
        .await
    }

    /// Delete every item of the table, returning how many were removed
    ///
    /// Works one scan page at a time; every scan and batch delete runs under
    /// the retry policy.
    pub async fn delete_all_items(&self) -> AuditResult<usize> {
        let page_size = self.config.scan_page_size;
        let mut start: Option<ContinuationToken> = None;
        let mut deleted = 0;

        loop {
            let page = retry_transient(&self.config.retry, "scan table", &self.cancel, || {
                self.store.scan(page_size, start.as_ref())
            })
            .await
            .context("delete all items")?;
            let keys: Vec<ItemKey> = page.items.iter().filter_map(ItemKey::from_item).collect();

            for batch in keys.chunks(MAX_BATCH_SIZE) {
                retry_transient(&self.config.retry, "batch delete", &self.cancel, || {
                    self.store.delete(batch)
                })
                .await?;
            }
            deleted += keys.len();
            debug!(deleted, "Deleted scan page");

            match page.next {
                Some(next) => start = Some(next),
                None => break,
            }
        }

        info!(table = %self.config.table_name, deleted, "Deleted all items");
        Ok(deleted)
    }
}

impl<S> AuditLog<S>
where
    S: Store + 'static,
{
    /// Run `migrate` on the runtime without waiting for it
    ///
    /// `close()` stops the migration between pages.
    pub fn start_background_migration(&self) -> JoinHandle<AuditResult<Vec<MigrationReport>>> {
        let log = self.clone();
        tokio::spawn(async move {
            let result = log.migrate().await;
            match &result {
                Ok(reports) => {
                    for report in reports {
                        info!(
                            migration = report.migration,
                            completed = report.completed,
                            migrated = report.migrated,
                            "Background migration done"
                        );
                    }
                }
                Err(e) => error!(error = %e, "Background migration failed"),
            }
            result
        })
    }
}
