//! Audit log configuration

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{DEFAULT_MAX_PAGE_BYTES, TIME_SEARCH_INDEX};
use crate::error::{AuditError, AuditResult};
use crate::query::SearchSettings;
use crate::utils::{Clock, RandomUid, RetryPolicy, SystemClock, UidGenerator};

use super::migration::MigrationOptions;

/// Configuration for the AuditLog
#[derive(Clone)]
pub struct AuditLogConfig {
    /// Table holding the audit events
    pub table_name: String,
    /// Time search index (`CreatedAtDate`, `CreatedAt`)
    pub index_name: String,
    /// How long events live; sets `Expires` on emission
    pub retention_period: Option<Duration>,
    /// Byte budget of one page of search results
    pub max_response_bytes: usize,
    /// Cap on items evaluated per store query
    pub query_page_limit: Option<usize>,
    /// Items per scan page during migrations and bulk deletes
    pub scan_page_size: usize,
    /// Concurrent rewrites during migrations
    pub migration_workers: usize,
    pub retry: RetryPolicy,
    pub clock: Arc<dyn Clock>,
    pub uid: Arc<dyn UidGenerator>,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            table_name: "audit-events".to_string(),
            index_name: TIME_SEARCH_INDEX.to_string(),
            retention_period: None,
            max_response_bytes: DEFAULT_MAX_PAGE_BYTES,
            query_page_limit: None,
            scan_page_size: 100,
            migration_workers: 16,
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            uid: Arc::new(RandomUid),
        }
    }
}

impl fmt::Debug for AuditLogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLogConfig")
            .field("table_name", &self.table_name)
            .field("index_name", &self.index_name)
            .field("retention_period", &self.retention_period)
            .field("max_response_bytes", &self.max_response_bytes)
            .field("query_page_limit", &self.query_page_limit)
            .field("scan_page_size", &self.scan_page_size)
            .field("migration_workers", &self.migration_workers)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl AuditLogConfig {
    /// Create config for a given table
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `AUDIT_*` environment variables
    pub fn from_env() -> AuditResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `AUDIT_*` keys
    pub fn from_lookup<F>(lookup: F) -> AuditResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(table) = lookup("AUDIT_TABLE_NAME") {
            config.table_name = table;
        }
        if let Some(index) = lookup("AUDIT_INDEX_NAME") {
            config.index_name = index;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "AUDIT_RETENTION_SECS")? {
            config.retention_period = Some(Duration::from_secs(secs));
        }
        if let Some(bytes) = parse_var(&lookup, "AUDIT_MAX_RESPONSE_BYTES")? {
            config.max_response_bytes = bytes;
        }
        if let Some(workers) = parse_var(&lookup, "AUDIT_MIGRATION_WORKERS")? {
            config.migration_workers = workers;
        }
        if let Some(attempts) = parse_var(&lookup, "AUDIT_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(millis) = parse_var::<u64, _>(&lookup, "AUDIT_RETRY_DELAY_MS")? {
            config.retry.delay = Duration::from_millis(millis);
        }

        Ok(config)
    }

    pub fn with_index_name(mut self, index_name: impl Into<String>) -> Self {
        self.index_name = index_name.into();
        self
    }

    pub fn with_retention_period(mut self, period: Duration) -> Self {
        self.retention_period = Some(period);
        self
    }

    pub fn with_max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = bytes;
        self
    }

    pub fn with_query_page_limit(mut self, limit: usize) -> Self {
        self.query_page_limit = Some(limit);
        self
    }

    pub fn with_scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size;
        self
    }

    pub fn with_migration_workers(mut self, workers: usize) -> Self {
        self.migration_workers = workers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_uid_generator(mut self, uid: Arc<dyn UidGenerator>) -> Self {
        self.uid = uid;
        self
    }

    /// Check the values are usable
    pub fn validate(&self) -> AuditResult<()> {
        if self.table_name.is_empty() {
            return Err(AuditError::BadParameter("table name is empty".to_string()));
        }
        if self.index_name.is_empty() {
            return Err(AuditError::BadParameter("index name is empty".to_string()));
        }
        if self.max_response_bytes == 0 {
            return Err(AuditError::BadParameter(
                "max response bytes must be positive".to_string(),
            ));
        }
        if self.query_page_limit == Some(0) {
            return Err(AuditError::BadParameter(
                "query page limit must be positive".to_string(),
            ));
        }
        if self.scan_page_size == 0 {
            return Err(AuditError::BadParameter(
                "scan page size must be positive".to_string(),
            ));
        }
        if self.migration_workers == 0 {
            return Err(AuditError::BadParameter(
                "migration workers must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AuditError::BadParameter(
                "retry attempts must be positive".to_string(),
            ));
        }
        if let Some(period) = self.retention_period {
            if period.is_zero() || chrono::Duration::from_std(period).is_err() {
                return Err(AuditError::BadParameter(format!(
                    "retention period {:?} is out of range",
                    period
                )));
            }
        }
        Ok(())
    }

    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            index_name: self.index_name.clone(),
            max_response_bytes: self.max_response_bytes,
            query_page_limit: self.query_page_limit,
        }
    }

    pub fn migration_options(&self) -> MigrationOptions {
        MigrationOptions {
            page_size: self.scan_page_size,
            workers: self.migration_workers,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> AuditResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| AuditError::BadParameter(format!("{}={:?}: {}", key, raw, e))),
    }
}
