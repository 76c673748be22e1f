//! Audit Events
//!
//! Storage layer for security audit events kept in a DynamoDB-style
//! key-value table with a time search index partitioned by day.
//!
//! # Features
//!
//! - **Predicate Compiler**: turns `WhereExpr` trees into native filter
//!   expressions with placeholder bindings
//! - **Day Partitions**: time ranges expand into `YYYY-MM-DD` partitions
//! - **Resumable Pagination**: opaque checkpoints that resume exactly where
//!   the previous page stopped, bounded by count and response size
//! - **Schema Migrations**: in-place backfill of `CreatedAtDate` and
//!   conversion of legacy `Fields` payloads
//! - **Retries**: transient store failures are retried with a fixed delay
//!
//! # Modules
//!
//! - `types`: stored records, caller events, the predicate tree
//! - `backend`: the `Store` trait and the in-memory `MemoryStore`
//! - `query`: predicate compiler, day planner, checkpoints, pagination
//! - `event_store`: the `AuditLog` facade, its config and the migrations
//! - `utils`: clock, id generator, retry policy
//! - `error`: `AuditError` and `AuditResult`
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use audit_events::{AuditEvent, AuditLog, AuditLogConfig, MemoryStore, Order};
//! use chrono::{Duration, Utc};
//!
//! #[tokio::main]
//! async fn main() -> audit_events::AuditResult<()> {
//!     let store = Arc::new(MemoryStore::new("audit-events"));
//!     let log = AuditLog::new(AuditLogConfig::default(), store)?;
//!
//!     log.emit_audit_event(&AuditEvent::new("user.login").with_field("user", "bob"))
//!         .await?;
//!
//!     let now = Utc::now();
//!     let (events, checkpoint) = log
//!         .search_events(now - Duration::hours(1), now, None, &[], 100, Order::Ascending, "")
//!         .await?;
//!     println!("{} events, more: {}", events.len(), !checkpoint.is_empty());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod event_store;
pub mod query;
pub mod types;
pub mod utils;

// Re-export commonly used items at crate root
pub use backend::{MemoryStore, Store};
pub use error::{AuditError, AuditResult};
pub use event_store::{AuditLog, AuditLogConfig, MigrationReport};
pub use query::{SearchPage, SearchRequest};
pub use types::{AuditEvent, EventRecord, ItemKey, Order, WhereExpr};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
