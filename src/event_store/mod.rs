//! Event Store Module for audit events
//!
//! This module provides the caller-facing side of audit event storage:
//! - `AuditLog`: emits events, serves paginated searches, runs admin probes
//! - `AuditLogConfig`: table names, budgets, retry policy, injected clock/uid
//! - migrations that bring older records up to the current schema
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//! ┌─────────┐    ┌──────────────────┐    ┌──────────────┐
//! │ Caller  │───►│ emit_audit_event │───►│ Store::put   │
//! │         │    │ date, id, expiry │    │ (retried)    │
//! └─────────┘    └──────────────────┘    └──────────────┘
//!
//! Read Path:
//! ┌─────────┐    ┌──────────────────┐    ┌──────────────────┐
//! │ Caller  │───►│ search_events    │───►│ one query per    │───► page + checkpoint
//! │         │    │ (retried)        │    │ day partition    │
//! └─────────┘    └──────────────────┘    └──────────────────┘
//!
//! Startup:
//! ┌─────────────────────────┐    ┌──────────────────────┐
//! │ migrate_date_attribute  │───►│ convert_fields_to_map│───► Ready!
//! └─────────────────────────┘    └──────────────────────┘
//! ```

mod config;
mod log;
mod migration;

pub use config::AuditLogConfig;
pub use log::AuditLog;
pub use migration::{
    convert_fields_to_map, migrate_date_attribute, MigrationFailure, MigrationOptions,
    MigrationReport,
};
