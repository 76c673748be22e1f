//! Data types for audit event storage
//!
//! This module contains the stored record, the caller-facing event and the
//! search predicate tree.

mod event;
mod predicate;

pub use event::{
    attr, AuditEvent, EventFields, EventRecord, Item, ItemKey, Order, DEFAULT_NAMESPACE,
    SESSION_END_EVENT,
};
pub use predicate::WhereExpr;
