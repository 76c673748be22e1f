//! Search over the time index
//!
//! - `condition`: compiles `WhereExpr` trees into native filter expressions
//! - `days`: expands a time range into day partitions
//! - `checkpoint`: the opaque resume token
//! - `search`: the pagination engine tying them together

pub mod checkpoint;
pub mod condition;
pub mod days;
pub mod search;

pub use checkpoint::Checkpoint;
pub use condition::{build_filter, compile, CondFilterParams, PAYLOAD_ROOT};
pub use days::days_between;
pub use search::{search_events_raw, SearchFilter, SearchPage, SearchRequest, SearchSettings};
