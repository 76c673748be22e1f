//! Unique identifier generation

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Generator of session identifiers for events emitted without one.
pub trait UidGenerator: Send + Sync {
    fn new_id(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomUid;

impl UidGenerator for RandomUid {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Sequential UUID-shaped identifiers for tests
#[derive(Debug, Default)]
pub struct FakeUid {
    counter: AtomicU64,
}

impl FakeUid {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UidGenerator for FakeUid {
    fn new_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Uuid::from_u128(n as u128).to_string()
    }
}
