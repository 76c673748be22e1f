//! Migration engine
//!
//! Rewrites records written by older versions of the schema, in place:
//! 1. `migrate_date_attribute` backfills `CreatedAtDate` from `CreatedAt`
//! 2. `convert_fields_to_map` replaces the JSON string `Fields` with the
//!    structured `FieldsMap`
//!
//! Both scan the whole table and touch only records that need it, so they can
//! be re-run at any time. A record that cannot be converted is reported and
//! left alone; the scan goes on.
//!
//! Records are changed with conditional in-place updates naming only the
//! attributes a migration owns. The condition pins the state seen by the
//! scan, so a record that was deleted or already rewritten by a concurrent
//! writer is skipped rather than clobbered with the stale copy.

use std::collections::BTreeMap;

use futures::{pin_mut, stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{scan_pages, ItemUpdate, Store};
use crate::error::{AuditError, AuditResult, ResultExt};
use crate::types::{attr, EventRecord, Item, ItemKey};

/// Tuning for a migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Items requested per scan page
    pub page_size: usize,
    /// Maximum rewrites in flight
    pub workers: usize,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            workers: 16,
        }
    }
}

/// A record the migration could not convert
#[derive(Debug)]
pub struct MigrationFailure {
    /// `None` when the item does not even carry a primary key
    pub key: Option<ItemKey>,
    pub error: AuditError,
}

/// Outcome of one migration run
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub migration: &'static str,
    pub scanned: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub failures: Vec<MigrationFailure>,
    /// `false` when the run was cancelled before the end of the table
    pub completed: bool,
}

impl MigrationReport {
    fn new(migration: &'static str) -> Self {
        Self {
            migration,
            ..Default::default()
        }
    }
}

enum Rewrite {
    Unchanged,
    Update(ItemUpdate),
    Failed(MigrationFailure),
}

fn decode(item: &Item) -> Result<EventRecord, Rewrite> {
    EventRecord::from_item(item).map_err(|error| {
        Rewrite::Failed(MigrationFailure {
            key: ItemKey::from_item(item),
            error,
        })
    })
}

fn backfill_date(item: &Item) -> Rewrite {
    let record = match decode(item) {
        Ok(record) => record,
        Err(failed) => return failed,
    };
    if record.is_date_migrated() {
        return Rewrite::Unchanged;
    }
    let Some(date) = record.expected_date() else {
        return Rewrite::Failed(MigrationFailure {
            key: Some(record.key()),
            error: AuditError::BadParameter(format!(
                "CreatedAt {} is not a valid timestamp",
                record.created_at
            )),
        });
    };

    let update = ItemUpdate::new(record.key())
        .set(attr::CREATED_AT_DATE, Value::String(date))
        .when(
            format!("{} = :createdAt", attr::CREATED_AT),
            BTreeMap::from([(":createdAt".to_string(), Value::from(record.created_at))]),
        );
    Rewrite::Update(update)
}

fn fields_to_map(item: &Item) -> Rewrite {
    let record = match decode(item) {
        Ok(record) => record,
        Err(failed) => return failed,
    };
    let Some(raw) = &record.fields else {
        return Rewrite::Unchanged;
    };

    let update = ItemUpdate::new(record.key()).remove(attr::FIELDS);

    // An existing FieldsMap is authoritative; only the legacy copy goes.
    if record.fields_map.is_some() {
        return Rewrite::Update(update.when(
            format!("attribute_exists({})", attr::FIELDS_MAP),
            BTreeMap::new(),
        ));
    }

    match record.parse_legacy_fields(raw) {
        Ok(map) => Rewrite::Update(
            update.set(attr::FIELDS_MAP, Value::Object(map)).when(
                format!(
                    "attribute_not_exists({}) AND {} = :legacyFields",
                    attr::FIELDS_MAP,
                    attr::FIELDS
                ),
                BTreeMap::from([(":legacyFields".to_string(), Value::String(raw.clone()))]),
            ),
        ),
        Err(error) => Rewrite::Failed(MigrationFailure {
            key: Some(record.key()),
            error,
        }),
    }
}

async fn run<S, F>(
    store: &S,
    migration: &'static str,
    options: &MigrationOptions,
    cancel: &CancellationToken,
    rewrite: F,
) -> AuditResult<MigrationReport>
where
    S: Store + ?Sized,
    F: Fn(&Item) -> Rewrite,
{
    info!(migration, "Starting migration");
    let mut report = MigrationReport::new(migration);

    let pages = scan_pages(store, options.page_size.max(1));
    pin_mut!(pages);

    loop {
        if cancel.is_cancelled() {
            warn!(
                migration,
                scanned = report.scanned,
                migrated = report.migrated,
                "Migration cancelled"
            );
            return Ok(report);
        }

        let Some(page) = pages.next().await else {
            break;
        };
        let page = page.with_context(|| format!("{} scan", migration))?;

        let mut updates = Vec::new();
        for item in &page {
            report.scanned += 1;
            match rewrite(item) {
                Rewrite::Unchanged => report.skipped += 1,
                Rewrite::Update(update) => updates.push(update),
                Rewrite::Failed(failure) => {
                    warn!(
                        migration,
                        key = ?failure.key,
                        error = %failure.error,
                        "Skipping record that cannot be migrated"
                    );
                    report.failures.push(failure);
                }
            }
        }

        let results: Vec<(ItemKey, AuditResult<bool>)> = stream::iter(updates)
            .map(|update| async move { (update.key.clone(), store.update(&update).await) })
            .buffer_unordered(options.workers.max(1))
            .collect()
            .await;
        for (key, result) in results {
            if result.with_context(|| format!("{} write", migration))? {
                report.migrated += 1;
            } else {
                debug!(migration, %key, "Record changed since the scan, leaving it");
                report.skipped += 1;
            }
        }
        debug!(migration, scanned = report.scanned, migrated = report.migrated, "Migrated page");
    }

    report.completed = true;
    info!(
        migration,
        scanned = report.scanned,
        migrated = report.migrated,
        skipped = report.skipped,
        failures = report.failures.len(),
        "Migration finished"
    );
    Ok(report)
}

/// Backfill `CreatedAtDate` on records where it is missing or disagrees
/// with `CreatedAt`.
pub async fn migrate_date_attribute<S>(
    store: &S,
    options: &MigrationOptions,
    cancel: &CancellationToken,
) -> AuditResult<MigrationReport>
where
    S: Store + ?Sized,
{
    run(store, "date attribute", options, cancel, backfill_date).await
}

/// Convert legacy JSON-string `Fields` payloads into `FieldsMap`.
pub async fn convert_fields_to_map<S>(
    store: &S,
    options: &MigrationOptions,
    cancel: &CancellationToken,
) -> AuditResult<MigrationReport>
where
    S: Store + ?Sized,
{
    run(store, "fields map", options, cancel, fields_to_map).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Fault, MemoryStore};
    use serde_json::json;

    fn legacy_item(index: i64, fields: Option<&str>) -> Item {
        let mut item = match json!({
            "SessionID": "legacy",
            "EventIndex": index,
            "EventType": "user.login",
            "CreatedAt": 1618041900 + index * 86400,
            "EventNamespace": "default",
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        if let Some(fields) = fields {
            item.insert("Fields".to_string(), json!(fields));
        }
        item
    }

    fn options() -> MigrationOptions {
        MigrationOptions {
            page_size: 3,
            workers: 4,
        }
    }

    #[tokio::test]
    async fn test_date_backfill() {
        let store = MemoryStore::new("events");
        for i in 0..7 {
            store.put(legacy_item(i, None)).await.unwrap();
        }
        let mut wrong = legacy_item(7, None);
        wrong.insert("CreatedAtDate".to_string(), json!("1999-01-01"));
        store.put(wrong).await.unwrap();

        let report = migrate_date_attribute(&store, &options(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.completed);
        assert_eq!(report.scanned, 8);
        assert_eq!(report.migrated, 8);
        assert!(report.failures.is_empty());

        let first = store.get(&ItemKey::new("legacy", 0)).unwrap();
        assert_eq!(first["CreatedAtDate"], json!("2021-04-10"));
        let fixed = store.get(&ItemKey::new("legacy", 7)).unwrap();
        assert_eq!(fixed["CreatedAtDate"], json!("2021-04-17"));
    }

    #[tokio::test]
    async fn test_second_run_writes_nothing() {
        let store = MemoryStore::new("events");
        for i in 0..5 {
            store.put(legacy_item(i, Some(r#"{"user":"bob"}"#))).await.unwrap();
        }
        let cancel = CancellationToken::new();

        migrate_date_attribute(&store, &options(), &cancel).await.unwrap();
        convert_fields_to_map(&store, &options(), &cancel).await.unwrap();
        let writes = store.write_count();

        let dates = migrate_date_attribute(&store, &options(), &cancel).await.unwrap();
        let fields = convert_fields_to_map(&store, &options(), &cancel).await.unwrap();

        assert_eq!(store.write_count(), writes);
        assert_eq!((dates.migrated, dates.skipped), (0, 5));
        assert_eq!((fields.migrated, fields.skipped), (0, 5));
    }

    #[tokio::test]
    async fn test_fields_conversion_and_failures() {
        let store = MemoryStore::new("events");
        store.put(legacy_item(0, Some(r#"{"user":"bob","code":"T1000I"}"#))).await.unwrap();
        store.put(legacy_item(1, Some("{not json"))).await.unwrap();

        let mut both = legacy_item(2, Some(r#"{"user":"stale"}"#));
        both.insert("FieldsMap".to_string(), json!({"user": "fresh"}));
        store.put(both).await.unwrap();

        let mut keyless = legacy_item(3, None);
        keyless.remove("EventType");
        store.put(keyless).await.unwrap();

        let report = convert_fields_to_map(&store, &options(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.completed);
        assert_eq!(report.scanned, 4);
        assert_eq!(report.migrated, 2);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().any(|f| matches!(
            f.error,
            AuditError::MalformedLegacyPayload { event_index: 1, .. }
        )));

        let converted = store.get(&ItemKey::new("legacy", 0)).unwrap();
        assert_eq!(converted["FieldsMap"], json!({"user": "bob", "code": "T1000I"}));
        assert!(!converted.contains_key("Fields"));

        let kept = store.get(&ItemKey::new("legacy", 2)).unwrap();
        assert_eq!(kept["FieldsMap"], json!({"user": "fresh"}));
        assert!(!kept.contains_key("Fields"));

        let broken = store.get(&ItemKey::new("legacy", 1)).unwrap();
        assert_eq!(broken["Fields"], json!("{not json"));
    }

    #[tokio::test]
    async fn test_conditions_pin_the_scanned_state() {
        let cancel = CancellationToken::new();
        let store = MemoryStore::new("events");
        store.put(legacy_item(0, Some(r#"{"user":"bob"}"#))).await.unwrap();

        let Rewrite::Update(stale) = fields_to_map(&store.get(&ItemKey::new("legacy", 0)).unwrap())
        else {
            panic!("expected an update");
        };
        convert_fields_to_map(&store, &options(), &cancel).await.unwrap();

        // Replaying the update built from the old copy must not apply again.
        assert!(!store.update(&stale).await.unwrap());

        let Rewrite::Update(backfill) = backfill_date(&legacy_item(1, None)) else {
            panic!("expected an update");
        };
        assert!(!store.update(&backfill).await.unwrap());
        assert!(store.get(&ItemKey::new("legacy", 1)).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_run_is_incomplete() {
        let store = MemoryStore::new("events");
        store.put(legacy_item(0, None)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = migrate_date_attribute(&store, &options(), &cancel).await.unwrap();

        assert!(!report.completed);
        assert_eq!(report.scanned, 0);
        assert!(!store.get(&ItemKey::new("legacy", 0)).unwrap().contains_key("CreatedAtDate"));
    }

    #[tokio::test]
    async fn test_store_errors_abort_the_run() {
        let store = MemoryStore::new("events");
        store.put(legacy_item(0, None)).await.unwrap();
        store.inject_faults(Fault::Unavailable, 1);

        let err = migrate_date_attribute(&store, &options(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(err.to_string().starts_with("date attribute scan"));
    }
}
