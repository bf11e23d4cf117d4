//! Proptest generators for property-based testing.

use proptest::prelude::*;

use peervault_core::{
    Record, RecordChanges, RecordId, StoredValue, Timestamp, Tombstone,
};

/// One of `pool` fixed record ids, so generated values collide on purpose.
pub fn record_id(pool: usize) -> impl Strategy<Value = RecordId> {
    let ids: Vec<RecordId> = (0..pool.max(1)).map(|_| RecordId::generate()).collect();
    proptest::sample::select(ids)
}

/// A plausible timestamp.
pub fn timestamp() -> impl Strategy<Value = Timestamp> {
    (0i64..1_000_000).prop_map(Timestamp::from_millis)
}

/// A short display field.
pub fn field() -> impl Strategy<Value = String> {
    "[A-Za-z0-9 ]{0,16}".prop_map(String::from)
}

/// A record with the given id.
pub fn record_with_id(id: RecordId) -> impl Strategy<Value = Record> {
    (field(), field(), field(), timestamp(), 0i64..1_000).prop_map(
        move |(title, username, secret, created_at, age)| {
            let mut record = Record::new(id, title, username, secret, created_at);
            record.updated_at = Timestamp::from_millis(created_at.as_millis() + age);
            record
        },
    )
}

/// Field overrides for an update.
pub fn changes() -> impl Strategy<Value = RecordChanges> {
    (
        proptest::option::of(field()),
        proptest::option::of(field()),
        proptest::option::of(field()),
    )
        .prop_map(|(title, username, secret)| RecordChanges {
            title,
            username,
            secret,
        })
}

/// A record or a tombstone for an id drawn from `pool` ids.
pub fn stored_value(pool: usize) -> impl Strategy<Value = StoredValue> {
    record_id(pool).prop_flat_map(|id| {
        prop_oneof![
            3 => record_with_id(id).prop_map(StoredValue::Record),
            1 => timestamp().prop_map(move |deleted_at| {
                StoredValue::Tombstone(Tombstone { id, deleted_at })
            }),
        ]
    })
}

/// Per-device write histories: `devices` lists of values over `pool` ids.
pub fn histories(devices: usize, pool: usize) -> impl Strategy<Value = Vec<Vec<StoredValue>>> {
    proptest::collection::vec(proptest::collection::vec(stored_value(pool), 0..8), devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn updated_at_never_precedes_created_at(record in record_id(4).prop_flat_map(record_with_id)) {
            prop_assert!(record.updated_at >= record.created_at);
        }

        #[test]
        fn changes_keep_identity(
            record in record_id(1).prop_flat_map(record_with_id),
            changes in changes(),
            now in timestamp(),
        ) {
            let next = record.with_changes(&changes, now);
            prop_assert_eq!(next.id, record.id);
            prop_assert_eq!(next.created_at, record.created_at);
            prop_assert_eq!(next.updated_at, now);
        }
    }
}
