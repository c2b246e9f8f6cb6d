// ABOUTME: Integration tests for the synchronizer against the in-memory backend
// ABOUTME: Covers scoped reconciliation, skip flags, field restriction and idempotence

use std::collections::HashSet;

use record_sync::storage::OperationKind;
use record_sync::{
    compare, sync, CompareOptions, Filter, MemoryStorage, Record, Schema, SyncError, SyncOptions,
    Value,
};

const COMPANY_A: i64 = 1;
const COMPANY_B: i64 = 2;

fn employees() -> Schema {
    Schema::new("employees", "id", ["company_id", "name", "age"]).unwrap()
}

fn employee(company: i64, name: &str, age: i64) -> Record {
    Record::new()
        .with("company_id", company)
        .with("name", name)
        .with("age", age)
}

fn scope(company: i64) -> Filter {
    Filter::eq("company_id", company)
}

fn options() -> SyncOptions {
    SyncOptions::new(CompareOptions::new(["company_id", "name"]))
}

fn keep_removed() -> SyncOptions {
    SyncOptions {
        skip_deletes: true,
        ..options()
    }
}

/// Scott(40), Isaac(9), Zoe(9) at company A and Bob(25) at company B.
fn seeded() -> (MemoryStorage, Schema) {
    let storage = MemoryStorage::new();
    let schema = employees();
    for record in [
        employee(COMPANY_A, "Scott", 40),
        employee(COMPANY_A, "Isaac", 9),
        employee(COMPANY_A, "Zoe", 9),
        employee(COMPANY_B, "Bob", 25),
    ] {
        storage.insert_row(&schema, record).unwrap();
    }
    (storage, schema)
}

fn snapshot() -> Vec<Record> {
    vec![
        employee(COMPANY_A, "Scott", 41),
        employee(COMPANY_A, "Isaac", 9),
        employee(COMPANY_A, "Newguy", 10),
        employee(COMPANY_A, "Bob", 50),
    ]
}

fn names(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .map(|r| match r.value("name") {
            Value::Text(name) => name.clone(),
            other => other.to_string(),
        })
        .collect()
}

fn find(storage: &MemoryStorage, schema: &Schema, company: i64, name: &str) -> Option<Record> {
    let filter = scope(company).and(Filter::eq("name", name));
    storage.rows(schema, Some(&filter)).into_iter().next()
}

#[tokio::test]
async fn test_scoped_sync_full_scenario() {
    let (storage, schema) = seeded();

    let outcome = sync(&storage, &schema, snapshot(), Some(&scope(COMPANY_A)), &options())
        .await
        .unwrap();
    let groups = &outcome.classification;

    assert_eq!(outcome.stats.created, 2);
    assert_eq!(outcome.stats.updated, 1);
    assert_eq!(outcome.stats.deleted, 1);

    assert_eq!(names(&groups.added), vec!["Newguy", "Bob"]);
    assert_eq!(names(&groups.removed), vec!["Zoe"]);
    let updated: Vec<&Record> = groups.updated.iter().map(|m| &m.new).collect();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].value("name"), &Value::from("Scott"));
    let unchanged: Vec<&Record> = groups.unchanged.iter().map(|m| &m.new).collect();
    assert_eq!(unchanged.len(), 1);
    assert_eq!(unchanged[0].value("name"), &Value::from("Isaac"));

    let (record, changes) = groups.updated_details().next().unwrap();
    assert_eq!(record.value("name"), &Value::from("Scott"));
    let age = changes.get("age").unwrap();
    assert_eq!((age.old.clone(), age.new.clone()), (Value::Int(40), Value::Int(41)));
    assert_eq!(changes.len(), 1);

    assert_eq!(storage.count(&schema, Some(&scope(COMPANY_A))), 4);
    assert_eq!(storage.count(&schema, Some(&scope(COMPANY_B))), 1);
    assert_eq!(
        find(&storage, &schema, COMPANY_A, "Scott").unwrap().value("age"),
        &Value::Int(41)
    );
    assert!(find(&storage, &schema, COMPANY_A, "Zoe").is_none());

    let bob_b = find(&storage, &schema, COMPANY_B, "Bob").unwrap();
    assert_eq!(bob_b.value("age"), &Value::Int(25));
}

#[tokio::test]
async fn test_added_records_receive_storage_identities() {
    let (storage, schema) = seeded();

    let outcome = sync(&storage, &schema, snapshot(), Some(&scope(COMPANY_A)), &options())
        .await
        .unwrap();

    for added in &outcome.classification.added {
        let id = added.id.expect("added record should carry its identity");
        let stored = storage.get("employees", id).unwrap();
        assert_eq!(stored.value("name"), added.value("name"));
    }
}

#[tokio::test]
async fn test_preassigned_identity_collision_is_constraint_violation() {
    let (storage, schema) = seeded();
    let bob_b = find(&storage, &schema, COMPANY_B, "Bob").unwrap();

    let mut newcomer = employee(COMPANY_A, "Newguy", 10);
    newcomer.id = bob_b.id;

    let err = sync(
        &storage,
        &schema,
        vec![newcomer.clone()],
        Some(&scope(COMPANY_A)),
        &keep_removed(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SyncError::Constraint(_)));
    assert!(find(&storage, &schema, COMPANY_A, "Newguy").is_none());

    newcomer.id = Some(100);
    let outcome = sync(
        &storage,
        &schema,
        vec![newcomer],
        Some(&scope(COMPANY_A)),
        &keep_removed(),
    )
    .await
    .unwrap();
    assert_eq!(outcome.stats.created, 1);
    assert_eq!(outcome.classification.added[0].id, Some(100));
    let stored = storage.get("employees", 100).unwrap();
    assert_eq!(stored.value("name"), &Value::from("Newguy"));
}

#[tokio::test]
async fn test_restricted_fields_leave_other_columns_untouched() {
    let (storage, schema) = seeded();
    let scott = find(&storage, &schema, COMPANY_A, "Scott").unwrap();
    let options = SyncOptions::new(CompareOptions::new(["name"]).restrict(["age"]));
    let only_scott = Filter::eq("name", "Scott");

    // Differs only in the relation field: unchanged, nothing written.
    let outcome = sync(
        &storage,
        &schema,
        vec![employee(COMPANY_B, "Scott", 40)],
        Some(&only_scott),
        &options,
    )
    .await
    .unwrap();
    assert_eq!(outcome.classification.unchanged.len(), 1);
    assert_eq!(outcome.stats.updated, 0);

    // Differs in age and relation: only age is written.
    let outcome = sync(
        &storage,
        &schema,
        vec![employee(COMPANY_B, "Scott", 41)],
        Some(&only_scott),
        &options,
    )
    .await
    .unwrap();
    assert_eq!(outcome.stats.updated, 1);
    let changes = &outcome.classification.updated[0].changes;
    assert_eq!(changes.fields().collect::<Vec<_>>(), vec!["age"]);

    let stored = storage.get("employees", scott.id.unwrap()).unwrap();
    assert_eq!(stored.value("age"), &Value::Int(41));
    assert_eq!(stored.value("company_id"), &Value::Int(COMPANY_A));

    let update = storage
        .operations()
        .into_iter()
        .find(|op| op.kind == OperationKind::Update)
        .unwrap();
    assert_eq!(update.fields, vec!["age"]);
}

#[tokio::test]
async fn test_skip_deletes_keeps_stale_records() {
    let (storage, schema) = seeded();
    let mut options = options();
    options.skip_deletes = true;

    let outcome = sync(&storage, &schema, snapshot(), Some(&scope(COMPANY_A)), &options)
        .await
        .unwrap();

    assert_eq!(outcome.stats.deleted, 0);
    assert_eq!(names(&outcome.classification.removed), vec!["Zoe"]);
    assert!(find(&storage, &schema, COMPANY_A, "Zoe").is_some());
    assert_eq!(storage.count(&schema, Some(&scope(COMPANY_A))), 5);
}

#[tokio::test]
async fn test_skip_creates_and_deletes_only_updates() {
    let (storage, schema) = seeded();
    let mut options = options();
    options.skip_creates = true;
    options.skip_deletes = true;

    let outcome = sync(&storage, &schema, snapshot(), Some(&scope(COMPANY_A)), &options)
        .await
        .unwrap();

    assert_eq!(outcome.stats.created, 0);
    assert_eq!(outcome.stats.deleted, 0);
    assert_eq!(outcome.stats.updated, 1);
    assert_eq!(storage.count(&schema, Some(&scope(COMPANY_A))), 3);
    assert!(find(&storage, &schema, COMPANY_A, "Newguy").is_none());

    let kinds: Vec<OperationKind> = storage.operations().iter().map(|op| op.kind).collect();
    assert_eq!(kinds, vec![OperationKind::Load, OperationKind::Update]);
}

#[tokio::test]
async fn test_skip_updates_leaves_stored_values() {
    let (storage, schema) = seeded();
    let mut options = options();
    options.skip_updates = true;

    let outcome = sync(&storage, &schema, snapshot(), Some(&scope(COMPANY_A)), &options)
        .await
        .unwrap();

    assert_eq!(outcome.stats.updated, 0);
    assert_eq!(outcome.classification.updated.len(), 1);
    assert_eq!(
        find(&storage, &schema, COMPANY_A, "Scott").unwrap().value("age"),
        &Value::Int(40)
    );
}

#[tokio::test]
async fn test_skip_flags_do_not_change_groups() {
    let baseline = {
        let (storage, schema) = seeded();
        sync(&storage, &schema, snapshot(), Some(&scope(COMPANY_A)), &options())
            .await
            .unwrap()
            .classification
            .counts()
    };

    for flags in [(true, false, false), (false, true, false), (false, false, true), (true, true, true)] {
        let (storage, schema) = seeded();
        let mut options = options();
        (options.skip_creates, options.skip_updates, options.skip_deletes) = flags;

        let outcome = sync(&storage, &schema, snapshot(), Some(&scope(COMPANY_A)), &options)
            .await
            .unwrap();
        assert_eq!(outcome.classification.counts(), baseline, "flags {:?}", flags);
    }
}

#[tokio::test]
async fn test_second_sync_is_idempotent() {
    let (storage, schema) = seeded();

    sync(&storage, &schema, snapshot(), Some(&scope(COMPANY_A)), &options())
        .await
        .unwrap();
    let second = sync(&storage, &schema, snapshot(), Some(&scope(COMPANY_A)), &options())
        .await
        .unwrap();

    assert_eq!(second.stats.total(), 0);
    assert!(second.classification.is_empty());
    assert_eq!(second.classification.unchanged.len(), 4);
}

#[tokio::test]
async fn test_ignored_fields_never_split_updated_and_unchanged() {
    let (storage, schema) = seeded();
    let options = SyncOptions::new(CompareOptions::new(["company_id", "name"]).ignore(["age"]));

    let outcome = sync(&storage, &schema, snapshot(), Some(&scope(COMPANY_A)), &options)
        .await
        .unwrap();

    assert!(outcome.classification.updated.is_empty());
    assert_eq!(outcome.classification.unchanged.len(), 2);
    assert!(outcome
        .classification
        .updated_details()
        .all(|(_, changes)| changes.get("age").is_none()));
    assert_eq!(
        find(&storage, &schema, COMPANY_A, "Scott").unwrap().value("age"),
        &Value::Int(40)
    );
}

#[tokio::test]
async fn test_groups_partition_both_collections() {
    let (storage, schema) = seeded();
    let old = storage.rows(&schema, Some(&scope(COMPANY_A)));
    let new = snapshot();

    let groups = compare(&schema, old.clone(), new.clone(), &options().compare).unwrap();
    let key = |r: &Record| (r.value("company_id").clone(), r.value("name").clone());

    let new_side: HashSet<_> = groups
        .added
        .iter()
        .chain(groups.updated.iter().map(|m| &m.new))
        .chain(groups.unchanged.iter().map(|m| &m.new))
        .map(key)
        .collect();
    let old_side: HashSet<_> = groups
        .removed
        .iter()
        .chain(groups.updated.iter().map(|m| &m.old))
        .chain(groups.unchanged.iter().map(|m| &m.old))
        .map(key)
        .collect();

    assert_eq!(new_side, new.iter().map(key).collect::<HashSet<_>>());
    assert_eq!(old_side, old.iter().map(key).collect::<HashSet<_>>());
    let counts = groups.counts();
    assert_eq!(counts.added + counts.updated + counts.unchanged, new.len());
    assert_eq!(counts.removed + counts.updated + counts.unchanged, old.len());
}

#[tokio::test]
async fn test_batch_size_bounds_write_calls() {
    let storage = MemoryStorage::new();
    let schema = employees();
    let new: Vec<Record> = (0..5)
        .map(|i| employee(COMPANY_A, &format!("e{}", i), 30))
        .collect();
    let mut options = options();
    options.batch_size = Some(2);

    let outcome = sync(&storage, &schema, new, None, &options).await.unwrap();
    assert_eq!(outcome.stats.created, 5);

    let inserts: Vec<usize> = storage
        .operations()
        .iter()
        .filter(|op| op.kind == OperationKind::Insert)
        .map(|op| op.rows)
        .collect();
    assert_eq!(inserts, vec![2, 2, 1]);
}

#[tokio::test]
async fn test_unknown_key_field_fails_before_loading() {
    let (storage, schema) = seeded();
    storage.clear_operations();
    let options = SyncOptions::new(CompareOptions::new(["surname"]));

    let err = sync(&storage, &schema, snapshot(), None, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownField { ref field, .. } if field == "surname"));
    assert!(storage.operations().is_empty());
}
