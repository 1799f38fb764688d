//! Integration tests for conflicts between competing contexts.

use parking_lot::Mutex;
use relgraph_core::{
    BatchOutcome, Config, CoreError, EntityContext, EntityId, PersistObserver, PersistRequest,
    Persister, Stage,
};
use relgraph_store::{
    Capabilities, Connection, InMemoryStore, RowLock, Statement, StoreError, Value,
};
use relgraph_testkit::{init_tracing, lock_advances, stress_concurrent_updates, StressConfig, TestStore};
use std::sync::Arc;
use std::time::Duration;

fn renamed(context: &mut EntityContext, key: i64, name: &str) -> EntityId {
    let customer = context.get_or_create("Customer", Value::Integer(key)).unwrap();
    context
        .set_value(customer, "name", Value::Text(name.to_string()))
        .unwrap();
    customer
}

fn lock_mismatch_between_two_contexts(config: Config) {
    let store = TestStore::new();
    store.seed_customer(1, "Ada", 1);
    let mut first = store.context_with(config.clone());
    let mut second = store.context_with(config);

    let a = renamed(&mut first, 1, "first");
    let b = renamed(&mut second, 1, "second");

    first.persist(&PersistRequest::new().save(a)).unwrap();
    assert_eq!(store.column("customers", 1, "version"), Some(Value::Integer(2)));

    let err = second.persist(&PersistRequest::new().save(b)).unwrap_err();
    match &err {
        CoreError::OptimisticLockMismatch {
            entity_type,
            local_lock,
            database_lock,
            ..
        } => {
            assert_eq!(entity_type, "Customer");
            assert_eq!(local_lock, &Value::Integer(1));
            assert_eq!(database_lock, &Value::Integer(2));
        }
        other => panic!("expected a lock mismatch, got {other}"),
    }
    assert!(err.is_concurrency_conflict());

    assert_eq!(store.column("customers", 1, "name"), Some(Value::from("first")));
    assert_eq!(second.get(b).unwrap().lock_value(), Some(&Value::Integer(1)));
    assert_eq!(second.get_value(b, "name").unwrap(), Value::from("second"));
    assert_eq!(second.connection().open_statements(), 0);
}

#[test]
fn stale_lock_is_caught_before_writing() {
    init_tracing();
    lock_mismatch_between_two_contexts(Config::default());
}

#[test]
fn stale_lock_is_caught_by_the_row_count() {
    init_tracing();
    lock_mismatch_between_two_contexts(Config::default().validate_locks_before_write(false));
}

/// Deletes a customer through a second connection when the update stage
/// starts, and records the row outcome of the write stages.
struct DeleteOnUpdate {
    store: InMemoryStore,
    key: i64,
    outcome: Arc<Mutex<Option<(Vec<EntityId>, Vec<(EntityId, Value)>)>>>,
}

impl PersistObserver for DeleteOnUpdate {
    fn before_stage(&self, stage: Stage) {
        if stage != Stage::Update {
            return;
        }
        let connection = self.store.connect();
        let delete = connection
            .prepare(&Statement::Delete {
                table: "customers".into(),
                key_column: "id".into(),
                lock_column: Some("version".into()),
            })
            .unwrap();
        connection
            .execute_batch(delete, &[vec![Value::Integer(self.key), Value::Integer(1)]])
            .unwrap();
        connection.close_statement(delete).unwrap();
    }

    fn after_batches(&self, outcome: &BatchOutcome) {
        let failures = outcome
            .failures
            .iter()
            .map(|(id, err)| match err {
                CoreError::EntityMissing { key, .. } => (*id, key.clone()),
                other => panic!("unexpected {other}"),
            })
            .collect();
        *self.outcome.lock() = Some((outcome.executed.clone(), failures));
    }
}

#[test]
fn row_deleted_mid_persist_is_reported_missing() {
    init_tracing();
    let store = TestStore::new();
    for key in 1..=5 {
        store.seed_customer(key, "initial", 1);
    }
    let mut context = store.context();
    let customers: Vec<EntityId> = (1..=5)
        .map(|key| renamed(&mut context, key, &format!("renamed-{key}")))
        .collect();

    let outcome = Arc::new(Mutex::new(None));
    let persister = Persister::new().with_observer(DeleteOnUpdate {
        store: store.store.clone(),
        key: 3,
        outcome: Arc::clone(&outcome),
    });

    let request = customers
        .iter()
        .fold(PersistRequest::new(), |request, id| request.save(*id));
    let err = persister.persist(&mut context, &request).unwrap_err();
    match &err {
        CoreError::EntityMissing { entity_type, key } => {
            assert_eq!(entity_type, "Customer");
            assert_eq!(key, &Value::Integer(3));
        }
        other => panic!("expected a missing entity, got {other}"),
    }
    assert!(err.is_concurrency_conflict());

    let (executed, failures) = outcome.lock().take().unwrap();
    assert_eq!(failures, vec![(customers[2], Value::Integer(3))]);
    let mut executed_sorted = executed.clone();
    executed_sorted.sort_unstable();
    let mut others: Vec<EntityId> = [0, 1, 3, 4].iter().map(|i| customers[*i]).collect();
    others.sort_unstable();
    assert_eq!(executed_sorted, others);

    for key in [1, 2, 4, 5] {
        assert_eq!(store.column("customers", key, "name"), Some(Value::from("initial")));
        assert_eq!(store.column("customers", key, "version"), Some(Value::Integer(1)));
    }
    assert_eq!(context.connection().open_statements(), 0);
    assert!(!context.connection().in_transaction());
}

#[test]
fn pessimistic_store_times_out_on_a_held_row() {
    init_tracing();
    let store = TestStore::with_capabilities(Capabilities::new().batch_update_counts(false));
    store.seed_customer(1, "Ada", 1);

    let holder = store.connection();
    holder.begin().unwrap();
    holder
        .load_by_key(
            "customers",
            &Value::Integer(1),
            RowLock::ForUpdate { wait: None },
        )
        .unwrap();

    let config = Config::default().pessimistic_lock_wait(Some(Duration::from_millis(20)));
    let mut context = store.context_with(config);
    let customer = renamed(&mut context, 1, "waiting");

    let err = context
        .persist(&PersistRequest::new().save(customer))
        .unwrap_err();
    assert!(
        matches!(
            err,
            CoreError::Store(StoreError::LockTimeout { .. } | StoreError::RowLocked { .. })
        ),
        "{err}"
    );
    assert!(err.is_concurrency_conflict());
    assert!(!context.connection().in_transaction());

    holder.rollback().unwrap();
    context.persist(&PersistRequest::new().save(customer)).unwrap();
    assert_eq!(store.column("customers", 1, "version"), Some(Value::Integer(2)));
    assert_eq!(store.column("customers", 1, "name"), Some(Value::from("waiting")));
}

#[test]
fn pessimistic_store_without_wait_fails_fast() {
    let store = TestStore::with_capabilities(
        Capabilities::new()
            .batch_update_counts(false)
            .select_for_update_wait(false),
    );
    store.seed_customer(1, "Ada", 1);

    let holder = store.connection();
    holder.begin().unwrap();
    holder
        .load_by_key(
            "customers",
            &Value::Integer(1),
            RowLock::ForUpdate { wait: None },
        )
        .unwrap();

    let mut context = store.context();
    let customer = renamed(&mut context, 1, "impatient");
    let err = context
        .persist(&PersistRequest::new().save(customer))
        .unwrap_err();
    assert!(
        matches!(err, CoreError::Store(StoreError::RowLocked { .. })),
        "{err}"
    );
    holder.rollback().unwrap();
}

#[test]
fn competing_threads_never_lose_updates() {
    init_tracing();
    let store = TestStore::new();
    let config = StressConfig {
        operations: 50,
        threads: 4,
        entity_count: 2,
    };
    let result = stress_concurrent_updates(&store, &config);
    assert_eq!(result.failed_ops, 0);
    assert_eq!(
        lock_advances(&store, &config),
        result.successful_ops
    );
}
