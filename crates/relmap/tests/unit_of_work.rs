mod common;

use asupersync::Cx;
use asupersync::runtime::RuntimeBuilder;
use common::{order_engine, seed_order, unwrap_outcome};
use relmap::prelude::*;
use relmap::{ChangeKind, SessionState};
use std::sync::Arc;

#[test]
fn repeated_finds_return_the_same_instance() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (engine, db) = order_engine();
    seed_order(&db, 1, 100);

    rt.block_on(async {
        let mut session = engine.open_session(db.clone());
        let first = unwrap_outcome(session.find(&cx, "Order", 1_i64).await).expect("order 1");
        let second = unwrap_outcome(session.find(&cx, "Order", 1_i64).await).expect("order 1");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(db.fetch_count(), 1);

        // Query results resolve through the identity map too.
        let queried = unwrap_outcome(
            session
                .query(&cx, &QuerySpec::new("Order").filter("total", 100_i64))
                .await,
        );
        assert_eq!(queried.len(), 1);
        assert!(Arc::ptr_eq(&first, &queried[0]));

        assert!(unwrap_outcome(session.find(&cx, "Order", 2_i64).await).is_none());
    });
}

#[test]
fn unchanged_entity_has_empty_change_set() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (engine, db) = order_engine();
    seed_order(&db, 1, 100);

    rt.block_on(async {
        let mut session = engine.open_session(db.clone());
        let order = unwrap_outcome(session.find(&cx, "Order", 1_i64).await).expect("order 1");

        let changes = session.changes_for(&order).unwrap();
        assert!(changes.is_empty());
        assert_eq!(changes.to_string(), "update Order.id=1: no changes");
        assert!(!session.is_dirty(&order).unwrap());

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.total(), 0);
        assert!(db.executed().is_empty());
    });
}

#[test]
fn value_changed_and_restored_is_not_dirty() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (engine, db) = order_engine();
    seed_order(&db, 1, 100);

    rt.block_on(async {
        let mut session = engine.open_session(db.clone());
        let order = unwrap_outcome(session.find(&cx, "Order", 1_i64).await).expect("order 1");

        write(&order).set("total", 250_i64).unwrap();
        assert!(session.is_dirty(&order).unwrap());
        write(&order).set("total", 100_i64).unwrap();
        assert!(session.changes_for(&order).unwrap().is_empty());

        unwrap_outcome(session.commit(&cx).await);
        assert!(db.executed().is_empty());
        assert_eq!(db.value(&Identity::new("Order", 1_i64), "version"), Some(Value::BigInt(0)));
    });
}

#[test]
fn total_update_produces_change_set_and_bumps_version() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (engine, db) = order_engine();
    seed_order(&db, 1, 100);

    rt.block_on(async {
        let mut session = engine.open_session(db.clone());
        let order = unwrap_outcome(session.find(&cx, "Order", 1_i64).await).expect("order 1");
        assert_eq!(read(&order).version(), Some(&Value::BigInt(0)));

        write(&order).set("total", 150_i64).unwrap();
        let changes = session.changes_for(&order).unwrap();
        assert_eq!(changes.kind, ChangeKind::Update);
        assert_eq!(changes.to_string(), "update Order.id=1: total 100→150");
        assert_eq!(session.pending_changes().unwrap(), vec![changes]);

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.updated, 1);
        assert_eq!(db.executed(), vec!["update Order#1".to_string()]);
        assert_eq!(read(&order).version(), Some(&Value::BigInt(1)));
        assert!(!session.is_dirty(&order).unwrap());

        unwrap_outcome(session.commit(&cx).await);
        let id = Identity::new("Order", 1_i64);
        assert_eq!(db.value(&id, "total"), Some(Value::BigInt(150)));
        assert_eq!(db.value(&id, "version"), Some(Value::BigInt(1)));
        assert_eq!(db.commits(), 1);
    });
}

#[test]
fn inserts_follow_foreign_key_dependencies() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (engine, db) = order_engine();

    rt.block_on(async {
        let mut session = engine.open_session(db.clone());
        let order = engine.entity("Order", 5_i64).unwrap();
        let customer = engine.entity("Customer", 7_i64).unwrap();
        write(&customer).set("name", "Ada").unwrap();
        {
            let mut o = write(&order);
            o.set("total", 30_i64).unwrap();
            o.set_reference("customer", Some(Identity::new("Customer", 7_i64)))
                .unwrap();
        }

        // Registered child first; the flush still writes the parent row first.
        session.persist(&order).unwrap();
        session.persist(&customer).unwrap();
        assert_eq!(session.status_of(&order), Some(EntryStatus::NewUnflushed));
        assert_eq!(session.pending_counts().pending_new, 2);

        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(
            db.executed(),
            vec!["insert Customer#7".to_string(), "insert Order#5".to_string()]
        );
        let id = Identity::new("Order", 5_i64);
        assert_eq!(db.value(&id, "customer"), Some(Value::BigInt(7)));
        assert_eq!(db.value(&id, "version"), Some(Value::BigInt(0)));
    });
}

#[test]
fn deletes_run_before_their_targets() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (engine, db) = order_engine();
    db.seed("Customer", &[("id", Value::BigInt(7)), ("name", Value::Text("Ada".into()))]);
    db.seed(
        "Order",
        &[
            ("id", Value::BigInt(5)),
            ("total", Value::BigInt(30)),
            ("version", Value::BigInt(0)),
            ("customer", Value::BigInt(7)),
        ],
    );

    rt.block_on(async {
        let mut session = engine.open_session(db.clone());
        let customer = unwrap_outcome(session.find(&cx, "Customer", 7_i64).await).unwrap();
        let order = unwrap_outcome(session.find(&cx, "Order", 5_i64).await).unwrap();

        unwrap_outcome(session.remove(&cx, &customer).await);
        unwrap_outcome(session.remove(&cx, &order).await);
        assert_eq!(session.status_of(&order), Some(EntryStatus::Removed));
        assert!(unwrap_outcome(session.find(&cx, "Order", 5_i64).await).is_none());

        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(
            db.executed(),
            vec!["delete Order#5".to_string(), "delete Customer#7".to_string()]
        );
        assert!(!db.exists(&Identity::new("Customer", 7_i64)));
    });
}

#[test]
fn persisting_a_second_instance_for_an_identity_fails() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (engine, db) = order_engine();
    seed_order(&db, 1, 100);

    rt.block_on(async {
        let mut session = engine.open_session(db.clone());
        let _order = unwrap_outcome(session.find(&cx, "Order", 1_i64).await).unwrap();

        let impostor = engine.entity("Order", 1_i64).unwrap();
        let err = session.persist(&impostor).unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentity(ref id) if id.to_string() == "Order#1"));

        // Nothing partial happened; the unit of work keeps going.
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.identity_map().len(), 1);
    });
}

#[test]
fn persist_requires_an_identifier() {
    let (engine, db) = order_engine();
    let mut session = engine.open_session(db);
    let descriptor = engine.descriptor("Order").unwrap();
    let order = Arc::new(std::sync::RwLock::new(Instance::new(descriptor)));
    let err = session.persist(&order).unwrap_err();
    assert!(matches!(err, Error::Lifecycle(_)));
    assert!(session.identity_map().is_empty());
}

#[test]
fn pending_changes_serialize_to_json() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (engine, db) = order_engine();
    seed_order(&db, 1, 100);

    rt.block_on(async {
        let mut session = engine.open_session(db.clone());
        let order = unwrap_outcome(session.find(&cx, "Order", 1_i64).await).unwrap();
        write(&order).set("total", 120_i64).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&session.pending_changes_json().unwrap()).unwrap();
        let first = &json.as_array().unwrap()[0];
        assert_eq!(first["kind"], "Update");
        assert_eq!(first["attributes"][0]["name"], "total");

        let debug = session.debug_state();
        assert_eq!(debug.pending.pending_dirty, 1);
        assert!(debug.in_transaction);
        assert_eq!(debug.statistics.entities_loaded, 1);
    });
}
