//! Unit-of-work integration tests against the in-memory backend

use dorm_core::{
    entity, ChangeBatch, ChangeTrackingMode, Compression, Entity, EntityDescriptor, Field,
    FieldMut, GraphDiffer, KeyedContentHash, MemoryBackend, NodeType, ObjectState,
    PropertyDescriptor, PropertyKind, ScopeOptions, TrackError, Tracked, TrackerConfig,
    TransactionOutcome, UnitOfWork, Value,
};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Customer {
    id: String,
    name: Option<String>,
    orders: Vec<Order>,
}

entity! {
    Customer => "Customers" {
        keys { id: String => "Id" }
        scalars { name: Option<String> => "Name" }
        entities { }
        lists { orders => "Orders" references "CustomerId" }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Order {
    id: i64,
    customer_id: String,
    ship_postal_code: Option<String>,
    lines: Vec<OrderLine>,
}

entity! {
    Order => "Orders" {
        keys { id: i64 => "Id" [generated] }
        scalars {
            customer_id: String => "CustomerId",
            ship_postal_code: Option<String> => "ShipPostalCode",
        }
        entities { }
        lists { lines => "Lines" references "OrderId" }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct OrderLine {
    id: i64,
    order_id: i64,
    product: String,
}

entity! {
    OrderLine => "OrderLines" {
        keys { id: i64 => "Id" [generated] }
        scalars {
            order_id: i64 => "OrderId",
            product: String => "Product",
        }
        entities { }
        lists { }
    }
}

/// Reference data that must never be tracked
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Region {
    id: i64,
}

impl Entity for Region {
    fn descriptor(&self) -> &'static EntityDescriptor {
        static PROPERTIES: &[PropertyDescriptor] =
            &[PropertyDescriptor::new("Id", PropertyKind::Scalar).key()];
        static DESCRIPTOR: EntityDescriptor = EntityDescriptor {
            name: "Region",
            table: "Regions",
            properties: PROPERTIES,
        };
        &DESCRIPTOR
    }

    fn field(&self, name: &str) -> Option<Field<'_>> {
        (name == "Id").then(|| Field::Value(Value::Int(self.id)))
    }

    fn set_value(&mut self, _name: &str, _value: Option<Value>) -> bool {
        false
    }

    fn related_mut(&mut self, _name: &str) -> Option<FieldMut<'_>> {
        None
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn order(id: i64, postal: &str) -> Order {
    Order {
        id,
        customer_id: "ALFKI".to_string(),
        ship_postal_code: Some(postal.to_string()),
        lines: Vec::new(),
    }
}

fn alfki() -> Customer {
    Customer {
        id: "ALFKI".to_string(),
        name: Some("X".to_string()),
        orders: vec![order(1, "12209"), order(2, "12210")],
    }
}

fn seeded(config: TrackerConfig) -> UnitOfWork<MemoryBackend> {
    init_tracing();
    let backend = MemoryBackend::new();
    backend.seed(&alfki()).unwrap();
    UnitOfWork::with_config(backend, config)
}

fn column(uow: &UnitOfWork<MemoryBackend>, table: &str, key: &str, column: &str) -> Option<Value> {
    uow.backend()
        .database()
        .get(table, key)
        .and_then(|row| row.get(column).cloned().flatten())
}

#[test]
fn test_alfki_diff_scenario() {
    let old = alfki();
    let mut current = old.clone();
    current.name = Some("Y".to_string());
    current.orders.remove(1);
    current.orders.push(order(0, "99999"));

    let tree = GraphDiffer::new(&KeyedContentHash, false)
        .diff(Some(&current), Some(&old))
        .unwrap();
    let root = tree.root().unwrap();
    let children = tree.children(root);
    assert_eq!(children.len(), 3);

    let name = tree.node(children[0]);
    assert_eq!(name.property_name(), Some("Name"));
    assert_eq!(tree.state(children[0]), ObjectState::Dirty);

    let states: Vec<ObjectState> = children[1..].iter().map(|&c| tree.state(c)).collect();
    assert!(states.contains(&ObjectState::New));
    assert!(states.contains(&ObjectState::Deleted));
    for &c in &children[1..] {
        assert_eq!(tree.node(c).node_type(), NodeType::ListItem);
        let entity = tree.node(c).entity().unwrap();
        assert_ne!(entity.value("Id"), Some(Value::Int(1)));
    }
}

#[test]
fn test_alfki_commit_scenario() {
    let uow = seeded(TrackerConfig::default());
    let item = Tracked::new(alfki());
    let scope = uow.open(ScopeOptions::track(&item)).unwrap();
    {
        let mut c = item.borrow_mut();
        c.name = Some("Y".to_string());
        c.orders.remove(1);
        c.orders.push(order(0, "99999"));
    }
    let outcome = scope.commit_detailed(&item).unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.new, 1);
    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.executed, 3);
    assert_eq!(outcome.generated_keys.len(), 1);
    assert_eq!(item.borrow().orders[1].id, 3);
    drop(scope);

    assert_eq!(uow.last_transaction(), Some(TransactionOutcome::Committed));
    assert_eq!(
        column(&uow, "Customers", "ALFKI", "Name"),
        Some(Value::Text("Y".to_string()))
    );
    assert!(uow.backend().database().get("Orders", "2").is_none());
    assert_eq!(
        column(&uow, "Orders", "3", "ShipPostalCode"),
        Some(Value::Text("99999".to_string()))
    );
}

#[test]
fn test_primary_key_change_scenario() {
    let old = alfki();
    let mut current = old.clone();
    current.id = "ALFKJ".to_string();
    let tree = GraphDiffer::new(&KeyedContentHash, false)
        .diff(Some(&current), Some(&old))
        .unwrap();
    let batch = ChangeBatch::from_tree(&tree);
    assert_eq!(tree.state(tree.root().unwrap()), ObjectState::DirtyPrimaryKey);
    assert_eq!(batch.new.len(), 1);
    assert_eq!(batch.deleted.len(), 1);
    assert!(batch.dirty.is_empty());
    let inserted = tree.node(batch.new[0]).entity().unwrap();
    assert_eq!(inserted.value("Id"), Some(Value::Text("ALFKJ".to_string())));
    let removed = tree.node(batch.deleted[0]).entity().unwrap();
    assert_eq!(removed.value("Id"), Some(Value::Text("ALFKI".to_string())));

    let uow = seeded(TrackerConfig::default());
    let item = Tracked::new(alfki());
    let scope = uow.open(ScopeOptions::track(&item)).unwrap();
    item.borrow_mut().id = "ALFKJ".to_string();
    assert!(scope.commit(&item).unwrap());
    drop(scope);
    let db = uow.backend().database();
    assert!(db.get("Customers", "ALFKI").is_none());
    assert!(db.get("Customers", "ALFKJ").is_some());
}

#[test]
fn test_nested_scopes_share_order_instance() {
    let uow = seeded(TrackerConfig::default());
    let item = Tracked::new(order(1, "12209"));
    let outer = uow.open(ScopeOptions::track(&item)).unwrap();
    {
        let inner = uow.open(ScopeOptions::track(&item)).unwrap();
        assert_eq!(uow.depth(), 2);
        item.borrow_mut().ship_postal_code = Some("10117".to_string());
        let outcome = inner.commit_detailed(&item).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.executed, 1);
    }
    let outcome = outer.commit_detailed(&item).unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.changes(), 0);
    assert_eq!(outcome.executed, 0);
    drop(outer);

    assert_eq!(uow.last_transaction(), Some(TransactionOutcome::Committed));
    assert_eq!(
        column(&uow, "Orders", "1", "ShipPostalCode"),
        Some(Value::Text("10117".to_string()))
    );
}

#[test]
fn test_nested_scopes_on_different_instances_keep_outer_snapshot() {
    let uow = seeded(TrackerConfig::default());
    let item = Tracked::new(order(1, "12209"));
    let copy = Tracked::new(order(1, "12209"));
    let outer = uow.open(ScopeOptions::track(&item)).unwrap();
    {
        let inner = uow.open(ScopeOptions::track(&copy)).unwrap();
        copy.borrow_mut().ship_postal_code = Some("10117".to_string());
        assert!(inner.commit(&copy).unwrap());
    }
    item.borrow_mut().ship_postal_code = Some("10117".to_string());
    let pending = outer.pending(&item).unwrap().unwrap();
    assert!(!pending.is_empty());
    assert_eq!(pending.state, ObjectState::Dirty);
    assert!(outer.commit(&item).unwrap());
}

#[test]
fn test_read_only_entity_rejected() {
    let uow = UnitOfWork::new(MemoryBackend::new());
    let region = Tracked::new(Region { id: 7 });
    let err = uow.open(ScopeOptions::track(&region)).err().unwrap();
    assert!(matches!(err, TrackError::ReadOnly("Region")));
    assert_eq!(uow.depth(), 0);
    assert!(!uow.in_transaction());
}

#[test]
fn test_panic_rolls_back_auto_commit_scope() {
    let uow = seeded(TrackerConfig::default());
    let item = Tracked::new(alfki());
    let result = catch_unwind(AssertUnwindSafe(|| {
        let _scope = uow
            .open(ScopeOptions::track(&item).auto_commit(true))
            .unwrap();
        item.borrow_mut().name = Some("Lost".to_string());
        panic!("block failed");
    }));
    assert!(result.is_err());
    assert_eq!(*item.borrow(), alfki());
    assert_eq!(uow.depth(), 0);
    assert_eq!(uow.last_transaction(), Some(TransactionOutcome::RolledBack));
    assert_eq!(
        column(&uow, "Customers", "ALFKI", "Name"),
        Some(Value::Text("X".to_string()))
    );
}

#[test]
fn test_backend_failure_propagates() {
    let uow = seeded(TrackerConfig::default());
    uow.backend().reject("Orders");
    let item = Tracked::new(alfki());
    let scope = uow.open(ScopeOptions::track(&item)).unwrap();
    {
        let mut c = item.borrow_mut();
        c.name = Some("Y".to_string());
        c.orders.clear();
    }
    let err = scope.commit(&item).unwrap_err();
    assert!(matches!(err, TrackError::Backend(_)));
    assert!(err.to_string().contains("Orders"));
    assert!(scope.rollback(&item).unwrap());
    assert_eq!(*item.borrow(), alfki());
    drop(scope);
    assert_eq!(
        column(&uow, "Customers", "ALFKI", "Name"),
        Some(Value::Text("X".to_string()))
    );
    assert_eq!(uow.backend().database().count("Orders"), 2);
}

#[test]
fn test_compressed_snapshots() {
    let config = TrackerConfig {
        compression: Compression::Zstd,
        compression_level: 5,
        ..TrackerConfig::default()
    };
    let uow = seeded(config);
    let item = Tracked::new(alfki());
    let scope = uow.open(ScopeOptions::track(&item)).unwrap();
    item.borrow_mut().orders[0].ship_postal_code = None;
    assert_eq!(scope.old::<Customer>().unwrap().unwrap(), alfki());
    assert!(scope.commit(&item).unwrap());
    drop(scope);
    assert_eq!(column(&uow, "Orders", "1", "ShipPostalCode"), None);
}

#[test]
fn test_commits_without_ambient_transaction() {
    let config = TrackerConfig {
        ambient_transactions: false,
        ..TrackerConfig::default()
    };
    let uow = seeded(config);
    let item = Tracked::new(alfki());
    let scope = uow.open(ScopeOptions::track(&item)).unwrap();
    assert!(!uow.in_transaction());
    item.borrow_mut().name = Some("Z".to_string());
    assert!(scope.commit(&item).unwrap());
    assert_eq!(
        column(&uow, "Customers", "ALFKI", "Name"),
        Some(Value::Text("Z".to_string()))
    );
    drop(scope);
    assert_eq!(uow.last_transaction(), None);
}

#[test]
fn test_debug_mode_default_from_config() {
    let config = TrackerConfig {
        default_mode: ChangeTrackingMode::Debug,
        ..TrackerConfig::default()
    };
    let uow = seeded(config);
    let item = Tracked::new(alfki());
    let scope = uow.open(ScopeOptions::track(&item)).unwrap();
    item.borrow_mut().orders.push(order(0, "00000"));
    let outcome = scope.commit_detailed(&item).unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.statements.len(), 1);
    assert_eq!(
        outcome.statements[0].sql,
        "INSERT INTO Orders (CustomerId, ShipPostalCode) VALUES (?, ?)"
    );
    drop(scope);
    assert_eq!(uow.backend().database().count("Orders"), 2);
    assert_eq!(item.borrow().orders[2].id, 0);
}
