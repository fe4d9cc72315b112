//! Key cascading
//!
//! After an insert produces a generated key, the value is broadcast into the
//! related entities below the inserted one. Matching is by property name:
//! every descendant exposing a property called `property_name` receives the
//! value.

use crate::metadata::{Entity, FieldMut, PropertyKind, Value};
use crate::node::PathStep;

/// Set `property_name` to `value` on every descendant of `entity` exposing a
/// property of that name. Returns the number of assignments made.
pub fn cascade(entity: Option<&mut dyn Entity>, property_name: &str, value: &Value) -> usize {
    let Some(entity) = entity else {
        return 0;
    };
    let mut assigned = 0;
    for relation in entity.descriptor().relations() {
        let children = match entity.related_mut(relation.name) {
            Some(FieldMut::Entity(e)) => vec![e],
            Some(FieldMut::Entities(items)) => items,
            None => continue,
        };
        for child in children {
            let exposes = child
                .descriptor()
                .property(property_name)
                .is_some_and(|p| p.kind == PropertyKind::Scalar);
            if exposes && child.set_value(property_name, Some(value.clone())) {
                assigned += 1;
            }
            assigned += cascade(Some(child), property_name, value);
        }
    }
    assigned
}

/// Follow `path` from `entity` down to a related entity
pub fn locate_mut<'e>(entity: &'e mut dyn Entity, path: &[PathStep]) -> Option<&'e mut dyn Entity> {
    let Some((step, rest)) = path.split_first() else {
        return Some(entity);
    };
    let next = match entity.related_mut(step.property)? {
        FieldMut::Entity(e) => e,
        FieldMut::Entities(items) => items.into_iter().nth(step.position?)?,
    };
    locate_mut(next, rest)
}

/// Store a generated key on `entity` and cascade it into its relations.
///
/// Each relation cascades into the foreign-key property it declares, or into
/// the key's own name when it declares none.
pub fn propagate_key(entity: &mut dyn Entity, key: &'static str, value: &Value) -> usize {
    entity.set_value(key, Some(value.clone()));
    let targets: Vec<&'static str> = entity
        .descriptor()
        .relations()
        .map(|r| r.foreign_key.unwrap_or(key))
        .collect();
    let mut assigned = 0;
    let mut seen: Vec<&'static str> = Vec::new();
    for target in targets {
        if !seen.contains(&target) {
            seen.push(target);
            assigned += cascade(Some(&mut *entity), target, value);
        }
    }
    assigned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{alfki, Customer, OrderLine};

    fn customer_with_lines() -> Customer {
        let mut c = alfki();
        for o in &mut c.orders {
            o.lines.push(OrderLine { id: 0, order_id: 0, product: "Chai".into(), quantity: 1 });
        }
        c
    }

    #[test]
    fn test_cascade_by_name() {
        let mut c = customer_with_lines();
        let n = cascade(Some(&mut c), "CustomerId", &Value::Text("ANATR".into()));
        assert_eq!(n, 2);
        assert!(c.orders.iter().all(|o| o.customer_id == "ANATR"));
    }

    #[test]
    fn test_cascade_reaches_grandchildren() {
        let mut c = customer_with_lines();
        let n = cascade(Some(&mut c), "OrderId", &Value::Int(42));
        assert_eq!(n, 2);
        assert!(c.orders.iter().flat_map(|o| &o.lines).all(|l| l.order_id == 42));
    }

    #[test]
    fn test_cascade_none_is_noop() {
        assert_eq!(cascade(None, "CustomerId", &Value::Int(1)), 0);
    }

    #[test]
    fn test_locate_and_propagate() {
        let mut c = customer_with_lines();
        let path = vec![PathStep { property: "Orders", position: Some(1) }];
        let order = locate_mut(&mut c, &path).unwrap();
        let n = propagate_key(order, "Id", &Value::Int(77));
        assert_eq!(n, 1);
        assert_eq!(c.orders[1].id, 77);
        assert_eq!(c.orders[1].lines[0].order_id, 77);
        assert_eq!(c.orders[0].lines[0].order_id, 0);

        let missing = vec![PathStep { property: "Orders", position: Some(9) }];
        assert!(locate_mut(&mut c, &missing).is_none());
    }
}
