//! Entity types shared by the unit tests

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: Option<String>,
    pub city: Option<String>,
    pub tags: Vec<String>,
    pub address: Option<Address>,
    pub orders: Vec<Order>,
}

crate::entity! {
    Customer => "Customers" {
        keys { id: String => "Id" }
        scalars {
            name: Option<String> => "Name",
            city: Option<String> => "City",
            tags: Vec<String> => "Tags",
        }
        entities { address => "Address" }
        lists { orders => "Orders" references "CustomerId" }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Address {
    pub id: i64,
    pub street: String,
}

crate::entity! {
    Address => "Addresses" {
        keys { id: i64 => "Id" }
        scalars { street: String => "Street" }
        entities { }
        lists { }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub customer_id: String,
    pub ship_postal_code: Option<String>,
    pub lines: Vec<OrderLine>,
}

crate::entity! {
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
pub struct OrderLine {
    pub id: i64,
    pub order_id: i64,
    pub product: String,
    pub quantity: i64,
}

crate::entity! {
    OrderLine => "OrderLines" {
        keys { id: i64 => "Id" [generated] }
        scalars {
            order_id: i64 => "OrderId",
            product: String => "Product",
            quantity: i64 => "Quantity",
        }
        entities { }
        lists { }
    }
}

pub fn order(id: i64, postal: &str) -> Order {
    Order {
        id,
        customer_id: "ALFKI".into(),
        ship_postal_code: Some(postal.into()),
        lines: Vec::new(),
    }
}

pub fn alfki() -> Customer {
    Customer {
        id: "ALFKI".into(),
        name: Some("X".into()),
        city: Some("Berlin".into()),
        tags: vec!["vip".into()],
        address: None,
        orders: vec![order(1, "12209"), order(2, "12210")],
    }
}
