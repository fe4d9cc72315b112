//! Entity metadata
//!
//! Every tracked type exposes a static descriptor table listing its
//! properties, their classification and their key/relationship roles.
//! The differ, the cascade propagator and the backends read entity state
//! exclusively through the object-safe [`Entity`] trait, so nested graphs can
//! be walked as `&dyn Entity` without reflection.
//!
//! Most types implement the trait through the [`entity!`](crate::entity)
//! macro, which generates both the descriptor table and the accessors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar value read from or written to an entity property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    /// Whether this is the zero value of its variant (an unassigned key)
    pub fn is_default(&self) -> bool {
        match self {
            Value::Bool(b) => !b,
            Value::Int(i) => *i == 0,
            Value::Float(f) => *f == 0.0,
            Value::Text(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::List(l) => l.is_empty(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Bytes(b) => write!(f, "x'{}'", hex::encode(b)),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Property classification used by the differ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    /// Single primitive value
    Scalar,
    /// List of primitives, compared as a whole sequence
    ScalarList,
    /// Byte buffer, compared byte-wise
    Binary,
    /// Single nested entity
    Entity,
    /// List of nested entities, correlated by content hash
    EntityList,
}

impl PropertyKind {
    /// Whether values of this kind are compared by equality
    pub fn is_simple(self) -> bool {
        matches!(self, PropertyKind::Scalar | PropertyKind::ScalarList | PropertyKind::Binary)
    }
}

/// One row of an entity's static descriptor table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDescriptor {
    /// Property name as seen by the tracking engine
    pub name: &'static str,
    /// Storage column name
    pub column: &'static str,
    pub kind: PropertyKind,
    /// Part of the primary key
    pub primary_key: bool,
    /// Key value is assigned by storage on insert
    pub generated: bool,
    /// For relationship properties: the property on the related entities
    /// that receives this entity's generated key
    pub foreign_key: Option<&'static str>,
}

impl PropertyDescriptor {
    /// A non-key property of the given kind
    pub const fn new(name: &'static str, kind: PropertyKind) -> Self {
        Self {
            name,
            column: name,
            kind,
            primary_key: false,
            generated: false,
            foreign_key: None,
        }
    }

    /// Mark the property as part of the primary key
    pub const fn key(self) -> Self {
        Self {
            primary_key: true,
            ..self
        }
    }

    /// Mark the key as storage-generated
    pub const fn generated(self) -> Self {
        Self {
            generated: true,
            ..self
        }
    }

    /// Name the foreign-key property a relationship cascades into
    pub const fn references(self, foreign_key: &'static str) -> Self {
        Self {
            foreign_key: Some(foreign_key),
            ..self
        }
    }

    /// Override the storage column name
    pub const fn column(self, column: &'static str) -> Self {
        Self { column, ..self }
    }
}

/// Static metadata for an entity type
#[derive(Debug)]
pub struct EntityDescriptor {
    pub name: &'static str,
    pub table: &'static str,
    pub properties: &'static [PropertyDescriptor],
}

impl EntityDescriptor {
    /// Look up a property by name
    pub fn property(&self, name: &str) -> Option<&'static PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Primary-key properties in declaration order
    pub fn primary_keys(&self) -> impl Iterator<Item = &'static PropertyDescriptor> {
        self.properties.iter().filter(|p| p.primary_key)
    }

    /// The storage-generated key, if the entity has one
    pub fn generated_key(&self) -> Option<&'static PropertyDescriptor> {
        self.properties.iter().find(|p| p.primary_key && p.generated)
    }

    /// Entity and entity-list properties
    pub fn relations(&self) -> impl Iterator<Item = &'static PropertyDescriptor> {
        self.properties
            .iter()
            .filter(|p| matches!(p.kind, PropertyKind::Entity | PropertyKind::EntityList))
    }

    /// Properties stored as columns of this entity's own table
    pub fn columns(&self) -> impl Iterator<Item = &'static PropertyDescriptor> {
        self.properties.iter().filter(|p| p.kind.is_simple())
    }
}

/// Read access to one property
pub enum Field<'a> {
    Value(Value),
    Entity(&'a dyn Entity),
    Entities(Vec<&'a dyn Entity>),
}

/// Mutable access to a relationship property
pub enum FieldMut<'a> {
    Entity(&'a mut dyn Entity),
    Entities(Vec<&'a mut dyn Entity>),
}

/// A tracked persistent type
pub trait Entity: fmt::Debug + 'static {
    /// Static descriptor table of this type
    fn descriptor(&self) -> &'static EntityDescriptor;

    /// Read a property. Absent values and unknown names read as `None`.
    fn field(&self, name: &str) -> Option<Field<'_>>;

    /// Overwrite a simple property. Returns `false` if the property does not
    /// exist or the value has an incompatible type.
    fn set_value(&mut self, name: &str, value: Option<Value>) -> bool;

    /// Mutable access to a relationship property
    fn related_mut(&mut self, name: &str) -> Option<FieldMut<'_>>;

    /// Read-only entities cannot be placed in a scope
    fn is_read_only(&self) -> bool {
        false
    }
}

impl dyn Entity + '_ {
    /// Read a simple property value
    pub fn value(&self, name: &str) -> Option<Value> {
        match self.field(name)? {
            Field::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Primary-key values in declaration order
    pub fn key_values(&self) -> Vec<(&'static PropertyDescriptor, Option<Value>)> {
        self.descriptor()
            .primary_keys()
            .map(|p| (p, self.value(p.name)))
            .collect()
    }
}

/// Conversion between a Rust field type and [`Value`]
pub trait ScalarField: Sized {
    const KIND: PropertyKind;

    fn to_value(&self) -> Option<Value>;

    /// `None` when the value cannot be stored in this field
    fn from_value(value: Option<Value>) -> Option<Self>;
}

impl ScalarField for String {
    const KIND: PropertyKind = PropertyKind::Scalar;

    fn to_value(&self) -> Option<Value> {
        Some(Value::Text(self.clone()))
    }

    fn from_value(value: Option<Value>) -> Option<Self> {
        match value? {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl ScalarField for i64 {
    const KIND: PropertyKind = PropertyKind::Scalar;

    fn to_value(&self) -> Option<Value> {
        Some(Value::Int(*self))
    }

    fn from_value(value: Option<Value>) -> Option<Self> {
        value?.as_int()
    }
}

impl ScalarField for i32 {
    const KIND: PropertyKind = PropertyKind::Scalar;

    fn to_value(&self) -> Option<Value> {
        Some(Value::Int(i64::from(*self)))
    }

    fn from_value(value: Option<Value>) -> Option<Self> {
        value?.as_int().and_then(|i| i32::try_from(i).ok())
    }
}

impl ScalarField for bool {
    const KIND: PropertyKind = PropertyKind::Scalar;

    fn to_value(&self) -> Option<Value> {
        Some(Value::Bool(*self))
    }

    fn from_value(value: Option<Value>) -> Option<Self> {
        match value? {
            Value::Bool(b) => Some(b),
            Value::Int(i) => Some(i != 0),
            _ => None,
        }
    }
}

impl ScalarField for f64 {
    const KIND: PropertyKind = PropertyKind::Scalar;

    fn to_value(&self) -> Option<Value> {
        Some(Value::Float(*self))
    }

    fn from_value(value: Option<Value>) -> Option<Self> {
        match value? {
            Value::Float(f) => Some(f),
            Value::Int(i) => Some(i as f64),
            _ => None,
        }
    }
}

impl ScalarField for Vec<u8> {
    const KIND: PropertyKind = PropertyKind::Binary;

    fn to_value(&self) -> Option<Value> {
        Some(Value::Bytes(self.clone()))
    }

    fn from_value(value: Option<Value>) -> Option<Self> {
        match value? {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl ScalarField for Vec<String> {
    const KIND: PropertyKind = PropertyKind::ScalarList;

    fn to_value(&self) -> Option<Value> {
        Some(Value::List(self.iter().cloned().map(Value::Text).collect()))
    }

    fn from_value(value: Option<Value>) -> Option<Self> {
        match value? {
            Value::List(items) => items
                .into_iter()
                .map(|v| String::from_value(Some(v)))
                .collect(),
            _ => None,
        }
    }
}

impl ScalarField for Vec<i64> {
    const KIND: PropertyKind = PropertyKind::ScalarList;

    fn to_value(&self) -> Option<Value> {
        Some(Value::List(self.iter().copied().map(Value::Int).collect()))
    }

    fn from_value(value: Option<Value>) -> Option<Self> {
        match value? {
            Value::List(items) => items.into_iter().map(|v| v.as_int()).collect(),
            _ => None,
        }
    }
}

impl<T: ScalarField> ScalarField for Option<T> {
    const KIND: PropertyKind = T::KIND;

    fn to_value(&self) -> Option<Value> {
        self.as_ref().and_then(T::to_value)
    }

    fn from_value(value: Option<Value>) -> Option<Self> {
        match value {
            None => Some(None),
            Some(v) => T::from_value(Some(v)).map(Some),
        }
    }
}

/// Implement [`Entity`](crate::Entity) for a struct and generate its
/// descriptor table.
///
/// Key and scalar fields must implement [`ScalarField`](crate::ScalarField);
/// nested entities are `Option<T>` and entity lists are `Vec<T>`.
///
/// ```ignore
/// dorm_core::entity! {
///     Customer => "Customers" {
///         keys { id: String => "Id" }
///         scalars { name: Option<String> => "Name" }
///         entities { }
///         lists { orders => "Orders" references "CustomerId" }
///     }
/// }
/// ```
///
/// A key written as `id: i64 => "Id" [generated]` is assigned by storage.
#[macro_export]
macro_rules! entity {
    (
        $ty:ident => $table:literal {
            keys { $( $kf:ident : $kty:ty => $kname:literal $( [$kgen:ident] )? ),* $(,)? }
            scalars { $( $sf:ident : $sty:ty => $sname:literal ),* $(,)? }
            entities { $( $ef:ident => $ename:literal $( references $efk:literal )? ),* $(,)? }
            lists { $( $lf:ident => $lname:literal $( references $lfk:literal )? ),* $(,)? }
        }
    ) => {
        impl $crate::Entity for $ty {
            fn descriptor(&self) -> &'static $crate::EntityDescriptor {
                static PROPERTIES: &[$crate::PropertyDescriptor] = &[
                    $( $crate::PropertyDescriptor {
                        name: $kname,
                        column: $kname,
                        kind: <$kty as $crate::ScalarField>::KIND,
                        primary_key: true,
                        generated: $crate::__entity_generated!($($kgen)?),
                        foreign_key: None,
                    }, )*
                    $( $crate::PropertyDescriptor::new(
                        $sname,
                        <$sty as $crate::ScalarField>::KIND,
                    ), )*
                    $( $crate::PropertyDescriptor {
                        foreign_key: $crate::__entity_option!($($efk)?),
                        ..$crate::PropertyDescriptor::new($ename, $crate::PropertyKind::Entity)
                    }, )*
                    $( $crate::PropertyDescriptor {
                        foreign_key: $crate::__entity_option!($($lfk)?),
                        ..$crate::PropertyDescriptor::new($lname, $crate::PropertyKind::EntityList)
                    }, )*
                ];
                static DESCRIPTOR: $crate::EntityDescriptor = $crate::EntityDescriptor {
                    name: stringify!($ty),
                    table: $table,
                    properties: PROPERTIES,
                };
                &DESCRIPTOR
            }

            #[allow(unreachable_patterns)]
            fn field(&self, name: &str) -> Option<$crate::Field<'_>> {
                match name {
                    $( $kname => $crate::ScalarField::to_value(&self.$kf).map($crate::Field::Value), )*
                    $( $sname => $crate::ScalarField::to_value(&self.$sf).map($crate::Field::Value), )*
                    $( $ename => self
                        .$ef
                        .as_ref()
                        .map(|e| $crate::Field::Entity(e as &dyn $crate::Entity)), )*
                    $( $lname => Some($crate::Field::Entities(
                        self.$lf.iter().map(|e| e as &dyn $crate::Entity).collect(),
                    )), )*
                    _ => None,
                }
            }

            #[allow(unreachable_patterns)]
            fn set_value(&mut self, name: &str, value: Option<$crate::Value>) -> bool {
                match name {
                    $( $kname => match <$kty as $crate::ScalarField>::from_value(value) {
                        Some(v) => {
                            self.$kf = v;
                            true
                        }
                        None => false,
                    }, )*
                    $( $sname => match <$sty as $crate::ScalarField>::from_value(value) {
                        Some(v) => {
                            self.$sf = v;
                            true
                        }
                        None => false,
                    }, )*
                    _ => false,
                }
            }

            #[allow(unreachable_patterns)]
            fn related_mut(&mut self, name: &str) -> Option<$crate::FieldMut<'_>> {
                match name {
                    $( $ename => self
                        .$ef
                        .as_mut()
                        .map(|e| $crate::FieldMut::Entity(e as &mut dyn $crate::Entity)), )*
                    $( $lname => Some($crate::FieldMut::Entities(
                        self.$lf.iter_mut().map(|e| e as &mut dyn $crate::Entity).collect(),
                    )), )*
                    _ => None,
                }
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __entity_generated {
    () => {
        false
    };
    (generated) => {
        true
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __entity_option {
    () => {
        None
    };
    ($e:literal) => {
        Some($e)
    };
}
