//! Shared entity handles
//!
//! Scopes recognise an entity by instance, not by value: an inner scope
//! refreshes its outer scope's snapshot only when both track the very same
//! object. [`Tracked`] provides that identity.

use crate::cascade::cascade;
use crate::metadata::{Entity, Value};
use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

/// Reference-counted handle to an entity graph
pub struct Tracked<T>(pub(crate) Rc<RefCell<T>>);

impl<T> Tracked<T> {
    pub fn new(entity: T) -> Self {
        Self(Rc::new(RefCell::new(entity)))
    }

    pub fn borrow(&self) -> Ref<'_, T> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.0.borrow_mut()
    }

    /// Whether both handles point at the same instance
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn same_instance(&self, erased: &Rc<dyn Any>) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.0), Rc::as_ptr(erased))
    }
}

impl<T: 'static> Tracked<T> {
    pub(crate) fn erased(&self) -> Rc<dyn Any> {
        let rc: Rc<dyn Any> = self.0.clone();
        rc
    }

    pub(crate) fn from_erased(erased: &Rc<dyn Any>) -> Option<Self> {
        Rc::clone(erased).downcast::<RefCell<T>>().ok().map(Self)
    }
}

impl<T: Entity> Tracked<T> {
    /// Broadcast `value` into every descendant property named
    /// `property_name`
    pub fn cascade(&self, property_name: &str, value: &Value) -> usize {
        let mut entity = self.0.borrow_mut();
        cascade(Some(&mut *entity), property_name, value)
    }
}

impl<T> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T: fmt::Debug> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tracked").field(&self.0.borrow()).finish()
    }
}
