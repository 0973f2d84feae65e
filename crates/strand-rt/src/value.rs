// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Opaque host values.
//!
//! The scheduler moves values between frames but never looks inside them.
//! The host layer decides what a value is; here it is a shared, type-erased
//! handle.

use std::any::{self, Any};
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Value {
    inner: Option<Payload>,
}

#[derive(Clone)]
struct Payload {
    data: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Value {
    /// The empty value a frame receives when there is nothing to pass on.
    pub fn unit() -> Self {
        Self { inner: None }
    }

    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Some(Payload {
                data: Arc::new(value),
                type_name: any::type_name::<T>(),
            }),
        }
    }

    pub fn is_unit(&self) -> bool {
        self.inner.is_none()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_ref()?.data.downcast_ref::<T>()
    }

    /// Identity comparison: true when both handles share one payload.
    pub fn same(&self, other: &Value) -> bool {
        match (&self.inner, &other.inner) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(&a.data, &b.data),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("Value(unit)"),
            Some(p) => write!(f, "Value(<{}>)", p.type_name),
        }
    }
}
