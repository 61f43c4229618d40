use std::any::Any;
use std::fmt;

/// Type-erased task output.
pub struct Value(Box<dyn Any>);

impl Value {
    pub fn new<T: Any>(value: T) -> Self {
        Value(Box::new(value))
    }

    pub fn unit() -> Self {
        Value::new(())
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Take the value out, or get `self` back if it holds another type.
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        self.0.downcast::<T>().map(|b| *b).map_err(Value)
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::unit()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is::<()>() {
            f.write_str("Value(())")
        } else {
            f.write_str("Value(..)")
        }
    }
}
