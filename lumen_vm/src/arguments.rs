//! Argument marshalling for runtime entries.
//!
//! Generated code lays the entry's arguments out in a well-known array;
//! each entry declares a fixed count, reads positionally, and writes its
//! result through the single return sink.

use lumen_runtime::Value;

/// The marshalled argument vector of one runtime-entry invocation.
#[derive(Debug)]
pub struct NativeArguments {
    values: Vec<Value>,
    return_value: Option<Value>,
}

impl NativeArguments {
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            return_value: None,
        }
    }

    /// Assert this invocation carries exactly the entry's declared count.
    #[track_caller]
    pub fn expect_count(&self, count: usize) {
        assert_eq!(
            self.values.len(),
            count,
            "runtime entry declared {count} arguments, received {}",
            self.values.len()
        );
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The i-th argument.
    #[track_caller]
    #[must_use]
    pub fn arg_at(&self, index: usize) -> &Value {
        self.values
            .get(index)
            .unwrap_or_else(|| panic!("argument index {index} out of range"))
    }

    /// Write the entry's return value. Last write wins.
    pub fn set_return(&mut self, value: Value) {
        self.return_value = Some(value);
    }

    /// The value the entry returned to generated code; null if none.
    #[must_use]
    pub fn return_value(&self) -> Value {
        self.return_value.clone().unwrap_or(Value::Null)
    }
}
