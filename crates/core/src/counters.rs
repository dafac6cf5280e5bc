use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::model::{CounterOperation, Operand};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CounterError {
    #[error("division of counter {0} by zero")]
    DivideByZero(String),
    #[error("counter name is empty")]
    EmptyName,
}

/// Named integer counters for one run.
///
/// Missing counters read as 0 and are created by their first write. Arithmetic
/// saturates at the i64 bounds; results below zero are clamped to zero unless
/// the store was built with `allow_negative`.
#[derive(Debug, Default, Clone)]
pub struct CounterStore {
    values: HashMap<String, i64>,
    allow_negative: bool,
}

impl CounterStore {
    pub fn new(allow_negative: bool) -> Self {
        Self { values: HashMap::new(), allow_negative }
    }

    pub fn get(&self, name: &str) -> i64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn resolve(&self, operand: &Operand) -> i64 {
        match operand {
            Operand::Number(n) => *n,
            Operand::Counter(name) => self.get(name),
        }
    }

    /// Store `value` (after clamping) and return what was stored.
    pub fn set(&mut self, name: &str, value: i64) -> Result<i64, CounterError> {
        if name.is_empty() {
            return Err(CounterError::EmptyName);
        }
        let value = self.clamp(value);
        self.values.insert(name.to_string(), value);
        Ok(value)
    }

    /// Apply `op` with `operand` to counter `name`. On error the counter is unchanged.
    pub fn apply(&mut self, name: &str, op: CounterOperation, operand: &Operand) -> Result<i64, CounterError> {
        let current = self.get(name);
        let rhs = self.resolve(operand);
        let next = match op {
            CounterOperation::Add => current.saturating_add(rhs),
            CounterOperation::Subtract => current.saturating_sub(rhs),
            CounterOperation::Set => rhs,
            CounterOperation::Multiply => current.saturating_mul(rhs),
            CounterOperation::Divide => {
                if rhs == 0 {
                    return Err(CounterError::DivideByZero(name.to_string()));
                }
                current.saturating_div(rhs)
            }
        };
        self.set(name, next)
    }

    /// Sorted copy for readers outside the processing thread.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.values.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn clamp(&self, value: i64) -> i64 {
        if self.allow_negative { value } else { value.max(0) }
    }
}
