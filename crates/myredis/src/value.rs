//! Tagged value variants stored in the keyspace.
//!
//! Every variant reports a size estimate that feeds the eviction cache's
//! byte budget: strings count their payload, containers count their
//! element bytes plus a fixed per-entry overhead.

use std::collections::{HashMap, HashSet, VecDeque};

/// Fixed per-element bookkeeping overhead charged against the byte budget.
const ENTRY_OVERHEAD: usize = 16;

/// A single keyspace value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    Set(HashSet<Vec<u8>>),
}

impl Value {
    /// Estimated memory footprint used for budget accounting.
    pub fn size_estimate(&self) -> usize {
        match self {
            Value::Str(b) => b.len(),
            Value::List(items) => items
                .iter()
                .map(|b| b.len() + ENTRY_OVERHEAD)
                .sum(),
            Value::Hash(fields) => fields
                .iter()
                .map(|(f, v)| f.len() + v.len() + ENTRY_OVERHEAD)
                .sum(),
            Value::Set(members) => members
                .iter()
                .map(|m| m.len() + ENTRY_OVERHEAD)
                .sum(),
        }
    }

    /// Human-readable variant name, used in type-mismatch diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
        }
    }
}
