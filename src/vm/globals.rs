//! The globals table
//!
//! Globals are name-indexed: the first definition of a name assigns the next
//! slot index and later definitions overwrite the slot in place. Each
//! top-level VM owns its globals; module VMs get a fresh table that is
//! snapshotted into the module record when the module body finishes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::value::Value;

/// Name-indexed global storage: a name → slot map paired with a slot vector.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    names: HashMap<Arc<str>, usize>,
    slots: Vec<Value>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a global. A fresh name takes the next slot; redefinition
    /// overwrites. Returns the slot index.
    pub fn define(&mut self, name: Arc<str>, value: Value) -> usize {
        match self.names.get(&name) {
            Some(&slot) => {
                self.slots[slot] = value;
                slot
            }
            None => {
                let slot = self.slots.len();
                self.slots.push(value);
                self.names.insert(name, slot);
                slot
            }
        }
    }

    /// Read a global by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.names.get(name).map(|&slot| &self.slots[slot])
    }

    /// Assign an already-defined global. Returns false when the name is
    /// unbound (the caller reports UndefinedGlobal).
    pub fn set(&mut self, name: &str, value: Value) -> bool {
        match self.names.get(name) {
            Some(&slot) => {
                self.slots[slot] = value;
                true
            }
            None => false,
        }
    }

    /// Slot index of a name, if defined.
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    /// Number of defined globals.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate over (name, value) pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &Value)> {
        let mut by_slot: Vec<(&Arc<str>, usize)> =
            self.names.iter().map(|(n, &s)| (n, s)).collect();
        by_slot.sort_by_key(|&(_, s)| s);
        by_slot.into_iter().map(|(n, s)| (n, &self.slots[s]))
    }
}
