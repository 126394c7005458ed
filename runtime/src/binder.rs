//! Per-dispatch values of an operation's scalar arguments.

use std::collections::BTreeMap;

use kiln_codegen::error::{ArgumentKindSnafu, UnknownArgumentSnafu};
use kiln_codegen::{Arguments, ArgumentsBinder};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Int(Option<i32>),
    Float(Option<f32>),
}

/// Holds one value per declared scalar; only declared names can be set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgumentBinder {
    slots: BTreeMap<String, Slot>,
}

impl ArgumentBinder {
    /// Start from the values the operation set at construction.
    pub fn new(args: &Arguments) -> Self {
        let slots = args
            .scalar_names()
            .map(|name| {
                let slot = if args.is_int(name) { Slot::Int(args.int(name)) } else { Slot::Float(args.float(name)) };
                (name.to_string(), slot)
            })
            .collect();
        Self { slots }
    }

    /// Declared scalars that still have no value.
    pub fn unresolved(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Int(None) | Slot::Float(None)))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn ints(&self) -> BTreeMap<String, i32> {
        self.slots
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Int(Some(value)) => Some((name.clone(), *value)),
                _ => None,
            })
            .collect()
    }

    pub fn floats(&self) -> BTreeMap<String, f32> {
        self.slots
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Float(Some(value)) => Some((name.clone(), *value)),
                _ => None,
            })
            .collect()
    }
}

impl ArgumentsBinder for ArgumentBinder {
    fn set_int(&mut self, name: &str, value: i32) -> kiln_codegen::Result<()> {
        match self.slots.get_mut(name) {
            Some(Slot::Int(slot)) => *slot = Some(value),
            Some(Slot::Float(_)) => return ArgumentKindSnafu { name, expected: "int" }.fail(),
            None => return UnknownArgumentSnafu { name }.fail(),
        }
        trace!(name, value, "bound int argument");
        Ok(())
    }

    fn set_float(&mut self, name: &str, value: f32) -> kiln_codegen::Result<()> {
        match self.slots.get_mut(name) {
            Some(Slot::Float(slot)) => *slot = Some(value),
            Some(Slot::Int(_)) => return ArgumentKindSnafu { name, expected: "float" }.fail(),
            None => return UnknownArgumentSnafu { name }.fail(),
        }
        trace!(name, value, "bound float argument");
        Ok(())
    }
}
