//! Named kernel arguments.
//!
//! Generated source refers to arguments as `args.<name>`. Scalars are declared up front and either
//! set at construction (attributes) or left unset until the binder fills them before each dispatch
//! (shape-dependent values such as channel masks). Objects carry constant data the operation owns.

use std::collections::BTreeMap;

use kiln_device::TensorDescriptor;
use kiln_dtype::DataType;
use snafu::OptionExt;

use crate::error::{ArgumentKindSnafu, Result, UnknownArgumentSnafu};

/// Constant data owned by an operation and uploaded when it is compiled.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuObject {
    /// Linear buffer of 4-element vectors.
    Buffer { data_type: DataType, data: Vec<u8> },
    /// Constant tensor, e.g. weights packed into a 2D texture.
    Tensor(TensorDescriptor),
}

impl GpuObject {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Buffer { data, .. } => data.len(),
            Self::Tensor(descriptor) => descriptor.memory_size_in_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scalar {
    Int(Option<i32>),
    Float(Option<f32>),
}

/// Receives per-invocation argument values.
pub trait ArgumentsBinder {
    fn set_int(&mut self, name: &str, value: i32) -> Result<()>;
    fn set_float(&mut self, name: &str, value: f32) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    scalars: BTreeMap<String, Scalar>,
    objects: BTreeMap<String, GpuObject>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an int argument, optionally with its value.
    pub fn add_int(&mut self, name: impl Into<String>, value: Option<i32>) {
        self.scalars.insert(name.into(), Scalar::Int(value));
    }

    /// Declare a float argument, optionally with its value.
    pub fn add_float(&mut self, name: impl Into<String>, value: Option<f32>) {
        self.scalars.insert(name.into(), Scalar::Float(value));
    }

    pub fn add_object(&mut self, name: impl Into<String>, object: GpuObject) {
        self.objects.insert(name.into(), object);
    }

    pub fn int(&self, name: &str) -> Option<i32> {
        match self.scalars.get(name)? {
            Scalar::Int(value) => *value,
            Scalar::Float(_) => None,
        }
    }

    pub fn float(&self, name: &str) -> Option<f32> {
        match self.scalars.get(name)? {
            Scalar::Float(value) => *value,
            Scalar::Int(_) => None,
        }
    }

    pub fn object(&self, name: &str) -> Option<&GpuObject> {
        self.objects.get(name)
    }

    pub fn objects(&self) -> impl Iterator<Item = (&str, &GpuObject)> {
        self.objects.iter().map(|(name, object)| (name.as_str(), object))
    }

    /// Names of int and float arguments, in declaration-independent order.
    pub fn scalar_names(&self) -> impl Iterator<Item = &str> {
        self.scalars.keys().map(String::as_str)
    }

    pub fn is_int(&self, name: &str) -> bool {
        matches!(self.scalars.get(name), Some(Scalar::Int(_)))
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.scalars.contains_key(name) || self.objects.contains_key(name)
    }

    /// Scalars that still have no value.
    pub fn unresolved(&self) -> Vec<&str> {
        self.scalars
            .iter()
            .filter(|(_, scalar)| matches!(scalar, Scalar::Int(None) | Scalar::Float(None)))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl ArgumentsBinder for Arguments {
    fn set_int(&mut self, name: &str, value: i32) -> Result<()> {
        let scalar = self.scalars.get_mut(name).context(UnknownArgumentSnafu { name })?;
        match scalar {
            Scalar::Int(slot) => *slot = Some(value),
            Scalar::Float(_) => return ArgumentKindSnafu { name, expected: "int" }.fail(),
        }
        Ok(())
    }

    fn set_float(&mut self, name: &str, value: f32) -> Result<()> {
        let scalar = self.scalars.get_mut(name).context(UnknownArgumentSnafu { name })?;
        match scalar {
            Scalar::Float(slot) => *slot = Some(value),
            Scalar::Int(_) => return ArgumentKindSnafu { name, expected: "float" }.fail(),
        }
        Ok(())
    }
}
