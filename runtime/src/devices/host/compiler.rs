//! Front-end checks of translated kernel source.

use std::sync::Arc;

use kiln_device::{GpuApi, GpuInfo};
use snafu::ensure;
use tracing::debug;

use crate::device::{Compiler, KernelSource, Program};
use crate::error::{CompilationSnafu, Result};

use super::program::HostProgram;

/// Accepts source that the reference device can run, as [`HostProgram`]s.
#[derive(Debug, Clone)]
pub struct HostCompiler {
    info: Arc<GpuInfo>,
}

impl HostCompiler {
    pub fn new(info: Arc<GpuInfo>) -> Self {
        Self { info }
    }
}

fn balanced(code: &str) -> Result<(), String> {
    let mut open = Vec::new();
    for (offset, ch) in code.char_indices() {
        match ch {
            '(' | '[' | '{' => open.push(ch),
            ')' | ']' | '}' => {
                let expected = match ch {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if open.pop() != Some(expected) {
                    return Err(format!("unbalanced '{ch}' at byte {offset}"));
                }
            }
            _ => {}
        }
    }
    match open.last() {
        Some(ch) => Err(format!("unclosed '{ch}'")),
        None => Ok(()),
    }
}

fn is_identifier(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

/// Names referenced as `args.<name>`.
fn referenced_arguments(code: &str) -> impl Iterator<Item = &str> {
    code.match_indices("args.").filter_map(|(start, _)| {
        let preceded = code[..start].chars().next_back().is_some_and(is_identifier);
        let rest = &code[start + "args.".len()..];
        let end = rest.find(|ch| !is_identifier(ch)).unwrap_or(rest.len());
        (!preceded && end > 0).then(|| &rest[..end])
    })
}

fn scalar_size(type_name: &str) -> Option<usize> {
    let (scalar, lanes) = match type_name.find(|ch: char| ch.is_ascii_digit()) {
        Some(split) => (&type_name[..split], type_name[split..].parse().ok()?),
        None => (type_name, 1),
    };
    let size = match scalar {
        "float" | "int" | "uint" => 4,
        "half" | "short" => 2,
        _ => return None,
    };
    Some(size * lanes)
}

/// Bytes of local memory declared with `qualifier type name[count];`.
fn local_memory_bytes(code: &str, qualifier: &str) -> Result<usize, String> {
    let mut total = 0;
    for line in code.lines() {
        let Some(declaration) = line.trim().strip_prefix(qualifier).and_then(|rest| rest.strip_prefix(' ')) else {
            continue;
        };
        let mut parts = declaration.split_whitespace();
        let (Some(type_name), Some(array)) = (parts.next(), parts.next()) else {
            return Err(format!("malformed local declaration '{}'", line.trim()));
        };
        let size = scalar_size(type_name).ok_or_else(|| format!("unknown local memory type '{type_name}'"))?;
        let count = array
            .split_once('[')
            .and_then(|(_, rest)| rest.split_once(']'))
            .and_then(|(count, _)| count.parse::<usize>().ok())
            .ok_or_else(|| format!("local array '{array}' has no constant size"))?;
        total += size * count;
    }
    Ok(total)
}

impl HostCompiler {
    fn check(&self, source: &KernelSource) -> Result<(), String> {
        let signature = match source.api {
            GpuApi::OpenCl => format!("__kernel void {}(", source.entry_point),
            GpuApi::Metal => format!("kernel void {}(", source.entry_point),
        };
        if !source.code.contains(&signature) {
            return Err(format!("entry point '{}' not found", source.entry_point));
        }
        balanced(&source.code)?;

        if let Some(name) = referenced_arguments(&source.code).find(|name| !source.declares(name)) {
            return Err(format!("argument '{name}' is not declared"));
        }

        let qualifier = match source.api {
            GpuApi::OpenCl => "__local",
            GpuApi::Metal => "threadgroup",
        };
        let local = local_memory_bytes(&source.code, qualifier)?;
        if local > self.info.local_memory_size {
            return Err(format!("{local} bytes of local memory exceed the device's {}", self.info.local_memory_size));
        }

        let work_group = source.work_group_size;
        let lanes: usize = work_group.iter().product();
        let fits = work_group.iter().zip(self.info.max_work_group_size).all(|(size, max)| *size <= max);
        if !fits || lanes > self.info.max_work_group_total_size {
            return Err(format!("work group {work_group:?} exceeds the device limits"));
        }
        Ok(())
    }
}

impl Compiler for HostCompiler {
    fn compile(&self, source: &KernelSource) -> Result<Box<dyn Program>> {
        if let Err(reason) = self.check(source) {
            debug!(name = %source.name, %reason, "rejected kernel source");
            return CompilationSnafu { name: source.name.clone(), reason }.fail();
        }
        debug!(name = %source.name, api = %source.api, bytes = source.code.len(), "compiled kernel");
        Ok(Box::new(HostProgram::new(source.clone())))
    }
}
