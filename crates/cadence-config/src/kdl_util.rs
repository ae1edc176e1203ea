// Helper functions for extracting values from KDL nodes

use kdl::KdlNode;

use crate::{ConfigError, ConfigResult};

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

/// Positional argument `index` rendered as a string, whatever its KDL type.
pub(crate) fn get_arg_as_string(node: &KdlNode, index: usize) -> Option<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .nth(index)
        .map(|e| match e.value().as_string() {
            Some(s) => s.to_string(),
            None => e.value().to_string(),
        })
}

pub(crate) fn get_integer_arg(node: &KdlNode, index: usize) -> Option<i128> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .nth(index)
        .and_then(|e| e.value().as_integer())
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// Non-negative integer property, rejecting negative or oversized values.
pub(crate) fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => {
            let raw = value.as_integer().ok_or_else(|| {
                ConfigError::invalid(name, format!("expected an integer, got {}", value))
            })?;
            u64::try_from(raw)
                .map(Some)
                .map_err(|_| ConfigError::invalid(name, format!("out of range: {}", raw)))
        }
    }
}

pub(crate) fn get_u32_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
    match get_u64_prop(node, name)? {
        None => Ok(None),
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| ConfigError::invalid(name, format!("out of range: {}", v))),
    }
}

pub(crate) fn get_i32_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<i32>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => {
            let raw = value.as_integer().ok_or_else(|| {
                ConfigError::invalid(name, format!("expected an integer, got {}", value))
            })?;
            i32::try_from(raw)
                .map(Some)
                .map_err(|_| ConfigError::invalid(name, format!("out of range: {}", raw)))
        }
    }
}

pub(crate) fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated properties like needs="a" needs="b"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax: a child node carrying the values as arguments
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}
