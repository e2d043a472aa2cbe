use anyhow::{Context, Result};

use crate::ir::Class;

/// Parse an IR document.
pub(crate) fn read_class(bytes: &[u8]) -> Result<Class> {
    serde_json::from_slice(bytes).context("failed to parse IR document")
}

/// Render a class as an IR document for the external serializer.
pub(crate) fn write_class(class: &Class) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(class)
        .with_context(|| format!("failed to serialize {}", class.name))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Relative output path of a class's IR document.
pub(crate) fn document_name(class: &Class) -> String {
    format!("{}.json", class.name)
}
