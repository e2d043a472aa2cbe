use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;
use zip::ZipArchive;

/// How a unit's bytes are decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UnitKind {
    ClassFile,
    Document,
}

/// One compiled unit discovered in the inputs.
#[derive(Clone, Debug)]
pub(crate) struct Unit {
    /// Relative path the unit is written back under when left unchanged.
    pub(crate) name: String,
    /// Where the unit was read from, for diagnostics and reports.
    pub(crate) origin: String,
    pub(crate) kind: UnitKind,
    pub(crate) bytes: Vec<u8>,
}

/// Collect units from files, archives and directories in deterministic order.
pub(crate) fn scan_inputs(inputs: &[PathBuf]) -> Result<Vec<Unit>> {
    let mut units = Vec::new();

    // Keep deterministic ordering by sorting inputs and directory listings.
    let mut entries = inputs.to_vec();
    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            scan_dir(&entry, &entry, &mut units)?;
        } else {
            let name = entry
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .with_context(|| format!("input has no file name: {}", entry.display()))?;
            scan_file(&entry, name, true, &mut units)?;
        }
    }

    let mut names = BTreeSet::new();
    for unit in &units {
        if !names.insert(unit.name.as_str()) {
            anyhow::bail!("duplicate unit {} (from {})", unit.name, unit.origin);
        }
    }
    Ok(units)
}

fn scan_dir(root: &Path, path: &Path, units: &mut Vec<Unit>) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            scan_dir(root, &entry, units)?;
        } else {
            scan_file(&entry, relative_name(root, &entry)?, false, units)?;
        }
    }

    Ok(())
}

fn scan_file(path: &Path, name: String, strict: bool, units: &mut Vec<Unit>) -> Result<()> {
    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "class" if is_module_info(&name) => Ok(()),
        "class" => push_file_unit(path, name, UnitKind::ClassFile, units),
        "json" => push_file_unit(path, name, UnitKind::Document, units),
        "jar" | "zip" => scan_jar_file(path, units),
        _ => {
            if strict {
                anyhow::bail!("unsupported input file: {}", path.display())
            } else {
                Ok(())
            }
        }
    }
}

fn push_file_unit(path: &Path, name: String, kind: UnitKind, units: &mut Vec<Unit>) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    units.push(Unit {
        name,
        origin: path_key(path),
        kind,
        bytes,
    });
    Ok(())
}

fn scan_jar_file(path: &Path, units: &mut Vec<Unit>) -> Result<()> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    // (output name, raw entry name)
    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let raw = entry.name().to_string();
        if !raw.ends_with(".class") || is_module_info(&raw) {
            continue;
        }
        match entry.enclosed_name() {
            Some(enclosed) => entry_names.push((slash_name(&enclosed), raw)),
            None => warn!(jar = %path.display(), entry = %raw, "skipping entry outside the archive root"),
        }
    }

    entry_names.sort();

    for (name, raw) in entry_names {
        let mut entry = archive
            .by_name(&raw)
            .with_context(|| format!("failed to read {}:{}", path.display(), raw))?;
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed to read {}:{}", path.display(), raw))?;
        units.push(Unit {
            origin: jar_entry_uri(path, &raw),
            name,
            kind: UnitKind::ClassFile,
            bytes,
        });
    }

    Ok(())
}

fn is_module_info(name: &str) -> bool {
    name.ends_with("module-info.class")
}

/// Slash-separated path of `path` below `root`.
fn relative_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    Ok(slash_name(relative))
}

fn slash_name(relative: &Path) -> String {
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.join("/")
}

fn jar_entry_uri(jar_path: &Path, entry_name: &str) -> String {
    format!("jar:{}!/{}", jar_path.to_string_lossy(), entry_name)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
