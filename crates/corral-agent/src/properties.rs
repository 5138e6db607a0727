use std::{fs, path::Path};

use anyhow::Context;
use serde_yaml::{Mapping, Value};

fn property_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
        return None;
    }
    let end = trimmed.find(['=', ':']).unwrap_or(trimmed.len());
    Some(trimmed[..end].trim_end())
}

/// Replaces or appends `key=value` lines, keeping comments and unrelated keys.
pub fn upsert_properties(input: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::new();
    let mut written = vec![false; values.len()];

    for line in input.lines() {
        let hit = property_key(line).and_then(|k| values.iter().position(|(key, _)| *key == k));
        match hit {
            Some(idx) if !written[idx] => {
                let (k, v) = values[idx];
                out.push_str(&format!("{k}={v}\n"));
                written[idx] = true;
            }
            // Later duplicates of an owned key are dropped.
            Some(_) => {}
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }

    for (idx, (k, v)) in values.iter().enumerate() {
        if !written[idx] {
            out.push_str(&format!("{k}={v}\n"));
        }
    }
    out
}

pub fn set_properties(path: &Path, values: &[(&str, &str)]) -> anyhow::Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let out = upsert_properties(&existing, values);
    fs::write(path, out.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Turns off online mode and points the first listener at `port`.
pub fn configure_proxy_yaml(path: &Path, name: &str, port: u16) -> anyhow::Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };

    let mut doc: Value = if existing.trim().is_empty() {
        Value::Mapping(Mapping::new())
    } else {
        serde_yaml::from_str(&existing).with_context(|| format!("parse {}", path.display()))?
    };
    let Some(root) = doc.as_mapping_mut() else {
        anyhow::bail!("{} is not a yaml mapping", path.display());
    };

    root.insert(Value::from("online_mode"), Value::Bool(false));

    let listeners = root
        .entry(Value::from("listeners"))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    if !listeners.is_sequence() {
        *listeners = Value::Sequence(Vec::new());
    }
    if let Some(seq) = listeners.as_sequence_mut() {
        if seq.is_empty() {
            seq.push(Value::Mapping(Mapping::new()));
        } else if !seq[0].is_mapping() {
            seq[0] = Value::Mapping(Mapping::new());
        }
        if let Some(first) = seq[0].as_mapping_mut() {
            first.insert(Value::from("host"), Value::from(format!("0.0.0.0:{port}")));
            first.insert(Value::from("motd"), Value::from(name));
        }
    }

    let out = serde_yaml::to_string(&doc).context("serialize proxy config")?;
    fs::write(path, out.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
