use thiserror::Error;

use crate::tree::Tree;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("state payload must be a map, found {0}")]
    NotAMap(&'static str),
    #[error("`{field}` must be {expected}, found {found}")]
    WrongType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
}

fn wrong(field: impl Into<String>, expected: &'static str, found: &Tree) -> ValidationError {
    ValidationError::WrongType {
        field: field.into(),
        expected,
        found: found.kind(),
    }
}

fn expect_map(field: &str, t: &Tree) -> Result<(), ValidationError> {
    t.as_map().map(|_| ()).ok_or_else(|| wrong(field, "a map", t))
}

fn expect_list<'a>(field: &str, t: &'a Tree) -> Result<&'a [Tree], ValidationError> {
    t.as_list().ok_or_else(|| wrong(field, "a list", t))
}

fn expect_optional(
    item: &Tree,
    prefix: &str,
    key: &str,
    expected: &'static str,
    ok: fn(&Tree) -> bool,
) -> Result<(), ValidationError> {
    match item.get(key) {
        Some(v) if !ok(v) => Err(wrong(format!("{prefix}.{key}"), expected, v)),
        _ => Ok(()),
    }
}

fn is_str(t: &Tree) -> bool {
    t.as_str().is_some()
}

fn is_int(t: &Tree) -> bool {
    t.as_i64().is_some()
}

fn is_number(t: &Tree) -> bool {
    t.as_f64().is_some()
}

fn is_list(t: &Tree) -> bool {
    t.as_list().is_some()
}

fn is_map(t: &Tree) -> bool {
    t.as_map().is_some()
}

fn is_scalar(t: &Tree) -> bool {
    t.scalar_text().is_some()
}

/// Ingress check for an observed state. Only the shape the projector relies
/// on is enforced; unknown fields are accepted as-is.
pub fn validate_state(tree: &Tree) -> Result<(), ValidationError> {
    if tree.as_map().is_none() {
        return Err(ValidationError::NotAMap(tree.kind()));
    }

    if let Some(hw) = tree.get("hardware") {
        expect_map("hardware", hw)?;
    }

    if let Some(services) = tree.get("services") {
        for (i, svc) in expect_list("services", services)?.iter().enumerate() {
            validate_service(&format!("services[{i}]"), svc)?;
        }
    }

    if let Some(processes) = tree.get("processes") {
        for (i, proc) in expect_list("processes", processes)?.iter().enumerate() {
            validate_process(&format!("processes[{i}]"), proc)?;
        }
    }

    Ok(())
}

fn validate_service(prefix: &str, svc: &Tree) -> Result<(), ValidationError> {
    // A bare string is a service known only by name.
    if svc.as_str().is_some() {
        return Ok(());
    }
    expect_map(prefix, svc)?;
    expect_optional(svc, prefix, "name", "a string", is_str)?;
    expect_optional(svc, prefix, "type", "a string", is_str)?;
    expect_optional(svc, prefix, "status", "a string", is_str)?;
    expect_optional(svc, prefix, "image", "a string", is_str)?;
    expect_optional(svc, prefix, "pid", "an integer", is_int)?;
    expect_optional(svc, prefix, "environment", "a list", is_list)?;

    for key in ["ports", "volumes"] {
        if let Some(entries) = svc.get(key) {
            let field = format!("{prefix}.{key}");
            for (i, entry) in expect_list(&field, entries)?.iter().enumerate() {
                expect_map(&format!("{field}[{i}]"), entry)?;
            }
        }
    }
    if let Some(ports) = svc.get("ports").and_then(Tree::as_list) {
        for (i, port) in ports.iter().enumerate() {
            let p = format!("{prefix}.ports[{i}]");
            expect_optional(port, &p, "container_port", "a scalar", is_scalar)?;
            expect_optional(port, &p, "host_port", "a scalar", is_scalar)?;
            expect_optional(port, &p, "host_ip", "a string", is_str)?;
        }
    }
    if let Some(volumes) = svc.get("volumes").and_then(Tree::as_list) {
        for (i, vol) in volumes.iter().enumerate() {
            let p = format!("{prefix}.volumes[{i}]");
            expect_optional(vol, &p, "source", "a string", is_str)?;
            expect_optional(vol, &p, "destination", "a string", is_str)?;
            expect_optional(vol, &p, "read_only", "a bool", |t| t.as_bool().is_some())?;
        }
    }
    Ok(())
}

fn validate_process(prefix: &str, proc: &Tree) -> Result<(), ValidationError> {
    expect_map(prefix, proc)?;
    expect_optional(proc, prefix, "pid", "an integer", is_int)?;
    expect_optional(proc, prefix, "name", "a string", is_str)?;
    expect_optional(proc, prefix, "username", "a string", is_str)?;
    expect_optional(proc, prefix, "cwd", "a string", is_str)?;
    expect_optional(proc, prefix, "cpu_percent", "a number", is_number)?;
    expect_optional(proc, prefix, "memory_percent", "a number", is_number)?;
    expect_optional(proc, prefix, "cmdline", "a list", is_list)?;
    expect_optional(proc, prefix, "environment", "a list", is_list)?;
    expect_optional(proc, prefix, "memory_info", "a map", is_map)?;
    if let Some(mem) = proc.get("memory_info") {
        expect_optional(mem, &format!("{prefix}.memory_info"), "rss", "a number", is_number)?;
    }
    Ok(())
}
