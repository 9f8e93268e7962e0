//! Parsers for `virsh` text output.

use twin_core::{EpochMs, MS_PER_SECOND};

/// Non-empty trimmed lines, as printed by `--name` listings.
pub(crate) fn names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn tag<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = xml.find(&open)? + open.len();
    let len = xml[start..].find(&close)?;
    Some(xml[start..start + len].trim())
}

/// Snapshot XML up to the embedded `<domain>` definition, whose own
/// elements (`<description>` among them) must not be read as the snapshot's.
fn snapshot_part(xml: &str) -> &str {
    const DOMAIN: &str = "<domain";
    let mut from = 0;
    while let Some(pos) = xml[from..].find(DOMAIN) {
        let at = from + pos;
        let rest = &xml[at + DOMAIN.len()..];
        if rest.starts_with(|c: char| c == '>' || c.is_whitespace()) {
            return &xml[..at];
        }
        from = at + DOMAIN.len();
    }
    xml
}

/// `<creationTime>` of a snapshot's XML, in milliseconds.
pub(crate) fn creation_time_ms(xml: &str) -> Option<EpochMs> {
    tag(snapshot_part(xml), "creationTime")?
        .parse::<i64>()
        .ok()
        .map(|secs| secs * MS_PER_SECOND)
}

pub(crate) fn description(xml: &str) -> Option<String> {
    tag(snapshot_part(xml), "description")
        .filter(|d| !d.is_empty())
        .map(unescape)
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// First address from `domifaddr`, IPv4 preferred, prefix length stripped.
pub(crate) fn guest_address(stdout: &str) -> Option<String> {
    let rows: Vec<(&str, &str)> = stdout
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.as_slice() {
                [_, _, proto @ ("ipv4" | "ipv6"), addr, ..] => Some((*proto, *addr)),
                _ => None,
            }
        })
        .collect();
    rows.iter()
        .find(|(proto, _)| *proto == "ipv4")
        .or_else(|| rows.first())
        .map(|(_, addr)| addr.split('/').next().unwrap_or(*addr).to_string())
}

/// Whether virsh stderr means "no such domain".
pub(crate) fn is_missing_domain(stderr: &str) -> bool {
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}

/// Whether virsh stderr means "no current snapshot".
pub(crate) fn is_no_current(stderr: &str) -> bool {
    stderr.contains("no current snapshot")
}
