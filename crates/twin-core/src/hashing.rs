use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{ids::StateId, tree::Tree};

/// Canonical text encoding of a tree.
///
/// - map keys are emitted in sorted order (`BTreeMap`);
/// - list elements are emitted sorted by their own canonical encoding, so
///   collections compare as multisets;
/// - integral floats are emitted as integers.
pub fn canonical_string(tree: &Tree) -> String {
    let mut out = String::new();
    write_canonical(tree, &mut out);
    out
}

fn write_canonical(tree: &Tree, out: &mut String) {
    match tree {
        Tree::Null => out.push_str("null"),
        Tree::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Tree::Int(i) => out.push_str(&i.to_string()),
        Tree::Float(f) => match tree.as_i64() {
            Some(i) => out.push_str(&i.to_string()),
            None => match serde_json::Number::from_f64(*f) {
                Some(n) => out.push_str(&n.to_string()),
                None => out.push_str("null"),
            },
        },
        Tree::Str(s) => out.push_str(&Value::from(s.as_str()).to_string()),
        Tree::List(items) => {
            let mut encoded: Vec<String> = items.iter().map(canonical_string).collect();
            encoded.sort();
            out.push('[');
            out.push_str(&encoded.join(","));
            out.push(']');
        }
        Tree::Map(map) => {
            out.push('{');
            for (i, (k, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(k.as_str()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
    }
}

/// Stable content fingerprint: SHA-256 over the canonical encoding.
pub fn fingerprint(tree: &Tree) -> StateId {
    let mut hasher = Sha256::new();
    hasher.update(canonical_string(tree).as_bytes());
    StateId(hex::encode(hasher.finalize()))
}

/// Order-insensitive structural equality.
pub fn equivalent(a: &Tree, b: &Tree) -> bool {
    canonical_string(a) == canonical_string(b)
}
