//! Structural diff between two observed-state trees.
//!
//! Maps are compared key by key. Lists are compared order-insensitively:
//! when every element on both sides is a map carrying a unique identity key
//! (`id`, `pid` or `name`, tried in that order) elements are paired by that
//! key and diffed recursively; otherwise lists are compared as multisets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hashing::{canonical_string, equivalent};
use crate::tree::Tree;

const IDENTITY_KEYS: [&str; 3] = ["id", "pid", "name"];

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PathValue {
    pub path: String,
    pub value: Tree,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValueChange {
    pub path: String,
    pub old: Tree,
    pub new: Tree,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DiffResult {
    /// Set when there was no previous state to compare against.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub initial: bool,
    #[serde(default)]
    pub added: Vec<PathValue>,
    #[serde(default)]
    pub removed: Vec<PathValue>,
    #[serde(default)]
    pub changed: Vec<ValueChange>,
}

impl DiffResult {
    pub fn initial_state() -> Self {
        Self {
            initial: true,
            ..Self::default()
        }
    }

    pub fn compute(old: &Tree, new: &Tree) -> Self {
        let mut out = Self::default();
        diff_node("", old, new, &mut out);
        out
    }

    pub fn is_empty(&self) -> bool {
        !self.initial && self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }

    pub fn added_values(&self) -> impl Iterator<Item = &Tree> {
        self.added.iter().map(|a| &a.value)
    }

    /// One line per difference: `+path = value`, `-path = value`, `~path: old -> new`.
    pub fn summary(&self) -> Vec<String> {
        if self.initial {
            return vec!["initial state".to_string()];
        }
        let mut lines = Vec::with_capacity(self.len());
        for a in &self.added {
            lines.push(format!("+{} = {}", a.path, canonical_string(&a.value)));
        }
        for r in &self.removed {
            lines.push(format!("-{} = {}", r.path, canonical_string(&r.value)));
        }
        for c in &self.changed {
            lines.push(format!(
                "~{}: {} -> {}",
                c.path,
                canonical_string(&c.old),
                canonical_string(&c.new)
            ));
        }
        lines
    }
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn index_path(parent: &str, idx: usize) -> String {
    format!("{parent}[{idx}]")
}

fn diff_node(path: &str, old: &Tree, new: &Tree, out: &mut DiffResult) {
    match (old, new) {
        (Tree::Map(a), Tree::Map(b)) => {
            for (k, va) in a {
                let p = child_path(path, k);
                match b.get(k) {
                    Some(vb) => diff_node(&p, va, vb, out),
                    None => out.removed.push(PathValue { path: p, value: va.clone() }),
                }
            }
            for (k, vb) in b {
                if !a.contains_key(k) {
                    out.added.push(PathValue {
                        path: child_path(path, k),
                        value: vb.clone(),
                    });
                }
            }
        }
        (Tree::List(a), Tree::List(b)) => diff_list(path, a, b, out),
        _ => {
            if !equivalent(old, new) {
                out.changed.push(ValueChange {
                    path: path.to_string(),
                    old: old.clone(),
                    new: new.clone(),
                });
            }
        }
    }
}

fn diff_list(path: &str, a: &[Tree], b: &[Tree], out: &mut DiffResult) {
    if let Some(key) = identity_key(a, b) {
        let left = index_by(a, key);
        let right = index_by(b, key);
        for (k, (i, ea)) in &left {
            match right.get(k) {
                Some((j, eb)) => diff_node(&index_path(path, *j), ea, eb, out),
                None => out.removed.push(PathValue {
                    path: index_path(path, *i),
                    value: (*ea).clone(),
                }),
            }
        }
        for (k, (j, eb)) in &right {
            if !left.contains_key(k) {
                out.added.push(PathValue {
                    path: index_path(path, *j),
                    value: (*eb).clone(),
                });
            }
        }
        return;
    }

    // Multiset comparison over canonical encodings.
    let mut remaining: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, ea) in a.iter().enumerate() {
        remaining.entry(canonical_string(ea)).or_default().push(i);
    }
    for (j, eb) in b.iter().enumerate() {
        let matched = remaining
            .get_mut(&canonical_string(eb))
            .and_then(|slots| slots.pop())
            .is_some();
        if !matched {
            out.added.push(PathValue {
                path: index_path(path, j),
                value: eb.clone(),
            });
        }
    }
    let mut leftovers: Vec<usize> = remaining.into_values().flatten().collect();
    leftovers.sort_unstable();
    for i in leftovers {
        out.removed.push(PathValue {
            path: index_path(path, i),
            value: a[i].clone(),
        });
    }
}

fn identity_of(item: &Tree, key: &str) -> Option<String> {
    match item.get(key)? {
        v @ (Tree::Str(_) | Tree::Int(_)) => Some(canonical_string(v)),
        _ => None,
    }
}

fn identity_key(a: &[Tree], b: &[Tree]) -> Option<&'static str> {
    if a.is_empty() && b.is_empty() {
        return None;
    }
    IDENTITY_KEYS.into_iter().find(|key| {
        [a, b].iter().all(|side| {
            let mut seen = std::collections::HashSet::new();
            side.iter()
                .all(|item| identity_of(item, key).is_some_and(|id| seen.insert(id)))
        })
    })
}

fn index_by<'a>(items: &'a [Tree], key: &str) -> BTreeMap<String, (usize, &'a Tree)> {
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| identity_of(item, key).map(|id| (id, (i, item))))
        .collect()
}
