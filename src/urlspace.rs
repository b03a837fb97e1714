//! URL-space routing: maps method + URL to arbitrary data (pool names,
//! request handlers).
//!
//! Entries are either inheriting (they cover the mapped node and everything
//! below it) or exact. Lookup prefers an exact entry at the node itself,
//! then the longest inheriting prefix.

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct UrlEntry<T> {
    pub method: String,
    pub path: String,
    pub inherit: bool,
    pub data: T,
}

#[derive(Debug, Clone)]
pub struct UrlSpace<T> {
    entries: Vec<UrlEntry<T>>,
}

impl<T> Default for UrlSpace<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

/// Split a mapspec like `"GET /api"` into method and normalized path.
pub fn parse_mapspec(spec: &str) -> Result<(String, String)> {
    let mut parts = spec.split_whitespace();
    let method = parts.next();
    let url = parts.next();
    match (method, url, parts.next()) {
        (Some(m), Some(u), None) if u.starts_with('/') => {
            Ok((m.to_string(), normalize(u)))
        }
        _ => Err(Error::Command(format!(
            "invalid mapspec '{spec}'; must be a two-element list of method and URL"
        ))),
    }
}

fn normalize(path: &str) -> String {
    if path.len() > 1 && path.ends_with('/') {
        path[..path.len() - 1].to_string()
    } else {
        path.to_string()
    }
}

/// True when `path` equals `node` or lies below it.
fn subtree_match(node: &str, path: &str) -> bool {
    if node == "/" {
        return true;
    }
    path == node || (path.starts_with(node) && path.as_bytes().get(node.len()) == Some(&b'/'))
}

impl<T> UrlSpace<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `data` at method/path, replacing any previous entry with the
    /// same method, path and inheritance.
    pub fn map(&mut self, method: &str, path: &str, inherit: bool, data: T) {
        let path = normalize(path);
        self.entries
            .retain(|e| !(e.method == method && e.path == path && e.inherit == inherit));
        self.entries.push(UrlEntry {
            method: method.to_string(),
            path,
            inherit,
            data,
        });
    }

    /// Remove the matching entry; returns whether one existed.
    pub fn unmap(&mut self, method: &str, path: &str, inherit: bool) -> bool {
        let path = normalize(path);
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.method == method && e.path == path && e.inherit == inherit));
        before != self.entries.len()
    }

    /// Route a request URL: an exact entry on the node wins, otherwise the
    /// longest inheriting prefix.
    pub fn lookup(&self, method: &str, url: &str) -> Option<&T> {
        let url = normalize(url.split('?').next().unwrap_or(url));
        let mut best: Option<&UrlEntry<T>> = None;
        for entry in &self.entries {
            if entry.method != method {
                continue;
            }
            if !entry.inherit {
                if entry.path == url {
                    return Some(&entry.data);
                }
                continue;
            }
            if subtree_match(&entry.path, &url)
                && best.is_none_or(|b| entry.path.len() > b.path.len())
            {
                best = Some(entry);
            }
        }
        best.map(|e| &e.data)
    }

    /// Introspection for the `mapped` command.
    ///
    /// `exact` restricts matching to the node itself; `noinherit` restricts
    /// to non-inheriting entries; `all` returns every candidate instead of
    /// the winning one.
    pub fn mapped(
        &self,
        method: &str,
        path: &str,
        exact: bool,
        all: bool,
        noinherit: bool,
    ) -> Vec<&UrlEntry<T>> {
        let path = normalize(path);
        let mut hits: Vec<&UrlEntry<T>> = self
            .entries
            .iter()
            .filter(|e| e.method == method)
            .filter(|e| !noinherit || !e.inherit)
            .filter(|e| {
                if exact {
                    e.path == path
                } else if e.inherit {
                    subtree_match(&e.path, &path)
                } else {
                    e.path == path
                }
            })
            .collect();
        hits.sort_by_key(|e| std::cmp::Reverse(e.path.len()));
        if !all {
            hits.truncate(1);
        }
        hits
    }

    pub fn iter(&self) -> impl Iterator<Item = &UrlEntry<T>> {
        self.entries.iter()
    }
}
