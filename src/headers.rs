//! Ordered, case-preserving header multimap.
//!
//! Lookup is case-insensitive, iteration preserves insertion order, and
//! `truncate()` keeps the allocation alive so a worker can recycle the same
//! set across requests.

/// Case-folding policy applied to header names before the filter chain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderCase {
    #[default]
    Preserve,
    ToLower,
    ToUpper,
}

impl HeaderCase {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "preserve" => Some(HeaderCase::Preserve),
            "tolower" | "lower" => Some(HeaderCase::ToLower),
            "toupper" | "upper" => Some(HeaderCase::ToUpper),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a header, preserving any existing entries of the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name` in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace the first entry of `name` (appending when absent) and drop
    /// any duplicates.
    pub fn update(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut replaced = false;
        self.entries.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if replaced {
                    return false;
                }
                *v = value.clone();
                replaced = true;
            }
            true
        });
        if !replaced {
            self.entries.push((name.to_string(), value));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Drop all entries but keep the allocation for reuse.
    pub fn truncate(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Apply the configured case folding to every header name.
    pub fn fold_case(&mut self, case: HeaderCase) {
        match case {
            HeaderCase::Preserve => {}
            HeaderCase::ToLower => {
                for (n, _) in &mut self.entries {
                    n.make_ascii_lowercase();
                }
            }
            HeaderCase::ToUpper => {
                for (n, _) in &mut self.entries {
                    n.make_ascii_uppercase();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup_preserves_case() {
        let mut h = Headers::new();
        h.push("Content-Type", "text/html");
        h.push("X-Custom", "a");
        h.push("x-custom", "b");

        assert_eq!(h.get("content-type"), Some("text/html"));
        assert_eq!(h.get_all("X-CUSTOM").collect::<Vec<_>>(), vec!["a", "b"]);
        // Names keep their original spelling.
        assert_eq!(h.iter().next().unwrap().0, "Content-Type");
    }

    #[test]
    fn test_update_collapses_duplicates() {
        let mut h = Headers::new();
        h.push("Accept", "1");
        h.push("accept", "2");
        h.update("Accept", "3");
        assert_eq!(h.get_all("accept").collect::<Vec<_>>(), vec!["3"]);
    }

    #[test]
    fn test_truncate_keeps_capacity() {
        let mut h = Headers::with_capacity(8);
        for i in 0..8 {
            h.push(format!("h{i}"), "v");
        }
        h.truncate();
        assert!(h.is_empty());
        h.push("again", "v");
        assert_eq!(h.get("AGAIN"), Some("v"));
    }

    #[test]
    fn test_fold_case() {
        let mut h = Headers::new();
        h.push("Content-Length", "0");
        h.fold_case(HeaderCase::ToLower);
        assert_eq!(h.iter().next().unwrap().0, "content-length");
        h.fold_case(HeaderCase::ToUpper);
        assert_eq!(h.iter().next().unwrap().0, "CONTENT-LENGTH");
    }
}
