//! Case-insensitive header list.
//!
//! Names keep the case they were given for display, lookups ignore it, and
//! insertion order is preserved so serialized heads are deterministic.

use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in order of appearance.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every value of `name` with `value`.
    ///
    /// The first occurrence keeps its position; the stored name takes the
    /// case of the new one.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(pos) => {
                self.entries[pos] = (name.clone(), value);
                let mut idx = pos + 1;
                while idx < self.entries.len() {
                    if self.entries[idx].0.eq_ignore_ascii_case(&name) {
                        self.entries.remove(idx);
                    } else {
                        idx += 1;
                    }
                }
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Add a value without touching existing ones (repeated headers).
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let first = self.get(name).map(str::to_string);
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        first
    }

    /// Layer `other` on top: its values replace ours name by name.
    pub fn merge(&mut self, other: &Headers) {
        for (name, value) in other.iter() {
            self.insert(name, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}

/// Turn a keyword-style name into a header name: `cache_control` → `Cache-Control`.
pub fn normalize_name(name: &str) -> String {
    name.split(['_', '-'])
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_ignores_case() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/json");
        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert!(headers.contains("CONTENT-TYPE"));
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut headers = Headers::new();
        headers.insert("Server", "a");
        headers.insert("Date", "today");
        headers.append("server", "b");
        headers.insert("SERVER", "c");

        let collected: Vec<_> = headers.iter().collect();
        assert_eq!(collected, vec![("SERVER", "c"), ("Date", "today")]);
    }

    #[test]
    fn test_get_all_keeps_order() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("set-cookie", "b=2");
        let values: Vec<_> = headers.get_all("SET-COOKIE").collect();
        assert_eq!(values, vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_merge_later_wins() {
        let mut base: Headers = [("Connection", "close"), ("Status", "200")]
            .into_iter()
            .collect();
        let extra: Headers = [("connection", "keep-alive")].into_iter().collect();
        base.merge(&extra);
        assert_eq!(base.get("Connection"), Some("keep-alive"));
        assert_eq!(base.len(), 2);
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("cache_control"), "Cache-Control");
        assert_eq!(normalize_name("x_forward_for"), "X-Forward-For");
        assert_eq!(normalize_name("host"), "Host");
        assert_eq!(normalize_name("CONTENT-TYPE"), "Content-Type");
    }
}
