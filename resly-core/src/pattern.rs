use std::fmt;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A resource pattern of dot-separated parts.
///
/// A part is one of:
///
/// - a literal, matching the same token byte-exactly (`library`),
/// - a placeholder, capturing one token under a name (`$id`),
/// - an anonymous wildcard, consuming one token without binding (`*`),
/// - a terminal full wildcard, consuming one or more remaining tokens (`>`).
///
/// The empty pattern is valid and denotes "no prefix".
///
/// `Pattern` is a thin wrapper over the string form; validation is explicit
/// via [`is_valid`](Pattern::is_valid), and the matching methods assume a
/// valid pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(String);

impl Pattern {
    pub fn new(p: impl Into<String>) -> Self {
        Pattern(p.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reports whether the pattern is well formed.
    ///
    /// Rejects empty parts, illegal characters in literals, a non-terminal
    /// `>`, empty or malformed tag names, and duplicate tag names.
    pub fn is_valid(&self) -> bool {
        if self.0.is_empty() {
            return true;
        }
        let parts: Vec<&str> = self.0.split('.').collect();
        let last = parts.len() - 1;
        let mut tags: Vec<&str> = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            match part_kind(part) {
                Some(PartKind::Full) => {
                    if i != last {
                        return false;
                    }
                }
                Some(PartKind::Tag(name)) => {
                    if tags.contains(&name) {
                        return false;
                    }
                    tags.push(name);
                }
                Some(PartKind::Wildcard) | Some(PartKind::Literal) => {}
                None => return false,
            }
        }
        true
    }

    /// Reports whether the resource name `rname` matches the pattern.
    ///
    /// The result is unspecified for invalid patterns; callers are expected
    /// to validate at registration.
    pub fn matches(&self, rname: &str) -> bool {
        self.match_with(rname, |_, _| {})
    }

    /// Like [`matches`](Pattern::matches), but also extracts the tokens
    /// bound by placeholders. Returns `None` on a mismatch.
    pub fn values(&self, rname: &str) -> Option<HashMap<String, String>> {
        let mut vals = HashMap::new();
        if self.match_with(rname, |name, token| {
            vals.insert(name.to_string(), token.to_string());
        }) {
            Some(vals)
        } else {
            None
        }
    }

    /// Replaces every placeholder that has an entry in `tags` with its
    /// value, leaving the remaining parts untouched.
    pub fn replace_tags(&self, tags: &HashMap<String, String>) -> Pattern {
        self.replace_with(move |name| tags.get(name).map(String::as_str))
    }

    /// Replaces the single placeholder `$<name>` with `value`.
    pub fn replace_tag(&self, name: &str, value: &str) -> Pattern {
        self.replace_with(move |n| if n == name { Some(value) } else { None })
    }

    /// Byte offset of the first part that is a wildcard (`*`), a full
    /// wildcard (`>`), or a placeholder (`$`), or `None` when the pattern
    /// has no such part.
    pub fn index_wildcard(&self) -> Option<usize> {
        if self.0.is_empty() {
            return None;
        }
        let mut offset = 0;
        for part in self.0.split('.') {
            if matches!(part.as_bytes().first(), Some(b'*') | Some(b'>') | Some(b'$')) {
                return Some(offset);
            }
            offset += part.len() + 1;
        }
        None
    }

    fn match_with(&self, rname: &str, mut bind: impl FnMut(&str, &str)) -> bool {
        if self.0.is_empty() {
            return rname.is_empty();
        }
        if rname.is_empty() {
            return false;
        }
        let mut tokens = rname.split('.');
        let mut parts = self.0.split('.');
        loop {
            let part = match parts.next() {
                Some(p) => p,
                None => return tokens.next().is_none(),
            };
            if part == ">" {
                // Terminal; consumes one or more remaining tokens.
                return tokens.next().is_some();
            }
            let token = match tokens.next() {
                Some(t) => t,
                None => return false,
            };
            match part.as_bytes().first() {
                Some(b'$') => bind(&part[1..], token),
                Some(b'*') => {}
                _ => {
                    if part != token {
                        return false;
                    }
                }
            }
        }
    }

    fn replace_with<'v>(&self, mut value: impl FnMut(&str) -> Option<&'v str>) -> Pattern {
        if self.0.is_empty() {
            return self.clone();
        }
        let parts: Vec<&str> = self
            .0
            .split('.')
            .map(|part| {
                if let Some(name) = part.strip_prefix('$') {
                    value(name).unwrap_or(part)
                } else {
                    part
                }
            })
            .collect();
        Pattern(parts.join("."))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Pattern {
    fn from(p: &str) -> Self {
        Pattern(p.to_string())
    }
}

impl From<String> for Pattern {
    fn from(p: String) -> Self {
        Pattern(p)
    }
}

impl AsRef<str> for Pattern {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub(crate) enum PartKind<'a> {
    Literal,
    Wildcard,
    Full,
    Tag(&'a str),
}

/// Classifies a single pattern part, or `None` when malformed.
pub(crate) fn part_kind(part: &str) -> Option<PartKind<'_>> {
    match part.as_bytes().first() {
        None => None,
        Some(b'>') => {
            if part.len() == 1 {
                Some(PartKind::Full)
            } else {
                None
            }
        }
        Some(b'*') => {
            if part.len() == 1 {
                Some(PartKind::Wildcard)
            } else {
                None
            }
        }
        Some(b'$') => {
            let name = &part[1..];
            if !name.is_empty()
                && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
            {
                Some(PartKind::Tag(name))
            } else {
                None
            }
        }
        Some(_) => {
            if part
                .bytes()
                .all(|b| (0x21..=0x7e).contains(&b) && !matches!(b, b'.' | b'?' | b'*' | b'>'))
            {
                Some(PartKind::Literal)
            } else {
                None
            }
        }
    }
}

/// Reports whether `rname` is a valid resource name: non-empty dot-separated
/// literal tokens.
pub fn is_valid_rname(rname: &str) -> bool {
    !rname.is_empty()
        && rname
            .split('.')
            .all(|t| matches!(part_kind(t), Some(PartKind::Literal)))
}

/// Reports whether `rid` is a valid resource ID: a valid resource name
/// optionally followed by `?` and a non-empty query.
pub fn is_valid_rid(rid: &str, allow_query: bool) -> bool {
    match rid.split_once('?') {
        Some((name, query)) => allow_query && !query.is_empty() && is_valid_rname(name),
        None => is_valid_rname(rid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Pattern {
        Pattern::new(s)
    }

    #[test]
    fn valid_patterns() {
        for s in [
            "",
            "test",
            "test.model",
            "test.model.foo",
            "test.$id",
            "test.$id.foo",
            "test.$id.$type",
            "*",
            "test.*",
            "*.model",
            ">",
            "test.>",
            "test.$id.>",
            "test.*.>",
        ] {
            assert!(p(s).is_valid(), "expected valid: {s:?}");
        }
    }

    #[test]
    fn invalid_patterns() {
        for s in [
            ".",
            ".test",
            "test.",
            "test..foo",
            "test.$",
            "test.$id$",
            "test.$id?",
            "test.foo?",
            "test.>.foo",
            ">.test",
            "test.>>",
            "test.**",
            "test.$id.$id",
            "te st",
            "test.\u{7f}",
        ] {
            assert!(!p(s).is_valid(), "expected invalid: {s:?}");
        }
    }

    #[test]
    fn literal_match() {
        assert!(p("test.model").matches("test.model"));
        assert!(!p("test.model").matches("test.model.foo"));
        assert!(!p("test.model").matches("test"));
        assert!(!p("test.model").matches("test.other"));
    }

    #[test]
    fn empty_pattern_matches_only_empty_name() {
        assert!(p("").matches(""));
        assert!(!p("").matches("test"));
    }

    #[test]
    fn placeholder_match() {
        assert!(p("test.$id").matches("test.42"));
        assert!(p("test.$id.foo").matches("test.42.foo"));
        assert!(!p("test.$id").matches("test.42.foo"));
        assert!(!p("test.$id.foo").matches("test.42.bar"));
    }

    #[test]
    fn wildcard_match() {
        assert!(p("test.*").matches("test.42"));
        assert!(p("*.model").matches("test.model"));
        assert!(!p("test.*").matches("test"));
        assert!(!p("test.*").matches("test.42.foo"));
    }

    #[test]
    fn full_wildcard_match() {
        assert!(p("test.>").matches("test.model"));
        assert!(p("test.>").matches("test.model.foo"));
        assert!(!p("test.>").matches("test"));
        assert!(p(">").matches("test"));
        assert!(p(">").matches("test.model"));
    }

    #[test]
    fn values_extracts_bindings() {
        let vals = p("test.$id.$type").values("test.42.meta").unwrap();
        assert_eq!(vals.len(), 2);
        assert_eq!(vals["id"], "42");
        assert_eq!(vals["type"], "meta");
        assert!(p("test.$id").values("other.42").is_none());
    }

    #[test]
    fn values_without_placeholders_is_empty() {
        let vals = p("test.>").values("test.a.b").unwrap();
        assert!(vals.is_empty());
    }

    #[test]
    fn replace_tags_substitutes() {
        let mut tags = HashMap::new();
        tags.insert("id".to_string(), "42".to_string());
        assert_eq!(p("test.$id.foo").replace_tags(&tags).as_str(), "test.42.foo");
        // Unbound placeholders stay as-is.
        assert_eq!(p("test.$other").replace_tags(&tags).as_str(), "test.$other");
    }

    #[test]
    fn replace_tag_substitutes_one() {
        assert_eq!(
            p("test.$id.$type").replace_tag("id", "42").as_str(),
            "test.42.$type"
        );
    }

    #[test]
    fn round_trip_values_of_replaced_tags() {
        let mut tags = HashMap::new();
        tags.insert("id".to_string(), "42".to_string());
        tags.insert("type".to_string(), "meta".to_string());
        let pat = p("test.$id.sub.$type");
        let concrete = pat.replace_tags(&tags);
        assert_eq!(pat.values(concrete.as_str()).unwrap(), tags);
    }

    #[test]
    fn index_wildcard_offsets() {
        assert_eq!(p("test.model").index_wildcard(), None);
        assert_eq!(p("$id.model").index_wildcard(), Some(0));
        assert_eq!(p("test.$id").index_wildcard(), Some(5));
        assert_eq!(p("test.*.foo").index_wildcard(), Some(5));
        assert_eq!(p("test.model.>").index_wildcard(), Some(11));
        assert_eq!(p("").index_wildcard(), None);
    }

    #[test]
    fn rname_validity() {
        assert!(is_valid_rname("test"));
        assert!(is_valid_rname("test.model.42"));
        assert!(!is_valid_rname(""));
        assert!(!is_valid_rname("test..model"));
        assert!(!is_valid_rname("test.mo del"));
        assert!(!is_valid_rname("test.*"));
    }

    #[test]
    fn rid_validity() {
        assert!(is_valid_rid("test.model", true));
        assert!(is_valid_rid("test.model?q=foo", true));
        assert!(!is_valid_rid("test.model?", true));
        assert!(!is_valid_rid("test.model?q=foo", false));
        assert!(!is_valid_rid("?q=foo", true));
    }
}
