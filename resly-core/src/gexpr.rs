use crate::pattern::{part_kind, PartKind};

/// A group expression parsed from a `${tag}` template string.
///
/// Parsed once at handler registration against the handler's pattern, and
/// rendered per match by splicing the concrete tokens at the recorded
/// positions.
#[derive(Debug, Clone)]
pub(crate) struct GroupExpr {
    parts: Vec<GroupPart>,
}

#[derive(Debug, Clone)]
enum GroupPart {
    Literal(String),
    // Token index relative to the pattern's first part.
    Ref(usize),
}

impl GroupExpr {
    /// Parses `group`, resolving each `${name}` against the placeholders of
    /// `pattern`. Fails on unterminated or empty references and on names
    /// that the pattern does not define.
    pub(crate) fn parse(group: &str, pattern: &str) -> Result<GroupExpr, String> {
        let tags: Vec<(String, usize)> = if pattern.is_empty() {
            Vec::new()
        } else {
            pattern
                .split('.')
                .enumerate()
                .filter_map(|(i, part)| match part_kind(part) {
                    Some(PartKind::Tag(name)) => Some((name.to_string(), i)),
                    _ => None,
                })
                .collect()
        };

        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = group;
        while let Some(start) = rest.find("${") {
            literal.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| format!("unterminated group tag in {group:?}"))?;
            let name = &after[..end];
            if name.is_empty() {
                return Err(format!("empty group tag in {group:?}"));
            }
            let idx = tags
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, i)| *i)
                .ok_or_else(|| format!("group tag ${{{name}}} not found in pattern {pattern:?}"))?;
            if !literal.is_empty() {
                parts.push(GroupPart::Literal(std::mem::take(&mut literal)));
            }
            parts.push(GroupPart::Ref(idx));
            rest = &after[end + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(GroupPart::Literal(literal));
        }
        Ok(GroupExpr { parts })
    }

    /// Renders the group for a concrete match. `tokens` are the resource
    /// name tokens starting at the same origin the expression was parsed
    /// against.
    pub(crate) fn render(&self, tokens: &[&str]) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                GroupPart::Literal(l) => out.push_str(l),
                GroupPart::Ref(i) => out.push_str(tokens[*i]),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_only() {
        let g = GroupExpr::parse("mygroup", "test.$id").unwrap();
        assert_eq!(g.render(&["test", "42"]), "mygroup");
    }

    #[test]
    fn single_ref() {
        let g = GroupExpr::parse("${id}", "test.$id").unwrap();
        assert_eq!(g.render(&["test", "42"]), "42");
    }

    #[test]
    fn mixed_fragments_and_refs() {
        let g = GroupExpr::parse("book.${id}.of.${shelf}", "lib.$shelf.book.$id").unwrap();
        assert_eq!(g.render(&["lib", "s1", "book", "42"]), "book.42.of.s1");
    }

    #[test]
    fn unknown_tag_fails() {
        assert!(GroupExpr::parse("${nope}", "test.$id").is_err());
    }

    #[test]
    fn unterminated_tag_fails() {
        assert!(GroupExpr::parse("foo.${id", "test.$id").is_err());
    }

    #[test]
    fn empty_tag_fails() {
        assert!(GroupExpr::parse("foo.${}", "test.$id").is_err());
    }

    #[test]
    fn empty_expression_renders_empty() {
        let g = GroupExpr::parse("", "test.$id").unwrap();
        assert_eq!(g.render(&["test", "42"]), "");
    }
}
