use std::collections::HashMap;
use std::sync::Arc;

use crate::gexpr::GroupExpr;
use crate::handler::{Handler, ListenerFn};
use crate::pattern::{part_kind, PartKind, Pattern};
use crate::service::{Service, WeakService};

/// A handler sealed at registration, together with its parsed group
/// expression.
pub(crate) struct RegisteredHandler {
    pub(crate) handler: Handler,
    pub(crate) group: Option<GroupExpr>,
}

/// A successful resolution of a resource name.
pub(crate) struct Match {
    pub(crate) handler: Arc<RegisteredHandler>,
    pub(crate) params: HashMap<String, String>,
    pub(crate) group: String,
    pub(crate) listeners: Vec<ListenerFn>,
}

#[derive(Default)]
struct Node {
    hs: Option<Arc<RegisteredHandler>>,
    // Placeholder bindings of the pattern terminating here, as
    // (name, token index relative to the nearest mount boundary).
    params: Vec<(String, usize)>,
    nodes: HashMap<String, Node>,
    param: Option<Box<Node>>,
    // Tag name the placeholder child was first registered under, kept for
    // pattern reconstruction.
    param_tag: Option<String>,
    wild: Option<Box<Node>>,
    mounted: bool,
    listeners: Vec<ListenerFn>,
}

/// A router mapping resource patterns to handlers.
///
/// The mux is a trie over dot-separated tokens. Resolution prefers, at each
/// level, a literal child over the placeholder child, and falls back to a
/// full-wildcard node when neither leads to a match. Sub-muxes can be
/// mounted at a sub-path, which offsets the placeholder indexes of their
/// registrations.
pub struct Mux {
    path: String,
    root: Node,
    service: Option<WeakService>,
}

impl Mux {
    /// Creates a router rooted at `path`. The path may be empty and is
    /// otherwise validated the way patterns are.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid pattern without wildcards.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let p = Pattern::new(path.clone());
        if !p.is_valid() || p.index_wildcard().is_some() {
            panic!("invalid mux path {path:?}");
        }
        Mux {
            path,
            root: Node::default(),
            service: None,
        }
    }

    /// The path the mux is rooted at.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Registers a handler for a pattern relative to the mux path.
    ///
    /// # Panics
    ///
    /// Panics on an invalid pattern, an invalid group expression, or a
    /// pattern that is already registered.
    pub fn add_handler(&mut self, pattern: &str, mut handler: Handler) {
        let p = Pattern::new(pattern);
        if !p.is_valid() {
            panic!("invalid pattern {pattern:?}");
        }
        let group = handler
            .group
            .as_deref()
            .filter(|g| !g.is_empty())
            .map(|g| match GroupExpr::parse(g, pattern) {
                Ok(g) => g,
                Err(e) => panic!("invalid group for pattern {pattern:?}: {e}"),
            });
        let listeners = std::mem::take(&mut handler.listeners);
        let on_register = handler.on_register.clone();

        let (node, params) = self.descend(pattern);
        if node.hs.is_some() {
            panic!("handler already registered for pattern {pattern:?}");
        }
        if !node.params.is_empty() && node.params != params {
            panic!("placeholder mismatch for pattern {pattern:?}");
        }
        node.params = params;
        node.hs = Some(Arc::new(RegisteredHandler { handler, group }));

        for (lpattern, f) in listeners {
            self.add_listener_fn(&lpattern, f);
        }

        if let (Some(service), Some(cb)) = (self.attached(), on_register) {
            cb(&service, &merge_path(&self.path, pattern));
        }
    }

    /// Attaches an event listener to the resources of an exact pattern.
    ///
    /// Listeners observe the events emitted for matching resources and run
    /// synchronously on the emitting group's worker. A pattern that ends up
    /// with listeners but no handler is reported by
    /// [`validate_listeners`](Mux::validate_listeners) before serving.
    ///
    /// # Panics
    ///
    /// Panics if the pattern is invalid.
    pub fn add_listener<F>(&mut self, pattern: &str, f: F)
    where
        F: Fn(&crate::event::ResourceEvent) + Send + Sync + 'static,
    {
        self.add_listener_fn(pattern, Arc::new(f));
    }

    fn add_listener_fn(&mut self, pattern: &str, f: ListenerFn) {
        let p = Pattern::new(pattern);
        if !p.is_valid() {
            panic!("invalid pattern {pattern:?}");
        }
        let (node, _) = self.descend(pattern);
        node.listeners.push(f);
    }

    /// Mounts a sub-mux under `path`. The sub-mux's own path is appended to
    /// the mount path; all of its registrations resolve with their
    /// placeholder indexes offset by the mount point.
    ///
    /// # Panics
    ///
    /// Panics if the sub-mux is already attached to a service, if the
    /// merged path is empty, or if the mount point overlaps an existing
    /// registration. A mux is consumed by mounting, so double mounts are
    /// ruled out at the type level.
    pub fn mount(&mut self, path: &str, mut sub: Mux) {
        if sub.service.is_some() {
            panic!("mux already attached to a service");
        }
        let merged = merge_path(path, &sub.path);
        if merged.is_empty() {
            panic!("cannot mount to root");
        }
        let p = Pattern::new(merged.clone());
        if !p.is_valid() || merged.split('.').any(|t| t == ">") {
            panic!("invalid mount path {merged:?}");
        }
        let (node, _) = self.descend(&merged);
        if !node.is_empty() {
            panic!("mount path {merged:?} overlaps an existing registration");
        }
        sub.root.mounted = true;
        *node = std::mem::take(&mut sub.root);

        if let Some(service) = self.attached() {
            let mut parts: Vec<String> = merge_path(&self.path, &merged)
                .split('.')
                .map(str::to_string)
                .collect();
            let base = parts.len();
            if let Some(grafted) = self.find_node(&merged) {
                walk_node(grafted, &mut parts, base, &mut |n, full| {
                    if let Some(rh) = &n.hs {
                        if let Some(cb) = &rh.handler.on_register {
                            cb(&service, full);
                        }
                    }
                });
            }
        }
    }

    /// Creates a sub-mux, passes it to `f` for registration, and mounts it
    /// under `path`.
    pub fn route<F>(&mut self, path: &str, f: F)
    where
        F: FnOnce(&mut Mux),
    {
        let mut sub = Mux::new("");
        f(&mut sub);
        self.mount(path, sub);
    }

    /// Resolves a resource name to its handler, extracted path parameters,
    /// rendered group, and the listeners attached at the matched pattern.
    pub(crate) fn get_handler(&self, rname: &str) -> Option<Match> {
        let suffix = self.strip_path(rname)?;
        let tokens: Vec<&str> = if suffix.is_empty() {
            Vec::new()
        } else {
            suffix.split('.').collect()
        };
        let (node, mount) = fetch(&self.root, &tokens, 0, 0)?;
        let rh = node.hs.as_ref()?.clone();

        let mut params = HashMap::new();
        for (name, idx) in &node.params {
            params.insert(name.clone(), tokens[mount + idx].to_string());
        }
        let group = match &rh.group {
            Some(g) => g.render(&tokens[mount..]),
            None => rname.to_string(),
        };
        Some(Match {
            handler: rh,
            params,
            group,
            listeners: node.listeners.clone(),
        })
    }

    /// Collects the full patterns (mux path included) of every registered
    /// handler satisfying `pred`.
    pub(crate) fn patterns_with(&self, pred: impl Fn(&Handler) -> bool) -> Vec<String> {
        let mut out = Vec::new();
        self.walk(|node, full| {
            if let Some(rh) = &node.hs {
                if pred(&rh.handler) {
                    out.push(full.to_string());
                }
            }
        });
        out
    }

    /// Reports the full patterns that have listeners attached but no
    /// handler; a misconfiguration surfaced before serving begins.
    pub(crate) fn validate_listeners(&self) -> Result<(), Vec<String>> {
        let mut bad = Vec::new();
        self.walk(|node, full| {
            if !node.listeners.is_empty() && node.hs.is_none() {
                bad.push(full.to_string());
            }
        });
        if bad.is_empty() {
            Ok(())
        } else {
            Err(bad)
        }
    }

    /// Attaches the mux to a service, invoking every handler's registered
    /// callback. Later registrations are announced as they happen.
    pub(crate) fn attach(&mut self, service: WeakService) {
        self.service = Some(service.clone());
        if let Some(service) = service.upgrade() {
            self.notify_registered(&service);
        }
    }

    fn attached(&self) -> Option<Service> {
        self.service.as_ref().and_then(WeakService::upgrade)
    }

    fn notify_registered(&self, service: &Service) {
        self.walk(|node, full| {
            if let Some(rh) = &node.hs {
                if let Some(cb) = &rh.handler.on_register {
                    cb(service, full);
                }
            }
        });
    }

    // Walks every node, passing the full pattern (mux path included).
    fn walk<'a>(&'a self, mut f: impl FnMut(&'a Node, &str)) {
        let mut parts: Vec<String> = if self.path.is_empty() {
            Vec::new()
        } else {
            self.path.split('.').map(str::to_string).collect()
        };
        let base = parts.len();
        walk_node(&self.root, &mut parts, base, &mut f);
    }

    fn descend(&mut self, pattern: &str) -> (&mut Node, Vec<(String, usize)>) {
        let mut params = Vec::new();
        let mut node = &mut self.root;
        if pattern.is_empty() {
            return (node, params);
        }
        for (i, part) in pattern.split('.').enumerate() {
            node = match part_kind(part).expect("pattern validated before descend") {
                PartKind::Full => &mut **node.wild.get_or_insert_with(Default::default),
                PartKind::Tag(name) => {
                    params.push((name.to_string(), i));
                    if node.param_tag.is_none() {
                        node.param_tag = Some(name.to_string());
                    }
                    &mut **node.param.get_or_insert_with(Default::default)
                }
                PartKind::Wildcard => &mut **node.param.get_or_insert_with(Default::default),
                PartKind::Literal => node.nodes.entry(part.to_string()).or_default(),
            };
        }
        (node, params)
    }

    fn find_node(&self, pattern: &str) -> Option<&Node> {
        let mut node = &self.root;
        if pattern.is_empty() {
            return Some(node);
        }
        for part in pattern.split('.') {
            node = match part_kind(part)? {
                PartKind::Full => node.wild.as_deref()?,
                PartKind::Tag(_) | PartKind::Wildcard => node.param.as_deref()?,
                PartKind::Literal => node.nodes.get(part)?,
            };
        }
        Some(node)
    }

    fn strip_path<'a>(&self, rname: &'a str) -> Option<&'a str> {
        if self.path.is_empty() {
            return Some(rname);
        }
        if rname == self.path {
            return Some("");
        }
        rname
            .strip_prefix(&self.path)
            .and_then(|rest| rest.strip_prefix('.'))
    }
}

impl Node {
    fn is_empty(&self) -> bool {
        self.hs.is_none()
            && self.params.is_empty()
            && self.nodes.is_empty()
            && self.param.is_none()
            && self.wild.is_none()
            && self.listeners.is_empty()
    }
}

// Trie descent with backtracking. At each level a literal child is tried
// first, then the placeholder child, then a terminal full wildcard. Returns
// the terminal node and the token index of the nearest mount boundary.
fn fetch<'a>(node: &'a Node, tokens: &[&str], i: usize, mount: usize) -> Option<(&'a Node, usize)> {
    let mount = if node.mounted { i } else { mount };
    if i == tokens.len() {
        return node.hs.as_ref().map(|_| (node, mount));
    }
    if let Some(child) = node.nodes.get(tokens[i]) {
        if let Some(found) = fetch(child, tokens, i + 1, mount) {
            return Some(found);
        }
    }
    if let Some(child) = &node.param {
        if let Some(found) = fetch(child, tokens, i + 1, mount) {
            return Some(found);
        }
    }
    if let Some(wild) = &node.wild {
        // `>` consumes the one or more remaining tokens.
        if wild.hs.is_some() {
            return Some((wild, mount));
        }
    }
    None
}

fn walk_node<'a>(
    node: &'a Node,
    parts: &mut Vec<String>,
    mount_base: usize,
    f: &mut impl FnMut(&'a Node, &str),
) {
    let mount_base = if node.mounted { parts.len() } else { mount_base };
    if node.hs.is_some() || !node.listeners.is_empty() {
        // Substitute placeholder names recorded at this terminal.
        let mut full = parts.clone();
        for (name, idx) in &node.params {
            full[mount_base + idx] = format!("${name}");
        }
        f(node, &full.join("."));
    }
    for (token, child) in &node.nodes {
        parts.push(token.clone());
        walk_node(child, parts, mount_base, f);
        parts.pop();
    }
    if let Some(child) = &node.param {
        let part = match &node.param_tag {
            Some(tag) => format!("${tag}"),
            None => "*".to_string(),
        };
        parts.push(part);
        walk_node(child, parts, mount_base, f);
        parts.pop();
    }
    if let Some(wild) = &node.wild {
        parts.push(">".to_string());
        walk_node(wild, parts, mount_base, f);
        parts.pop();
    }
}

fn merge_path(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => String::new(),
        (true, false) => b.to_string(),
        (false, true) => a.to_string(),
        (false, false) => format!("{a}.{b}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> Handler {
        Handler::new().get(|_r| Ok(()))
    }

    fn grouped(group: &str) -> Handler {
        Handler::new().get(|_r| Ok(())).group(group)
    }

    #[test]
    fn literal_resolution() {
        let mut m = Mux::new("");
        m.add_handler("test.model", handler());
        assert!(m.get_handler("test.model").is_some());
        assert!(m.get_handler("test.other").is_none());
        assert!(m.get_handler("test.model.foo").is_none());
        assert!(m.get_handler("test").is_none());
    }

    #[test]
    fn placeholder_resolution_binds_params() {
        let mut m = Mux::new("");
        m.add_handler("test.$id.foo.$type", handler());
        let mt = m.get_handler("test.42.foo.meta").unwrap();
        assert_eq!(mt.params["id"], "42");
        assert_eq!(mt.params["type"], "meta");
    }

    #[test]
    fn literal_wins_over_placeholder() {
        let mut m = Mux::new("");
        m.add_handler("test.$id", grouped("param"));
        m.add_handler("test.special", grouped("literal"));
        assert_eq!(m.get_handler("test.special").unwrap().group, "literal");
        assert_eq!(m.get_handler("test.42").unwrap().group, "param");
    }

    #[test]
    fn placeholder_wins_over_full_wildcard() {
        let mut m = Mux::new("");
        m.add_handler("test.>", grouped("wild"));
        m.add_handler("test.$id", grouped("param"));
        assert_eq!(m.get_handler("test.42").unwrap().group, "param");
        assert_eq!(m.get_handler("test.42.foo").unwrap().group, "wild");
    }

    #[test]
    fn backtracks_out_of_literal_dead_end() {
        let mut m = Mux::new("");
        m.add_handler("test.special.foo", grouped("literal"));
        m.add_handler("test.$id.bar", grouped("param"));
        // "special" descends the literal branch first but must back out to
        // the placeholder branch to reach ".bar".
        assert_eq!(m.get_handler("test.special.bar").unwrap().group, "param");
    }

    #[test]
    fn full_wildcard_fallback_on_ancestor() {
        let mut m = Mux::new("");
        m.add_handler("test.>", grouped("wild"));
        m.add_handler("test.$id.foo", grouped("param"));
        assert_eq!(m.get_handler("test.42.foo").unwrap().group, "param");
        assert_eq!(m.get_handler("test.42.bar").unwrap().group, "wild");
        assert_eq!(m.get_handler("test.a.b.c").unwrap().group, "wild");
    }

    #[test]
    fn mux_path_is_required_prefix() {
        let mut m = Mux::new("svc");
        m.add_handler("model.$id", handler());
        assert!(m.get_handler("svc.model.42").is_some());
        assert!(m.get_handler("model.42").is_none());
        assert!(m.get_handler("other.model.42").is_none());
    }

    #[test]
    fn group_defaults_to_resource_name() {
        let mut m = Mux::new("svc");
        m.add_handler("model.$id", handler());
        let mt = m.get_handler("svc.model.42").unwrap();
        assert_eq!(mt.group, "svc.model.42");
    }

    #[test]
    fn group_expression_renders_tokens() {
        let mut m = Mux::new("");
        m.add_handler("lib.$shelf.book.$id", grouped("shelf.${shelf}"));
        let mt = m.get_handler("lib.s1.book.42").unwrap();
        assert_eq!(mt.group, "shelf.s1");
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_pattern_panics() {
        let mut m = Mux::new("");
        m.add_handler("test.model", handler());
        m.add_handler("test.model", handler());
    }

    #[test]
    #[should_panic(expected = "invalid pattern")]
    fn invalid_pattern_panics() {
        let mut m = Mux::new("");
        m.add_handler("test..model", handler());
    }

    #[test]
    #[should_panic(expected = "invalid group")]
    fn group_referencing_unknown_tag_panics() {
        let mut m = Mux::new("");
        m.add_handler("test.$id", grouped("${nope}"));
    }

    #[test]
    fn mounted_mux_resolves_with_offset_params() {
        let mut sub = Mux::new("");
        sub.add_handler("book.$id", grouped("book.${id}"));
        let mut m = Mux::new("svc");
        m.mount("lib", sub);
        let mt = m.get_handler("svc.lib.book.42").unwrap();
        assert_eq!(mt.params["id"], "42");
        assert_eq!(mt.group, "book.42");
    }

    #[test]
    fn mount_with_own_sub_path() {
        let mut sub = Mux::new("inner");
        sub.add_handler("model", handler());
        let mut m = Mux::new("");
        m.mount("outer", sub);
        assert!(m.get_handler("outer.inner.model").is_some());
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn mount_over_existing_pattern_panics() {
        let mut m = Mux::new("");
        m.add_handler("lib.book", handler());
        m.mount("lib", Mux::new(""));
    }

    #[test]
    #[should_panic(expected = "cannot mount to root")]
    fn mount_to_root_panics() {
        let mut m = Mux::new("");
        m.mount("", Mux::new(""));
    }

    #[test]
    fn route_registers_under_sub_path() {
        let mut m = Mux::new("svc");
        m.route("admin", |sub| {
            sub.add_handler("user.$id", handler());
        });
        let mt = m.get_handler("svc.admin.user.7").unwrap();
        assert_eq!(mt.params["id"], "7");
    }

    #[test]
    fn patterns_with_reconstructs_full_patterns() {
        let mut m = Mux::new("svc");
        m.add_handler("model.$id", handler());
        m.add_handler("stats", Handler::new().access(|r| {
            r.access_granted();
            Ok(())
        }));
        let mut resources = m.patterns_with(|h| h.has_resource_capability());
        resources.sort();
        assert_eq!(resources, vec!["svc.model.$id"]);
        let mut access = m.patterns_with(|h| h.access.is_some());
        access.sort();
        assert_eq!(access, vec!["svc.stats"]);
    }

    #[test]
    fn validate_listeners_flags_orphans() {
        let mut m = Mux::new("svc");
        m.add_handler("model", handler());
        m.add_listener("model", |_ev| {});
        assert!(m.validate_listeners().is_ok());
        m.add_listener("orphan.$id", |_ev| {});
        let bad = m.validate_listeners().unwrap_err();
        assert_eq!(bad, vec!["svc.orphan.$id"]);
    }

    #[test]
    fn listeners_attached_to_match() {
        let mut m = Mux::new("");
        m.add_handler("test.$id", handler());
        m.add_listener("test.$id", |_ev| {});
        let mt = m.get_handler("test.42").unwrap();
        assert_eq!(mt.listeners.len(), 1);
    }

    #[test]
    fn empty_pattern_matches_mux_path_itself() {
        let mut m = Mux::new("svc");
        m.add_handler("", handler());
        assert!(m.get_handler("svc").is_some());
        assert!(m.get_handler("svc.x").is_none());
    }
}
