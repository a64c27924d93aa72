//! Compiled state of a tree-walking glob operation.
//!
//! A set of glob patterns is split on `/` and compiled into a tree of name
//! matchers, one node per path component. Components without special
//! characters are looked up directly in a directory's entry table instead of
//! being matched against every entry. A `**` component becomes a *recursive*
//! child applied to every descendant of the directory it appears in.
//!
//! All nodes live in one arena owned by [`GlobTree`]; child lists hold small
//! integer indices into it.

use crate::CaseSensitivity;
use crate::path::{PathComponent, RelativePath};
use crate::store::{BackingStore, EntryKind, ObjectId, RootId, StoreError, Tree};

use super::matcher::{GlobError, GlobMatcher, GlobOptions};

/// Blob prefetches are issued in batches of at most this many ids.
pub const PREFETCH_BATCH_SIZE: usize = 20_480;

/// One match produced by a glob evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobResult {
    /// Path relative to the mount root.
    pub path: RelativePath,
    pub kind: EntryKind,
    /// The root the evaluation ran against; evaluations over several roots
    /// share one result list.
    pub origin_root: RootId,
}

type NodeId = usize;

#[derive(Debug)]
struct GlobNode {
    /// The pattern fragment for this node.
    pattern: Vec<u8>,
    /// Compiled matcher; `None` when `always_match` is set.
    matcher: Option<GlobMatcher>,
    /// Non-`**` children.
    children: Vec<NodeId>,
    /// `**` children, applied recursively to every descendant.
    recursive_children: Vec<NodeId>,
    /// Emit matches at this node.
    is_leaf: bool,
    /// Pattern contains glob specials; if false the fragment can be looked
    /// up by name instead of matched.
    has_specials: bool,
    /// This node is `*` or `**` with dotfiles included: matches everything
    /// without consulting a matcher.
    always_match: bool,
}

/// A compiled set of glob patterns.
#[derive(Debug)]
pub struct GlobTree {
    nodes: Vec<GlobNode>,
    include_dotfiles: bool,
    case_sensitivity: CaseSensitivity,
}

impl GlobTree {
    const ROOT: NodeId = 0;

    pub fn new(include_dotfiles: bool, case_sensitivity: CaseSensitivity) -> GlobTree {
        GlobTree {
            nodes: vec![GlobNode {
                pattern: Vec::new(),
                matcher: None,
                children: Vec::new(),
                recursive_children: Vec::new(),
                is_leaf: false,
                has_specials: false,
                always_match: false,
            }],
            include_dotfiles,
            case_sensitivity,
        }
    }

    /// Compile a pattern and add it to the tree. On error the tree is left
    /// unchanged except for nodes shared with already-added patterns.
    pub fn parse(&mut self, pattern: &str) -> Result<(), GlobError> {
        let mut parent = Self::ROOT;
        let mut remaining = pattern.as_bytes();

        while !remaining.is_empty() {
            let token: Vec<u8>;
            let has_specials;
            let recursive = remaining.starts_with(b"**");

            if recursive {
                // A recursive component defeats the per-component walk, so
                // the rest of the pattern becomes a single node.
                //
                // Bare "**" with dotfiles excluded needs a matcher, but the
                // compiler rejects lone "**"; "**/*" is equivalent here
                // because no other tokens follow.
                if remaining == b"**" && !self.include_dotfiles {
                    token = b"**/*".to_vec();
                } else {
                    token = remaining.to_vec();
                }
                remaining = b"";
                has_specials = true;
            } else {
                let (t, rest, specials) = tokenize(remaining);
                // Reject illegal component syntax early ("", ".", "..").
                PathComponent::from_bytes(t)
                    .map_err(|err| GlobError(format!("invalid glob component: {err}")))?;
                token = t.to_vec();
                remaining = rest;
                has_specials = specials;
            }

            let node = match self.lookup_token(parent, recursive, &token) {
                Some(existing) => existing,
                None => {
                    let id = self.new_node(&token, has_specials)?;
                    let container = if recursive {
                        &mut self.nodes[parent].recursive_children
                    } else {
                        &mut self.nodes[parent].children
                    };
                    container.push(id);
                    id
                }
            };

            // No tokens left: this node emits results. This may convert a
            // node created by an earlier pattern into a leaf.
            if remaining.is_empty() {
                self.nodes[node].is_leaf = true;
            }

            parent = node;
        }
        Ok(())
    }

    fn new_node(&mut self, pattern: &[u8], has_specials: bool) -> Result<NodeId, GlobError> {
        let always_match = self.include_dotfiles && (pattern == b"**" || pattern == b"*");
        let matcher = if always_match {
            None
        } else {
            let mut options = GlobOptions::default();
            if !self.include_dotfiles {
                options |= GlobOptions::IGNORE_DOTFILES;
            }
            if self.case_sensitivity == CaseSensitivity::Insensitive {
                options |= GlobOptions::CASE_INSENSITIVE;
            }
            let text = std::str::from_utf8(pattern)
                .map_err(|_| GlobError("glob pattern is not UTF-8".to_string()))?;
            Some(GlobMatcher::new(text, options).map_err(|err| {
                GlobError(format!("failed to compile pattern `{text}`: {err}"))
            })?)
        };
        self.nodes.push(GlobNode {
            pattern: pattern.to_vec(),
            matcher,
            children: Vec::new(),
            recursive_children: Vec::new(),
            is_leaf: false,
            has_specials,
            always_match,
        });
        Ok(self.nodes.len() - 1)
    }

    /// Find an existing child with this pattern fragment. A brute-force walk
    /// of the child list; glob node cardinality is typically tiny.
    fn lookup_token(&self, parent: NodeId, recursive: bool, token: &[u8]) -> Option<NodeId> {
        let container = if recursive {
            &self.nodes[parent].recursive_children
        } else {
            &self.nodes[parent].children
        };
        container
            .iter()
            .copied()
            .find(|&id| self.nodes[id].pattern == token)
    }

    /// Evaluate the compiled globs against a tree, returning matches in
    /// deterministic sorted order with duplicates removed.
    ///
    /// `root_path` is the mount-relative path `tree` lives at (empty for the
    /// mount root); result paths include it. When `prefetch` is supplied,
    /// the object id of every matched file is appended for later batched
    /// prefetching (see [`prefetch_blobs`]).
    pub fn evaluate(
        &self,
        store: &dyn BackingStore,
        root_path: &RelativePath,
        tree: &Tree,
        origin_root: &RootId,
        mut prefetch: Option<&mut Vec<ObjectId>>,
    ) -> Result<Vec<GlobResult>, StoreError> {
        let mut results = Vec::new();
        self.evaluate_impl(
            Self::ROOT,
            store,
            root_path,
            tree,
            origin_root,
            &mut results,
            &mut prefetch,
        )?;
        results.sort_unstable_by(|a, b| a.path.cmp(&b.path));
        results.dedup_by(|a, b| a.path == b.path && a.origin_root == b.origin_root);
        Ok(results)
    }

    fn evaluate_impl(
        &self,
        node: NodeId,
        store: &dyn BackingStore,
        tree_path: &RelativePath,
        tree: &Tree,
        origin_root: &RootId,
        results: &mut Vec<GlobResult>,
        prefetch: &mut Option<&mut Vec<ObjectId>>,
    ) -> Result<(), StoreError> {
        for &child in &self.nodes[node].children {
            let child_node = &self.nodes[child];
            if !child_node.has_specials {
                // Plain fragment: direct name lookup.
                if let Some(entry) = tree.find(&child_node.pattern) {
                    let name = PathComponent::from_bytes(&child_node.pattern)
                        .expect("validated during parse");
                    self.visit_match(
                        child, store, tree_path, &name, entry, origin_root, results, prefetch,
                    )?;
                }
            } else {
                for (name, entry) in tree.iter() {
                    let matched = child_node.always_match
                        || child_node
                            .matcher
                            .as_ref()
                            .is_some_and(|m| m.matches(name.as_bytes()));
                    if matched {
                        self.visit_match(
                            child, store, tree_path, name, entry, origin_root, results, prefetch,
                        )?;
                    }
                }
            }
        }

        if !self.nodes[node].recursive_children.is_empty() {
            self.evaluate_recursive(
                node,
                store,
                tree_path,
                &RelativePath::new(),
                tree,
                origin_root,
                results,
                prefetch,
            )?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_match(
        &self,
        node: NodeId,
        store: &dyn BackingStore,
        tree_path: &RelativePath,
        name: &PathComponent,
        entry: &crate::store::TreeEntry,
        origin_root: &RootId,
        results: &mut Vec<GlobResult>,
        prefetch: &mut Option<&mut Vec<ObjectId>>,
    ) -> Result<(), StoreError> {
        let child_path = tree_path.join(name);
        let node_ref = &self.nodes[node];

        if node_ref.is_leaf {
            results.push(GlobResult {
                path: child_path.clone(),
                kind: entry.kind,
                origin_root: origin_root.clone(),
            });
            if let Some(list) = prefetch.as_deref_mut() {
                if !entry.kind.is_tree() {
                    list.push(entry.id.clone());
                }
            }
        }

        let descends = !node_ref.children.is_empty() || !node_ref.recursive_children.is_empty();
        if descends && entry.kind.is_tree() {
            let subtree = store.get_tree(&entry.id)?;
            self.evaluate_impl(
                node,
                store,
                &child_path,
                &subtree,
                origin_root,
                results,
                prefetch,
            )?;
        }
        Ok(())
    }

    /// Apply a node's recursive children to every descendant of `tree`.
    ///
    /// `start_of_recursive` is the candidate path accumulated since the
    /// recursion began; matchers run against it, while emitted results are
    /// prefixed with the evaluation root (`recursion_root`).
    #[allow(clippy::too_many_arguments)]
    fn evaluate_recursive(
        &self,
        node: NodeId,
        store: &dyn BackingStore,
        recursion_root: &RelativePath,
        start_of_recursive: &RelativePath,
        tree: &Tree,
        origin_root: &RootId,
        results: &mut Vec<GlobResult>,
        prefetch: &mut Option<&mut Vec<ObjectId>>,
    ) -> Result<(), StoreError> {
        for (name, entry) in tree.iter() {
            let candidate = start_of_recursive.join(name);

            for &recursive in &self.nodes[node].recursive_children {
                let recursive_node = &self.nodes[recursive];
                let matched = recursive_node.always_match
                    || recursive_node
                        .matcher
                        .as_ref()
                        .is_some_and(|m| m.matches(candidate.as_bytes()));
                if matched {
                    results.push(GlobResult {
                        path: recursion_root.concat(&candidate),
                        kind: entry.kind,
                        origin_root: origin_root.clone(),
                    });
                    if let Some(list) = prefetch.as_deref_mut() {
                        if !entry.kind.is_tree() {
                            list.push(entry.id.clone());
                        }
                    }
                    // No sense running the other matchers for this entry.
                    break;
                }
            }

            if entry.kind.is_tree() {
                let subtree = store.get_tree(&entry.id)?;
                self.evaluate_recursive(
                    node,
                    store,
                    recursion_root,
                    &candidate,
                    &subtree,
                    origin_root,
                    results,
                    prefetch,
                )?;
            }
        }
        Ok(())
    }
}

/// Issue batched prefetch requests for collected blob ids, deduplicating
/// first.
pub fn prefetch_blobs(store: &dyn BackingStore, mut ids: Vec<ObjectId>) -> Result<(), StoreError> {
    ids.sort_unstable();
    ids.dedup();
    for batch in ids.chunks(PREFETCH_BATCH_SIZE) {
        store.prefetch_blobs(batch)?;
    }
    Ok(())
}

/// Split `pattern` at the first `/`, reporting whether the token contains
/// glob specials. The returned remainder excludes the slash.
fn tokenize(pattern: &[u8]) -> (&[u8], &[u8], bool) {
    let mut has_specials = false;
    for (idx, &byte) in pattern.iter().enumerate() {
        match byte {
            b'*' | b'?' | b'[' | b'\\' => has_specials = true,
            b'/' => return (&pattern[..idx], &pattern[idx + 1..], has_specials),
            _ => {}
        }
    }
    (pattern, b"", has_specials)
}
