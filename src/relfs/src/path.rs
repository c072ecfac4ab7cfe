// Path splitting and lookup. A path is walked one segment at a time from the
// root edge "/". Segments are produced lazily and the iterator can be cloned
// to restart a walk. Splitting is literal: repeated or trailing slashes
// produce empty segments, which never match an edge.

use crate::namespace_store::NamespaceStore;
use crate::types::{EdgeRecord, NodeId, ROOT_NAME};
use crate::{RelFsError, RelFsResult};
use std::str::Split;

#[derive(Clone, Debug)]
pub struct PathSegments<'a> {
    root_pending: bool,
    rest: Option<Split<'a, char>>,
}

/// Segments of `path`, always starting with the root segment `"/"`.
/// A path without a leading slash is taken as rooted.
pub fn resolve(path: &str) -> PathSegments<'_> {
    PathSegments {
        root_pending: true,
        rest: split_after_root(path),
    }
}

fn split_after_root(path: &str) -> Option<Split<'_, char>> {
    let rest = path.strip_prefix('/').unwrap_or(path);
    if rest.is_empty() {
        None
    } else {
        Some(rest.split('/'))
    }
}

impl<'a> PathSegments<'a> {
    /// Segments of `path` without the root segment, for walks that start at
    /// a known directory.
    pub fn relative(path: &'a str) -> Self {
        PathSegments {
            root_pending: false,
            rest: split_after_root(path),
        }
    }
}

impl<'a> Iterator for PathSegments<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.root_pending {
            self.root_pending = false;
            return Some(ROOT_NAME);
        }
        self.rest.as_mut().and_then(|split| split.next())
    }
}

/// Outcome of walking a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(EdgeRecord),
    /// `segment` (at index `depth`) does not exist under `parent`.
    /// `terminal` is set when it was the last segment of the path.
    Missing {
        parent: Option<NodeId>,
        segment: String,
        depth: usize,
        terminal: bool,
    },
}

impl Resolution {
    pub fn found(self) -> Option<EdgeRecord> {
        match self {
            Resolution::Found(edge) => Some(edge),
            Resolution::Missing { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct PathResolver {
    namespace: NamespaceStore,
}

impl PathResolver {
    pub fn new(namespace: NamespaceStore) -> Self {
        Self { namespace }
    }

    pub fn walk(&self, segments: PathSegments<'_>) -> RelFsResult<Resolution> {
        self.walk_from(None, segments)
    }

    /// Walk `segments` starting under `start` (None is the root scope).
    pub fn walk_from(
        &self,
        start: Option<NodeId>,
        segments: PathSegments<'_>,
    ) -> RelFsResult<Resolution> {
        let mut parent = start;
        let mut current: Option<EdgeRecord> = None;
        let mut segments = segments.enumerate().peekable();

        while let Some((depth, segment)) = segments.next() {
            match self.namespace.find_edge(segment, parent)? {
                Some(edge) => {
                    parent = Some(edge.node_id);
                    current = Some(edge);
                }
                None => {
                    return Ok(Resolution::Missing {
                        parent,
                        segment: segment.to_string(),
                        depth,
                        terminal: segments.peek().is_none(),
                    });
                }
            }
        }

        current
            .map(Resolution::Found)
            .ok_or_else(|| RelFsError::InvalidPath("empty path".to_string()))
    }

    /// Walk `path` from the root and return the edge, or NotFound.
    pub fn lookup(&self, path: &str) -> RelFsResult<EdgeRecord> {
        self.walk(resolve(path))?
            .found()
            .ok_or_else(|| RelFsError::NotFound(path.to_string()))
    }
}
