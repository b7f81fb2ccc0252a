//! Node paths in the remote namespace.
//!
//! A [`NodePath`] is always absolute, slash-delimited, has no trailing slash
//! (except for the root `/`) and no empty segments. Both the remote namespace
//! and the mount-relative paths handed over by the kernel use this type.

use std::fmt;

use crate::error::NamespaceError;

/// A normalized, absolute node path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath(String);

impl NodePath {
    /// The namespace root.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parses and normalizes a path.
    ///
    /// A missing leading slash and a single trailing slash are tolerated;
    /// empty inner segments (`/a//b`) and `.`/`..` segments are rejected.
    pub fn parse(raw: &str) -> Result<Self, NamespaceError> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "/" {
            return Ok(Self::root());
        }

        let body = raw.strip_prefix('/').unwrap_or(raw);
        let body = body.strip_suffix('/').unwrap_or(body);

        let mut normalized = String::with_capacity(body.len() + 1);
        for segment in body.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(NamespaceError::InvalidPath(raw.to_string()));
            }
            normalized.push('/');
            normalized.push_str(segment);
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Returns the child path `self/name`.
    ///
    /// `name` must be a single segment; callers validate names coming from
    /// outside (the kernel never hands us names containing `/`).
    pub fn join(&self, name: &str) -> Self {
        if self.is_root() {
            Self(format!("/{name}"))
        } else {
            Self(format!("{}/{name}", self.0))
        }
    }

    /// Joins a mount-relative path below this one.
    pub fn join_path(&self, relative: &NodePath) -> Self {
        if relative.is_root() {
            self.clone()
        } else if self.is_root() {
            relative.clone()
        } else {
            Self(format!("{}{}", self.0, relative.0))
        }
    }

    /// Parent path, `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(pos) => Some(Self(self.0[..pos].to_string())),
            None => None,
        }
    }

    /// Last segment, empty for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(pos) => &self.0[pos + 1..],
            None => "",
        }
    }

    /// Prefix shared by every descendant of this path.
    pub fn descendant_prefix(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("{}/", self.0)
        }
    }

    /// True if `self` is `ancestor` or lies below it.
    pub fn starts_with(&self, ancestor: &NodePath) -> bool {
        ancestor.is_root() || self == ancestor || self.0.starts_with(&ancestor.descendant_prefix())
    }

    /// Strips `ancestor` from the front, yielding a path relative to it.
    pub fn strip_prefix(&self, ancestor: &NodePath) -> Option<Self> {
        if self == ancestor {
            return Some(Self::root());
        }
        if ancestor.is_root() {
            return Some(self.clone());
        }
        self.0
            .strip_prefix(&ancestor.0)
            .filter(|rest| rest.starts_with('/'))
            .map(|rest| Self(rest.to_string()))
    }

    /// Number of segments (0 for the root).
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.matches('/').count()
        }
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> NodePath {
        NodePath::parse(raw).unwrap()
    }

    #[test]
    fn test_parse_normalizes() {
        assert_eq!(p("").as_str(), "/");
        assert_eq!(p("/").as_str(), "/");
        assert_eq!(p("foo").as_str(), "/foo");
        assert_eq!(p("/foo/").as_str(), "/foo");
        assert_eq!(p("/foo/bar").as_str(), "/foo/bar");
    }

    #[test]
    fn test_parse_rejects_bad_segments() {
        assert!(NodePath::parse("/a//b").is_err());
        assert!(NodePath::parse("/a/../b").is_err());
        assert!(NodePath::parse("/./a").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(p("/").parent(), None);
        assert_eq!(p("/foo").parent(), Some(NodePath::root()));
        assert_eq!(p("/foo/bar").parent(), Some(p("/foo")));
        assert_eq!(p("/foo/bar").name(), "bar");
        assert_eq!(NodePath::root().name(), "");
    }

    #[test]
    fn test_join() {
        assert_eq!(NodePath::root().join("a"), p("/a"));
        assert_eq!(p("/a").join("b"), p("/a/b"));
        assert_eq!(p("/mnt").join_path(&p("/a/b")), p("/mnt/a/b"));
        assert_eq!(p("/mnt").join_path(&NodePath::root()), p("/mnt"));
        assert_eq!(NodePath::root().join_path(&p("/x")), p("/x"));
    }

    #[test]
    fn test_starts_with_respects_segment_boundaries() {
        assert!(p("/a/b").starts_with(&p("/a")));
        assert!(p("/a").starts_with(&p("/a")));
        assert!(!p("/ab").starts_with(&p("/a")));
        assert!(p("/anything").starts_with(&NodePath::root()));
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(p("/mnt/a").strip_prefix(&p("/mnt")), Some(p("/a")));
        assert_eq!(p("/mnt").strip_prefix(&p("/mnt")), Some(NodePath::root()));
        assert_eq!(p("/mntx/a").strip_prefix(&p("/mnt")), None);
    }

    #[test]
    fn test_depth() {
        assert_eq!(NodePath::root().depth(), 0);
        assert_eq!(p("/a").depth(), 1);
        assert_eq!(p("/a/b/c").depth(), 3);
    }
}
