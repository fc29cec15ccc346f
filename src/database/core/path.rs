use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::database::error::{invalid_path, DatabaseResult};
use crate::util::assert;

/// Immutable location in the JSON tree.
///
/// Segments are shared between a path and everything derived from it by
/// `pop_front`, which only advances an offset.
#[derive(Clone)]
pub struct Path {
    segments: Arc<[String]>,
    offset: usize,
}

impl Path {
    pub fn empty() -> Self {
        Self {
            segments: Arc::from(Vec::<String>::new()),
            offset: 0,
        }
    }

    /// Parses a slash separated path, ignoring leading, trailing and repeated slashes.
    ///
    /// Fails with `database/invalid-path` when a segment contains `.`, `#`,
    /// `$`, `[`, `]` or an ASCII control character.
    pub fn parse(path: &str) -> DatabaseResult<Self> {
        let segments = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                validate_segment(segment)?;
                Ok(segment.to_string())
            })
            .collect::<DatabaseResult<Vec<_>>>()?;
        Ok(Self::from_validated(segments))
    }

    pub fn from_segments<I, S>(segments: I) -> DatabaseResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = segments
            .into_iter()
            .map(|segment| {
                let segment = segment.into();
                if segment.is_empty() || segment.contains('/') {
                    return Err(invalid_path(format!(
                        "Path segment '{segment}' must be non-empty and cannot contain '/'"
                    )));
                }
                validate_segment(&segment)?;
                Ok(segment)
            })
            .collect::<DatabaseResult<Vec<_>>>()?;
        Ok(Self::from_validated(segments))
    }

    /// Builds a path from segments that were already validated elsewhere.
    pub(crate) fn from_trusted(segments: Vec<String>) -> Self {
        Self::from_validated(segments)
    }

    fn from_validated(segments: Vec<String>) -> Self {
        Self {
            segments: Arc::from(segments),
            offset: 0,
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments[self.offset..]
    }

    pub fn front(&self) -> Option<&str> {
        self.segments().first().map(String::as_str)
    }

    pub fn back(&self) -> Option<&str> {
        self.segments().last().map(String::as_str)
    }

    pub fn pop_front(&self) -> Path {
        let offset = if self.offset < self.segments.len() {
            self.offset + 1
        } else {
            self.offset
        };
        Self {
            segments: Arc::clone(&self.segments),
            offset,
        }
    }

    pub fn parent(&self) -> Option<Path> {
        let segments = self.segments();
        if segments.is_empty() {
            return None;
        }
        Some(Self::from_validated(segments[..segments.len() - 1].to_vec()))
    }

    pub fn len(&self) -> usize {
        self.segments.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends an already validated key. Internal callers also use it for the
    /// `.priority` pseudo child, which user paths may not contain.
    pub fn child(&self, segment: &str) -> Path {
        let mut segments = self.segments().to_vec();
        segments.extend(
            segment
                .split('/')
                .filter(|part| !part.is_empty())
                .map(str::to_string),
        );
        Self::from_validated(segments)
    }

    pub fn child_path(&self, other: &Path) -> Path {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut segments = self.segments().to_vec();
        segments.extend(other.segments().iter().cloned());
        Self::from_validated(segments)
    }

    /// Returns true when `self` is a prefix of (or equal to) `other`.
    pub fn contains(&self, other: &Path) -> bool {
        let mine = self.segments();
        let theirs = other.segments();
        mine.len() <= theirs.len() && mine.iter().zip(theirs).all(|(a, b)| a == b)
    }

    /// True when one of the paths contains the other.
    pub fn is_related(&self, other: &Path) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Path of `inner` relative to `outer`. `outer` must contain `inner`.
    #[track_caller]
    pub fn relative(outer: &Path, inner: &Path) -> Path {
        assert(
            outer.contains(inner),
            format!("{inner} is not contained in {outer}"),
        );
        Self {
            segments: Arc::clone(&inner.segments),
            offset: inner.offset + outer.len(),
        }
    }
}

fn validate_segment(segment: &str) -> DatabaseResult<()> {
    let invalid = segment
        .chars()
        .any(|ch| matches!(ch, '.' | '#' | '$' | '[' | ']') || ch.is_ascii_control());
    if invalid {
        return Err(invalid_path(format!(
            "Path segment '{segment}' contains one of '.', '#', '$', '[', ']' or a control character"
        )));
    }
    Ok(())
}

impl Default for Path {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.segments() == other.segments()
    }
}

impl Eq for Path {}

impl Hash for Path {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.segments().hash(state);
    }
}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Segment-wise ordering, so ancestors sort before their descendants.
impl Ord for Path {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments().cmp(other.segments())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("/");
        }
        for segment in self.segments() {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::error::DatabaseErrorCode;

    #[test]
    fn parse_ignores_redundant_slashes() {
        let path = Path::parse("/users//42/name/").unwrap();
        assert_eq!(path.segments(), &["users", "42", "name"]);
        assert_eq!(path.to_string(), "/users/42/name");
        assert!(Path::parse("/").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_reserved_characters() {
        for bad in ["a.b", "a/#", "$x", "x[0]", "tab\there"] {
            let err = Path::parse(bad).unwrap_err();
            assert_eq!(err.code, DatabaseErrorCode::InvalidPath, "{bad}");
        }
    }

    #[test]
    fn pop_front_leaves_original_untouched() {
        let path = Path::parse("a/b/c").unwrap();
        let popped = path.pop_front();
        assert_eq!(popped.front(), Some("b"));
        assert_eq!(path.front(), Some("a"));
        assert_eq!(popped.pop_front().pop_front(), Path::empty());
        assert!(Path::empty().pop_front().is_empty());
    }

    #[test]
    fn equality_is_structural_across_offsets() {
        let popped = Path::parse("x/a/b").unwrap().pop_front();
        let direct = Path::parse("a/b").unwrap();
        assert_eq!(popped, direct);
    }

    #[test]
    fn contains_and_relative() {
        let outer = Path::parse("a/b").unwrap();
        let inner = Path::parse("a/b/c/d").unwrap();
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(outer.contains(&outer));
        assert!(Path::empty().contains(&inner));
        assert_eq!(Path::relative(&outer, &inner), Path::parse("c/d").unwrap());
        assert!(Path::relative(&inner, &inner).is_empty());
        assert!(!Path::parse("a/bc").unwrap().contains(&inner));
    }

    #[test]
    fn child_parent_back() {
        let path = Path::parse("a").unwrap().child("b");
        assert_eq!(path.back(), Some("b"));
        assert_eq!(path.parent().unwrap(), Path::parse("a").unwrap());
        assert!(Path::empty().parent().is_none());
        assert_eq!(path.child_path(&Path::parse("c/d").unwrap()).len(), 4);
    }

    #[test]
    fn ordering_places_ancestors_first() {
        let mut paths = vec![
            Path::parse("b").unwrap(),
            Path::parse("a/b").unwrap(),
            Path::parse("a").unwrap(),
            Path::empty(),
        ];
        paths.sort();
        let rendered: Vec<String> = paths.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["/", "/a", "/a/b", "/b"]);
    }
}
