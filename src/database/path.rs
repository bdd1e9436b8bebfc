use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::database::error::{invalid_argument, DatabaseResult};

/// A location in the database tree, stored as its slash-separated segments.
///
/// Ordering is segment-wise, so a parent always sorts before its children and
/// siblings sort by key.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// Builds a path from a slash-separated string, skipping empty segments.
    pub fn new(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments
                .into_iter()
                .map(Into::into)
                .filter(|segment: &String| !segment.is_empty())
                .collect(),
        }
    }

    /// Strict parser used at API boundaries: rejects empty inner segments and
    /// the characters the backend forbids in keys.
    pub fn parse(path: &str) -> DatabaseResult<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(invalid_argument(
                    "Database path cannot contain empty segments",
                ));
            }
            if segment
                .chars()
                .any(|c| matches!(c, '.' | '#' | '$' | '[' | ']'))
                && segment != ".priority"
            {
                return Err(invalid_argument(format!(
                    "Database path segment '{segment}' contains an invalid character"
                )));
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn directories(&self) -> &[String] {
        &self.segments
    }

    pub fn front_directory(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    pub fn pop_front_directory(&self) -> Path {
        Self {
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }

    pub fn back(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Parent location; the root is its own parent.
    pub fn parent(&self) -> Path {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    pub fn child(&self, key: &str) -> Path {
        self.child_path(&Path::new(key))
    }

    pub fn child_path(&self, other: &Path) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// True when `self` is `other` or one of its ancestors.
    pub fn is_parent_of(&self, other: &Path) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(left, right)| left == right)
    }

    /// Path of `to` relative to `from`, or `None` when `from` is not an
    /// ancestor of (or equal to) `to`.
    pub fn get_relative(from: &Path, to: &Path) -> Option<Path> {
        if !from.is_parent_of(to) {
            return None;
        }
        Some(Self {
            segments: to.segments[from.segments.len()..].to_vec(),
        })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl From<&str> for Path {
    fn from(value: &str) -> Self {
        Path::new(value)
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Path::new(&raw))
    }
}
