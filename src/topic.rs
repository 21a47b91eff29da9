//! Topic filter grammar and matching.
//!
//! A filter is a `/`-separated list of segments. A segment is either a
//! literal, the single-level wildcard `+`, or (only as the last segment) the
//! multi-level wildcard `#`. Wildcards always occupy a whole segment.
//!
//! ```rust
//! use rxmqtt::topic::{compile, validate};
//!
//! assert!(validate("sensors/+/temp"));
//! assert!(!validate("sensors/#/temp"));
//!
//! let filter = compile("sensors/+/temp").unwrap();
//! assert!(filter.matches("sensors/kitchen/temp"));
//! assert!(!filter.matches("sensors/kitchen/humidity/temp"));
//! ```

use std::{fmt, str::FromStr};

use smallvec::SmallVec;

use crate::error::PatternError;

pub const SEPARATOR: char = '/';
pub const SINGLE_LEVEL: &str = "+";
pub const MULTI_LEVEL: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
  Literal(String),
  SingleLevel,
  MultiLevel,
}

/// A compiled topic filter.
///
/// Built once per distinct pattern and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
  pattern: String,
  segments: SmallVec<[Segment; 4]>,
}

/// Returns `true` iff `pattern` is a non-empty, well-formed topic filter.
pub fn validate(pattern: &str) -> bool { check(pattern).is_ok() }

/// Compiles `pattern` into a [`TopicFilter`].
pub fn compile(pattern: &str) -> Result<TopicFilter, PatternError> {
  check(pattern)?;
  let segments = pattern
    .split(SEPARATOR)
    .map(|segment| match segment {
      SINGLE_LEVEL => Segment::SingleLevel,
      MULTI_LEVEL => Segment::MultiLevel,
      literal => Segment::Literal(literal.to_owned()),
    })
    .collect();
  Ok(TopicFilter { pattern: pattern.to_owned(), segments })
}

fn check(pattern: &str) -> Result<(), PatternError> {
  if pattern.is_empty() {
    return Err(PatternError::Empty);
  }
  let last = pattern.split(SEPARATOR).count() - 1;
  for (index, segment) in pattern.split(SEPARATOR).enumerate() {
    match segment {
      SINGLE_LEVEL => {}
      MULTI_LEVEL if index == last => {}
      MULTI_LEVEL => {
        return Err(PatternError::MultiLevelNotLast { pattern: pattern.to_owned() });
      }
      literal if literal.contains(|c: char| c == '+' || c == '#') => {
        return Err(PatternError::MixedWildcard { pattern: pattern.to_owned(), index });
      }
      _ => {}
    }
  }
  Ok(())
}

impl TopicFilter {
  /// The pattern this filter was compiled from, byte for byte.
  #[inline]
  pub fn pattern(&self) -> &str { &self.pattern }

  /// Whether the filter contains `+` or `#`.
  pub fn has_wildcards(&self) -> bool {
    self
      .segments
      .iter()
      .any(|s| !matches!(s, Segment::Literal(_)))
  }

  /// Tests a concrete topic against this filter.
  ///
  /// A trailing `#` also matches the parent level, so `sensors/#` matches
  /// `sensors` as well as `sensors/a/b`.
  pub fn matches(&self, topic: &str) -> bool {
    let mut levels = topic.split(SEPARATOR);
    for segment in &self.segments {
      match segment {
        Segment::MultiLevel => return true,
        Segment::SingleLevel => {
          if levels.next().is_none() {
            return false;
          }
        }
        Segment::Literal(literal) => match levels.next() {
          Some(level) if level == literal => {}
          _ => return false,
        },
      }
    }
    levels.next().is_none()
  }
}

impl FromStr for TopicFilter {
  type Err = PatternError;

  fn from_str(s: &str) -> Result<Self, Self::Err> { compile(s) }
}

impl fmt::Display for TopicFilter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.pattern) }
}
