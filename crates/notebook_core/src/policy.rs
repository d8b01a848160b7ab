//! Naming and nesting rules for notebook items.
//!
//! # Responsibility
//! - Normalize and validate display names.
//! - Compute item depth and enforce the configured nesting limit.
//!
//! # Invariants
//! - Every function here is pure: no I/O, no shared state.
//! - Depth errors carry the configured limit for user-facing rendering.

use crate::config::NotebookConfig;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Longest accepted display name, in characters.
pub const MAX_NAME_CHARS: usize = 255;
const RESERVED_NAMES: &[&str] = &[".", ".."];

/// Validation failure for a structural mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Name is blank after trimming.
    EmptyName,
    /// Name contains a control character.
    InvalidCharacter(char),
    NameTooLong { max_chars: usize },
    ReservedName(String),
    /// The item (or a descendant of a moved item) would exceed `limit`.
    DepthExceeded { limit: u32 },
    /// A sibling already uses this name and uniqueness is enforced.
    DuplicateName(String),
}

impl Display for PolicyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "name must not be blank"),
            Self::InvalidCharacter(ch) => {
                write!(f, "name contains invalid character U+{:04X}", *ch as u32)
            }
            Self::NameTooLong { max_chars } => {
                write!(f, "name is longer than {max_chars} characters")
            }
            Self::ReservedName(name) => write!(f, "name `{name}` is reserved"),
            Self::DepthExceeded { limit } => {
                write!(f, "maximum nesting level reached ({limit} levels)")
            }
            Self::DuplicateName(name) => {
                write!(f, "an item named `{name}` already exists here")
            }
        }
    }
}

impl Error for PolicyError {}

/// Naming/nesting rules derived from `NotebookConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathPolicy {
    max_depth: u32,
    unique_sibling_names: bool,
}

impl PathPolicy {
    pub fn new(max_depth: u32, unique_sibling_names: bool) -> Self {
        Self {
            max_depth,
            unique_sibling_names,
        }
    }

    pub fn from_config(config: &NotebookConfig) -> Self {
        Self::new(config.max_depth, config.unique_sibling_names)
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Returns the trimmed name or the first rule it breaks.
    pub fn validate_name(&self, name: &str) -> Result<String, PolicyError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(PolicyError::EmptyName);
        }
        if let Some(ch) = trimmed.chars().find(|ch| ch.is_control()) {
            return Err(PolicyError::InvalidCharacter(ch));
        }
        if trimmed.chars().count() > MAX_NAME_CHARS {
            return Err(PolicyError::NameTooLong {
                max_chars: MAX_NAME_CHARS,
            });
        }
        if RESERVED_NAMES.contains(&trimmed) {
            return Err(PolicyError::ReservedName(trimmed.to_string()));
        }
        Ok(trimmed.to_string())
    }

    /// Depth of a new child under a parent at `parent_depth`.
    pub fn compute_depth(&self, parent_depth: i32) -> Result<i32, PolicyError> {
        let depth = i64::from(parent_depth) + 1;
        self.check_depth(depth)?;
        // Stored depths are i32; an unvalidated policy may allow more.
        i32::try_from(depth).map_err(|_| PolicyError::DepthExceeded {
            limit: self.max_depth,
        })
    }

    /// Checks that an item placed at `new_depth` whose subtree is
    /// `subtree_height` levels deep (0 for a leaf) stays within the limit.
    pub fn check_subtree_fits(&self, new_depth: i32, subtree_height: u32) -> Result<(), PolicyError> {
        self.check_depth(i64::from(new_depth) + i64::from(subtree_height))
    }

    /// Rejects `name` if uniqueness is enforced and a sibling already uses it.
    pub fn ensure_unique<'a>(
        &self,
        name: &str,
        mut sibling_names: impl Iterator<Item = &'a str>,
    ) -> Result<(), PolicyError> {
        if self.unique_sibling_names && sibling_names.any(|sibling| sibling == name) {
            return Err(PolicyError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    fn check_depth(&self, depth: i64) -> Result<(), PolicyError> {
        if depth > i64::from(self.max_depth) {
            return Err(PolicyError::DepthExceeded {
                limit: self.max_depth,
            });
        }
        Ok(())
    }
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self::from_config(&NotebookConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::{PathPolicy, PolicyError, MAX_NAME_CHARS};
    use crate::model::item::ROOT_DEPTH;

    #[test]
    fn validate_name_trims_and_rejects_blank() {
        let policy = PathPolicy::default();
        assert_eq!(policy.validate_name("  Projects ").unwrap(), "Projects");
        assert_eq!(policy.validate_name(" \t "), Err(PolicyError::EmptyName));
    }

    #[test]
    fn validate_name_rejects_control_reserved_and_long_names() {
        let policy = PathPolicy::default();
        assert_eq!(
            policy.validate_name("a\u{0}b"),
            Err(PolicyError::InvalidCharacter('\u{0}'))
        );
        assert!(matches!(
            policy.validate_name(".."),
            Err(PolicyError::ReservedName(_))
        ));
        let long = "x".repeat(MAX_NAME_CHARS + 1);
        assert!(matches!(
            policy.validate_name(&long),
            Err(PolicyError::NameTooLong { .. })
        ));
    }

    #[test]
    fn depth_checks_do_not_wrap_for_large_values() {
        let policy = PathPolicy::new(u32::MAX, false);
        assert_eq!(
            policy.compute_depth(i32::MAX),
            Err(PolicyError::DepthExceeded { limit: u32::MAX })
        );
        let tight = PathPolicy::new(3, false);
        assert_eq!(
            tight.check_subtree_fits(1, u32::MAX),
            Err(PolicyError::DepthExceeded { limit: 3 })
        );
        assert!(tight.check_subtree_fits(1, 2).is_ok());
    }

    #[test]
    fn compute_depth_enforces_limit() {
        let policy = PathPolicy::new(2, false);
        assert_eq!(policy.compute_depth(ROOT_DEPTH).unwrap(), 0);
        assert_eq!(policy.compute_depth(1).unwrap(), 2);
        assert_eq!(
            policy.compute_depth(2),
            Err(PolicyError::DepthExceeded { limit: 2 })
        );
    }

    #[test]
    fn subtree_height_counts_against_limit() {
        let policy = PathPolicy::new(3, false);
        assert!(policy.check_subtree_fits(1, 2).is_ok());
        assert_eq!(
            policy.check_subtree_fits(2, 2),
            Err(PolicyError::DepthExceeded { limit: 3 })
        );
    }

    #[test]
    fn depth_error_renders_limit() {
        let message = PolicyError::DepthExceeded { limit: 10 }.to_string();
        assert_eq!(message, "maximum nesting level reached (10 levels)");
    }

    #[test]
    fn uniqueness_is_opt_in() {
        let lenient = PathPolicy::new(10, false);
        assert!(lenient.ensure_unique("A", ["A"].into_iter()).is_ok());

        let strict = PathPolicy::new(10, true);
        assert_eq!(
            strict.ensure_unique("A", ["B", "A"].into_iter()),
            Err(PolicyError::DuplicateName("A".to_string()))
        );
    }
}
