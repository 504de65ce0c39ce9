//! Path matching shared by full rescans and live watching
//!
//! Ignore globs are tried against every path suffix that starts at a
//! component boundary, so `node_modules/**` also drops
//! `packages/web/node_modules/react/index.js`. Include globs stay
//! anchored at the project root.

use crate::indexer::IndexError;
use glob::Pattern;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;
use tracing::warn;

/// Directories that are never part of a project's context
const RESERVED: [&str; 2] = [".sker/", ".git/"];

#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    max_depth: Option<usize>,
    gitignore: Option<Gitignore>,
}

impl PathMatcher {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, IndexError> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
            ..Default::default()
        })
    }

    /// Reject paths with more than `depth` components
    pub fn with_max_depth(mut self, depth: Option<usize>) -> Self {
        self.max_depth = depth;
        self
    }

    /// Also honour `<root>/.gitignore`, when there is one
    pub fn with_gitignore(mut self, root: &Path) -> Self {
        let file = root.join(".gitignore");
        if !file.is_file() {
            return self;
        }

        let mut builder = GitignoreBuilder::new(root);
        if let Some(e) = builder.add(&file) {
            warn!("Partially parsed {:?}: {}", file, e);
        }
        match builder.build() {
            Ok(gitignore) => self.gitignore = Some(gitignore),
            Err(e) => warn!("Ignoring {:?}: {}", file, e),
        }
        self
    }

    /// Whether a project-relative, `/`-separated path belongs in the context
    pub fn matches(&self, relative: &str, is_dir: bool) -> bool {
        if RESERVED.iter().any(|dir| relative.starts_with(dir)) {
            return false;
        }
        if let Some(depth) = self.max_depth {
            if relative.split('/').count() > depth {
                return false;
            }
        }
        if suffixes(relative).any(|s| self.exclude.iter().any(|p| p.matches(s))) {
            return false;
        }
        if let Some(gitignore) = &self.gitignore {
            if gitignore.matched_path_or_any_parents(relative, is_dir).is_ignore() {
                return false;
            }
        }
        self.include.is_empty() || self.include.iter().any(|p| p.matches(relative))
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, IndexError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|source| IndexError::Pattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

/// `a/b/c`, `b/c`, `c`
fn suffixes(relative: &str) -> impl Iterator<Item = &str> {
    let rest = relative.match_indices('/').map(move |(i, _)| &relative[i + 1..]);
    std::iter::once(relative).chain(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn defaults() -> Vec<String> {
        ["node_modules/**", ".git/**", "dist/**", "build/**", "target/**", ".sker/**"]
            .iter()
            .map(|p| p.to_string())
            .collect()
    }

    #[test]
    fn test_ignore_globs_apply_at_any_depth() {
        let matcher = PathMatcher::new(&[], &defaults()).unwrap();

        assert!(matcher.matches("src/main.ts", false));
        assert!(!matcher.matches("node_modules/react/index.js", false));
        assert!(!matcher.matches("packages/web/node_modules/react/index.js", false));
        assert!(!matcher.matches("packages/web/dist/app.js", false));
        assert!(!matcher.matches("crates/x/target/debug/foo", false));
        assert!(!matcher.matches(".sker/context.db", false));
        // Only whole components count
        assert!(matcher.matches("src/distance.ts", false));
    }

    #[test]
    fn test_include_globs_stay_anchored() {
        let matcher = PathMatcher::new(&["src/**".to_string()], &[]).unwrap();
        assert!(matcher.matches("src/lib.rs", false));
        assert!(!matcher.matches("packages/a/src/lib.rs", false));
    }

    #[test]
    fn test_depth_limit() {
        let matcher = PathMatcher::default().with_max_depth(Some(2));
        assert!(matcher.matches("a.ts", false));
        assert!(matcher.matches("a/b.ts", false));
        assert!(!matcher.matches("a/b/c.ts", false));
    }

    #[test]
    fn test_gitignore_rules() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".gitignore"), "*.log\ncoverage/\n").unwrap();

        let matcher = PathMatcher::default().with_gitignore(dir.path());
        assert!(!matcher.matches("debug.log", false));
        assert!(!matcher.matches("server/trace.log", false));
        assert!(!matcher.matches("coverage/lcov.info", false));
        assert!(matcher.matches("src/app.ts", false));

        // No .gitignore, nothing extra dropped
        let empty = TempDir::new().unwrap();
        let matcher = PathMatcher::default().with_gitignore(empty.path());
        assert!(matcher.matches("debug.log", false));
    }

    #[test]
    fn test_bad_pattern_is_error() {
        let err = PathMatcher::new(&[], &["[".to_string()]).unwrap_err();
        assert!(matches!(err, IndexError::Pattern { ref pattern, .. } if pattern == "["));
    }
}
