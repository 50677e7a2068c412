use glob::{MatchOptions, Pattern};

use crate::ContentError;

/// Glob rules deciding which relative paths are left out of hashing and packaging.
///
/// A rule ignores a path if it matches the whole forward-slash relative path
/// or any single segment of it, so `node_modules` drops
/// `a/node_modules/b.js` and `*.log` drops `logs/app.log`. `*` never crosses
/// a `/`, and a leading dot is not special.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRuleSet {
    patterns: Vec<Pattern>,
}

fn match_options() -> MatchOptions {
    let mut options = MatchOptions::new();
    options.case_sensitive = true;
    options.require_literal_separator = true;
    options.require_literal_leading_dot = false;
    options
}

impl IgnoreRuleSet {
    /// Compiles `patterns`. Blank entries are skipped and a trailing `/` is dropped.
    pub fn new<I, S>(patterns: I) -> Result<Self, ContentError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for raw in patterns {
            let raw = raw.as_ref().trim();
            let trimmed = raw.trim_end_matches('/');
            if trimmed.is_empty() {
                continue;
            }
            let pattern = Pattern::new(trimmed).map_err(|e| ContentError::InvalidPattern {
                pattern: raw.to_string(),
                message: e.msg.to_string(),
            })?;
            compiled.push(pattern);
        }
        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(Pattern::as_str)
    }

    /// Returns `true` if `relative_path` (forward-slash separated) is ignored.
    pub fn should_ignore(&self, relative_path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let path = relative_path.trim_start_matches("./").trim_matches('/');
        if path.is_empty() {
            return false;
        }

        let options = match_options();
        self.patterns.iter().any(|pattern| {
            pattern.matches_with(path, options)
                || path
                    .split('/')
                    .filter(|segment| !segment.is_empty())
                    .any(|segment| pattern.matches_with(segment, options))
        })
    }
}

/// One-shot form of [`IgnoreRuleSet::should_ignore`].
pub fn should_ignore<S: AsRef<str>>(
    relative_path: &str,
    patterns: &[S],
) -> Result<bool, ContentError> {
    Ok(IgnoreRuleSet::new(patterns)?.should_ignore(relative_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(patterns: &[&str]) -> IgnoreRuleSet {
        IgnoreRuleSet::new(patterns).unwrap()
    }

    #[test]
    fn empty_rules_ignore_nothing() {
        let set = IgnoreRuleSet::default();
        assert!(set.is_empty());
        assert!(!set.should_ignore("anything/at/all"));
    }

    #[test]
    fn segment_match_anywhere_in_path() {
        let set = rules(&["node_modules"]);
        assert!(set.should_ignore("node_modules"));
        assert!(set.should_ignore("node_modules/x.js"));
        assert!(set.should_ignore("packages/web/node_modules/react/index.js"));
    }

    #[test]
    fn segment_match_is_whole_segment() {
        let set = rules(&["node_modules"]);
        assert!(!set.should_ignore("src/node_modules_helper.js"));
        assert!(!set.should_ignore("my_node_modules/a"));
    }

    #[test]
    fn wildcard_matches_file_names_at_any_depth() {
        let set = rules(&["*.log"]);
        assert!(set.should_ignore("debug.log"));
        assert!(set.should_ignore("logs/app.log"));
        assert!(!set.should_ignore("logs/app.log.txt"));
    }

    #[test]
    fn star_does_not_cross_separator() {
        let set = rules(&["dist/*.map"]);
        assert!(set.should_ignore("dist/app.js.map"));
        assert!(!set.should_ignore("dist/nested/app.js.map"));
        assert!(!set.should_ignore("src/dist/app.js.map"));
    }

    #[test]
    fn double_star_spans_directories() {
        let set = rules(&["**/tmp/*.txt"]);
        assert!(set.should_ignore("a/b/tmp/notes.txt"));
        assert!(!set.should_ignore("a/b/tmp/notes.md"));
    }

    #[test]
    fn leading_dot_is_not_special() {
        let set = rules(&["*"]);
        assert!(set.should_ignore(".env"));

        let env = rules(&[".env*"]);
        assert!(env.should_ignore("config/.env.local"));
    }

    #[test]
    fn matching_is_case_sensitive() {
        let set = rules(&["README.md"]);
        assert!(set.should_ignore("README.md"));
        assert!(!set.should_ignore("readme.md"));
    }

    #[test]
    fn trailing_slash_and_blank_patterns() {
        let set = rules(&["build/", "  ", ""]);
        assert_eq!(set.patterns().collect::<Vec<_>>(), ["build"]);
        assert!(set.should_ignore("build/out.js"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = IgnoreRuleSet::new(["[unclosed"]).unwrap_err();
        assert!(matches!(err, ContentError::InvalidPattern { .. }));
    }

    #[test]
    fn one_shot_helper() {
        assert!(should_ignore("node_modules/x.js", &["node_modules"]).unwrap());
        assert!(!should_ignore("src/main.rs", &["node_modules"]).unwrap());
    }
}
