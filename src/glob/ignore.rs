//! Ignore-rule files using gitignore pattern syntax.
//!
//! An [`IgnoreFile`] holds the parsed rules from one ignore file. Rules are
//! evaluated last-match-wins; the rule list is stored reversed so evaluation
//! can stop at the first hit.

use bitflags::bitflags;

use super::matcher::{GlobMatcher, GlobOptions};
use crate::path::RelativePath;

/// Outcome of matching one path against a rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// No rule matched.
    NoMatch,
    /// The path is ignored.
    Exclude,
    /// A `!` rule explicitly includes the path.
    Include,
    /// The path is inside the product's private directory and must never be
    /// visible to rule evaluation above it.
    Hidden,
}

/// Whether the path being matched refers to a file or a directory; rules
/// ending in `/` only apply to directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct PatternFlags: u32 {
        /// Pattern started with '!': explicitly include matching paths.
        const INCLUDE = 0x01;
        /// Pattern ended with '/': only matches directories.
        const MUST_BE_DIR = 0x02;
        /// Pattern contains no '/': match against the basename only.
        const BASENAME_ONLY = 0x04;
    }
}

/// A single pattern loaded from an ignore file.
///
/// Each line becomes one pattern, except empty lines, comments, and invalid
/// lines, which produce none.
#[derive(Debug, Clone)]
pub struct IgnorePattern {
    flags: PatternFlags,
    matcher: GlobMatcher,
}

impl IgnorePattern {
    /// Parse one line from an ignore file. Returns `None` if the line does
    /// not contain a usable pattern.
    pub fn parse_line(line: &[u8]) -> Option<IgnorePattern> {
        let mut flags = PatternFlags::empty();
        let mut line = line;

        if line.is_empty() {
            return None;
        }

        // '#' starts a comment. Whitespace is still relevant: " #foo" is a
        // pattern that excludes files named " #foo".
        if line[0] == b'#' {
            return None;
        }

        // '!' negates: matching files are explicitly included even if an
        // earlier pattern in the same file excluded them.
        if line[0] == b'!' {
            flags |= PatternFlags::INCLUDE;
            line = &line[1..];
            if line.is_empty() {
                return None;
            }
        }

        // Tolerate CRLF line endings.
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
            if line.is_empty() {
                return None;
            }
        }

        // Trim unescaped trailing spaces.
        let mut end = line.len();
        while end > 0 {
            if line[end - 1] != b' ' {
                break;
            }
            if end >= 2 && line[end - 2] == b'\\' {
                // Escaped space; keep it in the pattern.
                break;
            }
            end -= 1;
        }
        line = &line[..end];
        if line.is_empty() {
            return None;
        }

        // A trailing slash restricts the pattern to directories. The slash
        // itself is dropped since matched paths never carry one.
        if line.last() == Some(&b'/') {
            flags |= PatternFlags::MUST_BE_DIR;
            line = &line[..line.len() - 1];

            // A lone "/" is ignored entirely.
            if line.is_empty() {
                return None;
            }
            // Only one trailing slash is stripped; patterns ending in
            // several can never match anything.
            if line.last() == Some(&b'/') {
                return None;
            }
        }

        // A pattern with no slash matches basenames only; a pattern with a
        // slash matches the path relative to the ignore file's directory. A
        // leading slash only anchors the match and is dropped.
        match memchr::memchr(b'/', line) {
            None => flags |= PatternFlags::BASENAME_ONLY,
            Some(0) => {
                line = &line[1..];
                if line.is_empty() {
                    return None;
                }
                // Two leading slashes can never match.
                if line[0] == b'/' {
                    return None;
                }
            }
            Some(2) if line.starts_with(b"**/") => {
                // "**/foo" with no further slash is equivalent to the
                // basename pattern "foo"; most `**` rules have this shape.
                if memchr::memchr(b'/', &line[3..]).is_none() {
                    line = &line[3..];
                    flags |= PatternFlags::BASENAME_ONLY;
                }
            }
            Some(_) => {}
        }

        // gitignore(5) has '**' match path components starting with '.', so
        // dotfiles are not excluded here.
        let pattern = std::str::from_utf8(line).ok()?;
        let matcher = GlobMatcher::new(pattern, GlobOptions::default()).ok()?;

        Some(IgnorePattern { flags, matcher })
    }

    /// Match a path (relative to the directory this pattern was loaded
    /// from). `basename` must be the final component of `path`; callers
    /// check many patterns per path, so it is computed once outside.
    pub fn matches(
        &self,
        path: &RelativePath,
        basename: &[u8],
        file_type: FileType,
    ) -> MatchResult {
        if self.flags.contains(PatternFlags::MUST_BE_DIR) && file_type != FileType::Directory {
            return MatchResult::NoMatch;
        }

        let is_match = if self.flags.contains(PatternFlags::BASENAME_ONLY) {
            self.matcher.matches(basename)
        } else {
            self.matcher.matches(path.as_bytes())
        };

        if is_match {
            if self.flags.contains(PatternFlags::INCLUDE) {
                MatchResult::Include
            } else {
                MatchResult::Exclude
            }
        } else {
            MatchResult::NoMatch
        }
    }
}

/// The parsed contents of one ignore file.
#[derive(Debug, Default, Clone)]
pub struct IgnoreFile {
    /// Rules in reverse file order, so the first hit wins.
    rules: Vec<IgnorePattern>,
}

impl IgnoreFile {
    pub fn new() -> IgnoreFile {
        IgnoreFile::default()
    }

    /// Parse file contents, replacing any previously loaded rules.
    pub fn load(&mut self, contents: &[u8]) {
        let mut new_rules = Vec::new();

        // Skip a UTF-8 byte order mark.
        let contents = contents
            .strip_prefix(b"\xef\xbb\xbf".as_slice())
            .unwrap_or(contents);

        // The final line counts even without a trailing newline.
        for line in contents.split(|b| *b == b'\n') {
            if let Some(pattern) = IgnorePattern::parse_line(line) {
                new_rules.push(pattern);
            }
        }

        // Patterns follow last-match-wins; reversing them lets matching walk
        // forward and stop at the first hit.
        new_rules.reverse();
        self.rules = new_rules;
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Match `path` against the rules in this file.
    pub fn matches(&self, path: &RelativePath, file_type: FileType) -> MatchResult {
        let basename = path.basename().unwrap_or(b"");
        for rule in &self.rules {
            let result = rule.matches(path, basename, file_type);
            if result != MatchResult::NoMatch {
                return result;
            }
        }
        MatchResult::NoMatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(contents: &str) -> IgnoreFile {
        let mut file = IgnoreFile::new();
        file.load(contents.as_bytes());
        file
    }

    fn check(file: &IgnoreFile, path: &str, file_type: FileType) -> MatchResult {
        file.matches(&RelativePath::from(path), file_type)
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let file = load("# comment\n\nfoo\n");
        assert!(!file.is_empty());
        assert_eq!(check(&file, "foo", FileType::File), MatchResult::Exclude);
        assert_eq!(
            check(&file, "# comment", FileType::File),
            MatchResult::NoMatch
        );
    }

    #[test]
    fn basename_patterns_match_any_directory() {
        let file = load("*.o\n");
        assert_eq!(check(&file, "main.o", FileType::File), MatchResult::Exclude);
        assert_eq!(
            check(&file, "deep/nested/main.o", FileType::File),
            MatchResult::Exclude
        );
        assert_eq!(check(&file, "main.c", FileType::File), MatchResult::NoMatch);
    }

    #[test]
    fn slash_patterns_anchor_to_the_ignore_root() {
        let file = load("build/cache\n");
        assert_eq!(
            check(&file, "build/cache", FileType::File),
            MatchResult::Exclude
        );
        assert_eq!(
            check(&file, "sub/build/cache", FileType::File),
            MatchResult::NoMatch
        );
    }

    #[test]
    fn leading_slash_is_dropped_but_anchors() {
        let file = load("/target\n");
        assert_eq!(check(&file, "target", FileType::File), MatchResult::Exclude);
        assert_eq!(
            check(&file, "sub/target", FileType::File),
            MatchResult::NoMatch
        );
    }

    #[test]
    fn negation_wins_when_later() {
        let file = load("*.log\n!keep.log\n");
        assert_eq!(check(&file, "a.log", FileType::File), MatchResult::Exclude);
        assert_eq!(
            check(&file, "keep.log", FileType::File),
            MatchResult::Include
        );
    }

    #[test]
    fn last_match_wins() {
        let file = load("!keep.log\n*.log\n");
        // The exclude comes later in the file, so it wins.
        assert_eq!(
            check(&file, "keep.log", FileType::File),
            MatchResult::Exclude
        );
    }

    #[test]
    fn trailing_slash_restricts_to_directories() {
        let file = load("cache/\n");
        assert_eq!(
            check(&file, "cache", FileType::Directory),
            MatchResult::Exclude
        );
        assert_eq!(check(&file, "cache", FileType::File), MatchResult::NoMatch);
    }

    #[test]
    fn star_star_basename_optimization() {
        let file = load("**/foo\n**/*.txt\n");
        assert_eq!(
            check(&file, "a/b/foo", FileType::File),
            MatchResult::Exclude
        );
        assert_eq!(check(&file, "foo", FileType::File), MatchResult::Exclude);
        assert_eq!(
            check(&file, "deep/notes.txt", FileType::File),
            MatchResult::Exclude
        );
    }

    #[test]
    fn star_star_with_later_slash_is_not_optimized() {
        let file = load("**/foo/bar\n");
        assert_eq!(
            check(&file, "a/foo/bar", FileType::File),
            MatchResult::Exclude
        );
        assert_eq!(check(&file, "bar", FileType::File), MatchResult::NoMatch);
    }

    #[test]
    fn trailing_spaces_are_trimmed_unless_escaped() {
        let file = load("foo   \nbar\\ \n");
        assert_eq!(check(&file, "foo", FileType::File), MatchResult::Exclude);
        // The escaped trailing space stays part of the pattern. The matcher
        // sees the backslash escape, so the pattern is "bar ".
        assert_eq!(check(&file, "bar", FileType::File), MatchResult::NoMatch);
    }

    #[test]
    fn crlf_is_tolerated() {
        let file = load("foo\r\nbar\r\n");
        assert_eq!(check(&file, "foo", FileType::File), MatchResult::Exclude);
        assert_eq!(check(&file, "bar", FileType::File), MatchResult::Exclude);
    }

    #[test]
    fn degenerate_lines_are_dropped() {
        for contents in ["/\n", "foo//\n", "!\n", "//x\n"] {
            let file = load(contents);
            assert!(file.is_empty(), "expected {contents:?} to produce no rules");
        }
    }

    #[test]
    fn dotfiles_are_matchable() {
        // '**' includes path components starting with '.' in ignore rules.
        let file = load("**/output\n");
        assert_eq!(
            check(&file, ".hidden/output", FileType::File),
            MatchResult::Exclude
        );
    }
}
