//! Filename glob matching, compatible with gitignore pattern syntax.
//!
//! Patterns are compiled once into a byte-coded program and then matched
//! repeatedly by a linear interpreter. The pre-processing makes repeated
//! matching substantially cheaper than re-parsing the pattern per call, and
//! the opcode for trailing `*literal` turns the common "ends with" patterns
//! into a single suffix compare.

use bitflags::bitflags;

bitflags! {
    /// Options for [`GlobMatcher::new`].
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct GlobOptions: u32 {
        /// `*` and `**` do not match names starting with `.`.
        const IGNORE_DOTFILES = 0x01;
        /// ASCII case-fold both pattern and text. Bytes outside ASCII
        /// compare code-point-identically regardless.
        const CASE_INSENSITIVE = 0x02;
    }
}

/// Error describing why a glob pattern failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct GlobError(pub String);

/*
 * Opcode bytes for the compiled pattern buffer.
 */

// A chunk of literal string data: length byte, then the literal bytes.
// Literal runs longer than 255 bytes are broken into separate opcodes.
const GLOB_LITERAL: u8 = b'S';
// Matches 0 or more characters except '/'. Followed by a bool byte: if true,
// the match may start with a '.'.
const GLOB_STAR: u8 = b'*';
// Matches all remaining text. Followed by a bool byte: if true, path
// components in the matched text may start with '.'. Always the last opcode
// when present.
const GLOB_STAR_STAR_END: u8 = b'>';
// Matches either nothing, or 1+ characters followed by a slash. Followed by
// the same bool byte as GLOB_STAR_STAR_END.
const GLOB_STAR_STAR_SLASH: u8 = b'X';
// A character class. Followed by match bytes, terminated by
// GLOB_CHAR_CLASS_END. GLOB_CHAR_CLASS_RANGE is followed by inclusive low
// and high bounds; any other byte matches only itself. Literal 0x00/0x01
// bytes are encoded as single-element ranges.
const GLOB_CHAR_CLASS: u8 = b'[';
const GLOB_CHAR_CLASS_NEGATED: u8 = b']';
const GLOB_CHAR_CLASS_END: u8 = 0x00;
const GLOB_CHAR_CLASS_RANGE: u8 = 0x01;
// Matches any single character except '/'.
const GLOB_QMARK: u8 = b'?';
// A literal section at the end of the string preceded by '*': the fusion of
// GLOB_STAR + trailing GLOB_LITERAL. Followed by the star's bool byte, then
// the literal length byte and data.
const GLOB_ENDS_WITH: u8 = b'$';
const GLOB_TRUE: u8 = b'T';
const GLOB_FALSE: u8 = b'F';

/// A compiled glob pattern.
///
/// The default value matches only the empty string.
#[derive(Debug, Default, Clone)]
pub struct GlobMatcher {
    pattern: Vec<u8>,
    case_insensitive: bool,
}

impl GlobMatcher {
    /// Compile a glob pattern. Returns a descriptive error for malformed
    /// patterns (dangling backslash, misplaced `**`, unterminated brackets,
    /// unknown named classes).
    pub fn new(glob: &str, options: GlobOptions) -> Result<GlobMatcher, GlobError> {
        let glob = glob.as_bytes();
        let case_insensitive = options.contains(GlobOptions::CASE_INSENSITIVE);
        let fold = |c: u8| {
            if case_insensitive {
                c.to_ascii_lowercase()
            } else {
                c
            }
        };

        let mut result: Vec<u8> = Vec::with_capacity(glob.len() + 6);
        let mut prev_opcode_idx: Option<usize> = None;
        let mut cur_opcode_idx: Option<usize> = None;

        macro_rules! add_opcode {
            ($opcode:expr) => {{
                prev_opcode_idx = cur_opcode_idx;
                cur_opcode_idx = Some(result.len());
                result.push($opcode);
            }};
        }

        macro_rules! append_literal_byte {
            ($c:expr) => {{
                let c = fold($c);
                match cur_opcode_idx {
                    Some(idx) if result[idx] == GLOB_LITERAL && result[idx + 1] < 0xff => {
                        // Append to the current literal section.
                        result[idx + 1] += 1;
                        result.push(c);
                    }
                    _ => {
                        // Not in a literal section (or the current one is
                        // full); start a new one.
                        add_opcode!(GLOB_LITERAL);
                        result.push(1);
                        result.push(c);
                    }
                }
            }};
        }

        let append_bool = |result: &mut Vec<u8>, b: bool| {
            result.push(if b { GLOB_TRUE } else { GLOB_FALSE });
        };

        // Paths handed to the matcher are normalized, so unlike watchman-style
        // wildcards there is no handling for repeated slashes in the text.

        let include_dotfiles = !options.contains(GlobOptions::IGNORE_DOTFILES);
        let mut idx = 0;
        while idx < glob.len() {
            let c = glob[idx];
            if c == b'\\' {
                // Backslash-escaped characters are treated literally.
                idx += 1;
                if idx >= glob.len() {
                    return Err(GlobError(
                        "glob pattern ends with trailing backslash".to_string(),
                    ));
                }
                append_literal_byte!(glob[idx]);
            } else if c == b'?' {
                add_opcode!(GLOB_QMARK);
            } else if c == b'*' {
                if idx + 1 < glob.len() && glob[idx + 1] == b'*' {
                    // "**" is only valid as "**/" at the start, "/**" at the
                    // end, or "/**/" in the middle.
                    idx += 1;
                    if idx + 1 >= glob.len() {
                        if idx < 2 || glob[idx - 2] != b'/' {
                            return Err(GlobError(
                                "invalid \"**\" sequence at end of pattern without slash"
                                    .to_string(),
                            ));
                        }
                        add_opcode!(GLOB_STAR_STAR_END);
                        append_bool(&mut result, include_dotfiles);
                    } else if glob[idx + 1] == b'/' {
                        if idx >= 2 && glob[idx - 2] != b'/' {
                            return Err(GlobError(
                                "\"**/\" must follow a slash or appear at the start of a pattern"
                                    .to_string(),
                            ));
                        }
                        idx += 1;
                        add_opcode!(GLOB_STAR_STAR_SLASH);
                        append_bool(&mut result, include_dotfiles);
                    } else {
                        return Err(GlobError("invalid \"**\" sequence".to_string()));
                    }
                } else {
                    add_opcode!(GLOB_STAR);
                    // With dotfiles excluded, "*.cpp" must not match
                    // ".bak.cpp" but "My*.cpp" must match "My.foo.cpp", so
                    // the preceding character decides.
                    append_bool(
                        &mut result,
                        include_dotfiles || (idx != 0 && glob[idx - 1] != b'/'),
                    );
                }
            } else if c == b'[' {
                prev_opcode_idx = cur_opcode_idx;
                cur_opcode_idx = Some(result.len());
                idx = parse_bracket_expr(glob, idx, fold, &mut result)?;
            } else {
                append_literal_byte!(c);
            }
            idx += 1;
        }

        // Fuse a trailing GLOB_STAR + GLOB_LITERAL into GLOB_ENDS_WITH. The
        // star's bool byte stays in place; only the literal opcode byte is
        // removed.
        if let (Some(prev), Some(cur)) = (prev_opcode_idx, cur_opcode_idx) {
            if result[prev] == GLOB_STAR && result[cur] == GLOB_LITERAL {
                result.remove(cur);
                result[prev] = GLOB_ENDS_WITH;
            }
        }

        Ok(GlobMatcher {
            pattern: result,
            case_insensitive,
        })
    }

    /// Match a string against this pattern. The entire text must match.
    pub fn matches(&self, text: &[u8]) -> bool {
        if self.case_insensitive {
            let folded: Vec<u8> = text.iter().map(|b| b.to_ascii_lowercase()).collect();
            self.try_match_at(&folded, 0, 0)
        } else {
            self.try_match_at(text, 0, 0)
        }
    }

    /// Match the trailing section of `text` starting at `text_idx` against
    /// the trailing portion of the pattern buffer starting at `pattern_idx`.
    fn try_match_at(&self, text: &[u8], mut text_idx: usize, mut pattern_idx: usize) -> bool {
        // One big interpreter loop. Splitting this into per-opcode functions
        // costs measurably on the literal-heavy patterns that dominate
        // ignore files, so everything stays inline.
        while pattern_idx < self.pattern.len() {
            match self.pattern[pattern_idx] {
                GLOB_LITERAL => {
                    let length = self.pattern[pattern_idx + 1] as usize;
                    let literal = &self.pattern[pattern_idx + 2..pattern_idx + 2 + length];
                    pattern_idx += 2 + length;
                    if pattern_idx >= self.pattern.len() {
                        // Final section of the pattern; lengths must line up
                        // exactly.
                        return text.len() - text_idx == length && text[text_idx..] == *literal;
                    }
                    if text.len() - text_idx < length
                        || text[text_idx..text_idx + length] != *literal
                    {
                        return false;
                    }
                    text_idx += length;
                }
                GLOB_STAR => {
                    pattern_idx += 1;
                    let match_can_start_with_dot = self.pattern[pattern_idx] == GLOB_TRUE;
                    pattern_idx += 1;

                    if !match_can_start_with_dot
                        && text_idx < text.len()
                        && text[text_idx] == b'.'
                    {
                        return false;
                    }

                    if pattern_idx >= self.pattern.len() {
                        // '*' at the end of the pattern matches anything
                        // without a slash.
                        return memchr::memchr(b'/', &text[text_idx..]).is_none();
                    } else if self.pattern[pattern_idx] == GLOB_LITERAL {
                        // '*' followed by a literal: jump ahead to each place
                        // the literal occurs, without crossing a '/'.
                        let length = self.pattern[pattern_idx + 1] as usize;
                        let literal = &self.pattern[pattern_idx + 2..pattern_idx + 2 + length];
                        pattern_idx += 2 + length;
                        let next_slash = memchr::memchr(b'/', &text[text_idx..])
                            .map(|off| text_idx + off)
                            .unwrap_or(usize::MAX);
                        loop {
                            let literal_idx =
                                match memchr::memmem::find(&text[text_idx..], literal) {
                                    Some(off) => text_idx + off,
                                    None => return false,
                                };
                            if next_slash < literal_idx {
                                return false;
                            }
                            if self.try_match_at(text, literal_idx + length, pattern_idx) {
                                return true;
                            }
                            // No match here; move forward and try again.
                            text_idx = literal_idx + 1;
                        }
                    } else {
                        // '*' followed by another special (? or a character
                        // class). Try forward one character at a time; rare
                        // in practice.
                        while text_idx < text.len() {
                            if self.try_match_at(text, text_idx, pattern_idx) {
                                return true;
                            }
                            if text[text_idx] == b'/' {
                                return false;
                            }
                            text_idx += 1;
                        }
                        return false;
                    }
                }
                GLOB_ENDS_WITH => {
                    pattern_idx += 1;
                    let match_can_start_with_dot = self.pattern[pattern_idx] == GLOB_TRUE;

                    // With dotfiles excluded, also reject matching the empty
                    // string followed by a dot: `*.cpp` does not match
                    // `.cpp`, same as POSIX fnmatch(). Any match of '*'
                    // starts at text_idx, so one check suffices.
                    if !match_can_start_with_dot
                        && text_idx < text.len()
                        && text[text_idx] == b'.'
                    {
                        return false;
                    }

                    let length = self.pattern[pattern_idx + 1] as usize;
                    let literal = &self.pattern[pattern_idx + 2..pattern_idx + 2 + length];
                    if text.len() - text_idx < length {
                        return false;
                    }
                    if text[text.len() - length..] != *literal {
                        return false;
                    }
                    // Suffix matched; the portion covered by '*' must not
                    // contain a slash.
                    return memchr::memchr(b'/', &text[text_idx..text.len() - length]).is_none();
                }
                GLOB_STAR_STAR_END => {
                    // '**' at the end of a pattern matches all remaining
                    // text, except that with dotfiles excluded no remaining
                    // path component may start with '.'.
                    pattern_idx += 1;
                    if self.pattern[pattern_idx] == GLOB_TRUE {
                        return true;
                    }
                    // By construction this opcode is preceded by a slash, so
                    // scanning from the previous character catches a dot at
                    // the start of the current component too.
                    let search_start = text_idx.saturating_sub(1);
                    return memchr::memmem::find(&text[search_start..], b"/.").is_none();
                }
                GLOB_STAR_STAR_SLASH => {
                    pattern_idx += 1;
                    let component_cannot_start_with_dot = self.pattern[pattern_idx] == GLOB_FALSE;

                    // "**/" matches nothing at all, or any number of
                    // characters followed by a slash.
                    pattern_idx += 1;
                    loop {
                        if self.try_match_at(text, text_idx, pattern_idx) {
                            return true;
                        }

                        let prev_text_idx = text_idx;
                        let from = match prev_text_idx.checked_add(1) {
                            Some(from) if from <= text.len() => from,
                            _ => return false,
                        };
                        text_idx = match memchr::memchr(b'/', &text[from..]) {
                            Some(off) => from + off,
                            None => return false,
                        };
                        if component_cannot_start_with_dot && text[prev_text_idx] == b'.' {
                            return false;
                        }
                        text_idx += 1;
                    }
                }
                _ => {
                    // The remaining specials each match exactly one
                    // character, and '/' never qualifies.
                    if text_idx >= text.len() {
                        return false;
                    }
                    let ch = text[text_idx];
                    text_idx += 1;
                    if ch == b'/' {
                        return false;
                    }

                    match self.pattern[pattern_idx] {
                        GLOB_CHAR_CLASS => {
                            if !self.char_class_match(ch, &mut pattern_idx) {
                                return false;
                            }
                        }
                        GLOB_CHAR_CLASS_NEGATED => {
                            if self.char_class_match(ch, &mut pattern_idx) {
                                return false;
                            }
                        }
                        GLOB_QMARK => {
                            pattern_idx += 1;
                        }
                        opcode => {
                            unreachable!("corrupt glob program: opcode {opcode:#04x}");
                        }
                    }
                }
            }
        }

        text_idx == text.len()
    }

    /// Check `ch` against the character class opcode at `*pattern_idx` and
    /// advance `*pattern_idx` past the class.
    fn char_class_match(&self, ch: u8, pattern_idx: &mut usize) -> bool {
        let mut idx = *pattern_idx + 1;
        loop {
            match self.pattern[idx] {
                GLOB_CHAR_CLASS_END => {
                    *pattern_idx = idx + 1;
                    return false;
                }
                GLOB_CHAR_CLASS_RANGE => {
                    let low = self.pattern[idx + 1];
                    let high = self.pattern[idx + 2];
                    idx += 2;
                    if low <= ch && ch <= high {
                        break;
                    }
                    idx += 1;
                }
                other => {
                    idx += 1;
                    if ch == other {
                        break;
                    }
                }
            }
        }

        // Found a match; scan forward to the end of the class. Class data is
        // short in practice, so the scan does not matter.
        loop {
            match self.pattern[idx] {
                GLOB_CHAR_CLASS_END => {
                    *pattern_idx = idx + 1;
                    return true;
                }
                GLOB_CHAR_CLASS_RANGE => idx += 3,
                _ => idx += 1,
            }
        }
    }
}

/// Parse a bracket expression starting at `glob[idx] == b'['`, appending the
/// compiled class to `pattern`. Returns the index of the closing bracket.
fn parse_bracket_expr(
    glob: &[u8],
    mut idx: usize,
    fold: impl Fn(u8) -> u8,
    pattern: &mut Vec<u8>,
) -> Result<usize, GlobError> {
    debug_assert_eq!(glob[idx], b'[');

    // Leading '!' or '^' negates the class.
    if idx + 1 >= glob.len() {
        return Err(GlobError("unterminated bracket sequence".to_string()));
    }
    if glob[idx + 1] == b'!' || glob[idx + 1] == b'^' {
        pattern.push(GLOB_CHAR_CLASS_NEGATED);
        idx += 1;
    } else {
        pattern.push(GLOB_CHAR_CLASS);
    }

    let mut prev_char: Option<u8> = None;
    macro_rules! add_prev_char {
        () => {
            if let Some(prev) = prev_char {
                if prev == GLOB_CHAR_CLASS_END || prev == GLOB_CHAR_CLASS_RANGE {
                    // Escape these two bytes by encoding them as
                    // single-element ranges.
                    pattern.push(GLOB_CHAR_CLASS_RANGE);
                    pattern.push(prev);
                    pattern.push(prev);
                } else {
                    pattern.push(prev);
                }
            }
        };
    }

    let start_idx = idx;
    loop {
        idx += 1;
        if idx >= glob.len() {
            return Err(GlobError("unterminated bracket sequence".to_string()));
        }

        let c = glob[idx];
        if c == b'\\' {
            idx += 1;
            if idx >= glob.len() {
                return Err(GlobError(
                    "unterminated backslash in bracket sequence".to_string(),
                ));
            }
            add_prev_char!();
            prev_char = Some(fold(glob[idx]));
        } else if c == b']' {
            // ']' ends the class unless it is the very first character
            // after '[' or '[^'.
            if idx == start_idx + 1 {
                debug_assert_eq!(prev_char, None);
                prev_char = Some(c);
            } else {
                break;
            }
        } else if c == b'-' {
            match prev_char {
                None => prev_char = Some(c),
                Some(low) => {
                    if idx + 1 >= glob.len() {
                        return Err(GlobError("unterminated bracket range".to_string()));
                    } else if glob[idx + 1] == b']' {
                        // '-' right before the closing bracket is a literal.
                        add_prev_char!();
                        prev_char = Some(c);
                    } else {
                        idx += 1;
                        let mut high = glob[idx];
                        if high == b'\\' {
                            idx += 1;
                            if idx >= glob.len() {
                                return Err(GlobError(
                                    "unterminated escape in bracket range".to_string(),
                                ));
                            }
                            high = glob[idx];
                        }
                        let high = fold(high);
                        // A range with low > high can never match; skip it
                        // without treating the whole glob as invalid.
                        if low <= high {
                            pattern.push(GLOB_CHAR_CLASS_RANGE);
                            pattern.push(low);
                            pattern.push(high);
                        }
                        prev_char = None;
                    }
                }
            }
        } else if c == b'[' {
            // Possibly a named class like [:alpha:].
            let mut is_class = false;
            if idx + 3 < glob.len() && glob[idx + 1] == b':' {
                let class_start = idx + 2;
                let mut end = class_start;
                while end + 1 < glob.len() {
                    if glob[end] == b':' && glob[end + 1] == b']' {
                        let class_name = &glob[class_start..end];
                        if !add_named_class(class_name, pattern) {
                            return Err(GlobError(format!(
                                "unknown character class \"{}\"",
                                String::from_utf8_lossy(class_name)
                            )));
                        }
                        idx = end + 1;
                        is_class = true;
                        break;
                    }
                    end += 1;
                }
            }
            // Not a named class; a literal '[' character.
            if !is_class {
                add_prev_char!();
                prev_char = Some(c);
            }
        } else {
            add_prev_char!();
            prev_char = Some(fold(c));
        }
    }

    add_prev_char!();
    pattern.push(GLOB_CHAR_CLASS_END);
    Ok(idx)
}

/// Append the expansion of a POSIX named character class. Definitions match
/// the POSIX Standard Locale (ISO/IEC 9945-2:1993).
fn add_named_class(class_name: &[u8], pattern: &mut Vec<u8>) -> bool {
    let mut add_range = |low: u8, high: u8| {
        pattern.push(GLOB_CHAR_CLASS_RANGE);
        pattern.push(low);
        pattern.push(high);
    };

    match class_name {
        b"alnum" => {
            add_range(b'a', b'z');
            add_range(b'A', b'Z');
            add_range(b'0', b'9');
        }
        b"alpha" => {
            add_range(b'a', b'z');
            add_range(b'A', b'Z');
        }
        b"blank" => {
            pattern.push(b' ');
            pattern.push(b'\t');
        }
        b"cntrl" => {
            add_range(0x00, 0x1f);
            pattern.push(0x7f);
        }
        b"digit" => add_range(b'0', b'9'),
        b"graph" => add_range(0x21, 0x7e),
        b"lower" => add_range(b'a', b'z'),
        b"print" => add_range(0x20, 0x7e),
        b"punct" => {
            add_range(0x21, 0x2f);
            add_range(0x3a, 0x40);
            add_range(0x5b, 0x60);
            add_range(0x7b, 0x7e);
        }
        b"space" => {
            pattern.push(b' ');
            pattern.push(0x0c);
            pattern.push(b'\n');
            pattern.push(b'\r');
            pattern.push(b'\t');
            pattern.push(0x0b);
        }
        b"upper" => add_range(b'A', b'Z'),
        b"xdigit" => {
            add_range(b'0', b'9');
            add_range(b'a', b'f');
            add_range(b'A', b'F');
        }
        _ => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(pattern: &str) -> GlobMatcher {
        GlobMatcher::new(pattern, GlobOptions::default())
            .unwrap_or_else(|err| panic!("failed to compile {pattern:?}: {err}"))
    }

    fn matcher_no_dots(pattern: &str) -> GlobMatcher {
        GlobMatcher::new(pattern, GlobOptions::IGNORE_DOTFILES)
            .unwrap_or_else(|err| panic!("failed to compile {pattern:?}: {err}"))
    }

    #[test]
    fn literal_patterns() {
        let m = matcher("foo.txt");
        assert!(m.matches(b"foo.txt"));
        assert!(!m.matches(b"foo.txt2"));
        assert!(!m.matches(b"barfoo.txt"));
        assert!(!m.matches(b""));
    }

    #[test]
    fn empty_pattern_matches_only_empty_string() {
        let m = matcher("");
        assert!(m.matches(b""));
        assert!(!m.matches(b"a"));
    }

    #[test]
    fn star_does_not_cross_slashes() {
        let m = matcher("foo/*.txt");
        assert!(m.matches(b"foo/a.txt"));
        assert!(!m.matches(b"foo/bar/a.txt"));
    }

    #[test]
    fn ends_with_fusion() {
        let m = matcher("*.txt");
        assert!(m.matches(b"a.txt"));
        assert!(m.matches(b"a.b.txt"));
        assert!(!m.matches(b"a.txt.o"));
        assert!(!m.matches(b"dir/a.txt"));
    }

    #[test]
    fn qmark_matches_single_non_slash() {
        let m = matcher("a?c");
        assert!(m.matches(b"abc"));
        assert!(m.matches(b"a.c"));
        assert!(!m.matches(b"a/c"));
        assert!(!m.matches(b"ac"));
        assert!(!m.matches(b"abbc"));
    }

    #[test]
    fn star_star_middle_and_end() {
        let m = matcher("foo/**/bar");
        assert!(m.matches(b"foo/bar"));
        assert!(m.matches(b"foo/a/bar"));
        assert!(m.matches(b"foo/a/b/bar"));
        assert!(!m.matches(b"foo/a/baz"));

        let m = matcher("foo/**");
        assert!(m.matches(b"foo/a"));
        assert!(m.matches(b"foo/a/b/c"));
        assert!(!m.matches(b"fob/a"));
    }

    #[test]
    fn leading_star_star() {
        let m = matcher("**/*.c");
        assert!(m.matches(b"a/b.c"));
        assert!(m.matches(b"b.c"));
        assert!(m.matches(b"a/b/c/d.c"));
        assert!(!m.matches(b"a/b.cpp"));
    }

    #[test]
    fn invalid_patterns_rejected() {
        for pattern in ["[", "[a-", "[abc", "trailing\\", "a**", "**b", "a**/b", "x/y**"] {
            assert!(
                GlobMatcher::new(pattern, GlobOptions::default()).is_err(),
                "expected {pattern:?} to fail compilation"
            );
        }
        assert!(
            GlobMatcher::new("[[:bogus:]]", GlobOptions::default())
                .unwrap_err()
                .0
                .contains("unknown character class")
        );
    }

    #[test]
    fn char_classes() {
        let m = matcher("[abc].txt");
        assert!(m.matches(b"a.txt"));
        assert!(m.matches(b"c.txt"));
        assert!(!m.matches(b"d.txt"));

        let m = matcher("[a-z0-9].txt");
        assert!(m.matches(b"q.txt"));
        assert!(m.matches(b"7.txt"));
        assert!(!m.matches(b"Q.txt"));

        let m = matcher("[!a-z].txt");
        assert!(m.matches(b"A.txt"));
        assert!(!m.matches(b"a.txt"));
        // Negated classes still never match '/'.
        assert!(!m.matches(b"/.txt"));
    }

    #[test]
    fn bracket_edge_cases() {
        // ']' immediately after '[' is a literal.
        let m = matcher("[]]x");
        assert!(m.matches(b"]x"));
        // '-' before the closing bracket is a literal.
        let m = matcher("[a-]");
        assert!(m.matches(b"a"));
        assert!(m.matches(b"-"));
        assert!(!m.matches(b"b"));
    }

    #[test]
    fn named_classes() {
        let m = matcher("[[:digit:]][[:alpha:]]");
        assert!(m.matches(b"1a"));
        assert!(m.matches(b"9Z"));
        assert!(!m.matches(b"a1"));
    }

    #[test]
    fn escaped_specials_are_literal() {
        let m = matcher("a\\*b");
        assert!(m.matches(b"a*b"));
        assert!(!m.matches(b"axb"));
    }

    #[test]
    fn dotfile_policy_for_star() {
        // With dotfiles excluded, '*' cannot match a leading dot...
        let m = matcher_no_dots("*.cpp");
        assert!(m.matches(b"foo.cpp"));
        assert!(!m.matches(b".bak.cpp"));
        assert!(!m.matches(b".cpp"));
        // ...unless the star is not at the start of a component.
        let m = matcher_no_dots("My*.cpp");
        assert!(m.matches(b"My.foo.cpp"));
        // Default options allow dotfiles.
        let m = matcher("*.cpp");
        assert!(m.matches(b".bak.cpp"));
    }

    #[test]
    fn dotfile_policy_for_star_star_end() {
        let m = matcher_no_dots("foo/**");
        assert!(m.matches(b"foo/bar/baz"));
        assert!(!m.matches(b"foo/.bar"));
        assert!(!m.matches(b"foo/bar/.baz"));

        let m = matcher("foo/**");
        assert!(m.matches(b"foo/.bar"));
    }

    #[test]
    fn dotfile_policy_for_star_star_slash() {
        let m = matcher_no_dots("**/bar");
        assert!(m.matches(b"a/b/bar"));
        assert!(!m.matches(b".a/bar"));
        assert!(!m.matches(b"a/.b/bar"));
    }

    #[test]
    fn case_insensitive_folds_ascii() {
        let m = GlobMatcher::new("*.TXT", GlobOptions::CASE_INSENSITIVE).unwrap();
        assert!(m.matches(b"readme.txt"));
        assert!(m.matches(b"README.TXT"));
        let m = GlobMatcher::new("[a-z].c", GlobOptions::CASE_INSENSITIVE).unwrap();
        assert!(m.matches(b"Q.C"));
    }

    #[test]
    fn star_followed_by_class() {
        let m = matcher("a*[0-9]");
        assert!(m.matches(b"abc7"));
        assert!(m.matches(b"a9"));
        assert!(!m.matches(b"abc"));
        assert!(!m.matches(b"ab/7"));
    }
}
