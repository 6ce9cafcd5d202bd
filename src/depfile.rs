//! Make-style depfile parsing.
//!
//! The compiler emits `<target>: <input>*` lines describing the source
//! inputs of each output file. A backslash escapes a following space or
//! colon (the escaped character is emitted literally); any other backslash
//! is passed through verbatim as the two-character pair. Tokens end at
//! unescaped whitespace or colon.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::DriverError;

/// Parsed depfile: output target name to its ordered list of input paths.
pub type DepfileMap = BTreeMap<String, Vec<PathBuf>>;

/// Load and parse the depfile at `path`.
///
/// A missing (or unreadable) file yields an empty map; the caller treats
/// that the same as "no recorded inputs".
pub fn load(path: &Path) -> Result<DepfileMap, DriverError> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Ok(DepfileMap::new());
    };
    parse(&content, path)
}

fn parse(content: &str, path: &Path) -> Result<DepfileMap, DriverError> {
    let mut lexer = Lexer::new(content);
    let mut map = DepfileMap::new();

    loop {
        let target = match lexer.next_token() {
            None => break,
            Some(Token::Newline) => continue,
            Some(Token::Word(w)) => w,
        };
        match lexer.next_token() {
            Some(Token::Word(w)) if w == ":" => {}
            _ => {
                return Err(DriverError::MalformedDepfile {
                    path: path.to_path_buf(),
                    line: lexer.line,
                });
            }
        }
        let list = map.entry(target).or_default();
        loop {
            match lexer.next_token() {
                None | Some(Token::Newline) => break,
                Some(Token::Word(w)) => list.push(PathBuf::from(w)),
            }
        }
    }

    Ok(map)
}

enum Token {
    Word(String),
    Newline,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
}

impl<'a> Lexer<'a> {
    fn new(content: &'a str) -> Self {
        Lexer {
            chars: content.chars().peekable(),
            line: 1,
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        while matches!(self.chars.peek(), Some(' ' | '\t')) {
            self.chars.next();
        }
        let mut c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            return Some(Token::Newline);
        }

        let mut word = String::new();
        loop {
            if c == '\\' {
                match self.chars.next() {
                    Some(esc @ (' ' | ':')) => word.push(esc),
                    Some(other) => {
                        word.push('\\');
                        word.push(other);
                    }
                    None => {
                        word.push('\\');
                        break;
                    }
                }
            } else {
                word.push(c);
            }
            match self.chars.peek() {
                Some(&next) if !matches!(next, ' ' | '\t' | ':' | '\n') => {
                    c = self.chars.next().expect("peeked character");
                }
                _ => break,
            }
        }
        Some(Token::Word(word))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(content: &str) -> Result<DepfileMap, DriverError> {
        parse(content, Path::new("test.d"))
    }

    #[test]
    fn missing_file_yields_empty_map() {
        let map = load(Path::new("/nonexistent/out.d")).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn single_target_with_plain_paths() {
        let map = parse_str("out.rlib: src/lib.rs src/util.rs\n").unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(
            map["out.rlib"],
            vec![PathBuf::from("src/lib.rs"), PathBuf::from("src/util.rs")],
        );
    }

    #[test]
    fn escaped_spaces_are_joined() {
        let map = parse_str("out.rlib: src/lib.rs src/mod\\ with\\ space.rs\n").unwrap();
        assert_eq!(
            map["out.rlib"],
            vec![
                PathBuf::from("src/lib.rs"),
                PathBuf::from("src/mod with space.rs"),
            ],
        );
    }

    #[test]
    fn escaped_colons_are_joined() {
        // Windows-style paths embed colons; the compiler escapes them.
        let map = parse_str("out.rlib: C\\:/src/lib.rs\n").unwrap();
        assert_eq!(map["out.rlib"], vec![PathBuf::from("C:/src/lib.rs")]);
    }

    #[test]
    fn other_backslashes_pass_through_as_pairs() {
        let map = parse_str("out: a\\bc\n").unwrap();
        assert_eq!(map["out"], vec![PathBuf::from("a\\bc")]);
    }

    #[test]
    fn multiple_targets() {
        let map = parse_str("a.rlib: x.rs\nb.rlib: y.rs z.rs\n").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["a.rlib"], vec![PathBuf::from("x.rs")]);
        assert_eq!(map["b.rlib"], vec![PathBuf::from("y.rs"), PathBuf::from("z.rs")]);
    }

    #[test]
    fn target_with_no_inputs() {
        let map = parse_str("empty.rlib:\n").unwrap();
        assert!(map["empty.rlib"].is_empty());
    }

    #[test]
    fn blank_lines_are_skipped() {
        let map = parse_str("\n\na.rlib: x.rs\n\n").unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn missing_colon_is_malformed() {
        let err = parse_str("out.rlib src/lib.rs\n").unwrap_err();
        match err {
            DriverError::MalformedDepfile { line, .. } => assert_eq!(line, 1),
            other => panic!("expected MalformedDepfile, got: {other}"),
        }
    }

    #[test]
    fn missing_colon_reports_later_line() {
        let err = parse_str("a: x.rs\nbroken y.rs\n").unwrap_err();
        match err {
            DriverError::MalformedDepfile { line, .. } => assert_eq!(line, 2),
            other => panic!("expected MalformedDepfile, got: {other}"),
        }
    }

    #[test]
    fn round_trips_awkward_path_set() {
        // Escape according to the grammar, then verify the parser recovers
        // the original list.
        let paths = ["plain.rs", "has space.rs", "has:colon.rs", "back\\slash.rs"];
        let mut line = String::from("out:");
        for p in &paths {
            line.push(' ');
            for ch in p.chars() {
                match ch {
                    ' ' | ':' => {
                        line.push('\\');
                        line.push(ch);
                    }
                    // A lone backslash already round-trips as the pair `\X`.
                    _ => line.push(ch),
                }
            }
        }
        line.push('\n');

        let map = parse_str(&line).unwrap();
        let recovered: Vec<String> = map["out"]
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        assert_eq!(recovered, paths);
    }
}
