//! Loop flags declared in the generator config script.
//!
//! The script is never executed. Only top-level `NAME = <literal>` lines are
//! read, where the literal is a boolean, an integer, or a quoted string.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const AUTOSYNTH_MULTIPLE_COMMITS: &str = "AUTOSYNTH_MULTIPLE_COMMITS";
pub const AUTOSYNTH_MULTIPLE_PRS: &str = "AUTOSYNTH_MULTIPLE_PRS";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopFlags {
    /// One commit per attributable change instead of a single squashed commit.
    pub multiple_commits: bool,
    /// One pull request per source.
    pub multiple_prs: bool,
}

/// A literal on the right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Literal {
    pub fn parse(text: &str) -> Option<Literal> {
        let text = text.trim();
        match text {
            "True" | "true" => return Some(Literal::Bool(true)),
            "False" | "false" => return Some(Literal::Bool(false)),
            _ => {}
        }
        if let Ok(n) = text.parse::<i64>() {
            return Some(Literal::Int(n));
        }
        for quote in ['"', '\''] {
            if let Some(inner) = text
                .strip_prefix(quote)
                .and_then(|rest| rest.strip_suffix(quote))
                && !inner.contains(quote)
            {
                return Some(Literal::Str(inner.to_string()));
            }
        }
        None
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Literal::Bool(b) => *b,
            Literal::Int(n) => *n != 0,
            Literal::Str(s) => !s.is_empty(),
        }
    }
}

/// Top-level literal assignments in `source`, in order of appearance.
pub fn literal_assignments(source: &str) -> Vec<(String, Literal)> {
    source
        .lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .filter_map(|line| {
            let line = strip_comment(line);
            let (name, value) = line.split_once('=')?;
            let name = name.trim();
            // Reject `==`, augmented assignments and non-identifiers.
            if value.starts_with('=') || !is_identifier(name) {
                return None;
            }
            Some((name.to_string(), Literal::parse(value)?))
        })
        .collect()
}

/// Extract loop flags from a config script's text. Flags not assigned keep
/// their defaults; a later assignment wins.
pub fn parse_flags(source: &str) -> LoopFlags {
    let mut flags = LoopFlags::default();
    for (name, literal) in literal_assignments(source) {
        flags.set(&name, literal.is_truthy());
    }
    flags
}

/// Read flags from the script at `path`. A missing script yields defaults.
pub fn read_flags(path: &Path) -> std::io::Result<LoopFlags> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(parse_flags(&text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(LoopFlags::default()),
        Err(e) => Err(e),
    }
}

impl LoopFlags {
    fn set(&mut self, name: &str, value: bool) {
        match name {
            AUTOSYNTH_MULTIPLE_COMMITS => self.multiple_commits = value,
            AUTOSYNTH_MULTIPLE_PRS => self.multiple_prs = value,
            _ => {}
        }
    }

    /// Override flags with non-empty values from `lookup` (normally the
    /// process environment). `"false"` in any case means false; any other
    /// value means true.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        for name in [AUTOSYNTH_MULTIPLE_COMMITS, AUTOSYNTH_MULTIPLE_PRS] {
            if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
                self.set(name, !value.eq_ignore_ascii_case("false"));
            }
        }
        self
    }

    /// Whether any flag asks for the attribution loop.
    pub fn wants_loop(&self) -> bool {
        self.multiple_commits || self.multiple_prs
    }
}

fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (None, '#') => return &line[..i],
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            _ => {}
        }
    }
    line
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_flags() {
        let flags = parse_flags("import synthtool as s\ns.move(['src'])\n");
        assert_eq!(flags, LoopFlags::default());
        assert!(!flags.wants_loop());
    }

    #[test]
    fn test_with_flags() {
        let flags = parse_flags("import synthtool\n\nAUTOSYNTH_MULTIPLE_COMMITS = True\n");
        assert!(flags.multiple_commits);
        assert!(!flags.multiple_prs);
    }

    #[test]
    fn test_indented_assignment_ignored() {
        let flags = parse_flags("if x:\n    AUTOSYNTH_MULTIPLE_PRS = True\n");
        assert!(!flags.multiple_prs);
    }

    #[test]
    fn test_syntax_error_yields_defaults() {
        let flags = parse_flags("AUTOSYNTH_MULTIPLE_COMMITS = (\nthis is not python(\n");
        assert_eq!(flags, LoopFlags::default());
    }

    #[test]
    fn test_later_assignment_wins() {
        let flags = parse_flags(
            "AUTOSYNTH_MULTIPLE_PRS = True\nAUTOSYNTH_MULTIPLE_PRS = False  # nope\n",
        );
        assert!(!flags.multiple_prs);
    }

    #[test]
    fn test_literal_kinds() {
        assert_eq!(Literal::parse(" 0 "), Some(Literal::Int(0)));
        assert_eq!(Literal::parse("'yes'"), Some(Literal::Str("yes".into())));
        assert_eq!(Literal::parse("\"\""), Some(Literal::Str(String::new())));
        assert_eq!(Literal::parse("some_call()"), None);
        assert!(!Literal::Str(String::new()).is_truthy());
        assert!(Literal::Int(2).is_truthy());
    }

    #[test]
    fn test_comparison_is_not_assignment() {
        assert!(literal_assignments("AUTOSYNTH_MULTIPLE_PRS == True\n").is_empty());
        assert!(literal_assignments("x.y = True\n").is_empty());
    }

    #[test]
    fn test_hash_inside_string() {
        let assignments = literal_assignments("NAME = 'a#b'  # comment\n");
        assert_eq!(assignments, vec![("NAME".to_string(), Literal::Str("a#b".into()))]);
    }

    #[test]
    fn test_env_overrides() {
        let flags = parse_flags("AUTOSYNTH_MULTIPLE_COMMITS = True\n").with_overrides(|name| {
            match name {
                AUTOSYNTH_MULTIPLE_COMMITS => Some("FALSE".to_string()),
                AUTOSYNTH_MULTIPLE_PRS => Some("1".to_string()),
                _ => None,
            }
        });
        assert!(!flags.multiple_commits);
        assert!(flags.multiple_prs);
    }

    #[test]
    fn test_empty_env_value_does_not_override() {
        let flags = parse_flags("AUTOSYNTH_MULTIPLE_COMMITS = True\n")
            .with_overrides(|_| Some(String::new()));
        assert!(flags.multiple_commits);
    }

    #[test]
    fn test_read_missing_script() {
        let dir = tempfile::tempdir().unwrap();
        let flags = read_flags(&dir.path().join("synth.py")).unwrap();
        assert_eq!(flags, LoopFlags::default());
    }
}
