//! Terminal-statement grammar.
//!
//! A turn ends the session when a line starts with one of
//!
//! ```text
//! FINAL("…")  FINAL('…')  FINAL("""…""")  FINAL('''…''')  FINAL_VAR(identifier)
//! ```
//!
//! Markers buried mid-line (inside a comment or a string the model printed)
//! are not terminal statements.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

const FINAL_MARKER: &str = "FINAL(";
const FINAL_VAR_MARKER: &str = "FINAL_VAR(";

/// A terminal statement found in model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    /// `FINAL(...)` with the quoted answer, trimmed.
    Literal(String),
    /// `FINAL_VAR(name)`; resolved against the session environment.
    Variable(String),
}

/// Anything that can look up an environment binding by name.
pub trait Bindings {
    /// `str()` form of the binding, `None` when it is not defined.
    fn lookup(&self, name: &str) -> Option<String>;
}

impl Bindings for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

fn literal_patterns() -> &'static [Regex; 4] {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        // Priority order: double, single, triple-double, triple-single.
        // Each form must close with `)` so `FINAL("""x""")` is never read as
        // an empty double-quoted literal.
        [
            r#"(?m)^[ \t]*FINAL\(\s*"([^"]*)"\s*\)"#,
            r#"(?m)^[ \t]*FINAL\(\s*'([^']*)'\s*\)"#,
            r#"(?ms)^[ \t]*FINAL\(\s*"""(.*)"""\s*\)"#,
            r#"(?ms)^[ \t]*FINAL\(\s*'''(.*)'''\s*\)"#,
        ]
        .map(|p| Regex::new(p).expect("valid FINAL pattern"))
    })
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^[ \t]*FINAL_VAR\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*\)")
            .expect("valid FINAL_VAR pattern")
    })
}

/// Cheap check for intent to finish. May be true even when [`parse`] finds
/// nothing usable.
pub fn is_terminal(text: &str) -> bool {
    text.contains(FINAL_MARKER) || text.contains(FINAL_VAR_MARKER)
}

/// Extract the terminal statement, literal forms first.
pub fn parse(text: &str) -> Option<Terminal> {
    if !is_terminal(text) {
        return None;
    }

    for pattern in literal_patterns() {
        if let Some(caps) = pattern.captures(text) {
            return Some(Terminal::Literal(caps[1].trim().to_string()));
        }
    }

    variable_pattern()
        .captures(text)
        .map(|caps| Terminal::Variable(caps[1].to_string()))
}

/// Parse and resolve in one step. `None` means "no answer found": either no
/// terminal statement, or a `FINAL_VAR` naming an undefined binding.
pub fn resolve(text: &str, env: &impl Bindings) -> Option<String> {
    match parse(text)? {
        Terminal::Literal(answer) => Some(answer),
        Terminal::Variable(name) => env.lookup(&name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_final_double_quotes() {
        let text = "Some text\nFINAL(\"The answer is 42\")\nMore text";
        assert_eq!(
            parse(text),
            Some(Terminal::Literal("The answer is 42".to_string()))
        );
    }

    #[test]
    fn test_final_single_quotes() {
        assert_eq!(
            resolve("FINAL('Hello world')", &env(&[])),
            Some("Hello world".to_string())
        );
    }

    #[test]
    fn test_final_trims_outer_whitespace_only() {
        assert_eq!(
            resolve("FINAL(\"   two  spaces   \")", &env(&[])),
            Some("two  spaces".to_string())
        );
    }

    #[test]
    fn test_final_triple_double_multiline() {
        let text = "FINAL(\"\"\"This is a\nmultiline\nanswer\"\"\")";
        assert_eq!(
            resolve(text, &env(&[])),
            Some("This is a\nmultiline\nanswer".to_string())
        );
    }

    #[test]
    fn test_final_triple_single_keeps_embedded_quotes() {
        let text = "Done.\nFINAL('''\n  It's \"quoted\"\n  and indented\n''')";
        assert_eq!(
            resolve(text, &env(&[])),
            Some("It's \"quoted\"\n  and indented".to_string())
        );
    }

    #[test]
    fn test_final_triple_is_greedy_to_last_close() {
        let text = "FINAL(\"\"\"a \"\"\" b\"\"\")";
        assert_eq!(resolve(text, &env(&[])), Some("a \"\"\" b".to_string()));
    }

    #[test]
    fn test_double_quotes_take_priority() {
        let text = "FINAL('single')\nFINAL(\"double\")";
        assert_eq!(resolve(text, &env(&[])), Some("double".to_string()));
    }

    #[test]
    fn test_final_var_present() {
        let text = "result = 'test'\nFINAL_VAR(result)";
        assert_eq!(
            resolve(text, &env(&[("result", "test value")])),
            Some("test value".to_string())
        );
    }

    #[test]
    fn test_final_var_missing_variable() {
        let text = "FINAL_VAR(missing)";
        assert!(is_terminal(text));
        assert_eq!(parse(text), Some(Terminal::Variable("missing".to_string())));
        assert_eq!(resolve(text, &env(&[])), None);
    }

    #[test]
    fn test_final_var_tolerates_inner_spaces() {
        assert_eq!(
            parse("  FINAL_VAR( answer_2 )"),
            Some(Terminal::Variable("answer_2".to_string()))
        );
    }

    #[test]
    fn test_is_terminal() {
        assert!(is_terminal("FINAL(\"answer\")"));
        assert!(is_terminal("FINAL_VAR(result)"));
        assert!(!is_terminal("Just text"));
        assert!(!is_terminal("final(\"lowercase\")"));
    }

    #[test]
    fn test_no_terminal() {
        assert_eq!(parse("Just some code\nx = 1"), None);
        assert_eq!(resolve("print(context[:10])", &env(&[])), None);
    }

    #[test]
    fn test_marker_mid_line_is_not_terminal_statement() {
        let text = "# not yet: FINAL(\"draft\")\nprint('FINAL(\"x\")')";
        assert!(is_terminal(text));
        assert_eq!(parse(text), None);
    }

    #[test]
    fn test_unclosed_literal_is_not_resolved() {
        let text = "FINAL(\"no closing paren";
        assert!(is_terminal(text));
        assert_eq!(parse(text), None);
    }
}
