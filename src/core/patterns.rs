//! Compiled detection pattern sets.
//!
//! Pattern lists are configuration data: they are loaded as strings, compiled
//! once at startup and evaluated in order, stopping at the first match.

use regex::Regex;
use thiserror::Error;

/// User agents of scanners and scripted HTTP clients.
pub const DEFAULT_SUSPICIOUS_AGENTS: &[&str] = &[
    r"(?i)(sqlmap|nikto|nmap|masscan|zgrab|nuclei|dirbuster|gobuster)",
    r"(?i)(curl|wget|python-requests|python-urllib|go-http-client|libwww-perl|httpclient)",
];

/// User agents that identify automated clients.
pub const DEFAULT_BOT_SIGNATURES: &[&str] = &[
    r"(?i)(bot|crawler|spider|scraper)",
    r"(?i)(curl|wget|python-requests|python-urllib|go-http-client|java/|okhttp|scrapy)",
    r"(?i)(headlesschrome|phantomjs|selenium|puppeteer|playwright)",
];

/// Crawlers allowed through despite matching a bot signature.
pub const DEFAULT_ALLOWED_CRAWLERS: &[&str] = &[
    r"(?i)(googlebot|bingbot|duckduckbot|slurp|baiduspider|yandexbot|applebot)",
];

pub const DEFAULT_SQL_PATTERNS: &[&str] = &[
    // boolean injection: ' OR '1'='1, " and 1=1
    r#"(?i)['"]\s*(or|and)\s+['"]?\w+['"]?\s*=\s*['"]?\w+"#,
    r"(?i)\b(or|and)\s+\d+\s*=\s*\d+",
    // statement keywords in injectable positions
    r"(?i)\bunion\b[\s(]+(all\s+)?select\b",
    r"(?i)\b(drop|truncate|alter)\s+(table|database|schema)\b",
    r"(?i)\binsert\s+into\s+\w+\s*(\(|values\b|select\b)",
    r"(?i)\bdelete\s+from\s+\w+\s*(where\b|;)",
    r"(?i)\bupdate\s+\w+\s+set\s+\w+\s*=",
    r"(?i);\s*(select|insert|update|delete|drop|exec|shutdown)\b",
    r"(?i)\bexec(ute)?\s*(\(|\s+xp_)",
    // comment markers closing a quoted value
    r#"['"]\s*(--|#|/\*)"#,
    r"/\*.*?\*/",
    // time-based blind injection
    r"(?i)\b(sleep|benchmark|pg_sleep)\s*\(",
    r"(?i)\bwaitfor\s+delay\b",
];

pub const DEFAULT_XSS_PATTERNS: &[&str] = &[
    r"(?is)<script\b[^>]*>.*?</script\s*>",
    r"(?i)</?script\b[^>]*>",
    r"(?i)javascript\s*:",
    // event handler attributes, stripped with their whole tag
    r"(?i)<[a-z][^>]*\son[a-z]+\s*=[^>]*>?",
    r"(?i)</?(iframe|object|embed)\b[^>]*>",
];

#[derive(Error, Debug)]
pub enum PatternError {
    #[error("Invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// An ordered list of compiled patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Regex>,
}

impl PatternSet {
    pub fn compile<S: AsRef<str>>(sources: &[S]) -> Result<Self, PatternError> {
        let patterns = sources
            .iter()
            .map(|source| {
                Regex::new(source.as_ref()).map_err(|e| PatternError::InvalidPattern {
                    pattern: source.as_ref().to_string(),
                    source: e,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// First pattern matching `input`, if any.
    pub fn first_match(&self, input: &str) -> Option<&Regex> {
        self.patterns.iter().find(|p| p.is_match(input))
    }

    pub fn is_match(&self, input: &str) -> bool {
        self.first_match(input).is_some()
    }

    /// Remove every match of every pattern. Returns `None` when nothing matched.
    pub fn strip(&self, input: &str) -> Option<String> {
        let mut output: Option<String> = None;
        for pattern in &self.patterns {
            let current = output.as_deref().unwrap_or(input);
            if pattern.is_match(current) {
                output = Some(pattern.replace_all(current, "").into_owned());
            }
        }
        output
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql() -> PatternSet {
        PatternSet::compile(DEFAULT_SQL_PATTERNS).unwrap()
    }

    #[test]
    fn test_defaults_compile() {
        assert!(PatternSet::compile(DEFAULT_SUSPICIOUS_AGENTS).is_ok());
        assert!(PatternSet::compile(DEFAULT_BOT_SIGNATURES).is_ok());
        assert!(PatternSet::compile(DEFAULT_ALLOWED_CRAWLERS).is_ok());
        assert!(PatternSet::compile(DEFAULT_XSS_PATTERNS).is_ok());
        assert_eq!(sql().len(), DEFAULT_SQL_PATTERNS.len());
    }

    #[test]
    fn test_sql_indicators() {
        let set = sql();
        assert!(set.is_match("' OR '1'='1"));
        assert!(set.is_match("admin'--"));
        assert!(set.is_match("1 UNION SELECT password FROM users"));
        assert!(set.is_match("x; DROP TABLE users"));
        assert!(set.is_match("1 or 1=1"));
        assert!(set.is_match("1' AND SLEEP(5)"));
        assert!(set.is_match("DELETE FROM users WHERE 1"));
        assert!(set.is_match("insert into accounts values (1, 'x')"));
        assert!(set.is_match("UPDATE users SET role='admin'"));
    }

    #[test]
    fn test_plain_text_not_flagged() {
        let set = sql();
        assert!(!set.is_match("I love SQL databases"));
        assert!(!set.is_match("Please select a date for the meeting"));
        assert!(!set.is_match("rock and roll"));
        assert!(!set.is_match("please delete from my list"));
        assert!(!set.is_match("insert into the form below"));
        assert!(!set.is_match("update your profile settings"));
    }

    #[test]
    fn test_invalid_pattern_reported() {
        let err = PatternSet::compile(&["(unclosed"]).unwrap_err();
        assert!(err.to_string().contains("(unclosed"));
    }

    #[test]
    fn test_strip_removes_script_markup() {
        let set = PatternSet::compile(DEFAULT_XSS_PATTERNS).unwrap();
        assert_eq!(
            set.strip("hi<script>alert(1)</script> there").as_deref(),
            Some("hi there")
        );
        assert_eq!(
            set.strip(r#"<img src=x onerror=alert(1)>"#).as_deref(),
            Some("")
        );
        assert_eq!(
            set.strip(r#"see <a href="/x" onclick="go()">here</a>"#).as_deref(),
            Some("see here</a>")
        );
        assert!(set.strip("plain text").is_none());
    }

    #[test]
    fn test_equals_sign_in_prose_not_stripped() {
        let set = PatternSet::compile(DEFAULT_XSS_PATTERNS).unwrap();
        assert!(set.strip("only = 5").is_none());
        assert!(set.strip("upon=arrival, mention=yes").is_none());
        assert!(!set.is_match("2 < 3 and option=1"));
    }
}
