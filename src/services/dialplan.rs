//! Local dialplan: extension patterns per context
//!
//! Patterns are either literal extensions (`100`) or, when prefixed with `_`,
//! match character classes:
//!
//! - `X` any digit, `Z` 1-9, `N` 2-9
//! - `[15-7]` any listed digit or range
//! - `.` one or more further characters, `!` zero or more

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::config::DialplanConfig;
use crate::core::host::MatchOutcome;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Element {
    Literal(char),
    Set(Vec<char>),
    OneOrMore,
    ZeroOrMore,
}

impl Element {
    fn accepts(&self, c: char) -> bool {
        match self {
            Element::Literal(l) => *l == c,
            Element::Set(set) => set.contains(&c),
            Element::OneOrMore | Element::ZeroOrMore => true,
        }
    }
}

/// How far a pattern got with some input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Progress {
    exact: bool,
    more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    source: String,
    elements: Vec<Element>,
}

fn is_dial_char(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '*' | '#' | 'A' | 'B' | 'C' | 'D')
}

impl Pattern {
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::parse(format!("Invalid extension pattern '{}': {}", source, reason));
        if source.is_empty() {
            return Err(invalid("empty"));
        }

        let Some(body) = source.strip_prefix('_') else {
            if !source.chars().all(|c| is_dial_char(c) || c == 's') {
                return Err(invalid("not a dialable extension"));
            }
            return Ok(Self {
                source: source.to_string(),
                elements: source.chars().map(Element::Literal).collect(),
            });
        };

        let mut elements = Vec::new();
        let mut chars = body.chars();
        while let Some(c) = chars.next() {
            let element = match c.to_ascii_uppercase() {
                'X' => Element::Set(('0'..='9').collect()),
                'Z' => Element::Set(('1'..='9').collect()),
                'N' => Element::Set(('2'..='9').collect()),
                '.' => Element::OneOrMore,
                '!' => Element::ZeroOrMore,
                '[' => {
                    let mut set = Vec::new();
                    let mut previous = None;
                    let mut range = false;
                    loop {
                        let Some(c) = chars.next() else {
                            return Err(invalid("unterminated '['"));
                        };
                        match c {
                            ']' => break,
                            '-' if previous.is_some() => range = true,
                            c if is_dial_char(c) => {
                                if range {
                                    let start = previous.unwrap_or(c);
                                    if start > c {
                                        return Err(invalid("descending range"));
                                    }
                                    set.extend((start..=c).filter(|c| is_dial_char(*c)));
                                    range = false;
                                } else {
                                    set.push(c);
                                }
                                previous = Some(c);
                            }
                            other => return Err(invalid(&format!("'{}' in character set", other))),
                        }
                    }
                    if set.is_empty() {
                        return Err(invalid("empty character set"));
                    }
                    Element::Set(set)
                }
                c if is_dial_char(c) => Element::Literal(c),
                other => return Err(invalid(&format!("unexpected '{}'", other))),
            };
            elements.push(element);
        }
        if elements.is_empty() {
            return Err(invalid("empty"));
        }

        Ok(Self {
            source: source.to_string(),
            elements,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, digits: &str) -> MatchOutcome {
        let input: Vec<char> = digits.chars().collect();
        let progress = Self::progress(&self.elements, &input);
        if progress.exact {
            MatchOutcome::Exact
        } else if progress.more {
            MatchOutcome::Prefix
        } else {
            MatchOutcome::NoMatch
        }
    }

    fn progress(elements: &[Element], input: &[char]) -> Progress {
        match (elements.first(), input.first()) {
            (None, None) => Progress { exact: true, more: false },
            (None, Some(_)) => Progress::default(),
            (Some(Element::ZeroOrMore), _) => Progress { exact: true, more: true },
            (Some(_), None) => Progress { exact: false, more: true },
            (Some(Element::OneOrMore), Some(_)) => Progress { exact: true, more: true },
            (Some(element), Some(&c)) => {
                if element.accepts(c) {
                    Self::progress(&elements[1..], &input[1..])
                } else {
                    Progress::default()
                }
            }
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dialplan {
    contexts: HashMap<String, Vec<Pattern>>,
}

impl Dialplan {
    pub fn from_config(config: &DialplanConfig) -> Result<Self> {
        let mut contexts = HashMap::new();
        for (name, patterns) in &config.contexts {
            let parsed = patterns
                .iter()
                .map(|p| Pattern::parse(p))
                .collect::<Result<Vec<_>>>()?;
            contexts.insert(name.clone(), parsed);
        }
        Ok(Self { contexts })
    }

    pub fn has_context(&self, context: &str) -> bool {
        self.contexts.contains_key(context)
    }

    /// Best outcome over all patterns of `context`
    pub fn lookup(&self, context: &str, digits: &str) -> MatchOutcome {
        let Some(patterns) = self.contexts.get(context) else {
            debug!("Unknown dialplan context '{}'", context);
            return MatchOutcome::NoMatch;
        };

        let mut outcome = MatchOutcome::NoMatch;
        for pattern in patterns {
            match pattern.matches(digits) {
                MatchOutcome::Exact => {
                    debug!("'{}' matches '{}' in context '{}'", digits, pattern, context);
                    return MatchOutcome::Exact;
                }
                MatchOutcome::Prefix => outcome = MatchOutcome::Prefix,
                MatchOutcome::NoMatch => {}
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pattern(source: &str) -> Pattern {
        Pattern::parse(source).unwrap()
    }

    #[test]
    fn test_literal_extension() {
        let p = pattern("100");
        assert_eq!(p.matches("100"), MatchOutcome::Exact);
        assert_eq!(p.matches("10"), MatchOutcome::Prefix);
        assert_eq!(p.matches(""), MatchOutcome::Prefix);
        assert_eq!(p.matches("1000"), MatchOutcome::NoMatch);
        assert_eq!(p.matches("2"), MatchOutcome::NoMatch);
        assert_eq!(pattern("s").matches("s"), MatchOutcome::Exact);
    }

    #[test]
    fn test_character_classes() {
        let p = pattern("_5XXX");
        assert_eq!(p.matches("5123"), MatchOutcome::Exact);
        assert_eq!(p.matches("51"), MatchOutcome::Prefix);
        assert_eq!(p.matches("4123"), MatchOutcome::NoMatch);
        assert_eq!(p.matches("5*23"), MatchOutcome::NoMatch);

        assert_eq!(pattern("_Z").matches("0"), MatchOutcome::NoMatch);
        assert_eq!(pattern("_N").matches("1"), MatchOutcome::NoMatch);
        assert_eq!(pattern("_n").matches("2"), MatchOutcome::Exact);
    }

    #[test]
    fn test_sets_and_ranges() {
        let p = pattern("_[13-5#]0");
        assert_eq!(p.matches("10"), MatchOutcome::Exact);
        assert_eq!(p.matches("40"), MatchOutcome::Exact);
        assert_eq!(p.matches("#0"), MatchOutcome::Exact);
        assert_eq!(p.matches("20"), MatchOutcome::NoMatch);
    }

    #[test]
    fn test_wildcards() {
        let p = pattern("_0N.");
        assert_eq!(p.matches("0"), MatchOutcome::Prefix);
        assert_eq!(p.matches("02"), MatchOutcome::Prefix);
        assert_eq!(p.matches("021"), MatchOutcome::Exact);
        assert_eq!(p.matches("0212345"), MatchOutcome::Exact);
        assert_eq!(p.matches("01"), MatchOutcome::NoMatch);

        let p = pattern("_9!");
        assert_eq!(p.matches("9"), MatchOutcome::Exact);
        assert_eq!(p.matches("912"), MatchOutcome::Exact);
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(Pattern::parse("").is_err());
        assert!(Pattern::parse("_").is_err());
        assert!(Pattern::parse("_[12").is_err());
        assert!(Pattern::parse("_[]").is_err());
        assert!(Pattern::parse("_5Q").is_err());
        assert!(Pattern::parse("10a").is_err());
    }

    #[test]
    fn test_lookup_prefers_exact() {
        let mut contexts = BTreeMap::new();
        contexts.insert("office".to_string(), vec!["_1XX".to_string(), "10".to_string()]);
        let dialplan = Dialplan::from_config(&DialplanConfig { contexts }).unwrap();

        assert!(dialplan.has_context("office"));
        assert!(!dialplan.has_context("lobby"));
        assert_eq!(dialplan.lookup("office", "10"), MatchOutcome::Exact);
        assert_eq!(dialplan.lookup("office", "1"), MatchOutcome::Prefix);
        assert_eq!(dialplan.lookup("office", "2"), MatchOutcome::NoMatch);
        assert_eq!(dialplan.lookup("lobby", "10"), MatchOutcome::NoMatch);
    }
}
