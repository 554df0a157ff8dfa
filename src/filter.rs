//! Line filter expressions.
//!
//! A filter is written as a LogQL log selector: a stream selector followed by
//! zero or more pipeline stages, for example `{job="api"} |= "ERROR" != "timeout"`.
//! The stream selector is validated but, as in a LogQL pipeline, does not take
//! part in matching a line. Stages are applied in order and all must pass.

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;
use thiserror::Error;

/// Labels attached to a line while it is evaluated.
pub type Labels = BTreeMap<String, String>;

/// A compiled line-matching predicate shared by every watcher task.
pub trait Predicate: Send + Sync {
    /// Returns whether `line` passes the filter.
    fn evaluate(&self, line: &str, labels: &Labels) -> Result<bool, EvalError>;
}

/// Errors produced while compiling a filter expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("empty filter expression")]
    Empty,

    #[error("unexpected {found} at position {pos}, expected {expected}")]
    Unexpected {
        pos: usize,
        found: String,
        expected: &'static str,
    },

    #[error("unterminated string starting at position {pos}")]
    UnterminatedString { pos: usize },

    #[error("invalid escape sequence at position {pos}")]
    InvalidEscape { pos: usize },

    #[error("invalid regex {pattern:?} at position {pos}: {message}")]
    InvalidRegex {
        pos: usize,
        pattern: String,
        message: String,
    },
}

/// A predicate failed to evaluate a single line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("evaluation failed: {message}")]
pub struct EvalError {
    message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Compiles a filter expression into a reusable predicate.
pub fn compile(expr: &str) -> Result<LogQlPredicate, FilterError> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err(FilterError::Empty);
    }

    let mut parser = Parser {
        tokens,
        index: 0,
        end: expr.len(),
    };
    let selector = parser.selector()?;
    let stages = parser.stages()?;

    Ok(LogQlPredicate {
        source: expr.to_string(),
        selector,
        stages,
    })
}

/// A filter compiled from a LogQL log selector.
pub struct LogQlPredicate {
    source: String,
    selector: Vec<LabelMatcher>,
    stages: Vec<Stage>,
}

impl LogQlPredicate {
    /// The expression this predicate was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Number of pipeline stages after the stream selector.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Number of label matchers in the stream selector.
    pub fn selector_len(&self) -> usize {
        self.selector.len()
    }

    fn matches(&self, line: &str, labels: &Labels) -> bool {
        self.stages.iter().all(|stage| match stage {
            Stage::Line(filter) => filter.matches(line),
            Stage::Label(matcher) => matcher.matches(labels),
        })
    }
}

impl Predicate for LogQlPredicate {
    fn evaluate(&self, line: &str, labels: &Labels) -> Result<bool, EvalError> {
        Ok(self.matches(line, labels))
    }
}

impl fmt::Debug for LogQlPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogQlPredicate")
            .field("source", &self.source)
            .field("selector", &self.selector.len())
            .field("stages", &self.stages.len())
            .finish()
    }
}

enum Stage {
    Line(LineFilter),
    Label(LabelMatcher),
}

enum LineFilter {
    Contains(Vec<String>),
    NotContains(Vec<String>),
    Matches(Vec<Regex>),
    NotMatches(Vec<Regex>),
}

impl LineFilter {
    fn matches(&self, line: &str) -> bool {
        match self {
            LineFilter::Contains(needles) => needles.iter().any(|n| line.contains(n.as_str())),
            LineFilter::NotContains(needles) => !needles.iter().any(|n| line.contains(n.as_str())),
            LineFilter::Matches(patterns) => patterns.iter().any(|re| re.is_match(line)),
            LineFilter::NotMatches(patterns) => !patterns.iter().any(|re| re.is_match(line)),
        }
    }
}

struct LabelMatcher {
    name: String,
    kind: MatchKind,
}

enum MatchKind {
    Equal(String),
    NotEqual(String),
    Regex(Regex),
    NotRegex(Regex),
}

impl LabelMatcher {
    fn matches(&self, labels: &Labels) -> bool {
        // Missing labels read as empty, the same as in Prometheus matchers
        let value = labels.get(&self.name).map(String::as_str).unwrap_or("");
        match &self.kind {
            MatchKind::Equal(expected) => value == expected,
            MatchKind::NotEqual(expected) => value != expected,
            MatchKind::Regex(re) => re.is_match(value),
            MatchKind::NotRegex(re) => !re.is_match(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LBrace,
    RBrace,
    Comma,
    Pipe,
    PipeEq,
    PipeTilde,
    Eq,
    BangEq,
    EqTilde,
    BangTilde,
    Ident(String),
    Str(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LBrace => write!(f, "'{{'"),
            Token::RBrace => write!(f, "'}}'"),
            Token::Comma => write!(f, "','"),
            Token::Pipe => write!(f, "'|'"),
            Token::PipeEq => write!(f, "'|='"),
            Token::PipeTilde => write!(f, "'|~'"),
            Token::Eq => write!(f, "'='"),
            Token::BangEq => write!(f, "'!='"),
            Token::EqTilde => write!(f, "'=~'"),
            Token::BangTilde => write!(f, "'!~'"),
            Token::Ident(name) => write!(f, "identifier `{name}`"),
            Token::Str(value) => write!(f, "string {value:?}"),
        }
    }
}

type Chars<'a> = Peekable<CharIndices<'a>>;

/// Decodes the rest of a double-quoted string whose opening quote is at `open`.
///
/// Escapes follow Go string literals: `\a \b \f \n \r \t \v \\ \"`,
/// `\xHH` and three-digit octal for single bytes, and `\uHHHH` and
/// `\UHHHHHHHH` for code points. Any other escape is rejected.
fn quoted(chars: &mut Chars<'_>, open: usize) -> Result<String, FilterError> {
    let unterminated = FilterError::UnterminatedString { pos: open };
    let mut bytes = Vec::new();

    loop {
        let (pos, c) = chars.next().ok_or_else(|| unterminated.clone())?;
        match c {
            '"' => break,
            '\\' => {
                let (_, escape) = chars.next().ok_or_else(|| unterminated.clone())?;
                let invalid = FilterError::InvalidEscape { pos };
                match escape {
                    'a' => bytes.push(0x07),
                    'b' => bytes.push(0x08),
                    'f' => bytes.push(0x0c),
                    'n' => bytes.push(b'\n'),
                    'r' => bytes.push(b'\r'),
                    't' => bytes.push(b'\t'),
                    'v' => bytes.push(0x0b),
                    '\\' => bytes.push(b'\\'),
                    '"' => bytes.push(b'"'),
                    'x' => {
                        let byte = escape_digits(chars, 2, 16).ok_or(invalid)?;
                        bytes.push(byte as u8);
                    }
                    '0'..='7' => {
                        let high = escape.to_digit(8).unwrap_or(0);
                        let value = escape_digits(chars, 2, 8)
                            .map(|low| high * 64 + low)
                            .and_then(|value| u8::try_from(value).ok())
                            .ok_or(invalid)?;
                        bytes.push(value);
                    }
                    'u' | 'U' => {
                        let width = if escape == 'u' { 4 } else { 8 };
                        let decoded = escape_digits(chars, width, 16)
                            .and_then(char::from_u32)
                            .ok_or(invalid)?;
                        push_char(&mut bytes, decoded);
                    }
                    _ => return Err(invalid),
                }
            }
            other => push_char(&mut bytes, other),
        }
    }

    // Byte escapes can spell out sequences that are not UTF-8
    String::from_utf8(bytes).map_err(|_| FilterError::InvalidEscape { pos: open })
}

/// Consumes exactly `count` digits in `radix`, or none if one is missing.
fn escape_digits(chars: &mut Chars<'_>, count: usize, radix: u32) -> Option<u32> {
    let mut value = 0;
    for _ in 0..count {
        let (_, digit) = chars.next_if(|(_, c)| c.is_digit(radix))?;
        value = value * radix + digit.to_digit(radix)?;
    }
    Some(value)
}

fn push_char(bytes: &mut Vec<u8>, c: char) {
    let mut encoded = [0; 4];
    bytes.extend_from_slice(c.encode_utf8(&mut encoded).as_bytes());
}

fn tokenize(expr: &str) -> Result<Vec<(usize, Token)>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            '|' => match chars.peek() {
                Some((_, '=')) => {
                    chars.next();
                    Token::PipeEq
                }
                Some((_, '~')) => {
                    chars.next();
                    Token::PipeTilde
                }
                _ => Token::Pipe,
            },
            '!' => match chars.peek() {
                Some((_, '=')) => {
                    chars.next();
                    Token::BangEq
                }
                Some((_, '~')) => {
                    chars.next();
                    Token::BangTilde
                }
                _ => {
                    return Err(FilterError::Unexpected {
                        pos,
                        found: "'!'".to_string(),
                        expected: "'!=' or '!~'",
                    });
                }
            },
            '=' => match chars.peek() {
                Some((_, '~')) => {
                    chars.next();
                    Token::EqTilde
                }
                _ => Token::Eq,
            },
            '"' => Token::Str(quoted(&mut chars, pos)?),
            '`' => {
                let mut value = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '`' {
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(FilterError::UnterminatedString { pos });
                }
                Token::Str(value)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                Token::Ident(name)
            }
            other => {
                return Err(FilterError::Unexpected {
                    pos,
                    found: format!("{other:?}"),
                    expected: "a selector, filter or string",
                });
            }
        };
        tokens.push((pos, token));
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    index: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index).map(|(_, token)| token)
    }

    fn next(&mut self, expected: &'static str) -> Result<(usize, Token), FilterError> {
        match self.tokens.get(self.index) {
            Some(entry) => {
                self.index += 1;
                Ok(entry.clone())
            }
            None => Err(FilterError::Unexpected {
                pos: self.end,
                found: "end of expression".to_string(),
                expected,
            }),
        }
    }

    fn expect(&mut self, want: Token, expected: &'static str) -> Result<(), FilterError> {
        let (pos, token) = self.next(expected)?;
        if token == want {
            Ok(())
        } else {
            Err(unexpected(pos, &token, expected))
        }
    }

    fn string(&mut self, expected: &'static str) -> Result<(usize, String), FilterError> {
        match self.next(expected)? {
            (pos, Token::Str(value)) => Ok((pos, value)),
            (pos, token) => Err(unexpected(pos, &token, expected)),
        }
    }

    fn selector(&mut self) -> Result<Vec<LabelMatcher>, FilterError> {
        self.expect(Token::LBrace, "'{' to open the stream selector")?;

        let mut matchers = Vec::new();
        if self.peek() == Some(&Token::RBrace) {
            self.index += 1;
            return Ok(matchers);
        }

        loop {
            matchers.push(self.label_matcher()?);
            match self.next("',' or '}'")? {
                (_, Token::Comma) => continue,
                (_, Token::RBrace) => break,
                (pos, token) => return Err(unexpected(pos, &token, "',' or '}'")),
            }
        }

        Ok(matchers)
    }

    fn label_matcher(&mut self) -> Result<LabelMatcher, FilterError> {
        let name = match self.next("a label name")? {
            (_, Token::Ident(name)) => name,
            (pos, token) => return Err(unexpected(pos, &token, "a label name")),
        };

        let (op_pos, op) = self.next("a label match operator")?;
        let (value_pos, value) = self.string("a quoted label value")?;

        let kind = match op {
            Token::Eq => MatchKind::Equal(value),
            Token::BangEq => MatchKind::NotEqual(value),
            Token::EqTilde => MatchKind::Regex(anchored_regex(value_pos, &value)?),
            Token::BangTilde => MatchKind::NotRegex(anchored_regex(value_pos, &value)?),
            other => return Err(unexpected(op_pos, &other, "'=', '!=', '=~' or '!~'")),
        };

        Ok(LabelMatcher { name, kind })
    }

    fn stages(&mut self) -> Result<Vec<Stage>, FilterError> {
        let mut stages = Vec::new();

        while let Some((pos, token)) = self.tokens.get(self.index).cloned() {
            self.index += 1;
            let stage = match token {
                Token::PipeEq => Stage::Line(LineFilter::Contains(self.alternatives()?)),
                Token::BangEq => Stage::Line(LineFilter::NotContains(self.alternatives()?)),
                Token::PipeTilde => Stage::Line(LineFilter::Matches(self.regex_alternatives()?)),
                Token::BangTilde => {
                    Stage::Line(LineFilter::NotMatches(self.regex_alternatives()?))
                }
                Token::Pipe => Stage::Label(self.label_matcher()?),
                other => return Err(unexpected(pos, &other, "a line or label filter")),
            };
            stages.push(stage);
        }

        Ok(stages)
    }

    /// Reads `"a" or "b" or ...` after a line filter operator.
    fn alternatives(&mut self) -> Result<Vec<String>, FilterError> {
        Ok(self
            .positioned_alternatives()?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    fn regex_alternatives(&mut self) -> Result<Vec<Regex>, FilterError> {
        self.positioned_alternatives()?
            .into_iter()
            .map(|(pos, pattern)| {
                Regex::new(&pattern).map_err(|e| FilterError::InvalidRegex {
                    pos,
                    pattern,
                    message: e.to_string(),
                })
            })
            .collect()
    }

    fn positioned_alternatives(&mut self) -> Result<Vec<(usize, String)>, FilterError> {
        let mut values = vec![self.string("a quoted filter value")?];
        while matches!(self.peek(), Some(Token::Ident(word)) if word == "or") {
            self.index += 1;
            values.push(self.string("a quoted filter value after `or`")?);
        }
        Ok(values)
    }
}

fn unexpected(pos: usize, token: &Token, expected: &'static str) -> FilterError {
    FilterError::Unexpected {
        pos,
        found: token.to_string(),
        expected,
    }
}

fn anchored_regex(pos: usize, pattern: &str) -> Result<Regex, FilterError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| FilterError::InvalidRegex {
        pos,
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str, line: &str) -> bool {
        compile(expr)
            .unwrap()
            .evaluate(line, &Labels::new())
            .unwrap()
    }

    #[test]
    fn test_contains_filter() {
        assert!(eval(r#"{} |= "ERROR""#, "ERROR disk full"));
        assert!(!eval(r#"{} |= "ERROR""#, "INFO start"));
    }

    #[test]
    fn test_not_contains_filter() {
        assert!(eval(r#"{} != "DEBUG""#, "INFO start"));
        assert!(!eval(r#"{} != "DEBUG""#, "DEBUG cache hit"));
    }

    #[test]
    fn test_regex_filters() {
        assert!(eval(r#"{} |~ "user_id=\\d+""#, "session for user_id=123"));
        assert!(!eval(r#"{} |~ "user_id=\\d+""#, "session for user_id=abc"));
        assert!(eval(r#"{} !~ "^DEBUG""#, "INFO DEBUG later"));
        assert!(!eval(r#"{} !~ "^DEBUG""#, "DEBUG first"));
    }

    #[test]
    fn test_line_regex_is_unanchored() {
        assert!(eval(r#"{} |~ "disk""#, "ERROR disk full"));
    }

    #[test]
    fn test_stages_are_anded() {
        let expr = r#"{app="api"} |= "ERROR" != "timeout""#;
        assert!(eval(expr, "ERROR disk full"));
        assert!(!eval(expr, "ERROR request timeout"));
        assert!(!eval(expr, "INFO disk full"));
    }

    #[test]
    fn test_or_alternatives() {
        let expr = r#"{} |= "ERROR" or "FATAL""#;
        assert!(eval(expr, "FATAL out of memory"));
        assert!(eval(expr, "ERROR disk full"));
        assert!(!eval(expr, "WARN slow"));

        let negated = r#"{} != "DEBUG" or "TRACE""#;
        assert!(eval(negated, "INFO ready"));
        assert!(!eval(negated, "TRACE enter"));
        assert!(!eval(negated, "DEBUG value"));
    }

    #[test]
    fn test_empty_pipeline_matches_everything() {
        assert!(eval("{}", "anything"));
        assert!(eval(r#"{job="varlogs"}"#, ""));
    }

    #[test]
    fn test_selector_does_not_filter_lines() {
        let predicate = compile(r#"{job="api", env=~"prod|staging"} |= "x""#).unwrap();
        assert_eq!(predicate.selector_len(), 2);
        assert_eq!(predicate.stage_count(), 1);
        assert!(predicate.evaluate("x", &Labels::new()).unwrap());
    }

    #[test]
    fn test_label_filter_uses_label_context() {
        let predicate = compile(r#"{} | level="error" |= "disk""#).unwrap();

        let mut labels = Labels::new();
        assert!(!predicate.evaluate("disk full", &labels).unwrap());

        labels.insert("level".to_string(), "error".to_string());
        assert!(predicate.evaluate("disk full", &labels).unwrap());
        assert!(!predicate.evaluate("cpu hot", &labels).unwrap());
    }

    #[test]
    fn test_label_regex_is_anchored() {
        let predicate = compile(r#"{} | level=~"err""#).unwrap();
        let mut labels = Labels::new();
        labels.insert("level".to_string(), "error".to_string());
        assert!(!predicate.evaluate("line", &labels).unwrap());

        let predicate = compile(r#"{} | level!~"err.*""#).unwrap();
        assert!(!predicate.evaluate("line", &labels).unwrap());
        assert!(predicate.evaluate("line", &Labels::new()).unwrap());
    }

    #[test]
    fn test_raw_and_escaped_strings() {
        assert!(eval(r#"{} |= `say "hi"`"#, r#"they say "hi" twice"#));
        assert!(eval(r#"{} |= "say \"hi\"""#, r#"they say "hi" twice"#));
        assert!(eval(r#"{} |~ `\d{3}`"#, "code 503"));
    }

    #[test]
    fn test_go_style_escapes() {
        let string = |expr: &str| match tokenize(expr).unwrap().remove(0).1 {
            Token::Str(value) => value,
            other => panic!("Expected a string, got {other:?}"),
        };

        assert_eq!(string(r#""\a\b\f\n\r\t\v""#), "\u{7}\u{8}\u{c}\n\r\t\u{b}");
        assert_eq!(string(r#""\\ and \"""#), "\\ and \"");
        assert_eq!(string(r#""\x41\101""#), "AA");
        assert_eq!(string(r#""\u00e9 \U0001F980""#), "\u{e9} \u{1F980}");
        assert_eq!(string(r#""\xc3\xa9""#), "\u{e9}");
    }

    #[test]
    fn test_escaped_regex_class_must_be_doubled() {
        assert_eq!(
            compile(r#"{} |~ "\d+""#).unwrap_err(),
            FilterError::InvalidEscape { pos: 7 }
        );
        assert!(eval(r#"{} |~ "\\d+""#, "code 503"));
        assert!(!eval(r#"{} |~ "\\d+""#, "no digits, just d"));
    }

    #[test]
    fn test_invalid_escapes() {
        for expr in [
            r#"{} |= "\q""#,
            r#"{} |= "\'""#,
            r#"{} |= "\xZZ""#,
            r#"{} |= "\x4""#,
            r#"{} |= "\400""#,
            r#"{} |= "\12""#,
            r#"{} |= "\uD800""#,
            r#"{} |= "\U00110000""#,
        ] {
            assert_eq!(
                compile(expr).unwrap_err(),
                FilterError::InvalidEscape { pos: 7 },
                "{expr}"
            );
        }

        // Decodes to a lone continuation byte
        assert_eq!(
            compile(r#"{} |= "\x80""#).unwrap_err(),
            FilterError::InvalidEscape { pos: 6 }
        );
        assert_eq!(
            compile(r#"{} |= "abc\"#).unwrap_err(),
            FilterError::UnterminatedString { pos: 6 }
        );
    }

    #[test]
    fn test_source_is_preserved() {
        let expr = r#"{} |= "ERROR""#;
        let predicate = compile(expr).unwrap();
        assert_eq!(predicate.source(), expr);
        assert!(format!("{predicate:?}").contains("LogQlPredicate"));
    }

    #[test]
    fn test_empty_expression() {
        assert_eq!(compile("").unwrap_err(), FilterError::Empty);
        assert_eq!(compile("   \n").unwrap_err(), FilterError::Empty);
    }

    #[test]
    fn test_missing_selector() {
        match compile(r#"|= "ERROR""#) {
            Err(FilterError::Unexpected { pos, .. }) => assert_eq!(pos, 0),
            other => panic!("Expected Unexpected error, got {other:?}"),
        }
    }

    #[test]
    fn test_unclosed_selector() {
        match compile(r#"{job="api""#) {
            Err(FilterError::Unexpected { found, .. }) => assert_eq!(found, "end of expression"),
            other => panic!("Expected Unexpected error, got {other:?}"),
        }
    }

    #[test]
    fn test_unterminated_string() {
        assert_eq!(
            compile(r#"{} |= "ERROR"#).unwrap_err(),
            FilterError::UnterminatedString { pos: 6 }
        );
        assert_eq!(
            compile("{} |= `ERROR").unwrap_err(),
            FilterError::UnterminatedString { pos: 6 }
        );
    }

    #[test]
    fn test_invalid_regex() {
        match compile(r#"{} |~ "(unclosed""#) {
            Err(FilterError::InvalidRegex { pos, pattern, .. }) => {
                assert_eq!(pos, 6);
                assert_eq!(pattern, "(unclosed");
            }
            other => panic!("Expected InvalidRegex error, got {other:?}"),
        }

        assert!(matches!(
            compile(r#"{job=~"[a-"}"#),
            Err(FilterError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_filter_without_value() {
        assert!(matches!(
            compile("{} |="),
            Err(FilterError::Unexpected { .. })
        ));
        assert!(matches!(
            compile(r#"{} |= "a" or"#),
            Err(FilterError::Unexpected { .. })
        ));
    }

    #[test]
    fn test_unknown_characters() {
        assert!(matches!(
            compile(r#"{} |= "a" ; "b""#),
            Err(FilterError::Unexpected { pos: 10, .. })
        ));
        assert!(matches!(
            compile(r#"{} ! "a""#),
            Err(FilterError::Unexpected { pos: 3, .. })
        ));
    }

    #[test]
    fn test_error_messages() {
        let error = compile(r#"{} |= "ERROR"#).unwrap_err();
        assert_eq!(
            error.to_string(),
            "unterminated string starting at position 6"
        );
        assert_eq!(
            EvalError::new("boom").to_string(),
            "evaluation failed: boom"
        );
    }

    #[test]
    fn test_predicate_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LogQlPredicate>();
    }
}
