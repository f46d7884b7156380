// File: src/lexer.rs
//
// Scanner for the Canidae programming language.
// Turns a source string into a flat token stream with line numbers,
// which the single-pass compiler consumes directly.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Token kinds produced by the scanner.
///
/// Each kind is a bare discriminant; the matched source text lives in
/// [`Token::lexeme`] so diagnostics can quote it verbatim. `Error` tokens
/// carry their message as the lexeme and are reported by the compiler when
/// it reaches them, which keeps scanning total (the scanner never fails).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Single-character punctuation
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Semicolon,
    Colon,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Equal,
    EqualEqual,
    BangEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    PlusEqual,
    MinusEqual,
    StarEqual,
    SlashEqual,
    PercentEqual,
    CaretEqual,

    // Literals
    Identifier,
    String,
    Number,

    // Keywords
    And,
    As,
    Break,
    Catch,
    Class,
    Continue,
    Do,
    Else,
    End,
    False,
    For,
    Fun,
    If,
    Import,
    Not,
    Null,
    Or,
    Print,
    Raise,
    Return,
    Super,
    This,
    True,
    Try,
    Var,
    While,

    Error,
    Eof,
}

/// A single scanned token.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    /// 1-based source line. For strings this is the line the literal opened on.
    pub line: usize,
}

static KEYWORDS: Lazy<HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    HashMap::from([
        ("and", TokenKind::And),
        ("as", TokenKind::As),
        ("break", TokenKind::Break),
        ("catch", TokenKind::Catch),
        ("class", TokenKind::Class),
        ("continue", TokenKind::Continue),
        ("do", TokenKind::Do),
        ("else", TokenKind::Else),
        ("end", TokenKind::End),
        ("false", TokenKind::False),
        ("for", TokenKind::For),
        ("fun", TokenKind::Fun),
        ("if", TokenKind::If),
        ("import", TokenKind::Import),
        ("not", TokenKind::Not),
        ("null", TokenKind::Null),
        ("or", TokenKind::Or),
        ("print", TokenKind::Print),
        ("raise", TokenKind::Raise),
        ("return", TokenKind::Return),
        ("super", TokenKind::Super),
        ("this", TokenKind::This),
        ("true", TokenKind::True),
        ("try", TokenKind::Try),
        ("var", TokenKind::Var),
        ("while", TokenKind::While),
    ])
});

/// Scan `source` into tokens. Always ends with a single `Eof` token.
pub fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '\n' => {
                chars.next();
                line += 1;
            }
            '"' => {
                chars.next(); // opening quote
                let opened_at = line;
                let mut s = String::new();
                let mut terminated = false;
                // String contents are raw: no escapes, newlines are literal.
                for ch in chars.by_ref() {
                    if ch == '"' {
                        terminated = true;
                        break;
                    }
                    if ch == '\n' {
                        line += 1;
                    }
                    s.push(ch);
                }
                if terminated {
                    tokens.push(Token { kind: TokenKind::String, lexeme: s, line: opened_at });
                } else {
                    tokens.push(Token {
                        kind: TokenKind::Error,
                        lexeme: "Unterminated string.".to_string(),
                        line: opened_at,
                    });
                }
            }
            '0'..='9' => {
                let mut num = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() {
                        num.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.peek() == Some(&'.') {
                    // Only consume the dot when a digit follows, so method
                    // chains on call results still lex as Dot tokens.
                    let mut lookahead = chars.clone();
                    lookahead.next();
                    if matches!(lookahead.peek(), Some(d) if d.is_ascii_digit()) {
                        num.push('.');
                        chars.next();
                        while let Some(&ch) = chars.peek() {
                            if ch.is_ascii_digit() {
                                num.push(ch);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                    }
                }
                tokens.push(Token { kind: TokenKind::Number, lexeme: num, line });
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let kind = KEYWORDS.get(ident.as_str()).copied().unwrap_or(TokenKind::Identifier);
                tokens.push(Token { kind, lexeme: ident, line });
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    // Line comment
                    for ch in chars.by_ref() {
                        if ch == '\n' {
                            line += 1;
                            break;
                        }
                    }
                } else if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token {
                        kind: TokenKind::SlashEqual,
                        lexeme: "/=".to_string(),
                        line,
                    });
                } else {
                    tokens.push(Token { kind: TokenKind::Slash, lexeme: "/".to_string(), line });
                }
            }
            '+' | '-' | '*' | '%' | '^' | '=' | '!' | '<' | '>' => {
                chars.next();
                let followed_by_equal = chars.peek() == Some(&'=');
                let (kind, lexeme) = match (c, followed_by_equal) {
                    ('+', true) => (TokenKind::PlusEqual, "+="),
                    ('+', false) => (TokenKind::Plus, "+"),
                    ('-', true) => (TokenKind::MinusEqual, "-="),
                    ('-', false) => (TokenKind::Minus, "-"),
                    ('*', true) => (TokenKind::StarEqual, "*="),
                    ('*', false) => (TokenKind::Star, "*"),
                    ('%', true) => (TokenKind::PercentEqual, "%="),
                    ('%', false) => (TokenKind::Percent, "%"),
                    ('^', true) => (TokenKind::CaretEqual, "^="),
                    ('^', false) => (TokenKind::Caret, "^"),
                    ('=', true) => (TokenKind::EqualEqual, "=="),
                    ('=', false) => (TokenKind::Equal, "="),
                    ('!', true) => (TokenKind::BangEqual, "!="),
                    ('!', false) => (TokenKind::Error, "Unexpected character."),
                    ('<', true) => (TokenKind::LessEqual, "<="),
                    ('<', false) => (TokenKind::Less, "<"),
                    ('>', true) => (TokenKind::GreaterEqual, ">="),
                    ('>', false) => (TokenKind::Greater, ">"),
                    _ => unreachable!(),
                };
                if followed_by_equal && kind != TokenKind::Error {
                    chars.next();
                }
                tokens.push(Token { kind, lexeme: lexeme.to_string(), line });
            }
            '(' | ')' | '{' | '}' | '[' | ']' | ',' | ';' | '.' | ':' => {
                chars.next();
                let kind = match c {
                    '(' => TokenKind::LeftParen,
                    ')' => TokenKind::RightParen,
                    '{' => TokenKind::LeftBrace,
                    '}' => TokenKind::RightBrace,
                    '[' => TokenKind::LeftBracket,
                    ']' => TokenKind::RightBracket,
                    ',' => TokenKind::Comma,
                    ';' => TokenKind::Semicolon,
                    '.' => TokenKind::Dot,
                    ':' => TokenKind::Colon,
                    _ => unreachable!(),
                };
                tokens.push(Token { kind, lexeme: c.to_string(), line });
            }
            _ => {
                chars.next();
                tokens.push(Token {
                    kind: TokenKind::Error,
                    lexeme: "Unexpected character.".to_string(),
                    line,
                });
            }
        }
    }

    tokens.push(Token { kind: TokenKind::Eof, lexeme: String::new(), line });
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_punctuation_and_operators() {
        assert_eq!(
            kinds("a += b ^ 2;"),
            vec![
                TokenKind::Identifier,
                TokenKind::PlusEqual,
                TokenKind::Identifier,
                TokenKind::Caret,
                TokenKind::Number,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_keywords_and_identifiers() {
        let tokens = tokenize("while whilex do end");
        assert_eq!(tokens[0].kind, TokenKind::While);
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert_eq!(tokens[1].lexeme, "whilex");
        assert_eq!(tokens[2].kind, TokenKind::Do);
        assert_eq!(tokens[3].kind, TokenKind::End);
    }

    #[test]
    fn tracks_lines_across_comments() {
        let tokens = tokenize("var a;\n// comment\nvar b;");
        let b = tokens.iter().find(|t| t.lexeme == "b").unwrap();
        assert_eq!(b.line, 3);
    }

    #[test]
    fn strings_are_raw_and_multiline() {
        let tokens = tokenize("\"Hello,\nWorld\" x");
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].lexeme, "Hello,\nWorld");
        assert_eq!(tokens[0].line, 1);
        // The trailing identifier sits on line 2.
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn unterminated_string_reports_opening_line() {
        let tokens = tokenize("var x;\n\"oops");
        let err = tokens.iter().find(|t| t.kind == TokenKind::Error).unwrap();
        assert_eq!(err.lexeme, "Unterminated string.");
        assert_eq!(err.line, 2);
    }

    #[test]
    fn number_dot_digit_is_a_float() {
        assert_eq!(
            kinds("1.5 a.b"),
            vec![
                TokenKind::Number,
                TokenKind::Identifier,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }
}
