//! Lexer: tokenizes script source
//!
//! Produces a stream of tokens that the parser consumes. Handles
//! keywords, identifiers, string and template literals, numbers,
//! operators and punctuation. Line (`//`) and block comments are skipped.

use crate::errors::{ScriptError, ScriptResult};

/// A token produced by the lexer
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Raw text, or the decoded value for string literals
    pub text: String,
    /// Line number (1-based)
    pub line: usize,
    /// Column number (1-based)
    pub col: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, line: usize, col: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
            col,
        }
    }
}

/// Token types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    // Keywords
    Let,
    Const,
    Var,
    If,
    Else,
    While,
    For,
    Of,
    Break,
    Continue,
    Return,
    True,
    False,
    Null,
    Undefined,
    Typeof,
    /// Reserved words with no meaning inside the sandbox
    Reserved,

    // Identifiers and literals
    Identifier,
    StringLiteral,
    TemplateLiteral,
    NumberLiteral,

    // Punctuation
    OpenParen,
    CloseParen,
    OpenBrace,
    CloseBrace,
    OpenBracket,
    CloseBracket,
    Comma,
    Semicolon,
    Colon,
    Dot,
    QuestionDot,
    Question,
    Arrow,

    // Operators
    Assign,
    PlusAssign,
    MinusAssign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    EqEqEq,
    NotEq,
    NotEqEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Nullish,

    // End of input
    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Let => "let",
            Self::Const => "const",
            Self::Var => "var",
            Self::If => "if",
            Self::Else => "else",
            Self::While => "while",
            Self::For => "for",
            Self::Of => "of",
            Self::Break => "break",
            Self::Continue => "continue",
            Self::Return => "return",
            Self::True => "true",
            Self::False => "false",
            Self::Null => "null",
            Self::Undefined => "undefined",
            Self::Typeof => "typeof",
            Self::Reserved => "reserved word",
            Self::Identifier => "identifier",
            Self::StringLiteral => "string literal",
            Self::TemplateLiteral => "template literal",
            Self::NumberLiteral => "number",
            Self::OpenParen => "(",
            Self::CloseParen => ")",
            Self::OpenBrace => "{",
            Self::CloseBrace => "}",
            Self::OpenBracket => "[",
            Self::CloseBracket => "]",
            Self::Comma => ",",
            Self::Semicolon => ";",
            Self::Colon => ":",
            Self::Dot => ".",
            Self::QuestionDot => "?.",
            Self::Question => "?",
            Self::Arrow => "=>",
            Self::Assign => "=",
            Self::PlusAssign => "+=",
            Self::MinusAssign => "-=",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::Slash => "/",
            Self::Percent => "%",
            Self::Bang => "!",
            Self::EqEq => "==",
            Self::EqEqEq => "===",
            Self::NotEq => "!=",
            Self::NotEqEq => "!==",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::AndAnd => "&&",
            Self::OrOr => "||",
            Self::Nullish => "??",
            Self::Eof => "end of input",
        };
        f.write_str(s)
    }
}

/// Lexer for script source
pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> ScriptResult<Vec<Token>> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace_and_comments()?;

            if self.pos >= self.input.len() {
                tokens.push(Token::new(TokenKind::Eof, "", self.line, self.col));
                break;
            }

            tokens.push(self.next_token()?);
        }

        Ok(tokens)
    }

    fn next_token(&mut self) -> ScriptResult<Token> {
        let ch = self.input[self.pos];
        let line = self.line;
        let col = self.col;

        // Three, two, then one character operators
        let three: String = self.input[self.pos..(self.pos + 3).min(self.input.len())]
            .iter()
            .collect();
        let three_kind = match three.as_str() {
            "===" => Some(TokenKind::EqEqEq),
            "!==" => Some(TokenKind::NotEqEq),
            _ => None,
        };
        if let Some(kind) = three_kind {
            self.advance_by(3);
            return Ok(Token::new(kind, three, line, col));
        }

        let two: String = self.input[self.pos..(self.pos + 2).min(self.input.len())]
            .iter()
            .collect();
        let two_kind = match two.as_str() {
            "==" => Some(TokenKind::EqEq),
            "!=" => Some(TokenKind::NotEq),
            "<=" => Some(TokenKind::LtEq),
            ">=" => Some(TokenKind::GtEq),
            "&&" => Some(TokenKind::AndAnd),
            "||" => Some(TokenKind::OrOr),
            "??" => Some(TokenKind::Nullish),
            "=>" => Some(TokenKind::Arrow),
            "+=" => Some(TokenKind::PlusAssign),
            "-=" => Some(TokenKind::MinusAssign),
            // `?.5` is a conditional followed by a number
            "?." if !self.peek_at(2).map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                Some(TokenKind::QuestionDot)
            }
            _ => None,
        };
        if let Some(kind) = two_kind {
            self.advance_by(2);
            return Ok(Token::new(kind, two, line, col));
        }

        let single = match ch {
            '(' => Some(TokenKind::OpenParen),
            ')' => Some(TokenKind::CloseParen),
            '{' => Some(TokenKind::OpenBrace),
            '}' => Some(TokenKind::CloseBrace),
            '[' => Some(TokenKind::OpenBracket),
            ']' => Some(TokenKind::CloseBracket),
            ',' => Some(TokenKind::Comma),
            ';' => Some(TokenKind::Semicolon),
            ':' => Some(TokenKind::Colon),
            '?' => Some(TokenKind::Question),
            '=' => Some(TokenKind::Assign),
            '+' => Some(TokenKind::Plus),
            '-' => Some(TokenKind::Minus),
            '*' => Some(TokenKind::Star),
            '/' => Some(TokenKind::Slash),
            '%' => Some(TokenKind::Percent),
            '!' => Some(TokenKind::Bang),
            '<' => Some(TokenKind::Lt),
            '>' => Some(TokenKind::Gt),
            '.' if !self.peek_at(1).map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                Some(TokenKind::Dot)
            }
            _ => None,
        };
        if let Some(kind) = single {
            self.advance();
            return Ok(Token::new(kind, ch.to_string(), line, col));
        }

        match ch {
            '"' | '\'' => self.read_string_literal(ch),
            '`' => self.read_template_literal(),
            c if c.is_ascii_digit() || c == '.' => self.read_number(),
            c if c.is_alphabetic() || c == '_' || c == '$' => Ok(self.read_identifier_or_keyword()),
            _ => Err(ScriptError::syntax(
                line,
                col,
                format!("Unexpected character '{}'", ch),
            )),
        }
    }

    fn read_string_literal(&mut self, quote: char) -> ScriptResult<Token> {
        let line = self.line;
        let col = self.col;
        self.advance(); // opening quote

        let mut text = String::new();
        loop {
            match self.current() {
                None | Some('\n') => {
                    return Err(ScriptError::syntax(line, col, "Unterminated string literal"))
                }
                Some(c) if c == quote => break,
                Some('\\') => {
                    self.advance();
                    text.push(self.read_escape(line, col)?);
                    continue;
                }
                Some(c) => text.push(c),
            }
            self.advance();
        }

        self.advance(); // closing quote
        Ok(Token::new(TokenKind::StringLiteral, text, line, col))
    }

    /// Template literals keep their raw body; the parser splits `${...}` parts
    fn read_template_literal(&mut self) -> ScriptResult<Token> {
        let line = self.line;
        let col = self.col;
        self.advance(); // opening backtick

        let mut text = String::new();
        loop {
            match self.current() {
                None => {
                    return Err(ScriptError::syntax(line, col, "Unterminated template literal"))
                }
                Some('`') => break,
                Some('\\') => {
                    self.advance();
                    let escaped = self.read_escape(line, col)?;
                    if escaped == '$' || escaped == '`' || escaped == '\\' {
                        text.push('\\');
                    }
                    text.push(escaped);
                    continue;
                }
                Some(c) => text.push(c),
            }
            self.advance();
        }

        self.advance(); // closing backtick
        Ok(Token::new(TokenKind::TemplateLiteral, text, line, col))
    }

    fn read_escape(&mut self, line: usize, col: usize) -> ScriptResult<char> {
        let c = self
            .current()
            .ok_or_else(|| ScriptError::syntax(line, col, "Unterminated escape sequence"))?;
        self.advance();
        Ok(match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            'u' => {
                let mut hex = String::new();
                for _ in 0..4 {
                    match self.current() {
                        Some(h) if h.is_ascii_hexdigit() => {
                            hex.push(h);
                            self.advance();
                        }
                        _ => return Err(ScriptError::syntax(line, col, "Invalid unicode escape")),
                    }
                }
                u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| ScriptError::syntax(line, col, "Invalid unicode escape"))?
            }
            other => other,
        })
    }

    fn read_number(&mut self) -> ScriptResult<Token> {
        let line = self.line;
        let col = self.col;
        let mut text = String::new();
        let mut seen_dot = false;
        let mut seen_exp = false;

        while let Some(c) = self.current() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    text.push(c);
                }
            } else if c == '.' && !seen_dot && !seen_exp {
                seen_dot = true;
                text.push(c);
            } else if (c == 'e' || c == 'E') && !seen_exp {
                seen_exp = true;
                text.push(c);
                if let Some(sign @ ('+' | '-')) = self.peek_at(1) {
                    self.advance();
                    text.push(sign);
                }
            } else {
                break;
            }
            self.advance();
        }

        if text.parse::<f64>().is_err() {
            return Err(ScriptError::syntax(
                line,
                col,
                format!("Invalid number '{}'", text),
            ));
        }
        Ok(Token::new(TokenKind::NumberLiteral, text, line, col))
    }

    fn read_identifier_or_keyword(&mut self) -> Token {
        let line = self.line;
        let col = self.col;
        let mut text = String::new();

        while let Some(c) = self.current() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let kind = match text.as_str() {
            "let" => TokenKind::Let,
            "const" => TokenKind::Const,
            "var" => TokenKind::Var,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "for" => TokenKind::For,
            "of" => TokenKind::Of,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "return" => TokenKind::Return,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            "undefined" => TokenKind::Undefined,
            "typeof" => TokenKind::Typeof,
            "function" | "new" | "class" | "this" | "import" | "export" | "async" | "await"
            | "yield" | "with" | "delete" | "throw" | "try" | "catch" => TokenKind::Reserved,
            _ => TokenKind::Identifier,
        };

        Token::new(kind, text, line, col)
    }

    fn skip_whitespace_and_comments(&mut self) -> ScriptResult<()> {
        while let Some(ch) = self.current() {
            if ch.is_whitespace() {
                self.advance();
            } else if ch == '/' && self.peek_at(1) == Some('/') {
                while self.current().map(|c| c != '\n').unwrap_or(false) {
                    self.advance();
                }
            } else if ch == '/' && self.peek_at(1) == Some('*') {
                let (line, col) = (self.line, self.col);
                self.advance_by(2);
                loop {
                    match self.current() {
                        None => return Err(ScriptError::syntax(line, col, "Unterminated comment")),
                        Some('*') if self.peek_at(1) == Some('/') => {
                            self.advance_by(2);
                            break;
                        }
                        Some(_) => self.advance(),
                    }
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn advance(&mut self) {
        if self.pos < self.input.len() {
            if self.input[self.pos] == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
            self.pos += 1;
        }
    }

    fn advance_by(&mut self, n: usize) {
        for _ in 0..n {
            self.advance();
        }
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            kinds("let x = input.amount > 1000;"),
            vec![
                TokenKind::Let,
                TokenKind::Identifier,
                TokenKind::Assign,
                TokenKind::Identifier,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::Gt,
                TokenKind::NumberLiteral,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_multi_char_operators() {
        assert_eq!(
            kinds("a === b !== c ?? d?.e => f"),
            vec![
                TokenKind::Identifier,
                TokenKind::EqEqEq,
                TokenKind::Identifier,
                TokenKind::NotEqEq,
                TokenKind::Identifier,
                TokenKind::Nullish,
                TokenKind::Identifier,
                TokenKind::QuestionDot,
                TokenKind::Identifier,
                TokenKind::Arrow,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let tokens = Lexer::new(r#"'it\'s' "a\nb" "A""#).tokenize().unwrap();
        assert_eq!(tokens[0].text, "it's");
        assert_eq!(tokens[1].text, "a\nb");
        assert_eq!(tokens[2].text, "A");
    }

    #[test]
    fn test_numbers() {
        let tokens = Lexer::new("42 3.5 .5 1e3 1_000").tokenize().unwrap();
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["42", "3.5", ".5", "1e3", "1000", ""]);
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("// line\n/* block\n */ x"),
            vec![TokenKind::Identifier, TokenKind::Eof]
        );
    }

    #[test]
    fn test_reserved_words() {
        assert_eq!(kinds("function")[0], TokenKind::Reserved);
        assert_eq!(kinds("new")[0], TokenKind::Reserved);
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("'abc").tokenize().unwrap_err();
        assert!(err.message.contains("Unterminated string"));
        assert!(err.message.contains("line 1"));
    }

    #[test]
    fn test_unexpected_character() {
        let err = Lexer::new("a # b").tokenize().unwrap_err();
        assert!(err.message.contains("Unexpected character '#'"));
    }

    #[test]
    fn test_positions() {
        let tokens = Lexer::new("a\n  b").tokenize().unwrap();
        assert_eq!((tokens[1].line, tokens[1].col), (2, 3));
    }
}
