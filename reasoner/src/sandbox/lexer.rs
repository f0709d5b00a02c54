//! Tokenizer for the script dialect.
//!
//! Produces a flat token stream with explicit `Newline`, `Indent` and `Dedent`
//! markers. Newlines inside brackets are ignored, comments and blank lines are
//! dropped.

use crate::sandbox::error::ScriptError;

/// Multi-character operators first so the longest match wins.
const PUNCTUATION: [&str; 33] = [
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->", "+",
    "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "@",
];

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// Raw body of an f-string; split into parts by the parser.
    FStr(String),
    Punct(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
    at_line_start: bool,
    max_string_len: usize,
}

/// Tokenize `source`. String literals longer than `max_string_len` characters
/// are rejected.
pub fn tokenize(source: &str, max_string_len: usize) -> Result<Vec<Token>, ScriptError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
        at_line_start: true,
        max_string_len,
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn run(&mut self) -> Result<(), ScriptError> {
        while self.pos < self.chars.len() {
            if self.at_line_start && self.depth == 0 && self.handle_indentation()? {
                continue;
            }
            let c = self.chars[self.pos];
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.push_newline();
                        self.at_line_start = true;
                    }
                    self.line += 1;
                }
                ' ' | '\t' | '\r' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '"' | '\'' => {
                    let body = self.read_string(false)?;
                    self.push(TokenKind::Str(body));
                }
                c if c.is_ascii_digit() || (c == '.' && self.peek(1).is_some_and(|n| n.is_ascii_digit())) => {
                    self.read_number()?;
                }
                c if c.is_alphabetic() || c == '_' => self.read_name_or_prefixed_string()?,
                _ => self.read_punct()?,
            }
        }
        self.push_newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent);
        }
        self.push(TokenKind::Eof);
        Ok(())
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, kind: TokenKind) {
        self.tokens.push(Token {
            kind,
            line: self.line,
        });
    }

    fn push_newline(&mut self) {
        let needs = matches!(
            self.tokens.last().map(|t| &t.kind),
            Some(kind) if !matches!(kind, TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent)
        );
        if needs {
            self.push(TokenKind::Newline);
        }
    }

    fn skip_comment(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos] != '\n' {
            self.pos += 1;
        }
    }

    /// Measure leading whitespace of a logical line and emit indent changes.
    /// Returns `true` when the whole line was blank or a comment.
    fn handle_indentation(&mut self) -> Result<bool, ScriptError> {
        let mut width = 0;
        let mut cursor = self.pos;
        while let Some(&c) = self.chars.get(cursor) {
            match c {
                ' ' => width += 1,
                '\t' => width += 4,
                '\r' => {}
                _ => break,
            }
            cursor += 1;
        }
        match self.chars.get(cursor) {
            None => {
                self.pos = cursor;
                return Ok(true);
            }
            Some('\n') => {
                self.pos = cursor + 1;
                self.line += 1;
                return Ok(true);
            }
            Some('#') => {
                self.pos = cursor;
                self.skip_comment();
                return Ok(true);
            }
            Some(_) => {}
        }
        self.pos = cursor;
        self.at_line_start = false;

        let current = *self.indents.last().unwrap_or(&0);
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent);
        } else {
            while width < *self.indents.last().unwrap_or(&0) {
                self.indents.pop();
                self.push(TokenKind::Dedent);
            }
            if width != *self.indents.last().unwrap_or(&0) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(false)
    }

    fn read_number(&mut self) -> Result<(), ScriptError> {
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek(0) {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else if (c == 'e' || c == 'E')
                && self
                    .peek(1)
                    .is_some_and(|n| n.is_ascii_digit() || n == '-' || n == '+')
            {
                is_float = true;
                self.pos += 2;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| self.error(&format!("invalid number literal '{text}'")))?;
            self.push(TokenKind::Float(value));
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|_| self.error(&format!("integer literal '{text}' is too large")))?;
            self.push(TokenKind::Int(value));
        }
        Ok(())
    }

    fn read_name_or_prefixed_string(&mut self) -> Result<(), ScriptError> {
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        let quote_follows = matches!(self.peek(0), Some('"') | Some('\''));
        if quote_follows {
            match name.to_ascii_lowercase().as_str() {
                "f" => {
                    let body = self.read_string(true)?;
                    self.push(TokenKind::FStr(body));
                    return Ok(());
                }
                "r" => {
                    let body = self.read_string(true)?;
                    self.push(TokenKind::Str(body));
                    return Ok(());
                }
                "rf" | "fr" => {
                    let body = self.read_string(true)?;
                    self.push(TokenKind::FStr(body));
                    return Ok(());
                }
                "b" | "rb" | "br" | "u" => {
                    return Err(self.error(&format!("'{name}' string prefix is not supported")));
                }
                _ => {}
            }
        }
        self.push(TokenKind::Name(name));
        Ok(())
    }

    /// Read a quoted string starting at the opening quote. `raw` keeps
    /// backslashes verbatim (used for raw strings and f-string bodies, whose
    /// escapes are resolved after splitting).
    fn read_string(&mut self, raw: bool) -> Result<String, ScriptError> {
        let quote = self.chars[self.pos];
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };
        let mut out = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return Err(self.error("unterminated string literal"));
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(self.error("unterminated string literal"));
                }
                self.line += 1;
            }
            if c == '\\' && !raw {
                let escaped = self
                    .peek(1)
                    .ok_or_else(|| self.error("unterminated string literal"))?;
                self.pos += 2;
                match escaped {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    '\\' => out.push('\\'),
                    '\'' => out.push('\''),
                    '"' => out.push('"'),
                    '\n' => self.line += 1,
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
            } else if c == '\\' && raw {
                out.push(c);
                if let Some(next) = self.peek(1) {
                    out.push(next);
                    self.pos += 2;
                } else {
                    self.pos += 1;
                }
            } else {
                out.push(c);
                self.pos += 1;
            }
            if out.chars().count() > self.max_string_len {
                return Err(self.error("string literal is too long"));
            }
        }
        Ok(out)
    }

    fn read_punct(&mut self) -> Result<(), ScriptError> {
        for punct in PUNCTUATION {
            let matches = punct
                .chars()
                .enumerate()
                .all(|(i, expected)| self.peek(i) == Some(expected));
            if matches {
                self.pos += punct.chars().count();
                match punct {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.push(TokenKind::Punct(punct));
                return Ok(());
            }
        }
        let c = self.chars[self.pos];
        Err(self.error(&format!("unexpected character '{c}'")))
    }

    fn error(&self, message: &str) -> ScriptError {
        ScriptError::Syntax {
            line: self.line,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source, 1000)
            .expect("tokenize")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn emits_indent_and_dedent() {
        let tokens = kinds("if x:\n    y = 1\nz = 2\n");
        assert!(tokens.contains(&TokenKind::Indent));
        assert!(tokens.contains(&TokenKind::Dedent));
        assert_eq!(tokens.last(), Some(&TokenKind::Eof));
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let tokens = kinds("# heading\n\nx = 1  # trailing\n");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Name("x".to_string()),
                TokenKind::Punct("="),
                TokenKind::Int(1),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn ignores_newlines_inside_brackets() {
        let tokens = kinds("x = [1,\n     2]\n");
        let newlines = tokens
            .iter()
            .filter(|t| matches!(t, TokenKind::Newline))
            .count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn longest_operator_wins() {
        let tokens = kinds("a //= 2 ** 3\n");
        assert!(tokens.contains(&TokenKind::Punct("//=")));
        assert!(tokens.contains(&TokenKind::Punct("**")));
    }

    #[test]
    fn reads_strings_and_fstrings() {
        let tokens = kinds("s = 'it\\'s'\nt = f\"{s}!\"\n");
        assert!(tokens.contains(&TokenKind::Str("it's".to_string())));
        assert!(tokens.contains(&TokenKind::FStr("{s}!".to_string())));
    }

    #[test]
    fn rejects_bad_dedent() {
        let err = tokenize("if x:\n    y = 1\n  z = 2\n", 1000).expect_err("bad dedent");
        assert!(err.to_string().contains("unindent"));
    }

    #[test]
    fn parses_floats_and_underscored_ints() {
        let tokens = kinds("a = 1_000 + 2.5e3\n");
        assert!(tokens.contains(&TokenKind::Int(1000)));
        assert!(tokens.contains(&TokenKind::Float(2500.0)));
    }
}
