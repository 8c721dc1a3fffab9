//! Host services: raw lexing, re-lexing for token pasting, and the
//! directive-aware source driver.
//!
//! The engine owns no lexer of its own. It pulls raw tokens through the
//! [`TokenSource`] trait and hands pasted spellings back through
//! [`TokenSource::relex`], which decides whether a concatenation forms a
//! single valid token.

use crate::engine::{MacroParams, Preprocessor};
use crate::errors::ErrorKind;
use crate::tokens::{Span, Token, TokenKind};

/// One-token-lookahead stream of raw tokens, plus the re-lexing service the
/// paste operator needs.
pub trait TokenSource {
    /// Next raw token. Returns `Eof` forever once the input is exhausted.
    fn next_raw(&mut self) -> Token;
    /// Peek at the next raw token without consuming it.
    fn peek(&mut self) -> &Token;
    /// Lex `spelling` in isolation. `Some` only if it forms exactly one
    /// token with nothing left over.
    fn relex(&self, spelling: &str) -> Option<Token>;
}

// ============================================================================
// LEXER - C-family token scanner
// ============================================================================

/// Byte-oriented scanner producing the token vocabulary the engine rewrites.
/// Spans are absolute offsets into the translation unit, shifted by `base`
/// so chunked lexing still points at the right source text.
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    base: usize,
    peeked: Option<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(text: &'a str) -> Self {
        Self::with_offset(text, 0)
    }

    pub fn with_offset(text: &'a str, base: usize) -> Self {
        Lexer {
            src: text.as_bytes(),
            pos: 0,
            base,
            peeked: None,
        }
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.src.get(self.pos).copied();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    fn at(&self, offset: usize) -> u8 {
        self.src.get(self.pos + offset).copied().unwrap_or(0)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.at(0) {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                }
                b'/' if self.at(1) == b'/' => {
                    while self.pos < self.src.len() && self.at(0) != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.at(1) == b'*' => {
                    self.pos += 2;
                    while self.pos < self.src.len() && !(self.at(0) == b'*' && self.at(1) == b'/') {
                        self.pos += 1;
                    }
                    self.pos = (self.pos + 2).min(self.src.len());
                }
                _ => break,
            }
        }
    }

    fn spelling(&self, start: usize) -> &str {
        // Lexer input is always a str slice, so boundaries hold.
        std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("")
    }

    fn token(&self, kind: TokenKind, start: usize) -> Token {
        Token::new(
            kind,
            self.spelling(start),
            Span::new(self.base + start, self.base + self.pos),
        )
    }

    fn lex_string(&mut self, quote: u8) {
        // Opening quote already consumed.
        while let Some(b) = self.bump() {
            match b {
                b'\\' => {
                    self.bump();
                }
                b if b == quote => break,
                _ => {}
            }
        }
    }

    fn lex_number(&mut self) {
        // pp-number: digits, identifier characters, '.', and exponent signs.
        while self.pos < self.src.len() {
            let b = self.at(0);
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' {
                let exponent = matches!(b, b'e' | b'E' | b'p' | b'P')
                    && matches!(self.at(1), b'+' | b'-');
                self.pos += 1;
                if exponent {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    fn lex_punct(&mut self, start: usize) -> Token {
        const THREE: &[&str] = &["...", "<<=", ">>="];
        const TWO: &[&str] = &[
            "##", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "->", "++", "--", "+=", "-=",
            "*=", "/=", "%=", "&=", "|=", "^=", "::",
        ];
        let rest = &self.src[self.pos..];
        for p in THREE {
            if rest.starts_with(p.as_bytes()) {
                self.pos += 3;
                return self.token(TokenKind::Punct, start);
            }
        }
        for p in TWO {
            if rest.starts_with(p.as_bytes()) {
                self.pos += 2;
                let kind = if *p == "##" {
                    TokenKind::HashHash
                } else {
                    TokenKind::Punct
                };
                return self.token(kind, start);
            }
        }
        let b = self.bump().unwrap_or(0);
        let kind = match b {
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b',' => TokenKind::Comma,
            b'#' => TokenKind::Hash,
            b'+' | b'-' | b'*' | b'/' | b'%' | b'<' | b'>' | b'=' | b'!' | b'&' | b'|' | b'^'
            | b'~' | b'?' | b':' | b';' | b'.' | b'[' | b']' | b'{' | b'}' => TokenKind::Punct,
            _ => TokenKind::Unknown,
        };
        self.token(kind, start)
    }

    fn lex(&mut self) -> Token {
        self.skip_trivia();
        let start = self.pos;
        let Some(b) = self.src.get(self.pos).copied() else {
            return Token::eof(self.base + self.pos);
        };
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                while matches!(self.at(0), b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_') {
                    self.pos += 1;
                }
                self.token(TokenKind::Identifier, start)
            }
            b'0'..=b'9' => {
                self.lex_number();
                self.token(TokenKind::Number, start)
            }
            b'.' if self.at(1).is_ascii_digit() => {
                self.lex_number();
                self.token(TokenKind::Number, start)
            }
            b'"' => {
                self.pos += 1;
                self.lex_string(b'"');
                self.token(TokenKind::StringLit, start)
            }
            b'\'' => {
                self.pos += 1;
                self.lex_string(b'\'');
                self.token(TokenKind::CharLit, start)
            }
            _ => self.lex_punct(start),
        }
    }
}

impl TokenSource for Lexer<'_> {
    fn next_raw(&mut self) -> Token {
        if let Some(tok) = self.peeked.take() {
            return tok;
        }
        self.lex()
    }

    fn peek(&mut self) -> &Token {
        if self.peeked.is_none() {
            self.peeked = Some(self.lex());
        }
        self.peeked.as_ref().expect("lookahead was just filled")
    }

    fn relex(&self, spelling: &str) -> Option<Token> {
        let mut lexer = Lexer::new(spelling);
        let tok = lexer.lex();
        if tok.kind == TokenKind::Eof || tok.kind == TokenKind::Unknown {
            return None;
        }
        if lexer.lex().kind != TokenKind::Eof {
            return None;
        }
        Some(tok)
    }
}

// ============================================================================
// DIRECTIVE READER - line-oriented #define / #undef handling
// ============================================================================

/// Runs a translation unit through the engine: directive lines update the
/// macro table in order, everything else is lexed and expanded. Returns the
/// fully expanded token stream; all failures are recoverable and go to the
/// engine's diagnostic sink.
pub fn preprocess_source(pp: &mut Preprocessor, source: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let mut lines = Vec::new();
    let mut offset = 0;
    for line in source.split_inclusive('\n') {
        lines.push((offset, line));
        offset += line.len();
    }

    let mut chunk_start = 0;
    let mut chunk_end = 0;
    let mut i = 0;
    while i < lines.len() {
        let (line_start, line) = lines[i];
        let trimmed = line.trim_start();
        // A line opening with '##' starts with the paste operator, not a
        // directive.
        if trimmed.starts_with('#') && !trimmed.starts_with("##") {
            flush_chunk(pp, source, chunk_start, chunk_end, &mut out);
            // Splice backslash continuations into one directive line.
            let mut text = line.to_string();
            while ends_with_continuation(&text) && i + 1 < lines.len() {
                trim_continuation(&mut text);
                i += 1;
                text.push_str(lines[i].1);
            }
            handle_directive(pp, &text, line_start);
            chunk_start = lines[i].0 + lines[i].1.len();
            chunk_end = chunk_start;
        } else {
            chunk_end = line_start + line.len();
        }
        i += 1;
    }
    flush_chunk(pp, source, chunk_start, chunk_end, &mut out);
    out
}

fn flush_chunk(
    pp: &mut Preprocessor,
    source: &str,
    start: usize,
    end: usize,
    out: &mut Vec<Token>,
) {
    if start >= end {
        return;
    }
    let mut lexer = Lexer::with_offset(&source[start..end], start);
    loop {
        let tok = pp.next_token(&mut lexer);
        if tok.kind == TokenKind::Eof {
            break;
        }
        out.push(tok);
    }
}

fn ends_with_continuation(text: &str) -> bool {
    text.trim_end_matches(['\n', '\r']).ends_with('\\')
}

fn trim_continuation(text: &mut String) {
    while text.ends_with('\n') || text.ends_with('\r') {
        text.pop();
    }
    if text.ends_with('\\') {
        text.pop();
    }
    text.push(' ');
}

fn handle_directive(pp: &mut Preprocessor, text: &str, offset: usize) {
    let mut lexer = Lexer::with_offset(text, offset);
    let hash = lexer.next_raw();
    debug_assert_eq!(hash.kind, TokenKind::Hash);

    let word = lexer.next_raw();
    if word.kind != TokenKind::Identifier {
        pp.diagnose(
            ErrorKind::BadDirective {
                message: "expected a directive name after '#'".into(),
            },
            word.span,
            false,
        );
        return;
    }
    match word.spelling.as_str() {
        "define" => handle_define(pp, lexer),
        "undef" => {
            let name = lexer.next_raw();
            if name.kind != TokenKind::Identifier {
                pp.diagnose(
                    ErrorKind::BadDirective {
                        message: "expected a macro name after '#undef'".into(),
                    },
                    name.span,
                    false,
                );
                return;
            }
            pp.undefine(&name.spelling);
        }
        other => {
            pp.diagnose(
                ErrorKind::UnsupportedDirective {
                    directive: other.to_string(),
                },
                word.span,
                true,
            );
        }
    }
}

fn handle_define(pp: &mut Preprocessor, mut lexer: Lexer<'_>) {
    let name = lexer.next_raw();
    if name.kind != TokenKind::Identifier {
        pp.diagnose(
            ErrorKind::BadDirective {
                message: "expected a macro name after '#define'".into(),
            },
            name.span,
            false,
        );
        return;
    }

    // A parameter list only exists if '(' sits immediately after the name;
    // with whitespace in between it is part of the replacement body.
    let params = if lexer.peek().kind == TokenKind::LParen && lexer.peek().span.start == name.span.end
    {
        lexer.next_raw();
        match read_param_list(pp, &mut lexer, &name) {
            Some(params) => Some(params),
            None => return,
        }
    } else {
        None
    };

    let mut body = Vec::new();
    loop {
        let tok = lexer.next_raw();
        if tok.kind == TokenKind::Eof {
            break;
        }
        body.push(tok);
    }

    if let Err(err) = pp.define(&name.spelling, params, body, name.span) {
        pp.emit(err);
    }
}

fn read_param_list(pp: &mut Preprocessor, lexer: &mut Lexer<'_>, name: &Token) -> Option<MacroParams> {
    let mut names = Vec::new();
    let mut variadic = false;
    if lexer.peek().kind == TokenKind::RParen {
        lexer.next_raw();
        return Some(MacroParams { names, variadic });
    }
    loop {
        let tok = lexer.next_raw();
        match tok.kind {
            TokenKind::Identifier if !variadic => names.push(tok.spelling),
            TokenKind::Punct if tok.spelling == "..." && !variadic => variadic = true,
            _ => {
                pp.diagnose(
                    ErrorKind::BadDirective {
                        message: format!(
                            "invalid parameter list in definition of '{}'",
                            name.spelling
                        ),
                    },
                    tok.span,
                    false,
                );
                return None;
            }
        }
        let delim = lexer.next_raw();
        match delim.kind {
            TokenKind::Comma if !variadic => {}
            TokenKind::RParen => break,
            _ => {
                pp.diagnose(
                    ErrorKind::BadDirective {
                        message: format!(
                            "invalid parameter list in definition of '{}'",
                            name.spelling
                        ),
                    },
                    delim.span,
                    false,
                );
                return None;
            }
        }
    }
    Some(MacroParams { names, variadic })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(text);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_raw();
            if tok.kind == TokenKind::Eof {
                break;
            }
            out.push(tok.kind);
        }
        out
    }

    #[test]
    fn lexes_the_core_vocabulary() {
        assert_eq!(
            kinds("SQ(x + 2, \"s\") ## 'c'"),
            vec![
                TokenKind::Identifier,
                TokenKind::LParen,
                TokenKind::Identifier,
                TokenKind::Punct,
                TokenKind::Number,
                TokenKind::Comma,
                TokenKind::StringLit,
                TokenKind::RParen,
                TokenKind::HashHash,
                TokenKind::CharLit,
            ]
        );
    }

    #[test]
    fn comments_are_trivia() {
        assert_eq!(
            kinds("a // line\n /* block */ b"),
            vec![TokenKind::Identifier, TokenKind::Identifier]
        );
    }

    #[test]
    fn spans_are_shifted_by_the_chunk_base() {
        let mut lexer = Lexer::with_offset("ab", 10);
        let tok = lexer.next_raw();
        assert_eq!(tok.span, Span::new(10, 12));
    }

    #[test]
    fn eof_repeats() {
        let mut lexer = Lexer::new("");
        assert_eq!(lexer.next_raw().kind, TokenKind::Eof);
        assert_eq!(lexer.next_raw().kind, TokenKind::Eof);
    }

    #[test]
    fn relex_accepts_single_tokens_only() {
        let lexer = Lexer::new("");
        assert_eq!(lexer.relex("foo").unwrap().kind, TokenKind::Identifier);
        assert_eq!(lexer.relex("123").unwrap().kind, TokenKind::Number);
        assert_eq!(lexer.relex("+=").unwrap().kind, TokenKind::Punct);
        assert!(lexer.relex("1 2").is_none());
        assert!(lexer.relex("+a").is_none());
        // Two slashes form a comment, not a token.
        assert!(lexer.relex("//").is_none());
    }

    #[test]
    fn relex_of_two_hashes_yields_the_paste_spelling() {
        let lexer = Lexer::new("");
        assert_eq!(lexer.relex("##").unwrap().kind, TokenKind::HashHash);
    }
}
