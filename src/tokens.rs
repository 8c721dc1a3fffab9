//! Symbolic token model for mixed macro expansion.
//!
//! The engine rewrites sequences of [`MixedToken`]s. A mixed token is either a
//! concrete token carried verbatim from the host lexer, an identifier that may
//! still be recognized as a macro name, or a placeholder standing in for a
//! formal parameter of the macro whose body is being pre-computed.
//!
//! Identifiers and placeholders carry an expansion stack: the set of macro
//! names already expanded on the path that produced them. A name present in a
//! token's stack is permanently ineligible for expansion at that token, which
//! is what makes self-referential macros terminate.

use std::collections::HashSet;

use serde::Serialize;

/// Byte range into the current translation unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TokenKind {
    Identifier,
    Number,
    StringLit,
    CharLit,
    LParen,
    RParen,
    Comma,
    Hash,
    HashHash,
    Punct,
    /// Sentinel terminating a macro body or a captured argument slot.
    EndMarker,
    Eof,
    Unknown,
}

impl TokenKind {
    /// Stable name used by the token-dump output format.
    pub fn name(self) -> &'static str {
        match self {
            TokenKind::Identifier => "identifier",
            TokenKind::Number => "numeric_constant",
            TokenKind::StringLit => "string_literal",
            TokenKind::CharLit => "char_constant",
            TokenKind::LParen => "l_paren",
            TokenKind::RParen => "r_paren",
            TokenKind::Comma => "comma",
            TokenKind::Hash => "hash",
            TokenKind::HashHash => "hashhash",
            TokenKind::Punct => "punctuator",
            TokenKind::EndMarker => "eod",
            TokenKind::Eof => "eof",
            TokenKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub spelling: String,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, spelling: impl Into<String>, span: Span) -> Self {
        Token {
            kind,
            spelling: spelling.into(),
            span,
        }
    }

    pub fn eof(at: usize) -> Self {
        Token::new(TokenKind::Eof, "", Span::new(at, at))
    }

    pub fn end_marker() -> Self {
        Token::new(TokenKind::EndMarker, "", Span::default())
    }

    pub fn is_end(&self) -> bool {
        matches!(self.kind, TokenKind::EndMarker | TokenKind::Eof)
    }
}

/// Set of macro names already expanded to produce a token.
pub type ExpansionStack = HashSet<String>;

/// A token inside the expansion engine.
///
/// `expanded` is per rewrite pass: it records that the current pass has
/// already considered the token for placeholder substitution, so freshly
/// spliced material is reconsidered without looping forever. Instantiating a
/// cached body resets the flag on every copy.
#[derive(Debug, Clone, Serialize)]
pub enum MixedToken {
    /// Concrete token with no expansion history.
    Literal { tok: Token, expanded: bool },
    /// Identifier that may still name a macro. `disabled` marks an instance
    /// permanently excluded from recognition, either because its own stack
    /// blocked it or because a malformed invocation was recovered around it.
    Ident {
        tok: Token,
        expanded: bool,
        disabled: bool,
        stack: ExpansionStack,
    },
    /// Placeholder for the `index`th argument slot of the macro `owner`.
    /// Only a bundle belonging to `owner` may resolve it.
    Arg {
        index: usize,
        owner: String,
        expanded: bool,
        stack: ExpansionStack,
    },
}

impl MixedToken {
    pub fn literal(tok: Token) -> Self {
        MixedToken::Literal {
            tok,
            expanded: false,
        }
    }

    /// Wraps a raw token pulled from the host stream.
    pub fn from_stream(tok: Token) -> Self {
        MixedToken::literal(tok)
    }

    pub fn ident(tok: Token, stack: ExpansionStack) -> Self {
        MixedToken::Ident {
            tok,
            expanded: false,
            disabled: false,
            stack,
        }
    }

    /// Identifier produced by token pasting; eligible for re-expansion.
    pub fn pasted_ident(tok: Token, stack: ExpansionStack) -> Self {
        MixedToken::Ident {
            tok,
            expanded: false,
            disabled: false,
            stack,
        }
    }

    /// Identifier instance that recognition must skip from now on.
    pub fn disabled_ident(tok: Token) -> Self {
        MixedToken::Ident {
            tok,
            expanded: true,
            disabled: true,
            stack: ExpansionStack::new(),
        }
    }

    pub fn arg(index: usize, owner: &str) -> Self {
        MixedToken::Arg {
            index,
            owner: owner.to_string(),
            expanded: false,
            stack: ExpansionStack::new(),
        }
    }

    /// Resolved placeholder produced while pre-computing a body against the
    /// symbolic bundle. Marked expanded so the pre-computation pass moves on.
    pub fn symbolic_arg(index: usize, owner: &str, stack: &ExpansionStack) -> Self {
        MixedToken::Arg {
            index,
            owner: owner.to_string(),
            expanded: true,
            stack: stack.clone(),
        }
    }

    pub fn end_marker() -> Self {
        MixedToken::literal(Token::end_marker())
    }

    pub fn kind(&self) -> TokenKind {
        match self {
            MixedToken::Literal { tok, .. } | MixedToken::Ident { tok, .. } => tok.kind,
            MixedToken::Arg { .. } => TokenKind::Unknown,
        }
    }

    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    pub fn is_end(&self) -> bool {
        matches!(self.kind(), TokenKind::EndMarker | TokenKind::Eof)
    }

    /// Literal and identifier tokens are concrete; placeholders are not.
    pub fn is_concrete(&self) -> bool {
        !matches!(self, MixedToken::Arg { .. })
    }

    pub fn token(&self) -> Option<&Token> {
        match self {
            MixedToken::Literal { tok, .. } | MixedToken::Ident { tok, .. } => Some(tok),
            MixedToken::Arg { .. } => None,
        }
    }

    pub fn into_token(self) -> Option<Token> {
        match self {
            MixedToken::Literal { tok, .. } | MixedToken::Ident { tok, .. } => Some(tok),
            MixedToken::Arg { .. } => None,
        }
    }

    pub fn span(&self) -> Span {
        self.token().map(|t| t.span).unwrap_or_default()
    }

    /// Name under which recognition would look this token up, if any.
    pub fn ident_name(&self) -> Option<&str> {
        match self {
            MixedToken::Literal { tok, .. } | MixedToken::Ident { tok, .. }
                if tok.kind == TokenKind::Identifier =>
            {
                Some(&tok.spelling)
            }
            _ => None,
        }
    }

    /// True for identifiers the recognition step may still act on.
    pub fn is_macro_candidate(&self) -> bool {
        match self {
            MixedToken::Literal { tok, .. } => tok.kind == TokenKind::Identifier,
            MixedToken::Ident { tok, disabled, .. } => {
                tok.kind == TokenKind::Identifier && !disabled
            }
            MixedToken::Arg { .. } => false,
        }
    }

    pub fn is_expanded(&self) -> bool {
        match self {
            MixedToken::Literal { expanded, .. }
            | MixedToken::Ident { expanded, .. }
            | MixedToken::Arg { expanded, .. } => *expanded,
        }
    }

    pub fn set_expanded(&mut self) {
        match self {
            MixedToken::Literal { expanded, .. }
            | MixedToken::Ident { expanded, .. }
            | MixedToken::Arg { expanded, .. } => *expanded = true,
        }
    }

    /// Whether the substitution step still has to consider this token.
    pub fn needs_substitution(&self) -> bool {
        match self {
            MixedToken::Literal { .. } => false,
            MixedToken::Ident {
                expanded, disabled, ..
            } => !expanded && !disabled,
            MixedToken::Arg { expanded, .. } => !expanded,
        }
    }

    pub fn stack_contains(&self, name: &str) -> bool {
        match self {
            MixedToken::Literal { .. } => false,
            MixedToken::Ident { stack, .. } | MixedToken::Arg { stack, .. } => {
                stack.contains(name)
            }
        }
    }

    /// Unions `names` into the token's expansion stack. Concrete literals
    /// carry no stack and are unaffected.
    pub fn add_stack(&mut self, names: &ExpansionStack) {
        match self {
            MixedToken::Literal { .. } => {}
            MixedToken::Ident { stack, .. } | MixedToken::Arg { stack, .. } => {
                stack.extend(names.iter().cloned());
            }
        }
    }

    /// Marks this instance ineligible for recognition. Stream literals are
    /// promoted to identifiers so the flag has somewhere to live.
    pub fn disable(&mut self) {
        match self {
            MixedToken::Ident { disabled, expanded, .. } => {
                *disabled = true;
                *expanded = true;
            }
            MixedToken::Literal { tok, .. } => {
                let tok = std::mem::replace(tok, Token::end_marker());
                *self = MixedToken::disabled_ident(tok);
            }
            MixedToken::Arg { .. } => {}
        }
    }

    /// Copy used when stamping a cached body into a fresh invocation: the
    /// per-pass `expanded` flag is cleared, everything else is kept.
    pub fn fresh_instance(&self) -> MixedToken {
        let mut copy = self.clone();
        match &mut copy {
            MixedToken::Literal { expanded, .. } | MixedToken::Arg { expanded, .. } => {
                *expanded = false;
            }
            MixedToken::Ident { expanded, disabled, .. } => {
                if !*disabled {
                    *expanded = false;
                }
            }
        }
        copy
    }
}
