//! The mixed expansion engine.
//!
//! Every macro body is rewritten once against a symbolic argument bundle and
//! cached; invoking the macro then stamps the cached body against the real
//! arguments. The same rewrite loop drives body pre-computation, body
//! instantiation, argument pre-expansion, and call-site argument collection,
//! differing only in which steps are enabled.
//!
//! The loop walks a growable buffer with a movable cursor, filling the
//! buffer lazily from a [`TokenFeed`]. Substitution and invocation splice
//! their results in at the cursor without advancing it, so fresh material is
//! reconsidered; per-pass `expanded` flags keep that from looping.

use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use serde::Serialize;

use crate::args::MacroArgs;
use crate::deps::DependencyGraph;
use crate::errors::{
    to_source_span, ErrorKind, ErrorReporting, PreprocError, SharedSink, SourceContext, SourceInfo,
};
use crate::host::TokenSource;
use crate::tokens::{ExpansionStack, MixedToken, Span, Token, TokenKind};

/// Hard ceiling on nested rewrites. Hygiene already bounds well-formed
/// inputs; this catches pathological nesting like deeply self-applied
/// function-like calls.
pub const MAX_EXPANSION_DEPTH: usize = 128;

// ============================================================================
// MACRO TABLE
// ============================================================================

/// Formal parameter list of a function-like macro.
#[derive(Debug, Clone, Default)]
pub struct MacroParams {
    pub names: Vec<String>,
    pub variadic: bool,
}

/// A macro definition with its classified body. Argument slots are numbered
/// 0..names.len(), with the variadic rest slot last when present.
#[derive(Debug, Clone, Serialize)]
pub struct MacroInfo {
    pub name: String,
    pub params: Vec<String>,
    pub variadic: bool,
    pub function_like: bool,
    pub body: Vec<MixedToken>,
    pub name_span: Span,
}

impl MacroInfo {
    /// Number of argument slots an invocation must fill.
    pub fn slot_count(&self) -> usize {
        self.params.len() + usize::from(self.variadic)
    }

    fn param_index(&self, ident: &str) -> Option<usize> {
        if let Some(i) = self.params.iter().position(|p| p == ident) {
            return Some(i);
        }
        if self.variadic && ident == "__VA_ARGS__" {
            return Some(self.params.len());
        }
        None
    }

    /// Human-readable replacement list, used by the macro-table dump.
    pub fn body_spelling(&self) -> String {
        let mut parts = Vec::new();
        for tok in &self.body {
            match tok {
                MixedToken::Arg { index, .. } => {
                    let name = if *index < self.params.len() {
                        self.params[*index].as_str()
                    } else {
                        "__VA_ARGS__"
                    };
                    parts.push(name.to_string());
                }
                other => {
                    if let Some(t) = other.token() {
                        if !t.is_end() {
                            parts.push(t.spelling.clone());
                        }
                    }
                }
            }
        }
        parts.join(" ")
    }
}

// ============================================================================
// TOKEN FEED - unified input for the rewrite loop
// ============================================================================

/// Where the rewrite loop pulls tokens from once its buffer runs dry:
/// a finite sequence (macro body or captured slot), or the host stream when
/// expanding at the top level. Handed-back tokens take priority, which is
/// how material after the cursor reaches a nested argument collection.
pub struct TokenFeed<'h> {
    pending: VecDeque<MixedToken>,
    seq: Option<std::vec::IntoIter<MixedToken>>,
    host: &'h mut dyn TokenSource,
    stream: bool,
}

impl<'h> TokenFeed<'h> {
    /// Feed that drains the host stream directly.
    pub fn stream(host: &'h mut dyn TokenSource) -> Self {
        TokenFeed {
            pending: VecDeque::new(),
            seq: None,
            host,
            stream: true,
        }
    }

    /// Feed over a finite sequence, borrowing this feed's host for re-lexing.
    /// Synthesizes end markers once the sequence is exhausted.
    fn child(&mut self, tokens: Vec<MixedToken>) -> TokenFeed<'_> {
        TokenFeed {
            pending: VecDeque::new(),
            seq: Some(tokens.into_iter()),
            host: &mut *self.host,
            stream: false,
        }
    }

    fn next(&mut self) -> MixedToken {
        if let Some(tok) = self.pending.pop_front() {
            return tok;
        }
        if let Some(seq) = &mut self.seq {
            if let Some(tok) = seq.next() {
                return tok;
            }
        }
        if self.stream {
            MixedToken::from_stream(self.host.next_raw())
        } else {
            MixedToken::end_marker()
        }
    }

    fn peek_kind(&mut self) -> TokenKind {
        if let Some(tok) = self.pending.front() {
            return tok.kind();
        }
        if let Some(seq) = &self.seq {
            if let Some(tok) = seq.as_slice().first() {
                return tok.kind();
            }
        }
        if self.stream {
            self.host.peek().kind
        } else {
            TokenKind::EndMarker
        }
    }

    /// Returns tokens to the front of the feed, preserving order.
    fn give_back(&mut self, tokens: Vec<MixedToken>) {
        for tok in tokens.into_iter().rev() {
            self.pending.push_front(tok);
        }
    }

    /// Remaining buffered input: handed-back tokens plus the rest of a
    /// finite sequence. The host stream is never touched. Rewrites that
    /// stop early at an unbalanced delimiter use this to keep the tail.
    fn drain_rest(&mut self) -> Vec<MixedToken> {
        let mut out: Vec<MixedToken> = self.pending.drain(..).collect();
        if let Some(seq) = self.seq.take() {
            out.extend(seq);
        }
        out
    }

    fn relex(&self, spelling: &str) -> Option<Token> {
        self.host.relex(spelling)
    }

    fn drain_pending(&mut self) -> Vec<MixedToken> {
        self.pending.drain(..).collect()
    }
}

/// Which steps of the rewrite loop are active.
#[derive(Debug, Clone, Copy)]
enum ScanMode {
    /// Substitution, recognition, and pasting all run.
    Expand,
    /// Raw capture of one call-site argument: only delimiter tracking runs.
    /// `comma_ends` is false while gathering a variadic rest slot.
    Collect { comma_ends: bool },
}

impl ScanMode {
    fn expands(self) -> bool {
        matches!(self, ScanMode::Expand)
    }
}

// ============================================================================
// PREPROCESSOR
// ============================================================================

/// The macro table, body cache, and dependency graph behind `next_token`.
/// Single-threaded by design: one instance per translation unit, pulled by
/// one consumer.
pub struct Preprocessor {
    definitions: HashMap<String, Rc<MacroInfo>>,
    precomputed: HashMap<String, Rc<Vec<MixedToken>>>,
    /// Names whose body pre-computation is on the call path right now.
    /// Re-entering one is a definition cycle; the occurrence is disabled
    /// exactly like a stack-blocked self-reference.
    in_progress: HashSet<String>,
    /// Set when recognition disables a name solely because its
    /// pre-computation is on the call path. A body computed under such a
    /// block depends on what happened to be in progress and is not cached.
    cycle_hit: bool,
    deps: DependencyGraph,
    expanded_out: VecDeque<Token>,
    source: SourceContext,
    sink: SharedSink,
}

impl ErrorReporting for Preprocessor {
    fn report(&self, kind: ErrorKind, span: miette::SourceSpan) -> PreprocError {
        let error_code = format!("mixpp::expand::{}", kind.code_suffix());
        PreprocError {
            kind,
            source_info: SourceInfo {
                source: self.source.to_named_source(),
                primary_span: span,
                phase: "expand".into(),
            },
            diagnostic_info: crate::errors::DiagnosticInfo {
                help: None,
                error_code,
                related: Vec::new(),
                is_warning: false,
            },
        }
    }
}

impl Preprocessor {
    pub fn new(source: SourceContext, sink: SharedSink) -> Self {
        Preprocessor {
            definitions: HashMap::new(),
            precomputed: HashMap::new(),
            in_progress: HashSet::new(),
            cycle_hit: false,
            deps: DependencyGraph::new(),
            expanded_out: VecDeque::new(),
            source,
            sink,
        }
    }

    /// Sends a ready-made diagnostic to the sink.
    pub fn emit(&self, error: PreprocError) {
        self.sink.borrow_mut().report(error);
    }

    /// Builds a diagnostic for `kind` at `span` and sends it to the sink.
    pub fn diagnose(&self, kind: ErrorKind, span: Span, warning: bool) {
        let mut error = self.report(kind, to_source_span(span));
        if warning {
            error = error.as_warning();
        }
        self.emit(error);
    }

    fn diagnose_with_definition(&self, kind: ErrorKind, span: Span, mi: &MacroInfo, warning: bool) {
        let mut error = self.report(kind, to_source_span(span)).with_related(
            to_source_span(mi.name_span),
            format!("macro '{}' defined here", mi.name),
        );
        if warning {
            error = error.as_warning();
        }
        self.emit(error);
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn macros(&self) -> impl Iterator<Item = &MacroInfo> {
        self.definitions.values().map(|rc| rc.as_ref())
    }

    // ------------------------------------------------------------------
    // Definition management
    // ------------------------------------------------------------------

    /// Installs or replaces a macro. The body is classified token by token:
    /// parameter names become argument placeholders, other identifiers
    /// become macro candidates seeded with this macro's name in their
    /// stacks, everything else is carried verbatim. Cached bodies of this
    /// macro and of everything that depends on it by name are dropped.
    pub fn define(
        &mut self,
        name: &str,
        params: Option<MacroParams>,
        body: Vec<Token>,
        name_span: Span,
    ) -> Result<(), PreprocError> {
        let (param_names, variadic, function_like) = match params {
            Some(p) => (p.names, p.variadic, true),
            None => (Vec::new(), false, false),
        };

        let mut seen = HashSet::new();
        for param in &param_names {
            if !seen.insert(param.as_str()) {
                return Err(self.report(
                    ErrorKind::DuplicateParameter {
                        macro_name: name.into(),
                        param: param.clone(),
                    },
                    to_source_span(name_span),
                ));
            }
        }

        let mut mi = MacroInfo {
            name: name.to_string(),
            params: param_names,
            variadic,
            function_like,
            body: Vec::new(),
            name_span,
        };

        let mut referenced = HashSet::new();
        let self_stack: ExpansionStack = std::iter::once(mi.name.clone()).collect();
        for tok in body {
            let mixed = if tok.kind == TokenKind::Identifier {
                match mi.param_index(&tok.spelling) {
                    Some(index) => MixedToken::arg(index, &mi.name),
                    None => {
                        referenced.insert(tok.spelling.clone());
                        MixedToken::ident(tok, self_stack.clone())
                    }
                }
            } else {
                MixedToken::literal(tok)
            };
            mi.body.push(mixed);
        }
        mi.body.push(MixedToken::end_marker());

        self.deps.remove_edges(&mi.name);
        self.deps.record_edges(&mi.name, referenced);
        for stale in self.deps.dependents_of(&mi.name) {
            self.precomputed.remove(&stale);
        }
        self.definitions.insert(mi.name.clone(), Rc::new(mi));
        Ok(())
    }

    /// Removes a macro if present. Cached bodies that mentioned the name
    /// are dropped; removing an unknown name is a no-op.
    pub fn undefine(&mut self, name: &str) -> bool {
        let existed = self.definitions.remove(name).is_some();
        for stale in self.deps.dependents_of(name) {
            self.precomputed.remove(&stale);
        }
        self.deps.remove_edges(name);
        existed
    }

    // ------------------------------------------------------------------
    // Top-level pull interface
    // ------------------------------------------------------------------

    /// Next fully expanded token. Raw tokens pass through untouched unless
    /// they head a macro invocation, in which case the invocation is
    /// expanded to a flat sequence that is drained one token at a time.
    pub fn next_token(&mut self, host: &mut dyn TokenSource) -> Token {
        loop {
            if let Some(tok) = self.expanded_out.pop_front() {
                return tok;
            }
            let raw = host.next_raw();
            if raw.kind != TokenKind::Identifier {
                return raw;
            }
            let Some(mi) = self.definitions.get(&raw.spelling).map(Rc::clone) else {
                return raw;
            };
            if mi.function_like && host.peek().kind != TokenKind::LParen {
                return raw;
            }

            let mut feed = TokenFeed::stream(host);
            let result = match self.invoke(raw, mi, &mut feed, &ExpansionStack::new(), 0) {
                Ok(tokens) | Err(tokens) => tokens,
            };
            let leftovers = feed.drain_pending();
            for tok in result.into_iter().chain(leftovers) {
                match tok.into_token() {
                    Some(t) if !t.is_end() => self.expanded_out.push_back(t),
                    Some(_) => {}
                    None => unreachable!("argument placeholder escaped a concrete invocation"),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Invocation
    // ------------------------------------------------------------------

    /// Expands one invocation of `mi` whose name token has been consumed.
    /// On a malformed call the diagnostic goes to the sink and `Err` carries
    /// the consumed tokens, with the name disabled so replaying them cannot
    /// re-trigger the call.
    fn invoke(
        &mut self,
        name_tok: Token,
        mi: Rc<MacroInfo>,
        feed: &mut TokenFeed<'_>,
        stack: &ExpansionStack,
        depth: usize,
    ) -> Result<Vec<MixedToken>, Vec<MixedToken>> {
        if depth > MAX_EXPANSION_DEPTH {
            self.diagnose_with_definition(
                ErrorKind::ExpansionTooDeep {
                    macro_name: mi.name.clone(),
                },
                name_tok.span,
                &mi,
                false,
            );
            return Err(vec![MixedToken::disabled_ident(name_tok)]);
        }

        let mut slots: Vec<Vec<MixedToken>> = Vec::new();
        let mut delims: Vec<MixedToken> = Vec::new();
        let mut lparen: Option<MixedToken> = None;

        if mi.function_like {
            let lp = feed.next();
            debug_assert!(lp.is(TokenKind::LParen), "caller must verify the '('");
            lparen = Some(lp);

            if feed.peek_kind() == TokenKind::RParen {
                delims.push(feed.next());
            } else {
                loop {
                    // Once the variadic rest slot starts, commas are content.
                    let comma_ends = !(mi.variadic && slots.len() >= mi.params.len());
                    let mut captured =
                        self.rewrite(feed, None, stack, ScanMode::Collect { comma_ends }, depth);
                    let terminator = captured.pop();
                    slots.push(captured);
                    match terminator.as_ref().map(MixedToken::kind) {
                        Some(TokenKind::Comma) => {
                            delims.push(terminator.expect("terminator present"));
                        }
                        Some(TokenKind::RParen) => {
                            delims.push(terminator.expect("terminator present"));
                            break;
                        }
                        _ => {
                            self.diagnose_with_definition(
                                ErrorKind::UntermInvocation {
                                    macro_name: mi.name.clone(),
                                },
                                name_tok.span,
                                &mi,
                                false,
                            );
                            return Err(recovery(name_tok, lparen, slots, delims));
                        }
                    }
                }
            }

            let expected = mi.slot_count();
            if slots.is_empty() && expected == 1 {
                // Empty-argument convention: M() fills one parameter with
                // an empty slot.
                slots.push(Vec::new());
            }
            if mi.variadic && slots.len() + 1 == expected {
                // Trailing variadic argument may be omitted entirely.
                slots.push(Vec::new());
            }
            if slots.len() != expected {
                let expected_desc = if mi.variadic {
                    format!("at least {}", mi.params.len())
                } else {
                    format!("exactly {}", expected)
                };
                self.diagnose_with_definition(
                    ErrorKind::ArityMismatch {
                        macro_name: mi.name.clone(),
                        expected: expected_desc,
                        actual: slots.len(),
                    },
                    name_tok.span,
                    &mi,
                    false,
                );
                return Err(recovery(name_tok, lparen, slots, delims));
            }
        }

        let mut args = MacroArgs::new(&mi.name, stack.clone(), slots);
        let body = self.precomputed_body(&mi, feed, depth);

        let mut inner_stack = stack.clone();
        inner_stack.insert(mi.name.clone());
        let fresh: Vec<MixedToken> = body.iter().map(MixedToken::fresh_instance).collect();
        let mut child = feed.child(fresh);
        let mut out = self.rewrite(&mut child, Some(&mut args), &inner_stack, ScanMode::Expand, depth + 1);
        // A body with an unbalanced ')' ends the rewrite early; the rest of
        // the body is still owed to the caller. Placeholders in that tail
        // are stamped with their raw slots.
        for tok in child.drain_rest() {
            match tok {
                MixedToken::Arg { index, ref owner, .. } if *owner == mi.name => {
                    out.extend(args.unexpanded_argument(index).iter().cloned());
                }
                other => out.push(other),
            }
        }
        drop(child);
        strip_end_markers(&mut out);
        for tok in &mut out {
            tok.add_stack(&inner_stack);
        }
        Ok(out)
    }

    /// Rewrites the body against the symbolic bundle on first use and caches
    /// the result. Redefinition of this macro or of anything it mentions by
    /// name drops the cache entry. A body whose rewrite ran into a
    /// definition cycle is returned but not cached, so each later use
    /// re-derives it outside the cycle.
    fn precomputed_body(
        &mut self,
        mi: &MacroInfo,
        feed: &mut TokenFeed<'_>,
        depth: usize,
    ) -> Rc<Vec<MixedToken>> {
        if let Some(body) = self.precomputed.get(&mi.name) {
            return Rc::clone(body);
        }
        let stack: ExpansionStack = std::iter::once(mi.name.clone()).collect();
        let mut args = MacroArgs::symbolic(&mi.name, stack.clone(), mi.slot_count());
        let outer_hit = self.cycle_hit;
        self.cycle_hit = false;
        self.in_progress.insert(mi.name.clone());
        let mut child = feed.child(mi.body.clone());
        let mut out = self.rewrite(&mut child, Some(&mut args), &stack, ScanMode::Expand, depth + 1);
        out.extend(child.drain_rest());
        drop(child);
        self.in_progress.remove(&mi.name);
        strip_end_markers(&mut out);
        let hit = self.cycle_hit;
        self.cycle_hit = outer_hit || hit;
        let body = Rc::new(out);
        if !hit {
            self.precomputed.insert(mi.name.clone(), Rc::clone(&body));
        }
        body
    }

    /// Expanded form of one argument slot, computed lazily and cached for
    /// the lifetime of this invocation. The rewrite runs under the bundle's
    /// call-site stack: the argument is expanded as it would have been at
    /// the call site, so the invoked macro's own name inside it is just
    /// another invocation. For the symbolic bundle the result is the
    /// placeholder itself, resolved: a marker for instantiation to stamp
    /// the real argument over.
    fn expanded_argument(
        &mut self,
        args: &mut MacroArgs,
        index: usize,
        feed: &mut TokenFeed<'_>,
        depth: usize,
    ) -> Vec<MixedToken> {
        if let Some(cached) = args.cached_expansion(index) {
            return cached.to_vec();
        }
        let result = if args.is_symbolic() {
            vec![MixedToken::symbolic_arg(index, args.owner(), args.site_stack())]
        } else {
            let stack = args.site_stack().clone();
            let slot = args.unexpanded_argument(index).to_vec();
            let mut child = feed.child(slot);
            let mut out = self.rewrite(&mut child, None, &stack, ScanMode::Expand, depth + 1);
            out.extend(child.drain_rest());
            drop(child);
            strip_end_markers(&mut out);
            out
        };
        args.cache_expansion(index, result.clone());
        result
    }

    // ------------------------------------------------------------------
    // The rewrite loop
    // ------------------------------------------------------------------

    /// Walks tokens from `feed`, rewriting in place, until an end marker or
    /// an unbalanced delimiter terminates the scan. The terminator is the
    /// last element of the returned buffer. `args` is the bundle placeholder
    /// substitution resolves against; collection passes `None`.
    fn rewrite(
        &mut self,
        feed: &mut TokenFeed<'_>,
        mut args: Option<&mut MacroArgs>,
        stack: &ExpansionStack,
        mode: ScanMode,
        depth: usize,
    ) -> Vec<MixedToken> {
        let mut buf: Vec<MixedToken> = Vec::new();
        let mut cursor = 0usize;
        let mut parens = 0usize;

        loop {
            if cursor == buf.len() {
                buf.push(feed.next());
            }
            if buf[cursor].is_end() {
                break;
            }

            // Placeholder substitution. Tokens adjacent to a paste operator
            // are its operands and must stay unexpanded.
            if mode.expands()
                && buf[cursor].needs_substitution()
                && peek_kind_after(&buf, cursor, feed) != TokenKind::HashHash
            {
                match &buf[cursor] {
                    MixedToken::Ident { .. } => {
                        buf[cursor].set_expanded();
                        continue;
                    }
                    MixedToken::Arg { index, owner, .. } => {
                        let owned = args
                            .as_deref()
                            .is_some_and(|a| a.owner() == owner.as_str());
                        if owned {
                            let index = *index;
                            let bundle = args
                                .as_deref_mut()
                                .expect("ownership was just checked against the bundle");
                            let replacement =
                                self.expanded_argument(bundle, index, feed, depth);
                            buf.splice(cursor..cursor + 1, replacement);
                            // Cursor stays put: spliced tokens are
                            // reconsidered, an empty result removes the
                            // position entirely.
                            continue;
                        }
                        // A placeholder of some other macro resolves at that
                        // macro's own instantiation; treat as settled here.
                        buf[cursor].set_expanded();
                        continue;
                    }
                    MixedToken::Literal { .. } => unreachable!("literals never substitute"),
                }
            }

            match buf[cursor].kind() {
                TokenKind::LParen => {
                    parens += 1;
                    cursor += 1;
                    continue;
                }
                TokenKind::RParen => {
                    if parens == 0 {
                        break;
                    }
                    parens -= 1;
                    cursor += 1;
                    continue;
                }
                TokenKind::Comma
                    if parens == 0 && matches!(mode, ScanMode::Collect { comma_ends: true }) =>
                {
                    break;
                }
                _ => {}
            }

            if !mode.expands() {
                cursor += 1;
                continue;
            }

            // Macro recognition.
            if buf[cursor].is_macro_candidate() {
                if peek_kind_after(&buf, cursor, feed) == TokenKind::HashHash {
                    // Paste operand; never expanded.
                    cursor += 1;
                    continue;
                }
                let name = buf[cursor]
                    .ident_name()
                    .expect("candidate is an identifier")
                    .to_string();
                if let Some(mi) = self.definitions.get(&name).map(Rc::clone) {
                    let callable = !mi.function_like
                        || peek_kind_after(&buf, cursor, feed) == TokenKind::LParen;
                    let painted =
                        stack.contains(&name) || buf[cursor].stack_contains(&name);
                    let cycle = !painted && self.in_progress.contains(&name);
                    if painted || cycle {
                        if cycle {
                            self.cycle_hit = true;
                        }
                        if callable {
                            self.diagnose_with_definition(
                                ErrorKind::DisabledExpansion {
                                    macro_name: name.clone(),
                                },
                                buf[cursor].span(),
                                &mi,
                                true,
                            );
                        }
                        buf[cursor].disable();
                        cursor += 1;
                        continue;
                    }
                    if callable {
                        let tail: Vec<MixedToken> = buf.drain(cursor + 1..).collect();
                        feed.give_back(tail);
                        let name_tok = buf[cursor]
                            .token()
                            .expect("candidate carries a token")
                            .clone();
                        let result = match self.invoke(name_tok, mi, feed, stack, depth + 1) {
                            Ok(tokens) | Err(tokens) => tokens,
                        };
                        buf.splice(cursor..cursor + 1, result);
                        continue;
                    }
                }
                cursor += 1;
                continue;
            }

            // Token pasting.
            if buf[cursor].is(TokenKind::HashHash) {
                self.rewrite_paste(&mut buf, &mut cursor, args.as_deref(), stack, feed);
                continue;
            }

            cursor += 1;
        }
        buf
    }

    /// Handles one `##` at `buf[cursor]`. Adjusts buffer and cursor in
    /// place; the caller just continues its loop.
    fn rewrite_paste(
        &self,
        buf: &mut Vec<MixedToken>,
        cursor: &mut usize,
        args: Option<&MacroArgs>,
        stack: &ExpansionStack,
        feed: &mut TokenFeed<'_>,
    ) {
        // An operator with a missing operand is dropped.
        let next_ends = matches!(
            peek_kind_after(buf, *cursor, feed),
            TokenKind::EndMarker | TokenKind::Eof
        );
        if *cursor == 0 || next_ends {
            buf.remove(*cursor);
            return;
        }

        let prev = buf.remove(*cursor - 1);
        *cursor -= 1;
        let next = if *cursor + 1 < buf.len() {
            buf.remove(*cursor + 1)
        } else {
            feed.next()
        };

        let left = operand_tokens(&prev, args);
        let right = operand_tokens(&next, args);
        let (Some(left), Some(right)) = (left, right) else {
            // An operand belongs to an enclosing macro's argument space.
            // Restore everything and step past; the owning instantiation
            // resolves it.
            buf.insert(*cursor, prev);
            *cursor += 1;
            buf.insert(*cursor + 1, next);
            *cursor += 2;
            return;
        };

        let left_len = left.len();
        let right_len = right.len();
        buf.splice(*cursor..*cursor, left);
        *cursor += left_len;
        buf.splice(*cursor + 1..*cursor + 1, right);

        if left_len == 0 || right_len == 0 {
            // An elided operand dissolves the operator; whatever remains of
            // the other side stands on its own.
            buf.remove(*cursor);
            return;
        }

        let lhs_ok = buf[*cursor - 1].is_concrete();
        let rhs_ok = buf[*cursor + 1].is_concrete();
        if !(lhs_ok && rhs_ok) {
            // Unresolved placeholders adjacent to the operator: defer the
            // paste to a later pass.
            *cursor += 2;
            return;
        }

        let lhs = buf[*cursor - 1]
            .token()
            .expect("concrete token")
            .clone();
        let rhs = buf[*cursor + 1]
            .token()
            .expect("concrete token")
            .clone();
        match self.paste(&lhs, &rhs, feed) {
            Some(merged) => {
                let merged = if merged.kind == TokenKind::Identifier {
                    MixedToken::pasted_ident(merged, stack.clone())
                } else {
                    MixedToken::literal(merged)
                };
                buf.splice(*cursor - 1..*cursor + 2, std::iter::once(merged));
                // Reconsider the merged token; it may name a macro.
                *cursor -= 1;
            }
            None => {
                // Bad paste: keep the operands adjacent, drop the operator.
                buf.remove(*cursor);
            }
        }
    }

    /// Concatenates two spellings into one token, or reports a bad paste.
    /// Identifier-identifier pastes skip the host round trip; everything
    /// else is re-lexed to see whether a single token comes back.
    fn paste(&self, lhs: &Token, rhs: &Token, feed: &TokenFeed<'_>) -> Option<Token> {
        let spelling = format!("{}{}", lhs.spelling, rhs.spelling);
        let span = Span::new(lhs.span.start, rhs.span.end);
        if lhs.kind == TokenKind::Identifier && rhs.kind == TokenKind::Identifier {
            return Some(Token::new(TokenKind::Identifier, spelling, span));
        }
        match feed.relex(&spelling) {
            Some(mut tok) => {
                if tok.kind == TokenKind::HashHash {
                    // '#' ## '#' spells the operator but must not act as one.
                    tok.kind = TokenKind::Unknown;
                }
                tok.span = span;
                Some(tok)
            }
            None => {
                self.diagnose(
                    ErrorKind::BadPaste {
                        lhs: lhs.spelling.clone(),
                        rhs: rhs.spelling.clone(),
                    },
                    span,
                    false,
                );
                None
            }
        }
    }
}

/// Lookahead one position past the cursor, reaching into the feed when the
/// buffer has nothing there yet.
fn peek_kind_after(buf: &[MixedToken], cursor: usize, feed: &mut TokenFeed<'_>) -> TokenKind {
    if cursor + 1 < buf.len() {
        buf[cursor + 1].kind()
    } else {
        feed.peek_kind()
    }
}

/// Unexpanded form of a paste operand: a concrete token is itself, an own
/// placeholder is its raw slot, a foreign placeholder is unresolvable here.
fn operand_tokens(tok: &MixedToken, args: Option<&MacroArgs>) -> Option<Vec<MixedToken>> {
    match tok {
        MixedToken::Literal { .. } | MixedToken::Ident { .. } => Some(vec![tok.clone()]),
        MixedToken::Arg { index, owner, .. } => match args {
            Some(bundle) if bundle.owner() == owner => {
                if bundle.is_symbolic() {
                    None
                } else {
                    Some(bundle.unexpanded_argument(*index).to_vec())
                }
            }
            _ => None,
        },
    }
}

fn strip_end_markers(tokens: &mut Vec<MixedToken>) {
    while tokens.last().is_some_and(MixedToken::is_end) {
        tokens.pop();
    }
}

/// Reassembles the consumed tokens of an abandoned invocation so the caller
/// can splice them back in, the name disabled at the front.
fn recovery(
    name_tok: Token,
    lparen: Option<MixedToken>,
    slots: Vec<Vec<MixedToken>>,
    delims: Vec<MixedToken>,
) -> Vec<MixedToken> {
    let mut out = vec![MixedToken::disabled_ident(name_tok)];
    out.extend(lparen);
    let mut delims = delims.into_iter();
    for slot in slots {
        out.extend(slot);
        out.extend(delims.next());
    }
    out.extend(delims);
    out.retain(|tok| !tok.is_end());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::collected_sink;
    use crate::host::Lexer;

    fn engine() -> Preprocessor {
        Preprocessor::new(SourceContext::fallback("engine test"), collected_sink())
    }

    fn tok(kind: TokenKind, spelling: &str) -> Token {
        Token::new(kind, spelling, Span::default())
    }

    #[test]
    fn define_classifies_the_body() {
        let mut pp = engine();
        pp.define(
            "SQ",
            Some(MacroParams {
                names: vec!["x".into()],
                variadic: false,
            }),
            vec![
                tok(TokenKind::LParen, "("),
                tok(TokenKind::Identifier, "x"),
                tok(TokenKind::Identifier, "y"),
                tok(TokenKind::RParen, ")"),
            ],
            Span::default(),
        )
        .unwrap();

        let mi = pp.macros().next().unwrap();
        assert!(matches!(mi.body[0], MixedToken::Literal { .. }));
        assert!(matches!(mi.body[1], MixedToken::Arg { index: 0, .. }));
        assert!(matches!(mi.body[2], MixedToken::Ident { .. }));
        assert!(mi.body[2].stack_contains("SQ"));
        assert!(mi.body.last().unwrap().is_end());
    }

    #[test]
    fn duplicate_parameters_are_rejected() {
        let mut pp = engine();
        let err = pp
            .define(
                "M",
                Some(MacroParams {
                    names: vec!["a".into(), "a".into()],
                    variadic: false,
                }),
                vec![],
                Span::default(),
            )
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::DuplicateParameter { .. }));
    }

    #[test]
    fn variadic_slot_is_numbered_last() {
        let mut pp = engine();
        pp.define(
            "V",
            Some(MacroParams {
                names: vec!["a".into()],
                variadic: true,
            }),
            vec![
                tok(TokenKind::Identifier, "a"),
                tok(TokenKind::Identifier, "__VA_ARGS__"),
            ],
            Span::default(),
        )
        .unwrap();
        let mi = pp.macros().next().unwrap();
        assert_eq!(mi.slot_count(), 2);
        assert!(matches!(mi.body[0], MixedToken::Arg { index: 0, .. }));
        assert!(matches!(mi.body[1], MixedToken::Arg { index: 1, .. }));
    }

    #[test]
    fn redefinition_drops_dependent_caches() {
        let mut pp = engine();
        pp.define("N", None, vec![tok(TokenKind::Number, "1")], Span::default())
            .unwrap();
        pp.define(
            "M",
            None,
            vec![tok(TokenKind::Identifier, "N")],
            Span::default(),
        )
        .unwrap();

        // Prime both caches.
        let mut lexer = Lexer::new("M");
        assert_eq!(pp.next_token(&mut lexer).spelling, "1");
        assert!(pp.precomputed.contains_key("M"));

        pp.define("N", None, vec![tok(TokenKind::Number, "2")], Span::default())
            .unwrap();
        assert!(!pp.precomputed.contains_key("M"));
        assert!(!pp.precomputed.contains_key("N"));
    }

    #[test]
    fn cycle_members_are_not_cached() {
        let mut pp = engine();
        pp.define(
            "A",
            None,
            vec![tok(TokenKind::Identifier, "B")],
            Span::default(),
        )
        .unwrap();
        pp.define(
            "B",
            None,
            vec![tok(TokenKind::Identifier, "A")],
            Span::default(),
        )
        .unwrap();

        let mut lexer = Lexer::new("A");
        assert_eq!(pp.next_token(&mut lexer).spelling, "A");
        assert!(!pp.precomputed.contains_key("A"));
        assert!(!pp.precomputed.contains_key("B"));
    }

    #[test]
    fn undefine_is_idempotent() {
        let mut pp = engine();
        pp.define("M", None, vec![], Span::default()).unwrap();
        assert!(pp.undefine("M"));
        assert!(!pp.undefine("M"));
        assert!(!pp.is_defined("M"));
    }

    #[test]
    fn precomputed_body_is_reused() {
        let mut pp = engine();
        pp.define(
            "TWICE",
            Some(MacroParams {
                names: vec!["x".into()],
                variadic: false,
            }),
            vec![
                tok(TokenKind::Identifier, "x"),
                tok(TokenKind::Identifier, "x"),
            ],
            Span::default(),
        )
        .unwrap();

        let mut lexer = Lexer::new("TWICE(1) TWICE(2)");
        let mut spellings = Vec::new();
        loop {
            let t = pp.next_token(&mut lexer);
            if t.kind == TokenKind::Eof {
                break;
            }
            spellings.push(t.spelling);
        }
        assert_eq!(spellings, vec!["1", "1", "2", "2"]);
        // One cache entry serving both invocations.
        let cached = pp.precomputed.get("TWICE").unwrap();
        assert_eq!(cached.len(), 2);
        assert!(matches!(cached[0], MixedToken::Arg { index: 0, .. }));
    }
}
