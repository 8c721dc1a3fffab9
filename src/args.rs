//! Argument bundles for function-like macro invocations.
//!
//! A bundle owns the raw token slots captured at a call site, one per formal
//! parameter, plus a per-invocation cache of their expanded forms. Slots are
//! stored exactly as captured: expansion is lazy and happens at most once per
//! slot, driven by the engine when a placeholder for that slot is first
//! substituted.
//!
//! The symbolic bundle is what makes body pre-computation possible: each slot
//! holds a single placeholder for itself, so rewriting a body against it
//! resolves everything that does not depend on real arguments and leaves
//! placeholders where arguments will be stamped in later.

use crate::tokens::{ExpansionStack, MixedToken};

#[derive(Debug)]
pub struct MacroArgs {
    owner: String,
    /// Hygiene context at the call site. Slot pre-expansion runs under this
    /// stack, not under the invoked macro's own name: a nested call of the
    /// same macro inside its argument list is an ordinary invocation.
    site_stack: ExpansionStack,
    slots: Vec<Vec<MixedToken>>,
    expanded: Vec<Option<Vec<MixedToken>>>,
    symbolic: bool,
}

impl MacroArgs {
    /// Bundle over concrete slots captured at a call site.
    pub fn new(owner: &str, site_stack: ExpansionStack, slots: Vec<Vec<MixedToken>>) -> Self {
        let expanded = vec![None; slots.len()];
        MacroArgs {
            owner: owner.to_string(),
            site_stack,
            slots,
            expanded,
            symbolic: false,
        }
    }

    /// Symbolic bundle with `count` self-describing slots.
    pub fn symbolic(owner: &str, site_stack: ExpansionStack, count: usize) -> Self {
        let slots = (0..count).map(|i| vec![MixedToken::arg(i, owner)]).collect();
        MacroArgs {
            owner: owner.to_string(),
            site_stack,
            slots,
            expanded: vec![None; count],
            symbolic: true,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn site_stack(&self) -> &ExpansionStack {
        &self.site_stack
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_symbolic(&self) -> bool {
        self.symbolic
    }

    /// Raw slot contents, exactly as captured. Out-of-range access is a
    /// caller bug, not a recoverable condition.
    pub fn unexpanded_argument(&self, index: usize) -> &[MixedToken] {
        assert!(
            index < self.slots.len(),
            "argument index {} out of range for macro '{}' ({} slot(s))",
            index,
            self.owner,
            self.slots.len()
        );
        &self.slots[index]
    }

    /// Expanded form of a slot, if this invocation has computed it already.
    pub fn cached_expansion(&self, index: usize) -> Option<&[MixedToken]> {
        assert!(
            index < self.slots.len(),
            "argument index {} out of range for macro '{}' ({} slot(s))",
            index,
            self.owner,
            self.slots.len()
        );
        self.expanded[index].as_deref()
    }

    pub fn cache_expansion(&mut self, index: usize, tokens: Vec<MixedToken>) {
        assert!(index < self.slots.len());
        self.expanded[index] = Some(tokens);
    }
}
