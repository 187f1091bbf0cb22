//! Correlation tokens and the pending-call registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

const TOKEN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::token");

/// Identifier of one outstanding command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token {
    id: Arc<str>,
}

impl Token {
    /// Wraps an explicit token id.
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self { id: id.into() }
    }

    /// Returns the wire id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Requests local cancellation.
    ///
    /// Commands cannot be withdrawn once sent, so this always returns
    /// `false`; cancellation must be expressed as a command to the remote
    /// service.
    #[must_use]
    pub const fn cancel(&self) -> bool {
        false
    }
}

impl fmt::Display for Token {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.id)
    }
}

/// Source of token ids shared by every registry of one runtime.
///
/// Ids are assigned from a monotonically increasing counter and are never
/// reused while the counter is alive.
#[derive(Debug, Clone, Default)]
pub struct TokenCounter {
    next: Arc<AtomicU64>,
}

impl TokenCounter {
    /// Issues the next token.
    #[must_use]
    pub fn next_token(&self) -> Token {
        let value = self.next.fetch_add(1, Ordering::Relaxed);
        Token::new(value.to_string())
    }
}

struct Pending<L> {
    sequence: u64,
    token: Token,
    listener: L,
}

/// Tracks commands awaiting a reply.
///
/// Each entry is resolved at most once: [`TokenRegistry::resolve`] removes
/// it, while [`TokenRegistry::progress`] leaves it in place.
pub struct TokenRegistry<L> {
    counter: TokenCounter,
    pending: HashMap<Arc<str>, Pending<L>>,
    sequence: u64,
}

impl<L> TokenRegistry<L> {
    /// Creates an empty registry drawing ids from `counter`.
    #[must_use]
    pub fn new(counter: TokenCounter) -> Self {
        Self {
            counter,
            pending: HashMap::new(),
            sequence: 0,
        }
    }

    /// Issues a fresh token and records its listener.
    pub fn new_token(&mut self, listener: L) -> Token {
        let token = self.counter.next_token();
        self.insert(token.clone(), listener);
        token
    }

    /// Records a listener under an explicit token.
    ///
    /// # Errors
    ///
    /// Hands the listener back if the id is already pending.
    pub fn register(&mut self, token: Token, listener: L) -> Result<(), L> {
        if self.pending.contains_key(token.id()) {
            return Err(listener);
        }
        self.insert(token, listener);
        Ok(())
    }

    fn insert(&mut self, token: Token, listener: L) {
        self.sequence += 1;
        self.pending.insert(
            Arc::clone(&token.id),
            Pending {
                sequence: self.sequence,
                token,
                listener,
            },
        );
    }

    /// Looks up a pending entry for an intermediate result.
    pub fn progress(&mut self, id: &str) -> Option<(&Token, &mut L)> {
        let Some(entry) = self.pending.get_mut(id) else {
            debug!(target: TOKEN_TARGET, token = id, "progress for unknown token ignored");
            return None;
        };
        Some((&entry.token, &mut entry.listener))
    }

    /// Removes and returns the entry for a final reply.
    ///
    /// Unknown ids are logged and yield `None`.
    pub fn resolve(&mut self, id: &str) -> Option<(Token, L)> {
        if let Some(entry) = self.pending.remove(id) {
            return Some((entry.token, entry.listener));
        }
        debug!(target: TOKEN_TARGET, token = id, "reply for unknown token ignored");
        None
    }

    /// Drains every pending entry in registration order.
    pub fn terminate_all(&mut self) -> Vec<(Token, L)> {
        let mut entries: Vec<Pending<L>> = self.pending.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries
            .into_iter()
            .map(|entry| (entry.token, entry.listener))
            .collect()
    }

    /// Returns `true` while `id` awaits a reply.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn registry() -> TokenRegistry<&'static str> {
        TokenRegistry::new(TokenCounter::default())
    }

    #[rstest]
    fn sequential_tokens_are_distinct(mut registry: TokenRegistry<&'static str>) {
        let ids: HashSet<String> = (0..500)
            .map(|_| registry.new_token("listener").id().to_owned())
            .collect();
        assert_eq!(ids.len(), 500);
    }

    #[rstest]
    fn registries_sharing_a_counter_never_collide() {
        let counter = TokenCounter::default();
        let mut first: TokenRegistry<()> = TokenRegistry::new(counter.clone());
        let mut second: TokenRegistry<()> = TokenRegistry::new(counter);
        let a = first.new_token(());
        let b = second.new_token(());
        assert_ne!(a, b);
    }

    #[rstest]
    fn resolving_twice_has_no_second_effect(mut registry: TokenRegistry<&'static str>) {
        let token = registry.new_token("echo");
        assert_eq!(registry.resolve(token.id()), Some((token.clone(), "echo")));
        assert_eq!(registry.resolve(token.id()), None);
        assert!(registry.is_empty());
    }

    #[rstest]
    fn progress_keeps_the_entry(mut registry: TokenRegistry<&'static str>) {
        let token = registry.new_token("stream");
        assert!(registry.progress(token.id()).is_some());
        assert!(registry.progress(token.id()).is_some());
        assert!(registry.contains(token.id()));
        assert!(registry.resolve(token.id()).is_some());
        assert!(registry.progress(token.id()).is_none());
    }

    #[rstest]
    fn unknown_ids_are_ignored(mut registry: TokenRegistry<&'static str>) {
        assert!(registry.progress("missing").is_none());
        assert!(registry.resolve("missing").is_none());
    }

    #[rstest]
    fn explicit_ids_must_be_unique(mut registry: TokenRegistry<&'static str>) {
        assert_eq!(registry.register(Token::new("a"), "first"), Ok(()));
        assert_eq!(registry.register(Token::new("a"), "second"), Err("second"));
        assert_eq!(registry.resolve("a").map(|(_, listener)| listener), Some("first"));
    }

    #[rstest]
    fn terminate_all_drains_in_registration_order(mut registry: TokenRegistry<&'static str>) {
        registry.new_token("one");
        registry.new_token("two");
        registry.new_token("three");
        let drained: Vec<&str> = registry
            .terminate_all()
            .into_iter()
            .map(|(_, listener)| listener)
            .collect();
        assert_eq!(drained, vec!["one", "two", "three"]);
        assert!(registry.is_empty());
    }

    #[rstest]
    fn cancellation_is_unsupported() {
        assert!(!Token::new("7").cancel());
    }
}
