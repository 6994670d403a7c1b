//! Host and transport fallback.
//!
//! Each connection attempt targets one host; the primary host is always
//! tried first, then fallback hosts in random order without replacement.
//! On a host, transport kinds are tried in preference order, starting with
//! the kind that last produced a working connection.

use rand::seq::SliceRandom;
use tracing::debug;

use crate::traits::TransportKind;

/// Chooses the host and transport kinds for connection attempts.
#[derive(Debug, Clone)]
pub struct TransportSelector {
    primary: String,
    fallbacks: Vec<String>,
    remaining: Vec<String>,
    primary_tried: bool,
    kinds: Vec<TransportKind>,
    preferred: Option<TransportKind>,
}

impl TransportSelector {
    /// Create a selector.
    ///
    /// `kinds` is the preference order; duplicates are ignored.
    #[must_use]
    pub fn new(
        primary: impl Into<String>,
        fallbacks: Vec<String>,
        kinds: &[TransportKind],
    ) -> Self {
        let mut ordered = Vec::new();
        for kind in kinds {
            if !ordered.contains(kind) {
                ordered.push(*kind);
            }
        }
        let mut selector = Self {
            primary: primary.into(),
            fallbacks,
            remaining: Vec::new(),
            primary_tried: false,
            kinds: ordered,
            preferred: None,
        };
        selector.reset_hosts();
        selector
    }

    /// Start a fresh pass over all hosts.
    pub fn reset_hosts(&mut self) {
        self.primary_tried = false;
        self.remaining = self.fallbacks.clone();
        self.remaining.shuffle(&mut rand::rng());
    }

    /// Skip the primary host for the rest of this pass.
    pub fn skip_primary(&mut self) {
        self.primary_tried = true;
    }

    /// Host for the next attempt, or `None` once every host was tried.
    pub fn next_host(&mut self) -> Option<String> {
        if !self.primary_tried {
            self.primary_tried = true;
            return Some(self.primary.clone());
        }
        let host = self.remaining.pop();
        if let Some(host) = &host {
            debug!(host = %host, remaining = self.remaining.len(), "Trying fallback host");
        }
        host
    }

    #[must_use]
    pub fn has_fallbacks(&self) -> bool {
        !self.fallbacks.is_empty()
    }

    /// Every host, fallbacks included, was tried in this pass.
    ///
    /// Always `false` without fallback hosts.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.has_fallbacks() && self.primary_tried && self.remaining.is_empty()
    }

    /// Transport kinds in the order to try them.
    #[must_use]
    pub fn kinds(&self) -> Vec<TransportKind> {
        let mut kinds = self.kinds.clone();
        if let Some(preferred) = self.preferred {
            if let Some(pos) = kinds.iter().position(|k| *k == preferred) {
                kinds.remove(pos);
                kinds.insert(0, preferred);
            }
        }
        kinds
    }

    /// Remember the kind that produced a working connection.
    pub fn remember(&mut self, kind: TransportKind) {
        self.preferred = Some(kind);
    }

    /// Drop the remembered kind, so the next attempt follows preference order.
    pub fn forget(&mut self) {
        self.preferred = None;
    }
}

/// Intersect the requested kinds with what can actually be built,
/// keeping the requested order.
#[must_use]
pub fn negotiate_transports(
    requested: &[TransportKind],
    supported: impl Fn(TransportKind) -> bool,
) -> Vec<TransportKind> {
    requested.iter().copied().filter(|k| supported(*k)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn fallbacks() -> Vec<String> {
        vec!["a.example.com".into(), "b.example.com".into(), "c.example.com".into()]
    }

    #[test]
    fn test_primary_first_then_each_fallback_once() {
        let mut selector =
            TransportSelector::new("main.example.com", fallbacks(), &TransportKind::ALL);

        assert_eq!(selector.next_host().as_deref(), Some("main.example.com"));
        assert!(!selector.exhausted());

        let mut seen = HashSet::new();
        while let Some(host) = selector.next_host() {
            assert!(seen.insert(host));
        }
        assert_eq!(seen.len(), 3);
        assert!(selector.exhausted());

        selector.reset_hosts();
        assert!(!selector.exhausted());
        assert_eq!(selector.next_host().as_deref(), Some("main.example.com"));
    }

    #[test]
    fn test_no_fallbacks_never_exhausted() {
        let mut selector = TransportSelector::new("main", vec![], &[TransportKind::WebSocket]);
        assert_eq!(selector.next_host().as_deref(), Some("main"));
        assert_eq!(selector.next_host(), None);
        assert!(!selector.exhausted());
    }

    #[test]
    fn test_skip_primary() {
        let mut selector = TransportSelector::new("main", vec!["fb".into()], &TransportKind::ALL);
        selector.skip_primary();
        assert_eq!(selector.next_host().as_deref(), Some("fb"));
    }

    #[test]
    fn test_preferred_kind_first() {
        let mut selector = TransportSelector::new(
            "main",
            vec![],
            &[TransportKind::WebSocket, TransportKind::CometStream, TransportKind::WebSocket],
        );
        assert_eq!(
            selector.kinds(),
            vec![TransportKind::WebSocket, TransportKind::CometStream]
        );

        selector.remember(TransportKind::CometStream);
        assert_eq!(
            selector.kinds(),
            vec![TransportKind::CometStream, TransportKind::WebSocket]
        );

        selector.forget();
        assert_eq!(selector.kinds()[0], TransportKind::WebSocket);
    }

    #[test]
    fn test_negotiate_transports() {
        let kinds = negotiate_transports(&TransportKind::ALL, |k| k != TransportKind::CometPoll);
        assert_eq!(
            kinds,
            vec![TransportKind::WebSocket, TransportKind::CometStream]
        );
        assert!(negotiate_transports(&[TransportKind::CometPoll], |_| false).is_empty());
    }
}
