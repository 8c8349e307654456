//! The recognizer chain: ordered providers plus a current index
//!
//! The chain owns the instantiated recognizers; the adaptive router only
//! deals in names. Rotation and reordering keep the current provider
//! stable unless explicitly told to switch the primary.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::config::CaptchaConfig;
use crate::error::RecognizerError;

use super::Recognizer;
use super::registry::build_recognizer;

struct ChainState {
    names: Vec<String>,
    index: usize,
}

pub struct RecognizerChain {
    providers: HashMap<String, Arc<dyn Recognizer>>,
    state: Mutex<ChainState>,
}

impl RecognizerChain {
    /// Instantiate every configured provider eagerly; a misconfigured one
    /// fails startup (the preflight validator exists to catch this first).
    pub fn from_config(cfg: &CaptchaConfig) -> Result<Self, RecognizerError> {
        let names = cfg.chain();
        if names.is_empty() {
            return Err(RecognizerError::UnknownProvider(
                "no captcha provider configured".to_string(),
            ));
        }
        let mut providers = HashMap::new();
        for name in &names {
            providers.insert(name.clone(), build_recognizer(name, cfg)?);
        }
        Ok(Self {
            providers,
            state: Mutex::new(ChainState { names, index: 0 }),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names in current chain order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.state.lock().names.clone()
    }

    /// The current primary: `(name, recognizer)`.
    #[must_use]
    pub fn current(&self) -> (String, Arc<dyn Recognizer>) {
        let state = self.state.lock();
        let name = state.names[state.index].clone();
        let recognizer = Arc::clone(&self.providers[&name]);
        (name, recognizer)
    }

    /// Look up a provider by name (used by the probe loop).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Recognizer>> {
        self.providers.get(name).map(Arc::clone)
    }

    /// Advance the current index one step. Returns false for a chain of
    /// one, where rotation is meaningless.
    pub fn rotate(&self, reason: &str) -> bool {
        let mut state = self.state.lock();
        if state.names.len() <= 1 {
            return false;
        }
        let old = state.names[state.index].clone();
        state.index = (state.index + 1) % state.names.len();
        let new = state.names[state.index].clone();
        warn!("Rotate recognizer {old} -> {new} ({reason})");
        true
    }

    /// Apply a new order from the adaptive router. Unknown names are
    /// dropped; the current provider keeps its slot unless
    /// `switch_primary` promotes the new head.
    pub fn apply_order(&self, new_order: &[String], switch_primary: bool, reason: &str) -> bool {
        let mut state = self.state.lock();
        let order: Vec<String> = new_order
            .iter()
            .filter(|n| self.providers.contains_key(*n))
            .cloned()
            .collect();
        if order.is_empty() || order == state.names {
            return false;
        }
        let old_names = state.names.join(",");
        let old_current = state.names[state.index].clone();
        state.names = order;
        state.index = if switch_primary {
            0
        } else {
            state
                .names
                .iter()
                .position(|n| *n == old_current)
                .unwrap_or(0)
        };
        warn!(
            "Adaptive reorder ({reason}): {old_names} -> {}",
            state.names.join(",")
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&str]) -> RecognizerChain {
        // Dummy-only chains keep these tests free of vendor config.
        let mut providers: HashMap<String, Arc<dyn Recognizer>> = HashMap::new();
        for n in names {
            providers.insert(
                (*n).to_string(),
                Arc::new(super::super::registry::DummyRecognizer::new(4)),
            );
        }
        RecognizerChain {
            providers,
            state: Mutex::new(ChainState {
                names: names.iter().map(|s| (*s).to_string()).collect(),
                index: 0,
            }),
        }
    }

    #[test]
    fn test_rotate_advances_and_wraps() {
        let c = chain(&["a", "b", "c"]);
        assert!(c.rotate("test"));
        assert_eq!(c.current().0, "b");
        assert!(c.rotate("test"));
        assert!(c.rotate("test"));
        assert_eq!(c.current().0, "a");
    }

    #[test]
    fn test_rotate_single_is_noop() {
        let c = chain(&["a"]);
        assert!(!c.rotate("test"));
        assert_eq!(c.current().0, "a");
    }

    #[test]
    fn test_apply_order_keeps_current_without_switch() {
        let c = chain(&["a", "b", "c"]);
        c.rotate("test"); // current = b
        let applied = c.apply_order(
            &["c".to_string(), "b".to_string(), "a".to_string()],
            false,
            "test",
        );
        assert!(applied);
        assert_eq!(c.current().0, "b");
        assert_eq!(c.names(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_apply_order_switch_primary_takes_head() {
        let c = chain(&["a", "b"]);
        assert!(c.apply_order(&["b".to_string(), "a".to_string()], true, "test"));
        assert_eq!(c.current().0, "b");
    }

    #[test]
    fn test_apply_order_drops_unknown_names() {
        let c = chain(&["a", "b"]);
        assert!(c.apply_order(
            &["ghost".to_string(), "b".to_string(), "a".to_string()],
            true,
            "test"
        ));
        assert_eq!(c.names(), vec!["b", "a"]);
    }

    #[test]
    fn test_from_config_dummy() {
        let cfg = CaptchaConfig::default();
        let c = RecognizerChain::from_config(&cfg).unwrap();
        assert_eq!(c.names(), vec!["dummy"]);
    }
}
