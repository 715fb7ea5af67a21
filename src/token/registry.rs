//! Registry of outstanding tokens, keyed by exchange

use super::Token;
use crate::error::{MqttError, MqttResult};
use crate::protocol::{Message, Publish};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct RegistryState {
    tokens: HashMap<String, Token>,
    closed_reason: Option<MqttError>,
}

/// Per-connection map from exchange key to token
///
/// After [`TokenRegistry::quiesce`] every `save_token` fails with the given
/// reason until [`TokenRegistry::open`] is called, so sends racing a
/// shutdown fail fast instead of registering into a dying session.
#[derive(Default)]
pub struct TokenRegistry {
    state: Mutex<RegistryState>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `token` under `key`, replacing any previous entry
    pub fn save_token(&self, token: &Token, key: &str) -> MqttResult<()> {
        let mut state = self.state();
        if let Some(reason) = &state.closed_reason {
            return Err(reason.clone());
        }
        token.set_key(key);
        state.tokens.insert(key.to_string(), token.clone());
        debug!(key, count = state.tokens.len(), "Saved token");
        Ok(())
    }

    /// Register `token` for the exchange `message` starts
    pub fn save_token_for(&self, token: &Token, message: &Message) -> MqttResult<()> {
        let id = message.message_id();
        if id != 0 {
            token.set_message_id(id);
        }
        self.save_token(token, &message.key())
    }

    /// Delivery token for a publish read back from the durable store
    ///
    /// Returns the existing token when one is still registered, so a caller
    /// waiting on the original delivery keeps waiting on the replay.
    pub fn restore_token(&self, publish: &Publish) -> Token {
        let key = publish.message_id.to_string();
        let mut state = self.state();
        if let Some(existing) = state.tokens.get(&key) {
            return existing.clone();
        }
        let token = Token::delivery();
        token.set_key(&key);
        token.set_message_id(publish.message_id);
        token.set_message(publish.clone());
        state.tokens.insert(key, token.clone());
        token
    }

    /// Put a token back under its existing key, even while quiesced
    pub fn reinstate_token(&self, token: &Token) {
        let key = token.key();
        if key.is_empty() {
            return;
        }
        self.state().tokens.insert(key, token.clone());
    }

    pub fn get_token(&self, key: &str) -> Option<Token> {
        self.state().tokens.get(key).cloned()
    }

    pub fn get_token_for(&self, message: &Message) -> Option<Token> {
        self.get_token(&message.key())
    }

    pub fn remove_token(&self, key: &str) -> Option<Token> {
        self.state().tokens.remove(key)
    }

    pub fn remove_token_for(&self, message: &Message) -> Option<Token> {
        self.remove_token(&message.key())
    }

    /// Reject further registrations with `reason`
    pub fn quiesce(&self, reason: MqttError) {
        debug!(reason = %reason, "Quiescing token registry");
        self.state().closed_reason = Some(reason);
    }

    /// Accept registrations again
    pub fn open(&self) {
        self.state().closed_reason = None;
    }

    pub fn count(&self) -> usize {
        self.state().tokens.len()
    }

    pub fn outstanding_tokens(&self) -> Vec<Token> {
        self.state().tokens.values().cloned().collect()
    }

    /// Delivery tokens whose outcome has not yet reached the user
    pub fn outstanding_delivery_tokens(&self) -> Vec<Token> {
        self.state()
            .tokens
            .values()
            .filter(|t| t.is_delivery() && !t.is_notified())
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        debug!("Clearing token registry");
        self.state().tokens.clear();
    }
}
