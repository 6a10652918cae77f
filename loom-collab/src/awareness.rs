//! Ephemeral presence registry ("awareness").
//!
//! Each participant owns one JSON state guarded by a logical clock. A state
//! is replaced wholesale by any update carrying a newer clock, and removed by
//! a tombstone (`null` state). Nothing here is persisted.
//!
//! Encoded update layout:
//! ```text
//! varuint count
//! repeat count × { varuint client_id │ varuint clock │ varString json }
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::protocol::ProtocolError;

/// Remote states not refreshed within this window are dropped.
pub const OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: u64,
    last_updated: Instant,
}

/// Outcome of an awareness mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    /// Clients that gained a state
    pub added: Vec<u64>,
    /// Clients whose state content changed
    pub updated: Vec<u64>,
    /// Clients re-announced with identical content (heartbeats)
    pub refreshed: Vec<u64>,
    /// Clients whose state was removed
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    /// True when no client state was added, changed or removed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// True when nothing at all happened, heartbeats included.
    pub fn is_noop(&self) -> bool {
        self.is_empty() && self.refreshed.is_empty()
    }

    /// Every client that must be re-broadcast so peers converge.
    pub fn touched(&self) -> Vec<u64> {
        let mut clients = Vec::with_capacity(
            self.added.len() + self.updated.len() + self.refreshed.len() + self.removed.len(),
        );
        clients.extend_from_slice(&self.added);
        clients.extend_from_slice(&self.updated);
        clients.extend_from_slice(&self.refreshed);
        clients.extend_from_slice(&self.removed);
        clients
    }

    pub fn merge(&mut self, other: AwarenessChange) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.refreshed.extend(other.refreshed);
        self.removed.extend(other.removed);
    }
}

/// Presence registry for one document replica.
#[derive(Debug)]
pub struct Awareness {
    client_id: u64,
    states: HashMap<u64, Value>,
    meta: HashMap<u64, ClientMeta>,
}

impl Awareness {
    /// Create a registry whose local state starts as an empty object.
    pub fn new(client_id: u64) -> Self {
        let mut awareness = Self {
            client_id,
            states: HashMap::new(),
            meta: HashMap::new(),
        };
        awareness.set_local_state(Some(Value::Object(Default::default())), Instant::now());
        awareness
    }

    /// Create a registry with no local state (relay side).
    pub fn observer(client_id: u64) -> Self {
        Self {
            client_id,
            states: HashMap::new(),
            meta: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn local_state(&self) -> Option<&Value> {
        self.states.get(&self.client_id)
    }

    pub fn state(&self, client_id: u64) -> Option<&Value> {
        self.states.get(&client_id)
    }

    pub fn states(&self) -> &HashMap<u64, Value> {
        &self.states
    }

    /// Logical clock last seen for a client (0 if never seen).
    pub fn clock(&self, client_id: u64) -> u64 {
        self.meta.get(&client_id).map_or(0, |m| m.clock)
    }

    /// Replace the local state. `None` publishes a tombstone for ourselves.
    pub fn set_local_state(&mut self, state: Option<Value>, now: Instant) -> AwarenessChange {
        let id = self.client_id;
        let clock = self.meta.get(&id).map_or(0, |m| m.clock + 1);
        let prev = match &state {
            Some(value) => self.states.insert(id, value.clone()),
            None => self.states.remove(&id),
        };
        self.meta.insert(id, ClientMeta { clock, last_updated: now });

        let mut change = AwarenessChange::default();
        match (prev, state) {
            (_, None) => change.removed.push(id),
            (None, Some(_)) => change.added.push(id),
            (Some(prev), Some(next)) if prev != next => change.updated.push(id),
            (Some(_), Some(_)) => change.refreshed.push(id),
        }
        change
    }

    /// Merge an encoded update received from a peer.
    ///
    /// The whole update is decoded before anything is applied. Entries whose
    /// state is not valid JSON are skipped.
    pub fn apply_update(&mut self, update: &[u8], now: Instant) -> Result<AwarenessChange, ProtocolError> {
        let entries = decode_entries(update)?;
        let mut change = AwarenessChange::default();

        for (client_id, mut clock, raw) in entries {
            let state = match serde_json::from_slice::<Value>(raw) {
                Ok(Value::Null) => None,
                Ok(value) => Some(value),
                Err(e) => {
                    log::warn!("Skipping awareness entry of client {client_id}: {e}");
                    continue;
                }
            };

            let known = self.meta.get(&client_id).copied();
            let is_newer = known.map_or(true, |m| m.clock < clock);
            let is_tombstone_for_present = known.is_some_and(|m| m.clock == clock)
                && state.is_none()
                && self.states.contains_key(&client_id);
            if !is_newer && !is_tombstone_for_present {
                continue;
            }

            match state {
                None if client_id == self.client_id && self.local_state().is_some() => {
                    // Someone removed us while we are alive: re-assert with a newer clock
                    clock = clock.max(self.clock(client_id)) + 1;
                    change.refreshed.push(client_id);
                }
                None => {
                    if self.states.remove(&client_id).is_some() {
                        change.removed.push(client_id);
                    }
                }
                Some(value) => match self.states.insert(client_id, value.clone()) {
                    None => change.added.push(client_id),
                    Some(prev) if prev != value => change.updated.push(client_id),
                    Some(_) => change.refreshed.push(client_id),
                },
            }
            self.meta.insert(client_id, ClientMeta { clock, last_updated: now });
        }

        Ok(change)
    }

    /// Encode the given clients' states (absent ones as tombstones).
    pub fn encode_update(&self, clients: &[u64]) -> Vec<u8> {
        let mut encoder = Vec::new();
        encoder.write_var(clients.len());
        for &client_id in clients {
            let json = self
                .states
                .get(&client_id)
                .map_or_else(|| "null".to_string(), Value::to_string);
            encoder.write_var(client_id);
            encoder.write_var(self.clock(client_id));
            encoder.write_string(&json);
        }
        encoder
    }

    /// Encode tombstones for the given clients at their current clocks.
    ///
    /// Peers holding those clients drop them; our own registry is untouched.
    pub fn encode_removal(&self, clients: &[u64]) -> Vec<u8> {
        let mut encoder = Vec::new();
        encoder.write_var(clients.len());
        for &client_id in clients {
            encoder.write_var(client_id);
            encoder.write_var(self.clock(client_id));
            encoder.write_string("null");
        }
        encoder
    }

    /// Encode every known state.
    pub fn encode_full(&self) -> Vec<u8> {
        let clients: Vec<u64> = self.states.keys().copied().collect();
        self.encode_update(&clients)
    }

    /// Remove the given clients' states.
    pub fn remove_states(&mut self, clients: &[u64], now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for &client_id in clients {
            if self.states.remove(&client_id).is_none() {
                continue;
            }
            if client_id == self.client_id {
                let clock = self.clock(client_id) + 1;
                self.meta.insert(client_id, ClientMeta { clock, last_updated: now });
            }
            change.removed.push(client_id);
        }
        change
    }

    /// Remove every state except our own.
    pub fn remove_remote_states(&mut self, now: Instant) -> AwarenessChange {
        let remote: Vec<u64> = self
            .states
            .keys()
            .copied()
            .filter(|id| *id != self.client_id)
            .collect();
        self.remove_states(&remote, now)
    }

    /// Renew our own state past half the timeout and drop silent peers.
    pub fn check_outdated(&mut self, now: Instant, timeout: Duration) -> AwarenessChange {
        let mut change = AwarenessChange::default();

        let local_age = self
            .meta
            .get(&self.client_id)
            .map(|m| now.saturating_duration_since(m.last_updated));
        if let (Some(state), Some(age)) = (self.local_state().cloned(), local_age) {
            if age >= timeout / 2 {
                change.merge(self.set_local_state(Some(state), now));
            }
        }

        let stale: Vec<u64> = self
            .meta
            .iter()
            .filter(|(id, meta)| {
                **id != self.client_id
                    && now.saturating_duration_since(meta.last_updated) >= timeout
                    && self.states.contains_key(id)
            })
            .map(|(id, _)| *id)
            .collect();
        if !stale.is_empty() {
            change.merge(self.remove_states(&stale, now));
        }
        change
    }
}

/// Split an encoded update into `(client_id, clock, raw_state)` entries.
fn decode_entries(update: &[u8]) -> Result<Vec<(u64, u64, &[u8])>, ProtocolError> {
    let mut cursor = Cursor::new(update);
    let count: usize = cursor.read_var()?;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let client_id: u64 = cursor.read_var()?;
        let clock: u64 = cursor.read_var()?;
        let raw = cursor.read_buf()?;
        entries.push((client_id, clock, raw));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode_entries(entries: &[(u64, u64, &str)]) -> Vec<u8> {
        let mut encoder = Vec::new();
        encoder.write_var(entries.len());
        for &(client_id, clock, json) in entries {
            encoder.write_var(client_id);
            encoder.write_var(clock);
            encoder.write_string(json);
        }
        encoder
    }

    fn encode_entry(client_id: u64, clock: u64, json: &str) -> Vec<u8> {
        encode_entries(&[(client_id, clock, json)])
    }

    #[test]
    fn test_new_has_empty_local_state() {
        let awareness = Awareness::new(1);
        assert_eq!(awareness.local_state(), Some(&json!({})));
        assert_eq!(awareness.clock(1), 0);
    }

    #[test]
    fn test_observer_has_no_local_state() {
        let awareness = Awareness::observer(1);
        assert!(awareness.local_state().is_none());
        assert!(awareness.states().is_empty());
    }

    #[test]
    fn test_set_local_state_increments_clock() {
        let mut awareness = Awareness::new(1);
        let now = Instant::now();
        let change = awareness.set_local_state(Some(json!({"name": "alice"})), now);
        assert_eq!(change.updated, vec![1]);
        assert_eq!(awareness.clock(1), 1);

        let change = awareness.set_local_state(Some(json!({"name": "alice"})), now);
        assert_eq!(change.refreshed, vec![1]);
        assert!(change.is_empty());
    }

    #[test]
    fn test_state_propagates_between_replicas() {
        let now = Instant::now();
        let mut alice = Awareness::new(1);
        alice.set_local_state(Some(json!({"cursor": 4})), now);
        let mut bob = Awareness::new(2);

        let change = bob.apply_update(&alice.encode_update(&[1]), now).unwrap();
        assert_eq!(change.added, vec![1]);
        assert_eq!(bob.state(1), Some(&json!({"cursor": 4})));
    }

    #[test]
    fn test_older_clock_ignored() {
        let now = Instant::now();
        let mut awareness = Awareness::new(1);
        awareness.apply_update(&encode_entry(7, 5, r#"{"v":5}"#), now).unwrap();
        let change = awareness.apply_update(&encode_entry(7, 4, r#"{"v":4}"#), now).unwrap();
        assert!(change.is_noop());
        assert_eq!(awareness.state(7), Some(&json!({"v": 5})));
    }

    #[test]
    fn test_tombstone_removes_remote_state() {
        let now = Instant::now();
        let mut awareness = Awareness::new(1);
        awareness.apply_update(&encode_entry(7, 2, r#"{"v":1}"#), now).unwrap();

        // Same clock tombstone still removes a present entry
        let change = awareness.apply_update(&encode_entry(7, 2, "null"), now).unwrap();
        assert_eq!(change.removed, vec![7]);
        assert!(awareness.state(7).is_none());
        assert_eq!(awareness.clock(7), 2);
    }

    #[test]
    fn test_remote_tombstone_for_self_reasserts() {
        let now = Instant::now();
        let mut awareness = Awareness::new(1);
        let change = awareness.apply_update(&encode_entry(1, 3, "null"), now).unwrap();
        assert_eq!(change.refreshed, vec![1]);
        assert!(awareness.local_state().is_some());
        assert_eq!(awareness.clock(1), 4);
    }

    #[test]
    fn test_remove_remote_states_keeps_self() {
        let now = Instant::now();
        let mut awareness = Awareness::new(1);
        awareness.apply_update(&encode_entry(2, 1, "{}"), now).unwrap();
        awareness.apply_update(&encode_entry(3, 1, "{}"), now).unwrap();

        let mut change = awareness.remove_remote_states(now);
        change.removed.sort_unstable();
        assert_eq!(change.removed, vec![2, 3]);
        assert!(awareness.local_state().is_some());
        assert_eq!(awareness.states().len(), 1);
    }

    #[test]
    fn test_removed_state_encodes_as_null() {
        let now = Instant::now();
        let mut alice = Awareness::new(1);
        let mut bob = Awareness::new(2);
        bob.apply_update(&alice.encode_update(&[1]), now).unwrap();

        alice.set_local_state(None, now);
        let change = bob.apply_update(&alice.encode_update(&[1]), now).unwrap();
        assert_eq!(change.removed, vec![1]);
        assert!(bob.state(1).is_none());
    }

    #[test]
    fn test_removal_encoding_drops_peer_copy() {
        let now = Instant::now();
        let alice = Awareness::new(1);
        let mut bob = Awareness::new(2);
        bob.apply_update(&alice.encode_update(&[1]), now).unwrap();

        let change = bob.apply_update(&alice.encode_removal(&[1]), now).unwrap();
        assert_eq!(change.removed, vec![1]);
        assert!(alice.local_state().is_some());
    }

    #[test]
    fn test_check_outdated_renews_and_expires() {
        let start = Instant::now();
        let mut awareness = Awareness::new(1);
        awareness.apply_update(&encode_entry(9, 1, "{}"), start).unwrap();

        let change = awareness.check_outdated(start + Duration::from_secs(16), OUTDATED_TIMEOUT);
        assert_eq!(change.refreshed, vec![1]);
        assert!(awareness.state(9).is_some());

        let change = awareness.check_outdated(start + Duration::from_secs(31), OUTDATED_TIMEOUT);
        assert_eq!(change.removed, vec![9]);
        assert!(awareness.local_state().is_some());
    }

    #[test]
    fn test_first_announcement_at_clock_zero_is_accepted() {
        let now = Instant::now();
        let fresh = Awareness::new(5);
        let mut peer = Awareness::new(6);

        let change = peer.apply_update(&fresh.encode_full(), now).unwrap();
        assert_eq!(change.added, vec![5]);
        assert_eq!(peer.state(5), Some(&json!({})));

        // The same announcement again is a noop
        assert!(peer.apply_update(&fresh.encode_full(), now).unwrap().is_noop());
    }

    #[test]
    fn test_unknown_tombstone_is_not_reported() {
        let mut awareness = Awareness::observer(1);
        let change = awareness.apply_update(&encode_entry(8, 0, "null"), Instant::now()).unwrap();
        assert!(change.is_noop());
        assert_eq!(awareness.clock(8), 0);
    }

    #[test]
    fn test_invalid_json_entry_skipped() {
        let mut awareness = Awareness::new(1);
        let update = encode_entries(&[(2, 1, r#"{"a":1}"#), (3, 1, "{not json"), (4, 1, r#"{"b":2}"#)]);

        let mut change = awareness.apply_update(&update, Instant::now()).unwrap();
        change.added.sort_unstable();
        assert_eq!(change.added, vec![2, 4]);
        assert!(awareness.state(3).is_none());
    }

    #[test]
    fn test_truncated_update_applies_nothing() {
        let mut awareness = Awareness::new(1);
        let mut update = encode_entries(&[(2, 1, "{}"), (3, 1, "{}")]);
        update.truncate(update.len() - 1);

        assert_eq!(awareness.apply_update(&update, Instant::now()), Err(ProtocolError::UnexpectedEnd));
        assert!(awareness.state(2).is_none());
    }
}
