//! Presence rosters for Strand channels.
//!
//! A roster maps an identity key to a [`PresenceEntry`], whose metas are the
//! identity's individual sessions. The server sends a full roster once per
//! join (`presence_state`) and incremental joins/leaves afterwards
//! (`presence_diff`). [`sync_state`] and [`sync_diff`] merge those into a new
//! roster without touching their inputs, reporting per-session joins and
//! leaves through callbacks. [`Presence`] wires the two functions to a
//! channel.
//!
//! ```rust
//! use serde_json::json;
//! use strand_client::presence::{sync_state, PresenceState};
//!
//! let incoming: PresenceState =
//!     serde_json::from_value(json!({"u1": {"metas": [{"phx_ref": "1"}]}})).unwrap();
//!
//! let mut joined = Vec::new();
//! let roster = sync_state(
//!     &PresenceState::new(),
//!     &incoming,
//!     |key, _previous, _joined| joined.push(key.to_string()),
//!     |_, _, _| {},
//! );
//! assert_eq!(roster, incoming);
//! assert_eq!(joined, ["u1"]);
//! ```

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use strand_protocol::Payload;
use tracing::{debug, trace, warn};

use crate::channel::{BindingRef, Channel};

/// Event carrying a full roster.
pub const STATE_EVENT: &str = "presence_state";

/// Event carrying incremental joins and leaves.
pub const DIFF_EVENT: &str = "presence_diff";

/// A roster: identity key to entry, ordered by key.
pub type PresenceState = BTreeMap<String, PresenceEntry>;

/// One session of an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Unique session reference assigned by the server.
    #[serde(rename = "phx_ref")]
    pub presence_ref: String,
    /// Application metadata.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Meta {
    /// A meta with no application fields.
    #[must_use]
    pub fn new(presence_ref: impl Into<String>) -> Self {
        Self {
            presence_ref: presence_ref.into(),
            fields: Map::new(),
        }
    }

    /// Attach an application field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// All sessions of one identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Sessions, newest first after a join.
    pub metas: Vec<Meta>,
    /// Fields the server attached next to `metas`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PresenceEntry {
    /// An entry with `metas` and no extra fields.
    #[must_use]
    pub fn new(metas: Vec<Meta>) -> Self {
        Self {
            metas,
            extra: Map::new(),
        }
    }

    fn refs(&self) -> HashSet<&str> {
        self.metas.iter().map(|meta| meta.presence_ref.as_str()).collect()
    }

    /// The same entry carrying only `metas`.
    fn with_metas(&self, metas: Vec<Meta>) -> Self {
        Self {
            metas,
            extra: self.extra.clone(),
        }
    }
}

/// Incremental roster change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: PresenceState,
    #[serde(default)]
    pub leaves: PresenceState,
}

/// Merge a full roster from the server into `current`.
///
/// Identities missing from `incoming` leave entirely. For identities present
/// in both, sessions are compared by reference and only the differences are
/// reported. Returns the new roster.
pub fn sync_state(
    current: &PresenceState,
    incoming: &PresenceState,
    on_join: impl FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    on_leave: impl FnMut(&str, &PresenceEntry, &PresenceEntry),
) -> PresenceState {
    let mut diff = PresenceDiff::default();

    for (key, entry) in current {
        if !incoming.contains_key(key) {
            diff.leaves.insert(key.clone(), entry.clone());
        }
    }

    for (key, new_entry) in incoming {
        let Some(current_entry) = current.get(key) else {
            diff.joins.insert(key.clone(), new_entry.clone());
            continue;
        };
        let new_refs = new_entry.refs();
        let current_refs = current_entry.refs();

        let joined: Vec<Meta> = new_entry
            .metas
            .iter()
            .filter(|meta| !current_refs.contains(meta.presence_ref.as_str()))
            .cloned()
            .collect();
        let left: Vec<Meta> = current_entry
            .metas
            .iter()
            .filter(|meta| !new_refs.contains(meta.presence_ref.as_str()))
            .cloned()
            .collect();

        if !joined.is_empty() {
            diff.joins.insert(key.clone(), new_entry.with_metas(joined));
        }
        if !left.is_empty() {
            diff.leaves.insert(key.clone(), current_entry.with_metas(left));
        }
    }

    sync_diff(current, &diff, on_join, on_leave)
}

/// Apply a diff to `current` and return the new roster.
///
/// Joined sessions go ahead of the sessions an identity already had.
/// `on_join` receives the previous entry, if any, and only the joined
/// sessions. `on_leave` receives the remaining entry and the left sessions;
/// an identity with no sessions left is removed.
pub fn sync_diff(
    current: &PresenceState,
    diff: &PresenceDiff,
    mut on_join: impl FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    mut on_leave: impl FnMut(&str, &PresenceEntry, &PresenceEntry),
) -> PresenceState {
    let mut state = current.clone();

    for (key, joined) in &diff.joins {
        let previous = state.remove(key);
        let mut merged = joined.clone();
        if let Some(previous) = &previous {
            let joined_refs = joined.refs();
            merged.metas.extend(
                previous
                    .metas
                    .iter()
                    .filter(|meta| !joined_refs.contains(meta.presence_ref.as_str()))
                    .cloned(),
            );
        }
        state.insert(key.clone(), merged);
        on_join(key, previous.as_ref(), joined);
    }

    for (key, left) in &diff.leaves {
        let Some(entry) = state.get_mut(key) else {
            continue;
        };
        let left_refs = left.refs();
        entry
            .metas
            .retain(|meta| !left_refs.contains(meta.presence_ref.as_str()));
        on_leave(key, entry, left);
        if entry.metas.is_empty() {
            state.remove(key);
        }
    }

    state
}

/// One value per identity, in key order.
pub fn list<T>(roster: &PresenceState, mut chooser: impl FnMut(&str, &PresenceEntry) -> T) -> Vec<T> {
    roster.iter().map(|(key, entry)| chooser(key, entry)).collect()
}

/// Every entry, in key order.
#[must_use]
pub fn list_entries(roster: &PresenceState) -> Vec<PresenceEntry> {
    list(roster, |_, entry| entry.clone())
}

type JoinCallback = Arc<dyn Fn(&str, Option<&PresenceEntry>, &PresenceEntry) + Send + Sync>;
type LeaveCallback = Arc<dyn Fn(&str, &PresenceEntry, &PresenceEntry) + Send + Sync>;
type SyncCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
struct Callbacks {
    join: Option<JoinCallback>,
    leave: Option<LeaveCallback>,
    sync: Option<SyncCallback>,
}

impl Callbacks {
    fn apply_state(&self, current: &PresenceState, incoming: &PresenceState) -> PresenceState {
        sync_state(
            current,
            incoming,
            |key, previous, joined| self.joined(key, previous, joined),
            |key, remaining, left| self.left(key, remaining, left),
        )
    }

    fn apply_diff(&self, current: &PresenceState, diff: &PresenceDiff) -> PresenceState {
        sync_diff(
            current,
            diff,
            |key, previous, joined| self.joined(key, previous, joined),
            |key, remaining, left| self.left(key, remaining, left),
        )
    }

    fn joined(&self, key: &str, previous: Option<&PresenceEntry>, joined: &PresenceEntry) {
        if let Some(callback) = &self.join {
            callback(key, previous, joined);
        }
    }

    fn left(&self, key: &str, remaining: &PresenceEntry, left: &PresenceEntry) {
        if let Some(callback) = &self.leave {
            callback(key, remaining, left);
        }
    }

    fn synced(&self) {
        if let Some(callback) = &self.sync {
            callback();
        }
    }
}

struct PresenceInner {
    state: PresenceState,
    pending_diffs: Vec<PresenceDiff>,
    join_ref: Option<String>,
    callbacks: Callbacks,
}

struct PresenceShared {
    channel: Channel,
    bindings: Mutex<Vec<(String, BindingRef)>>,
    inner: Mutex<PresenceInner>,
}

impl Drop for PresenceShared {
    fn drop(&mut self) {
        for (event, binding) in self.bindings.get_mut().drain(..) {
            self.channel.off(&event, Some(binding));
        }
    }
}

/// Roster kept in sync with a channel's presence events.
///
/// Diffs that arrive before the roster for the current join are held back
/// and applied right after it. Dropping the last clone unbinds it from the
/// channel.
#[derive(Clone)]
pub struct Presence {
    inner: Arc<PresenceShared>,
}

impl Presence {
    /// Track `channel` using the default `presence_state` / `presence_diff` events.
    #[must_use]
    pub fn new(channel: &Channel) -> Self {
        Self::with_events(channel, STATE_EVENT, DIFF_EVENT)
    }

    /// Track `channel` using custom event names.
    #[must_use]
    pub fn with_events(channel: &Channel, state_event: &str, diff_event: &str) -> Self {
        let inner = Arc::new(PresenceShared {
            channel: channel.clone(),
            bindings: Mutex::new(Vec::new()),
            inner: Mutex::new(PresenceInner {
                state: PresenceState::new(),
                pending_diffs: Vec::new(),
                join_ref: None,
                callbacks: Callbacks::default(),
            }),
        });

        let weak = Arc::downgrade(&inner);
        let state_binding = channel.on(state_event, move |payload| {
            if let Some(presence) = upgrade(&weak) {
                presence.handle_state(payload);
            }
        });
        let weak = Arc::downgrade(&inner);
        let diff_binding = channel.on(diff_event, move |payload| {
            if let Some(presence) = upgrade(&weak) {
                presence.handle_diff(payload);
            }
        });
        *inner.bindings.lock() = vec![
            (state_event.to_string(), state_binding),
            (diff_event.to_string(), diff_binding),
        ];

        Self { inner }
    }

    /// Run `callback` for every identity that gains sessions.
    pub fn on_join(&self, callback: impl Fn(&str, Option<&PresenceEntry>, &PresenceEntry) + Send + Sync + 'static) {
        self.inner.inner.lock().callbacks.join = Some(Arc::new(callback));
    }

    /// Run `callback` for every identity that loses sessions.
    pub fn on_leave(&self, callback: impl Fn(&str, &PresenceEntry, &PresenceEntry) + Send + Sync + 'static) {
        self.inner.inner.lock().callbacks.leave = Some(Arc::new(callback));
    }

    /// Run `callback` after every applied roster or diff.
    pub fn on_sync(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.inner.lock().callbacks.sync = Some(Arc::new(callback));
    }

    /// Current roster.
    #[must_use]
    pub fn state(&self) -> PresenceState {
        self.inner.inner.lock().state.clone()
    }

    /// Every entry, in key order.
    #[must_use]
    pub fn list(&self) -> Vec<PresenceEntry> {
        list_entries(&self.inner.inner.lock().state)
    }

    /// One value per identity, in key order.
    pub fn list_by<T>(&self, chooser: impl FnMut(&str, &PresenceEntry) -> T) -> Vec<T> {
        let state = self.state();
        list(&state, chooser)
    }

    /// Whether the roster for the channel's current join is still awaited.
    #[must_use]
    pub fn in_pending_sync_state(&self) -> bool {
        let join_ref = self.inner.inner.lock().join_ref.clone();
        join_ref.is_none() || join_ref != self.inner.channel.join_ref()
    }

    fn handle_state(&self, payload: &Payload) {
        let Some(incoming) = parse::<PresenceState>(payload) else {
            return;
        };
        let join_ref = self.inner.channel.join_ref();
        let (current, pending, callbacks) = {
            let mut inner = self.inner.inner.lock();
            inner.join_ref = join_ref;
            (
                inner.state.clone(),
                std::mem::take(&mut inner.pending_diffs),
                inner.callbacks.clone(),
            )
        };
        debug!(
            topic = %self.inner.channel.topic(),
            identities = incoming.len(),
            pending = pending.len(),
            "Presence state"
        );

        let mut state = callbacks.apply_state(&current, &incoming);
        for diff in &pending {
            state = callbacks.apply_diff(&state, diff);
        }
        self.inner.inner.lock().state = state;
        callbacks.synced();
    }

    fn handle_diff(&self, payload: &Payload) {
        let Some(diff) = parse::<PresenceDiff>(payload) else {
            return;
        };
        if self.in_pending_sync_state() {
            trace!(topic = %self.inner.channel.topic(), "Presence diff held until state arrives");
            self.inner.inner.lock().pending_diffs.push(diff);
            return;
        }

        let (current, callbacks) = {
            let inner = self.inner.inner.lock();
            (inner.state.clone(), inner.callbacks.clone())
        };
        let state = callbacks.apply_diff(&current, &diff);
        self.inner.inner.lock().state = state;
        callbacks.synced();
    }
}

fn upgrade(weak: &Weak<PresenceShared>) -> Option<Presence> {
    weak.upgrade().map(|inner| Presence { inner })
}

fn parse<T: DeserializeOwned>(payload: &Payload) -> Option<T> {
    let value = payload.as_json()?;
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("Ignoring malformed presence payload: {}", e);
            None
        }
    }
}

impl fmt::Debug for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.inner.lock();
        f.debug_struct("Presence")
            .field("topic", &self.inner.channel.topic())
            .field("identities", &inner.state.len())
            .field("pending_diffs", &inner.pending_diffs.len())
            .finish()
    }
}
