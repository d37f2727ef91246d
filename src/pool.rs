//! Shared session state: users, rooms, and the matchmaking pool.
//!
//! All four indices (`waiting`, `active`, `rooms`, `user_rooms`) live behind a
//! single reader-writer lock so every transition is atomic across them. The
//! invariants this file maintains:
//!
//! - a live user id is a key of exactly one of `waiting` / `active`;
//! - `user_rooms` has an entry for a user iff that user is in `active`;
//! - an active room's two participants are distinct, both in `active`, and
//!   point back at the room and at each other.
//!
//! Nothing in here performs I/O while the lock is held; outbound writes go
//! through a [`Connection`], whose channel send never blocks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::protocol::Envelope;

/// Where a live user currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Waiting,
    Connected,
    #[allow(dead_code)]
    Disconnected,
}

/// Call progression inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Ringing,
    Answered,
    Ended,
    #[allow(dead_code)]
    Failed,
}

/// Failed write on a closed connection.
#[derive(Debug, thiserror::Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// One client's outbound channel plus liveness bookkeeping.
///
/// Writes are serialized by the session's sender task draining the channel in
/// order, so frames pushed here arrive at the peer in push order. After
/// [`close`](Connection::close) every further [`send`](Connection::send) fails.
pub struct Connection {
    pub user_id: String,
    sender: UnboundedSender<Envelope>,
    last_seen: StdMutex<Instant>,
    active: watch::Sender<bool>,
}

impl Connection {
    pub fn new(user_id: String, sender: UnboundedSender<Envelope>) -> Self {
        Self {
            user_id,
            sender,
            last_seen: StdMutex::new(Instant::now()),
            active: watch::Sender::new(true),
        }
    }

    /// Queue a frame for delivery. Fails once the connection is closed or the
    /// session's sender task is gone.
    pub fn send(&self, envelope: Envelope) -> Result<(), ConnectionClosed> {
        if !self.is_active() {
            return Err(ConnectionClosed);
        }
        self.sender.send(envelope).map_err(|_| ConnectionClosed)
    }

    /// Record liveness; called on every inbound frame.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Close the connection. Idempotent; the first call wakes the read loop.
    pub fn close(&self) {
        if self.active.send_replace(false) {
            tracing::debug!(user_id = %self.user_id, "connection closed");
        }
    }

    /// Resolves once [`close`](Connection::close) has been called.
    pub async fn wait_closed(&self) {
        let mut active = self.active.subscribe();
        // wait_for checks the current value first, so a close that already
        // happened resolves immediately
        let _ = active.wait_for(|live| !*live).await;
    }
}

/// A participant in one signaling session.
pub struct User {
    pub id: String,
    pub token: String,
    #[allow(dead_code)]
    pub status: UserStatus,
    #[allow(dead_code)]
    pub connected_at: DateTime<Utc>,
    pub conn: Arc<Connection>,
    #[allow(dead_code)]
    pub partner_id: Option<String>,
    #[allow(dead_code)]
    pub room_id: Option<String>,
    #[allow(dead_code)]
    pub call_state: CallState,
}

impl User {
    pub fn new(id: String, token: String, conn: Arc<Connection>) -> Self {
        Self {
            id,
            token,
            status: UserStatus::Waiting,
            connected_at: Utc::now(),
            conn,
            partner_id: None,
            room_id: None,
            call_state: CallState::Idle,
        }
    }
}

/// A paired session. The pool owns the room; users refer to it by id only.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub user1_id: String,
    pub user2_id: String,
    #[allow(dead_code)]
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub call_state: CallState,
    #[allow(dead_code)]
    pub started_at: Option<DateTime<Utc>>,
    #[allow(dead_code)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Room {
    /// The participant that is not `user_id`.
    pub fn other(&self, user_id: &str) -> &str {
        if self.user1_id == user_id {
            &self.user2_id
        } else {
            &self.user1_id
        }
    }
}

/// Snapshot of a user's current partner, taken under the pool lock.
pub struct PartnerInfo {
    pub id: String,
    pub room_id: String,
    pub conn: Arc<Connection>,
}

/// Pool counters for the stats endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub waiting_users: usize,
    pub active_users: usize,
    pub active_rooms: usize,
}

#[derive(Default)]
struct PoolInner {
    waiting: HashMap<String, User>,
    active: HashMap<String, User>,
    rooms: HashMap<String, Room>,
    user_rooms: HashMap<String, String>,
}

impl PoolInner {
    /// Remove `user_id` from every index. Shared by [`UserPool::remove`] and
    /// the reaper; callers hold the write lock.
    fn remove(&mut self, user_id: &str) {
        if let Some(room_id) = self.user_rooms.remove(user_id) {
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.is_active = false;
                let partner_id = room.other(user_id).to_string();
                self.user_rooms.remove(&partner_id);
            }
            self.rooms.remove(&room_id);
        }
        self.waiting.remove(user_id);
        self.active.remove(user_id);
    }
}

/// The process-wide matchmaking pool.
pub struct UserPool {
    inner: RwLock<PoolInner>,
    shutdown: AtomicBool,
}

impl UserPool {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PoolInner::default()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Install a freshly accepted user into the waiting pool.
    pub async fn add_waiting(&self, mut user: User) {
        let mut inner = self.inner.write().await;
        user.status = UserStatus::Waiting;
        user.connected_at = Utc::now();
        inner.waiting.insert(user.id.clone(), user);
    }

    /// Pick any waiting user other than `exclude`. Selection order is map
    /// iteration order; callers must not rely on which user wins a race.
    pub async fn pick_waiting_partner(&self, exclude: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .waiting
            .keys()
            .find(|id| id.as_str() != exclude)
            .cloned()
    }

    /// Atomically pair two waiting users into a fresh room.
    ///
    /// This is the only transition that moves users from `waiting` to
    /// `active`. Returns the room and the callee's connection, or `None`
    /// without touching any state if either user is no longer waiting —
    /// the caller lost a pairing race and should fall back to waiting.
    pub async fn create_room(
        &self,
        caller_id: &str,
        callee_id: &str,
    ) -> Option<(Room, Arc<Connection>)> {
        let mut inner = self.inner.write().await;
        if caller_id == callee_id {
            return None;
        }
        let mut caller = inner.waiting.remove(caller_id)?;
        let Some(mut callee) = inner.waiting.remove(callee_id) else {
            // lost the race for the callee; put the caller back untouched
            inner.waiting.insert(caller.id.clone(), caller);
            return None;
        };

        let room_id = Uuid::new_v4().to_string();

        caller.status = UserStatus::Connected;
        caller.partner_id = Some(callee.id.clone());
        caller.room_id = Some(room_id.clone());
        caller.call_state = CallState::Idle;

        callee.status = UserStatus::Connected;
        callee.partner_id = Some(caller.id.clone());
        callee.room_id = Some(room_id.clone());
        callee.call_state = CallState::Idle;

        let room = Room {
            id: room_id.clone(),
            user1_id: caller.id.clone(),
            user2_id: callee.id.clone(),
            created_at: Utc::now(),
            is_active: true,
            call_state: CallState::Idle,
            started_at: None,
            ended_at: None,
        };

        let callee_conn = callee.conn.clone();
        inner.user_rooms.insert(caller.id.clone(), room_id.clone());
        inner.user_rooms.insert(callee.id.clone(), room_id.clone());
        inner.active.insert(caller.id.clone(), caller);
        inner.active.insert(callee.id.clone(), callee);
        inner.rooms.insert(room_id, room.clone());

        Some((room, callee_conn))
    }

    /// Current partner of `user_id` via its active room, if any.
    pub async fn find_partner(&self, user_id: &str) -> Option<PartnerInfo> {
        let inner = self.inner.read().await;
        let room_id = inner.user_rooms.get(user_id)?;
        let room = inner.rooms.get(room_id)?;
        if !room.is_active {
            return None;
        }
        let partner = inner.active.get(room.other(user_id))?;
        Some(PartnerInfo {
            id: partner.id.clone(),
            room_id: room_id.clone(),
            conn: partner.conn.clone(),
        })
    }

    /// Recycle a user whose partner disappeared back into the waiting pool.
    pub async fn move_to_waiting(&self, user_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(mut user) = inner.active.remove(user_id) {
            user.status = UserStatus::Waiting;
            user.partner_id = None;
            user.room_id = None;
            inner.waiting.insert(user_id.to_string(), user);
        }
    }

    /// Remove a user from all indices, retiring any room it belonged to.
    /// Idempotent.
    pub async fn remove(&self, user_id: &str) {
        let mut inner = self.inner.write().await;
        inner.remove(user_id);
    }

    /// Update one user's call state.
    pub async fn set_call_state(&self, user_id: &str, state: CallState) {
        let mut inner = self.inner.write().await;
        if let Some(user) = inner.active.get_mut(user_id) {
            user.call_state = state;
        }
    }

    /// Update both partners' call state in one transition.
    pub async fn set_call_states(&self, a: &str, b: &str, state: CallState) {
        let mut inner = self.inner.write().await;
        if let Some(user) = inner.active.get_mut(a) {
            user.call_state = state;
        }
        if let Some(user) = inner.active.get_mut(b) {
            user.call_state = state;
        }
    }

    /// An answer was relayed: both participants and the room move to
    /// answered, and the room records its start time.
    pub async fn mark_call_answered(&self, user_id: &str) {
        let mut inner = self.inner.write().await;
        let Some(room_id) = inner.user_rooms.get(user_id).cloned() else {
            return;
        };
        if let Some(room) = inner.rooms.get_mut(&room_id) {
            room.call_state = CallState::Answered;
            room.started_at = Some(Utc::now());
            let partner_id = room.other(user_id).to_string();
            if let Some(partner) = inner.active.get_mut(&partner_id) {
                partner.call_state = CallState::Answered;
            }
        }
        if let Some(user) = inner.active.get_mut(user_id) {
            user.call_state = CallState::Answered;
        }
    }

    /// A call ended: both participants and the room move to ended, and the
    /// room records its end time.
    pub async fn mark_call_ended(&self, user_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(room_id) = inner.user_rooms.get(user_id).cloned() {
            if let Some(room) = inner.rooms.get_mut(&room_id) {
                room.call_state = CallState::Ended;
                room.ended_at = Some(Utc::now());
                let partner_id = room.other(user_id).to_string();
                if let Some(partner) = inner.active.get_mut(&partner_id) {
                    partner.call_state = CallState::Ended;
                }
            }
        }
        if let Some(user) = inner.active.get_mut(user_id) {
            user.call_state = CallState::Ended;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.read().await;
        PoolStats {
            waiting_users: inner.waiting.len(),
            active_users: inner.active.len(),
            active_rooms: inner.rooms.len(),
        }
    }

    /// Sweep out sessions whose liveness lapsed past `cutoff`. Closing the
    /// connection wakes the session's read loop, whose own teardown is then a
    /// no-op against the already-cleared indices. Returns how many sessions
    /// were reaped.
    pub async fn reap_idle(&self, cutoff: Duration) -> usize {
        let Some(deadline) = Instant::now().checked_sub(cutoff) else {
            return 0;
        };
        let mut inner = self.inner.write().await;

        let lapsed: Vec<String> = inner
            .waiting
            .values()
            .chain(inner.active.values())
            .filter(|user| user.conn.last_seen() < deadline)
            .map(|user| user.id.clone())
            .collect();

        for user_id in &lapsed {
            let conn = inner
                .waiting
                .get(user_id)
                .or_else(|| inner.active.get(user_id))
                .map(|user| user.conn.clone());
            inner.remove(user_id);
            if let Some(conn) = conn {
                conn.close();
            }
            tracing::info!(user_id = %user_id, "reaped idle session");
        }
        lapsed.len()
    }

    /// Close every live connection; each session's read loop then runs its
    /// normal teardown. Used during process shutdown.
    pub async fn close_all(&self) {
        self.shutdown.store(true, Ordering::Release);
        let inner = self.inner.read().await;
        for user in inner.waiting.values().chain(inner.active.values()) {
            user.conn.close();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) async fn dump(&self) -> PoolDump {
        let inner = self.inner.read().await;
        PoolDump {
            waiting: inner.waiting.keys().cloned().collect(),
            active: inner.active.keys().cloned().collect(),
            rooms: inner.rooms.values().cloned().collect(),
            user_rooms: inner.user_rooms.clone(),
            call_states: inner
                .active
                .values()
                .map(|user| (user.id.clone(), user.call_state))
                .collect(),
        }
    }
}

impl Default for UserPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) struct PoolDump {
    pub waiting: Vec<String>,
    pub active: Vec<String>,
    pub rooms: Vec<Room>,
    pub user_rooms: HashMap<String, String>,
    pub call_states: HashMap<String, CallState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_user(id: &str) -> (User, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(id.to_string(), tx));
        (User::new(id.to_string(), format!("token-{id}"), conn), rx)
    }

    /// Cross-check the pool's indices against each other.
    async fn check_consistency(pool: &UserPool) {
        let dump = pool.dump().await;
        for id in &dump.waiting {
            assert!(!dump.active.contains(id), "{id} in both waiting and active");
            assert!(!dump.user_rooms.contains_key(id), "waiting {id} has a room");
        }
        for (id, room_id) in &dump.user_rooms {
            assert!(dump.active.contains(id), "{id} has a room but is not active");
            let room = dump
                .rooms
                .iter()
                .find(|r| &r.id == room_id)
                .expect("binding points at a live room");
            assert!(room.user1_id == *id || room.user2_id == *id);
        }
        for room in dump.rooms.iter().filter(|r| r.is_active) {
            assert_ne!(room.user1_id, room.user2_id);
            assert!(dump.active.contains(&room.user1_id));
            assert!(dump.active.contains(&room.user2_id));
            assert_eq!(dump.user_rooms.get(&room.user1_id), Some(&room.id));
            assert_eq!(dump.user_rooms.get(&room.user2_id), Some(&room.id));
        }
    }

    #[tokio::test]
    async fn solo_user_has_no_partner_to_pick() {
        let pool = UserPool::new();
        let (alice, _rx) = test_user("alice");
        pool.add_waiting(alice).await;

        assert_eq!(pool.pick_waiting_partner("alice").await, None);
        let stats = pool.stats().await;
        assert_eq!(stats.waiting_users, 1);
        assert_eq!(stats.active_users, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn pairing_moves_both_users_to_active() {
        let pool = UserPool::new();
        let (alice, _arx) = test_user("alice");
        let (bob, _brx) = test_user("bob");
        pool.add_waiting(alice).await;
        pool.add_waiting(bob).await;

        let partner = pool.pick_waiting_partner("alice").await.unwrap();
        assert_eq!(partner, "bob");

        let (room, callee_conn) = pool.create_room("alice", &partner).await.unwrap();
        assert_eq!(callee_conn.user_id, "bob");
        assert!(room.is_active);
        assert_eq!(room.call_state, CallState::Idle);

        let stats = pool.stats().await;
        assert_eq!(stats.waiting_users, 0);
        assert_eq!(stats.active_users, 2);
        assert_eq!(stats.active_rooms, 1);

        // cross-pointers
        let alice_partner = pool.find_partner("alice").await.unwrap();
        assert_eq!(alice_partner.id, "bob");
        assert_eq!(alice_partner.room_id, room.id);
        let bob_partner = pool.find_partner("bob").await.unwrap();
        assert_eq!(bob_partner.id, "alice");

        check_consistency(&pool).await;
    }

    #[tokio::test]
    async fn losing_a_pairing_race_changes_nothing() {
        let pool = UserPool::new();
        let (alice, _arx) = test_user("alice");
        let (bob, _brx) = test_user("bob");
        let (carol, _crx) = test_user("carol");
        pool.add_waiting(alice).await;
        pool.add_waiting(bob).await;
        pool.add_waiting(carol).await;

        assert!(pool.create_room("alice", "bob").await.is_some());
        // bob is gone from waiting, so carol's attempt must fail cleanly
        assert!(pool.create_room("carol", "bob").await.is_none());
        assert!(pool.create_room("carol", "carol").await.is_none());

        let stats = pool.stats().await;
        assert_eq!(stats.waiting_users, 1);
        assert_eq!(stats.active_users, 2);
        assert_eq!(stats.active_rooms, 1);
        check_consistency(&pool).await;
    }

    #[tokio::test]
    async fn remove_retires_the_room_and_both_bindings() {
        let pool = UserPool::new();
        let (alice, _arx) = test_user("alice");
        let (bob, _brx) = test_user("bob");
        pool.add_waiting(alice).await;
        pool.add_waiting(bob).await;
        pool.create_room("alice", "bob").await.unwrap();

        pool.remove("alice").await;

        // bob keeps his session but no longer resolves a partner
        assert!(pool.find_partner("bob").await.is_none());
        let dump = pool.dump().await;
        assert!(dump.active.contains(&"bob".to_string()));
        assert!(dump.user_rooms.is_empty());
        assert!(dump.rooms.is_empty());

        // removing again is a no-op
        pool.remove("alice").await;
        check_consistency(&pool).await;
    }

    #[tokio::test]
    async fn move_to_waiting_makes_user_matchable_again() {
        let pool = UserPool::new();
        let (alice, _arx) = test_user("alice");
        let (bob, _brx) = test_user("bob");
        pool.add_waiting(alice).await;
        pool.add_waiting(bob).await;
        pool.create_room("alice", "bob").await.unwrap();

        pool.remove("alice").await;
        pool.move_to_waiting("bob").await;

        let dump = pool.dump().await;
        assert!(dump.waiting.contains(&"bob".to_string()));
        assert!(dump.active.is_empty());

        let (carol, _crx) = test_user("carol");
        pool.add_waiting(carol).await;
        assert_eq!(pool.pick_waiting_partner("carol").await.as_deref(), Some("bob"));
        assert!(pool.create_room("carol", "bob").await.is_some());
        check_consistency(&pool).await;
    }

    #[tokio::test]
    async fn answer_marks_room_started() {
        let pool = UserPool::new();
        let (alice, _arx) = test_user("alice");
        let (bob, _brx) = test_user("bob");
        pool.add_waiting(alice).await;
        pool.add_waiting(bob).await;
        pool.create_room("alice", "bob").await.unwrap();

        pool.set_call_states("alice", "bob", CallState::Ringing).await;
        pool.mark_call_answered("bob").await;

        let dump = pool.dump().await;
        let room = &dump.rooms[0];
        assert_eq!(room.call_state, CallState::Answered);
        assert!(room.started_at.is_some());
        assert!(room.ended_at.is_none());

        pool.mark_call_ended("alice").await;
        let dump = pool.dump().await;
        assert_eq!(dump.rooms[0].call_state, CallState::Ended);
        assert!(dump.rooms[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn reaper_removes_lapsed_sessions() {
        let pool = UserPool::new();
        let (alice, _arx) = test_user("alice");
        let (bob, _brx) = test_user("bob");
        let (carol, _crx) = test_user("carol");
        let stale_conn = alice.conn.clone();
        let bob_conn = bob.conn.clone();
        let carol_conn = carol.conn.clone();
        pool.add_waiting(alice).await;
        pool.add_waiting(bob).await;
        pool.add_waiting(carol).await;
        pool.create_room("bob", "carol").await.unwrap();

        // alice goes quiet while bob and carol keep proving liveness
        tokio::time::sleep(Duration::from_millis(50)).await;
        bob_conn.touch();
        carol_conn.touch();

        let reaped = pool.reap_idle(Duration::from_millis(20)).await;
        assert_eq!(reaped, 1);
        assert!(!stale_conn.is_active());
        assert!(bob_conn.is_active());

        let stats = pool.stats().await;
        assert_eq!(stats.waiting_users, 0);
        assert_eq!(stats.active_users, 2);
        check_consistency(&pool).await;
    }

    #[tokio::test]
    async fn reaper_retires_rooms_of_lapsed_active_users() {
        let pool = UserPool::new();
        let (alice, _arx) = test_user("alice");
        let (bob, _brx) = test_user("bob");
        let bob_conn = bob.conn.clone();
        pool.add_waiting(alice).await;
        pool.add_waiting(bob).await;
        pool.create_room("alice", "bob").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        bob_conn.touch();
        assert_eq!(pool.reap_idle(Duration::from_millis(20)).await, 1);

        assert!(pool.find_partner("bob").await.is_none());
        check_consistency(&pool).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pairing_is_atomic() {
        let pool = Arc::new(UserPool::new());
        const N: usize = 10;
        let mut receivers = Vec::new();
        for i in 0..N {
            let (user, rx) = test_user(&format!("user-{i}"));
            pool.add_waiting(user).await;
            receivers.push(rx);
        }

        let mut tasks = Vec::new();
        for i in 0..N {
            let pool = pool.clone();
            let id = format!("user-{i}");
            tasks.push(tokio::spawn(async move {
                if let Some(partner) = pool.pick_waiting_partner(&id).await {
                    pool.create_room(&id, &partner).await.is_some()
                } else {
                    false
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stats = pool.stats().await;
        assert_eq!(stats.waiting_users + stats.active_users, N);
        assert_eq!(stats.active_users % 2, 0);
        assert_eq!(stats.active_rooms, stats.active_users / 2);
        check_consistency(&pool).await;
    }

    #[tokio::test]
    async fn closed_connection_rejects_writes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new("alice".into(), tx);

        conn.send(Envelope::new(crate::protocol::ServerMessage::Ping))
            .unwrap();
        assert!(rx.recv().await.is_some());

        conn.close();
        conn.close(); // second close is a no-op
        assert!(!conn.is_active());
        assert!(conn.send(Envelope::new(crate::protocol::ServerMessage::Ping)).is_err());

        // wait_closed resolves even when close happened first
        conn.wait_closed().await;
    }
}
