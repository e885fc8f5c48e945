//! Session relay: pairs participants by session id and forwards their
//! signaling payloads. Payloads are never inspected.

pub mod client;
pub mod server;

use crate::error::{Error, Result};
use crate::session::SessionId;
use crate::signaling::{RelayEvent, SignalingChannel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type EventTx = mpsc::UnboundedSender<RelayEvent>;

struct Member {
    id: u64,
    tx: EventTx,
}

#[derive(Default)]
struct RelayInner {
    next_member: u64,
    sessions: HashMap<SessionId, Vec<Member>>,
    directory: BTreeMap<String, SessionId>,
}

/// Shared membership state of the relay. Clones refer to the same relay.
#[derive(Clone, Default)]
pub struct Relay {
    inner: Arc<Mutex<RelayInner>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay with one pre-allocated session per name.
    pub fn with_directory<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let relay = Self::new();
        {
            let mut inner = relay.inner.lock();
            for name in names {
                let id = SessionId::generate();
                let name = name.into();
                info!(%name, session = %id, "named session created");
                inner.directory.insert(name, id);
            }
        }
        relay
    }

    pub fn directory(&self) -> BTreeMap<String, SessionId> {
        self.inner.lock().directory.clone()
    }

    /// Number of sessions with at least one member.
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn member_count(&self, session: &SessionId) -> usize {
        self.inner
            .lock()
            .sessions
            .get(session)
            .map_or(0, |members| members.len())
    }

    /// Joins the session named by `requested`, or a freshly allocated one
    /// when `requested` is missing or malformed.
    pub fn connect(&self, requested: Option<&str>) -> SessionHandle {
        let (session, allocated) = SessionId::resolve(requested);
        let (tx, rx) = mpsc::unbounded_channel();

        let (member, others) = {
            let mut inner = self.inner.lock();
            inner.next_member += 1;
            let member = inner.next_member;

            if allocated {
                let _ = tx.send(RelayEvent::Session { id: session.clone() });
                if !inner.directory.is_empty() {
                    let _ = tx.send(RelayEvent::Directory {
                        sessions: inner.directory.clone(),
                    });
                }
            }

            let members = inner.sessions.entry(session.clone()).or_default();
            let others: Vec<EventTx> = members.iter().map(|m| m.tx.clone()).collect();
            members.push(Member { id: member, tx });
            (member, others)
        };

        if others.len() >= 2 {
            warn!(session = %session, members = others.len() + 1, "session has more than two members");
        }
        for tx in &others {
            let _ = tx.send(RelayEvent::ConnectedPeer);
        }
        info!(session = %session, allocated, peers = others.len(), "participant joined");

        SessionHandle {
            relay: self.clone(),
            session,
            member,
            allocated,
            joined_at: Utc::now(),
            events: rx,
            left: false,
        }
    }

    /// Delivers `event` to every member of `session` except `from`.
    /// Returns the number of recipients.
    fn broadcast(&self, session: &SessionId, from: u64, event: RelayEvent) -> usize {
        let targets: Vec<EventTx> = {
            let inner = self.inner.lock();
            inner
                .sessions
                .get(session)
                .map(|members| {
                    members
                        .iter()
                        .filter(|m| m.id != from)
                        .map(|m| m.tx.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        targets
            .iter()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }

    fn remove(&self, session: &SessionId, member: u64) {
        let mut inner = self.inner.lock();
        if let Some(members) = inner.sessions.get_mut(session) {
            members.retain(|m| m.id != member);
            if members.is_empty() {
                inner.sessions.remove(session);
            }
        }
    }
}

/// One participant's membership in a session.
///
/// Dropping the handle leaves the session.
pub struct SessionHandle {
    relay: Relay,
    session: SessionId,
    member: u64,
    allocated: bool,
    joined_at: DateTime<Utc>,
    events: mpsc::UnboundedReceiver<RelayEvent>,
    left: bool,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    /// True when the relay generated the id; the host should persist it.
    pub fn was_allocated(&self) -> bool {
        self.allocated
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    /// Forwards `payload` verbatim to the other members.
    pub fn relay(&self, payload: Value) -> Result<usize> {
        if self.left {
            return Err(Error::ChannelClosed);
        }
        let delivered = self
            .relay
            .broadcast(&self.session, self.member, RelayEvent::Signal { data: payload });
        debug!(session = %self.session, delivered, "payload relayed");
        Ok(delivered)
    }

    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }

    /// Leaves the session and notifies the remaining members. Idempotent.
    pub fn leave(&mut self) {
        if std::mem::replace(&mut self.left, true) {
            return;
        }
        self.relay.remove(&self.session, self.member);
        let notified = self
            .relay
            .broadcast(&self.session, self.member, RelayEvent::DisconnectedPeer);
        self.events.close();
        let stayed = Utc::now() - self.joined_at;
        info!(
            session = %self.session,
            notified,
            stayed_ms = stayed.num_milliseconds(),
            "participant left"
        );
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.leave();
    }
}

#[async_trait]
impl SignalingChannel for SessionHandle {
    async fn send(&self, payload: Value) -> Result<()> {
        self.relay(payload).map(|_| ())
    }

    async fn recv(&mut self) -> Option<RelayEvent> {
        SessionHandle::recv(self).await
    }

    async fn close(&mut self) -> Result<()> {
        self.leave();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn allocated_session_is_announced_first() {
        let relay = Relay::with_directory(["lobby"]);
        let mut handle = relay.connect(None);
        assert!(handle.was_allocated());

        let first = handle.recv().await.unwrap();
        assert_eq!(
            first,
            RelayEvent::Session {
                id: handle.session_id().clone()
            }
        );
        match handle.recv().await.unwrap() {
            RelayEvent::Directory { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert!(sessions.contains_key("lobby"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_id_allocates_a_new_session() {
        let relay = Relay::new();
        let handle = relay.connect(Some("12ab5"));
        assert!(handle.was_allocated());
        assert_ne!(handle.session_id().as_str(), "12ab5");
    }

    #[tokio::test]
    async fn requested_id_is_joined_without_announcement() {
        let relay = Relay::new();
        let mut a = relay.connect(Some("13579"));
        assert!(!a.was_allocated());
        assert_eq!(a.session_id().as_str(), "13579");

        let b = relay.connect(Some("#13579"));
        assert_eq!(relay.member_count(b.session_id()), 2);
        assert_eq!(a.recv().await, Some(RelayEvent::ConnectedPeer));
        assert!(a.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let relay = Relay::new();
        let mut a = relay.connect(Some("24680"));
        let mut b = relay.connect(Some("24680"));
        assert_eq!(a.recv().await, Some(RelayEvent::ConnectedPeer));

        let delivered = b.relay(json!({"candidate": {"candidate": "c"}})).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(
            a.recv().await,
            Some(RelayEvent::Signal {
                data: json!({"candidate": {"candidate": "c"}})
            })
        );
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn leaving_notifies_remaining_member_and_prunes() {
        let relay = Relay::new();
        let mut a = relay.connect(Some("11111"));
        let b = relay.connect(Some("11111"));
        assert_eq!(a.recv().await, Some(RelayEvent::ConnectedPeer));

        drop(b);
        assert_eq!(a.recv().await, Some(RelayEvent::DisconnectedPeer));
        assert_eq!(relay.member_count(a.session_id()), 1);

        a.leave();
        a.leave();
        assert_eq!(relay.session_count(), 0);
        assert!(a.relay(json!("late")).is_err());
        assert_eq!(a.recv().await, None);
    }

    #[tokio::test]
    async fn third_member_is_accepted() {
        let relay = Relay::new();
        let mut a = relay.connect(Some("22222"));
        let mut b = relay.connect(Some("22222"));
        let _c = relay.connect(Some("22222"));
        assert_eq!(relay.member_count(a.session_id()), 3);
        assert_eq!(a.recv().await, Some(RelayEvent::ConnectedPeer));
        assert_eq!(a.recv().await, Some(RelayEvent::ConnectedPeer));
        assert_eq!(b.recv().await, Some(RelayEvent::ConnectedPeer));
    }
}
