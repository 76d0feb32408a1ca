use std::time::Duration;

use rivulet_protocol::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One of the two independent state machines tracked per user. `ws_state`
/// tracks the client socket side; `rtc_state` tracks the peer connection
/// side. Both share the same value set and transition rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubStateValue {
    Disconnected,
    AwaitingConnection,
    Connected,
    Done,
    Killed,
}

/// A substate plus its one-shot kill notification. `kill()` is idempotent:
/// once `Killed`, further transitions (including repeated kills) are no-ops.
pub struct SubState {
    value: std::sync::RwLock<SubStateValue>,
    killed: CancellationToken,
}

impl SubState {
    fn new() -> Self {
        Self {
            value: std::sync::RwLock::new(SubStateValue::Disconnected),
            killed: CancellationToken::new(),
        }
    }

    pub fn get(&self) -> SubStateValue {
        *self.value.read().expect("substate lock poisoned")
    }

    /// Set a new value. No-op once the substate is `Killed`.
    pub fn set(&self, new: SubStateValue) {
        let mut guard = self.value.write().expect("substate lock poisoned");
        if *guard == SubStateValue::Killed {
            return;
        }
        *guard = new;
    }

    /// Transition to `Killed` and fire the one-shot notification. Idempotent.
    pub fn kill(&self) {
        {
            let mut guard = self.value.write().expect("substate lock poisoned");
            if *guard == SubStateValue::Killed {
                return;
            }
            *guard = SubStateValue::Killed;
        }
        self.killed.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.is_cancelled()
    }

    /// Deliberate deviation from the distributed sweep, which only reaps
    /// `Done`: a user whose workers exited via `kill()` without ever
    /// transitioning to `Done` would otherwise linger in the registry forever.
    pub fn is_reapable(&self) -> bool {
        matches!(self.get(), SubStateValue::Done | SubStateValue::Killed)
    }

    /// Resolves once this substate is killed. Any number of callers may
    /// await this concurrently; all are woken.
    pub async fn killed(&self) {
        self.killed.cancelled().await;
    }
}

impl Default for SubState {
    fn default() -> Self {
        Self::new()
    }
}

/// The two independent per-user substates.
#[derive(Default)]
pub struct UserState {
    pub ws: SubState,
    pub rtc: SubState,
}

#[derive(Debug, Clone, Copy)]
pub struct UserTiming {
    pub disconnect_timeout: Duration,
    pub failed_timeout: Duration,
    pub keepalive_interval: Duration,
}

/// One direction of a message bus. Multiple producers may hold a clone of
/// the sender; exactly one consumer owns the receiver.
///
/// Bounded at capacity 1 as the closest tokio approximation of a true
/// zero-capacity rendezvous channel — tokio's `mpsc` has no zero-capacity
/// variant. A sender observes backpressure once the single slot is full,
/// which is adequate for the single-item-in-flight traffic this carries.
type Lane = (mpsc::Sender<Message>, mpsc::Receiver<Message>);

fn lane() -> Lane {
    mpsc::channel(1)
}

/// A bidirectional mailbox between two tasks: `client_to_server` carries
/// messages toward the owning worker's main loop, `server_to_client` carries
/// messages the worker produces for the other side to relay outward.
pub struct MessageBus {
    client_to_server_tx: mpsc::Sender<Message>,
    server_to_client_tx: mpsc::Sender<Message>,
}

impl MessageBus {
    pub async fn send_to_server(&self, msg: Message) {
        if self.client_to_server_tx.send(msg).await.is_err() {
            tracing::trace!("bus send_to_server dropped: receiver gone");
        }
    }

    pub async fn send_to_client(&self, msg: Message) {
        if self.server_to_client_tx.send(msg).await.is_err() {
            tracing::trace!("bus send_to_client dropped: receiver gone");
        }
    }
}

pub struct BusHalves {
    pub bus: MessageBus,
    pub server_rx: mpsc::Receiver<Message>,
    pub client_rx: mpsc::Receiver<Message>,
}

fn new_bus() -> BusHalves {
    let (client_to_server_tx, server_rx) = lane();
    let (server_to_client_tx, client_rx) = lane();
    BusHalves {
        bus: MessageBus {
            client_to_server_tx,
            server_to_client_tx,
        },
        server_rx,
        client_rx,
    }
}

/// A user within a session. Owned jointly by its signaling worker and peer
/// worker — neither has exclusive ownership, and the user does not
/// back-reference its session (the registry walks sessions to find users).
pub struct User {
    pub session_id: u32,
    pub uid: String,
    pub timing: UserTiming,
    pub state: UserState,
    pub ws_bus: MessageBus,
    pub rtc_bus: MessageBus,
}

/// Receivers handed off to the tasks that consume each bus direction.
/// `rtc_client_rx` is unused in the current design — nothing pushes toward
/// the peer worker's client-facing lane yet — but is kept so a future
/// data-channel feature has somewhere to land without a bus redesign.
pub struct UserHandles {
    pub user: std::sync::Arc<User>,
    pub ws_server_rx: mpsc::Receiver<Message>,
    pub ws_client_rx: mpsc::Receiver<Message>,
    pub rtc_server_rx: mpsc::Receiver<Message>,
    pub rtc_client_rx: mpsc::Receiver<Message>,
}

impl User {
    pub fn new(session_id: u32, uid: String, timing: UserTiming) -> UserHandles {
        let ws = new_bus();
        let rtc = new_bus();

        let user = std::sync::Arc::new(User {
            session_id,
            uid,
            timing,
            state: UserState::default(),
            ws_bus: ws.bus,
            rtc_bus: rtc.bus,
        });

        UserHandles {
            user,
            ws_server_rx: ws.server_rx,
            ws_client_rx: ws.client_rx,
            rtc_server_rx: rtc.server_rx,
            rtc_client_rx: rtc.client_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substate_starts_disconnected() {
        let s = SubState::new();
        assert_eq!(s.get(), SubStateValue::Disconnected);
        assert!(!s.is_killed());
        assert!(!s.is_reapable());
    }

    #[test]
    fn kill_is_idempotent() {
        let s = SubState::new();
        s.kill();
        assert_eq!(s.get(), SubStateValue::Killed);
        s.set(SubStateValue::Connected);
        assert_eq!(s.get(), SubStateValue::Killed, "killed never regresses");
        s.kill();
        assert_eq!(s.get(), SubStateValue::Killed);
    }

    #[test]
    fn done_and_killed_are_both_reapable() {
        let done = SubState::new();
        done.set(SubStateValue::Done);
        assert!(done.is_reapable());

        let killed = SubState::new();
        killed.kill();
        assert!(killed.is_reapable());

        let connected = SubState::new();
        connected.set(SubStateValue::Connected);
        assert!(!connected.is_reapable());
    }

    #[tokio::test]
    async fn killed_future_resolves_after_kill() {
        let s = std::sync::Arc::new(SubState::new());
        let waiter = tokio::spawn({
            let s = std::sync::Arc::clone(&s);
            async move {
                s.killed().await;
            }
        });
        s.kill();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn killed_future_resolves_immediately_if_already_killed() {
        let s = SubState::new();
        s.kill();
        // Must not hang.
        tokio::time::timeout(Duration::from_millis(50), s.killed())
            .await
            .expect("killed() should resolve immediately once already cancelled");
    }

    #[tokio::test]
    async fn bus_delivers_in_fifo_order() {
        let halves = new_bus();
        let bus = halves.bus;
        let mut server_rx = halves.server_rx;

        bus.send_to_server(Message::StartRtc).await;
        bus.send_to_server(Message::IceRestart).await;

        assert_eq!(server_rx.recv().await, Some(Message::StartRtc));
        assert_eq!(server_rx.recv().await, Some(Message::IceRestart));
    }

    #[test]
    fn new_user_has_disconnected_substates() {
        let handles = User::new(1001, "alice".to_string(), UserTiming {
            disconnect_timeout: Duration::from_secs(5),
            failed_timeout: Duration::from_secs(25),
            keepalive_interval: Duration::from_secs(2),
        });
        assert_eq!(handles.user.state.ws.get(), SubStateValue::Disconnected);
        assert_eq!(handles.user.state.rtc.get(), SubStateValue::Disconnected);
        assert_eq!(handles.user.uid, "alice");
        assert_eq!(handles.user.session_id, 1001);
    }
}
