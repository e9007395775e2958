//! Command sending with bounded retry and a transient offline queue.
//!
//! Every command samples the connection state atomically before touching
//! the socket. Failures retry with exponential backoff up to the command's
//! `max_retries`; what happens after exhaustion (queue vs fail) and whether
//! an unsendable command queues at all is decided per command type by
//! [`policy_for`]:
//!
//! | Command                                      | retries | queues |
//! |----------------------------------------------|---------|--------|
//! | `supervisor.command` / `cancel` / `clear_context` | 3  | yes    |
//! | `supervisor.create/terminate/list_sessions`  | 3       | yes    |
//! | `session.execute` / `cancel`                 | 3       | yes    |
//! | `session.subscribe`                          | 3       | yes    |
//! | `session.unsubscribe`                        | 1       | no     |
//! | `session.input`                              | 3       | yes    |
//! | `session.resize`                             | 1       | no (only latest matters) |
//! | `session.replay` / `history.request` / `sync`| 3       | yes    |
//! | `audio.request`                              | 3       | yes    |
//!
//! The queue is FIFO and bounded at 50 (oldest dropped on overflow);
//! entries expire after 60 s. It drains when the connection becomes
//! sendable again, sequentially with 100 ms spacing, and drained commands
//! re-run with queueing disabled so a flapping link cannot loop them back
//! in forever.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tiflis_protocol::{ClientMessage, Inbound};

use crate::connection::CommandTransport;

/// Queue capacity.
pub const QUEUE_LIMIT: usize = 50;
/// Queued entries older than this are purged when the queue drains.
pub const QUEUE_ENTRY_TTL: Duration = Duration::from_secs(60);
/// Spacing between drained sends.
pub const DRAIN_SPACING: Duration = Duration::from_millis(100);
/// Retry backoff floor.
const RETRY_MIN_DELAY: Duration = Duration::from_millis(500);
/// Retry backoff ceiling.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(4);

/// Per-command retry/queue policy: `(max_retries, should_queue)`.
pub fn policy_for(message: &ClientMessage) -> (u32, bool) {
    match message {
        ClientMessage::SessionUnsubscribe { .. } | ClientMessage::SessionResize { .. } => (1, false),
        ClientMessage::Connect { .. }
        | ClientMessage::Auth { .. }
        | ClientMessage::Heartbeat { .. } => (1, false),
        _ => (3, true),
    }
}

/// One command hand-off to the sender.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub message: Inbound,
    pub max_retries: u32,
    pub should_queue: bool,
    /// Label used in logs only.
    pub debug_name: String,
}

impl CommandConfig {
    /// Build a config with the policy-table defaults for the message type.
    pub fn new(message: ClientMessage) -> Self {
        let (max_retries, should_queue) = policy_for(&message);
        Self {
            debug_name: message.type_name().to_string(),
            message: Inbound::new(message),
            max_retries,
            should_queue,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.message.id = Some(id.into());
        self
    }
}

/// Why a send gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// Connection was not in a sendable state and the command doesn't queue.
    NotAuthenticated,
    MaxRetriesExceeded,
    Cancelled,
}

/// Result of [`CommandSender::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    Queued,
    Failure(SendFailure),
}

struct QueuedCommand {
    config: CommandConfig,
    enqueued_at: tokio::time::Instant,
}

/// Retrying, queueing command pipeline over a [`CommandTransport`].
pub struct CommandSender<T: CommandTransport> {
    transport: Arc<T>,
    queue: Mutex<VecDeque<QueuedCommand>>,
    cancel: CancellationToken,
}

impl<T: CommandTransport> CommandSender<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            queue: Mutex::new(VecDeque::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancellation signal observed between retry attempts.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of commands waiting for reconnect.
    pub fn pending_command_count(&self) -> usize {
        self.lock_queue().len()
    }

    /// Send one command per its config.
    pub async fn send(&self, config: CommandConfig) -> SendOutcome {
        let mut attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return SendOutcome::Failure(SendFailure::Cancelled);
            }

            // One atomic sample decides queue-or-send.
            if !self.transport.state().is_sendable() {
                return if config.should_queue {
                    self.enqueue(config);
                    SendOutcome::Queued
                } else {
                    SendOutcome::Failure(SendFailure::NotAuthenticated)
                };
            }

            match self.transport.send_frame(config.message.clone()) {
                Ok(()) => return SendOutcome::Success,
                Err(e) => {
                    debug!("{} send failed: {e}", config.debug_name);
                    if attempts + 1 >= config.max_retries {
                        return if config.should_queue {
                            self.enqueue(config);
                            SendOutcome::Queued
                        } else {
                            SendOutcome::Failure(SendFailure::MaxRetriesExceeded)
                        };
                    }
                    let delay = RETRY_MIN_DELAY
                        .saturating_mul(2u32.saturating_pow(attempts))
                        .min(RETRY_MAX_DELAY);
                    attempts += 1;
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel.cancelled() => {
                            return SendOutcome::Failure(SendFailure::Cancelled);
                        }
                    }
                }
            }
        }
    }

    /// Flush the queue after the connection becomes sendable. Expired
    /// entries are purged; the rest re-send sequentially with 100 ms
    /// spacing and queueing disabled.
    pub async fn drain(&self) {
        loop {
            // Nothing drains while unsendable — entries stay put for the
            // next reconnect (or until they expire).
            if !self.transport.state().is_sendable() {
                return;
            }
            let next = {
                let mut queue = self.lock_queue();
                loop {
                    match queue.pop_front() {
                        Some(entry) if entry.enqueued_at.elapsed() > QUEUE_ENTRY_TTL => {
                            debug!("Dropping expired queued {}", entry.config.debug_name);
                        }
                        other => break other,
                    }
                }
            };
            let Some(entry) = next else { return };

            let enqueued_at = entry.enqueued_at;
            let mut config = entry.config;
            config.should_queue = false;
            let outcome = self.send(config.clone()).await;
            if outcome == SendOutcome::Failure(SendFailure::NotAuthenticated) {
                // Connection flapped mid-drain; put the entry back where it
                // was and stop.
                self.lock_queue().push_front(QueuedCommand {
                    config,
                    enqueued_at,
                });
                return;
            }
            if outcome != SendOutcome::Success {
                debug!("Drained command did not go through: {outcome:?}");
            }
            tokio::select! {
                () = tokio::time::sleep(DRAIN_SPACING) => {}
                () = self.cancel.cancelled() => return,
            }
        }
    }

    /// Drop queued commands targeting one session.
    pub fn cancel_pending_for_session(&self, session_id: &str) {
        let mut queue = self.lock_queue();
        let before = queue.len();
        queue.retain(|entry| entry.config.message.session_id() != Some(session_id));
        let dropped = before - queue.len();
        if dropped > 0 {
            debug!("Cancelled {dropped} queued command(s) for {session_id}");
        }
    }

    /// Empty the queue entirely.
    pub fn cancel_all(&self) {
        self.lock_queue().clear();
    }

    fn enqueue(&self, config: CommandConfig) {
        let mut queue = self.lock_queue();
        if queue.len() >= QUEUE_LIMIT {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    "Command queue full, dropping oldest ({})",
                    dropped.config.debug_name
                );
            }
        }
        queue.push_back(QueuedCommand {
            config,
            enqueued_at: tokio::time::Instant::now(),
        });
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedCommand>> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::connection::ConnectionState;

    struct MockTransport {
        state: Mutex<ConnectionState>,
        sent: Mutex<Vec<Inbound>>,
        failures_remaining: AtomicU32,
    }

    impl MockTransport {
        fn new(state: ConnectionState) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(state),
                sent: Mutex::new(Vec::new()),
                failures_remaining: AtomicU32::new(0),
            })
        }

        fn set_state(&self, state: ConnectionState) {
            *self.state.lock().unwrap() = state;
        }

        fn fail_next(&self, n: u32) {
            self.failures_remaining.store(n, Ordering::SeqCst);
        }

        fn sent_types(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|f| f.message.type_name().to_string())
                .collect()
        }
    }

    impl CommandTransport for MockTransport {
        fn state(&self) -> ConnectionState {
            self.state.lock().unwrap().clone()
        }

        fn send_frame(&self, frame: Inbound) -> Result<(), String> {
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err("transport down".to_string());
            }
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn execute(session: &str) -> CommandConfig {
        CommandConfig::new(ClientMessage::SessionExecute {
            session_id: session.into(),
            message_id: uuid::Uuid::new_v4().simple().to_string(),
            content: "ls".into(),
        })
    }

    fn resize(session: &str, cols: u16, rows: u16) -> CommandConfig {
        CommandConfig::new(ClientMessage::SessionResize {
            session_id: session.into(),
            cols,
            rows,
        })
    }

    #[test]
    fn policy_table_matches_spec_of_each_command() {
        let cases: Vec<(ClientMessage, u32, bool)> = vec![
            (
                ClientMessage::SupervisorCommand {
                    message_id: "m".into(),
                    content: "x".into(),
                },
                3,
                true,
            ),
            (ClientMessage::SupervisorCancel, 3, true),
            (ClientMessage::SupervisorClearContext, 3, true),
            (
                ClientMessage::SessionExecute {
                    session_id: "s".into(),
                    message_id: "m".into(),
                    content: "x".into(),
                },
                3,
                true,
            ),
            (
                ClientMessage::SessionCancel {
                    session_id: "s".into(),
                },
                3,
                true,
            ),
            (
                ClientMessage::SessionSubscribe {
                    session_id: "s".into(),
                },
                3,
                true,
            ),
            (
                ClientMessage::SessionUnsubscribe {
                    session_id: "s".into(),
                },
                1,
                false,
            ),
            (
                ClientMessage::SessionInput {
                    session_id: "s".into(),
                    data: "x".into(),
                },
                3,
                true,
            ),
            (
                ClientMessage::SessionResize {
                    session_id: "s".into(),
                    cols: 80,
                    rows: 24,
                },
                1,
                false,
            ),
            (
                ClientMessage::SessionReplay {
                    session_id: "s".into(),
                    since_sequence: None,
                    since_timestamp: None,
                    limit: None,
                },
                3,
                true,
            ),
            (
                ClientMessage::HistoryRequest {
                    session_id: "s".into(),
                    before_sequence: None,
                    limit: None,
                },
                3,
                true,
            ),
            (ClientMessage::Sync { lightweight: false }, 3, true),
        ];
        for (message, retries, queues) in cases {
            let name = message.type_name();
            assert_eq!(policy_for(&message), (retries, queues), "policy of {name}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_and_drain_round_trip() {
        let transport = MockTransport::new(ConnectionState::Disconnected);
        let sender = CommandSender::new(Arc::clone(&transport));

        let outcome = sender.send(execute("claude-abc12345")).await;
        assert_eq!(outcome, SendOutcome::Queued);
        assert_eq!(sender.pending_command_count(), 1);
        assert!(transport.sent_types().is_empty());

        transport.set_state(ConnectionState::Verified);
        sender.drain().await;
        assert_eq!(sender.pending_command_count(), 0);
        assert_eq!(transport.sent_types(), vec!["session.execute"]);
    }

    #[tokio::test(start_paused = true)]
    async fn resize_fails_fast_and_is_never_replayed() {
        let transport = MockTransport::new(ConnectionState::Disconnected);
        let sender = CommandSender::new(Arc::clone(&transport));

        let first = sender.send(resize("terminal-deadbeef", 120, 40)).await;
        let second = sender.send(resize("terminal-deadbeef", 100, 30)).await;
        assert_eq!(first, SendOutcome::Failure(SendFailure::NotAuthenticated));
        assert_eq!(second, SendOutcome::Failure(SendFailure::NotAuthenticated));
        assert_eq!(sender.pending_command_count(), 0);

        transport.set_state(ConnectionState::Verified);
        sender.drain().await;
        assert!(transport.sent_types().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_succeed() {
        let transport = MockTransport::new(ConnectionState::Verified);
        let sender = CommandSender::new(Arc::clone(&transport));
        transport.fail_next(2);

        let outcome = sender.send(execute("claude-abc12345")).await;
        assert_eq!(outcome, SendOutcome::Success);
        assert_eq!(transport.sent_types().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_queue_when_allowed() {
        let transport = MockTransport::new(ConnectionState::Verified);
        let sender = CommandSender::new(Arc::clone(&transport));
        transport.fail_next(10);

        let outcome = sender.send(execute("claude-abc12345")).await;
        assert_eq!(outcome, SendOutcome::Queued);
        assert_eq!(sender.pending_command_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_when_not_queueable() {
        let transport = MockTransport::new(ConnectionState::Verified);
        let sender = CommandSender::new(Arc::clone(&transport));
        transport.fail_next(10);

        let outcome = sender
            .send(CommandConfig::new(ClientMessage::SessionUnsubscribe {
                session_id: "s".into(),
            }))
            .await;
        assert_eq!(outcome, SendOutcome::Failure(SendFailure::MaxRetriesExceeded));
        assert_eq!(sender.pending_command_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_is_bounded_dropping_oldest() {
        let transport = MockTransport::new(ConnectionState::Disconnected);
        let sender = CommandSender::new(Arc::clone(&transport));
        for i in 0..(QUEUE_LIMIT + 3) {
            sender.send(execute(&format!("claude-{i:08}"))).await;
        }
        assert_eq!(sender.pending_command_count(), QUEUE_LIMIT);
        // The oldest three were dropped.
        let queue = sender.lock_queue();
        assert_eq!(
            queue.front().unwrap().config.message.session_id(),
            Some("claude-00000003")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_purged_on_drain() {
        let transport = MockTransport::new(ConnectionState::Disconnected);
        let sender = CommandSender::new(Arc::clone(&transport));
        sender.send(execute("claude-abc12345")).await;

        tokio::time::advance(QUEUE_ENTRY_TTL + Duration::from_secs(1)).await;
        transport.set_state(ConnectionState::Verified);
        sender.drain().await;
        assert!(transport.sent_types().is_empty());
        assert_eq!(sender.pending_command_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_for_session_is_selective() {
        let transport = MockTransport::new(ConnectionState::Disconnected);
        let sender = CommandSender::new(Arc::clone(&transport));
        sender.send(execute("claude-aaaaaaaa")).await;
        sender.send(execute("claude-bbbbbbbb")).await;
        sender.send(execute("claude-aaaaaaaa")).await;
        assert_eq!(sender.pending_command_count(), 3);

        sender.cancel_pending_for_session("claude-aaaaaaaa");
        assert_eq!(sender.pending_command_count(), 1);

        sender.cancel_all();
        assert_eq!(sender.pending_command_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_survives_terminal_auth_error() {
        let transport = MockTransport::new(ConnectionState::Disconnected);
        let sender = CommandSender::new(Arc::clone(&transport));
        sender.send(execute("claude-abc12345")).await;

        // Bad credentials: the connection lands in error, nothing drains,
        // nothing is dropped. New credentials later pick the queue up.
        transport.set_state(ConnectionState::Error("INVALID_AUTH_KEY".into()));
        sender.drain().await;
        assert_eq!(sender.pending_command_count(), 1);
        assert!(transport.sent_types().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drained_commands_do_not_requeue() {
        let transport = MockTransport::new(ConnectionState::Disconnected);
        let sender = CommandSender::new(Arc::clone(&transport));
        sender.send(execute("claude-abc12345")).await;

        // Sendable, but the transport keeps failing: the drained command
        // must NOT loop back into the queue.
        transport.set_state(ConnectionState::Verified);
        transport.fail_next(100);
        sender.drain().await;
        assert_eq!(sender.pending_command_count(), 0);
    }
}
