use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::core::deduction::{Committed, DeductionFailure};
use crate::core::eligibility::Eligibility;
use crate::core::gate::PRICING_ROUTE;
use crate::core::generator::{GenerateRequest, HistoryTurn, ResponseGenerator};
use crate::core::models::chat::{ChatMessage, ChatSession};
use crate::core::service::CreditService;
use crate::core::telemetry::{ActivityEvent, ErrorEvent, Severity};

pub const SESSION_SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SessionStoreError {
    #[error("Failed to access session store: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize sessions: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct SessionFile {
    schema_version: u32,
    #[serde(default)]
    sessions: BTreeMap<String, ChatSession>,
}

/// Chat transcripts keyed by agent id, persisted as one JSON document.
pub struct SessionStore {
    path: Option<PathBuf>,
    sessions: Mutex<BTreeMap<String, ChatSession>>,
}

impl SessionStore {
    /// Load the store at `path`. A missing, unreadable-as-JSON or
    /// other-version file starts an empty store.
    pub fn open(path: PathBuf) -> Result<Self, SessionStoreError> {
        let sessions = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<SessionFile>(&content) {
                Ok(file) if file.schema_version == SESSION_SCHEMA_VERSION => file.sessions,
                Ok(file) => {
                    tracing::warn!(
                        path = %path.display(),
                        found = file.schema_version,
                        expected = SESSION_SCHEMA_VERSION,
                        "Discarding chat sessions with unsupported schema"
                    );
                    BTreeMap::new()
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable chat sessions");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            sessions: Mutex::new(sessions),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ChatSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub fn get(&self, agent_id: &str) -> Option<ChatSession> {
        self.lock().get(agent_id).cloned()
    }

    pub fn get_or_create(&self, agent_id: &str) -> ChatSession {
        self.lock()
            .entry(agent_id.to_string())
            .or_insert_with(|| ChatSession::new(agent_id))
            .clone()
    }

    #[cfg(test)]
    pub fn agents(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Add one message to the stored transcript for `agent_id`.
    ///
    /// Appends happen under the store lock, so concurrent sends to the same
    /// agent interleave instead of overwriting each other.
    pub fn append(&self, agent_id: &str, message: ChatMessage) -> Result<(), SessionStoreError> {
        let mut sessions = self.lock();
        sessions
            .entry(agent_id.to_string())
            .or_insert_with(|| ChatSession::new(agent_id))
            .push(message);
        self.persist(&sessions)
    }

    fn persist(&self, sessions: &BTreeMap<String, ChatSession>) -> Result<(), SessionStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = SessionFile {
            schema_version: SESSION_SCHEMA_VERSION,
            sessions: sessions.clone(),
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Notifications from the chat flow, replacing transcript polling.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    MessageSent { agent_id: String, message: ChatMessage },
    ResponseReceived { agent_id: String, message: ChatMessage },
    DeductionFailed { agent_id: String, failure: DeductionFailure },
    BalanceChanged { balance: i64 },
}

impl ChatEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageSent { .. } => "message_sent",
            Self::ResponseReceived { .. } => "response_received",
            Self::DeductionFailed { .. } => "deduction_failed",
            Self::BalanceChanged { .. } => "balance_changed",
        }
    }
}

/// Result of one send.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// The agent answered; `charged` is `None` for anonymous sends
    Replied {
        reply: ChatMessage,
        charged: Option<Committed>,
    },
    /// Not enough credits; nothing was charged or generated
    Blocked {
        eligibility: Eligibility,
        notice: ChatMessage,
    },
    /// The charge did not go through; nothing was generated
    DeductionFailed {
        failure: DeductionFailure,
        notice: ChatMessage,
    },
    /// Charged, but the agent did not answer
    GenerationFailed { notice: ChatMessage, reference: String },
    /// A send to this agent is already pending
    Busy { notice: ChatMessage },
}

impl SendOutcome {
    pub fn notice(&self) -> Option<&ChatMessage> {
        match self {
            Self::Blocked { notice, .. }
            | Self::DeductionFailed { notice, .. }
            | Self::GenerationFailed { notice, .. }
            | Self::Busy { notice } => Some(notice),
            Self::Replied { .. } => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Message is empty")]
    EmptyMessage,
}

/// Drives one message through eligibility, deduction and generation.
///
/// The generator is never called for a signed-in user unless the deduction
/// committed.
pub struct ChatFlow {
    service: Arc<CreditService>,
    generator: Arc<dyn ResponseGenerator>,
    sessions: Arc<SessionStore>,
    events: broadcast::Sender<ChatEvent>,
    model: Option<String>,
}

impl ChatFlow {
    pub fn new(
        service: Arc<CreditService>,
        generator: Arc<dyn ResponseGenerator>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            service,
            generator,
            sessions,
            events,
            model: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn record(&self, agent_id: &str, message: ChatMessage) {
        if let Err(e) = self.sessions.append(agent_id, message) {
            tracing::warn!(agent_id, error = %e, "Failed to persist chat session");
        }
    }

    pub async fn send_message(&self, agent_id: &str, text: &str) -> Result<SendOutcome, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if self.service.is_deduction_in_flight(agent_id) {
            // Nothing was accepted, so nothing is recorded.
            return Ok(SendOutcome::Busy {
                notice: ChatMessage::failure_notice(busy_notice()),
            });
        }

        let session = self.sessions.get_or_create(agent_id);
        let history = HistoryTurn::from_messages(&session.messages);
        let user_message = ChatMessage::user(text);
        self.record(agent_id, user_message.clone());
        self.emit(ChatEvent::MessageSent {
            agent_id: agent_id.to_string(),
            message: user_message,
        });

        let user = self.service.current_user();
        let mut charged = None;
        if user.is_some() {
            let eligibility = self.service.check_can_use_agent(agent_id).await;
            if !eligibility.can_use {
                let notice = ChatMessage::failure_notice(insufficient_notice(
                    agent_id,
                    eligibility.required,
                    eligibility.available,
                ));
                self.record(agent_id, notice.clone());
                return Ok(SendOutcome::Blocked {
                    eligibility,
                    notice,
                });
            }

            match self.service.deduct_credits(agent_id).await {
                Ok(committed) => {
                    self.emit(ChatEvent::BalanceChanged {
                        balance: committed.new_balance,
                    });
                    charged = Some(committed);
                }
                Err(DeductionFailure::InFlight { .. }) => {
                    let notice = ChatMessage::failure_notice(busy_notice());
                    self.record(agent_id, notice.clone());
                    return Ok(SendOutcome::Busy { notice });
                }
                Err(failure) => {
                    let notice = ChatMessage::failure_notice(deduction_notice(agent_id, &failure));
                    self.record(agent_id, notice.clone());
                    self.emit(ChatEvent::DeductionFailed {
                        agent_id: agent_id.to_string(),
                        failure: failure.clone(),
                    });
                    return Ok(SendOutcome::DeductionFailed { failure, notice });
                }
            }
        }

        let request = GenerateRequest {
            message: text.to_string(),
            agent_id: agent_id.to_string(),
            history,
            user_id: user.clone(),
            skip_deduction: charged.is_some(),
            session_id: session.session_id,
            model: self.model.clone(),
        };
        match self.generator.generate(request).await {
            Ok(reply) => {
                self.record(agent_id, reply.clone());
                self.service.telemetry().log_activity(
                    ActivityEvent::new("agent_reply", user.as_ref().map(|u| u.as_str()))
                        .detail("agent_id", agent_id)
                        .detail("charged", charged.is_some()),
                );
                self.emit(ChatEvent::ResponseReceived {
                    agent_id: agent_id.to_string(),
                    message: reply.clone(),
                });
                Ok(SendOutcome::Replied { reply, charged })
            }
            Err(e) => {
                let reference = new_reference();
                let mut event = ErrorEvent::new(
                    format!("Agent response failed: {}", e),
                    Severity::High,
                    user.as_ref().map(|u| u.as_str()),
                )
                .reference(&reference)
                .context("agent_id", agent_id);
                if let Some(c) = &charged {
                    event = event
                        .context("transaction_id", c.transaction_id.clone())
                        .context("idempotency_key", c.idempotency_key.to_string());
                }
                self.service.telemetry().log_error(event);

                let notice = ChatMessage::failure_notice(format!(
                    "{} could not answer right now. Please try again in a moment; \
                     if credits were used for this message, contact support with reference {}.",
                    agent_id, reference
                ));
                self.record(agent_id, notice.clone());
                Ok(SendOutcome::GenerationFailed { notice, reference })
            }
        }
    }
}

fn new_reference() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase()
}

fn busy_notice() -> String {
    "Your previous message is still being processed. Please wait for it to finish.".to_string()
}

fn insufficient_notice(agent_id: &str, required: i64, available: i64) -> String {
    format!(
        "You need {} credit{} to chat with {} but have {}. \
         Top up on the pricing page ({}) to continue.",
        required,
        if required == 1 { "" } else { "s" },
        agent_id,
        available,
        PRICING_ROUTE
    )
}

/// Plain-language explanation for a failed charge.
pub fn deduction_notice(agent_id: &str, failure: &DeductionFailure) -> String {
    match failure {
        DeductionFailure::InsufficientCredits {
            required,
            available,
        } => insufficient_notice(agent_id, required.ceil() as i64, *available),
        DeductionFailure::Timeout { .. } | DeductionFailure::Transient(_) => {
            "We couldn't confirm the credit charge, so your message was not sent and no \
             credits were used. Check your connection and try again."
                .to_string()
        }
        DeductionFailure::InFlight { .. } => busy_notice(),
        DeductionFailure::Unauthenticated => "Please sign in to continue chatting.".to_string(),
        DeductionFailure::Rejected { reference, .. }
        | DeductionFailure::Unexpected { reference, .. } => format!(
            "Something went wrong on our side and your message was not sent. Refresh the page \
             and check your balance; if this keeps happening, contact support with reference {}.",
            reference
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CreditsConfig;
    use crate::core::generator::GeneratorError;
    use crate::core::ledger::{Ledger, LedgerError};
    use crate::core::models::chat::Role;
    use crate::core::models::user::UserId;
    use crate::core::pricing::PricingResolver;
    use crate::core::testing::{DeductBehavior, RecordingSink, ScriptedLedger};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Generator that counts calls and remembers the last request.
    #[derive(Default)]
    struct CountingGenerator {
        calls: AtomicUsize,
        last: Mutex<Option<GenerateRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl ResponseGenerator for CountingGenerator {
        async fn generate(&self, request: GenerateRequest) -> Result<ChatMessage, GeneratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = format!("re: {}", request.message);
            *self.last.lock().unwrap() = Some(request);
            if self.fail {
                return Err(GeneratorError::Http {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(ChatMessage::assistant(reply))
        }
    }

    /// Generator whose first call waits for `release` before answering.
    #[derive(Default)]
    struct HoldingGenerator {
        calls: AtomicUsize,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl ResponseGenerator for HoldingGenerator {
        async fn generate(&self, request: GenerateRequest) -> Result<ChatMessage, GeneratorError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(ChatMessage::assistant(format!("re: {}", request.message)))
        }
    }

    struct Fixture {
        ledger: Arc<ScriptedLedger>,
        service: Arc<CreditService>,
        generator: Arc<CountingGenerator>,
        flow: ChatFlow,
    }

    async fn signed_in_service(balance: Option<i64>) -> (Arc<ScriptedLedger>, Arc<CreditService>) {
        let user = UserId::new("u1");
        let ledger = Arc::new(match balance {
            Some(b) => ScriptedLedger::with_account(&user, b).await,
            None => ScriptedLedger::new(),
        });
        let service = Arc::new(CreditService::new(
            ledger.clone(),
            PricingResolver::new([]),
            Arc::new(RecordingSink::default()),
            &CreditsConfig::default(),
        ));
        if balance.is_some() {
            service.on_auth_change(Some(user)).await.unwrap();
        }
        (ledger, service)
    }

    async fn fixture(balance: Option<i64>, fail_generation: bool) -> Fixture {
        let (ledger, service) = signed_in_service(balance).await;
        let generator = Arc::new(CountingGenerator {
            fail: fail_generation,
            ..CountingGenerator::default()
        });
        let flow = ChatFlow::new(service.clone(), generator.clone(), Arc::new(SessionStore::in_memory()));
        Fixture {
            ledger,
            service,
            generator,
            flow,
        }
    }

    #[tokio::test]
    async fn successful_send_charges_then_generates() {
        let f = fixture(Some(5), false).await;
        let mut events = f.flow.subscribe();

        let outcome = f.flow.send_message("agent-x", "hello").await.unwrap();
        let SendOutcome::Replied { reply, charged } = outcome else {
            panic!("expected reply");
        };
        assert_eq!(reply.content, "re: hello");
        assert_eq!(charged.unwrap().new_balance, 4);
        assert!(f.generator.last.lock().unwrap().as_ref().unwrap().skip_deduction);

        let session = f.flow.sessions().get("agent-x").unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);

        assert!(matches!(events.recv().await.unwrap(), ChatEvent::MessageSent { .. }));
        assert!(matches!(events.recv().await.unwrap(), ChatEvent::BalanceChanged { balance: 4 }));
        assert!(matches!(events.recv().await.unwrap(), ChatEvent::ResponseReceived { .. }));
    }

    #[tokio::test]
    async fn zero_balance_blocks_without_generation() {
        let f = fixture(Some(0), false).await;
        let outcome = f.flow.send_message("agent-x", "hello").await.unwrap();
        let SendOutcome::Blocked { eligibility, notice } = outcome else {
            panic!("expected paywall");
        };
        assert_eq!(eligibility.required, 1);
        assert!(notice.is_error);
        assert!(notice.content.contains("/pricing"));
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 0);
        assert!(f.ledger.deduct_requests().is_empty());
    }

    #[tokio::test]
    async fn network_failure_rolls_back_and_explains() {
        let f = fixture(Some(4), false).await;
        f.ledger
            .set_behavior(DeductBehavior::Error(|| LedgerError::Transport("reset".into())));

        let outcome = f.flow.send_message("agent-x", "hello").await.unwrap();
        let SendOutcome::DeductionFailed { failure, notice } = outcome else {
            panic!("expected deduction failure");
        };
        assert!(failure.is_retryable());
        assert!(notice.content.contains("try again"));
        assert_eq!(f.service.balance().unwrap().balance, 4);
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 0);

        let session = f.flow.sessions().get("agent-x").unwrap();
        assert!(session.messages.last().unwrap().is_error);
    }

    #[tokio::test]
    async fn system_failure_shows_reference() {
        let f = fixture(Some(4), false).await;
        f.ledger
            .set_behavior(DeductBehavior::Error(|| LedgerError::Decode("bad json".into())));
        let outcome = f.flow.send_message("agent-x", "hello").await.unwrap();
        let SendOutcome::DeductionFailed { failure, notice } = outcome else {
            panic!("expected deduction failure");
        };
        let reference = failure.reference().unwrap();
        assert!(notice.content.contains(reference));
        assert!(!notice.content.contains("bad json"));
    }

    #[tokio::test]
    async fn anonymous_send_skips_charging() {
        let f = fixture(None, false).await;
        let outcome = f.flow.send_message("agent-x", "hello").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Replied { charged: None, .. }));
        let last = f.generator.last.lock().unwrap().clone().unwrap();
        assert!(!last.skip_deduction);
        assert!(last.user_id.is_none());
        assert!(f.ledger.deduct_requests().is_empty());
    }

    #[tokio::test]
    async fn generation_failure_after_charge_is_reported() {
        let f = fixture(Some(5), true).await;
        let outcome = f.flow.send_message("agent-x", "hello").await.unwrap();
        let SendOutcome::GenerationFailed { notice, reference } = outcome else {
            panic!("expected generation failure");
        };
        assert!(notice.content.contains(&reference));
        assert_eq!(f.ledger.ledger_balance(&UserId::new("u1")).await, 4);
    }

    #[tokio::test]
    async fn history_excludes_current_message_and_notices() {
        let f = fixture(Some(5), false).await;
        f.flow.send_message("agent-x", "first").await.unwrap();
        f.flow.send_message("agent-x", "second").await.unwrap();
        let last = f.generator.last.lock().unwrap().clone().unwrap();
        assert_eq!(last.history.len(), 2);
        assert_eq!(last.history[0].content, "first");
        assert_eq!(last.history[1].content, "re: first");
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let f = fixture(Some(5), false).await;
        assert!(matches!(
            f.flow.send_message("agent-x", "   ").await,
            Err(ChatError::EmptyMessage)
        ));
    }

    #[tokio::test]
    async fn send_while_charge_pending_is_busy() {
        let f = fixture(Some(5), false).await;
        let gate = f.ledger.hold_deducts();

        let first = f.flow.send_message("agent-x", "one");
        let second = async {
            f.ledger.deduct_entered.notified().await;
            let outcome = f.flow.send_message("agent-x", "two").await;
            gate.notify_one();
            outcome
        };
        let (first, second) = tokio::join!(first, second);
        assert!(matches!(first.unwrap(), SendOutcome::Replied { .. }));
        let SendOutcome::Busy { notice } = second.unwrap() else {
            panic!("expected busy");
        };
        assert!(notice.content.contains("still being processed"));
        assert_eq!(f.ledger.deduct_requests().len(), 1);

        // The refused send leaves no trace in the transcript.
        let contents: Vec<String> = f
            .flow
            .sessions()
            .get("agent-x")
            .unwrap()
            .messages
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["one".to_string(), "re: one".to_string()]);
    }

    #[tokio::test]
    async fn overlapping_sends_keep_both_exchanges() {
        let (ledger, service) = signed_in_service(Some(5)).await;
        let generator = Arc::new(HoldingGenerator::default());
        let flow = ChatFlow::new(service.clone(), generator.clone(), Arc::new(SessionStore::in_memory()));

        let first = flow.send_message("agent-x", "one");
        let second = async {
            generator.entered.notified().await;
            let outcome = flow.send_message("agent-x", "two").await;
            generator.release.notify_one();
            outcome
        };
        let (first, second) = tokio::join!(first, second);
        assert!(matches!(first.unwrap(), SendOutcome::Replied { charged: Some(_), .. }));
        assert!(matches!(second.unwrap(), SendOutcome::Replied { charged: Some(_), .. }));
        assert_eq!(ledger.deduct_requests().len(), 2);

        let mut contents: Vec<String> = flow
            .sessions()
            .get("agent-x")
            .unwrap()
            .messages
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents.len(), 4);
        contents.sort();
        assert_eq!(contents, vec!["one", "re: one", "re: two", "two"]);
    }

    #[test]
    fn session_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::open(path.clone()).unwrap();
        store.append("agent-x", ChatMessage::user("hi")).unwrap();

        let reopened = SessionStore::open(path).unwrap();
        assert_eq!(reopened.get("agent-x").unwrap().messages.len(), 1);
        assert_eq!(reopened.agents(), vec!["agent-x".to_string()]);
    }

    #[test]
    fn session_store_discards_other_schema_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, r#"{"schema_version": 99, "sessions": {}}"#).unwrap();
        assert!(SessionStore::open(path.clone()).unwrap().agents().is_empty());

        std::fs::write(&path, "not json").unwrap();
        assert!(SessionStore::open(path).unwrap().agents().is_empty());
    }

    #[test]
    fn append_creates_session_once() {
        let store = SessionStore::in_memory();
        let created = store.get_or_create("agent-x");
        store.append("agent-x", ChatMessage::user("a")).unwrap();
        store.append("agent-x", ChatMessage::user("b")).unwrap();
        let session = store.get("agent-x").unwrap();
        assert_eq!(session.session_id, created.session_id);
        assert_eq!(session.messages.len(), 2);
    }

    #[tokio::test]
    async fn each_send_is_charged_as_a_new_action() {
        let f = fixture(Some(5), true).await;
        f.flow.send_message("agent-x", "hello").await.unwrap();
        f.flow.send_message("agent-x", "hello").await.unwrap();
        // Each send is a new user action with its own key.
        let keys: Vec<_> = f
            .ledger
            .deduct_requests()
            .into_iter()
            .map(|r| r.idempotency_key)
            .collect();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);
        assert_eq!(f.ledger.get_user_credits(&UserId::new("u1")).await.unwrap().balance, 3);
    }
}
