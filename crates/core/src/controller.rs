//! Conversation Session Controller
//!
//! Owns the single voice-agent session slot and serializes every start, stop
//! and switch request against the agent's own events.
//!
//! The controller runs as one task. Microphone acquisition, session open and
//! session close are awaited inline, so a request that arrives while one of
//! those steps is outstanding waits in the queue and is applied once the step
//! has resolved. A stop that lands during a start therefore drains the start
//! to a clean close instead of abandoning a half-open session.

use crate::{
    card::{CardId, CardRegistry, TranscriptLine, strip_markup},
    error::SessionError,
    visualizer::{AudioVisualizer, LevelMeter},
    voice::{
        AgentEvent, AgentMode, AgentSession, EventSink, MicTap, Microphone, SessionConfig,
        VoiceAgent,
    },
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn};

pub const REQUESTING_MIC_LABEL: &str = "Requesting mic...";
pub const CONNECTING_LABEL: &str = "Connecting...";
pub const ENDING_LABEL: &str = "Ending...";
pub const CONNECTION_FAILED_LABEL: &str = "Connection Failed";
pub const CONNECTION_LOST_LABEL: &str = "Connection Lost";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RequestingMic,
    Connecting,
    Active,
    Disconnecting,
    Failed,
}

/// What observers can see of the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSnapshot {
    pub state: SessionState,
    /// The card the current (or starting) session belongs to.
    pub target: Option<CardId>,
    /// Incremented for every start attempt.
    pub generation: u64,
    /// Number of user requests fully applied so far.
    pub requests_handled: u64,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub agent_id: String,
    pub first_message: Option<String>,
    /// How long a failure status stays on a card before it is restored.
    pub failure_display: Duration,
}

impl ControllerConfig {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            first_message: None,
            failure_display: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Talk(CardId),
    Close(CardId),
    CloseAll,
    Shutdown,
}

/// Cloneable front door to a running controller.
#[derive(Clone)]
pub struct ConversationHandle {
    requests: mpsc::UnboundedSender<Request>,
    snapshot: watch::Receiver<ControllerSnapshot>,
    /// Requests sent through any clone of this handle.
    sent: Arc<AtomicU64>,
}

impl ConversationHandle {
    fn send(&self, request: Request) -> bool {
        let ok = self.requests.send(request).is_ok();
        if ok {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
        ok
    }

    /// The card's talk button. Starts a session, or stops it when the card
    /// already owns the session.
    pub fn talk(&self, card: CardId) -> bool {
        self.send(Request::Talk(card))
    }

    /// The card's close button.
    pub fn close(&self, card: CardId) -> bool {
        self.send(Request::Close(card))
    }

    /// Applies every request sent so far, then ends any session and forgets
    /// pending failure restores. Returns once the controller is idle, so the
    /// caller may unmount the cards afterwards.
    pub async fn close_all(&self) -> Option<ControllerSnapshot> {
        if !self.send(Request::CloseAll) {
            return None;
        }
        let sent = self.sent.load(Ordering::SeqCst);
        self.wait_until(|s| s.requests_handled >= sent).await
    }

    /// Closes any live session and stops the controller task.
    pub fn shutdown(&self) -> bool {
        self.send(Request::Shutdown)
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerSnapshot> {
        self.snapshot.clone()
    }

    /// Waits until the published snapshot satisfies `pred`.
    pub async fn wait_until(
        &self,
        pred: impl FnMut(&ControllerSnapshot) -> bool,
    ) -> Option<ControllerSnapshot> {
        let mut rx = self.snapshot.clone();
        rx.wait_for(pred).await.ok().map(|s| s.clone())
    }
}

/// The one live session and everything it holds on to.
struct LiveSession {
    card: CardId,
    generation: u64,
    session: Box<dyn AgentSession>,
    mic: Arc<dyn MicTap>,
    visualizer: Option<AudioVisualizer>,
}

pub struct ConversationController {
    config: ControllerConfig,
    agent: Arc<dyn VoiceAgent>,
    microphone: Arc<dyn Microphone>,
    registry: Arc<dyn CardRegistry>,
    meter: Arc<LevelMeter>,

    state: SessionState,
    target: Option<CardId>,
    generation: u64,
    requests_handled: u64,
    slot: Option<LiveSession>,
    /// Generation of the latest failure shown on each card.
    failures: HashMap<CardId, u64>,

    requests: mpsc::UnboundedReceiver<Request>,
    backlog: VecDeque<Request>,
    events_tx: mpsc::UnboundedSender<(u64, AgentEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, AgentEvent)>,
    restore_tx: mpsc::UnboundedSender<(CardId, u64)>,
    restore_rx: mpsc::UnboundedReceiver<(CardId, u64)>,
    snapshot: watch::Sender<ControllerSnapshot>,
}

impl ConversationController {
    /// Starts the controller task.
    pub fn spawn(
        config: ControllerConfig,
        agent: Arc<dyn VoiceAgent>,
        microphone: Arc<dyn Microphone>,
        registry: Arc<dyn CardRegistry>,
    ) -> (ConversationHandle, JoinHandle<()>) {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (restore_tx, restore_rx) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(ControllerSnapshot {
            state: SessionState::Idle,
            target: None,
            generation: 0,
            requests_handled: 0,
        });

        let controller = Self {
            config,
            agent,
            microphone,
            registry,
            meter: Arc::new(LevelMeter::default()),
            state: SessionState::Idle,
            target: None,
            generation: 0,
            requests_handled: 0,
            slot: None,
            failures: HashMap::new(),
            requests,
            backlog: VecDeque::new(),
            events_tx,
            events_rx,
            restore_tx,
            restore_rx,
            snapshot,
        };
        let handle = tokio::spawn(controller.run());
        (
            ConversationHandle {
                requests: requests_tx,
                snapshot: snapshot_rx,
                sent: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    async fn run(mut self) {
        info!("Conversation controller started.");
        loop {
            if let Some(request) = self.backlog.pop_front() {
                if !self.on_request(request).await {
                    break;
                }
                continue;
            }

            tokio::select! {
                biased;
                Some((generation, event)) = self.events_rx.recv() => {
                    self.on_event(generation, event).await;
                }
                request = self.requests.recv() => {
                    let keep_running = match request {
                        Some(request) => self.on_request(request).await,
                        None => self.on_request(Request::Shutdown).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
                Some((card, generation)) = self.restore_rx.recv() => {
                    self.on_restore(card, generation);
                }
            }
        }
        info!("Conversation controller stopped.");
    }

    fn publish(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, target = ?self.target, "Session state transition");
        }
        self.state = state;
        let snapshot = ControllerSnapshot {
            state,
            target: self.target,
            generation: self.generation,
            requests_handled: self.requests_handled,
        };
        self.snapshot.send_replace(snapshot);
    }

    /// Applies one user request. Returns false once the controller should stop.
    async fn on_request(&mut self, request: Request) -> bool {
        let keep_running = match request {
            Request::Talk(card) => {
                match self.slot.as_ref().map(|live| live.card) {
                    Some(current) if current == card => {
                        info!(%card, "Talk on the active card: stopping session.");
                        self.disconnect(false).await;
                    }
                    Some(current) => {
                        info!(from = %current, to = %card, "Switching conversation.");
                        self.disconnect(true).await;
                        self.start(card).await;
                    }
                    None => self.start(card).await,
                }
                true
            }
            Request::Close(card) => {
                if self.slot.as_ref().is_some_and(|live| live.card == card) {
                    self.disconnect(false).await;
                } else {
                    debug!(%card, "Close for a card without a session; ignoring.");
                }
                true
            }
            Request::CloseAll => {
                self.disconnect(false).await;
                self.failures.clear();
                true
            }
            Request::Shutdown => {
                info!("Shutting down conversation controller.");
                self.disconnect(false).await;
                self.registry.reset_all();
                self.registry.set_focus_mode(false);
                false
            }
        };
        self.requests_handled += 1;
        self.publish(self.state);
        keep_running
    }

    /// Runs the start sequence for `card` up to the point where the provider
    /// has been asked to open a session.
    #[instrument(skip(self), fields(generation))]
    async fn start(&mut self, card: CardId) {
        let Some(ui) = self.registry.card(card) else {
            warn!(%card, "Talk requested for an unknown card.");
            self.release_focus_unless_starting();
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        tracing::Span::current().record("generation", generation);
        self.target = Some(card);
        self.registry.set_busy(card, REQUESTING_MIC_LABEL);
        self.publish(SessionState::RequestingMic);

        let mic = match self.microphone.acquire().await {
            Ok(mic) => mic,
            Err(e) => {
                warn!(%card, error = %e, "MicDenied: microphone unavailable.");
                self.registry.reset_to_default(card);
                self.target = None;
                self.publish(SessionState::Idle);
                self.release_focus_unless_starting();
                return;
            }
        };

        if self.take_cancellation(card) {
            info!(%card, "Start cancelled while the microphone was being acquired.");
            drop(mic);
            self.registry.reset_to_default(card);
            self.target = None;
            self.publish(SessionState::Idle);
            self.release_focus_unless_starting();
            return;
        }

        self.registry.set_busy(card, CONNECTING_LABEL);
        self.publish(SessionState::Connecting);

        let config = SessionConfig::for_character(
            &self.config.agent_id,
            &ui.character,
            self.config.first_message.clone(),
        );
        let sink = EventSink::new(generation, self.events_tx.clone());
        info!(%card, character = %config.character_name, voice_id = %config.voice_id, "Opening voice session.");

        match self.agent.open(config, mic.clone(), sink).await {
            Ok(session) => {
                self.slot = Some(LiveSession {
                    card,
                    generation,
                    session,
                    mic,
                    visualizer: None,
                });
            }
            Err(e) => {
                drop(mic);
                self.fail_with(card, generation, CONNECTION_FAILED_LABEL, &e);
            }
        }
    }

    /// Moves everything waiting in the request channel to the backlog,
    /// keeping arrival order.
    fn drain_requests(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            self.backlog.push_back(request);
        }
    }

    /// Looks at requests that queued up during the microphone step. The first
    /// request that affects this start decides: a toggle or close for the
    /// starting card is consumed, while a talk for another card, a close-all
    /// or a shutdown cancels the start but stays queued.
    fn take_cancellation(&mut self, card: CardId) -> bool {
        self.drain_requests();
        let first = self.backlog.iter().position(|r| match r {
            Request::Talk(_) | Request::CloseAll | Request::Shutdown => true,
            Request::Close(c) => *c == card,
        });
        match first.map(|idx| (idx, self.backlog[idx])) {
            Some((idx, Request::Talk(c) | Request::Close(c))) if c == card => {
                self.backlog.remove(idx);
                self.requests_handled += 1;
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    fn pending_start(&self) -> bool {
        self.backlog.iter().any(|r| matches!(r, Request::Talk(_)))
    }

    fn release_focus_unless_starting(&mut self) {
        self.drain_requests();
        if self.slot.is_none() && !self.pending_start() {
            self.registry.set_focus_mode(false);
        }
    }

    /// Closes the live session, if any, and waits for the close to be confirmed.
    /// When `switching`, focus mode stays on for the session about to start.
    async fn disconnect(&mut self, switching: bool) {
        let Some(live) = self.slot.take() else {
            return;
        };
        let LiveSession {
            card,
            generation,
            session,
            mic,
            visualizer,
        } = live;

        self.registry.set_busy(card, ENDING_LABEL);
        self.publish(SessionState::Disconnecting);
        if let Some(visualizer) = visualizer {
            visualizer.stop();
        }

        match session.close().await {
            Ok(()) => info!(%card, generation, "Voice session closed."),
            Err(e) => warn!(%card, generation, error = %e, "Voice session did not close cleanly."),
        }
        drop(mic);

        self.registry.reset_to_default(card);
        self.target = None;
        self.publish(SessionState::Idle);
        if !switching {
            self.release_focus_unless_starting();
        }
    }

    /// Releases the slot after a provider failure and leaves a failure status
    /// on the card.
    async fn teardown_failed(&mut self, label: &str, error: &SessionError) {
        let Some(live) = self.slot.take() else {
            return;
        };
        let LiveSession {
            card,
            generation,
            session,
            mic,
            visualizer,
        } = live;
        if let Some(visualizer) = visualizer {
            visualizer.stop();
        }
        if let Err(e) = session.close().await {
            debug!(%card, error = %e, "Close after failure reported an error.");
        }
        drop(mic);
        self.fail_with(card, generation, label, error);
    }

    fn fail_with(&mut self, card: CardId, generation: u64, label: &str, error: &SessionError) {
        warn!(%card, generation, error = %error, "SessionError");
        self.registry.set_failed(card, label);
        self.failures.insert(card, generation);
        self.target = None;
        self.publish(SessionState::Failed);
        self.publish(SessionState::Idle);
        self.release_focus_unless_starting();

        let restore_tx = self.restore_tx.clone();
        let delay = self.config.failure_display;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = restore_tx.send((card, generation));
        });
    }

    /// Clears a failure status, unless a later failure on the same card has
    /// replaced it.
    fn on_restore(&mut self, card: CardId, generation: u64) {
        if self.failures.get(&card) != Some(&generation) {
            debug!(%card, generation, "Dropping superseded restore.");
            return;
        }
        self.failures.remove(&card);
        if self.target == Some(card) {
            return;
        }
        if self.registry.card(card).is_some_and(|c| c.failed) {
            self.registry.reset_to_default(card);
        }
    }

    async fn on_event(&mut self, generation: u64, event: AgentEvent) {
        let Some(live) = self.slot.as_ref() else {
            debug!(generation, ?event, "Dropping event: no live session.");
            return;
        };
        if live.generation != generation {
            debug!(generation, current = live.generation, ?event, "Dropping stale event.");
            return;
        }
        let card = live.card;

        match (self.state, event) {
            (SessionState::Connecting, AgentEvent::Connected) => {
                info!(%card, generation, "Voice session connected.");
                self.registry.set_active(card, true);
                self.registry.set_focus_mode(true);
                let visualizer = AudioVisualizer::start(
                    card,
                    live.mic.clone(),
                    self.registry.clone(),
                    self.meter.clone(),
                );
                if let Some(live) = self.slot.as_mut() {
                    live.visualizer = Some(visualizer);
                }
                self.publish(SessionState::Active);
            }
            (SessionState::Connecting, AgentEvent::Error(message)) => {
                self.teardown_failed(CONNECTION_FAILED_LABEL, &SessionError::Open(message))
                    .await;
            }
            (SessionState::Connecting, AgentEvent::Disconnected) => {
                let error = SessionError::Open("closed before connecting".to_string());
                self.teardown_failed(CONNECTION_FAILED_LABEL, &error).await;
            }
            (SessionState::Active, AgentEvent::Error(message)) => {
                self.teardown_failed(CONNECTION_LOST_LABEL, &SessionError::Runtime(message))
                    .await;
            }
            (SessionState::Active, AgentEvent::Disconnected) => {
                info!(%card, generation, "Voice session closed by the agent; resetting all cards.");
                if let Some(live) = self.slot.take() {
                    if let Some(visualizer) = live.visualizer {
                        visualizer.stop();
                    }
                    if let Err(e) = live.session.close().await {
                        debug!(%card, error = %e, "Close after remote disconnect reported an error.");
                    }
                }
                self.registry.reset_all();
                self.registry.set_focus_mode(false);
                self.target = None;
                self.publish(SessionState::Idle);
            }
            (SessionState::Active, AgentEvent::ModeChange(mode)) => {
                self.registry
                    .set_speaking(card, mode == AgentMode::Speaking);
            }
            (SessionState::Active, AgentEvent::Message { source, message }) => {
                let text = strip_markup(&message);
                if !text.is_empty() {
                    self.registry
                        .append_transcript(card, TranscriptLine { source, text });
                }
            }
            (state, event) => {
                debug!(?state, ?event, "Ignoring event in this state.");
            }
        }
    }
}
