//
// fixtures/dummy_prover.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crossbeam::channel::unbounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use tower_lsp::lsp_types::Range;

use crate::cancel::CancelToken;
use crate::goals::LtacProfEntry;
use crate::goals::ProofView;
use crate::prover::AddRequest;
use crate::prover::Added;
use crate::prover::ExecStatus;
use crate::prover::FailureAt;
use crate::prover::FocusChange;
use crate::prover::Interruptor;
use crate::prover::ProverClient;
use crate::prover::ProverError;
use crate::prover::ProverEvent;
use crate::prover::QueryKind;
use crate::prover::StateId;

/// Upper bound on a scripted `Block` so a lost interrupt fails a test
/// instead of hanging it.
const BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Scripted reaction of the dummy prover to a specific sentence text.
#[derive(Debug, Clone)]
pub enum DummyBehavior {
    Succeed,
    Fail {
        range: Option<Range>,
        message: String,
    },
    /// Hold the add until the call is cancelled or the prover interrupted.
    Block,
    Die {
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DummyCall {
    Init,
    Add(String),
    EditAt(u32),
    Goal,
    Query(QueryKind, String),
    Interrupt,
    Resize(u32),
    LtacProfile(Option<u32>),
    Shutdown,
}

/// In-memory `ProverClient` for tests: every add is acknowledged with a
/// fresh state id unless a behavior is scripted for the sentence text, and
/// each success emits the configured status events.
pub struct DummyProver {
    behaviors: HashMap<String, DummyBehavior>,
    edit_behaviors: HashMap<u32, FocusChange>,
    statuses: Vec<ExecStatus>,
    goal_view: Option<ProofView>,
    ltac_results: Vec<LtacProfEntry>,
    next_state: u32,

    calls: Arc<Mutex<Vec<DummyCall>>>,
    events_tx: Arc<Mutex<Option<Sender<ProverEvent>>>>,
    interrupted: Arc<AtomicBool>,
}

/// Test-side view of a `DummyProver` that moved into a controller: inspect
/// the calls it received and inject events into its stream.
#[derive(Clone)]
pub struct DummyProbe {
    calls: Arc<Mutex<Vec<DummyCall>>>,
    events_tx: Arc<Mutex<Option<Sender<ProverEvent>>>>,
    interrupted: Arc<AtomicBool>,
}

impl DummyProver {
    pub fn new() -> (Self, DummyProbe) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let events_tx = Arc::new(Mutex::new(None));
        let interrupted = Arc::new(AtomicBool::new(false));

        let probe = DummyProbe {
            calls: calls.clone(),
            events_tx: events_tx.clone(),
            interrupted: interrupted.clone(),
        };

        let prover = Self {
            behaviors: HashMap::new(),
            edit_behaviors: HashMap::new(),
            statuses: vec![ExecStatus::Complete],
            goal_view: None,
            ltac_results: Vec::new(),
            next_state: 2,
            calls,
            events_tx,
            interrupted,
        };

        (prover, probe)
    }

    /// Script a reaction for a sentence, keyed by its trimmed text.
    pub fn on_add(mut self, text: &str, behavior: DummyBehavior) -> Self {
        self.behaviors.insert(text.trim().to_string(), behavior);
        self
    }

    /// Script the focus change returned for an `edit_at` of `state_id`;
    /// unscripted rewinds report the requested state as the new tip.
    pub fn on_edit_at(mut self, state_id: u32, change: FocusChange) -> Self {
        self.edit_behaviors.insert(state_id, change);
        self
    }

    /// Status events emitted for every successful add, in order.
    pub fn with_statuses(mut self, statuses: Vec<ExecStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn with_goals(mut self, goals: ProofView) -> Self {
        self.goal_view = Some(goals);
        self
    }

    pub fn with_ltac_results(mut self, results: Vec<LtacProfEntry>) -> Self {
        self.ltac_results = results;
        self
    }

    fn record(&self, call: DummyCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn emit(&self, event: ProverEvent) {
        if let Some(events_tx) = self.events_tx.lock().unwrap().as_ref() {
            let _ = events_tx.send(event);
        }
    }

    fn die(&mut self, reason: Option<String>) -> ProverError {
        self.emit(ProverEvent::Died {
            reason: reason.clone(),
        });
        *self.events_tx.lock().unwrap() = None;
        ProverError::Died(reason)
    }
}

impl ProverClient for DummyProver {
    fn init(&mut self) -> Result<(StateId, Receiver<ProverEvent>), ProverError> {
        self.record(DummyCall::Init);
        self.interrupted.store(false, Ordering::Release);

        let (events_tx, events_rx) = unbounded();
        *self.events_tx.lock().unwrap() = Some(events_tx);

        Ok((StateId(1), events_rx))
    }

    fn add(&mut self, request: AddRequest<'_>, cancel: &CancelToken) -> Result<Added, ProverError> {
        self.record(DummyCall::Add(request.text.to_string()));

        let behavior = self
            .behaviors
            .get(request.text.trim())
            .cloned()
            .unwrap_or(DummyBehavior::Succeed);

        match behavior {
            DummyBehavior::Succeed => {
                let state_id = StateId(self.next_state);
                self.next_state += 1;

                for &status in &self.statuses {
                    self.emit(ProverEvent::Status { state_id, status });
                }

                Ok(Added {
                    state_id,
                    focus_hint: None,
                })
            },

            DummyBehavior::Fail { range, message } => Err(ProverError::Failure(FailureAt {
                state_id: None,
                range,
                message,
            })),

            DummyBehavior::Block => {
                let started = Instant::now();
                loop {
                    if cancel.is_cancelled() || self.interrupted.load(Ordering::Acquire) {
                        return Err(ProverError::Interrupted);
                    }
                    if started.elapsed() > BLOCK_TIMEOUT {
                        return Err(ProverError::Interrupted);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            },

            DummyBehavior::Die { reason } => Err(self.die(reason)),
        }
    }

    fn edit_at(
        &mut self,
        state_id: StateId,
        _cancel: &CancelToken,
    ) -> Result<FocusChange, ProverError> {
        self.record(DummyCall::EditAt(state_id.0));
        Ok(match self.edit_behaviors.get(&state_id.0) {
            Some(&change) => change,
            None => FocusChange::NewTip { state_id },
        })
    }

    fn goal(&mut self, _cancel: &CancelToken) -> Result<Option<ProofView>, ProverError> {
        self.record(DummyCall::Goal);
        Ok(self.goal_view.clone())
    }

    fn query(
        &mut self,
        kind: QueryKind,
        argument: &str,
        _cancel: &CancelToken,
    ) -> Result<String, ProverError> {
        self.record(DummyCall::Query(kind, argument.to_string()));
        Ok(format!("{kind:?}: {argument}"))
    }

    fn interrupt(&self) {
        self.record(DummyCall::Interrupt);
        self.interrupted.store(true, Ordering::Release);
    }

    fn interruptor(&self) -> Interruptor {
        let calls = self.calls.clone();
        let interrupted = self.interrupted.clone();
        Interruptor::new(move || {
            calls.lock().unwrap().push(DummyCall::Interrupt);
            interrupted.store(true, Ordering::Release);
        })
    }

    fn resize(&mut self, columns: u32) {
        self.record(DummyCall::Resize(columns));
    }

    fn ltac_profile(&mut self, state_id: Option<StateId>) {
        self.record(DummyCall::LtacProfile(state_id.map(|state_id| state_id.0)));
        self.emit(ProverEvent::LtacProfResults {
            state_id,
            results: self.ltac_results.clone(),
        });
    }

    fn shutdown(&mut self) {
        self.record(DummyCall::Shutdown);
        *self.events_tx.lock().unwrap() = None;
    }
}

impl DummyProbe {
    pub fn calls(&self) -> Vec<DummyCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take_calls(&self) -> Vec<DummyCall> {
        std::mem::take(&mut self.calls.lock().unwrap())
    }

    /// Inject an event into the current session's stream.
    pub fn send_event(&self, event: ProverEvent) {
        let events_tx = self.events_tx.lock().unwrap();
        if let Some(events_tx) = events_tx.as_ref() {
            let _ = events_tx.send(event);
        }
    }

    /// Close the event stream without a `Died` event.
    pub fn close_events(&self) {
        *self.events_tx.lock().unwrap() = None;
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}
