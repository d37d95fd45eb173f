//
// stm.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::collections::HashMap;

use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use tower_lsp::lsp_types::Position;
use tower_lsp::lsp_types::Range;

use crate::buffer::compare_positions;
use crate::buffer::range_contains;
use crate::buffer::ranges_overlap;
use crate::buffer::RangeDelta;
use crate::cancel::CancelSource;
use crate::cancel::CancelToken;
use crate::controller::DocumentNotification;
use crate::error::Error;
use crate::goals::GoalResult;
use crate::prover::FocusChange;
use crate::prover::Interruptor;
use crate::prover::ProverClient;
use crate::prover::ProverError;
use crate::prover::ProverEvent;
use crate::prover::QueryKind;
use crate::prover::StateId;
use crate::sentence::HighlightStyle;
use crate::sentence::HighlightUpdate;
use crate::sentence::Sentence;
use crate::sentence::SentenceError;
use crate::sentence::SentenceId;
use crate::sentence::SentenceStatus;

/// A delimited command handed to the STM by the controller's cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub text: String,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NextCommand {
    Command(ParsedCommand),

    /// The buffer ends inside a sentence; `range` covers the candidate text.
    Incomplete { range: Range },

    /// Nothing but trivia up to the end of the buffer.
    End,
}

/// Source of commands for forward steps. The controller binds one to the
/// tip's offset so the STM never touches the text buffer itself.
pub trait CommandStream {
    fn next_command(&mut self) -> NextCommand;
}

/// One content change, described against the pre-edit buffer. `old_text` is
/// the replaced slice, captured before the buffer mutates, so passivity can
/// be judged here without buffer access.
#[derive(Debug, Clone)]
pub struct SentenceChange {
    pub range: Range,
    pub text: String,
    pub old_text: String,
}

/// Domain outcome of a stepping operation. Transport-level problems
/// (`NotRunning`, a dead prover) travel as `Error` instead.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// One sentence was added to the spine.
    Stepped,

    /// The spine was truncated to an earlier state.
    Rewound,

    /// The target position (or the end of the buffer) was reached.
    Reached,

    /// No further sentence before the end of the buffer.
    EndOfBuffer,

    /// The parser could not delimit the candidate range.
    Incomplete { range: Range },

    /// The prover rejected the sentence; nothing was added.
    Failed { range: Range, message: String },

    Interrupted,

    /// A backward step at the root: the session was re-initialized.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Handled,

    /// The event changed the error set; diagnostics should be republished.
    ErrorsChanged,

    /// The prover died; the session is no longer running.
    Died,
}

/// The State-Transaction Machine: owns the sentence forest mirroring the
/// prover's state DAG and the prover connection, and turns prover events
/// into highlight updates.
///
/// All operations and all event handling run on the controller's thread, so
/// spine ordering and status monotonicity hold across the blocking prover
/// calls, and a highlight for an in-flight sentence can never be emitted
/// after that sentence was cleared.
pub struct Stm {
    client: Box<dyn ProverClient>,
    events_rx: Option<Receiver<ProverEvent>>,
    notify_tx: Sender<DocumentNotification>,

    /// Arena of all sentences ever created this session. The spine indexes
    /// into it; rewinds only truncate the spine.
    sentences: Vec<Sentence>,

    /// Root-to-tip chain of executed sentences, ordered by range.
    spine: Vec<SentenceId>,

    /// Routes prover events to sentences. Entries exist iff the sentence is
    /// on the spine, so off-spine events drop out here.
    by_state: HashMap<StateId, SentenceId>,

    /// Last failed attempt, kept off-spine for diagnostics until the next
    /// successful operation or rewind supersedes it.
    failed: Option<SentenceId>,

    /// Focus reported by the prover that the forest does not track (an
    /// unfocused proof branch revealed by a rewind). When set it is the
    /// authoritative parent for the next add, until a new tip is
    /// established.
    focus_override: Option<StateId>,

    root_state: StateId,
    version: i32,
    running: bool,

    /// Latched when the prover dies so the controller can emit one reset.
    death_observed: bool,

    /// Shared interrupt flag; single-shot operations derive their tokens
    /// from it so `interrupt` cancels them too.
    interrupts: CancelSource,
}

impl Stm {
    pub fn new(
        client: Box<dyn ProverClient>,
        notify_tx: Sender<DocumentNotification>,
        version: i32,
    ) -> Self {
        Self {
            client,
            events_rx: None,
            notify_tx,
            sentences: Vec::new(),
            spine: Vec::new(),
            by_state: HashMap::new(),
            failed: None,
            focus_override: None,
            root_state: StateId(0),
            version,
            running: false,
            death_observed: false,
            interrupts: CancelSource::new(),
        }
    }

    /// Start the prover session.
    pub fn init(&mut self) -> crate::Result<()> {
        let (root_state, events_rx) = self.client.init().map_err(map_prover_error)?;

        log::info!("Prover session initialized at state {root_state}");

        self.root_state = root_state;
        self.events_rx = Some(events_rx);
        self.running = true;

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The shared interrupt source. The controller and document handles keep
    /// clones so an interrupt preempts without queueing.
    pub fn interrupts(&self) -> CancelSource {
        self.interrupts.clone()
    }

    /// The prover's out-of-band interrupt capability, for callers on other
    /// threads while this STM is blocked in a request.
    pub fn prover_interruptor(&self) -> Interruptor {
        self.client.interruptor()
    }

    /// The event stream of the current session, for the document task's
    /// select loop.
    pub fn events_rx(&self) -> Option<Receiver<ProverEvent>> {
        self.events_rx.clone()
    }

    /// End of the tip sentence; the position new commands extend.
    pub fn focus(&self) -> Position {
        match self.tip() {
            Some(sentence) => sentence.range.end,
            None => Position::new(0, 0),
        }
    }

    pub fn spine_len(&self) -> usize {
        self.spine.len()
    }

    pub fn tip_state_id(&self) -> StateId {
        if let Some(state_id) = self.focus_override {
            return state_id;
        }
        match self.tip().and_then(|sentence| sentence.state_id) {
            Some(state_id) => state_id,
            None => self.root_state,
        }
    }

    /// State id of the spine sentence containing `position`, if any.
    pub fn state_at(&self, position: Position) -> Option<StateId> {
        self.spine
            .iter()
            .map(|&id| &self.sentences[id.0])
            .find(|sentence| range_contains(sentence.range, position))
            .and_then(|sentence| sentence.state_id)
    }

    /// Spine sentences in root-to-tip order.
    pub fn spine_sentences(&self) -> impl Iterator<Item = &Sentence> + '_ {
        self.spine.iter().map(|&id| &self.sentences[id.0])
    }

    /// Current error set: errors of spine sentences plus the last failed
    /// attempt, in document order.
    pub fn errors(&self) -> Vec<SentenceError> {
        let mut errors: Vec<SentenceError> = self
            .spine
            .iter()
            .flat_map(|&id| self.sentences[id.0].errors.iter().cloned())
            .collect();

        if let Some(failed) = self.failed {
            errors.extend(self.sentences[failed.0].errors.iter().cloned());
        }

        errors.sort_by(|lhs, rhs| compare_positions(lhs.range.start, rhs.range.start));
        errors
    }

    /// Consume the death latch; true exactly once per prover death.
    pub fn take_death(&mut self) -> bool {
        std::mem::take(&mut self.death_observed)
    }

    /// Submit the next command from `commands` to the prover and append it
    /// to the spine on success.
    pub fn step_forward(&mut self, commands: &mut dyn CommandStream) -> crate::Result<StepOutcome> {
        self.ensure_running()?;
        self.pump_events();
        // The pump may have drained a death event
        self.ensure_running()?;

        match commands.next_command() {
            NextCommand::End => Ok(StepOutcome::EndOfBuffer),
            NextCommand::Incomplete { range } => Ok(self.reject_incomplete(range)),
            NextCommand::Command(command) => {
                let token = self.interrupts.token();
                self.submit(command, &token)
            },
        }
    }

    /// Rewind the spine by one sentence via `edit_at`; at the root, reset
    /// and re-initialize the session instead.
    pub fn step_backward(&mut self) -> crate::Result<StepOutcome> {
        self.ensure_running()?;
        self.pump_events();
        self.ensure_running()?;

        if self.spine.is_empty() {
            self.reset()?;
            return Ok(StepOutcome::Reset);
        }

        let token = self.interrupts.token();
        self.rewind_to(self.spine.len() - 1, &token)
    }

    /// Drive the tip towards `target`: rewind when the target precedes the
    /// focus, step forward while the next sentence stays within it. A
    /// cancelled step leaves either the completed prefix or the
    /// post-interrupt tip; a partially-added sentence never stays.
    pub fn interpret_to_point(
        &mut self,
        target: Position,
        commands: &mut dyn CommandStream,
        cancel: &CancelToken,
    ) -> crate::Result<StepOutcome> {
        self.ensure_running()?;
        self.pump_events();
        self.ensure_running()?;

        if compare_positions(target, self.focus()) == std::cmp::Ordering::Less {
            let keep = self
                .spine
                .iter()
                .take_while(|&&id| {
                    let end = self.sentences[id.0].range.end;
                    compare_positions(end, target) != std::cmp::Ordering::Greater
                })
                .count();
            return self.rewind_to(keep, cancel);
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(StepOutcome::Interrupted);
            }

            let command = match commands.next_command() {
                NextCommand::End => return Ok(StepOutcome::Reached),
                NextCommand::Incomplete { range } => return Ok(self.reject_incomplete(range)),
                NextCommand::Command(command) => command,
            };

            if compare_positions(command.range.end, target) == std::cmp::Ordering::Greater {
                return Ok(StepOutcome::Reached);
            }

            match self.submit(command, cancel)? {
                StepOutcome::Stepped => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    /// React to buffer changes before they land in the buffer. Non-passive
    /// changes touching the spine rewind to the parent of the first affected
    /// sentence; all surviving sentences after a change shift by its delta.
    pub fn apply_changes(
        &mut self,
        changes: &[SentenceChange],
        new_version: i32,
    ) -> crate::Result<()> {
        if self.running {
            self.pump_events();
        }

        for change in changes {
            self.apply_change(change)?;
        }

        self.version = new_version;
        Ok(())
    }

    pub fn get_goal(&mut self, cancel: &CancelToken) -> GoalResult {
        if !self.running {
            return GoalResult::NotRunning;
        }
        self.pump_events();
        if !self.running {
            return GoalResult::NotRunning;
        }

        let focus = self.focus();
        match self.client.goal(cancel) {
            Ok(None) => GoalResult::NoProof { focus },
            Ok(Some(goals)) => GoalResult::ProofView { goals, focus },
            Err(ProverError::Failure(failure)) => GoalResult::Failure {
                message: failure.message,
                range: failure.range,
                focus,
            },
            Err(ProverError::Interrupted) => GoalResult::Interrupted { focus },
            Err(ProverError::Died(reason)) => {
                self.mark_died(reason);
                GoalResult::NotRunning
            },
        }
    }

    /// Evaluate a non-mutating query at the tip. Never touches the spine.
    pub fn do_query(
        &mut self,
        kind: QueryKind,
        argument: &str,
        cancel: &CancelToken,
    ) -> crate::Result<String> {
        self.ensure_running()?;

        match self.client.query(kind, argument, cancel) {
            Ok(answer) => Ok(answer),
            Err(ProverError::Failure(failure)) => Err(Error::ProverFailure {
                message: failure.message,
                range: failure.range,
            }),
            Err(ProverError::Interrupted) => Err(Error::Interrupted),
            Err(ProverError::Died(reason)) => {
                self.mark_died(reason.clone());
                Err(Error::ProverDied { reason })
            },
        }
    }

    /// Flip the shared interrupt flag and forward the out-of-band signal to
    /// the prover. Pending operations observe the cancellation and resolve
    /// with `Interrupted`.
    pub fn interrupt(&self) {
        self.interrupts.cancel();
        if self.running {
            self.client.interrupt();
        }
    }

    pub fn resize(&mut self, columns: u32) {
        if self.running {
            self.client.resize(columns);
        }
    }

    pub fn ltac_profile(&mut self, state_id: Option<StateId>) {
        if self.running {
            self.client.ltac_profile(state_id);
        }
    }

    /// The event stream disconnected without a `Died` event; treat it as a
    /// prover death.
    pub fn events_closed(&mut self) {
        if self.running {
            self.mark_died(None);
        }
    }

    /// Drain pending operations and close the prover channel. After this,
    /// every mutating operation returns `NotRunning`.
    pub fn shutdown(&mut self) {
        if self.running {
            self.client.shutdown();
        }
        self.running = false;
        self.events_rx = None;
    }

    /// Drop the whole forest and start a fresh session: empty spine, focus
    /// at the origin. Also the recovery path after a prover death.
    pub fn reset(&mut self) -> crate::Result<()> {
        if self.running {
            self.client.shutdown();
            self.running = false;
        }

        self.sentences.clear();
        self.spine.clear();
        self.by_state.clear();
        self.failed = None;
        self.focus_override = None;
        self.events_rx = None;

        self.init()
    }

    /// Apply every event already queued by the prover. Non-blocking.
    pub fn pump_events(&mut self) {
        let Some(events_rx) = self.events_rx.clone() else {
            return;
        };

        while let Ok(event) = events_rx.try_recv() {
            self.handle_event(event);
        }
    }

    /// Apply one prover event. Events keyed on a state id that is no longer
    /// on the spine are dropped silently; they arrive after a rewind.
    pub fn handle_event(&mut self, event: ProverEvent) -> EventOutcome {
        match event {
            ProverEvent::Status { state_id, status } => {
                let Some(sentence) = self.sentence_of_state(state_id) else {
                    log::trace!("Dropping status update for off-spine state {state_id}");
                    return EventOutcome::Handled;
                };

                let next = SentenceStatus::from(status);
                if !sentence.status.advances_to(next) {
                    return EventOutcome::Handled;
                }

                sentence.status = next;
                let range = sentence.range;
                self.highlight(next.highlight(), range);
                EventOutcome::Handled
            },

            ProverEvent::Error {
                state_id,
                range,
                message,
            } => {
                let Some(sentence) = self.sentence_of_state(state_id) else {
                    log::trace!("Dropping error for off-spine state {state_id}");
                    return EventOutcome::Handled;
                };

                let range = range.unwrap_or(sentence.range);
                sentence.errors.push(SentenceError { range, message });
                if sentence.status.advances_to(SentenceStatus::Error) {
                    sentence.status = SentenceStatus::Error;
                }

                let range = sentence.range;
                self.highlight(HighlightStyle::TacticFailure, range);
                EventOutcome::ErrorsChanged
            },

            ProverEvent::Message { level, text, rich } => {
                self.notify(DocumentNotification::Message { level, text, rich });
                EventOutcome::Handled
            },

            ProverEvent::LtacProfResults { state_id, results } => {
                log::trace!(
                    "Ltac profile results for state {state_id:?} ({} entries)",
                    results.len()
                );
                self.notify(DocumentNotification::LtacProfResults { results });
                EventOutcome::Handled
            },

            ProverEvent::Died { reason } => {
                self.mark_died(reason);
                EventOutcome::Died
            },
        }
    }

    // --- internals

    fn ensure_running(&self) -> crate::Result<()> {
        if self.running {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    fn tip(&self) -> Option<&Sentence> {
        self.spine.last().map(|&id| &self.sentences[id.0])
    }

    fn sentence_of_state(&mut self, state_id: StateId) -> Option<&mut Sentence> {
        let id = *self.by_state.get(&state_id)?;
        Some(&mut self.sentences[id.0])
    }

    fn submit(
        &mut self,
        command: ParsedCommand,
        cancel: &CancelToken,
    ) -> crate::Result<StepOutcome> {
        self.highlight(HighlightStyle::Parsing, command.range);

        let request = crate::prover::AddRequest {
            text: &command.text,
            parent: self.tip_state_id(),
            end_position: command.range.end,
            version: self.version,
        };

        match self.client.add(request, cancel) {
            Ok(added) => {
                if let Some(hint) = added.focus_hint {
                    log::trace!("Add of state {} hints focus at {hint}", added.state_id);
                }

                let id = SentenceId(self.sentences.len());
                self.sentences.push(Sentence {
                    id,
                    state_id: Some(added.state_id),
                    range: command.range,
                    text: command.text,
                    status: SentenceStatus::Processing,
                    parent: self.spine.last().copied(),
                    errors: Vec::new(),
                });
                self.spine.push(id);
                self.by_state.insert(added.state_id, id);
                self.failed = None;
                self.focus_override = None;

                self.highlight(HighlightStyle::Processing, command.range);
                self.pump_events();
                Ok(StepOutcome::Stepped)
            },

            Err(ProverError::Failure(failure)) => {
                self.highlight(HighlightStyle::Clear, command.range);

                let range = failure.range.unwrap_or(command.range);
                let id = SentenceId(self.sentences.len());
                self.sentences.push(Sentence {
                    id,
                    state_id: None,
                    range: command.range,
                    text: command.text,
                    status: SentenceStatus::Error,
                    parent: self.spine.last().copied(),
                    errors: vec![SentenceError {
                        range,
                        message: failure.message.clone(),
                    }],
                });
                self.failed = Some(id);

                self.pump_events();
                Ok(StepOutcome::Failed {
                    range,
                    message: failure.message,
                })
            },

            Err(ProverError::Interrupted) => {
                self.highlight(HighlightStyle::Clear, command.range);
                Ok(StepOutcome::Interrupted)
            },

            Err(ProverError::Died(reason)) => {
                self.mark_died(reason.clone());
                Err(Error::ProverDied { reason })
            },
        }
    }

    fn reject_incomplete(&mut self, range: Range) -> StepOutcome {
        let id = SentenceId(self.sentences.len());
        self.sentences.push(Sentence {
            id,
            state_id: None,
            range,
            text: String::new(),
            status: SentenceStatus::Error,
            parent: self.spine.last().copied(),
            errors: vec![SentenceError {
                range,
                message: String::from("Unterminated sentence"),
            }],
        });
        self.failed = Some(id);

        StepOutcome::Incomplete { range }
    }

    /// Rewind the spine to its first `keep` sentences via `edit_at`.
    fn rewind_to(&mut self, keep: usize, cancel: &CancelToken) -> crate::Result<StepOutcome> {
        let target_state = if keep == 0 {
            self.root_state
        } else {
            self.sentences[self.spine[keep - 1].0]
                .state_id
                .unwrap_or(self.root_state)
        };

        match self.client.edit_at(target_state, cancel) {
            Ok(change) => {
                self.truncate_spine(keep);
                self.apply_focus_change(change);
                Ok(StepOutcome::Rewound)
            },

            Err(ProverError::Failure(failure)) => {
                let focus = self.focus();
                Ok(StepOutcome::Failed {
                    range: failure.range.unwrap_or(Range::new(focus, focus)),
                    message: failure.message,
                })
            },

            Err(ProverError::Interrupted) => Ok(StepOutcome::Interrupted),

            Err(ProverError::Died(reason)) => {
                self.mark_died(reason.clone());
                Err(Error::ProverDied { reason })
            },
        }
    }

    /// Reconcile the tip with where the prover reports its focus after an
    /// `edit_at`. The returned focus is authoritative: a focus on a spine
    /// sentence truncates to it, and a focus the forest never tracked (an
    /// unfocused proof branch) is recorded as the tip state until the next
    /// add or rewind establishes a new one.
    fn apply_focus_change(&mut self, change: FocusChange) {
        match change {
            FocusChange::NewTip { .. } => {
                self.focus_override = None;
            },

            FocusChange::NewFocus {
                qed_state_id,
                focus_state_id,
            } => {
                log::trace!("Rewind left a proof unfocused; closed at {qed_state_id}");

                match self.by_state.get(&focus_state_id) {
                    Some(&id) => {
                        if let Some(at) = self.spine.iter().position(|&spine_id| spine_id == id) {
                            self.truncate_spine(at + 1);
                        }
                        self.focus_override = None;
                    },
                    None => {
                        self.focus_override = Some(focus_state_id);
                    },
                }
            },
        }
    }

    /// Mark everything after `keep` as cleared and emit one covering clear
    /// highlight. Also drops the failed attempt, which any rewind
    /// supersedes.
    fn truncate_spine(&mut self, keep: usize) {
        if keep >= self.spine.len() {
            self.failed = None;
            return;
        }

        let start = self.sentences[self.spine[keep].0].range.start;
        let end = self.sentences[self.spine[self.spine.len() - 1].0].range.end;

        for &id in &self.spine[keep..] {
            let sentence = &mut self.sentences[id.0];
            sentence.status = SentenceStatus::Cleared;
            if let Some(state_id) = sentence.state_id {
                self.by_state.remove(&state_id);
            }
        }

        self.spine.truncate(keep);
        self.failed = None;

        self.highlight(HighlightStyle::Clear, Range::new(start, end));
    }

    fn apply_change(&mut self, change: &SentenceChange) -> crate::Result<()> {
        let focus = self.focus();

        // Changes at or beyond the focus never touch executed sentences
        if compare_positions(change.range.start, focus) != std::cmp::Ordering::Less {
            return Ok(());
        }

        let first_affected = self
            .spine
            .iter()
            .position(|&id| ranges_overlap(self.sentences[id.0].range, change.range));

        let passive = first_affected.is_none()
            && crate::boundaries::is_trivia(&change.text)
            && crate::boundaries::is_trivia(&change.old_text);

        if !passive {
            // Rewind before the first sentence invalidated by the change:
            // the first overlapping one, or the first one following a
            // non-trivia gap edit
            let at = first_affected.or_else(|| {
                self.spine.iter().position(|&id| {
                    let start = self.sentences[id.0].range.start;
                    compare_positions(start, change.range.end) != std::cmp::Ordering::Less
                })
            });

            if let Some(at) = at {
                if self.running {
                    let parent_state = if at == 0 {
                        self.root_state
                    } else {
                        self.sentences[self.spine[at - 1].0]
                            .state_id
                            .unwrap_or(self.root_state)
                    };

                    // The truncation below must happen even when the rewind
                    // fails, so the forest keeps tracking the editor; a
                    // divergence surfaces on the next prover call
                    match self.client.edit_at(parent_state, &CancelToken::none()) {
                        Ok(change) => self.apply_focus_change(change),
                        Err(ProverError::Died(reason)) => self.mark_died(reason),
                        Err(err) => log::warn!("Rewind for edit failed: {err}"),
                    }
                }

                self.truncate_spine(at);
            }
        }

        // Shift survivors after the change
        let delta = RangeDelta::new(change.range, &change.text);
        for &id in &self.spine {
            let sentence = &mut self.sentences[id.0];
            if compare_positions(sentence.range.start, change.range.end)
                != std::cmp::Ordering::Less
            {
                sentence.range = delta.shift_range(sentence.range);
                for error in &mut sentence.errors {
                    error.range = delta.shift_range(error.range);
                }
            }
        }

        Ok(())
    }

    fn mark_died(&mut self, reason: Option<String>) {
        match &reason {
            Some(reason) => log::error!("Prover died: {reason}"),
            None => log::error!("Prover died"),
        }

        self.running = false;
        self.events_rx = None;
        self.death_observed = true;
    }

    fn highlight(&self, style: HighlightStyle, range: Range) {
        self.notify(DocumentNotification::HighlightUpdates(vec![
            HighlightUpdate { style, range },
        ]));
    }

    fn notify(&self, notification: DocumentNotification) {
        // A closed channel only means the consumer is gone during shutdown
        let _ = self.notify_tx.send(notification);
    }
}

fn map_prover_error(err: ProverError) -> Error {
    match err {
        ProverError::Failure(failure) => Error::ProverFailure {
            message: failure.message,
            range: failure.range,
        },
        ProverError::Interrupted => Error::Interrupted,
        ProverError::Died(reason) => Error::ProverDied { reason },
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use crossbeam::channel::unbounded;

    use super::*;
    use crate::buffer::TextBuffer;
    use crate::controller::CommandCursor;
    use crate::controller::DocumentNotification;
    use crate::fixtures::DummyBehavior;
    use crate::fixtures::DummyCall;
    use crate::fixtures::DummyProver;
    use crate::prover::ExecStatus;

    fn range(sl: u32, sc: u32, el: u32, ec: u32) -> Range {
        Range::new(Position::new(sl, sc), Position::new(el, ec))
    }

    fn new_stm(prover: DummyProver) -> (Stm, Receiver<DocumentNotification>) {
        let (notify_tx, notify_rx) = unbounded();
        let mut stm = Stm::new(Box::new(prover), notify_tx, 0);
        stm.init().unwrap();
        (stm, notify_rx)
    }

    fn step(stm: &mut Stm, buffer: &TextBuffer) -> StepOutcome {
        let offset = buffer.offset_at(stm.focus());
        let mut commands = CommandCursor::new(buffer, offset);
        stm.step_forward(&mut commands).unwrap()
    }

    fn run_to_end(stm: &mut Stm, buffer: &TextBuffer) {
        let offset = buffer.offset_at(stm.focus());
        let mut commands = CommandCursor::new(buffer, offset);
        let outcome = stm
            .interpret_to_point(buffer.end_position(), &mut commands, &CancelToken::none())
            .unwrap();
        assert_eq!(outcome, StepOutcome::Reached);
    }

    fn highlights(notify_rx: &Receiver<DocumentNotification>) -> Vec<HighlightUpdate> {
        let mut updates = Vec::new();
        while let Ok(notification) = notify_rx.try_recv() {
            if let DocumentNotification::HighlightUpdates(mut batch) = notification {
                updates.append(&mut batch);
            }
        }
        updates
    }

    #[test]
    fn test_forward_steps_tile_the_buffer() {
        let (prover, _probe) = DummyProver::new();
        let (mut stm, _notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A. B. C.", 0);

        assert_eq!(step(&mut stm, &buffer), StepOutcome::Stepped);
        assert_eq!(step(&mut stm, &buffer), StepOutcome::Stepped);
        assert_eq!(step(&mut stm, &buffer), StepOutcome::Stepped);
        assert_eq!(step(&mut stm, &buffer), StepOutcome::EndOfBuffer);

        let ranges: Vec<Range> = stm.spine_sentences().map(|sentence| sentence.range).collect();
        assert_eq!(
            ranges,
            vec![range(0, 0, 0, 2), range(0, 3, 0, 5), range(0, 6, 0, 8)]
        );
        assert_eq!(stm.focus(), Position::new(0, 8));
        assert!(stm.errors().is_empty());

        // Disjoint ranges tile a prefix: each one starts at or after the
        // previous end
        for pair in ranges.windows(2) {
            assert_ne!(
                compare_positions(pair[0].end, pair[1].start),
                std::cmp::Ordering::Greater
            );
        }
    }

    #[test]
    fn test_forward_then_backward_restores_the_tip() {
        let (prover, probe) = DummyProver::new();
        let (mut stm, notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A. B.", 0);

        assert_eq!(step(&mut stm, &buffer), StepOutcome::Stepped);
        let tip_before = stm.tip_state_id();
        let errors_before = stm.errors();

        assert_eq!(step(&mut stm, &buffer), StepOutcome::Stepped);
        assert_eq!(stm.step_backward().unwrap(), StepOutcome::Rewound);

        assert_eq!(stm.tip_state_id(), tip_before);
        assert_eq!(stm.errors(), errors_before);
        assert_eq!(stm.focus(), Position::new(0, 2));
        assert!(probe.calls().contains(&DummyCall::EditAt(tip_before.0)));

        // The removed span was cleared
        let updates = highlights(&notify_rx);
        assert_matches!(updates.last(), Some(update) => {
            assert_eq!(update.style, HighlightStyle::Clear);
            assert_eq!(update.range, range(0, 3, 0, 5));
        });
    }

    #[test]
    fn test_backward_at_root_resets_the_session() {
        let (prover, probe) = DummyProver::new();
        let (mut stm, _notify_rx) = new_stm(prover);

        assert_eq!(stm.step_backward().unwrap(), StepOutcome::Reset);
        assert!(stm.is_running());
        assert_eq!(stm.spine_len(), 0);
        assert_eq!(
            probe
                .calls()
                .iter()
                .filter(|call| **call == DummyCall::Init)
                .count(),
            2
        );
    }

    #[test]
    fn test_failed_add_stays_off_the_spine() {
        let (prover, probe) = DummyProver::new();
        let prover = prover.on_add(
            "Fail.",
            DummyBehavior::Fail {
                range: Some(range(0, 3, 0, 7)),
                message: String::from("syntax"),
            },
        );
        let (mut stm, _notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A. Fail. C.", 0);

        assert_eq!(step(&mut stm, &buffer), StepOutcome::Stepped);
        assert_matches!(step(&mut stm, &buffer), StepOutcome::Failed { range: at, message } => {
            assert_eq!(at, range(0, 3, 0, 7));
            assert_eq!(message, "syntax");
        });

        assert_eq!(stm.spine_len(), 1);
        assert_eq!(stm.focus(), Position::new(0, 2));
        assert_eq!(stm.errors(), vec![SentenceError {
            range: range(0, 3, 0, 7),
            message: String::from("syntax"),
        }]);

        // The sentence after the failure was never attempted
        assert!(!probe.calls().contains(&DummyCall::Add(String::from("C."))));
    }

    #[test]
    fn test_status_events_advance_highlights_in_order() {
        let (prover, _probe) = DummyProver::new();
        let prover = prover.with_statuses(vec![
            ExecStatus::InProgress,
            ExecStatus::Processed,
            ExecStatus::Complete,
        ]);
        let (mut stm, notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A.", 0);

        assert_eq!(step(&mut stm, &buffer), StepOutcome::Stepped);
        assert_matches!(stm.spine_sentences().next(), Some(sentence) => {
            assert_eq!(sentence.status, SentenceStatus::Complete);
        });

        let styles: Vec<HighlightStyle> = highlights(&notify_rx)
            .into_iter()
            .map(|update| update.style)
            .collect();
        assert_eq!(styles, vec![
            HighlightStyle::Parsing,
            HighlightStyle::Processing,
            HighlightStyle::InProgress,
            HighlightStyle::Processed,
            HighlightStyle::Complete,
        ]);
    }

    #[test]
    fn test_events_for_off_spine_states_are_dropped() {
        let (prover, probe) = DummyProver::new();
        let (mut stm, notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A.", 0);

        assert_eq!(step(&mut stm, &buffer), StepOutcome::Stepped);
        let _ = highlights(&notify_rx);

        // A state id that was never added, e.g. from before a rewind
        probe.send_event(ProverEvent::Status {
            state_id: StateId(99),
            status: crate::prover::ExecStatus::Complete,
        });
        probe.send_event(ProverEvent::Error {
            state_id: StateId(99),
            range: None,
            message: String::from("late"),
        });
        stm.pump_events();

        assert!(notify_rx.try_recv().is_err());
        assert!(stm.errors().is_empty());
    }

    #[test]
    fn test_interpret_rewinds_to_the_sentence_before_the_target() {
        let (prover, probe) = DummyProver::new();
        let (mut stm, _notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A. B. C.", 0);

        run_to_end(&mut stm, &buffer);
        assert_eq!(stm.spine_len(), 3);
        probe.take_calls();

        // Target inside the second sentence: keep only the first
        let mut commands = CommandCursor::new(&buffer, 8);
        let outcome = stm
            .interpret_to_point(Position::new(0, 4), &mut commands, &CancelToken::none())
            .unwrap();

        assert_eq!(outcome, StepOutcome::Rewound);
        assert_eq!(stm.spine_len(), 1);
        assert_eq!(stm.focus(), Position::new(0, 2));
        assert_eq!(probe.take_calls(), vec![DummyCall::EditAt(2)]);
    }

    #[test]
    fn test_interpret_stops_before_exceeding_the_target() {
        let (prover, probe) = DummyProver::new();
        let (mut stm, _notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A. B. C.", 0);

        let mut commands = CommandCursor::new(&buffer, 0);
        let outcome = stm
            .interpret_to_point(Position::new(0, 7), &mut commands, &CancelToken::none())
            .unwrap();

        // "C." ends at 8 > 7, so it is not executed
        assert_eq!(outcome, StepOutcome::Reached);
        assert_eq!(stm.spine_len(), 2);
        assert_eq!(stm.focus(), Position::new(0, 5));
        assert!(!probe.calls().contains(&DummyCall::Add(String::from("C."))));
    }

    #[test]
    fn test_rewind_records_an_untracked_prover_focus() {
        let (prover, _probe) = DummyProver::new();
        let prover = prover.on_edit_at(2, FocusChange::NewFocus {
            qed_state_id: StateId(7),
            focus_state_id: StateId(6),
        });
        let (mut stm, _notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A. B. C.", 0);

        run_to_end(&mut stm, &buffer);

        // The rewind reveals a nested focus on a state the forest never
        // tracked
        let mut commands = CommandCursor::new(&buffer, 8);
        let outcome = stm
            .interpret_to_point(Position::new(0, 4), &mut commands, &CancelToken::none())
            .unwrap();

        assert_eq!(outcome, StepOutcome::Rewound);
        assert_eq!(stm.spine_len(), 1);
        assert_eq!(stm.focus(), Position::new(0, 2));

        // The prover's reported focus is the parent of the next add
        assert_eq!(stm.tip_state_id(), StateId(6));

        // A successful add establishes a new tip and drops the override
        let mut commands = CommandCursor::new(&buffer, 2);
        assert_eq!(stm.step_forward(&mut commands).unwrap(), StepOutcome::Stepped);
        assert_eq!(stm.tip_state_id(), StateId(5));
    }

    #[test]
    fn test_rewind_focus_on_an_earlier_sentence_truncates_to_it() {
        let (prover, probe) = DummyProver::new();
        let prover = prover.on_edit_at(3, FocusChange::NewFocus {
            qed_state_id: StateId(9),
            focus_state_id: StateId(2),
        });
        let (mut stm, _notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A. B. C.", 0);

        run_to_end(&mut stm, &buffer);
        probe.take_calls();

        // Stepping back onto the second sentence reveals a focus on the
        // first; the prover's focus wins
        assert_eq!(stm.step_backward().unwrap(), StepOutcome::Rewound);

        assert_eq!(probe.take_calls(), vec![DummyCall::EditAt(3)]);
        assert_eq!(stm.spine_len(), 1);
        assert_eq!(stm.tip_state_id(), StateId(2));
        assert_eq!(stm.focus(), Position::new(0, 2));
    }

    #[test]
    fn test_cancellation_preserves_the_completed_prefix() {
        let (prover, _probe) = DummyProver::new();
        let prover = prover.on_add("B.", DummyBehavior::Block);
        let (mut stm, _notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A. B. C.", 0);

        // Deadline-based cancellation: the blocked add observes the token
        // and resolves as interrupted
        let source = crate::cancel::CancelSource::new();
        let token = source.token_with_timeout(std::time::Duration::from_millis(50));

        let mut commands = CommandCursor::new(&buffer, 0);
        let outcome = stm
            .interpret_to_point(buffer.end_position(), &mut commands, &token)
            .unwrap();

        assert_eq!(outcome, StepOutcome::Interrupted);

        // The completed prefix stays; the interrupted sentence never landed
        assert_eq!(stm.spine_len(), 1);
        assert_eq!(stm.focus(), Position::new(0, 2));
    }

    #[test]
    fn test_passive_edit_shifts_ranges_without_rewind() {
        let (prover, probe) = DummyProver::new();
        let (mut stm, _notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A. B. C.", 0);

        run_to_end(&mut stm, &buffer);
        probe.take_calls();

        // Insert a comment between the first and second sentences
        stm.apply_changes(
            &[SentenceChange {
                range: range(0, 2, 0, 2),
                text: String::from("(*x*)"),
                old_text: String::new(),
            }],
            1,
        )
        .unwrap();

        let ranges: Vec<Range> = stm.spine_sentences().map(|sentence| sentence.range).collect();
        assert_eq!(
            ranges,
            vec![range(0, 0, 0, 2), range(0, 8, 0, 10), range(0, 11, 0, 13)]
        );
        assert!(!probe
            .calls()
            .iter()
            .any(|call| matches!(call, DummyCall::EditAt(_))));
    }

    #[test]
    fn test_edit_inside_a_sentence_rewinds_to_its_parent() {
        let (prover, probe) = DummyProver::new();
        let (mut stm, _notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A. B. C.", 0);

        run_to_end(&mut stm, &buffer);
        probe.take_calls();

        stm.apply_changes(
            &[SentenceChange {
                range: range(0, 3, 0, 5),
                text: String::from("B'."),
                old_text: String::from("B."),
            }],
            1,
        )
        .unwrap();

        assert_eq!(probe.take_calls(), vec![DummyCall::EditAt(2)]);
        assert_eq!(stm.spine_len(), 1);
        assert_eq!(stm.focus(), Position::new(0, 2));
        assert!(stm.errors().is_empty());
    }

    #[test]
    fn test_non_trivia_gap_insert_rewinds_the_following_sentences() {
        let (prover, probe) = DummyProver::new();
        let (mut stm, _notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A. B.", 0);

        run_to_end(&mut stm, &buffer);
        probe.take_calls();

        // New sentence material between the executed sentences invalidates
        // everything after the gap
        stm.apply_changes(
            &[SentenceChange {
                range: range(0, 2, 0, 2),
                text: String::from(" D."),
                old_text: String::new(),
            }],
            1,
        )
        .unwrap();

        assert_eq!(probe.take_calls(), vec![DummyCall::EditAt(2)]);
        assert_eq!(stm.spine_len(), 1);
    }

    #[test]
    fn test_edits_beyond_the_focus_are_ignored() {
        let (prover, probe) = DummyProver::new();
        let (mut stm, _notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A. B. C.", 0);

        let mut commands = CommandCursor::new(&buffer, 0);
        stm.interpret_to_point(Position::new(0, 5), &mut commands, &CancelToken::none())
            .unwrap();
        probe.take_calls();

        stm.apply_changes(
            &[SentenceChange {
                range: range(0, 6, 0, 8),
                text: String::from("D."),
                old_text: String::from("C."),
            }],
            1,
        )
        .unwrap();

        assert!(probe.take_calls().is_empty());
        assert_eq!(stm.spine_len(), 2);
    }

    #[test]
    fn test_query_does_not_touch_the_spine() {
        let (prover, _probe) = DummyProver::new();
        let (mut stm, _notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A.", 0);

        assert_eq!(step(&mut stm, &buffer), StepOutcome::Stepped);
        let tip = stm.tip_state_id();

        let answer = stm
            .do_query(QueryKind::Check, "nat", &CancelToken::none())
            .unwrap();
        assert_eq!(answer, "Check: nat");
        assert_eq!(stm.tip_state_id(), tip);
        assert_eq!(stm.spine_len(), 1);
    }

    #[test]
    fn test_shutdown_turns_operations_into_not_running() {
        let (prover, _probe) = DummyProver::new();
        let (mut stm, _notify_rx) = new_stm(prover);
        let buffer = TextBuffer::new("A.", 0);

        stm.shutdown();
        assert!(!stm.is_running());

        let offset = buffer.offset_at(stm.focus());
        let mut commands = CommandCursor::new(&buffer, offset);
        assert_matches!(stm.step_forward(&mut commands), Err(Error::NotRunning));
        assert_matches!(stm.step_backward(), Err(Error::NotRunning));
        assert_eq!(stm.get_goal(&CancelToken::none()), GoalResult::NotRunning);
    }
}
