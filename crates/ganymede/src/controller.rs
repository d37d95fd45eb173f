//
// controller.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::thread;
use std::time::Duration;
use std::time::Instant;

use crossbeam::channel::bounded;
use crossbeam::channel::never;
use crossbeam::channel::unbounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use crossbeam::select;
use serde::Serialize;
use tower_lsp::lsp_types::Diagnostic;
use tower_lsp::lsp_types::DiagnosticSeverity;
use tower_lsp::lsp_types::Position;
use tower_lsp::lsp_types::Range;
use tower_lsp::lsp_types::TextDocumentContentChangeEvent;
use url::Url;

use crate::boundaries;
use crate::boundaries::ParseOutcome;
use crate::buffer::compare_positions;
use crate::buffer::TextBuffer;
use crate::cancel::CancelSource;
use crate::error::Error;
use crate::goals::CommandResult;
use crate::goals::GoalResult;
use crate::goals::LtacProfEntry;
use crate::prover::Interruptor;
use crate::prover::MessageLevel;
use crate::prover::ProverClient;
use crate::prover::ProverEvent;
use crate::prover::QueryKind;
use crate::sentence::HighlightStyle;
use crate::sentence::HighlightUpdate;
use crate::stm::CommandStream;
use crate::stm::EventOutcome;
use crate::stm::NextCommand;
use crate::stm::ParsedCommand;
use crate::stm::SentenceChange;
use crate::stm::StepOutcome;
use crate::stm::Stm;

/// Cadence at which long prover operations report elapsed wall-clock.
const COMPUTING_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputingStatus {
    Computing,
    Idle,
}

/// Notifications flowing from a document to the client, in emission order.
/// Highlight and diagnostic updates for an operation always precede its
/// reply.
#[derive(Debug, Clone)]
pub enum DocumentNotification {
    HighlightUpdates(Vec<HighlightUpdate>),

    /// Full replacement list for the document, not a delta.
    Diagnostics {
        uri: Url,
        diagnostics: Vec<Diagnostic>,
        version: i32,
    },

    Message {
        level: MessageLevel,
        text: String,
        rich: Option<serde_json::Value>,
    },

    /// The proof view was invalidated wholesale (prover death or reset).
    Reset,

    ComputingStatus {
        status: ComputingStatus,
        elapsed: Duration,
    },

    LtacProfResults {
        results: Vec<LtacProfEntry>,
    },
}

/// Lazy sentence source over the buffer suffix at the tip. The STM pulls
/// commands from this instead of reading the buffer, so it never races with
/// edits.
pub struct CommandCursor<'a> {
    buffer: &'a TextBuffer,
    text: String,
    base: usize,
    at: usize,
}

impl<'a> CommandCursor<'a> {
    pub fn new(buffer: &'a TextBuffer, offset: usize) -> Self {
        Self {
            buffer,
            text: buffer.text_from(offset),
            base: offset,
            at: 0,
        }
    }
}

impl CommandStream for CommandCursor<'_> {
    fn next_command(&mut self) -> NextCommand {
        let origin = self.at + boundaries::skip_trivia(&self.text[self.at..]);
        if origin >= self.text.len() {
            return NextCommand::End;
        }

        match boundaries::parse_sentence(&self.text[origin..]) {
            ParseOutcome::Whitespace => NextCommand::End,

            ParseOutcome::Incomplete => NextCommand::Incomplete {
                range: Range::new(
                    self.buffer.position_at(self.base + origin),
                    self.buffer.end_position(),
                ),
            },

            ParseOutcome::Complete { length } => {
                let start = self.base + origin;
                let text = self.text[origin..origin + length].to_string();
                self.at = origin + length;

                NextCommand::Command(ParsedCommand {
                    text,
                    range: Range::new(
                        self.buffer.position_at(start),
                        self.buffer.position_at(start + length),
                    ),
                })
            },
        }
    }
}

/// Per-document façade: validates edits against the STM before they land in
/// the buffer, dispatches user commands, assembles the command results, and
/// rebuilds the diagnostic list after every operation.
pub struct DocumentController {
    uri: Url,
    buffer: TextBuffer,
    stm: Stm,
    notify_tx: Sender<DocumentNotification>,
    interrupts: CancelSource,
}

impl DocumentController {
    pub fn new(
        uri: Url,
        text: &str,
        version: i32,
        client: Box<dyn ProverClient>,
        notify_tx: Sender<DocumentNotification>,
    ) -> crate::Result<Self> {
        let buffer = TextBuffer::new(text, version);

        let mut stm = Stm::new(client, notify_tx.clone(), version);
        stm.init()?;
        let interrupts = stm.interrupts();

        Ok(Self {
            uri,
            buffer,
            stm,
            notify_tx,
            interrupts,
        })
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn buffer(&self) -> &TextBuffer {
        &self.buffer
    }

    pub fn is_running(&self) -> bool {
        self.stm.is_running()
    }

    pub fn focus(&self) -> Position {
        self.stm.focus()
    }

    pub fn interrupt_source(&self) -> CancelSource {
        self.interrupts.clone()
    }

    /// The prover's out-of-band interrupt capability, for handles outside
    /// the document thread.
    pub fn prover_interruptor(&self) -> Interruptor {
        self.stm.prover_interruptor()
    }

    pub(crate) fn events_rx(&self) -> Option<Receiver<ProverEvent>> {
        self.stm.events_rx()
    }

    pub fn step_forward(&mut self) -> CommandResult {
        let _computing = ComputingWatcher::start(self.notify_tx.clone());

        let offset = self.buffer.offset_at(self.stm.focus());
        let mut commands = CommandCursor::new(&self.buffer, offset);
        let outcome = self.stm.step_forward(&mut commands);

        self.finish(outcome)
    }

    pub fn step_backward(&mut self) -> CommandResult {
        let _computing = ComputingWatcher::start(self.notify_tx.clone());

        let outcome = self.stm.step_backward();
        self.finish(outcome)
    }

    pub fn interpret_to_point(&mut self, offset: usize) -> CommandResult {
        self.interpret(self.buffer.position_at(offset))
    }

    pub fn interpret_to_end(&mut self) -> CommandResult {
        self.interpret(self.buffer.end_position())
    }

    pub fn get_goal(&mut self) -> GoalResult {
        let _computing = ComputingWatcher::start(self.notify_tx.clone());

        let token = self.interrupts.token();
        let result = self.stm.get_goal(&token);

        if self.stm.take_death() {
            self.emit_reset();
        }
        if matches!(result, GoalResult::Interrupted { .. }) {
            self.interrupts.reset();
        }

        result
    }

    pub fn locate(&mut self, ident: &str) -> CommandResult {
        self.query(QueryKind::Locate, ident)
    }

    pub fn check(&mut self, term: &str) -> CommandResult {
        self.query(QueryKind::Check, term)
    }

    pub fn search(&mut self, expression: &str) -> CommandResult {
        self.query(QueryKind::Search, expression)
    }

    pub fn search_about(&mut self, expression: &str) -> CommandResult {
        self.query(QueryKind::SearchAbout, expression)
    }

    pub fn set_wrapping_width(&mut self, columns: u32) {
        self.stm.resize(columns);
    }

    /// Request profiling results for the sentence at `offset`, or for the
    /// whole session. Results arrive asynchronously as a notification.
    pub fn request_ltac_prof_results(&mut self, offset: Option<usize>) {
        let state_id = offset.and_then(|offset| {
            let position = self.buffer.position_at(offset);
            self.stm.state_at(position)
        });
        self.stm.ltac_profile(state_id);
    }

    /// Preempts pending work: flips the shared cancellation flag and signals
    /// the prover out of band. Does not queue.
    pub fn interrupt(&self) {
        self.stm.interrupt();
    }

    /// Start a fresh prover session: empty spine, focus at the origin. The
    /// recovery path after a prover death.
    pub fn reset(&mut self) -> crate::Result<()> {
        self.stm.reset()?;
        self.stm.take_death();
        self.interrupts.reset();

        self.notify(DocumentNotification::Reset);
        self.notify(DocumentNotification::HighlightUpdates(vec![
            HighlightUpdate {
                style: HighlightStyle::Clear,
                range: self.buffer.whole_range(),
            },
        ]));
        self.publish_diagnostics();

        Ok(())
    }

    pub fn quit(&mut self) {
        self.stm.shutdown();
    }

    pub fn close(&mut self) {
        self.stm.shutdown();
    }

    /// Validate an edit batch against the STM (rewinding when it touches
    /// executed sentences), then apply it to the buffer.
    pub fn apply_text_edits(
        &mut self,
        changes: Vec<TextDocumentContentChangeEvent>,
        new_version: i32,
    ) -> crate::Result<()> {
        if new_version <= self.buffer.version() {
            return Err(Error::StaleEdit {
                current: self.buffer.version(),
                proposed: new_version,
            });
        }

        // Describe the changes against the pre-edit buffer, latest position
        // first, capturing the replaced slices for passivity checks
        let mut sentence_changes: Vec<SentenceChange> = changes
            .iter()
            .map(|change| {
                let range = change.range.unwrap_or_else(|| self.buffer.whole_range());
                SentenceChange {
                    range,
                    text: change.text.clone(),
                    old_text: self.buffer.slice(range),
                }
            })
            .collect();
        sentence_changes.sort_by(|lhs, rhs| compare_positions(rhs.range.start, lhs.range.start));

        let result = self.stm.apply_changes(&sentence_changes, new_version);
        if self.stm.take_death() {
            self.emit_reset();
        }
        result?;

        self.buffer.apply(&changes, new_version)?;
        self.publish_diagnostics();

        Ok(())
    }

    /// Route one prover event through the STM.
    pub fn handle_prover_event(&mut self, event: ProverEvent) {
        match self.stm.handle_event(event) {
            EventOutcome::Handled => {},
            EventOutcome::ErrorsChanged => self.publish_diagnostics(),
            EventOutcome::Died => {
                self.stm.take_death();
                self.emit_reset();
                self.publish_diagnostics();
            },
        }
    }

    /// The prover's event stream disconnected without a `Died` event.
    pub fn handle_events_closed(&mut self) {
        self.stm.events_closed();
        if self.stm.take_death() {
            self.emit_reset();
            self.publish_diagnostics();
        }
    }

    // --- internals

    fn interpret(&mut self, target: Position) -> CommandResult {
        let _computing = ComputingWatcher::start(self.notify_tx.clone());

        let token = self.interrupts.token();
        let offset = self.buffer.offset_at(self.stm.focus());
        let mut commands = CommandCursor::new(&self.buffer, offset);
        let outcome = self.stm.interpret_to_point(target, &mut commands, &token);

        self.finish(outcome)
    }

    fn query(&mut self, kind: QueryKind, argument: &str) -> CommandResult {
        let _computing = ComputingWatcher::start(self.notify_tx.clone());

        let token = self.interrupts.token();
        let result = match self.stm.do_query(kind, argument, &token) {
            Ok(answer) => {
                self.notify(DocumentNotification::Message {
                    level: MessageLevel::Info,
                    text: answer,
                    rich: None,
                });
                CommandResult::Success {
                    focus: self.stm.focus(),
                }
            },
            Err(err) => self.command_error(err),
        };

        if self.stm.take_death() {
            self.emit_reset();
        }
        if matches!(result, CommandResult::Interrupted { .. }) {
            self.interrupts.reset();
        }

        result
    }

    fn finish(&mut self, outcome: crate::Result<StepOutcome>) -> CommandResult {
        let result = match outcome {
            Ok(outcome) => self.command_result(outcome),
            Err(err) => self.command_error(err),
        };

        if self.stm.take_death() {
            self.emit_reset();
        }
        if matches!(result, CommandResult::Interrupted { .. }) {
            self.interrupts.reset();
        }

        self.publish_diagnostics();
        result
    }

    fn command_result(&mut self, outcome: StepOutcome) -> CommandResult {
        let focus = self.stm.focus();

        match outcome {
            StepOutcome::Stepped
            | StepOutcome::Rewound
            | StepOutcome::Reached
            | StepOutcome::EndOfBuffer => CommandResult::Success { focus },

            StepOutcome::Reset => {
                self.notify(DocumentNotification::Reset);
                CommandResult::Success { focus }
            },

            StepOutcome::Incomplete { range } => CommandResult::Failure {
                message: String::from("Unterminated sentence"),
                range,
                focus,
            },

            StepOutcome::Failed { range, message } => CommandResult::Failure {
                message,
                range,
                focus,
            },

            StepOutcome::Interrupted => CommandResult::Interrupted { focus },
        }
    }

    fn command_error(&mut self, err: Error) -> CommandResult {
        let focus = self.stm.focus();

        match err {
            Error::NotRunning | Error::ProverDied { .. } => CommandResult::NotRunning,

            Error::Interrupted => CommandResult::Interrupted { focus },

            Error::ProverFailure { message, range } => CommandResult::Failure {
                message,
                range: range.unwrap_or(Range::new(focus, focus)),
                focus,
            },

            err => {
                let message = err.to_string();
                log::error!("Document operation failed: {message}");
                self.notify(DocumentNotification::Message {
                    level: MessageLevel::Error,
                    text: message.clone(),
                    rich: None,
                });
                CommandResult::Failure {
                    message,
                    range: Range::new(focus, focus),
                    focus,
                }
            },
        }
    }

    fn publish_diagnostics(&mut self) {
        let diagnostics = self
            .stm
            .errors()
            .into_iter()
            .map(|error| Diagnostic {
                range: error.range,
                severity: Some(DiagnosticSeverity::ERROR),
                source: Some(String::from("prover")),
                message: error.message,
                ..Default::default()
            })
            .collect();

        self.notify(DocumentNotification::Diagnostics {
            uri: self.uri.clone(),
            diagnostics,
            version: self.buffer.version(),
        });
    }

    fn emit_reset(&self) {
        self.notify(DocumentNotification::Message {
            level: MessageLevel::Error,
            text: String::from("The prover process terminated unexpectedly"),
            rich: None,
        });
        self.notify(DocumentNotification::Reset);
    }

    fn notify(&self, notification: DocumentNotification) {
        let _ = self.notify_tx.send(notification);
    }
}

/// Samples elapsed wall-clock on a side thread while a prover operation is
/// in flight and reports it at a fixed cadence. Dropped when the operation
/// finishes; emits a final idle sample.
struct ComputingWatcher {
    stop_tx: Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ComputingWatcher {
    fn start(notify_tx: Sender<DocumentNotification>) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread = thread::Builder::new()
            .name(String::from("ganymede-computing"))
            .spawn(move || {
                let started = Instant::now();

                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        default(COMPUTING_SAMPLE_INTERVAL) => {
                            let _ = notify_tx.send(DocumentNotification::ComputingStatus {
                                status: ComputingStatus::Computing,
                                elapsed: started.elapsed(),
                            });
                        },
                    }
                }

                let _ = notify_tx.send(DocumentNotification::ComputingStatus {
                    status: ComputingStatus::Idle,
                    elapsed: started.elapsed(),
                });
            });

        match thread {
            Ok(thread) => Self {
                stop_tx,
                thread: Some(thread),
            },
            Err(err) => {
                log::warn!("Can't spawn computing status watcher: {err}");
                Self {
                    stop_tx,
                    thread: None,
                }
            },
        }
    }
}

impl Drop for ComputingWatcher {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Operations accepted by the document task, one at a time, in arrival
/// order. Requests carry a bounded reply channel.
pub enum DocumentOp {
    StepForward {
        reply: Sender<CommandResult>,
    },
    StepBackward {
        reply: Sender<CommandResult>,
    },
    InterpretToPoint {
        offset: usize,
        reply: Sender<CommandResult>,
    },
    InterpretToEnd {
        reply: Sender<CommandResult>,
    },
    GetGoal {
        reply: Sender<GoalResult>,
    },
    Query {
        kind: QueryKind,
        argument: String,
        reply: Sender<CommandResult>,
    },
    SetWrappingWidth {
        columns: u32,
    },
    RequestLtacProfResults {
        offset: Option<usize>,
    },
    ApplyEdits {
        changes: Vec<TextDocumentContentChangeEvent>,
        new_version: i32,
        reply: Sender<crate::Result<()>>,
    },
    Reset {
        reply: Sender<crate::Result<()>>,
    },
    Quit,
    Close,
}

/// Cheap handle onto a running document task. Requests return the reply
/// receiver so callers decide when to block; `interrupt` preempts instead
/// of queueing: it flips the shared cancellation flag and delivers the
/// prover's out-of-band signal.
#[derive(Clone)]
pub struct DocumentHandle {
    ops_tx: Sender<DocumentOp>,
    interrupts: CancelSource,
    prover_interrupt: Interruptor,
}

impl DocumentHandle {
    pub fn step_forward(&self) -> Receiver<CommandResult> {
        let (reply, rx) = bounded(1);
        self.send(DocumentOp::StepForward { reply });
        rx
    }

    pub fn step_backward(&self) -> Receiver<CommandResult> {
        let (reply, rx) = bounded(1);
        self.send(DocumentOp::StepBackward { reply });
        rx
    }

    pub fn interpret_to_point(&self, offset: usize) -> Receiver<CommandResult> {
        let (reply, rx) = bounded(1);
        self.send(DocumentOp::InterpretToPoint { offset, reply });
        rx
    }

    pub fn interpret_to_end(&self) -> Receiver<CommandResult> {
        let (reply, rx) = bounded(1);
        self.send(DocumentOp::InterpretToEnd { reply });
        rx
    }

    pub fn get_goal(&self) -> Receiver<GoalResult> {
        let (reply, rx) = bounded(1);
        self.send(DocumentOp::GetGoal { reply });
        rx
    }

    pub fn query(&self, kind: QueryKind, argument: &str) -> Receiver<CommandResult> {
        let (reply, rx) = bounded(1);
        self.send(DocumentOp::Query {
            kind,
            argument: argument.to_string(),
            reply,
        });
        rx
    }

    pub fn set_wrapping_width(&self, columns: u32) {
        self.send(DocumentOp::SetWrappingWidth { columns });
    }

    pub fn request_ltac_prof_results(&self, offset: Option<usize>) {
        self.send(DocumentOp::RequestLtacProfResults { offset });
    }

    pub fn apply_edits(
        &self,
        changes: Vec<TextDocumentContentChangeEvent>,
        new_version: i32,
    ) -> Receiver<crate::Result<()>> {
        let (reply, rx) = bounded(1);
        self.send(DocumentOp::ApplyEdits {
            changes,
            new_version,
            reply,
        });
        rx
    }

    pub fn reset(&self) -> Receiver<crate::Result<()>> {
        let (reply, rx) = bounded(1);
        self.send(DocumentOp::Reset { reply });
        rx
    }

    /// Cancel the in-flight operation and signal the prover out of band.
    /// The task thread may be blocked in a prover call, so this must not go
    /// through the operation queue.
    pub fn interrupt(&self) {
        self.interrupts.cancel();
        self.prover_interrupt.signal();
    }

    pub fn quit(&self) {
        self.send(DocumentOp::Quit);
    }

    pub fn close(&self) {
        self.send(DocumentOp::Close);
    }

    fn send(&self, op: DocumentOp) {
        if self.ops_tx.send(op).is_err() {
            log::warn!("Document task is gone; dropping operation");
        }
    }
}

/// The document's single-consumer loop: drains client operations and prover
/// events into the controller, one at a time, so STM invariants hold across
/// every suspension point.
pub struct DocumentTask;

impl DocumentTask {
    pub fn spawn(
        uri: Url,
        text: &str,
        version: i32,
        client: Box<dyn ProverClient>,
        notify_tx: Sender<DocumentNotification>,
    ) -> crate::Result<(DocumentHandle, thread::JoinHandle<()>)> {
        let controller = DocumentController::new(uri, text, version, client, notify_tx)?;

        let (ops_tx, ops_rx) = unbounded::<DocumentOp>();
        let handle = DocumentHandle {
            ops_tx,
            interrupts: controller.interrupt_source(),
            prover_interrupt: controller.prover_interruptor(),
        };

        let thread = thread::Builder::new()
            .name(String::from("ganymede-document"))
            .spawn(move || Self::run(controller, ops_rx))
            .map_err(|err| Error::Internal(err.into()))?;

        Ok((handle, thread))
    }

    fn run(mut controller: DocumentController, ops_rx: Receiver<DocumentOp>) {
        let mut events_rx = controller.events_rx().unwrap_or_else(never);

        loop {
            select! {
                recv(ops_rx) -> op => {
                    let Ok(op) = op else {
                        // Every handle dropped; tear the document down
                        controller.close();
                        break;
                    };
                    if Self::handle_op(&mut controller, op) {
                        break;
                    }
                    // Operations may have restarted or killed the session
                    events_rx = controller.events_rx().unwrap_or_else(never);
                },

                recv(events_rx) -> event => {
                    match event {
                        Ok(event) => controller.handle_prover_event(event),
                        Err(_) => {
                            controller.handle_events_closed();
                            events_rx = never();
                        },
                    }
                },
            }
        }
    }

    /// Returns true when the loop should exit.
    fn handle_op(controller: &mut DocumentController, op: DocumentOp) -> bool {
        match op {
            DocumentOp::StepForward { reply } => {
                let _ = reply.send(controller.step_forward());
            },
            DocumentOp::StepBackward { reply } => {
                let _ = reply.send(controller.step_backward());
            },
            DocumentOp::InterpretToPoint { offset, reply } => {
                let _ = reply.send(controller.interpret_to_point(offset));
            },
            DocumentOp::InterpretToEnd { reply } => {
                let _ = reply.send(controller.interpret_to_end());
            },
            DocumentOp::GetGoal { reply } => {
                let _ = reply.send(controller.get_goal());
            },
            DocumentOp::Query {
                kind,
                argument,
                reply,
            } => {
                let result = match kind {
                    QueryKind::Locate => controller.locate(&argument),
                    QueryKind::Check => controller.check(&argument),
                    QueryKind::Search => controller.search(&argument),
                    QueryKind::SearchAbout => controller.search_about(&argument),
                };
                let _ = reply.send(result);
            },
            DocumentOp::SetWrappingWidth { columns } => {
                controller.set_wrapping_width(columns);
            },
            DocumentOp::RequestLtacProfResults { offset } => {
                controller.request_ltac_prof_results(offset);
            },
            DocumentOp::ApplyEdits {
                changes,
                new_version,
                reply,
            } => {
                let _ = reply.send(controller.apply_text_edits(changes, new_version));
            },
            DocumentOp::Reset { reply } => {
                let _ = reply.send(controller.reset());
            },
            DocumentOp::Quit | DocumentOp::Close => {
                controller.quit();
                return true;
            },
        }

        false
    }
}
