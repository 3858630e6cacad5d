//! Events published by a pipeline run, and the completion object that
//! records how the run ended.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};

use crate::error::PipelineError;
use crate::operation::Operation;
use crate::write::BurnProgress;

/// Snapshot published immediately before a step starts executing.
#[derive(Clone, Debug, PartialEq)]
pub struct State {
    pub operation: Operation,
    /// Share of steps completed or in flight, in `[0, 100]`, one decimal.
    pub percentage: f64,
}

/// Progress of step `index` (zero based) out of `total`, rounded to one
/// decimal. The last step always reports exactly `100.0`.
pub fn percentage(index: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let raw = (index + 1) as f64 / total as f64 * 100.0;
    (raw * 10.0).round() / 10.0
}

/// Everything a run reports to its observer.
#[derive(Debug)]
pub enum Event {
    State(State),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Burn(BurnProgress),
    /// Terminal. No event follows it.
    Error(PipelineError),
    /// Terminal. No event follows it.
    End,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::State(_) => "state",
            Event::Stdout(_) => "stdout",
            Event::Stderr(_) => "stderr",
            Event::Burn(_) => "burn",
            Event::Error(_) => "error",
            Event::End => "end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Error(_) | Event::End)
    }
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

type EndCallback = Box<dyn FnOnce() + Send>;

enum CompletionState {
    Pending(Vec<EndCallback>),
    Settled(Outcome),
}

struct CompletionInner {
    state: Mutex<CompletionState>,
    settled: watch::Sender<Option<Outcome>>,
}

/// Settle-once record of a run's outcome.
///
/// Callbacks registered with [`Completion::on_end`] while the run is pending
/// are buffered and invoked when it succeeds. Registering after a successful
/// run invokes the callback immediately. After a failed run they are dropped.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub fn new() -> Self {
        let (settled, _) = watch::channel(None);
        Self {
            inner: Arc::new(CompletionInner {
                state: Mutex::new(CompletionState::Pending(Vec::new())),
                settled,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CompletionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the outcome. Returns `false` if the completion was already
    /// settled, in which case nothing changes.
    pub fn settle(&self, outcome: Outcome) -> bool {
        let mut state = self.lock();
        if let CompletionState::Settled(_) = *state {
            return false;
        }
        let previous = std::mem::replace(&mut *state, CompletionState::Settled(outcome));
        drop(state);

        self.inner.settled.send_replace(Some(outcome));

        if let (CompletionState::Pending(callbacks), Outcome::Succeeded) = (previous, outcome) {
            for callback in callbacks {
                callback();
            }
        }
        true
    }

    /// The outcome, if the run has ended.
    pub fn outcome(&self) -> Option<Outcome> {
        match &*self.lock() {
            CompletionState::Pending(_) => None,
            CompletionState::Settled(outcome) => Some(*outcome),
        }
    }

    /// Runs `callback` once the run has ended successfully.
    pub fn on_end<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        match &mut *state {
            CompletionState::Pending(callbacks) => {
                callbacks.push(Box::new(callback));
                return;
            }
            CompletionState::Settled(Outcome::Failed) => return,
            CompletionState::Settled(Outcome::Succeeded) => {}
        }
        drop(state);
        callback();
    }

    /// Waits until the run has ended.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.inner.settled.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(Outcome::Failed),
            // The sender lives as long as `self`, so this cannot happen.
            Err(_) => Outcome::Failed,
        }
    }
}

/// The publishing side of a run. Consumed when the run ends, so a run can
/// only terminate once.
pub(crate) struct Emitter {
    events: mpsc::UnboundedSender<Event>,
    completion: Completion,
}

impl Emitter {
    /// Publishes a non-terminal event. A closed receiver means the observer
    /// went away; the run carries on regardless.
    pub(crate) fn emit(&self, event: Event) {
        debug_assert!(!event.is_terminal());
        let _ = self.events.send(event);
    }

    pub(crate) fn finish(self, result: Result<(), PipelineError>) {
        match result {
            Ok(()) => {
                let _ = self.events.send(Event::End);
                self.completion.settle(Outcome::Succeeded);
            }
            Err(err) => {
                let _ = self.events.send(Event::Error(err));
                self.completion.settle(Outcome::Failed);
            }
        }
    }
}

/// The observing side of a run.
pub struct EventStream {
    events: mpsc::UnboundedReceiver<Event>,
    completion: Completion,
}

impl EventStream {
    pub(crate) fn channel() -> (Emitter, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let completion = Completion::new();
        (
            Emitter {
                events: tx,
                completion: completion.clone(),
            },
            EventStream {
                events: rx,
                completion,
            },
        )
    }

    /// Receives the next event, or `None` once the terminal event has been
    /// delivered.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// See [`Completion::on_end`].
    pub fn on_end<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.completion.on_end(callback);
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Drains every remaining event, in order.
    pub async fn collect(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }
}
