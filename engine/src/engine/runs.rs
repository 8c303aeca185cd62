use std::collections::HashMap;
use std::future::Future;

use anyhow::anyhow;
use stock_symbol::Symbol;
use time::OffsetDateTime;
use tokio::task::{self, JoinSet};

use crate::controller::{cancel_pair, CancelHandle, CancelSignal, RunOutcome};
use crate::event::{EngineEvent, EventEmitter, EventReceiver, RunEvent};

pub struct ActiveRun {
    pub id: u64,
    pub description: String,
    pub started: OffsetDateTime,
    handle: CancelHandle,
}

/// Controller runs currently executing, at most one per symbol.
pub struct RunRegistry {
    runs: HashMap<Symbol, ActiveRun>,
    next_id: u64,
    tasks: JoinSet<()>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            runs: HashMap::new(),
            next_id: 0,
            tasks: JoinSet::new(),
        }
    }

    /// Starts `run` as a background task unless `symbol` already has one. Exactly one
    /// `RunEvent::Finished` is emitted when it ends, even if it panics.
    pub fn spawn<F, Fut>(
        &mut self,
        symbol: Symbol,
        description: String,
        now: OffsetDateTime,
        emitter: EventEmitter<RunEvent>,
        run: F,
    ) -> bool
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<RunOutcome>> + Send + 'static,
    {
        let Some((id, signal)) = self.start(symbol, description, now) else {
            return false;
        };

        let run = task::spawn(run(signal));
        self.tasks.spawn(async move {
            let result = match run.await {
                Ok(result) => result,
                Err(error) => Err(anyhow!("Run ended abnormally: {error}")),
            };
            emitter.emit(RunEvent::Finished { symbol, id, result }).await;
        });

        true
    }

    fn start(
        &mut self,
        symbol: Symbol,
        description: String,
        now: OffsetDateTime,
    ) -> Option<(u64, CancelSignal)> {
        if self.runs.contains_key(&symbol) {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;

        let (handle, signal) = cancel_pair();
        self.runs.insert(
            symbol,
            ActiveRun {
                id,
                description,
                started: now,
                handle,
            },
        );

        Some((id, signal))
    }

    /// Forgets a run that has ended. Ids that no longer match are ignored.
    pub fn finish(&mut self, symbol: Symbol, id: u64) -> Option<ActiveRun> {
        match self.runs.get(&symbol) {
            Some(run) if run.id == id => self.runs.remove(&symbol),
            _ => None,
        }
    }

    /// Asks the run for `symbol` to stop at its next tick. It stays registered until it
    /// reports back.
    pub fn cancel(&self, symbol: Symbol) -> bool {
        match self.runs.get(&symbol) {
            Some(run) => {
                run.handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        self.runs.values().for_each(|run| run.handle.cancel());
        self.runs.len()
    }

    /// Resolves once some finished task has been collected, or immediately with `None`
    /// when no task is left.
    pub async fn reap(&mut self) -> Option<()> {
        self.tasks.join_next().await.map(|_| ())
    }

    /// Cancels every run and waits for all of them to end, so an order in flight or a
    /// pending protective stop still goes out. Their finished events are collected from
    /// `events` meanwhile; anything else queued there is dropped.
    pub async fn shutdown(&mut self, events: &mut EventReceiver) -> Vec<RunEvent> {
        self.cancel_all();

        let mut finished = Vec::new();
        let mut keep = |event: EngineEvent| {
            if let EngineEvent::Run(event) = event {
                finished.push(event);
            }
        };

        loop {
            tokio::select! {
                joined = self.tasks.join_next() => if joined.is_none() {
                    break;
                },
                Some(event) = events.next() => keep(event),
            }
        }

        while let Some(event) = events.try_next() {
            keep(event);
        }

        finished
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Symbol, &ActiveRun)> + '_ {
        self.runs.iter().map(|(&symbol, run)| (symbol, run))
    }
}
