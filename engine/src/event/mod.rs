pub mod command;

use std::{fmt::Debug, marker::PhantomData};

use entity::trading::Instruction;
use log::warn;
use rest::PriceSource;
use stock_symbol::Symbol;
use tokio::sync::mpsc::{channel, Receiver, Sender};

use crate::controller::{ExtremeRun, RangeRun, RunOutcome};

pub struct EventReceiver {
    rx: Receiver<EngineEvent>,
    tx: Sender<EngineEvent>,
}

impl EventReceiver {
    pub fn new() -> Self {
        let (tx, rx) = channel(16);

        Self { rx, tx }
    }

    pub fn new_emitter<T: Into<EngineEvent> + Debug>(&self) -> EventEmitter<T> {
        EventEmitter {
            tx: self.tx.clone(),
            _marker: PhantomData,
        }
    }

    pub async fn next(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    /// An event that is already queued, without waiting for one.
    pub fn try_next(&mut self) -> Option<EngineEvent> {
        self.rx.try_recv().ok()
    }
}

pub struct EventEmitter<T> {
    tx: Sender<EngineEvent>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Into<EngineEvent> + Debug> EventEmitter<T> {
    pub async fn emit(&self, event: T) {
        if let Err(error) = self.tx.send(event.into()).await {
            warn!("Failed to emit event: {:?}", error.0);
        }
    }
}

impl<T> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            _marker: PhantomData,
        }
    }
}

#[derive(Debug)]
pub enum EngineEvent {
    Command(Command),
    Run(RunEvent),
}

impl From<Command> for EngineEvent {
    fn from(event: Command) -> Self {
        Self::Command(event)
    }
}

impl From<RunEvent> for EngineEvent {
    fn from(event: RunEvent) -> Self {
        Self::Run(event)
    }
}

#[derive(Debug)]
pub enum Command {
    Quote {
        symbols: Vec<Symbol>,
    },
    Order {
        instruction: Instruction,
        symbol: Symbol,
        shares: u32,
        price: PriceSource,
    },
    Balance,
    Positions {
        symbols: Vec<Symbol>,
    },
    Extreme(ExtremeRun),
    Range(RangeRun),
    Transactions {
        symbols: Vec<Symbol>,
        days_ago: u32,
    },
    Flatten,
    Runs,
    Cancel {
        symbol: Option<Symbol>,
    },
    Stop,
}

/// Sent by a controller task when it ends.
#[derive(Debug)]
pub enum RunEvent {
    Finished {
        symbol: Symbol,
        id: u64,
        result: anyhow::Result<RunOutcome>,
    },
}
