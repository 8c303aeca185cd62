//! Polling controllers that watch one symbol and place an entry order when their
//! trigger condition is met.

pub mod extreme;
pub mod params;
pub mod range;

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use common::config::ControllerConfig;
use entity::market::Quote;
use entity::trading::Instruction;
use log::warn;
use rest::AuthError;
use rust_decimal::Decimal;
use stock_symbol::Symbol;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use crate::broker::QuoteSource;

pub use extreme::{ExtremeRun, Polarity};
pub use range::{RangeMode, RangeRun};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The entry order was accepted. `stop` is the protective stop placed after it, if any.
    Entered {
        instruction: Instruction,
        stop: Option<Decimal>,
    },
    /// The broker refused an order or it could not be sent. Nothing is retried.
    OrderFailed,
    Cancelled,
}

impl Display for RunOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entered {
                instruction,
                stop: Some(stop),
            } => write!(f, "entered with {instruction}, stop at {stop}"),
            Self::Entered {
                instruction,
                stop: None,
            } => write!(f, "entered with {instruction}"),
            Self::OrderFailed => f.write_str("order failed"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub poll_interval: Duration,
    pub quote_retry_delay: Duration,
    pub stop_order_delay: Duration,
    pub extreme_expiration: time::Duration,
    pub range_poll_interval: Duration,
}

impl From<&ControllerConfig> for Timing {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            quote_retry_delay: config.quote_retry_delay(),
            stop_order_delay: config.stop_order_delay(),
            extreme_expiration: config.extreme_expiration(),
            range_poll_interval: config.range_poll_interval(),
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

/// Held by whoever may stop a run.
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        // The run may have finished already, in which case there is nobody to tell
        let _ = self.0.send(true);
    }
}

/// Checked by the run between ticks only.
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// Sleeps for `duration` and returns `true` if the run was cancelled in the meantime.
    /// A dropped handle counts as a cancellation.
    pub async fn pause(&mut self, duration: Duration) -> bool {
        if *self.0.borrow() {
            return true;
        }

        tokio::select! {
            _ = sleep(duration) => *self.0.borrow(),
            changed = self.0.changed() => changed.is_err() || *self.0.borrow(),
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

/// Wall-clock time derived from the tokio clock, so paused-time tests see it advance.
struct RunClock {
    wall_start: OffsetDateTime,
    start: Instant,
}

impl RunClock {
    fn new() -> Self {
        Self {
            wall_start: OffsetDateTime::now_utc(),
            start: Instant::now(),
        }
    }

    fn now(&self) -> OffsetDateTime {
        self.wall_start + self.start.elapsed()
    }
}

enum Fetched {
    Quote(Quote),
    Retry,
}

/// Reads one quote. Soft failures are logged and turned into `Retry`; authentication
/// failures are passed up.
async fn fetch_quote(quotes: &dyn QuoteSource, symbol: Symbol) -> anyhow::Result<Fetched> {
    match quotes.quote(symbol).await {
        Ok(Some(quote)) => Ok(Fetched::Quote(quote)),
        Ok(None) => {
            warn!("No quote returned for {symbol}, retrying");
            Ok(Fetched::Retry)
        }
        Err(error) if error.is::<AuthError>() => Err(error),
        Err(error) => {
            warn!("Error getting quote for {symbol}, retrying: {error:#}");
            Ok(Fetched::Retry)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pause_reports_cancellation() {
        let (handle, mut signal) = cancel_pair();
        assert!(!signal.pause(Duration::from_secs(1)).await);

        handle.cancel();
        assert!(signal.pause(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_cancels() {
        let (handle, mut signal) = cancel_pair();
        drop(handle);
        assert!(signal.pause(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn run_clock_follows_tokio_time() {
        let clock = RunClock::new();
        let before = clock.now();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now() - before, time::Duration::seconds(90));
    }
}
