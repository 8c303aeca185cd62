use std::fmt::{self, Display, Formatter};

use entity::market::Quote;
use entity::trading::Instruction;
use anyhow::anyhow;
use log::{debug, error, info};
use rest::AuthError;
use rust_decimal::Decimal;
use stock_symbol::Symbol;
use time::OffsetDateTime;
use tokio::time::sleep;

use super::params::{LimitPolicy, TargetChange};
use super::{fetch_quote, CancelSignal, Fetched, RunClock, RunOutcome, Timing};
use crate::broker::{OrderGateway, QuoteSource};

/// Which way a run enters: buy after a bounce off a low, or sell after a drop from a high.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    BuyLow,
    SellHigh,
}

impl Polarity {
    /// The side of the book this polarity tracks: ask when buying, bid when selling.
    fn favorable_price(self, quote: &Quote) -> Decimal {
        match self {
            Self::BuyLow => quote.ask,
            Self::SellHigh => quote.bid,
        }
    }

    fn improves_on(self, price: Decimal, held: Decimal) -> bool {
        match self {
            Self::BuyLow => price < held,
            Self::SellHigh => price > held,
        }
    }

    fn target(self, extreme: Decimal, change: Decimal) -> Option<Decimal> {
        match self {
            Self::BuyLow => extreme.checked_add(change),
            Self::SellHigh => extreme.checked_sub(change),
        }
    }

    fn target_hit(self, quote: &Quote, target: Decimal) -> bool {
        match self {
            Self::BuyLow => quote.ask > target,
            Self::SellHigh => quote.bid < target,
        }
    }

    fn limit_crossed(self, last: Decimal, limit: Decimal) -> bool {
        match self {
            Self::BuyLow => last > limit,
            Self::SellHigh => last < limit,
        }
    }

    fn default_stop(self, bid: Decimal, change: Decimal) -> Option<Decimal> {
        match self {
            Self::BuyLow => bid.checked_sub(change),
            Self::SellHigh => bid.checked_add(change),
        }
    }

    pub fn entry_instruction(self) -> Instruction {
        match self {
            Self::BuyLow => Instruction::Buy,
            Self::SellHigh => Instruction::Sell,
        }
    }

    pub fn stop_instruction(self) -> Instruction {
        match self {
            Self::BuyLow => Instruction::SellStop,
            Self::SellHigh => Instruction::BuyStop,
        }
    }
}

impl Display for Polarity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuyLow => f.write_str("buy low"),
            Self::SellHigh => f.write_str("sell high"),
        }
    }
}

/// Reference extremes of one run. `None` stands for the polarity's worst case
/// (no low seen yet when buying, no high seen yet when selling), which can never trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtremeState {
    pub held: Option<Decimal>,
    pub validated: Option<Decimal>,
    pub validated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    /// Last crossed the configured limit price. Enter at market, no stop.
    LimitCrossed,
    /// Price moved a full target change away from the validated extreme.
    TargetHit {
        target: Decimal,
        stop: Option<Decimal>,
    },
}

/// The per-tick state machine behind buy-low and sell-high runs. It does no I/O.
#[derive(Debug)]
pub struct ExtremeTracker {
    polarity: Polarity,
    change_spec: TargetChange,
    change: Option<Decimal>,
    limit: LimitPolicy,
    expiration: time::Duration,
    state: ExtremeState,
}

impl ExtremeTracker {
    pub fn new(
        polarity: Polarity,
        change_spec: TargetChange,
        known_extreme: Option<Decimal>,
        limit: LimitPolicy,
        expiration: time::Duration,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            polarity,
            change_spec,
            change: None,
            limit,
            expiration,
            state: ExtremeState {
                held: known_extreme,
                validated: known_extreme,
                validated_at: known_extreme.map(|_| now),
            },
        }
    }

    pub fn state(&self) -> ExtremeState {
        self.state
    }

    /// The absolute target change, known once the first quote has been seen.
    pub fn change(&self) -> Option<Decimal> {
        self.change
    }

    pub fn target(&self) -> Option<Decimal> {
        self.polarity.target(self.state.validated?, self.change?)
    }

    /// Fails only when the target change is too large to price against.
    pub fn observe(&mut self, quote: &Quote, now: OffsetDateTime) -> anyhow::Result<Decision> {
        let change = match self.change {
            Some(change) => change,
            None => *self.change.insert(self.change_spec.resolve(quote.last)?),
        };

        let polarity = self.polarity;
        let price = polarity.favorable_price(quote);
        let state = &mut self.state;

        // A held extreme only counts once the next tick fails to beat it
        if let Some(held) = state.held {
            if price >= held {
                state.validated = Some(held);
                state.validated_at = Some(now);
            } else {
                state.held = state.validated;
            }
        }

        if state.held.map_or(true, |held| polarity.improves_on(price, held)) {
            state.held = Some(price);
        }

        if let LimitPolicy::Price(limit) = self.limit {
            return Ok(if polarity.limit_crossed(quote.last, limit) {
                Decision::LimitCrossed
            } else {
                Decision::Continue
            });
        }

        if let Some(validated) = state.validated {
            let target = polarity
                .target(validated, change)
                .ok_or_else(|| out_of_range(validated, change))?;

            if polarity.target_hit(quote, target) {
                let stop = match self.limit {
                    LimitPolicy::None => None,
                    LimitPolicy::DefaultStop => Some(
                        polarity
                            .default_stop(quote.bid, change)
                            .ok_or_else(|| out_of_range(quote.bid, change))?,
                    ),
                    LimitPolicy::Price(price) => Some(price),
                };

                return Ok(Decision::TargetHit {
                    target,
                    // Half-to-even: an exact half cent goes to the even cent
                    stop: stop.map(|stop| stop.round_dp(2)),
                });
            }
        }

        if matches!(state.validated_at, Some(at) if now - at > self.expiration) {
            *state = ExtremeState::default();
        }

        Ok(Decision::Continue)
    }
}

fn out_of_range(price: Decimal, change: Decimal) -> anyhow::Error {
    anyhow!("Target change {change} is out of range around {price}")
}

/// Arguments of one buy-low or sell-high run.
#[derive(Debug, Clone)]
pub struct ExtremeRun {
    pub polarity: Polarity,
    pub symbol: Symbol,
    pub shares: u32,
    pub change: TargetChange,
    pub known_extreme: Option<Decimal>,
    pub limit: LimitPolicy,
}

impl Display for ExtremeRun {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} (change {}, limit {})",
            self.polarity, self.symbol, self.shares, self.change, self.limit
        )
    }
}

impl ExtremeRun {
    /// Polls until the run triggers or is cancelled. Only authentication failures are
    /// returned as errors.
    pub async fn run(
        &self,
        quotes: &dyn QuoteSource,
        orders: &dyn OrderGateway,
        timing: Timing,
        mut cancel: CancelSignal,
    ) -> anyhow::Result<RunOutcome> {
        let clock = RunClock::new();
        let mut tracker = ExtremeTracker::new(
            self.polarity,
            self.change,
            self.known_extreme,
            self.limit,
            timing.extreme_expiration,
            clock.now(),
        );
        let symbol = self.symbol;
        let mut tick = 1usize;

        info!("Starting {self}");

        loop {
            let quote = match fetch_quote(quotes, symbol).await? {
                Fetched::Quote(quote) => quote,
                Fetched::Retry => {
                    if cancel.pause(timing.quote_retry_delay).await {
                        return Ok(RunOutcome::Cancelled);
                    }
                    continue;
                }
            };

            let decision = tracker.observe(&quote, clock.now())?;
            self.log_tick(tick, &tracker, &quote);

            match decision {
                Decision::Continue => (),
                Decision::LimitCrossed => {
                    info!("{symbol} last {} crossed the limit", quote.last);
                    let instruction = self.polarity.entry_instruction();
                    return Ok(match self.submit(orders, instruction, None).await? {
                        true => RunOutcome::Entered {
                            instruction,
                            stop: None,
                        },
                        false => RunOutcome::OrderFailed,
                    });
                }
                Decision::TargetHit { target, stop } => {
                    info!("{symbol} target {target} hit");
                    return self.enter(orders, timing, stop).await;
                }
            }

            tick += 1;
            if cancel.pause(timing.poll_interval).await {
                return Ok(RunOutcome::Cancelled);
            }
        }
    }

    async fn enter(
        &self,
        orders: &dyn OrderGateway,
        timing: Timing,
        stop: Option<Decimal>,
    ) -> anyhow::Result<RunOutcome> {
        let instruction = self.polarity.entry_instruction();
        if !self.submit(orders, instruction, None).await? {
            return Ok(RunOutcome::OrderFailed);
        }

        let stop = match stop {
            Some(stop) if stop > Decimal::ZERO => stop,
            _ => {
                return Ok(RunOutcome::Entered {
                    instruction,
                    stop: None,
                })
            }
        };

        // Give the entry order time to fill before protecting it
        sleep(timing.stop_order_delay).await;

        let placed = self
            .submit(orders, self.polarity.stop_instruction(), Some(stop))
            .await?;
        Ok(RunOutcome::Entered {
            instruction,
            stop: placed.then_some(stop),
        })
    }

    /// Returns whether the broker accepted the order. Submission errors other than
    /// authentication failures are logged and reported as a rejection.
    async fn submit(
        &self,
        orders: &dyn OrderGateway,
        instruction: Instruction,
        price: Option<Decimal>,
    ) -> anyhow::Result<bool> {
        let symbol = self.symbol;
        let shares = self.shares;
        match price {
            Some(price) => info!("{instruction} {symbol} {shares} {price}"),
            None => info!("{instruction} {symbol} {shares}"),
        }

        match orders.place_order(instruction, symbol, shares, price).await {
            Ok(response) if response.accepted() => {
                info!("{response}");
                Ok(true)
            }
            Ok(response) => {
                error!("{instruction} order for {symbol} was not accepted: {response}");
                Ok(false)
            }
            Err(error) if error.is::<AuthError>() => Err(error),
            Err(error) => {
                error!("Failed to place {instruction} order for {symbol}: {error:?}");
                Ok(false)
            }
        }
    }

    fn log_tick(&self, tick: usize, tracker: &ExtremeTracker, quote: &Quote) {
        let state = tracker.state();
        let (label, price) = match self.polarity {
            Polarity::BuyLow => ("ASK", quote.ask),
            Polarity::SellHigh => ("BID", quote.bid),
        };

        debug!(
            "{tick}: {}; Hold extreme: {}; Extreme {label}: {}; {label}: {price}; Target: {} ({})",
            self.symbol,
            display_or_unset(state.held),
            display_or_unset(state.validated),
            display_or_unset(tracker.target()),
            display_or_unset(tracker.change().map(|change| change.round_dp(2))),
        );
    }
}

fn display_or_unset(value: Option<Decimal>) -> String {
    value.map_or_else(|| "unset".to_owned(), |value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::{RecordingGateway, ScriptedQuotes, ScriptedTick};
    use crate::controller::cancel_pair;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use time::macros::datetime;

    const START: OffsetDateTime = datetime!(2024-10-03 14:00:00 UTC);

    fn xle() -> Symbol {
        Symbol::from_str("XLE").unwrap()
    }

    fn quote(ask: Decimal, bid: Decimal) -> Quote {
        Quote {
            symbol: xle(),
            last: ask,
            bid,
            ask,
        }
    }

    fn tracker(polarity: Polarity, change: TargetChange, limit: LimitPolicy) -> ExtremeTracker {
        ExtremeTracker::new(
            polarity,
            change,
            None,
            limit,
            time::Duration::minutes(30),
            START,
        )
    }

    /// Feeds `(ask, bid)` pairs one second apart and returns the index of the first
    /// tick that did not say `Continue`.
    fn first_trigger(
        tracker: &mut ExtremeTracker,
        pairs: &[(Decimal, Decimal)],
    ) -> Option<(usize, Decision)> {
        pairs.iter().enumerate().find_map(|(index, &(ask, bid))| {
            let now = START + time::Duration::seconds(index as i64);
            match tracker.observe(&quote(ask, bid), now).unwrap() {
                Decision::Continue => None,
                decision => Some((index, decision)),
            }
        })
    }

    #[test]
    fn buy_low_waits_for_a_full_move_off_the_validated_low() {
        let mut tracker = tracker(
            Polarity::BuyLow,
            TargetChange::Absolute(dec!(0.05)),
            LimitPolicy::None,
        );
        let pairs = [
            (dec!(78.22), dec!(78.21)),
            (dec!(78.23), dec!(78.22)),
            (dec!(78.20), dec!(78.19)),
            (dec!(78.21), dec!(78.20)),
            (dec!(78.24), dec!(78.23)),
            (dec!(78.26), dec!(78.25)),
            (dec!(78.27), dec!(78.26)),
        ];

        let (index, decision) = first_trigger(&mut tracker, &pairs).unwrap();
        assert_eq!(index, 5);
        assert_eq!(
            decision,
            Decision::TargetHit {
                target: dec!(78.25),
                stop: None
            }
        );
    }

    #[test]
    fn percent_change_resolves_from_the_first_last_price() {
        let mut tracker = tracker(
            Polarity::BuyLow,
            TargetChange::Percent(dec!(0.0025)),
            LimitPolicy::DefaultStop,
        );
        let pairs = [
            (dec!(78.22), dec!(78.22)),
            (dec!(78.23), dec!(78.22)),
            (dec!(78.23), dec!(78.22)),
            (dec!(78.30), dec!(78.28)),
            (dec!(78.41), dec!(78.39)),
            (dec!(78.42), dec!(78.40)),
        ];

        let (index, decision) = first_trigger(&mut tracker, &pairs).unwrap();
        assert_eq!(tracker.change(), Some(dec!(0.19555)));
        assert_eq!(index, 5);
        assert_eq!(
            decision,
            Decision::TargetHit {
                target: dec!(78.41555),
                stop: Some(dec!(78.20)),
            }
        );
    }

    #[test]
    fn sell_high_mirrors_buy_low() {
        let mut tracker = tracker(
            Polarity::SellHigh,
            TargetChange::Absolute(dec!(0.10)),
            LimitPolicy::DefaultStop,
        );
        let pairs = [
            (dec!(50.02), dec!(50.00)),
            (dec!(50.01), dec!(49.99)),
            (dec!(50.12), dec!(50.10)),
            (dec!(50.11), dec!(50.10)),
            (dec!(50.02), dec!(50.00)),
            (dec!(49.98), dec!(49.97)),
        ];

        let (index, decision) = first_trigger(&mut tracker, &pairs).unwrap();
        assert_eq!(index, 5);
        assert_eq!(
            decision,
            Decision::TargetHit {
                target: dec!(50.00),
                stop: Some(dec!(50.07)),
            }
        );
    }

    #[test]
    fn limit_overrides_target_logic() {
        let mut tracker = tracker(
            Polarity::BuyLow,
            TargetChange::Absolute(dec!(0.01)),
            LimitPolicy::Price(dec!(78.30)),
        );
        let pairs = [
            (dec!(78.22), dec!(78.22)),
            (dec!(78.23), dec!(78.22)),
            (dec!(78.29), dec!(78.28)),
            (dec!(78.30), dec!(78.29)),
            (dec!(78.31), dec!(78.30)),
        ];

        let (index, decision) = first_trigger(&mut tracker, &pairs).unwrap();
        assert_eq!(index, 4);
        assert_eq!(decision, Decision::LimitCrossed);
    }

    #[test]
    fn unset_extreme_never_triggers() {
        let mut tracker = tracker(
            Polarity::SellHigh,
            TargetChange::Absolute(dec!(0.05)),
            LimitPolicy::None,
        );

        assert_eq!(
            tracker.observe(&quote(dec!(10), dec!(0.01)), START).unwrap(),
            Decision::Continue
        );
        assert_eq!(tracker.state().validated, None);
        assert_eq!(tracker.target(), None);
    }

    #[test]
    fn known_extreme_is_validated_from_the_start() {
        let mut tracker = ExtremeTracker::new(
            Polarity::BuyLow,
            TargetChange::Absolute(dec!(0.10)),
            Some(dec!(78.00)),
            LimitPolicy::None,
            time::Duration::minutes(30),
            START,
        );

        assert_eq!(
            tracker.observe(&quote(dec!(78.11), dec!(78.10)), START).unwrap(),
            Decision::TargetHit {
                target: dec!(78.10),
                stop: None
            }
        );
    }

    #[test]
    fn stale_extreme_resets_after_thirty_minutes() {
        let mut tracker = tracker(
            Polarity::BuyLow,
            TargetChange::Absolute(dec!(1)),
            LimitPolicy::None,
        );

        tracker.observe(&quote(dec!(78.22), dec!(78.21)), START).unwrap();
        let validated_at = START + time::Duration::seconds(1);
        tracker.observe(&quote(dec!(78.23), dec!(78.22)), validated_at).unwrap();
        assert_eq!(tracker.state().validated, Some(dec!(78.22)));

        // Steadily falling prices never re-validate
        let mut ask = dec!(78.21);
        for minute in 1..=30 {
            let now = validated_at + time::Duration::minutes(minute);
            tracker.observe(&quote(ask, ask), now).unwrap();
            assert_eq!(tracker.state().validated_at, Some(validated_at));
            ask -= dec!(0.01);
        }
        assert!(tracker.state().held.is_some());

        let late = validated_at + time::Duration::minutes(30) + time::Duration::seconds(1);
        tracker.observe(&quote(ask, ask), late).unwrap();
        assert_eq!(tracker.state(), ExtremeState::default());

        tracker.observe(&quote(dec!(77.5), dec!(77.5)), late).unwrap();
        assert_eq!(tracker.state().held, Some(dec!(77.5)));
        assert_eq!(tracker.state().validated, None);
    }

    #[test]
    fn stale_high_resets_and_must_revalidate() {
        let mut tracker = tracker(
            Polarity::SellHigh,
            TargetChange::Absolute(dec!(10)),
            LimitPolicy::None,
        );
        let tick = |bid: Decimal| quote(bid + dec!(0.01), bid);

        tracker.observe(&tick(dec!(50.00)), START).unwrap();
        let validated_at = START + time::Duration::seconds(1);
        tracker.observe(&tick(dec!(50.00)), validated_at).unwrap();
        assert_eq!(tracker.state().validated, Some(dec!(50.00)));

        // Falling bids stay short of the target and never re-validate
        let mut bid = dec!(49.99);
        for minute in 1..=30 {
            let now = validated_at + time::Duration::minutes(minute);
            tracker.observe(&tick(bid), now).unwrap();
            assert_eq!(tracker.state().validated_at, Some(validated_at));
            bid -= dec!(0.01);
        }

        let late = validated_at + time::Duration::minutes(30) + time::Duration::seconds(1);
        tracker.observe(&tick(bid), late).unwrap();
        assert_eq!(tracker.state(), ExtremeState::default());

        // Far below the old target, but there is no validated high any more
        assert_eq!(
            tracker.observe(&tick(dec!(30.00)), late).unwrap(),
            Decision::Continue
        );
        assert_eq!(tracker.state().validated, None);

        tracker.observe(&tick(dec!(31.00)), late).unwrap();
        assert_eq!(tracker.state().validated, Some(dec!(30.00)));
        assert_eq!(
            tracker.observe(&tick(dec!(19.99)), late).unwrap(),
            Decision::TargetHit {
                target: dec!(20.00),
                stop: None
            }
        );
    }

    #[test]
    fn oversized_change_is_an_error_not_a_panic() {
        let mut percent = tracker(
            Polarity::BuyLow,
            TargetChange::Percent(dec!(10000000000000000000000000000)),
            LimitPolicy::None,
        );
        assert!(percent.observe(&quote(dec!(78.22), dec!(78.21)), START).is_err());

        let mut absolute = tracker(
            Polarity::BuyLow,
            TargetChange::Absolute(Decimal::MAX),
            LimitPolicy::None,
        );
        absolute.observe(&quote(dec!(78.22), dec!(78.21)), START).unwrap();
        assert!(absolute.observe(&quote(dec!(78.23), dec!(78.22)), START).is_err());
    }

    #[test]
    fn default_stop_rounds_half_cents_to_even() {
        let mut tracker = tracker(
            Polarity::BuyLow,
            TargetChange::Absolute(dec!(0.005)),
            LimitPolicy::DefaultStop,
        );
        let pairs = [
            (dec!(78.22), dec!(78.21)),
            (dec!(78.22), dec!(78.21)),
            (dec!(78.24), dec!(78.23)),
        ];

        let (_, decision) = first_trigger(&mut tracker, &pairs).unwrap();
        assert_eq!(
            decision,
            Decision::TargetHit {
                target: dec!(78.225),
                stop: Some(dec!(78.22)),
            }
        );
    }

    proptest! {
        #[test]
        fn held_low_never_rises(asks in prop::collection::vec(7_000i64..9_000, 1..200)) {
            let mut tracker = tracker(
                Polarity::BuyLow,
                TargetChange::Absolute(dec!(1000)),
                LimitPolicy::None,
            );
            let mut previous: Option<Decimal> = None;

            for cents in asks {
                let ask = Decimal::new(cents, 2);
                tracker.observe(&quote(ask, ask), START).unwrap();
                let state = tracker.state();
                let held = state.held.unwrap();

                prop_assert!(held <= ask);
                if let Some(previous) = previous {
                    prop_assert!(held <= previous);
                }
                if let Some(validated) = state.validated {
                    prop_assert!(held <= validated);
                }
                previous = Some(held);
            }
        }
    }

    fn run(polarity: Polarity, limit: LimitPolicy) -> ExtremeRun {
        ExtremeRun {
            polarity,
            symbol: xle(),
            shares: 10,
            change: TargetChange::Absolute(dec!(0.05)),
            known_extreme: None,
            limit,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn driver_places_entry_then_stop() {
        let quotes = ScriptedQuotes::from_ask_bid(&[
            (dec!(78.22), dec!(78.21)),
            (dec!(78.23), dec!(78.22)),
            (dec!(78.28), dec!(78.27)),
        ]);
        let orders = RecordingGateway::accepting();
        let (_handle, signal) = cancel_pair();
        let start = tokio::time::Instant::now();

        let outcome = run(Polarity::BuyLow, LimitPolicy::DefaultStop)
            .run(&quotes, &orders, Timing::default(), signal)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Entered {
                instruction: Instruction::Buy,
                stop: Some(dec!(78.22)),
            }
        );
        let placed = orders.placed();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].instruction, Instruction::Buy);
        assert_eq!(placed[0].price, None);
        assert_eq!(placed[1].instruction, Instruction::SellStop);
        assert_eq!(placed[1].price, Some(dec!(78.22)));
        // Two poll intervals, then the stop delay
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn driver_retries_soft_quote_failures() {
        let quotes = ScriptedQuotes::new([
            ScriptedTick::Empty,
            ScriptedTick::Fails,
            ScriptedTick::Quote {
                last: dec!(78.31),
                bid: dec!(78.30),
                ask: dec!(78.31),
            },
        ]);
        let orders = RecordingGateway::accepting();
        let (_handle, signal) = cancel_pair();
        let start = tokio::time::Instant::now();

        let outcome = run(Polarity::BuyLow, LimitPolicy::Price(dec!(78.30)))
            .run(&quotes, &orders, Timing::default(), signal)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Entered {
                instruction: Instruction::Buy,
                stop: None,
            }
        );
        assert_eq!(quotes.served(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_entry_ends_the_run_without_a_stop() {
        let quotes = ScriptedQuotes::from_ask_bid(&[
            (dec!(78.22), dec!(78.21)),
            (dec!(78.23), dec!(78.22)),
            (dec!(78.28), dec!(78.27)),
        ]);
        let orders = RecordingGateway::rejecting("insufficient buying power");
        let (_handle, signal) = cancel_pair();

        let outcome = run(Polarity::BuyLow, LimitPolicy::DefaultStop)
            .run(&quotes, &orders, Timing::default(), signal)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::OrderFailed);
        assert_eq!(orders.placed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_between_ticks() {
        // Runs out of script and keeps retrying until cancelled
        let quotes = ScriptedQuotes::from_last(&[dec!(78.22)]);
        let orders = RecordingGateway::accepting();
        let (handle, signal) = cancel_pair();
        let run = run(Polarity::SellHigh, LimitPolicy::None);

        let driver = run.run(&quotes, &orders, Timing::default(), signal);
        let canceller = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            handle.cancel();
        };
        let (outcome, ()) = tokio::join!(driver, canceller);

        assert_eq!(outcome.unwrap(), RunOutcome::Cancelled);
        assert!(orders.placed().is_empty());
    }
}
