//! Per-position exit state machine.
//!
//! Each evaluation takes the latest market snapshot for one position and
//! decides whether to hold or exit. Rules are checked in a fixed priority
//! order and the first rule that fires wins:
//!
//! 1. Emergency stop on last-traded price.
//! 2. Hidden stop-loss confirmed by consecutive candle closes.
//! 3. Profit target.
//! 4. Trend flip (strong-trend regime only).
//! 5. Trailing stop breach.
//! 6. Fixed stop breach on last-traded price (only when candle
//!    confirmation is disabled).
//!
//! Trailing updates happen before the exit checks so a stop raised on this
//! tick is the stop that is tested. Stops only ever move in the position's
//! favor.

use chrono::{DateTime, Utc};
use market_core::config::{ExitConfig, TrailingParams};
use market_core::types::{Candle, ExitPhase, ExitReason, ExitSignal, Position};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Market inputs for one evaluation of one position.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    /// Last traded price.
    pub ltp: Decimal,
    /// Most recent completed candle, if one was fetched.
    pub closed_candle: Option<Candle>,
    /// Current trend strength (ADX); non-finite values are ignored.
    pub trend_strength: Option<f64>,
    /// Whether the trend now runs against the position.
    pub trend_reversal: bool,
    pub observed_at: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn tick(ltp: Decimal, observed_at: DateTime<Utc>) -> Self {
        Self {
            ltp,
            closed_candle: None,
            trend_strength: None,
            trend_reversal: false,
            observed_at,
        }
    }

    pub fn with_candle(mut self, candle: Candle) -> Self {
        self.closed_candle = Some(candle);
        self
    }

    pub fn with_trend_strength(mut self, strength: f64) -> Self {
        self.trend_strength = Some(strength);
        self
    }

    pub fn with_trend_reversal(mut self, reversed: bool) -> Self {
        self.trend_reversal = reversed;
        self
    }
}

/// Trailing regime selected from trend strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendRegime {
    Strong,
    Weak,
}

/// Side-channel record of what an evaluation changed or ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    TrailingEngaged {
        regime: TrendRegime,
        peak_profit_pct: Decimal,
    },
    StopRaised {
        from: Decimal,
        to: Decimal,
        regime: TrendRegime,
    },
    StopWarning {
        count: u32,
        close: Decimal,
        stop: Decimal,
    },
    StopWarningReset {
        close: Decimal,
        stop: Decimal,
    },
    /// Candle was not newer than the last one evaluated.
    StaleCandle {
        candle: DateTime<Utc>,
        last_evaluated: DateTime<Utc>,
    },
    InvalidInput {
        detail: String,
    },
}

/// What the caller should do with the position.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitDecision {
    Hold,
    /// Exit decided on this evaluation.
    Exit(ExitSignal),
    /// Exit was decided earlier and has not been registered yet.
    ExitPending(ExitSignal),
}

impl ExitDecision {
    pub fn signal(&self) -> Option<&ExitSignal> {
        match self {
            Self::Hold => None,
            Self::Exit(signal) | Self::ExitPending(signal) => Some(signal),
        }
    }

    pub fn is_exit(&self) -> bool {
        self.signal().is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: ExitDecision,
    pub audit: Vec<AuditEvent>,
}

impl Evaluation {
    fn hold(audit: Vec<AuditEvent>) -> Self {
        Self {
            decision: ExitDecision::Hold,
            audit,
        }
    }
}

/// Stateless rule engine; all per-position state lives on [`Position`].
#[derive(Debug, Clone, Default)]
pub struct ExitStateMachine {
    config: ExitConfig,
}

impl ExitStateMachine {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    /// Evaluate `position` against `snapshot`, mutating its exit state.
    ///
    /// Once an exit is decided the position is frozen and every later call
    /// returns [`ExitDecision::ExitPending`] with the same signal.
    pub fn evaluate(&self, position: &mut Position, snapshot: &MarketSnapshot) -> Evaluation {
        let mut audit = Vec::new();

        if position.is_closed() {
            return match &position.exit_signal {
                Some(signal) => Evaluation {
                    decision: ExitDecision::ExitPending(signal.clone()),
                    audit,
                },
                None => {
                    audit.push(AuditEvent::InvalidInput {
                        detail: format!("{} is closed without an exit signal", position.symbol),
                    });
                    Evaluation::hold(audit)
                }
            };
        }

        if snapshot.ltp <= Decimal::ZERO {
            warn!(symbol = %position.symbol, ltp = %snapshot.ltp, "Ignoring non-positive LTP");
            audit.push(AuditEvent::InvalidInput {
                detail: format!("non-positive ltp {}", snapshot.ltp),
            });
            return Evaluation::hold(audit);
        }
        let ltp = snapshot.ltp;

        let loss_pct = position.loss_pct(ltp);
        if loss_pct >= self.config.emergency_stop_pct {
            let message = format!(
                "Emergency stop: loss {:.2}% >= {}% at {}",
                loss_pct, self.config.emergency_stop_pct, ltp
            );
            return self.exit(position, ltp, ExitReason::EmergencyStop, message, snapshot, audit);
        }

        let candle = self.fresh_candle(position, snapshot, &mut audit);

        position.highest_favorable_price =
            position.more_favorable(position.highest_favorable_price, ltp);

        let regime = self.regime(position, snapshot, &mut audit);
        self.update_trailing(position, regime, &mut audit);

        if let Some(candle) = candle {
            if self.config.confirm_stop_on_candle_close && position.phase != ExitPhase::Trailing {
                if let Some((price, message)) =
                    self.check_hidden_stop(position, &candle, &mut audit)
                {
                    return self.exit(
                        position,
                        price,
                        ExitReason::HiddenStopLoss,
                        message,
                        snapshot,
                        audit,
                    );
                }
            }
        }

        let profit_pct = position.profit_pct(ltp);
        if profit_pct >= self.config.profit_target_pct {
            let message = format!(
                "Profit target: {:.2}% >= {}% at {}",
                profit_pct, self.config.profit_target_pct, ltp
            );
            return self.exit(position, ltp, ExitReason::ProfitTarget, message, snapshot, audit);
        }

        if self.config.trend_flip_exit_enabled
            && regime == TrendRegime::Strong
            && snapshot.trend_reversal
        {
            let message = format!(
                "Trend flipped against {:?} position at {}",
                position.direction, ltp
            );
            return self.exit(position, ltp, ExitReason::TrendFlip, message, snapshot, audit);
        }

        if position.phase == ExitPhase::Trailing
            && position.breaches(ltp, position.current_stop_loss)
        {
            let message = format!(
                "Trailing stop {} hit at {} (peak {})",
                position.current_stop_loss, ltp, position.highest_favorable_price
            );
            return self.exit(position, ltp, ExitReason::TrailingStop, message, snapshot, audit);
        }

        if !self.config.confirm_stop_on_candle_close
            && position.phase != ExitPhase::Trailing
            && position.breaches(ltp, position.current_stop_loss)
        {
            let message = format!("Stop loss {} hit at {}", position.current_stop_loss, ltp);
            return self.exit(position, ltp, ExitReason::StopLoss, message, snapshot, audit);
        }

        Evaluation::hold(audit)
    }

    /// Select the trailing regime.
    ///
    /// Uses the current strength when finite, then the strength recorded at
    /// entry, and falls back to the weak regime.
    pub fn regime(
        &self,
        position: &Position,
        snapshot: &MarketSnapshot,
        audit: &mut Vec<AuditEvent>,
    ) -> TrendRegime {
        let current = match snapshot.trend_strength {
            Some(strength) if strength.is_finite() => Some(strength),
            Some(strength) => {
                audit.push(AuditEvent::InvalidInput {
                    detail: format!("non-finite trend strength {}", strength),
                });
                None
            }
            None => None,
        };
        let strength = current.or(position.entry_trend_strength.filter(|s| s.is_finite()));

        match strength {
            Some(s) if s >= self.config.strong_trend_threshold => TrendRegime::Strong,
            _ => TrendRegime::Weak,
        }
    }

    fn params(&self, regime: TrendRegime) -> &TrailingParams {
        match regime {
            TrendRegime::Strong => &self.config.strong_trend,
            TrendRegime::Weak => &self.config.weak_trend,
        }
    }

    /// Return the snapshot's candle if it has not been evaluated yet.
    fn fresh_candle(
        &self,
        position: &mut Position,
        snapshot: &MarketSnapshot,
        audit: &mut Vec<AuditEvent>,
    ) -> Option<Candle> {
        let candle = snapshot.closed_candle.as_ref()?;

        if let Some(last) = position.last_evaluated_candle {
            if candle.timestamp <= last {
                debug!(
                    symbol = %position.symbol,
                    candle = %candle.timestamp,
                    "Candle already evaluated"
                );
                audit.push(AuditEvent::StaleCandle {
                    candle: candle.timestamp,
                    last_evaluated: last,
                });
                return None;
            }
        }

        position.last_evaluated_candle = Some(candle.timestamp);
        if !candle.is_valid() {
            warn!(symbol = %position.symbol, candle = ?candle, "Ignoring malformed candle");
            audit.push(AuditEvent::InvalidInput {
                detail: format!("malformed candle at {}", candle.timestamp),
            });
            return None;
        }
        Some(candle.clone())
    }

    /// Count adverse closes; returns the exit price once confirmed.
    fn check_hidden_stop(
        &self,
        position: &mut Position,
        candle: &Candle,
        audit: &mut Vec<AuditEvent>,
    ) -> Option<(Decimal, String)> {
        let stop = position.current_stop_loss;
        let close = candle.close;

        if position.is_in_loss_at(close) && position.breaches(close, stop) {
            position.consecutive_stop_warnings += 1;
            position.phase = ExitPhase::StopWarning;
            let count = position.consecutive_stop_warnings;
            info!(
                symbol = %position.symbol,
                close = %close,
                stop = %stop,
                count = count,
                "Candle closed beyond stop"
            );
            audit.push(AuditEvent::StopWarning { count, close, stop });

            if count >= self.config.stop_confirmation_candles.max(1) {
                return Some((
                    close,
                    format!(
                        "Hidden stop {} confirmed by {} candle closes, last {}",
                        stop, count, close
                    ),
                ));
            }
        } else if position.consecutive_stop_warnings > 0 {
            debug!(symbol = %position.symbol, close = %close, "Stop warning cleared");
            position.consecutive_stop_warnings = 0;
            position.phase = ExitPhase::Open;
            audit.push(AuditEvent::StopWarningReset { close, stop });
        }
        None
    }

    /// Ratchet the stop from the peak favorable price.
    ///
    /// Two candidates are computed and the tighter one is used: the step
    /// stop (breakeven plus whole profit steps beyond the trigger) and the
    /// giveback stop (peak minus the allowed share of peak open profit).
    fn update_trailing(
        &self,
        position: &mut Position,
        regime: TrendRegime,
        audit: &mut Vec<AuditEvent>,
    ) {
        let params = self.params(regime);
        let peak = position.highest_favorable_price;
        let peak_profit_pct = position.profit_pct(peak);
        if peak_profit_pct < params.breakeven_trigger_pct {
            return;
        }

        let locked_pct = if params.step_pct > Decimal::ZERO {
            ((peak_profit_pct - params.breakeven_trigger_pct) / params.step_pct).floor()
                * params.step_pct
        } else {
            Decimal::ZERO
        };
        let entry = position.entry_price;
        let step_stop =
            entry + entry * locked_pct / Decimal::ONE_HUNDRED * position.direction.sign();
        let giveback = params.max_giveback.max(Decimal::ZERO).min(Decimal::ONE);
        let giveback_stop = peak - (peak - entry) * giveback;

        let candidate = position.more_favorable(step_stop, giveback_stop);
        let previous = position.current_stop_loss;
        let next = position.more_favorable(previous, candidate);

        if position.phase != ExitPhase::Trailing {
            position.phase = ExitPhase::Trailing;
            position.consecutive_stop_warnings = 0;
            info!(
                symbol = %position.symbol,
                regime = ?regime,
                peak_profit_pct = %peak_profit_pct.round_dp(2),
                "Trailing stop engaged"
            );
            audit.push(AuditEvent::TrailingEngaged {
                regime,
                peak_profit_pct,
            });
        }

        if next != previous {
            position.current_stop_loss = next;
            info!(
                symbol = %position.symbol,
                from = %previous,
                to = %next,
                "Stop raised"
            );
            audit.push(AuditEvent::StopRaised {
                from: previous,
                to: next,
                regime,
            });
        }
    }

    fn exit(
        &self,
        position: &mut Position,
        price: Decimal,
        reason: ExitReason,
        message: String,
        snapshot: &MarketSnapshot,
        audit: Vec<AuditEvent>,
    ) -> Evaluation {
        let signal = ExitSignal {
            price,
            reason,
            message,
            decided_at: snapshot.observed_at,
        };
        info!(
            symbol = %position.symbol,
            reason = %reason,
            price = %price,
            message = %signal.message,
            "Exit decided"
        );
        if let Err(e) = position.mark_closed(signal.clone()) {
            warn!(error = %e, "Exit decided on a closed position");
        }
        Evaluation {
            decision: ExitDecision::Exit(signal),
            audit,
        }
    }
}
