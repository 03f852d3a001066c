//! Enrichment command scheduling (`getver`, `getimeiccid`,
//! `getparam 219,220,221`).
//!
//! The original's `commands.go` mixes the scheduling decision with the
//! socket write and the Redis call in one function. `spec.md` §9 asks for
//! the decision itself to be a pure, testable predicate; `TrySchedule`'s
//! four checks (needed, session limit, min interval, daily budget), in
//! that order, become [`should_send`] here, with the I/O left to the
//! caller.

use std::time::{Duration, Instant};

/// Static facts about one schedulable command. One of these exists per
/// command name; they never change at runtime. `name` keys session/daily
/// bookkeeping; `wire_text` is the literal command text written to the
/// socket, which isn't always the same string (`getparam 219,220,221`
/// contains characters that don't belong in a Redis key or a HashMap key
/// shared across commands).
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub wire_text: &'static str,
    pub daily_limit: u64,
    pub session_limit: u32,
    pub min_retry_interval: Duration,
}

pub const GETVER: CommandSpec = CommandSpec {
    name: "getver",
    wire_text: "getver",
    daily_limit: 10,
    session_limit: 3,
    min_retry_interval: Duration::from_secs(5 * 60),
};

pub const GETIMEICCID: CommandSpec = CommandSpec {
    name: "getimeiccid",
    wire_text: "getimeiccid",
    daily_limit: 10,
    session_limit: 3,
    min_retry_interval: Duration::from_secs(5 * 60),
};

pub const GETPARAM_SIM: CommandSpec = CommandSpec {
    name: "getparam_219_220_221",
    wire_text: "getparam 219,220,221",
    daily_limit: 10,
    session_limit: 3,
    min_retry_interval: Duration::from_secs(5 * 60),
};

/// Per-connection, per-command attempt tracking. Lives only as long as the
/// socket; a new connection starts every command back at zero attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandState {
    pub session_count: u32,
    pub last_attempt: Option<Instant>,
}

/// Why a command was suppressed, for debug-level logging beyond the
/// original's silent suppression (`spec.md` SPEC_FULL §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppressed {
    NotNeeded,
    SessionLimitReached,
    TooSoon,
    DailyBudgetExhausted,
}

/// Evaluates the four scheduling rules in order: needed, per-session
/// attempts, minimum interval, daily budget. All must pass for a command to
/// be sent. `needed` and `daily_allowed` are supplied by the caller because
/// they require a cache read / counter increment respectively — this
/// function stays pure and synchronous.
pub fn should_send(
    spec: &CommandSpec,
    state: &CommandState,
    now: Instant,
    needed: bool,
    daily_allowed: bool,
) -> Result<(), Suppressed> {
    if !needed {
        return Err(Suppressed::NotNeeded);
    }
    if state.session_count >= spec.session_limit {
        return Err(Suppressed::SessionLimitReached);
    }
    if let Some(last) = state.last_attempt {
        if now.duration_since(last) < spec.min_retry_interval {
            return Err(Suppressed::TooSoon);
        }
    }
    if !daily_allowed {
        return Err(Suppressed::DailyBudgetExhausted);
    }
    Ok(())
}

/// Chooses which SIM-identifier command to issue based on the cached
/// hardware model: `650`-series devices use the packed `getparam` form,
/// everything else (including an unknown model) falls back to the direct
/// `getimeiccid` request.
pub fn sim_command_for_model(model: &str) -> CommandSpec {
    if model.contains("650") {
        GETPARAM_SIM
    } else {
        GETIMEICCID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sends_when_all_rules_pass() {
        let state = CommandState::default();
        assert_eq!(
            should_send(&GETVER, &state, Instant::now(), true, true),
            Ok(())
        );
    }

    #[test]
    fn suppressed_when_not_needed() {
        let state = CommandState::default();
        assert_eq!(
            should_send(&GETVER, &state, Instant::now(), false, true),
            Err(Suppressed::NotNeeded)
        );
    }

    #[test]
    fn suppressed_at_session_limit() {
        let state = CommandState {
            session_count: GETVER.session_limit,
            last_attempt: None,
        };
        assert_eq!(
            should_send(&GETVER, &state, Instant::now(), true, true),
            Err(Suppressed::SessionLimitReached)
        );
    }

    #[test]
    fn suppressed_inside_min_retry_interval() {
        let now = Instant::now();
        let state = CommandState {
            session_count: 0,
            last_attempt: Some(now),
        };
        assert_eq!(
            should_send(&GETVER, &state, now, true, true),
            Err(Suppressed::TooSoon)
        );
    }

    #[test]
    fn allowed_after_min_retry_interval_elapses() {
        let earlier = Instant::now();
        let state = CommandState {
            session_count: 0,
            last_attempt: Some(earlier),
        };
        let later = earlier + GETVER.min_retry_interval;
        assert_eq!(should_send(&GETVER, &state, later, true, true), Ok(()));
    }

    #[test]
    fn suppressed_on_daily_budget_denial() {
        let state = CommandState::default();
        assert_eq!(
            should_send(&GETVER, &state, Instant::now(), true, false),
            Err(Suppressed::DailyBudgetExhausted)
        );
    }

    #[test]
    fn model_containing_650_uses_packed_getparam() {
        assert_eq!(sim_command_for_model("FMB650").name, GETPARAM_SIM.name);
    }

    #[test]
    fn other_models_use_direct_getimeiccid() {
        assert_eq!(sim_command_for_model("FMC125").name, GETIMEICCID.name);
        assert_eq!(sim_command_for_model("").name, GETIMEICCID.name);
    }
}
