//! # Refill states and transition legality.
//!
//! The dispensing cycle is a closed set of thirteen states. Each state owns
//! a predecessor set; a transition whose source is not in the target's set
//! is a programming error and escalates to [`RefillState::Faulted`] rather
//! than being masked. `Idle` and `Faulted` are reachable from everywhere:
//! every error path funnels back through them.

/// States of the refill supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillState {
    /// Nothing in progress; heartbeat probes only.
    Idle,
    /// Transient: arms the first RFID probe and falls through.
    Starting,
    /// Polling `rfid_get` until a directory-known tag shows up.
    AwaitingFirstRfid,
    /// Vehicle bound; waiting for the operator's odometer submission.
    AwaitingOdometer,
    /// Meter reset issued; confirming the meter answers at all.
    ReadingFirstMeter,
    /// Continuous tag matching armed; waiting for contact confirmation.
    AwaitingTagMatch,
    /// Solenoid open, fuel flowing, meter polled continuously.
    Dispensing,
    /// Tag contact or nozzle comms lost mid-flow; recovery probes running.
    Interrupted,
    /// Converging on the final meter value.
    FinalMeterRead,
    /// Pure timer between final-read attempts.
    AwaitingStability,
    /// Refill finalized; waiting for the operator to notice.
    AwaitingOperatorAck,
    /// Transient: operator-requested stop; capture, close, stop.
    ForceStopping,
    /// Something the retry envelopes could not absorb.
    Faulted,
}

impl RefillState {
    /// Stable display name, as exposed on the operator surface.
    pub fn as_str(&self) -> &'static str {
        match self {
            RefillState::Idle => "Idle",
            RefillState::Starting => "Starting",
            RefillState::AwaitingFirstRfid => "AwaitingFirstRfid",
            RefillState::AwaitingOdometer => "AwaitingOdometer",
            RefillState::ReadingFirstMeter => "ReadingFirstMeter",
            RefillState::AwaitingTagMatch => "AwaitingTagMatch",
            RefillState::Dispensing => "Dispensing",
            RefillState::Interrupted => "Interrupted",
            RefillState::FinalMeterRead => "FinalMeterRead",
            RefillState::AwaitingStability => "AwaitingStability",
            RefillState::AwaitingOperatorAck => "AwaitingOperatorAck",
            RefillState::ForceStopping => "ForceStopping",
            RefillState::Faulted => "Faulted",
        }
    }

    /// States a transition into `self` may legally come from.
    ///
    /// `Idle` and `Faulted` accept every source: `Idle` because each
    /// timeout and abort path resets through it, `Faulted` because
    /// invariant violations escalate from anywhere.
    pub fn allowed_predecessors(&self) -> &'static [RefillState] {
        use RefillState::*;
        match self {
            Idle | Faulted => ALL_STATES,
            Starting => &[Idle],
            AwaitingFirstRfid => &[Starting],
            AwaitingOdometer => &[AwaitingFirstRfid],
            ReadingFirstMeter => &[AwaitingOdometer],
            AwaitingTagMatch => &[ReadingFirstMeter],
            Dispensing => &[AwaitingTagMatch, Interrupted],
            Interrupted => &[Dispensing],
            FinalMeterRead => &[Dispensing, Interrupted, AwaitingStability, ForceStopping],
            AwaitingStability => &[FinalMeterRead],
            AwaitingOperatorAck => &[FinalMeterRead, ForceStopping, AwaitingTagMatch, Faulted],
            ForceStopping => &[Dispensing, Interrupted],
        }
    }

    /// The solenoid may only be commanded open while dispensing or while a
    /// recovery is reopening it.
    pub fn solenoid_may_be_open(&self) -> bool {
        matches!(self, RefillState::Dispensing | RefillState::Interrupted)
    }
}

const ALL_STATES: &[RefillState] = &[
    RefillState::Idle,
    RefillState::Starting,
    RefillState::AwaitingFirstRfid,
    RefillState::AwaitingOdometer,
    RefillState::ReadingFirstMeter,
    RefillState::AwaitingTagMatch,
    RefillState::Dispensing,
    RefillState::Interrupted,
    RefillState::FinalMeterRead,
    RefillState::AwaitingStability,
    RefillState::AwaitingOperatorAck,
    RefillState::ForceStopping,
    RefillState::Faulted,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_happy_path_is_legal_end_to_end() {
        use RefillState::*;
        let path = [
            Idle,
            Starting,
            AwaitingFirstRfid,
            AwaitingOdometer,
            ReadingFirstMeter,
            AwaitingTagMatch,
            Dispensing,
            ForceStopping,
            FinalMeterRead,
            AwaitingOperatorAck,
            Idle,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[1].allowed_predecessors().contains(&pair[0]),
                "{} -> {} should be legal",
                pair[0].as_str(),
                pair[1].as_str()
            );
        }
    }

    #[test]
    fn dispensing_is_only_entered_with_contact_or_recovery() {
        use RefillState::*;
        assert!(Dispensing.allowed_predecessors().contains(&AwaitingTagMatch));
        assert!(Dispensing.allowed_predecessors().contains(&Interrupted));
        assert!(!Dispensing.allowed_predecessors().contains(&Idle));
        assert!(!Dispensing.allowed_predecessors().contains(&AwaitingOdometer));
    }

    #[test]
    fn idle_and_faulted_accept_every_source() {
        use RefillState::*;
        for s in ALL_STATES {
            assert!(Idle.allowed_predecessors().contains(s));
            assert!(Faulted.allowed_predecessors().contains(s));
        }
    }

    #[test]
    fn solenoid_states_are_exactly_dispensing_and_interrupted() {
        use RefillState::*;
        for s in ALL_STATES {
            assert_eq!(
                s.solenoid_may_be_open(),
                matches!(s, Dispensing | Interrupted),
                "{}",
                s.as_str()
            );
        }
    }
}
