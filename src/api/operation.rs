//! # The `/api/operation` façade.
//!
//! A token-authenticated envelope the operator application drives the
//! whole cycle through: `refill_req`, `refill_drf`, `refill_params`,
//! `refill_finish`, `vehicle_info`. Responses come from a small tagged
//! set; the tag lives in the `response` field.
//!
//! The mapping from supervisor state to response tag is pure and lives in
//! [`params_response`]/[`vehicle_info_response`] so it can be tested
//! without a running machine.

use serde_json::{json, Value};

use crate::supervisor::{CommandOutcome, RefillState, StatusSnapshot};

/// Response for a `refill_params` poll.
pub fn params_response(snapshot: &StatusSnapshot) -> Value {
    match snapshot.current {
        RefillState::AwaitingFirstRfid => json!({ "response": "tag_waiting" }),
        RefillState::AwaitingOdometer => json!({ "response": "refill_drf" }),
        RefillState::Dispensing
        | RefillState::Interrupted
        | RefillState::ForceStopping
        | RefillState::FinalMeterRead
        | RefillState::AwaitingStability => {
            let (tag, fleet) = vehicle_fields(snapshot);
            json!({
                "response": "refill_params",
                "refill_op_tag": tag,
                "refill_op_fleetno": fleet,
                "refill_op_liters": snapshot.meter.current.to_string(),
                "timestamp": snapshot.timestamp.timestamp_millis(),
            })
        }
        RefillState::AwaitingOperatorAck => {
            if snapshot.finished_by_user {
                let liters = snapshot
                    .final_liters
                    .unwrap_or(snapshot.meter.last_stable);
                json!({
                    "response": "refill_finished",
                    "refill_op_liters": liters.to_string(),
                })
            } else {
                invalid(&snapshot.message)
            }
        }
        _ => invalid(&snapshot.message),
    }
}

/// Response for a `vehicle_info` poll.
pub fn vehicle_info_response(snapshot: &StatusSnapshot) -> Value {
    if let Some(vehicle) = &snapshot.vehicle {
        json!({
            "response": "vehicle_info",
            "vehicle_tag": vehicle.tag,
            "vehicle_fleetno": vehicle.fleet_number,
            "vehicle_tank_capacity": vehicle.tank_capacity_liters.to_string(),
            "vehicle_machine_hours": vehicle.current_machine_hours,
        })
    } else if snapshot.current == RefillState::AwaitingFirstRfid {
        json!({ "response": "tag_waiting" })
    } else {
        invalid(&snapshot.message)
    }
}

/// Response for a state-changing request, from the supervisor's outcome.
pub fn outcome_response(tag: &str, outcome: &CommandOutcome) -> Value {
    match outcome {
        CommandOutcome::Accepted { .. } => json!({ "response": tag }),
        CommandOutcome::Rejected { error, .. } => invalid(error),
    }
}

/// The `invalid` response, with the supervisor's message when it has one.
pub fn invalid(message: &str) -> Value {
    if message.is_empty() {
        json!({ "response": "invalid" })
    } else {
        json!({ "response": "invalid", "message": message })
    }
}

/// The `invalid_token` response.
pub fn invalid_token() -> Value {
    json!({ "response": "invalid_token" })
}

fn vehicle_fields(snapshot: &StatusSnapshot) -> (String, String) {
    snapshot
        .vehicle
        .as_ref()
        .map(|v| (v.tag.clone(), v.fleet_number.clone()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use crate::directory::Vehicle;
    use crate::supervisor::MeterSnapshot;

    use super::*;

    fn snapshot(state: RefillState) -> StatusSnapshot {
        StatusSnapshot {
            state: state.as_str().to_string(),
            previous_state: RefillState::Idle.as_str().to_string(),
            timestamp: Utc::now(),
            transaction: None,
            vehicle: None,
            meter: MeterSnapshot {
                current: "12.3".parse().unwrap(),
                last_stable: "12.3".parse().unwrap(),
                last_saved: "12.3".parse().unwrap(),
            },
            message: String::new(),
            current: state,
            finished_by_user: false,
            final_liters: None,
        }
    }

    #[test]
    fn dispensing_reports_live_params() {
        let mut snap = snapshot(RefillState::Dispensing);
        snap.vehicle = Some(Vehicle {
            tag: "E200001D8914005717701BFC".to_string(),
            fleet_number: "LDR-42".to_string(),
            tank_capacity_liters: Decimal::from(100),
            current_machine_hours: 200,
        });
        let resp = params_response(&snap);
        assert_eq!(resp["response"], "refill_params");
        assert_eq!(resp["refill_op_liters"], "12.3");
        assert_eq!(resp["refill_op_tag"], "E200001D8914005717701BFC");
    }

    #[test]
    fn finished_by_user_reports_final_liters() {
        let mut snap = snapshot(RefillState::AwaitingOperatorAck);
        snap.finished_by_user = true;
        snap.final_liters = Some("12.3".parse().unwrap());
        let resp = params_response(&snap);
        assert_eq!(resp["response"], "refill_finished");
        assert_eq!(resp["refill_op_liters"], "12.3");
    }

    #[test]
    fn capacity_stop_reports_invalid_with_message() {
        let mut snap = snapshot(RefillState::AwaitingOperatorAck);
        snap.message = "Max Tank Capacity Reached".to_string();
        let resp = params_response(&snap);
        assert_eq!(resp["response"], "invalid");
        assert_eq!(resp["message"], "Max Tank Capacity Reached");
    }

    #[test]
    fn vehicle_info_waits_for_a_tag_then_reports() {
        let snap = snapshot(RefillState::AwaitingFirstRfid);
        assert_eq!(vehicle_info_response(&snap)["response"], "tag_waiting");

        let mut snap = snapshot(RefillState::AwaitingOdometer);
        snap.vehicle = Some(Vehicle {
            tag: "E200001D8914005717701BFC".to_string(),
            fleet_number: "LDR-42".to_string(),
            tank_capacity_liters: Decimal::from(100),
            current_machine_hours: 200,
        });
        let resp = vehicle_info_response(&snap);
        assert_eq!(resp["response"], "vehicle_info");
        assert_eq!(resp["vehicle_fleetno"], "LDR-42");
    }

    #[test]
    fn idle_params_are_invalid() {
        let snap = snapshot(RefillState::Idle);
        assert_eq!(params_response(&snap)["response"], "invalid");
    }
}
