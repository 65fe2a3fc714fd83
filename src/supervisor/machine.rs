//! # The refill supervisor.
//!
//! A single task owns every piece of refill state and processes one input
//! at a time: an inbound frame, an operator command, or a tick. All side
//! effects (writes to the port, the store, the directory, the solenoid)
//! happen inside event handling; none overlap.
//!
//! ## Reactor
//! ```text
//! serial reader ──► frames ─┐
//! HTTP handlers ──► commands ─┤──► Supervisor::run() ──► one handler at a time
//! interval (~1 s) ──► tick ──┘            │
//!                                         ├──► port.send()/request()
//!                                         ├──► store / directory calls
//!                                         ├──► Bus events (StateChanged, …)
//!                                         └──► watch<StatusSnapshot>
//! ```
//!
//! ## Rules
//! - Solicited flows are *issue + request timer*: the machine sends the
//!   command, records the awaited verb family and deadline, consumes the
//!   reply as an ordinary inbound frame, and re-evaluates expiry on tick.
//! - `rfid_match`/`rfid_alarm` are latched most-recent-wins before state
//!   dispatch; an alarm always wins over meter replies arriving in the
//!   same tick.
//! - Every transition carries a non-empty reason; an illegal transition
//!   escalates to Faulted instead of being masked.
//! - The solenoid is commanded closed on every exit from Dispensing and
//!   Interrupted, including error paths; the close is flag-guarded so one
//!   open always pairs with exactly one close.
//! - Deadline errors retry until their budget runs out; transport errors
//!   fault; store errors terminate the refill through AwaitingOperatorAck.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::directory::FleetDirectory;
use crate::events::{Bus, Event, EventKind};
use crate::health::{HealthMonitor, Watch};
use crate::port::{Command, Family, Frame, NozzleLink};
use crate::store::{NewTransaction, TransactionStore, TxStatus};

use super::context::{PendingRequest, RefillContext};
use super::inputs::{CommandKind, CommandOutcome, OperatorCommand};
use super::state::RefillState;
use super::status::{MeterSnapshot, StatusSnapshot};

/// Faulted starts probing this long after entry.
const FAULT_RECOVERY_DELAY: Duration = Duration::from_secs(5);
/// Faulted gives up probing and fully resets after this long.
const FAULT_RESET_AFTER: Duration = Duration::from_secs(30);
/// Spacing between recovery sequences inside the window.
const FAULT_RECOVERY_SPACING: Duration = Duration::from_secs(5);

/// The deterministic state machine coordinating nozzle, operator, and
/// fleet directory.
pub struct Supervisor {
    cfg: Config,
    port: Arc<dyn NozzleLink>,
    store: Arc<dyn TransactionStore>,
    directory: Arc<dyn FleetDirectory>,
    health: Arc<HealthMonitor>,
    bus: Bus,
    status_tx: watch::Sender<StatusSnapshot>,

    state: RefillState,
    prev_state: RefillState,
    entered_at: Instant,
    transitioned_at: DateTime<Utc>,
    ctx: RefillContext,

    /// Commanded solenoid state; pairs opens with closes.
    solenoid_open: bool,
    /// `pair_nozzle` goes out once per process, on first Idle entry.
    paired: bool,
    last_probe: Option<Instant>,
    faulted_at: Option<Instant>,
    last_recovery: Option<Instant>,
}

impl Supervisor {
    /// Builds the machine and the status channel the operator surface
    /// reads from.
    pub fn new(
        cfg: Config,
        port: Arc<dyn NozzleLink>,
        store: Arc<dyn TransactionStore>,
        directory: Arc<dyn FleetDirectory>,
        health: Arc<HealthMonitor>,
        bus: Bus,
    ) -> (Self, watch::Receiver<StatusSnapshot>) {
        let ctx = RefillContext::new(&cfg);
        let initial = StatusSnapshot {
            state: RefillState::Idle.as_str().to_string(),
            previous_state: RefillState::Idle.as_str().to_string(),
            timestamp: Utc::now(),
            transaction: None,
            vehicle: None,
            meter: MeterSnapshot {
                current: Decimal::ZERO,
                last_stable: Decimal::ZERO,
                last_saved: Decimal::ZERO,
            },
            message: String::new(),
            current: RefillState::Idle,
            finished_by_user: false,
            final_liters: None,
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let machine = Self {
            cfg,
            port,
            store,
            directory,
            health,
            bus,
            status_tx,
            state: RefillState::Idle,
            prev_state: RefillState::Idle,
            entered_at: Instant::now(),
            transitioned_at: Utc::now(),
            ctx,
            solenoid_open: false,
            paired: false,
            last_probe: None,
            faulted_at: None,
            last_recovery: None,
        };
        (machine, status_rx)
    }

    /// Runs the reactor until cancellation.
    ///
    /// `frames` carries every inbound frame (the port forwards them before
    /// correlation); `commands` carries operator requests. The tick is
    /// armed internally.
    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<Frame>,
        mut commands: mpsc::Receiver<OperatorCommand>,
        shutdown: CancellationToken,
    ) {
        let chain = self.enter(RefillState::Idle).await;
        debug_assert!(chain.is_none(), "Idle entry must not chain");
        self.publish_status();

        let mut tick = tokio::time::interval(self.cfg.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frames_open = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.on_shutdown().await;
                    return;
                }
                maybe = frames.recv(), if frames_open => match maybe {
                    Some(frame) => self.on_frame(frame).await,
                    None => {
                        frames_open = false;
                        self.on_link_closed().await;
                    }
                },
                Some(cmd) = commands.recv() => self.on_command(cmd).await,
                _ = tick.tick() => self.on_tick().await,
            }
            self.publish_status();
        }
    }

    // ── Transitions ─────────────────────────────────────────────────────

    /// Records a transition and runs entry actions, following chained
    /// transitions (Starting and ForceStopping are pass-through states).
    async fn transition(&mut self, to: RefillState, reason: impl Into<String>) {
        let mut to = to;
        let mut reason = reason.into();
        loop {
            if reason.is_empty() {
                // A transition without a reason is a programming error.
                to = RefillState::Faulted;
                reason = "transition recorded without a reason".to_string();
            }
            if to == RefillState::Faulted && self.state == RefillState::Faulted {
                return;
            }
            if !to.allowed_predecessors().contains(&self.state) {
                log::error!(
                    "illegal transition {} -> {} ({reason})",
                    self.state.as_str(),
                    to.as_str()
                );
                reason = format!(
                    "illegal transition {} -> {}",
                    self.state.as_str(),
                    to.as_str()
                );
                to = RefillState::Faulted;
            }

            // Solenoid safety on exit. ForceStopping closes inside its own
            // entry sequence, after the last meter fetch.
            if self.solenoid_open
                && !matches!(to, RefillState::Dispensing | RefillState::ForceStopping)
            {
                self.close_solenoid().await;
            }

            self.prev_state = self.state;
            self.state = to;
            self.entered_at = Instant::now();
            self.transitioned_at = Utc::now();
            log::info!(
                "{} -> {} [{reason}]",
                self.prev_state.as_str(),
                to.as_str()
            );
            self.bus.publish(
                Event::now(EventKind::StateChanged)
                    .with_state(format!("{} -> {}", self.prev_state.as_str(), to.as_str()))
                    .with_reason(reason.clone()),
            );

            match self.enter(to).await {
                Some((next, r)) => {
                    to = next;
                    reason = r;
                }
                None => return,
            }
        }
    }

    /// Entry actions. Returns the next hop for pass-through states.
    async fn enter(&mut self, state: RefillState) -> Option<(RefillState, String)> {
        match state {
            RefillState::Idle => {
                self.reset();
                if !self.paired {
                    self.paired = true;
                    if let Err(err) = self
                        .port
                        .send(Command::PairNozzle {
                            nozzle: self.cfg.nozzle_id.clone(),
                        })
                        .await
                    {
                        log::error!("pair_nozzle failed: {err}");
                    }
                }
                self.last_probe = None;
                None
            }

            RefillState::Starting => {
                self.ctx.reset(&self.cfg);
                self.health.set_refill_active(true);
                if let Err(err) = self
                    .port
                    .send(Command::RfidGet {
                        nozzle: self.cfg.nozzle_id.clone(),
                    })
                    .await
                {
                    return Some(self.transport_fault(err));
                }
                self.arm(Family::RfidGet, self.cfg.uart_response_timeout());
                Some((RefillState::AwaitingFirstRfid, "rfid probe issued".into()))
            }

            RefillState::AwaitingFirstRfid => None,
            RefillState::AwaitingOdometer => {
                self.ctx.pending = None;
                None
            }

            RefillState::ReadingFirstMeter => {
                self.ctx
                    .meter_budget
                    .rearm_to(self.cfg.first_meter_retries);
                for cmd in [Command::MeterReset, Command::MeterRead] {
                    if let Err(err) = self.port.send(cmd).await {
                        return Some(self.transport_fault(err));
                    }
                }
                self.arm(Family::MeterRead, self.cfg.first_meter_timeout());
                None
            }

            RefillState::AwaitingTagMatch => {
                self.ctx.match_budget.rearm_to(self.cfg.tag_match_retries);
                let tag = self.ctx.vehicle.as_ref().map(|v| v.tag.clone());
                let Some(tag) = tag else {
                    return Some((
                        RefillState::Faulted,
                        "tag match armed without a bound vehicle".into(),
                    ));
                };
                if let Err(err) = self
                    .port
                    .send(Command::RfidGetCont {
                        nozzle: self.cfg.nozzle_id.clone(),
                        tag,
                    })
                    .await
                {
                    return Some(self.transport_fault(err));
                }
                self.arm(Family::RfidMatch, self.cfg.uart_response_timeout());
                if self.ctx.latched_match.take().is_some() {
                    return Some(self.confirm_match().await);
                }
                None
            }

            RefillState::Dispensing => {
                self.ctx
                    .meter_budget
                    .rearm_to(self.cfg.dispense_meter_retries);
                if let Err(err) = self.port.send(Command::MeterRead).await {
                    return Some(self.transport_fault(err));
                }
                self.arm(Family::MeterRead, self.cfg.meter_read_timeout());
                None
            }

            RefillState::Interrupted => {
                log::debug!(
                    "recovering tag contact (in_contact={})",
                    self.ctx.rfid_in_contact
                );
                self.ctx
                    .interrupt_budget
                    .rearm_to(self.cfg.interrupt_retries());
                if let Err(err) = self
                    .port
                    .send(Command::RfidGet {
                        nozzle: self.cfg.nozzle_id.clone(),
                    })
                    .await
                {
                    return Some(self.transport_fault(err));
                }
                self.arm(Family::RfidGet, self.cfg.rfid_retry_interval());
                self.ctx.last_attempt = Some(Instant::now());
                None
            }

            RefillState::FinalMeterRead => {
                self.ctx.final_budget.rearm_to(self.cfg.final_meter_retries);
                self.ctx.final_budget.consume();
                if let Err(err) = self.port.send(Command::MeterRead).await {
                    return Some(self.transport_fault(err));
                }
                self.arm(Family::MeterRead, self.cfg.meter_read_timeout());
                None
            }

            RefillState::AwaitingStability => {
                self.ctx.pending = None;
                None
            }

            RefillState::AwaitingOperatorAck => {
                self.ctx.pending = None;
                None
            }

            RefillState::ForceStopping => {
                self.ctx.finished_by_user = true;
                self.ctx.message = "Refill ended by user".to_string();

                // Capture one last reading, then cut flow and stop matching.
                let fetched = match self.port.request(Command::MeterRead).await {
                    Ok(frame) => frame.meter_liters(),
                    Err(err) if err.is_deadline() => None,
                    Err(err) => return Some(self.transport_fault(err)),
                };
                self.close_solenoid().await;
                if let Err(err) = self
                    .port
                    .send(Command::RfidStop {
                        nozzle: self.cfg.nozzle_id.clone(),
                    })
                    .await
                {
                    return Some(self.transport_fault(err));
                }
                if let Some(v) = fetched {
                    self.ctx.filter.observe(v, Instant::now());
                }

                let usable = match fetched {
                    Some(v) if v > Decimal::ZERO => v,
                    _ => self.ctx.filter.last_stable(),
                };
                if usable > Decimal::ZERO {
                    Some((RefillState::FinalMeterRead, "force stop".into()))
                } else {
                    self.finalize_record(Decimal::ZERO).await;
                    Some((RefillState::AwaitingOperatorAck, "nothing dispensed".into()))
                }
            }

            RefillState::Faulted => {
                self.faulted_at = Some(Instant::now());
                self.last_recovery = None;
                self.ctx.fault_budget.rearm_to(3);
                self.ctx.pending = None;
                self.bus.publish(
                    Event::now(EventKind::CriticalError).with_reason("supervisor faulted"),
                );
                None
            }
        }
    }

    fn transport_fault(&mut self, err: crate::error::PortError) -> (RefillState, String) {
        log::error!("nozzle write failed: {err}");
        self.ctx.message = "Nozzle communication lost".to_string();
        (
            RefillState::Faulted,
            format!("transport failure: {}", err.as_label()),
        )
    }

    /// Full refill-scope reset, run on every re-entry into Idle.
    fn reset(&mut self) {
        self.ctx.reset(&self.cfg);
        self.health.reset_refill_watches();
        self.health.set_refill_active(false);
    }

    // ── Inbound frames ──────────────────────────────────────────────────

    async fn on_frame(&mut self, frame: Frame) {
        let now = Instant::now();
        if frame.from_nozzle(&self.cfg.nozzle_id) {
            self.health.touch(Watch::Nozzle);
        }
        if frame.heartbeat_status() == Some(0) {
            self.health.touch(Watch::Board);
        }

        match frame.family {
            Family::Nhb => {
                // Every nozzle beacon gets a control-board acknowledgement.
                if frame.from_nozzle(&self.cfg.nozzle_id) {
                    self.send_or_fault(Command::Cbhb {
                        nozzle: self.cfg.nozzle_id.clone(),
                    })
                    .await;
                }
                return;
            }
            Family::RfidMatch if frame.from_nozzle(&self.cfg.nozzle_id) => {
                self.ctx.latched_match = Some(frame.clone());
            }
            Family::RfidAlarm if frame.from_nozzle(&self.cfg.nozzle_id) => {
                self.ctx.latched_alarm = Some(frame.clone());
            }
            _ => {}
        }

        match self.state {
            RefillState::AwaitingFirstRfid if frame.family == Family::RfidGet => {
                self.first_rfid_reply(&frame).await;
            }
            RefillState::ReadingFirstMeter if frame.family == Family::MeterRead => {
                self.first_meter_reply(&frame).await;
            }
            RefillState::AwaitingTagMatch if frame.family == Family::RfidMatch => {
                if self.ctx.latched_match.take().is_some() {
                    let (to, reason) = self.confirm_match().await;
                    self.transition(to, reason).await;
                }
            }
            RefillState::Dispensing => {
                if !self.dispensing_guards(now).await && frame.family == Family::MeterRead {
                    self.dispense_meter_reply(&frame).await;
                }
            }
            RefillState::Interrupted if frame.family == Family::RfidGet => {
                self.interrupted_rfid_reply(&frame).await;
            }
            RefillState::FinalMeterRead if frame.family == Family::MeterRead => {
                self.final_meter_reply(&frame).await;
            }
            _ => {}
        }
    }

    async fn first_rfid_reply(&mut self, frame: &Frame) {
        let Some(payload) = frame.rfid_get_payload() else {
            log::warn!("dropping malformed rfid_get reply: {}", frame.raw);
            return;
        };
        self.ctx.saw_rfid_reply = true;
        self.ctx.pending = None;
        let Some(tag) = payload.tag else {
            // No tag in field; the tick re-issues the probe.
            return;
        };
        match self.directory.validate_tag(&tag).await {
            Some(vehicle) => {
                log::info!("tag {tag} bound to fleet unit {}", vehicle.fleet_number);
                self.ctx.vehicle = Some(vehicle);
                self.transition(RefillState::AwaitingOdometer, "vehicle identified")
                    .await;
            }
            None => {
                log::info!("tag {tag} not in the permitted set, discarded");
            }
        }
    }

    async fn first_meter_reply(&mut self, frame: &Frame) {
        let Some(v) = frame.meter_liters() else {
            log::warn!("dropping malformed meter_read reply: {}", frame.raw);
            return;
        };
        self.ctx.pending = None;
        self.ctx.start_meter = v;
        self.ctx.filter.observe(v, Instant::now());
        self.transition(RefillState::AwaitingTagMatch, "meter active")
            .await;
    }

    /// A confirmed `rfid_match`: create the transaction and open the valve.
    async fn confirm_match(&mut self) -> (RefillState, String) {
        self.ctx.rfid_in_contact = true;
        let Some(vehicle) = self.ctx.vehicle.clone() else {
            return (
                RefillState::Faulted,
                "rfid match without a bound vehicle".into(),
            );
        };
        let new = NewTransaction {
            tag: vehicle.tag.clone(),
            fleet_number: vehicle.fleet_number.clone(),
            start_meter: self.ctx.start_meter,
            machine_hours: self.ctx.drf_hours.unwrap_or(vehicle.current_machine_hours),
        };
        match self.store.create(new).await {
            Err(err) => {
                log::error!("transaction create failed: {err}");
                self.ctx.message = "Database Error".to_string();
                (
                    RefillState::AwaitingOperatorAck,
                    "transaction create failed".into(),
                )
            }
            Ok(tx) => {
                self.bus.publish(
                    Event::now(EventKind::TransactionOpened)
                        .with_reason(format!("tx {} tag {}", tx.id, tx.tag)),
                );
                self.ctx.tx = Some(tx);
                self.open_solenoid().await;
                (RefillState::Dispensing, "dispensing started".into())
            }
        }
    }

    async fn dispense_meter_reply(&mut self, frame: &Frame) {
        let Some(v) = frame.meter_liters() else {
            log::warn!("dropping malformed meter_read reply: {}", frame.raw);
            return;
        };
        self.ctx.pending = None;
        self.ctx.meter_budget.rearm_to(self.cfg.dispense_meter_retries);
        self.ctx.filter.observe(v, Instant::now());

        let current = self.ctx.filter.current();
        if let Some(tx) = self.ctx.tx.clone() {
            if current - self.ctx.filter.last_saved() >= self.cfg.persist_step_liters {
                match self.store.update_liters(tx.id, current).await {
                    Ok(()) => {
                        self.ctx.filter.mark_saved(current);
                        if let Some(t) = self.ctx.tx.as_mut() {
                            t.dispensed_liters = current;
                            if t.status == TxStatus::Initiated {
                                t.status = TxStatus::InProgress;
                            }
                        }
                        self.bus.publish(
                            Event::now(EventKind::TransactionProgress).with_liters(current),
                        );
                    }
                    Err(err) => log::warn!("progress write failed: {err}"),
                }
            }
        }

        let capacity = self.ctx.vehicle.as_ref().map(|v| v.tank_capacity_liters);
        if let Some(capacity) = capacity {
            if current >= capacity {
                self.close_solenoid().await;
                if !self
                    .send_or_fault(Command::RfidStop {
                        nozzle: self.cfg.nozzle_id.clone(),
                    })
                    .await
                {
                    return;
                }
                self.ctx.message = "Max Tank Capacity Reached".to_string();
                self.transition(RefillState::FinalMeterRead, "tank capacity")
                    .await;
                return;
            }
        }

        if self.send_or_fault(Command::MeterRead).await {
            self.arm(Family::MeterRead, self.cfg.meter_read_timeout());
        }
    }

    async fn interrupted_rfid_reply(&mut self, frame: &Frame) {
        let Some(payload) = frame.rfid_get_payload() else {
            return;
        };
        self.ctx.pending = None;
        let bound = self.ctx.vehicle.as_ref().map(|v| v.tag.clone());
        match (payload.tag, bound) {
            (Some(tag), Some(bound)) if tag == bound => {
                self.ctx.latched_alarm = None;
                self.ctx.rfid_in_contact = true;
                if !self
                    .send_or_fault(Command::RfidGetCont {
                        nozzle: self.cfg.nozzle_id.clone(),
                        tag,
                    })
                    .await
                {
                    return;
                }
                self.open_solenoid().await;
                self.transition(RefillState::Dispensing, "RFID recovered")
                    .await;
            }
            _ => {
                // Wrong or missing tag; the tick paces the next probe.
            }
        }
    }

    async fn final_meter_reply(&mut self, frame: &Frame) {
        let Some(v) = frame.meter_liters() else {
            return;
        };
        self.ctx.pending = None;
        let stable = self.ctx.filter.last_stable();
        if v == stable {
            self.finalize(stable).await;
        } else if v < stable {
            // Glitched reading; re-read within budget, then trust the
            // filter.
            log::warn!("final read {v} below last stable {stable}");
            if self.ctx.final_budget.consume() {
                if self.send_or_fault(Command::MeterRead).await {
                    self.arm(Family::MeterRead, self.cfg.meter_read_timeout());
                }
            } else {
                self.finalize(stable).await;
            }
        } else {
            self.ctx.filter.observe(v, Instant::now());
            self.transition(RefillState::AwaitingStability, "meter still settling")
                .await;
        }
    }

    // ── Dispensing exit guards, in priority order ───────────────────────

    async fn dispensing_guards(&mut self, now: Instant) -> bool {
        if self.health.is_expired(Watch::Nozzle, now) {
            self.publish_watch_expired(Watch::Nozzle);
            self.close_solenoid().await;
            self.ctx.message = "Nozzle communication lost".to_string();
            self.transition(RefillState::Interrupted, "nozzle comm lost")
                .await;
            return true;
        }
        if self.ctx.latched_alarm.take().is_some() {
            self.ctx.rfid_in_contact = false;
            self.transition(RefillState::Interrupted, "tag contact lost")
                .await;
            return true;
        }
        if self.health.is_expired(Watch::Operator, now) {
            self.publish_watch_expired(Watch::Operator);
            self.close_solenoid().await;
            if !self
                .send_or_fault(Command::RfidStop {
                    nozzle: self.cfg.nozzle_id.clone(),
                })
                .await
            {
                return true;
            }
            self.ctx.message = "App comm. timeout".to_string();
            self.transition(RefillState::FinalMeterRead, "operator contact lost")
                .await;
            return true;
        }
        false
    }

    // ── Ticks ───────────────────────────────────────────────────────────

    async fn on_tick(&mut self) {
        let now = Instant::now();
        match self.state {
            RefillState::Idle => self.idle_tick(now).await,
            RefillState::AwaitingFirstRfid => self.first_rfid_tick(now).await,
            RefillState::AwaitingOdometer => self.odometer_tick(now).await,
            RefillState::ReadingFirstMeter => self.first_meter_tick(now).await,
            RefillState::AwaitingTagMatch => self.tag_match_tick(now).await,
            RefillState::Dispensing => self.dispensing_tick(now).await,
            RefillState::Interrupted => self.interrupted_tick(now).await,
            RefillState::FinalMeterRead => self.final_meter_tick(now).await,
            RefillState::AwaitingStability => self.stability_tick(now).await,
            RefillState::AwaitingOperatorAck => self.ack_tick(now).await,
            RefillState::Faulted => self.faulted_tick(now).await,
            RefillState::Starting | RefillState::ForceStopping => {}
        }
    }

    async fn idle_tick(&mut self, now: Instant) {
        if self.health.board_silence(now) > 2 * self.cfg.board_heartbeat_budget() {
            self.publish_watch_expired(Watch::Board);
            self.ctx.message = "Nozzle communication lost".to_string();
            self.transition(RefillState::Faulted, "board heartbeat lost")
                .await;
            return;
        }
        let due = self
            .last_probe
            .map_or(true, |t| now.duration_since(t) >= self.cfg.heartbeat_probe_interval());
        if due {
            self.last_probe = Some(now);
            self.send_or_fault(Command::Heartbeat).await;
        }
    }

    async fn first_rfid_tick(&mut self, now: Instant) {
        if now.duration_since(self.entered_at) > self.cfg.rfid_total_budget() {
            self.transition(RefillState::Idle, "rfid window elapsed").await;
            return;
        }
        if self.ctx.saw_rfid_reply && self.health.is_expired(Watch::Operator, now) {
            self.publish_watch_expired(Watch::Operator);
            self.transition(RefillState::Idle, "operator contact lost")
                .await;
            return;
        }
        let reissue = match self.ctx.pending {
            Some(p) if p.expired(now) => {
                if !self.ctx.rfid_budget.consume() {
                    self.transition(RefillState::Idle, "rfid max retries").await;
                    return;
                }
                true
            }
            // The last reply carried no usable tag; probe again.
            None => true,
            Some(_) => false,
        };
        if reissue {
            if self
                .send_or_fault(Command::RfidGet {
                    nozzle: self.cfg.nozzle_id.clone(),
                })
                .await
            {
                self.arm(Family::RfidGet, self.cfg.uart_response_timeout());
            }
        }
    }

    async fn odometer_tick(&mut self, now: Instant) {
        let timed_out = now.duration_since(self.entered_at) > self.cfg.drf_submit_timeout();
        let operator_lost = self.health.is_expired(Watch::Operator, now);
        if timed_out || operator_lost {
            if operator_lost {
                self.publish_watch_expired(Watch::Operator);
            }
            if !self
                .send_or_fault(Command::RfidGetStop {
                    nozzle: self.cfg.nozzle_id.clone(),
                })
                .await
            {
                return;
            }
            let reason = if timed_out {
                "odometer submit timeout"
            } else {
                "operator contact lost"
            };
            self.transition(RefillState::Idle, reason).await;
        }
    }

    async fn first_meter_tick(&mut self, now: Instant) {
        let expired = self.ctx.pending.map_or(true, |p| p.expired(now));
        if !expired {
            return;
        }
        if self.ctx.meter_budget.consume() {
            if self.send_or_fault(Command::MeterRead).await {
                self.arm(Family::MeterRead, self.cfg.first_meter_timeout());
            }
        } else {
            if !self
                .send_or_fault(Command::RfidGetStop {
                    nozzle: self.cfg.nozzle_id.clone(),
                })
                .await
            {
                return;
            }
            self.ctx.message = "Meter read error".to_string();
            self.transition(RefillState::Idle, "meter read error").await;
        }
    }

    async fn tag_match_tick(&mut self, now: Instant) {
        let expired = self.ctx.pending.map_or(true, |p| p.expired(now));
        if !expired {
            return;
        }
        if self.ctx.match_budget.consume() {
            // Continuous matching is armed; just restart the wait window.
            self.arm(Family::RfidMatch, self.cfg.uart_response_timeout());
        } else {
            if !self
                .send_or_fault(Command::RfidStop {
                    nozzle: self.cfg.nozzle_id.clone(),
                })
                .await
            {
                return;
            }
            self.transition(RefillState::Idle, "tag match timeout").await;
        }
    }

    async fn dispensing_tick(&mut self, now: Instant) {
        if self.dispensing_guards(now).await {
            return;
        }
        let expired = self.ctx.pending.map_or(false, |p| p.expired(now));
        if !expired {
            return;
        }
        if self.ctx.meter_budget.consume() {
            if self.send_or_fault(Command::MeterRead).await {
                self.arm(Family::MeterRead, self.cfg.meter_read_timeout());
            }
        } else {
            self.close_solenoid().await;
            if !self
                .send_or_fault(Command::RfidStop {
                    nozzle: self.cfg.nozzle_id.clone(),
                })
                .await
            {
                return;
            }
            self.ctx.message = "Meter read error".to_string();
            self.transition(RefillState::FinalMeterRead, "meter timeout")
                .await;
        }
    }

    async fn interrupted_tick(&mut self, now: Instant) {
        if self.health.is_expired(Watch::Operator, now) {
            self.publish_watch_expired(Watch::Operator);
            self.ctx.message = "App comm. timeout".to_string();
            self.transition(RefillState::FinalMeterRead, "operator contact lost")
                .await;
            return;
        }
        let due = match self.ctx.pending {
            Some(p) => p.expired(now),
            None => self
                .ctx
                .last_attempt
                .map_or(true, |t| now.duration_since(t) >= self.cfg.rfid_retry_interval()),
        };
        if !due {
            return;
        }
        if self.ctx.interrupt_budget.consume() {
            if self
                .send_or_fault(Command::RfidGet {
                    nozzle: self.cfg.nozzle_id.clone(),
                })
                .await
            {
                self.arm(Family::RfidGet, self.cfg.rfid_retry_interval());
                self.ctx.last_attempt = Some(now);
            }
        } else {
            if !self
                .send_or_fault(Command::RfidStop {
                    nozzle: self.cfg.nozzle_id.clone(),
                })
                .await
            {
                return;
            }
            self.ctx.message = "Nozzle removed. Ending refill.".to_string();
            self.transition(RefillState::FinalMeterRead, "nozzle removed")
                .await;
        }
    }

    async fn final_meter_tick(&mut self, now: Instant) {
        let expired = self.ctx.pending.map_or(true, |p| p.expired(now));
        if !expired {
            return;
        }
        if self.ctx.final_budget.consume() {
            if self.send_or_fault(Command::MeterRead).await {
                self.arm(Family::MeterRead, self.cfg.meter_read_timeout());
            }
        } else {
            let stable = self.ctx.filter.last_stable();
            self.finalize(stable).await;
        }
    }

    async fn stability_tick(&mut self, now: Instant) {
        if now.duration_since(self.entered_at) >= self.cfg.meter_stability_duration() {
            self.transition(RefillState::FinalMeterRead, "stability wait elapsed")
                .await;
        }
    }

    async fn ack_tick(&mut self, now: Instant) {
        if now.duration_since(self.entered_at) > self.cfg.app_inform_timeout() {
            log::info!(
                "operator ack window closed (informed={})",
                self.ctx.app_informed
            );
            self.transition(RefillState::Idle, "operator ack timeout").await;
        }
    }

    async fn faulted_tick(&mut self, now: Instant) {
        let Some(faulted_at) = self.faulted_at else {
            self.faulted_at = Some(now);
            return;
        };
        let dt = now.duration_since(faulted_at);
        if dt >= FAULT_RESET_AFTER {
            if self.ctx.fault_budget.exhausted() {
                self.bus.publish(
                    Event::now(EventKind::CriticalError)
                        .with_reason("fault recovery exhausted, forcing reset"),
                );
            }
            self.faulted_at = None;
            self.transition(RefillState::Idle, "fault window elapsed").await;
            return;
        }
        if dt < FAULT_RECOVERY_DELAY {
            return;
        }
        let spaced = self
            .last_recovery
            .map_or(true, |t| now.duration_since(t) >= FAULT_RECOVERY_SPACING);
        if !spaced || !self.ctx.fault_budget.consume() {
            return;
        }
        self.last_recovery = Some(now);
        if !self.attempt_recovery().await {
            log::warn!(
                "fault recovery attempt failed ({} left)",
                self.ctx.fault_budget.remaining()
            );
            return;
        }
        if self.ctx.tx.is_some() && self.ctx.filter.last_stable() > Decimal::ZERO {
            let stable = self.ctx.filter.last_stable();
            if let Some(tx) = self.ctx.tx.clone() {
                if let Err(err) = self.store.update_liters(tx.id, stable).await {
                    log::error!("persisting recovered volume failed: {err}");
                }
            }
            self.faulted_at = None;
            self.transition(
                RefillState::AwaitingOperatorAck,
                "fault recovered with open refill",
            )
            .await;
        } else {
            self.faulted_at = None;
            self.transition(RefillState::Idle, "fault recovered").await;
        }
    }

    /// One recovery sequence: health probe, safe outputs, meter and RFID
    /// probes. Any failed step aborts the attempt.
    async fn attempt_recovery(&mut self) -> bool {
        let healthy = match self.port.request(Command::Heartbeat).await {
            Ok(frame) => frame.heartbeat_status() == Some(0),
            Err(_) => false,
        };
        if !healthy {
            return false;
        }
        let safe = [
            Command::SetSolenoid { open: false },
            Command::RfidStop {
                nozzle: self.cfg.nozzle_id.clone(),
            },
            Command::MeterReset,
        ];
        for cmd in safe {
            if self.port.send(cmd).await.is_err() {
                return false;
            }
        }
        self.solenoid_open = false;
        if self.port.request(Command::MeterRead).await.is_err() {
            return false;
        }
        self.port
            .request(Command::RfidGet {
                nozzle: self.cfg.nozzle_id.clone(),
            })
            .await
            .is_ok()
    }

    // ── Operator commands ───────────────────────────────────────────────

    async fn on_command(&mut self, cmd: OperatorCommand) {
        let outcome = match cmd.kind {
            CommandKind::StartRefill => {
                if self.state == RefillState::Idle {
                    self.transition(RefillState::Starting, "operator start").await;
                    CommandOutcome::Accepted { state: self.state }
                } else {
                    CommandOutcome::Rejected {
                        error: "refill already in progress".to_string(),
                        current: self.state,
                        allowed: RefillState::Idle,
                    }
                }
            }
            CommandKind::SubmitOdometer { hours } => {
                if self.state != RefillState::AwaitingOdometer {
                    CommandOutcome::Rejected {
                        error: "odometer submission not expected now".to_string(),
                        current: self.state,
                        allowed: RefillState::AwaitingOdometer,
                    }
                } else if !(0..=1000).contains(&hours) {
                    CommandOutcome::Rejected {
                        error: "kilometers out of range".to_string(),
                        current: self.state,
                        allowed: RefillState::AwaitingOdometer,
                    }
                } else {
                    self.ctx.drf_hours = Some(hours as u32);
                    self.transition(RefillState::ReadingFirstMeter, "odometer accepted")
                        .await;
                    CommandOutcome::Accepted { state: self.state }
                }
            }
            CommandKind::ForceFinish => {
                if matches!(
                    self.state,
                    RefillState::Dispensing | RefillState::Interrupted
                ) {
                    self.transition(RefillState::ForceStopping, "operator finish")
                        .await;
                    CommandOutcome::Accepted { state: self.state }
                } else {
                    CommandOutcome::Rejected {
                        error: "no active dispensing to finish".to_string(),
                        current: self.state,
                        allowed: RefillState::Dispensing,
                    }
                }
            }
            CommandKind::StatusPolled => {
                if self.state == RefillState::AwaitingOperatorAck {
                    self.ctx.app_informed = true;
                    self.transition(RefillState::Idle, "operator informed").await;
                }
                CommandOutcome::Accepted { state: self.state }
            }
        };
        if let Some(reply) = cmd.reply {
            let _ = reply.send(outcome);
        }
    }

    // ── Finalization ────────────────────────────────────────────────────

    async fn finalize(&mut self, final_liters: Decimal) {
        self.finalize_record(final_liters).await;
        self.transition(RefillState::AwaitingOperatorAck, "refill finalized")
            .await;
    }

    /// Persists the refill outcome. Positive volumes complete the
    /// transaction and report hours best-effort; zero volumes delete it.
    async fn finalize_record(&mut self, final_liters: Decimal) {
        self.ctx.final_liters = Some(final_liters);
        self.ctx.app_informed = false;

        if final_liters > Decimal::ZERO {
            let Some(tx) = self.ctx.tx.clone() else {
                return;
            };
            if let Err(err) = self.store.complete(tx.id, final_liters).await {
                log::error!("completing transaction {} failed: {err}", tx.id);
            }
            if let Err(err) = self.store.add_dispensed(final_liters).await {
                log::error!("updating tank total failed: {err}");
            }
            if let Err(err) = self.store.clear_incomplete().await {
                log::error!("clearing incomplete rows failed: {err}");
            }
            if let Some(hours) = self.ctx.drf_hours {
                if let Err(err) = self.directory.update_vehicle_hours(&tx.tag, hours).await {
                    log::warn!("vehicle hours update failed (non-fatal): {err}");
                }
            }
            self.ctx.filter.mark_saved(final_liters);
            if let Some(t) = self.ctx.tx.as_mut() {
                t.dispensed_liters = final_liters;
                t.status = TxStatus::Completed;
            }
            self.bus.publish(
                Event::now(EventKind::TransactionFinalized).with_liters(final_liters),
            );
            self.bus
                .publish(Event::now(EventKind::RefillCompleted).with_liters(final_liters));
        } else {
            if let Some(tx) = self.ctx.tx.take() {
                if let Err(err) = self.store.delete(tx.id).await {
                    log::error!("deleting transaction {} failed: {err}", tx.id);
                }
                if let Err(err) = self.store.clear_incomplete().await {
                    log::error!("clearing incomplete rows failed: {err}");
                }
                self.bus
                    .publish(Event::now(EventKind::TransactionDeleted).with_reason("0L DISPENSE"));
            }
            self.bus
                .publish(Event::now(EventKind::ZeroDispense).with_reason("0L DISPENSE"));
        }
    }

    // ── Plumbing ────────────────────────────────────────────────────────

    async fn on_link_closed(&mut self) {
        if self.state != RefillState::Faulted {
            self.ctx.message = "Nozzle communication lost".to_string();
            self.transition(RefillState::Faulted, "serial transport closed")
                .await;
        }
    }

    async fn on_shutdown(&mut self) {
        if self.solenoid_open {
            self.close_solenoid().await;
        }
        self.bus.publish(Event::now(EventKind::ShutdownRequested));
    }

    async fn open_solenoid(&mut self) {
        if self.solenoid_open {
            return;
        }
        if let Err(err) = self.port.send(Command::SetSolenoid { open: true }).await {
            log::error!("solenoid open failed: {err}");
            return;
        }
        self.solenoid_open = true;
        self.bus
            .publish(Event::now(EventKind::SolenoidCommanded).with_reason("open"));
    }

    async fn close_solenoid(&mut self) {
        if !self.solenoid_open {
            return;
        }
        // The flag drops regardless: the commanded state is unknown after a
        // failed write and the transport fault path takes over.
        self.solenoid_open = false;
        if let Err(err) = self.port.send(Command::SetSolenoid { open: false }).await {
            log::error!("solenoid close failed: {err}");
        }
        self.bus
            .publish(Event::now(EventKind::SolenoidCommanded).with_reason("closed"));
    }

    async fn send_or_fault(&mut self, cmd: Command) -> bool {
        match self.port.send(cmd).await {
            Ok(()) => true,
            Err(err) => {
                let (to, reason) = self.transport_fault(err);
                self.transition(to, reason).await;
                false
            }
        }
    }

    fn arm(&mut self, family: Family, deadline: Duration) {
        self.ctx.pending = Some(PendingRequest::new(family, deadline));
    }

    fn publish_watch_expired(&self, watch: Watch) {
        self.bus
            .publish(Event::now(EventKind::WatchExpired).with_reason(watch.as_str()));
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state.as_str().to_string(),
            previous_state: self.prev_state.as_str().to_string(),
            timestamp: self.transitioned_at,
            transaction: self.ctx.tx.clone(),
            vehicle: self.ctx.vehicle.clone(),
            meter: MeterSnapshot {
                current: self.ctx.filter.current(),
                last_stable: self.ctx.filter.last_stable(),
                last_saved: self.ctx.filter.last_saved(),
            },
            message: self.ctx.message.clone(),
            current: self.state,
            finished_by_user: self.ctx.finished_by_user,
            final_liters: self.ctx.final_liters,
        }
    }
}
