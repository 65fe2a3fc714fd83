//! End-to-end refill scenarios against scripted collaborators.
//!
//! The machine runs as a real task under paused tokio time; tests feed
//! frames and commands into its queues, advance the clock, and assert on
//! snapshots, the store, and the event stream.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use fuelvisor::directory::{FleetDirectory, Vehicle};
use fuelvisor::error::{DirectoryError, PortError, StoreError};
use fuelvisor::port::{Command, Family, Frame, NozzleLink};
use fuelvisor::store::{NewTransaction, Transaction, TransactionStore, TxStatus};
use fuelvisor::supervisor::{
    CommandKind, CommandOutcome, OperatorCommand, RefillState, StatusSnapshot, Supervisor,
};
use fuelvisor::{Bus, Config, Event, EventKind, HealthMonitor};

const TAG: &str = "E200001D8914005717701BFC";

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

// ── Scripted collaborators ──────────────────────────────────────────────

#[derive(Default)]
struct FakeLink {
    sent: StdMutex<Vec<String>>,
    replies: StdMutex<HashMap<Family, VecDeque<Frame>>>,
}

impl FakeLink {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn script_reply(&self, line: &str) {
        let frame = Frame::parse(line).unwrap();
        self.replies
            .lock()
            .unwrap()
            .entry(frame.family)
            .or_default()
            .push_back(frame);
    }
}

#[async_trait]
impl NozzleLink for FakeLink {
    async fn request(&self, cmd: Command) -> Result<Frame, PortError> {
        self.sent.lock().unwrap().push(cmd.encode());
        let family = cmd.response_family().expect("request needs a reply family");
        self.replies
            .lock()
            .unwrap()
            .get_mut(&family)
            .and_then(VecDeque::pop_front)
            .ok_or(PortError::Timeout {
                family: family.as_str(),
                deadline: Duration::from_secs(5),
            })
    }

    async fn send(&self, cmd: Command) -> Result<(), PortError> {
        self.sent.lock().unwrap().push(cmd.encode());
        Ok(())
    }
}

#[derive(Default)]
struct MemStore {
    rows: StdMutex<Vec<Transaction>>,
    total: StdMutex<Decimal>,
    next_id: StdMutex<u64>,
    fail_create: bool,
}

impl MemStore {
    fn rows(&self) -> Vec<Transaction> {
        self.rows.lock().unwrap().clone()
    }

    fn total(&self) -> Decimal {
        *self.total.lock().unwrap()
    }
}

#[async_trait]
impl TransactionStore for MemStore {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, StoreError> {
        if self.fail_create {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        let tx = Transaction {
            id: *next,
            tag: new.tag,
            fleet_number: new.fleet_number,
            start_meter: new.start_meter,
            dispensed_liters: Decimal::ZERO,
            machine_hours: new.machine_hours,
            created_at: chrono::Utc::now(),
            status: TxStatus::Initiated,
        };
        self.rows.lock().unwrap().push(tx.clone());
        Ok(tx)
    }

    async fn update_liters(&self, id: u64, liters: Decimal) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let tx = rows
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::NotFound { id })?;
        tx.dispensed_liters = liters;
        if tx.status == TxStatus::Initiated {
            tx.status = TxStatus::InProgress;
        }
        Ok(())
    }

    async fn complete(&self, id: u64, final_liters: Decimal) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let tx = rows
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::NotFound { id })?;
        tx.dispensed_liters = final_liters;
        tx.status = TxStatus::Completed;
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<(), StoreError> {
        self.rows.lock().unwrap().retain(|t| t.id != id);
        Ok(())
    }

    async fn add_dispensed(&self, liters: Decimal) -> Result<(), StoreError> {
        *self.total.lock().unwrap() += liters;
        Ok(())
    }

    async fn clear_incomplete(&self) -> Result<u32, StoreError> {
        let mut flagged = 0;
        for tx in self.rows.lock().unwrap().iter_mut() {
            if matches!(tx.status, TxStatus::Initiated | TxStatus::InProgress) {
                tx.status = TxStatus::NeedsReview;
                flagged += 1;
            }
        }
        Ok(flagged)
    }
}

struct FakeDirectory {
    vehicles: HashMap<String, Vehicle>,
    hours_reports: StdMutex<Vec<(String, u32)>>,
}

impl FakeDirectory {
    fn with_vehicle(capacity: &str) -> Self {
        let vehicle = Vehicle {
            tag: TAG.to_string(),
            fleet_number: "LDR-42".to_string(),
            tank_capacity_liters: capacity.parse().unwrap(),
            current_machine_hours: 200,
        };
        Self {
            vehicles: HashMap::from([(TAG.to_string(), vehicle)]),
            hours_reports: StdMutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl FleetDirectory for FakeDirectory {
    async fn refresh_tags(&self) -> Result<usize, DirectoryError> {
        Ok(self.vehicles.len())
    }

    async fn validate_tag(&self, tag: &str) -> Option<Vehicle> {
        self.vehicles.get(tag).cloned()
    }

    async fn update_vehicle_hours(&self, tag: &str, hours: u32) -> Result<(), DirectoryError> {
        self.hours_reports
            .lock()
            .unwrap()
            .push((tag.to_string(), hours));
        Ok(())
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    link: Arc<FakeLink>,
    store: Arc<MemStore>,
    directory: Arc<FakeDirectory>,
    frames: mpsc::Sender<Frame>,
    commands: mpsc::Sender<OperatorCommand>,
    status: watch::Receiver<StatusSnapshot>,
    events: broadcast::Receiver<Event>,
    _cancel: CancellationToken,
}

impl Harness {
    fn spawn_with(directory: FakeDirectory, store: MemStore) -> Self {
        let cfg = Config::default();
        let link = Arc::new(FakeLink::default());
        let store = Arc::new(store);
        let directory = Arc::new(directory);
        let bus = Bus::new(4096);
        let events = bus.subscribe();
        let health = Arc::new(HealthMonitor::new(
            cfg.board_heartbeat_budget(),
            cfg.nozzle_heartbeat_budget(),
            cfg.app_comm_budget(),
        ));
        let (frames_tx, frames_rx) = mpsc::channel(256);
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (machine, status) = Supervisor::new(
            cfg,
            link.clone(),
            store.clone(),
            directory.clone(),
            health,
            bus,
        );
        let cancel = CancellationToken::new();
        tokio::spawn(machine.run(frames_rx, commands_rx, cancel.clone()));
        Self {
            link,
            store,
            directory,
            frames: frames_tx,
            commands: commands_tx,
            status,
            events,
            _cancel: cancel,
        }
    }

    fn spawn() -> Self {
        Self::spawn_with(FakeDirectory::with_vehicle("100"), MemStore::default())
    }

    async fn feed(&self, line: &str) {
        self.frames.send(Frame::parse(line).unwrap()).await.unwrap();
        sleep(Duration::from_millis(20)).await;
    }

    async fn command(&self, kind: CommandKind) -> CommandOutcome {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(OperatorCommand {
                kind,
                reply: Some(tx),
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    fn state(&self) -> String {
        self.status.borrow().state.clone()
    }

    fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    async fn wait_state(&self, want: &str, within: Duration) {
        let step = Duration::from_millis(200);
        let mut waited = Duration::ZERO;
        while waited <= within {
            if self.state() == want {
                return;
            }
            sleep(step).await;
            waited += step;
        }
        panic!("never reached {want}; stuck in {}", self.state());
    }

    fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }

    /// Drives Idle → Dispensing with the standard vehicle and an initial
    /// meter reading of 0.0.
    async fn reach_dispensing(&self) {
        let outcome = self.command(CommandKind::StartRefill).await;
        assert!(matches!(outcome, CommandOutcome::Accepted { .. }));
        self.feed(&format!("rfid_get(0076,{TAG},2013)")).await;
        self.wait_state("AwaitingOdometer", Duration::from_secs(2)).await;

        let outcome = self
            .command(CommandKind::SubmitOdometer { hours: 250 })
            .await;
        assert!(matches!(outcome, CommandOutcome::Accepted { .. }));
        self.feed("meter_read(0.0)").await;
        self.wait_state("AwaitingTagMatch", Duration::from_secs(2)).await;

        self.feed("rfid_match(0076,1)").await;
        self.wait_state("Dispensing", Duration::from_secs(2)).await;
    }
}

fn state_by_name(name: &str) -> RefillState {
    use RefillState::*;
    [
        Idle,
        Starting,
        AwaitingFirstRfid,
        AwaitingOdometer,
        ReadingFirstMeter,
        AwaitingTagMatch,
        Dispensing,
        Interrupted,
        FinalMeterRead,
        AwaitingStability,
        AwaitingOperatorAck,
        ForceStopping,
        Faulted,
    ]
    .into_iter()
    .find(|s| s.as_str() == name)
    .unwrap_or_else(|| panic!("unknown state {name}"))
}

fn solenoid_commands(sent: &[String]) -> Vec<&String> {
    sent.iter().filter(|l| l.starts_with("set_solenoid")).collect()
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn happy_path_refill_dispenses_and_persists() {
    let mut h = Harness::spawn();
    sleep(Duration::from_millis(100)).await;

    // pair_nozzle goes out exactly once, on first Idle entry.
    assert!(h.link.sent().contains(&"pair_nozzle(0076)".to_string()));

    h.reach_dispensing().await;
    let sent = h.link.sent();
    assert!(sent.contains(&format!("rfid_get_cont(0076,{TAG})")));
    assert!(sent.contains(&"set_solenoid(1)".to_string()));
    assert_eq!(h.store.rows().len(), 1);

    // Liters accumulate; every full liter is persisted.
    h.feed("meter_read(4.1)").await;
    h.feed("meter_read(9.0)").await;
    h.feed("meter_read(12.3)").await;
    assert_eq!(h.store.rows()[0].dispensed_liters, dec("12.3"));
    assert_eq!(h.store.rows()[0].status, TxStatus::InProgress);

    // Stability: same value again after five seconds.
    sleep(Duration::from_secs(6)).await;
    h.feed("meter_read(12.3)").await;
    assert_eq!(h.snapshot().meter.last_stable, dec("12.3"));

    // Operator finishes; the force-stop fetch and the final read agree.
    h.link.script_reply("meter_read(12.3)");
    let outcome = h.command(CommandKind::ForceFinish).await;
    assert!(matches!(outcome, CommandOutcome::Accepted { .. }));
    h.wait_state("FinalMeterRead", Duration::from_secs(2)).await;
    h.feed("meter_read(12.3)").await;
    h.wait_state("AwaitingOperatorAck", Duration::from_secs(2)).await;

    let snapshot = h.snapshot();
    assert!(snapshot.finished_by_user);
    assert_eq!(snapshot.final_liters, Some(dec("12.3")));
    assert_eq!(snapshot.message, "Refill ended by user");

    // Persisted outcome: completed row, tank total, best-effort hours.
    let rows = h.store.rows();
    assert_eq!(rows[0].status, TxStatus::Completed);
    assert_eq!(rows[0].dispensed_liters, dec("12.3"));
    assert_eq!(h.store.total(), dec("12.3"));
    assert_eq!(
        h.directory.hours_reports.lock().unwrap().as_slice(),
        &[(TAG.to_string(), 250)]
    );

    // The operator poll acknowledges and the machine returns to Idle.
    h.command(CommandKind::StatusPolled).await;
    h.wait_state("Idle", Duration::from_secs(2)).await;

    // Solenoid opens pair with closes and the wire ends closed.
    let sent = h.link.sent();
    let solenoid = solenoid_commands(&sent);
    let opens = solenoid.iter().filter(|l| *l == &"set_solenoid(1)").count();
    let closes = solenoid.iter().filter(|l| *l == &"set_solenoid(0)").count();
    assert_eq!(opens, 1);
    assert_eq!(closes, 1);
    assert_eq!(*solenoid.last().unwrap(), "set_solenoid(0)");

    // Ordering guarantee across the whole refill.
    let position = |needle: &str| sent.iter().position(|l| l == needle).unwrap();
    assert!(position("pair_nozzle(0076)") < position("rfid_get(0076)"));
    assert!(position("rfid_get(0076)") < position("meter_reset()"));
    assert!(position("meter_reset()") < position(&format!("rfid_get_cont(0076,{TAG})")));
    assert!(position(&format!("rfid_get_cont(0076,{TAG})")) < position("set_solenoid(1)"));
    assert!(position("set_solenoid(1)") < position("set_solenoid(0)"));
    assert!(position("set_solenoid(0)") < position("rfid_stop(0076)"));

    // Every recorded transition is in the allowed set.
    for ev in h.drain_events() {
        if ev.kind == EventKind::StateChanged {
            let label = ev.state.unwrap();
            let (from, to) = label.split_once(" -> ").unwrap();
            let (from, to) = (state_by_name(from), state_by_name(to));
            assert!(
                to.allowed_predecessors().contains(&from),
                "illegal recorded transition {label}"
            );
            assert!(ev.reason.is_some_and(|r| !r.is_empty()));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_tag_is_discarded_and_the_window_expires() {
    let h = Harness::spawn();
    sleep(Duration::from_millis(100)).await;

    h.command(CommandKind::StartRefill).await;
    h.feed("rfid_get(0076,AAAAAAAAAAAAAAAAAAAAAAAA,2013)").await;
    assert_eq!(h.state(), "AwaitingFirstRfid");
    assert!(h.snapshot().vehicle.is_none());

    // Three minutes later the window closes with nothing created.
    h.wait_state("Idle", Duration::from_secs(200)).await;
    assert!(h.store.rows().is_empty());
}

#[tokio::test(start_paused = true)]
async fn nozzle_silence_interrupts_then_recovery_reopens() {
    let h = Harness::spawn();
    sleep(Duration::from_millis(100)).await;
    h.reach_dispensing().await;

    // Meter replies keep flowing (the meter is on the board), but nothing
    // nozzle-originated arrives for over forty seconds.
    for _ in 0..21 {
        h.feed("meter_read(9.0)").await;
        sleep(Duration::from_secs(2)).await;
    }
    h.wait_state("Interrupted", Duration::from_secs(5)).await;
    assert_eq!(h.snapshot().message, "Nozzle communication lost");

    // Recovery probes go out on the retry interval.
    let probes_before = h
        .link
        .sent()
        .iter()
        .filter(|l| *l == "rfid_get(0076)")
        .count();
    sleep(Duration::from_secs(11)).await;
    let probes_after = h
        .link
        .sent()
        .iter()
        .filter(|l| *l == "rfid_get(0076)")
        .count();
    assert!(probes_after >= probes_before + 2);

    // The bound tag answers: solenoid reopens, dispensing resumes.
    h.feed(&format!("rfid_get(0076,{TAG},2013)")).await;
    h.wait_state("Dispensing", Duration::from_secs(2)).await;

    // Second loss, and this time nobody answers until the budget is gone.
    for _ in 0..21 {
        h.feed("meter_read(9.0)").await;
        sleep(Duration::from_secs(2)).await;
    }
    h.wait_state("Interrupted", Duration::from_secs(5)).await;
    h.wait_state("FinalMeterRead", Duration::from_secs(200)).await;
    // No final meter reply either; the filter's last stable value stands.
    h.wait_state("AwaitingOperatorAck", Duration::from_secs(15)).await;

    let snapshot = h.snapshot();
    assert_eq!(snapshot.message, "Nozzle removed. Ending refill.");
    assert_eq!(h.store.rows()[0].status, TxStatus::Completed);
    assert_eq!(h.store.rows()[0].dispensed_liters, dec("9.0"));
}

#[tokio::test(start_paused = true)]
async fn zero_liter_dispense_deletes_the_transaction() {
    let mut h = Harness::spawn();
    sleep(Duration::from_millis(100)).await;
    h.reach_dispensing().await;
    assert_eq!(h.store.rows().len(), 1);

    h.feed("meter_read(0.0)").await;
    h.link.script_reply("meter_read(0.0)");
    h.command(CommandKind::ForceFinish).await;
    h.wait_state("AwaitingOperatorAck", Duration::from_secs(2)).await;

    assert!(h.store.rows().is_empty());
    assert!(h.snapshot().transaction.is_none());
    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::ZeroDispense
            && e.reason.as_deref() == Some("0L DISPENSE")));

    h.wait_state("Idle", Duration::from_secs(15)).await;
}

#[tokio::test(start_paused = true)]
async fn tank_capacity_closes_the_valve_at_the_edge() {
    let h = Harness::spawn_with(FakeDirectory::with_vehicle("50"), MemStore::default());
    sleep(Duration::from_millis(100)).await;
    h.reach_dispensing().await;

    // Just below capacity keeps dispensing.
    h.feed("meter_read(49.9)").await;
    assert_eq!(h.state(), "Dispensing");

    // Exactly at capacity stops.
    h.feed("meter_read(50.0)").await;
    h.wait_state("FinalMeterRead", Duration::from_secs(2)).await;
    assert_eq!(h.snapshot().message, "Max Tank Capacity Reached");
    let sent = h.link.sent();
    assert!(sent.contains(&"rfid_stop(0076)".to_string()));
    assert_eq!(*solenoid_commands(&sent).last().unwrap(), "set_solenoid(0)");

    // The final value settles over two read/settle rounds, then finalizes.
    h.feed("meter_read(50.0)").await;
    h.wait_state("AwaitingStability", Duration::from_secs(2)).await;
    sleep(Duration::from_secs(6)).await;
    h.wait_state("FinalMeterRead", Duration::from_secs(2)).await;
    h.feed("meter_read(50.0)").await;
    sleep(Duration::from_secs(6)).await;
    h.wait_state("FinalMeterRead", Duration::from_secs(2)).await;
    h.feed("meter_read(50.0)").await;
    h.wait_state("AwaitingOperatorAck", Duration::from_secs(2)).await;

    assert_eq!(h.store.rows()[0].dispensed_liters, dec("50.0"));
    assert_eq!(h.store.total(), dec("50.0"));
}

#[tokio::test(start_paused = true)]
async fn odometer_bounds_are_inclusive_at_1000() {
    let h = Harness::spawn();
    sleep(Duration::from_millis(100)).await;

    h.command(CommandKind::StartRefill).await;
    h.feed(&format!("rfid_get(0076,{TAG},2013)")).await;
    h.wait_state("AwaitingOdometer", Duration::from_secs(2)).await;

    let rejected = h.command(CommandKind::SubmitOdometer { hours: 1001 }).await;
    assert!(matches!(
        rejected,
        CommandOutcome::Rejected { current: RefillState::AwaitingOdometer, .. }
    ));
    assert_eq!(h.state(), "AwaitingOdometer");

    let accepted = h.command(CommandKind::SubmitOdometer { hours: 1000 }).await;
    assert!(matches!(accepted, CommandOutcome::Accepted { .. }));
}

#[tokio::test(start_paused = true)]
async fn out_of_range_odometer_then_submit_timeout_returns_to_idle() {
    let h = Harness::spawn();
    sleep(Duration::from_millis(100)).await;

    h.command(CommandKind::StartRefill).await;
    h.feed(&format!("rfid_get(0076,{TAG},2013)")).await;
    h.wait_state("AwaitingOdometer", Duration::from_secs(2)).await;

    let rejected = h.command(CommandKind::SubmitOdometer { hours: 9999 }).await;
    assert!(matches!(rejected, CommandOutcome::Rejected { .. }));
    assert_eq!(h.state(), "AwaitingOdometer");

    // Two minutes of silence: the reader stops and the cycle resets.
    h.wait_state("Idle", Duration::from_secs(140)).await;
    assert!(h.link.sent().contains(&"rfid_get_stop(0076)".to_string()));
    assert!(h.store.rows().is_empty());
}

#[tokio::test(start_paused = true)]
async fn an_alarm_beats_meter_replies_arriving_in_the_same_tick() {
    let h = Harness::spawn();
    sleep(Duration::from_millis(100)).await;
    h.reach_dispensing().await;

    // Both frames are queued before the machine runs again; the alarm must
    // still win.
    h.frames
        .send(Frame::parse("meter_read(5.0)").unwrap())
        .await
        .unwrap();
    h.frames
        .send(Frame::parse("rfid_alarm(0076)").unwrap())
        .await
        .unwrap();
    h.wait_state("Interrupted", Duration::from_secs(2)).await;
}

#[tokio::test(start_paused = true)]
async fn store_failure_on_create_ends_the_refill_with_database_error() {
    let store = MemStore {
        fail_create: true,
        ..MemStore::default()
    };
    let h = Harness::spawn_with(FakeDirectory::with_vehicle("100"), store);
    sleep(Duration::from_millis(100)).await;

    h.command(CommandKind::StartRefill).await;
    h.feed(&format!("rfid_get(0076,{TAG},2013)")).await;
    h.command(CommandKind::SubmitOdometer { hours: 250 }).await;
    h.feed("meter_read(0.0)").await;
    h.wait_state("AwaitingTagMatch", Duration::from_secs(2)).await;

    h.feed("rfid_match(0076,1)").await;
    h.wait_state("AwaitingOperatorAck", Duration::from_secs(2)).await;
    assert_eq!(h.snapshot().message, "Database Error");

    // The valve was never opened.
    assert!(solenoid_commands(&h.link.sent()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn guards_reject_commands_in_the_wrong_state() {
    let h = Harness::spawn();
    sleep(Duration::from_millis(100)).await;

    // Nothing to finish in Idle, nothing to submit either.
    let finish = h.command(CommandKind::ForceFinish).await;
    assert!(matches!(
        finish,
        CommandOutcome::Rejected { current: RefillState::Idle, allowed: RefillState::Dispensing, .. }
    ));
    let drf = h.command(CommandKind::SubmitOdometer { hours: 100 }).await;
    assert!(matches!(drf, CommandOutcome::Rejected { .. }));

    // A second start while a refill is running is rejected too.
    h.command(CommandKind::StartRefill).await;
    let again = h.command(CommandKind::StartRefill).await;
    assert!(matches!(
        again,
        CommandOutcome::Rejected { allowed: RefillState::Idle, .. }
    ));
    assert_eq!(h.state(), "AwaitingFirstRfid");
}

#[tokio::test(start_paused = true)]
async fn link_closure_faults_and_a_recovery_sequence_restores_idle() {
    let cfg = Config::default();
    let link = Arc::new(FakeLink::default());
    let store = Arc::new(MemStore::default());
    let directory = Arc::new(FakeDirectory::with_vehicle("100"));
    let bus = Bus::new(4096);
    let health = Arc::new(HealthMonitor::new(
        cfg.board_heartbeat_budget(),
        cfg.nozzle_heartbeat_budget(),
        cfg.app_comm_budget(),
    ));
    let (frames_tx, frames_rx) = mpsc::channel(256);
    let (_commands_tx, commands_rx) = mpsc::channel(64);
    let (machine, status) =
        Supervisor::new(cfg, link.clone(), store, directory, health, bus);
    tokio::spawn(machine.run(frames_rx, commands_rx, CancellationToken::new()));
    sleep(Duration::from_millis(100)).await;

    // Script the recovery probes, then cut the line.
    link.script_reply("heartbeat(0)");
    link.script_reply("meter_read(0.0)");
    link.script_reply("rfid_get(0076,-,2013)");
    drop(frames_tx);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(status.borrow().state, "Faulted");

    // The recovery sequence runs inside the 5-30 s window and succeeds:
    // with no open transaction the machine resets straight to Idle.
    let mut waited = Duration::ZERO;
    while status.borrow().state != "Idle" && waited < Duration::from_secs(20) {
        sleep(Duration::from_millis(500)).await;
        waited += Duration::from_millis(500);
    }
    assert_eq!(status.borrow().state, "Idle");
    let sent = link.sent();
    assert!(sent.contains(&"heartbeat()".to_string()));
    assert!(sent.contains(&"meter_reset()".to_string()));
    assert!(sent.contains(&"rfid_stop(0076)".to_string()));
}

#[tokio::test(start_paused = true)]
async fn rfid_probe_retries_are_bounded() {
    let h = Harness::spawn();
    sleep(Duration::from_millis(100)).await;

    h.command(CommandKind::StartRefill).await;
    // Silence: every 5 s attempt consumes budget; the 3-minute window
    // closes first and the machine lands back in Idle.
    h.wait_state("Idle", Duration::from_secs(200)).await;
    let probes = h
        .link
        .sent()
        .iter()
        .filter(|l| *l == "rfid_get(0076)")
        .count();
    assert!(probes >= 2, "expected repeated probes, saw {probes}");
}

#[tokio::test(start_paused = true)]
async fn idle_probes_the_board_heartbeat() {
    let h = Harness::spawn();
    sleep(Duration::from_secs(11)).await;
    let beats = h
        .link
        .sent()
        .iter()
        .filter(|l| *l == "heartbeat()")
        .count();
    assert!(beats >= 1);

    // A healthy reply refreshes the board watch and nothing faults.
    h.feed("heartbeat(0)").await;
    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.state(), "Idle");
}
