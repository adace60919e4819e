// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use seq_registers::layout::{control, evg, evr, irq, ram};
use seq_registers::{RegisterBus, SimulatedBus};

use super::*;
use crate::family::{EVG_TRAITS, EVR_TRAITS};
use crate::manager::SyncOutcome;

const CLOCK: f64 = 124.916e6;
const CTRL0: usize = evg::seq_control(0);
const RAM0: usize = evg::seq_ram(0);

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<(String, ScanEvent)>>,
}

impl RecordingListener {
    fn take(&self) -> Vec<(String, ScanEvent)> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl ScanListener for RecordingListener {
    fn scan_request(&self, sequence: &str, event: ScanEvent) {
        self.events
            .lock()
            .unwrap()
            .push((sequence.to_string(), event));
    }
}

struct Card {
    bus: Arc<SimulatedBus>,
    manager: SequenceManager,
    listener: Arc<RecordingListener>,
}

fn card(kind: FamilyKind, slots: usize) -> Card {
    let bus = Arc::new(SimulatedBus::new());
    bus.record_writes(true);
    let layouts = kind.traits().default_layout(slots);
    for layout in &layouts {
        bus.add_sequencer(layout.control);
    }
    let listener = Arc::new(RecordingListener::default());
    let manager = SequenceManager::with_listener(
        kind.to_string(),
        family_for(kind, Arc::<SimulatedBus>::clone(&bus), CLOCK),
        Arc::<SimulatedBus>::clone(&bus),
        &layouts,
        Arc::<RecordingListener>::clone(&listener),
    )
    .unwrap();
    Card {
        bus,
        manager,
        listener,
    }
}

fn evg_card(slots: usize) -> Card {
    card(FamilyKind::Evg, slots)
}

fn set_table(seq: &SoftSequence, times: &[u64], codes: &[u8]) {
    seq.set_timestamps(times).unwrap();
    seq.set_event_codes(codes).unwrap();
}

fn event(name: &str, event: ScanEvent) -> (String, ScanEvent) {
    (name.to_string(), event)
}

#[test]
fn test_commit_then_load_on_idle_pool() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    set_table(&seq, &[10, 20], &[5, 0x7f]);
    seq.set_run_mode(RunMode::Single as u32).unwrap();
    seq.commit().unwrap();
    assert_eq!(seq.timestamps(), vec![10, 20]);
    assert_eq!(seq.event_codes(), vec![5, 0x7f]);
    assert!(seq.is_committed());
    assert!(!seq.is_loaded());

    seq.load().unwrap();
    assert_eq!(seq.loaded_slot(), Some(0));
    assert_eq!(card.manager.slot_owner(0).as_deref(), Some("seq0"));
    assert!(seq.is_in_sync());
    assert_eq!(card.bus.ram(RAM0, 2), vec![(10, 5), (20, 0x7f)]);
    // single shot, own software trigger, not armed
    assert_eq!(card.bus.peek(CTRL0), control::REPEAT_SINGLE | 17);
}

#[test]
fn test_single_shot_disables_itself() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    set_table(&seq, &[10, 20], &[5, 0x7f]);
    seq.commit().unwrap();
    seq.load().unwrap();
    seq.enable().unwrap();
    assert!(card.bus.is_armed(CTRL0));
    card.listener.take();

    let handle = card.manager.interrupt_handle();
    handle.do_start_of_sequence(0);
    assert!(card.manager.is_slot_running(0));
    assert_eq!(seq.start_count(), 1);
    handle.do_end_of_sequence(0);
    assert!(!card.manager.is_slot_running(0));
    assert_eq!(seq.end_count(), 1);
    assert!(!seq.is_enabled());
    assert_eq!(
        card.listener.take(),
        vec![
            event("seq0", ScanEvent::Start),
            event("seq0", ScanEvent::End),
            event("seq0", ScanEvent::Changed),
        ]
    );
}

#[test]
fn test_normal_mode_stays_enabled() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    seq.set_run_mode(RunMode::Normal as u32).unwrap();
    seq.commit().unwrap();
    seq.load().unwrap();
    seq.enable().unwrap();
    assert_eq!(card.bus.peek(CTRL0), 17 | control::ENABLED);
    card.listener.take();

    let handle = card.manager.interrupt_handle();
    handle.dispatch(irq::start_of_sequence(0) | irq::end_of_sequence(0));
    assert_eq!(seq.start_count(), 1);
    assert_eq!(seq.end_count(), 1);
    assert!(seq.is_enabled());
    assert!(!card.manager.is_slot_running(0));
    assert_eq!(
        card.listener.take(),
        vec![event("seq0", ScanEvent::Start), event("seq0", ScanEvent::End)]
    );
}

#[test]
fn test_load_fails_when_pool_exhausted() {
    let card = evg_card(1);
    let a = card.manager.create_sequence("a").unwrap();
    let b = card.manager.create_sequence("b").unwrap();
    a.load().unwrap();

    let err = b.load().unwrap_err();
    assert!(matches!(err, Error::NoFreeSlot));
    assert!(!b.is_loaded());
    assert_eq!(b.error_text(), "All hardware sequencers are in use");
    assert_eq!(card.manager.slot_owner(0).as_deref(), Some("a"));

    a.unload().unwrap();
    assert!(!a.is_loaded());
    b.load().unwrap();
    assert_eq!(b.loaded_slot(), Some(0));
    assert_eq!(card.manager.slot_owner(0).as_deref(), Some("b"));
}

#[test]
fn test_one_sequence_per_slot() {
    let card = evg_card(2);
    let seqs: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| card.manager.create_sequence(name).unwrap())
        .collect();
    seqs[0].load().unwrap();
    seqs[1].load().unwrap();
    assert!(seqs[2].load().is_err());
    assert_eq!(seqs[0].loaded_slot(), Some(0));
    assert_eq!(seqs[1].loaded_slot(), Some(1));

    seqs[0].unload().unwrap();
    seqs[2].load().unwrap();
    assert_eq!(seqs[2].loaded_slot(), Some(0));
    assert_eq!(card.manager.slot_owner(0).as_deref(), Some("c"));
    assert_eq!(card.manager.slot_owner(1).as_deref(), Some("b"));
    // engine 1 has its own software trigger code
    assert_eq!(card.bus.peek(evg::seq_control(1)) & control::SOURCE_MASK, 18);
}

#[test]
fn test_rejected_timestamps_leave_committed_alone() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    set_table(&seq, &[1, 2], &[3, 0x7f]);
    seq.commit().unwrap();
    let before = seq.committed();
    card.listener.take();

    let err = seq.set_timestamps(&[5, 3]).unwrap_err();
    assert_eq!(err.to_string(), "Non-monotonic timestamp array at index 1");
    assert_eq!(seq.committed(), before);
    assert_eq!(seq.scratch().times, vec![1, 2]);
    assert!(seq.is_committed());
    assert_eq!(seq.error_text(), "Non-monotonic timestamp array at index 1");
    assert_eq!(card.listener.take(), vec![event("seq0", ScanEvent::Error)]);

    assert!(seq.set_timestamps(&[4, 4]).is_err());
    assert!(seq.set_timestamps(&[ram::ROLLOVER_TIMESTAMP]).is_err());
    assert_eq!(seq.scratch().times, vec![1, 2]);
}

#[test]
fn test_commit_while_running_defers_sync() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    set_table(&seq, &[10, 20], &[5, 0x7f]);
    seq.commit().unwrap();
    seq.load().unwrap();

    card.bus.set_running(CTRL0, true);
    seq.set_timestamps(&[100, 200]).unwrap();
    seq.commit().unwrap();
    assert!(!seq.is_in_sync());
    assert_eq!(seq.timestamps(), vec![100, 200]);
    assert_eq!(card.bus.ram(RAM0, 2), vec![(10, 5), (20, 0x7f)]);

    card.bus.set_running(CTRL0, false);
    card.manager.interrupt_handle().do_end_of_sequence(0);
    assert!(seq.is_in_sync());
    assert_eq!(card.bus.ram(RAM0, 2), vec![(100, 5), (200, 0x7f)]);
    assert!(!seq.needs_attention());
}

#[test]
fn test_commit_after_start_interrupt_defers_sync() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    seq.load().unwrap();
    let handle = card.manager.interrupt_handle();
    handle.do_start_of_sequence(0);

    set_table(&seq, &[7], &[1]);
    seq.commit().unwrap();
    assert!(!seq.is_in_sync());
    assert_eq!(card.bus.ram(RAM0, 1), vec![(0, 0x7f)]);

    // a sync attempt while running is refused and leaves RAM alone
    assert_eq!(seq.sync_now().unwrap(), SyncOutcome::Refused);
    assert!(seq.needs_attention());
    assert!(seq.take_anomaly().unwrap().contains("refused"));
    assert!(!seq.needs_attention());
    assert_eq!(card.bus.ram(RAM0, 1), vec![(0, 0x7f)]);

    handle.do_end_of_sequence(0);
    assert!(seq.is_in_sync());
    assert_eq!(card.bus.ram(RAM0, 2), vec![(7, 1), (8, 0x7f)]);
    assert_eq!(seq.sync_now().unwrap(), SyncOutcome::AlreadyInSync);
}

#[test]
fn test_pending_start_flag_defers_sync() {
    let card = card(FamilyKind::Evr, 1);
    let ctrl = evr::seq_control(0);
    let seq = card.manager.create_sequence("evr-seq").unwrap();
    seq.load().unwrap();
    assert_eq!(card.bus.peek(ctrl), control::REPEAT_SINGLE | 62);

    // start raised by the card, not yet seen by the handler
    card.bus.poke(irq::FLAG, irq::start_of_sequence(0));
    set_table(&seq, &[3], &[9]);
    seq.commit().unwrap();
    assert!(!seq.is_in_sync());

    card.bus.poke(irq::FLAG, 0);
    let handle = card.manager.interrupt_handle();
    handle.dispatch(irq::start_of_sequence(0) | irq::end_of_sequence(0));
    assert!(seq.is_in_sync());
    assert_eq!(card.bus.ram(evr::seq_ram(0), 2), vec![(3, 9), (4, 0x7f)]);
}

#[test]
fn test_deferred_sync_waits_for_idle_engine() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    seq.load().unwrap();
    card.bus.set_running(CTRL0, true);
    set_table(&seq, &[5], &[2]);
    seq.commit().unwrap();

    // end-of-sequence while the engine still reports running
    let handle = card.manager.interrupt_handle();
    handle.do_end_of_sequence(0);
    assert!(!seq.is_in_sync());
    assert!(seq.take_anomaly().is_some());

    card.bus.set_running(CTRL0, false);
    handle.do_start_of_sequence(0);
    handle.do_end_of_sequence(0);
    assert!(seq.is_in_sync());
    assert_eq!(card.bus.ram(RAM0, 2), vec![(5, 2), (6, 0x7f)]);
}

#[test]
fn test_enable_before_sync_arms_later() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    seq.load().unwrap();
    let handle = card.manager.interrupt_handle();
    handle.do_start_of_sequence(0);
    seq.set_run_mode(RunMode::Normal as u32).unwrap();
    set_table(&seq, &[5], &[2]);
    seq.commit().unwrap();

    card.bus.clear_writes();
    seq.enable().unwrap();
    assert!(seq.is_enabled());
    assert!(card.bus.writes().is_empty());

    handle.do_end_of_sequence(0);
    assert!(seq.is_in_sync());
    assert!(card.bus.is_armed(CTRL0));
}

#[test]
fn test_operations_are_idempotent() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    set_table(&seq, &[10], &[5]);
    seq.commit().unwrap();
    seq.load().unwrap();
    seq.enable().unwrap();
    card.bus.clear_writes();
    card.listener.take();

    seq.commit().unwrap();
    seq.load().unwrap();
    seq.enable().unwrap();
    assert!(card.bus.writes().is_empty());
    assert!(card.listener.take().is_empty());
    assert_eq!(seq.loaded_slot(), Some(0));
    assert!(seq.is_enabled());
    assert!(seq.is_in_sync());

    seq.disable().unwrap();
    let writes = card.bus.writes();
    seq.disable().unwrap();
    assert_eq!(card.bus.writes(), writes);
    assert!(!card.bus.is_armed(CTRL0));

    seq.unload().unwrap();
    let writes = card.bus.writes();
    seq.unload().unwrap();
    assert_eq!(card.bus.writes(), writes);
}

#[test]
fn test_soft_trigger_needs_loaded_and_enabled() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    seq.soft_trigger().unwrap();
    seq.load().unwrap();
    seq.soft_trigger().unwrap();
    assert_eq!(card.bus.software_triggers(CTRL0), 0);

    seq.enable().unwrap();
    seq.soft_trigger().unwrap();
    assert_eq!(card.bus.software_triggers(CTRL0), 1);
    assert_ne!(card.bus.peek(CTRL0) & control::RUNNING, 0);
}

#[test]
fn test_external_trigger_mapping() {
    let card = evg_card(1);
    let a = card.manager.create_sequence("a").unwrap();
    a.set_trigger_source(0x0202_0003).unwrap();
    a.commit().unwrap();
    a.load().unwrap();
    assert_eq!(a.trigger_source(), 0x0202_0003);
    assert_eq!(card.bus.peek(evg::universal_in_map(3)), evg::in_map_seq_trig(0));
    assert_eq!(card.bus.peek(CTRL0) & control::SOURCE_MASK, 24);

    // a new lease starts without stale input routing
    a.unload().unwrap();
    let b = card.manager.create_sequence("b").unwrap();
    b.load().unwrap();
    assert_eq!(card.bus.peek(evg::universal_in_map(3)), 0);
    assert_eq!(card.bus.peek(CTRL0) & control::SOURCE_MASK, 17);
}

#[test]
fn test_trigger_source_validation() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    assert!(seq.set_trigger_source(0x0400_0000).is_err());
    assert!(seq.set_trigger_source(0x0201_0009).is_err());
    assert!(seq.set_trigger_source(32).is_err());
    assert_eq!(seq.scratch().source, trigger::DEFAULT_SOURCE);

    seq.set_trigger_source(5).unwrap();
    seq.commit().unwrap();
    seq.load().unwrap();
    assert_eq!(card.bus.peek(CTRL0) & control::SOURCE_MASK, 5);

    seq.set_trigger_source(0x0300_0000).unwrap();
    seq.commit().unwrap();
    assert_eq!(card.bus.peek(CTRL0) & control::SOURCE_MASK, 31);

    let evr = card_evr();
    let seq = evr.manager.create_sequence("seq0").unwrap();
    assert!(seq.set_trigger_source(0x0201_0000).is_err());
    seq.set_trigger_source(63).unwrap();
    assert!(seq.set_trigger_source(64).is_err());
}

fn card_evr() -> Card {
    card(FamilyKind::Evr, EVR_TRAITS.max_sequencers)
}

#[test]
fn test_run_mode_validation() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    let err = seq.set_run_mode(1).unwrap_err();
    assert_eq!(err.to_string(), "Unknown sequencer run mode 1");
    assert_eq!(seq.scratch().mode, RunMode::Single);
    seq.set_run_mode(0).unwrap();
    seq.commit().unwrap();
    assert_eq!(seq.run_mode(), RunMode::Normal);
}

#[test]
fn test_commit_packing() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();

    // empty table is just the sentinel
    seq.commit().unwrap();
    assert_eq!(seq.timestamps(), vec![0]);
    assert_eq!(seq.event_codes(), vec![0x7f]);

    // truncated to the shorter list
    set_table(&seq, &[1, 2, 3], &[4, 5]);
    seq.commit().unwrap();
    assert_eq!(seq.timestamps(), vec![1, 2, 3]);
    assert_eq!(seq.event_codes(), vec![4, 5, 0x7f]);

    // full RAM including the sentinel
    let times: Vec<u64> = (0..EVG_TRAITS.ram_capacity as u64).collect();
    let mut codes = vec![1; times.len()];
    seq.set_timestamps(&times).unwrap();
    seq.set_event_codes(&codes).unwrap();
    let err = seq.commit().unwrap_err();
    assert!(err.to_string().starts_with("Sequence too long"));
    assert_eq!(seq.timestamps(), vec![1, 2, 3]);

    *codes.last_mut().unwrap() = 0x7f;
    seq.set_event_codes(&codes).unwrap();
    seq.commit().unwrap();
    assert_eq!(seq.timestamps().len(), 2048);
}

#[test]
fn test_sentinel_must_not_hit_rollover() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    set_table(&seq, &[ram::ROLLOVER_TIMESTAMP - 1], &[1]);
    assert!(seq.commit().unwrap_err().to_string().contains("overflow"));
    seq.set_event_codes(&[0x7f]).unwrap();
    seq.commit().unwrap();
}

#[test]
fn test_timestamps_in_seconds() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    seq.set_timestamps_seconds(&[0.0, 1e-6, 1e-3]).unwrap();
    assert_eq!(seq.scratch().times, vec![0, 125, 124_916]);
    seq.set_event_codes(&[1, 2, 0x7f]).unwrap();
    seq.commit().unwrap();
    let seconds = seq.timestamps_seconds();
    assert!((seconds[2] - 1e-3).abs() < 1e-12);

    assert!(seq.set_timestamps_seconds(&[-1.0]).is_err());
    assert!(seq.set_timestamps_seconds(&[f64::INFINITY]).is_err());
    assert!(seq.set_timestamps_seconds(&[1e-6, 1e-6]).is_err());
    assert!(seq.set_timestamps_seconds(&[100.0]).is_err());
    assert_eq!(seq.scratch().times, vec![0, 125, 124_916]);
}

#[test]
fn test_hardware_error_on_load_releases_slot() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    card.bus.inject_fault(RAM0);
    let err = seq.load().unwrap_err();
    assert!(matches!(err, Error::Hardware(_)));
    assert!(!seq.is_loaded());
    assert_eq!(card.manager.slot_owner(0), None);
    assert!(seq.error_text().starts_with("Bus access at offset 0x8000"));

    card.bus.clear_fault(RAM0);
    seq.load().unwrap();
    assert!(seq.is_in_sync());
}

#[test]
fn test_hardware_error_on_commit() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    set_table(&seq, &[10, 20], &[5, 0x7f]);
    seq.commit().unwrap();
    seq.load().unwrap();
    let before = seq.committed();

    card.bus.inject_fault(CTRL0);
    seq.set_timestamps(&[100, 200]).unwrap();
    card.listener.take();
    assert!(matches!(seq.commit(), Err(Error::Hardware(_))));
    assert_eq!(card.listener.take(), vec![event("seq0", ScanEvent::Error)]);
    assert!(seq.error_text().starts_with("Bus access at offset 0x0070"));
    assert_eq!(seq.committed(), before);
    assert!(!seq.is_committed());
    assert!(seq.is_in_sync());
    assert_eq!(card.bus.ram(RAM0, 2), vec![(10, 5), (20, 0x7f)]);

    card.bus.clear_fault(CTRL0);
    seq.commit().unwrap();
    assert!(seq.is_committed());
    assert!(seq.is_in_sync());
    assert_eq!(seq.timestamps(), vec![100, 200]);
    assert_eq!(card.bus.ram(RAM0, 2), vec![(100, 5), (200, 0x7f)]);
}

#[test]
fn test_failed_ram_write_on_commit_can_be_retried() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    set_table(&seq, &[10, 20], &[5, 0x7f]);
    seq.commit().unwrap();
    seq.load().unwrap();
    let before = seq.committed();

    let second_entry = ram::timestamp_offset(RAM0, 1);
    card.bus.inject_fault(second_entry);
    seq.set_timestamps(&[100, 200]).unwrap();
    assert!(matches!(seq.commit(), Err(Error::Hardware(_))));
    assert_eq!(seq.committed(), before);
    assert!(!seq.is_committed());
    // the first entry already went out, RAM holds neither table
    assert!(!seq.is_in_sync());

    card.bus.clear_fault(second_entry);
    seq.commit().unwrap();
    assert!(seq.is_in_sync());
    assert_eq!(card.bus.ram(RAM0, 2), vec![(100, 5), (200, 0x7f)]);
}

#[test]
fn test_unload_is_best_effort() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    seq.load().unwrap();
    card.bus.inject_fault(CTRL0);
    seq.unload().unwrap();
    assert!(!seq.is_loaded());
    assert_eq!(card.manager.slot_owner(0), None);
}

#[test]
fn test_registry() {
    let card = evg_card(1);
    let a = card.manager.create_sequence("a").unwrap();
    let _b = card.manager.create_sequence("b").unwrap();
    assert!(card.manager.create_sequence("a").is_err());
    assert_eq!(card.manager.sequence_names(), vec!["a", "b"]);

    a.load().unwrap();
    drop(a);
    assert_eq!(card.manager.slot_owner(0), None);
    assert_eq!(card.manager.sequence_names(), vec!["b"]);

    let a = card.manager.create_sequence("a").unwrap();
    assert_eq!(a.name(), "a");
    assert!(!a.is_loaded());
    assert_eq!(a.start_count(), 0);
}

#[test]
fn test_unknown_slot_is_an_anomaly() {
    let card = evg_card(1);
    let handle = card.manager.interrupt_handle();
    handle.do_end_of_sequence(1);
    assert!(card.manager.take_anomaly().unwrap().contains("sequencer 1"));
    assert_eq!(card.manager.take_anomaly(), None);

    // nothing loaded, nothing counted
    handle.do_start_of_sequence(0);
    assert!(card.manager.is_slot_running(0));
    handle.do_end_of_sequence(0);
    assert!(!card.manager.is_slot_running(0));
}

#[test]
fn test_edits_notify_observers() {
    let card = evg_card(1);
    let seq = card.manager.create_sequence("seq0").unwrap();
    set_table(&seq, &[1], &[2]);
    seq.commit().unwrap();
    assert!(seq.is_committed());
    assert_eq!(
        card.listener.take(),
        vec![
            event("seq0", ScanEvent::Changed),
            event("seq0", ScanEvent::Changed),
            event("seq0", ScanEvent::Changed),
        ]
    );
    seq.set_event_codes(&[3]).unwrap();
    assert!(!seq.is_committed());
}

/// Passes everything to a simulated card and counts RAM writes that happen
/// while engine 0 is playing.
struct WatchBus {
    inner: SimulatedBus,
    violations: AtomicUsize,
}

impl RegisterBus for WatchBus {
    fn read32(&self, offset: usize) -> seq_registers::Result<u32> {
        self.inner.read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) -> seq_registers::Result<()> {
        let in_ram = (RAM0..RAM0 + ram::WINDOW_BYTES).contains(&offset);
        if in_ram && self.inner.peek(CTRL0) & control::RUNNING != 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.write32(offset, value)
    }
}

#[test]
fn test_ram_never_written_while_engine_runs() {
    let bus = Arc::new(WatchBus {
        inner: SimulatedBus::new(),
        violations: AtomicUsize::new(0),
    });
    bus.inner.add_sequencer(CTRL0);
    let manager = SequenceManager::new(
        "evg",
        Box::new(EvgFamily::new(Arc::<WatchBus>::clone(&bus), CLOCK)),
        Arc::<WatchBus>::clone(&bus),
        &EVG_TRAITS.default_layout(1),
    )
    .unwrap();
    let seq = manager.create_sequence("seq0").unwrap();
    seq.set_run_mode(RunMode::Normal as u32).unwrap();
    seq.commit().unwrap();
    seq.load().unwrap();
    seq.enable().unwrap();

    let handle = manager.interrupt_handle();
    let done = Arc::new(AtomicBool::new(false));
    let card = {
        let bus = Arc::clone(&bus);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                if bus.inner.trigger(CTRL0) {
                    handle.dispatch(irq::start_of_sequence(0));
                    std::thread::yield_now();
                    bus.inner.complete(CTRL0);
                    handle.dispatch(irq::end_of_sequence(0));
                } else {
                    std::thread::yield_now();
                }
            }
        })
    };

    for i in 1..300u64 {
        let times: Vec<u64> = (1..=i % 16 + 1).map(|t| t * i).collect();
        let codes = vec![0x10; times.len()];
        set_table(&seq, &times, &codes);
        seq.commit().unwrap();
    }
    done.store(true, Ordering::Release);
    card.join().unwrap();

    assert_eq!(bus.violations.load(Ordering::SeqCst), 0);
    assert!(!seq.needs_attention());
    assert!(seq.is_in_sync());
    let committed = seq.committed();
    let expected: Vec<(u32, u32)> = committed
        .times
        .iter()
        .zip(&committed.codes)
        .map(|(t, c)| (*t as u32, *c as u32))
        .collect();
    assert_eq!(bus.inner.ram(RAM0, expected.len()), expected);
}

fn increasing_times(deltas: &[u64]) -> Vec<u64> {
    deltas
        .iter()
        .scan(0, |t, d| {
            *t += d;
            Some(*t)
        })
        .collect()
}

proptest! {
    #[test]
    fn test_commit_produces_hardware_ready_tables(
        deltas in prop::collection::vec(1u64..1000, 0..2100),
        codes in prop::collection::vec(any::<u8>(), 0..2100),
    ) {
        let card = evg_card(1);
        let seq = card.manager.create_sequence("seq0").unwrap();
        let times = increasing_times(&deltas);
        set_table(&seq, &times, &codes);

        let len = times.len().min(codes.len());
        let packed_len = if len > 0 && codes[len - 1] == 0x7f { len } else { len + 1 };
        match seq.commit() {
            Ok(()) => {
                let committed = seq.committed();
                prop_assert!(committed.times.windows(2).all(|w| w[0] < w[1]));
                prop_assert_eq!(committed.codes.last(), Some(&0x7f));
                prop_assert_eq!(committed.times.len(), packed_len);
                prop_assert_eq!(committed.codes.len(), packed_len);
                prop_assert!(packed_len <= 2048);
                prop_assert_eq!(&committed.times[..len], &times[..len]);
                prop_assert_eq!(&committed.codes[..len], &codes[..len]);
            }
            Err(err) => {
                prop_assert!(packed_len > 2048);
                prop_assert!(!seq.is_committed());
                prop_assert_eq!(seq.error_text(), err.to_string());
            }
        }
    }

    #[test]
    fn test_commit_keeps_terminated_tables(
        entries in prop::collection::vec((1u64..1000, 0u8..0x7f), 0..2047),
    ) {
        let card = evg_card(1);
        let seq = card.manager.create_sequence("seq0").unwrap();
        let (deltas, mut codes): (Vec<u64>, Vec<u8>) = entries.into_iter().unzip();
        let mut times = increasing_times(&deltas);
        times.push(times.last().map_or(5, |t| t + 5));
        codes.push(0x7f);
        set_table(&seq, &times, &codes);
        seq.commit().unwrap();
        prop_assert_eq!(seq.timestamps(), times);
        prop_assert_eq!(seq.event_codes(), codes);
    }
}
