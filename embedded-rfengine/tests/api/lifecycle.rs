use anyhow::Result;

use embedded_rfengine::engine::Engine;
use embedded_rfengine::feedback::TimeSource;
use embedded_rfengine::rng::SeedPolicy;
use embedded_rfengine::store::DirStore;
use embedded_rfengine::MAX_INFER_LOG_BYTES;

use crate::helpers::{open_tiny, temp_store, tiny_model};

/// Hand-cranked clock so the late-answer windows are test-controlled.
struct TickClock(std::cell::Cell<u64>);

impl TickClock {
    fn new() -> Self {
        TickClock(std::cell::Cell::new(1))
    }
    fn advance(&self, ms: u64) {
        self.0.set(self.0.get() + ms);
    }
}

impl TimeSource for &TickClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }
}

fn trained_engine<'c>(
    dir: &tempfile::TempDir,
    model: &str,
    clock: &'c TickClock,
) -> Result<Engine<DirStore, &'c TickClock>> {
    let mut store = DirStore::new(dir.path());
    tiny_model(&mut store, model)?;
    // Train with an owned-clock engine first, then reopen with the tick
    // clock for the feedback phase.
    let mut engine = open_tiny(store, model, 42)?;
    engine.train()?;
    drop(engine);
    let store = DirStore::new(dir.path());
    let engine =
        Engine::open_with_clock(store, clock, model, SeedPolicy::Deterministic(42))?;
    Ok(engine)
}

#[test]
fn feedback_extends_the_base_dataset() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let clock = TickClock::new();
    let mut engine = trained_engine(&dir, "fb", &clock)?;
    engine.config_mut().extend_base_data = true;

    let before = std::fs::metadata(dir.path().join("fb_nml.bin"))?.len();
    assert_eq!(engine.predict(&[3.0; 4])?, Some("one".to_string()));
    clock.advance(100);
    engine.record_actual("one")?;
    engine.flush_pending()?;

    let after = std::fs::metadata(dir.path().join("fb_nml.bin"))?.len();
    assert_eq!(after, before + 2, "one 2-byte record appended");
    assert_eq!(engine.config().num_samples, 11);
    let total: u32 = engine.config().samples_per_label.iter().sum();
    assert_eq!(total, 11);

    let (count, agreement) = engine.infer_log_summary()?;
    assert_eq!(count, 1);
    assert!((agreement - 1.0).abs() < 1e-6);
    Ok(())
}

#[test]
fn feedback_ring_overwrite_keeps_file_size() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let clock = TickClock::new();
    let mut engine = trained_engine(&dir, "ring", &clock)?;
    engine.config_mut().extend_base_data = false;

    let before = std::fs::metadata(dir.path().join("ring_nml.bin"))?.len();
    for _ in 0..3 {
        engine.predict(&[3.0; 4])?;
        clock.advance(10);
        engine.record_actual("one")?;
    }
    engine.flush_pending()?;

    assert_eq!(
        std::fs::metadata(dir.path().join("ring_nml.bin"))?.len(),
        before
    );
    assert_eq!(engine.config().num_samples, 10);
    let total: u32 = engine.config().samples_per_label.iter().sum();
    assert_eq!(total, 10, "displaced labels must be decremented");
    Ok(())
}

#[test]
fn late_answers_are_marked_unanswerable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let clock = TickClock::new();
    let mut engine = trained_engine(&dir, "late", &clock)?;

    for _ in 0..4 {
        engine.predict(&[0.0; 4])?;
    }
    clock.advance(10);
    engine.record_actual("zero")?;
    // Two full 30-second windows elapse; two predictions become
    // unanswerable before the next answer lands.
    clock.advance(61_000);
    engine.record_actual("zero")?;
    engine.flush_pending()?;

    // Only the two answered predictions reach the log.
    let (count, _) = engine.infer_log_summary()?;
    assert_eq!(count, 2);
    Ok(())
}

#[test]
fn unknown_feedback_label_is_ignored_at_flush() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let clock = TickClock::new();
    let mut engine = trained_engine(&dir, "unk", &clock)?;

    engine.predict(&[0.0; 4])?;
    clock.advance(10);
    engine.record_actual("not-a-label")?;
    engine.flush_pending()?;
    assert_eq!(engine.config().num_samples, 10, "nothing flushed to data");
    Ok(())
}

#[test]
fn inference_log_stays_under_its_cap() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let clock = TickClock::new();
    let mut engine = trained_engine(&dir, "cap", &clock)?;
    engine.config_mut().extend_base_data = false;

    for round in 0..80 {
        for _ in 0..15 {
            engine.predict(&[3.0; 4])?;
            clock.advance(5);
            engine.record_actual("one")?;
        }
        engine.flush_pending()?;
        let size = std::fs::metadata(dir.path().join("cap_infer_log.bin"))?.len();
        assert!(
            size <= MAX_INFER_LOG_BYTES as u64,
            "log overflowed to {size} bytes in round {round}"
        );
        let (count, _) = engine.infer_log_summary()?;
        assert_eq!(size, 8 + count as u64 * 2, "count must match stored pairs");
    }
    Ok(())
}

#[test]
fn buffer_overflow_triggers_auto_flush() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let clock = TickClock::new();
    let mut engine = trained_engine(&dir, "auto", &clock)?;

    // Default capacity is 16; the 16th prediction flushes everything,
    // answered or not.
    for i in 0..16 {
        engine.predict(&[0.0; 4])?;
        clock.advance(5);
        if i < 8 {
            engine.record_actual("zero")?;
        }
    }
    let (count, _) = engine.infer_log_summary()?;
    assert_eq!(count, 8, "answered predictions were flushed automatically");
    assert_eq!(engine.config().num_samples, 18);
    Ok(())
}

#[test]
fn predict_without_categorizer_is_not_ready() {
    let (_dir, store) = temp_store();
    let mut engine =
        Engine::open(store, "empty", SeedPolicy::Deterministic(1)).expect("lazy open");
    assert!(matches!(
        engine.predict(&[0.0; 4]),
        Err(embedded_rfengine::Error::NotReady)
    ));
}

#[test]
fn abstention_is_recorded_but_not_learned() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let clock = TickClock::new();
    let mut engine = trained_engine(&dir, "abst", &clock)?;

    // A mixed vector the clean stumps disagree on can abstain; force one by
    // raising the threshold beyond unanimity.
    engine.config_mut().unity_threshold = 1.01;
    assert_eq!(engine.predict(&[0.0; 4])?, None);
    clock.advance(10);
    engine.record_actual("zero")?;
    engine.flush_pending()?;
    // The answered abstention still lands in the log as (255, actual).
    let (count, agreement) = engine.infer_log_summary()?;
    assert_eq!(count, 1);
    assert_eq!(agreement, 0.0);
    // And the sample itself still extends the dataset with its true label.
    assert_eq!(engine.config().num_samples, 11);
    Ok(())
}
