use super::*;
use crate::engine::backend::{ManualClock, RenderRecord};

const EPS: f64 = 1e-9;

fn scheduler() -> Scheduler {
    Scheduler::new(&MetronomeConfig::default())
}

#[test]
fn test_stopped_scheduler_emits_nothing() {
    let clock = ManualClock::new();
    let mut sched = scheduler();
    assert!(sched.poll(0.0, &clock).is_empty());
    assert!(clock.records().is_empty());
}

#[test]
fn test_first_pass_schedules_beat_one_at_start_time() {
    let clock = ManualClock::starting_at(5.0);
    let mut sched = scheduler();
    sched.start_at(5.0);

    let ticks = sched.poll(5.0, &clock);
    assert_eq!(ticks.len(), 1, "At 90 bpm only one beat fits in 100ms");
    assert_eq!(ticks[0].pulse, 1);
    assert!(ticks[0].is_accented);
    assert_eq!(ticks[0].time, 5.0);
    assert!((sched.transport().next_tick_time() - (5.0 + 60.0 / 90.0)).abs() < EPS);
}

#[test]
fn test_interval_law_at_fixed_bpm() {
    let clock = ManualClock::new();
    let mut sched = scheduler();
    sched.tempo_mut().set_bpm(120.0);
    sched.start_at(0.0);

    let mut ticks = Vec::new();
    let mut now = 0.0;
    while now < 4.0 {
        ticks.extend(sched.poll(now, &clock));
        now += 0.025;
    }

    assert!(ticks.len() >= 8);
    for pair in ticks.windows(2) {
        assert!(
            (pair[1].time - pair[0].time - 0.5).abs() < EPS,
            "Consecutive ticks should be 0.5s apart: {:?}",
            pair
        );
    }
}

#[test]
fn test_pulse_cycles_and_accents_follow_mask() {
    let clock = ManualClock::new();
    let mut sched = scheduler();
    sched.tempo_mut().set_meter(3, Some(&[true, false, true]));
    sched.start_at(0.0);

    // A window of 10 seconds at 90 bpm holds 15 beats.
    let ticks = sched.poll(9.95, &clock);
    let pulses: Vec<u32> = ticks.iter().map(|t| t.pulse).collect();
    assert_eq!(pulses[..7], [1, 2, 3, 1, 2, 3, 1]);
    let accents: Vec<bool> = ticks.iter().take(3).map(|t| t.is_accented).collect();
    assert_eq!(accents, vec![true, false, true]);
}

#[test]
fn test_multiple_due_ticks_are_emitted_separately() {
    let clock = ManualClock::new();
    let mut config = MetronomeConfig::default();
    config.scheduling.schedule_ahead_time = 0.5;
    let mut sched = Scheduler::new(&config);
    sched.tempo_mut().set_bpm(300.0);
    sched.start_at(0.0);

    let ticks = sched.poll(0.0, &clock);
    assert_eq!(ticks.len(), 3, "0.0, 0.2 and 0.4 all fall inside 0.5s");
    assert!(ticks.windows(2).all(|w| w[1].time > w[0].time));

    let freqs = clock.scheduled_frequencies();
    assert_eq!(freqs.len(), 3, "Each tick is submitted on its own");
    assert!((freqs[1].0 - 0.2).abs() < EPS);
    assert!((freqs[2].0 - 0.4).abs() < EPS);
}

#[test]
fn test_starved_loop_never_skips_a_beat() {
    let clock = ManualClock::new();
    let mut sched = scheduler();
    sched.tempo_mut().set_bpm(60.0);
    sched.start_at(0.0);
    sched.poll(0.0, &clock);

    // The poll loop stalls for five seconds.
    let ticks = sched.poll(5.0, &clock);
    let times: Vec<f64> = ticks.iter().map(|t| t.time).collect();
    assert_eq!(times, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn test_bpm_change_applies_to_following_interval() {
    let clock = ManualClock::new();
    let mut sched = scheduler();
    sched.tempo_mut().set_bpm(60.0);
    sched.start_at(0.0);
    sched.poll(0.0, &clock);
    assert!((sched.transport().next_tick_time() - 1.0).abs() < EPS);

    // Already-computed due time is untouched by the edit.
    sched.tempo_mut().set_bpm(120.0);
    assert!((sched.transport().next_tick_time() - 1.0).abs() < EPS);

    let ticks = sched.poll(0.95, &clock);
    assert_eq!(ticks.len(), 1);
    assert!((ticks[0].time - 1.0).abs() < EPS);
    assert!((sched.transport().next_tick_time() - 1.5).abs() < EPS);
}

#[test]
fn test_frequencies_follow_accents() {
    let clock = ManualClock::new();
    let mut sched = scheduler();
    sched.tempo_mut().set_bpm(60.0);
    sched.start_at(0.0);
    sched.poll(1.95, &clock);

    let freqs: Vec<f64> = clock.scheduled_frequencies().iter().map(|f| f.1).collect();
    assert_eq!(freqs, vec![1000.0, 800.0, 800.0]);
}

#[test]
fn test_short_accent_mask_degrades_to_unaccented() {
    let clock = ManualClock::new();
    let mut sched = scheduler();
    sched.tempo_mut().set_meter(7, None);
    sched.start_at(0.0);
    sched.poll(60.0 / 90.0 * 4.5, &clock);
    assert_eq!(sched.transport().pulse(), 5);

    // Meter shrinks while a later beat is current: next advance wraps.
    sched.tempo_mut().set_meter(2, None);
    let ticks = sched.poll(60.0 / 90.0 * 5.5, &clock);
    assert_eq!(ticks[0].pulse, 1);
    assert!(ticks[0].is_accented);
}

#[test]
fn test_pause_resume_keeps_phase() {
    let clock = ManualClock::new();
    let mut sched = scheduler();
    sched.tempo_mut().set_bpm(60.0);
    sched.start_at(0.0);
    sched.poll(0.0, &clock);

    // Stop at T = 0.3 with the next beat due at 1.0: d = 0.7.
    assert!(sched.stop_at(0.3, &clock));
    assert_eq!(sched.transport().pulse(), 0);
    assert!((sched.transport().time_offset() - 0.7).abs() < EPS);

    // Resume at T' = 10.0: the next beat is due at T' + d.
    sched.start_at(10.0);
    let ticks = sched.poll(10.0, &clock);
    assert!(ticks.is_empty());
    assert!((sched.transport().next_tick_time() - 10.7).abs() < EPS);

    let ticks = sched.poll(10.65, &clock);
    assert_eq!(ticks.len(), 1);
    assert!((ticks[0].time - 10.7).abs() < EPS);
    assert_eq!(ticks[0].pulse, 1);
}

#[test]
fn test_voice_is_created_lazily_and_released_on_stop() {
    let clock = ManualClock::new();
    let mut sched = scheduler();
    sched.start_at(0.0);
    assert!(!sched.has_voice());
    assert!(clock.records().is_empty());

    sched.poll(2.0, &clock);
    assert!(sched.has_voice());
    assert_eq!(clock.live_handle_count(), 2, "One tone + one envelope");

    sched.stop_at(2.0, &clock);
    assert!(!sched.has_voice());
    assert_eq!(clock.live_handle_count(), 0);

    sched.start_at(3.0);
    sched.poll(3.7, &clock);
    assert_eq!(clock.live_handle_count(), 2, "At most one pair is live");

    let created = clock
        .records()
        .iter()
        .filter(|r| matches!(r, RenderRecord::ToneCreated(_)))
        .count();
    assert_eq!(created, 2, "A fresh tone source per play cycle");
}

#[test]
fn test_closed_clock_does_not_fault_tick_path() {
    let clock = ManualClock::new();
    clock.close();
    let mut sched = scheduler();
    sched.start_at(0.0);

    let ticks = sched.poll(1.0, &clock);
    assert_eq!(ticks.len(), 2, "Ticks still advance without a render voice");
    assert!(!sched.has_voice());
}

#[test]
fn test_rearm_delay_formula() {
    // On time: the full lookahead.
    let delay = rearm_delay(25.0, 0.0, 1.0, 1.0);
    assert!((delay.as_secs_f64() - 0.025).abs() < 1e-9);
    // Late by 10ms: re-check sooner.
    let delay = rearm_delay(25.0, 0.0, 1.010, 1.0);
    assert!((delay.as_secs_f64() - 0.015).abs() < 1e-9);
    // Late beyond the lookahead: clamped.
    assert_eq!(rearm_delay(25.0, 0.0, 2.0, 1.0), Duration::ZERO);
    let floored = rearm_delay(25.0, 4.0, 2.0, 1.0);
    assert!((floored.as_secs_f64() - 0.004).abs() < 1e-9);
    // Ticks queued ahead of now push the next poll out.
    let early = rearm_delay(25.0, 4.0, 1.0, 1.05);
    assert!((early.as_secs_f64() - 0.075).abs() < 1e-9);
}

#[test]
fn test_snapshot_reflects_state() {
    let clock = ManualClock::new();
    let mut sched = scheduler();
    sched.start_at(0.0);
    sched.poll(0.0, &clock);

    let state = sched.snapshot();
    assert!(state.is_playing);
    assert_eq!(state.pulse, 1);
    assert_eq!(state.bpm, 90.0);
    assert_eq!(state.meter, 4);
    assert_eq!(state.accents, vec![true, false, false, false]);
}
