//! Motion engine for the Analytical Engine reconstruction.
//!
//! Translates the symbolic command language (rotations of figure-wheel
//! fingers, lifts of locks and connectors, carry-mechanism moves, named
//! scripts) into exactly counted microsteps, spread evenly across a
//! configurable time unit and delivered to up to 96 stepper controllers
//! on six daisy-chained boards behind a shared 4-to-16 multiplexer.
//!
//! Everything reaches the board through the [`Hardware`] trait, so the
//! whole engine runs under test against a simulated clock and pin
//! recorder.

use serde::{Deserialize, Serialize};

// --- LOGGING ---
macro_rules! console_log {
    ($($t:tt)*) => (println!($($t)*))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// One latch event on the shared bus: the second board-select line of
    /// a pair went low, clocking either a STEP or an enable write into
    /// the controller selected by the mux.
    #[derive(Clone, Copy, Debug)]
    struct RawPulse {
        grp2: Pin,
        grp3: Pin,
        mux: usize,
        step_mode: bool,    // StepNotEnb at latch time
        enable_level: bool, // MotorEnb at latch time (only meaningful for enable writes)
        clockwise: bool,    // MotorDir at latch time
        at: u64,
    }

    /// Simulated controller board: pins are plain state, the clock only
    /// advances on delay_us, and every latch pulse is recorded.
    struct SimBoard {
        pins: [bool; PIN_COUNT],
        now: u64,
        keys: VecDeque<u8>,
        empty_polls: u64,
        switch_reads: u32,
        switch_on_after: Option<u32>, // index switch reads low after this many reads
        pulses: Vec<RawPulse>,
    }

    impl SimBoard {
        fn new() -> Self {
            let mut pins = [true; PIN_COUNT];
            pins[Pin::FanOn as usize] = false;
            SimBoard {
                pins,
                now: 0,
                keys: VecDeque::new(),
                empty_polls: 0,
                switch_reads: 0,
                switch_on_after: None,
                pulses: Vec::new(),
            }
        }

        fn mux(&self) -> usize {
            (self.pins[Pin::MuxA as usize] as usize)
                | (self.pins[Pin::MuxB as usize] as usize) << 1
                | (self.pins[Pin::MuxC as usize] as usize) << 2
                | (self.pins[Pin::MuxD as usize] as usize) << 3
        }
    }

    const SELECT_PINS: [Pin; 5] =
        [Pin::BdSel2A, Pin::BdSel2B, Pin::BdSel3A, Pin::BdSel3B, Pin::BdSel3C];

    impl Hardware for SimBoard {
        fn set_pin(&mut self, pin: Pin, high: bool) {
            if !high && SELECT_PINS.contains(&pin) && self.pins[pin as usize] {
                let low: Vec<Pin> = SELECT_PINS
                    .iter()
                    .copied()
                    .filter(|&p| !self.pins[p as usize])
                    .collect();
                if low.len() == 1 {
                    // second line of the pair: the latch clocks now
                    self.pulses.push(RawPulse {
                        grp2: low[0],
                        grp3: pin,
                        mux: self.mux(),
                        step_mode: self.pins[Pin::StepNotEnb as usize],
                        enable_level: self.pins[Pin::MotorEnb as usize],
                        clockwise: self.pins[Pin::MotorDir as usize],
                        at: self.now,
                    });
                }
            }
            self.pins[pin as usize] = high;
        }

        fn read_pin(&mut self, pin: Pin) -> bool {
            if pin == Pin::SwitchInput {
                self.switch_reads += 1;
                return match self.switch_on_after {
                    Some(n) => self.switch_reads <= n, // low (pressed) once past n reads
                    None => true,
                };
            }
            self.pins[pin as usize]
        }

        fn delay_us(&mut self, usec: u64) {
            self.now += usec;
        }

        fn micros(&mut self) -> u64 {
            self.now
        }

        fn poll_key(&mut self) -> Option<u8> {
            match self.keys.pop_front() {
                Some(k) => {
                    self.empty_polls = 0;
                    Some(k)
                }
                None => {
                    self.empty_polls += 1;
                    assert!(self.empty_polls < 1_000_000, "test deadlocked waiting for a key");
                    None
                }
            }
        }

        fn flush_input(&mut self) {}
    }

    fn make_test_engine() -> Engine<SimBoard, MemoryStore> {
        Engine::new(SimBoard::new(), MemoryStore::default())
    }

    fn motor<'a>(engine: &'a Engine<SimBoard, MemoryStore>, num: usize) -> &'a Motor {
        engine.motors[num].as_ref().unwrap()
    }

    /// The step pulses a given motor received, in order.
    fn steps_for(engine: &Engine<SimBoard, MemoryStore>, num: usize) -> Vec<RawPulse> {
        let m = motor(engine, num);
        let (grp2, grp3) = BOARD_SELECTS[m.board_number - 1];
        engine
            .hw
            .pulses
            .iter()
            .filter(|p| p.step_mode && p.grp2 == grp2 && p.grp3 == grp3 && p.mux == m.board_position - 1)
            .copied()
            .collect()
    }

    // ── Queuer arithmetic ────────────────────────────────────────────────

    #[test]
    fn rot_a2r_36_computes_exact_microsteps_and_deficit() {
        // 36 deg on 114:11 gearing at 800 usteps/rev:
        // numer 36*114*800 = 3,283,200 over denom 360*11 = 3960,
        // so 829 whole microsteps with 360/3960 carried forward
        let mut engine = make_test_engine();
        engine.handle_line("rot a2r 36; state");
        let a2r = motor(&engine, A2_R);
        assert_eq!(steps_for(&engine, A2_R).len(), 829);
        assert_eq!(a2r.deficit, 360);
        assert!(steps_for(&engine, A2_R).iter().all(|p| p.clockwise));
    }

    #[test]
    fn rotation_counter_rotates_the_compensating_lifter_on_the_same_slice() {
        let mut engine = make_test_engine();
        engine.queue_movement(A2_R, MotorKind::Rotate, 36, 25, 80);
        let a2l = motor(&engine, A2_L);
        assert!(a2l.move_queued, "the paired lifter must be queued");
        assert!(!a2l.clockwise, "the lifter counter-rotates");
        assert_eq!((a2l.start_pct, a2l.end_pct), (25, 80));
        // rotating a lifter scales both sides by 18:
        // 36*57*800*18 / (360*11*18) = 414 with 38,880 left over
        assert_eq!(a2l.usteps_needed, 414);
        assert_eq!(a2l.deficit, 38_880);
        assert_eq!(motor(&engine, A2_R).usteps_needed, 829);
    }

    #[test]
    fn lift_p22_254_accumulates_scaled_deficit() {
        // 254 mils on 1:1 gearing: numer 254*254*5 = 322,580 over 500
        let mut engine = make_test_engine();
        engine.handle_line("lift p22 254");
        let p22 = motor(&engine, P22_L);
        assert_eq!(steps_for(&engine, P22_L).len(), 645);
        assert_eq!(p22.deficit, 80);
    }

    #[test]
    fn full_step_policy_masks_instead_of_accumulating() {
        let mut engine = make_test_engine();
        engine.handle_line("lift rk 100");
        let rk = motor(&engine, RK_L);
        // 100*254*5/500 = 254, masked down to a multiple of 4
        assert_eq!(steps_for(&engine, RK_L).len(), 252);
        assert_eq!(rk.deficit, 0);
        assert_eq!(rk.microstep_offset, 0);
        assert_eq!(rk.state, MotorState::Off, "full-step motors power off after moving");
    }

    #[test]
    fn ten_giveoffs_deliver_8290_microsteps() {
        let mut engine = make_test_engine();
        for _ in 0..10 {
            engine.handle_line("giveoff A2");
        }
        assert_eq!(steps_for(&engine, A2_R).len(), 8290);
        assert_eq!(motor(&engine, A2_R).deficit, 3600); // 10*360, never crossing 3960
    }

    #[test]
    fn giveoff_then_reverse_nets_zero_microsteps() {
        let mut engine = make_test_engine();
        engine.handle_line("giveoff A2");
        engine.handle_line("giveoff A2 reverse");
        let steps = steps_for(&engine, A2_R);
        let cw = steps.iter().filter(|p| p.clockwise).count();
        let ccw = steps.iter().filter(|p| !p.clockwise).count();
        assert_eq!(cw, ccw);
        assert_eq!(motor(&engine, A2_R).deficit, 0);
        assert_eq!(motor(&engine, A2_L).deficit, 0);
    }

    #[test]
    fn repeated_moves_carry_the_deficit_into_a_whole_microstep() {
        // giveoff S1: 36*1425*800 / (360*88) = 1295 with 14,400/31,680 over;
        // the third repetition crosses a whole microstep
        let mut engine = make_test_engine();
        engine.handle_line("repeat 3 giveoff S1");
        assert_eq!(steps_for(&engine, S1_R).len(), 1295 + 1295 + 1296);
        assert_eq!(motor(&engine, S1_R).deficit, 11_520);
        assert_eq!(engine.cyclenum, 3);
    }

    #[test]
    fn zero_rotation_is_a_noop() {
        let mut engine = make_test_engine();
        engine.handle_line("rot a2r 0");
        assert_eq!(engine.motors_queued, 0);
        assert!(!engine.got_error);
        assert!(steps_for(&engine, A2_R).is_empty());
    }

    // ── Dispatcher timing ────────────────────────────────────────────────

    #[test]
    fn min_period_floor_stretches_the_time_unit() {
        // 829 microsteps at >= 175 usec each cannot fit in 100 msec
        let mut engine = make_test_engine();
        engine.handle_line("timeunit 100; giveoff A2");
        let steps = steps_for(&engine, A2_R);
        assert_eq!(steps.len(), 829);
        for pair in steps.windows(2) {
            assert!(pair[1].at - pair[0].at > MIN_USTEP_PERIOD_USEC);
        }
        let span = steps.last().unwrap().at - steps.first().unwrap().at;
        assert!(span > 100_000, "the unit must stretch past 100 msec, got {} usec", span);
    }

    #[test]
    fn even_spread_respects_the_programmed_delta() {
        // 160 usteps across 500 msec: delta 3125 usec, floor not binding
        let mut engine = make_test_engine();
        engine.handle_line("rot f2r 36");
        let steps = steps_for(&engine, F2_R);
        assert_eq!(steps.len(), 160);
        for pair in steps.windows(2) {
            assert!(pair[1].at - pair[0].at >= 3125);
        }
    }

    #[test]
    fn spilled_move_splits_exactly_across_two_units() {
        let mut engine = make_test_engine();
        engine.handle_line("mesh S1 top finger time 0 199");
        // 525 mils -> 1333 microsteps; 100/200ths land in the first unit
        assert_eq!(steps_for(&engine, S1_L).len(), 666);
        assert!(motor(&engine, S1_L).move_queued, "the spill stays queued for the next unit");
        engine.do_movements(engine.timeunit_usec);
        assert_eq!(steps_for(&engine, S1_L).len(), 666 + 667);
        assert!(!motor(&engine, S1_L).move_queued);
        assert_eq!(engine.motors_queued, 0);
    }

    #[test]
    fn time_0_99_is_the_default_slice() {
        let mut engine = make_test_engine();
        engine.queue_movement(S1_L, MotorKind::Lift, -525, 0, 99);
        let queued = motor(&engine, S1_L);
        assert_eq!((queued.start_pct, queued.end_pct), (0, 99));
        engine.do_movements(engine.timeunit_usec);
        assert_eq!(steps_for(&engine, S1_L).len(), 1333);
        assert_eq!(engine.motors_queued, 0);
    }

    #[test]
    fn one_line_queues_three_functional_moves_into_one_unit() {
        let mut engine = make_test_engine();
        engine.handle_line("mesh S1 top finger; mesh RR top rack; unlock MP2;");
        assert!(!engine.got_error);
        assert_eq!(engine.cyclenum, 1, "all three moves share one time unit");
        assert!(!steps_for(&engine, S1_L).is_empty());
        assert!(!steps_for(&engine, RR_L).is_empty());
        assert!(!steps_for(&engine, MP2K_R).is_empty());
    }

    // ── Power safety ─────────────────────────────────────────────────────

    #[test]
    fn motor_off_the_full_step_grid_stays_energised() {
        let mut engine = make_test_engine();
        engine.handle_line("giveoff A2");
        let a2r = motor(&engine, A2_R);
        assert_eq!(a2r.microstep_offset, 829 % USTEPS_PER_STEP);
        assert_eq!(a2r.state, MotorState::On, "829 usteps ends off the grid; must stay on");
        engine.power_motor(A2_R, MotorState::Off, false);
        assert_eq!(motor(&engine, A2_R).state, MotorState::On, "unforced off is denied");
        engine.power_motor(A2_R, MotorState::Off, true);
        assert_eq!(motor(&engine, A2_R).state, MotorState::Off, "forced off is honored");
    }

    #[test]
    fn powering_on_rehomes_the_microstep_offset() {
        let mut engine = make_test_engine();
        engine.handle_line("giveoff A2");
        engine.power_motor(A2_R, MotorState::Off, true);
        engine.power_motor(A2_R, MotorState::On, false);
        assert_eq!(motor(&engine, A2_R).microstep_offset, 0);
    }

    #[test]
    fn boot_neutralises_every_controller_cell_once() {
        let mut engine = make_test_engine();
        engine.boot();
        let disables: Vec<(Pin, Pin, usize)> = engine
            .hw
            .pulses
            .iter()
            .filter(|p| !p.step_mode && p.enable_level == MOTOR_OFF)
            .map(|p| (p.grp2, p.grp3, p.mux))
            .collect();
        assert_eq!(disables.len(), NUM_BOARDS * POSITIONS_PER_BOARD);
        let mut distinct = disables.clone();
        distinct.sort_by_key(|&(g2, g3, mux)| (g2 as usize, g3 as usize, mux));
        distinct.dedup();
        assert_eq!(distinct.len(), NUM_BOARDS * POSITIONS_PER_BOARD);
    }

    // ── Parser and history ───────────────────────────────────────────────

    #[test]
    fn unknown_keyword_reports_and_clears_the_queue() {
        let mut engine = make_test_engine();
        engine.handle_line("giveoff A2; frobnicate");
        assert!(engine.got_error);
        assert_eq!(engine.motors_queued, 0);
    }

    #[test]
    fn out_of_range_integer_is_rejected() {
        let mut engine = make_test_engine();
        engine.handle_line("rot a2r 5000");
        assert!(engine.got_error);
        engine.handle_line("timeunit 5");
        assert!(engine.got_error);
        assert_eq!(engine.timeunit_usec, DEFAULT_TIMEUNIT_MSEC * 1000);
    }

    #[test]
    fn keyword_blanks_match_runs_of_blanks_case_insensitively() {
        let mut engine = make_test_engine();
        engine.handle_line("MESH s1   TOP    finger");
        assert!(!engine.got_error);
        assert!(!steps_for(&engine, S1_L).is_empty());
    }

    #[test]
    fn history_keeps_prev_and_prev_prev() {
        let mut engine = make_test_engine();
        engine.handle_line("giveoff A2");
        assert_eq!(engine.prev_command(), "giveoff A2");
        engine.handle_line("giveoff RR");
        assert_eq!(engine.prev_command(), "giveoff RR");
        assert_eq!(engine.prev_prev_command(), "giveoff A2");
        // commands that queue nothing leave the slots alone
        engine.handle_line("debug 0");
        assert_eq!(engine.prev_command(), "giveoff RR");
        // empty input repeats prev without reshuffling
        let before = steps_for(&engine, RR_R).len();
        engine.handle_line("");
        assert!(steps_for(&engine, RR_R).len() > before);
        assert_eq!(engine.prev_command(), "giveoff RR");
        // a lone backspace recalls prev-prev, swapping the slots
        engine.handle_line("\u{8}");
        assert_eq!(engine.prev_command(), "giveoff A2");
        assert_eq!(engine.prev_prev_command(), "giveoff RR");
    }

    #[test]
    fn timeunit_commands_set_and_report() {
        let mut engine = make_test_engine();
        engine.handle_line("timeunit 100");
        assert_eq!(engine.timeunit_usec, 100_000);
        engine.handle_line("tu");
        assert_eq!(engine.timeunit_usec, 157_000);
        engine.handle_line("debug 3");
        assert_eq!(engine.debug, 3);
    }

    #[test]
    fn already_queued_motor_drops_the_second_move() {
        let mut engine = make_test_engine();
        engine.queue_movement(S1_L, MotorKind::Lift, 100, 0, 99);
        engine.queue_movement(S1_L, MotorKind::Lift, 200, 0, 99);
        assert_eq!(engine.motors_queued, 1);
        assert_eq!(motor(&engine, S1_L).usteps_needed, 254); // the first one
    }

    #[test]
    fn unknown_script_token_is_rejected() {
        let mut engine = make_test_engine();
        engine.execute_commands("weaklock F2", 1);
        assert!(engine.got_error);
    }

    // ── Scripts ──────────────────────────────────────────────────────────

    #[test]
    fn script_advances_one_line_per_time_unit() {
        let mut engine = make_test_engine();
        engine.handle_line("restore");
        assert!(!engine.got_error);
        assert_eq!(engine.cyclenum, RESTORE_SCRIPT.len() as i32);
        // nine forward giveoffs land on the rack restorer plus the final one
        assert!(!steps_for(&engine, RR_R).is_empty());
    }

    #[test]
    fn parallel_scripts_advance_in_lockstep() {
        let mut engine = make_test_engine();
        engine.handle_line("restore; a2tb");
        assert!(!engine.got_error);
        // the longer script sets the cycle count; the shorter one shares
        // its early units
        assert_eq!(engine.cyclenum, A2TB_SCRIPT.len() as i32);
        assert!(!steps_for(&engine, RR_R).is_empty());
        assert!(!steps_for(&engine, A2_R).is_empty());
    }

    #[test]
    fn script_parameters_substitute_into_lines() {
        let parms = vec!["2".to_string(), "top".to_string(), String::new()];
        let (line, count) = substitute_parms("mesh S#1 #2 finger; giveoff S#1", &parms);
        assert_eq!(line, "mesh S2 top finger; giveoff S2");
        assert_eq!(count, 3);
        // placeholders past the stored actuals substitute as empty
        let (line, _) = substitute_parms("lock A#7", &parms);
        assert_eq!(line, "lock A");
    }

    #[test]
    fn fib_expands_to_nineteen_fibone_cycles() {
        let count = FIB_SCRIPT.iter().filter(|line| line.contains("run fibone")).count();
        assert_eq!(count, 19);
    }

    #[test]
    fn pause_drains_the_queue_before_waiting() {
        let mut engine = make_test_engine();
        engine.handle_line("giveoff S1; pause 50");
        assert_eq!(engine.motors_queued, 0);
        assert!(!steps_for(&engine, S1_R).is_empty());
    }

    // ── Aborts and zeroing ───────────────────────────────────────────────

    #[test]
    fn esc_aborts_the_dispatch_and_clears_the_queue() {
        let mut engine = make_test_engine();
        engine.hw.keys.push_back(ESC);
        engine.handle_line("giveoff A2");
        assert!(engine.got_error);
        assert_eq!(engine.motors_queued, 0);
        assert!(steps_for(&engine, A2_R).is_empty());
    }

    #[test]
    fn del_aborts_the_dispatch_and_runs_the_home_script() {
        let mut engine = make_test_engine();
        engine.hw.keys.push_back(DEL);
        engine.handle_line("giveoff A2");
        assert!(engine.got_error);
        assert_eq!(engine.motors_queued, 0);
        assert!(steps_for(&engine, A2_R).is_empty());
    }

    #[test]
    fn motor_fault_aborts_the_dispatch() {
        let mut engine = make_test_engine();
        engine.hw.pins[Pin::MotorFault as usize] = false; // fault asserted
        engine.handle_line("giveoff A2");
        assert!(engine.got_error);
        assert_eq!(engine.motors_queued, 0);
    }

    #[test]
    fn zeroing_refuses_an_axle_with_no_index_switch() {
        let mut engine = make_test_engine();
        engine.motors[A2_R].as_mut().unwrap().index_switch = None;
        engine.handle_line("do_zero A2");
        assert!(engine.got_error);
        assert!(!motor(&engine, A2_R).temp_on);
        assert!(!motor(&engine, A2_L).temp_on);
    }

    #[test]
    fn zeroing_clears_temp_on_on_every_exit_path() {
        // the switch reads open twice, then closed: the search succeeds,
        // then the missing calibration is reported
        let mut engine = make_test_engine();
        engine.hw.switch_on_after = Some(3);
        engine.handle_line("do_zero A2");
        assert!(engine.got_error, "uncalibrated axle must report");
        assert!(!motor(&engine, A2_R).temp_on);
        assert!(!motor(&engine, A2_L).temp_on);
    }

    #[test]
    fn switch_stuck_off_reports_after_a_bounded_search() {
        let mut engine = make_test_engine();
        engine.handle_line("do_zero A2"); // switch never closes
        assert!(engine.got_error);
        assert!(!motor(&engine, A2_R).temp_on);
        assert!(!motor(&engine, A2_L).temp_on);
    }

    // ── Calibration record ───────────────────────────────────────────────

    #[test]
    fn calibrate_persists_through_the_store() {
        let mut engine = make_test_engine();
        engine.handle_line("calibrate a2r 25");
        let saved = engine.store.saved.as_ref().expect("record must be saved");
        assert_eq!(saved.id, CONFIG_ID);
        assert_eq!(saved.finger_zero_degrees[A2_R].degrees, 25);
        assert!(!saved.finger_zero_degrees[A2_R].unused);
        assert_eq!(saved.finger_zero_degrees[S1_R].degrees, -1);
    }

    #[test]
    fn stale_calibration_record_is_discarded() {
        let mut store = MemoryStore::default();
        store.saved = Some(CalibrationConfig {
            id: "Wrong!!!".to_string(),
            finger_zero_degrees: vec![CalSlot { unused: true, degrees: -1 }; NUM_MOTORS],
        });
        let engine = Engine::new(SimBoard::new(), store);
        assert_eq!(engine.calibration.id, CONFIG_ID);
        assert!(engine.calibration.finger_zero_degrees.iter().all(|s| s.degrees == -1));
    }

    #[test]
    fn reset_clears_positions_and_queued_moves() {
        let mut engine = make_test_engine();
        engine.handle_line("mesh S1 top finger");
        assert_ne!(motor(&engine, S1_L).current_position, 0);
        engine.handle_line("reset");
        assert_eq!(motor(&engine, S1_L).current_position, 0);
        assert_eq!(engine.motors_queued, 0);
    }
}

// ── System constants ─────────────────────────────────────────────────────

pub const USTEPS_PER_STEP: i64 = 4; // drivers configured for 4 microsteps per full step
pub const STEPS_PER_ROTATION: i64 = 200; // 1.8 degree step angle, Nema 11 2-phase
pub const USTEPS_PER_ROTATION: i64 = USTEPS_PER_STEP * STEPS_PER_ROTATION;
pub const DIGIT_REPETITIONS: i64 = 1; // repetitions of 0-9 around each digit wheel
pub const DEGREES_PER_DIGIT: i64 = 360 / 10 / DIGIT_REPETITIONS;
pub const EXTRA_DEGREES_FOR_CARRY: i64 = 5; // backlash, and carry wheels are smaller

pub const MIN_USTEP_PERIOD_USEC: u64 = 175; // minimum time between microsteps for reliable operation
// 1000 RPM max * 800 usteps/rev * min/60 sec = 75 usec, but 100 usec doesn't work!
pub const MOVE_TICK_USEC: u64 = 50; // poll interval while movements are in progress
pub const DEFAULT_TIMEUNIT_MSEC: u64 = 500; // default time unit for moving one digit
pub const DEBOUNCE_MSEC: u64 = 25; // switch debounce time

pub const NUM_BOARDS: usize = 6;
pub const POSITIONS_PER_BOARD: usize = 16;

pub const MAX_SCRIPTS: usize = 5; // scripts that can run in parallel at one level
pub const MAX_PARMS: usize = 5; // #n parameters stored per script launch
pub const MAX_PARMSIZE: usize = 20; // size of each parameter replacement
pub const MAX_CMDLEN: usize = 200; // command string after parameter expansion
pub const MAX_SCRIPT_DEPTH: usize = 8; // nesting cap for recursive `run`

pub const ESC: u8 = 0x1b;
pub const DEL: u8 = 0x7f;
pub const BELL: u8 = 0x07;

pub const CONFIG_ID: &str = "Babbage1"; // 8-byte magic of the calibration record

// ── Hardware seam ────────────────────────────────────────────────────────

/// Abstract pin roles of the controller board. The mapping to physical
/// pin numbers is configuration of whatever implements [`Hardware`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum Pin {
    BdSel2A, // board select: one of 2A/2B low plus one of
    BdSel2B, //   3A/3B/3C low selects one of six identical
    BdSel3A, //   daisy-chained motor control boards
    BdSel3B,
    BdSel3C,
    MuxA, // 4-to-16 multiplexer controls addressing the motors
    MuxB, //   on the selected board, or one of the 16 switch inputs
    MuxC,
    MuxD,
    StepNotEnb, // whether the board-select pulse steps the selected motor
    MotorEnb,   //   or latches the power state given by MotorEnb
    MotorDir,   // direction control shared by all motors
    SwitchInput, // input: the switch selected by the mux controls
    MotorFault,  // active-low input: a motor fault was detected
    FanOn,       // cooling fans
}

pub const PIN_COUNT: usize = Pin::FanOn as usize + 1;

// enable latch is active low
pub const MOTOR_ON: bool = false;
pub const MOTOR_OFF: bool = true;

/// Everything the engine needs from the outside world: pins, time, and
/// console keystrokes. The console binary implements it over rppal GPIO;
/// the tests implement it with a simulated clock and a pulse recorder.
pub trait Hardware {
    fn set_pin(&mut self, pin: Pin, high: bool);
    fn read_pin(&mut self, pin: Pin) -> bool;
    fn delay_us(&mut self, usec: u64);
    fn micros(&mut self) -> u64;
    /// One pending keystroke, if any. Never blocks.
    fn poll_key(&mut self) -> Option<u8>;
    fn flush_input(&mut self);
}

/// Backing medium of the persistent calibration record.
pub trait ConfigStore {
    fn load(&mut self) -> Option<CalibrationConfig>;
    fn save(&mut self, config: &CalibrationConfig);
}

/// A [`ConfigStore`] that forgets everything on restart. Used by the
/// tests and as a fallback when no file store is wired up.
#[derive(Default)]
pub struct MemoryStore {
    pub saved: Option<CalibrationConfig>,
}

impl ConfigStore for MemoryStore {
    fn load(&mut self) -> Option<CalibrationConfig> {
        self.saved.clone()
    }
    fn save(&mut self, config: &CalibrationConfig) {
        self.saved = Some(config.clone());
    }
}

// ── Calibration record ───────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct CalSlot {
    pub unused: bool,
    pub degrees: i32, // degrees past the index switch; -1 if never calibrated
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct CalibrationConfig {
    pub id: String, // must equal CONFIG_ID
    pub finger_zero_degrees: Vec<CalSlot>, // indexed by motor number; valid for rotators only
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            id: CONFIG_ID.to_string(),
            finger_zero_degrees: vec![CalSlot { unused: true, degrees: -1 }; NUM_MOTORS],
        }
    }
}

// ── Motor numbers ────────────────────────────────────────────────────────
// Motors are *declared* here by assigning motor numbers, *defined* in
// MOTOR_DEFS by giving them a descriptor, and *assigned* physical board
// positions in ASSIGNMENTS, which is the opportunity to have the motor
// cables reach the boards with minimum tangles.

pub const F2_R: usize = 0; // carriage wheel finger rotate (0 can't be a lifter)
pub const F2_L: usize = 1; // carriage wheel finger lift
pub const F3_L: usize = 2;
pub const F3_R: usize = 3;
pub const A1_L: usize = 4; // A figure wheel finger lift
pub const A1_R: usize = 5; // A figure wheel finger rotate
pub const A2_L: usize = 6;
pub const A2_R: usize = 7;
pub const A3_L: usize = 8;
pub const A3_R: usize = 9;
pub const A1K_L: usize = 10; // A figure wheel lock lift
pub const A2K_L: usize = 11;
pub const A3K_L: usize = 12;
pub const FC2_L: usize = 13; // carriage wheel connector lift
pub const REV2_L: usize = 14; // reversing gear lift
pub const FC3_L: usize = 15;
pub const REV3_L: usize = 16;
pub const MP1_L: usize = 17; // movable long pinion lift
pub const MP1K_R: usize = 18; // movable long pinion lock rotate
pub const MP2_L: usize = 19;
pub const MP2K_R: usize = 20;
pub const MP3_L: usize = 21;
pub const MP3K_R: usize = 22;
pub const P11_L: usize = 23; // movable long pinion left connector lift
pub const P21_L: usize = 24;
pub const P31_L: usize = 25;
pub const P12_L: usize = 26; // fixed long pinion left connector lift
pub const P22_L: usize = 27;
pub const P32_L: usize = 28;
pub const P13_L: usize = 29; // movable long pinion right connector lift
pub const P23_L: usize = 30;
pub const P14_L: usize = 31; // fixed long pinion right connector lift
pub const P24_L: usize = 32;
pub const FP1K_R: usize = 33; // fixed long pinion lock rotate
pub const FP2K_R: usize = 34;
pub const FP3K_R: usize = 35;
pub const RP1_L: usize = 36; // rack pinion lift
pub const RP2_L: usize = 37;
pub const RP3_L: usize = 38;
pub const CL2_R: usize = 39; // carry lifter rotate
pub const CS2_R: usize = 40; // carry sector rotate
pub const CW2_L: usize = 41; // carry warning arms lift
pub const CW2_R: usize = 42; // carry warning arms rotate (for reset)
pub const CSK2_R: usize = 43; // carry sector keepers rotate
pub const CSK2_L: usize = 44;
pub const CL3_R: usize = 45;
pub const CS3_R: usize = 46;
pub const CW3_L: usize = 47;
pub const CW3_R: usize = 48;
pub const CSK3_R: usize = 49;
pub const CSK3_L: usize = 50;
pub const S1_L: usize = 51; // store column lift
pub const S1_R: usize = 52; // store column rotate
pub const S2_L: usize = 53;
pub const S2_R: usize = 54;
pub const S3_L: usize = 55;
pub const S3_R: usize = 56;
pub const S4_L: usize = 57;
pub const S4_R: usize = 58;
pub const S5_L: usize = 59;
pub const S5_R: usize = 60;
pub const S6_L: usize = 61;
pub const S6_R: usize = 62;
pub const RR_L: usize = 63; // rack restorer lift
pub const RR_R: usize = 64; // rack restorer rotate
pub const SIGN_R: usize = 65; // sign wheel rotate
pub const SIGN_L: usize = 66;
pub const CTR1_R: usize = 67; // counter rotate
pub const CTR1_L: usize = 68;
pub const CTR2_R: usize = 69;
pub const CTR2_L: usize = 70;
pub const RK_L: usize = 71; // rack lock lift
pub const TEST_R: usize = 72; // a motor test driver
pub const NUM_MOTORS: usize = 73;

// index switch inputs multiplexed into SwitchInput according to MuxA..D;
// axles whose switch was never wired stay unassigned and refuse to calibrate
pub const SW_A2: u8 = 0;
pub const SW_S1: u8 = 1;
pub const SW_RR: u8 = 2;
pub const SW_F2: u8 = 3;

// ── Motor table ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MotorKind {
    Rotate,
    Lift,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MotorState {
    On,
    Off,
}

/// One descriptor per defined axle motor: the identity fixed at boot plus
/// the runtime scheduling state the queuer and dispatcher mutate.
#[derive(Clone, Debug)]
pub struct Motor {
    pub num: usize,
    pub kind: MotorKind, // does it rotate or lift by default?
    pub name: &'static str, // name used in the "rot" and "lift" commands
    pub descr: &'static str,
    pub gear_big: i64, // gear reduction tooth counts, driven over driving
    pub gear_small: i64,
    pub compensating_lifter: Option<usize>, // counter-rotated when this motor rotates
    pub full_steps: bool, // round movements down to full steps so we can power down between them
    pub always_on: bool,  // may never be de-energised
    pub temp_on: bool,    // temporarily held on during zeroing
    pub index_switch: Option<u8>, // mux input of the axle's index switch
    pub assigned: bool,
    pub board_number: usize,   // 1..6
    pub board_position: usize, // 1..16
    pub state: MotorState,
    pub microstep_offset: i64, // current CW offset from a full-step position, 0..USTEPS_PER_STEP-1
    pub deficit: i64, // numerator of the fractional ustep deficit; for the denominator see queue_movement()
    pub move_queued: bool,
    pub moving_now: bool,
    pub clockwise: bool,
    pub usteps_needed: i64, // movement steps needed over all time units
    pub usteps_done: i64,   // steps done in the current time unit
    pub ending_ustep: i64,  // ending step number in the current time unit
    pub start_time: u64,    // starting time for steps, usec into the unit
    pub step_delta_time: u64, // time between steps
    pub last_ustep_time: u64, // when the last step was done
    pub start_pct: i64, // start and end of movement in the time unit, 0..99
    pub end_pct: i64,   // may exceed 99 when the move spills into later units
    pub current_position: i64, // relative to neutral, in units that depend on the axle
}

struct MotorDef {
    num: usize,
    kind: MotorKind,
    name: &'static str,
    descr: &'static str,
    gears: (i64, i64),
    comp_lifter: Option<usize>,
    full_steps: bool,
    always_on: bool,
    index_switch: Option<u8>,
}

const DEF: MotorDef = MotorDef {
    num: 0,
    kind: MotorKind::Lift,
    name: "",
    descr: "",
    gears: (1, 1),
    comp_lifter: None,
    full_steps: false,
    always_on: false,
    index_switch: None,
};

// The default for lifters is no gearing (1:1) because most of them drive a
// leadscrew directly. The default for rotators is the "5:1" gearmotor,
// whose actual ratio is 5+2/11, rationalized as 57/11. For more info see
// the comment in queue_movement().
const GEARMOTOR_BIG: i64 = 57;
const GEARMOTOR_SMALL: i64 = 11;
const MILL_DIGIT_GEAR_BIG: i64 = 2; // 32:16 gearing in the Mill
const MILL_DIGIT_GEAR_SMALL: i64 = 1;
const STORE_DIGIT_GEAR_BIG: i64 = 25; // 50:16 gearing in the Store
const STORE_DIGIT_GEAR_SMALL: i64 = 8;

use MotorKind::{Lift, Rotate};

// Longer names come first so prefixes of later names never steal a match.
const MOTOR_DEFS: &[MotorDef] = &[
    MotorDef { num: FP2K_R, kind: Rotate, name: "fp2k", descr: "fixed long pinion 2 lock",
               gears: (GEARMOTOR_BIG, GEARMOTOR_SMALL), ..DEF },
    MotorDef { num: MP2K_R, kind: Rotate, name: "mp2k", descr: "movable long pinion 2 lock",
               gears: (GEARMOTOR_BIG, GEARMOTOR_SMALL), ..DEF },
    MotorDef { num: P21_L, kind: Lift, name: "p21", descr: "movable long pinion 2 connector to A2 lift", ..DEF },
    MotorDef { num: P22_L, kind: Lift, name: "p22", descr: "fixed long pinion 2 connector to A2 lift", ..DEF },
    MotorDef { num: FC2_L, kind: Lift, name: "fc2", descr: "carriage 2 connector", ..DEF },
    MotorDef { num: REV2_L, kind: Lift, name: "rev2", descr: "carriage 2 reversing pinion", ..DEF },
    MotorDef { num: MP2_L, kind: Lift, name: "mp2", descr: "movable long pinion 2 lift", ..DEF },
    MotorDef { num: A2K_L, kind: Lift, name: "a2k", descr: "A2 lock lift", ..DEF },
    MotorDef { num: A2_L, kind: Lift, name: "a2l", descr: "A2 finger lift",
               gears: (GEARMOTOR_BIG, GEARMOTOR_SMALL), ..DEF },
    MotorDef { num: A2_R, kind: Rotate, name: "a2r", descr: "A2 finger rotate",
               gears: (MILL_DIGIT_GEAR_BIG * GEARMOTOR_BIG, MILL_DIGIT_GEAR_SMALL * GEARMOTOR_SMALL),
               comp_lifter: Some(A2_L), index_switch: Some(SW_A2), ..DEF },
    MotorDef { num: F2_L, kind: Lift, name: "f2l", descr: "carriage 2 finger lift", ..DEF },
    MotorDef { num: F2_R, kind: Rotate, name: "f2r", descr: "carriage 2 finger rotate",
               gears: (MILL_DIGIT_GEAR_BIG, MILL_DIGIT_GEAR_SMALL),
               comp_lifter: Some(F2_L), index_switch: Some(SW_F2), ..DEF },
    MotorDef { num: CL2_R, kind: Rotate, name: "cl2", descr: "carry lifter 2 rotate",
               gears: (GEARMOTOR_BIG, GEARMOTOR_SMALL), ..DEF },
    MotorDef { num: CS2_R, kind: Rotate, name: "cs2", descr: "carry sector 2 rotate",
               gears: (GEARMOTOR_BIG, GEARMOTOR_SMALL), ..DEF },
    MotorDef { num: CW2_L, kind: Lift, name: "cw2l", descr: "carry warning 2 lift",
               gears: (GEARMOTOR_BIG, GEARMOTOR_SMALL), ..DEF },
    MotorDef { num: CW2_R, kind: Rotate, name: "cw2r", descr: "carry warning 2 rotate (for reset)",
               gears: (MILL_DIGIT_GEAR_BIG * GEARMOTOR_BIG, MILL_DIGIT_GEAR_SMALL * GEARMOTOR_SMALL),
               comp_lifter: Some(CW2_L), ..DEF },
    MotorDef { num: CSK2_L, kind: Lift, name: "csk2l", descr: "carry sector keepers 2 lift", ..DEF },
    MotorDef { num: CSK2_R, kind: Rotate, name: "csk2r", descr: "carry sector keepers 2 rotation",
               gears: (MILL_DIGIT_GEAR_BIG, MILL_DIGIT_GEAR_SMALL), comp_lifter: Some(CSK2_L), ..DEF },
    MotorDef { num: S1_L, kind: Lift, name: "s1l", descr: "store stack 1 lift", ..DEF },
    MotorDef { num: S1_R, kind: Rotate, name: "s1r", descr: "store stack 1 rotate",
               gears: (STORE_DIGIT_GEAR_BIG * GEARMOTOR_BIG, STORE_DIGIT_GEAR_SMALL * GEARMOTOR_SMALL),
               comp_lifter: Some(S1_L), index_switch: Some(SW_S1), ..DEF },
    MotorDef { num: RR_L, kind: Lift, name: "rrl", descr: "rack restore lift", ..DEF },
    MotorDef { num: RR_R, kind: Rotate, name: "rrr", descr: "rack restore rotate",
               gears: (STORE_DIGIT_GEAR_BIG * GEARMOTOR_BIG, STORE_DIGIT_GEAR_SMALL * GEARMOTOR_SMALL),
               comp_lifter: Some(RR_L), index_switch: Some(SW_RR), ..DEF },
    MotorDef { num: RP2_L, kind: Lift, name: "rp2", descr: "rack pinion 2 lift", ..DEF },
    MotorDef { num: SIGN_L, kind: Lift, name: "signl", descr: "sign lift", ..DEF },
    MotorDef { num: SIGN_R, kind: Rotate, name: "signr", descr: "sign rotate",
               gears: (GEARMOTOR_BIG, GEARMOTOR_SMALL), ..DEF },
    MotorDef { num: CTR1_L, kind: Lift, name: "ctr1l", descr: "counter 1 lift", ..DEF },
    MotorDef { num: CTR1_R, kind: Rotate, name: "ctr1r", descr: "counter 1 rotate",
               gears: (GEARMOTOR_BIG, GEARMOTOR_SMALL), ..DEF },
    MotorDef { num: CTR2_L, kind: Lift, name: "ctr2l", descr: "counter 2 lift", ..DEF },
    MotorDef { num: CTR2_R, kind: Rotate, name: "ctr2r", descr: "counter 2 rotate",
               gears: (GEARMOTOR_BIG, GEARMOTOR_SMALL), ..DEF },
    MotorDef { num: RK_L, kind: Lift, name: "rk", descr: "rack lock",
               full_steps: true, ..DEF }, // full steps so it can power off between movements
    MotorDef { num: TEST_R, kind: Rotate, name: "test", descr: "test motor", ..DEF },
];

// Physical controller positions, numbered like the board silkscreens:
// boards 1..6, positions 1..16.
const ASSIGNMENTS: &[(usize, usize, usize)] = &[
    (S1_L, 1, 1),
    (S1_R, 1, 2),
    (RP2_L, 1, 3),
    (P21_L, 1, 4),
    (MP2_L, 1, 5),
    (A2_L, 1, 6),
    (A2_R, 1, 7),
    (A2K_L, 1, 8),
    (SIGN_L, 1, 9),
    (SIGN_R, 1, 10),
    (FP2K_R, 1, 11),
    (MP2K_R, 1, 12),
    (RK_L, 1, 13),
    (RR_L, 1, 14),
    (RR_R, 1, 15),
    (P22_L, 1, 16),
    (REV2_L, 2, 1),
    (FC2_L, 2, 2),
    (F2_L, 2, 3),
    (F2_R, 2, 4),
    (CL2_R, 2, 5),
    (CS2_R, 2, 6),
    (CW2_L, 2, 7),
    (CW2_R, 2, 8),
    // position 2,9 has a broken socket
    (CSK2_R, 2, 10),
    (CTR1_L, 2, 11),
    (CTR1_R, 2, 12),
    (CTR2_L, 2, 13),
    (CTR2_R, 2, 14),
    (CSK2_L, 2, 15),
    (TEST_R, 2, 16),
];

// Which pair of select lines picks each of the six daisy-chained boards,
// in cable order: the right connector of one board feeds the left
// connector of the next.
const BOARD_SELECTS: [(Pin, Pin); NUM_BOARDS] = [
    (Pin::BdSel2A, Pin::BdSel3A), // board 1, with the processor
    (Pin::BdSel2B, Pin::BdSel3B),
    (Pin::BdSel2A, Pin::BdSel3C),
    (Pin::BdSel2B, Pin::BdSel3A),
    (Pin::BdSel2A, Pin::BdSel3B),
    (Pin::BdSel2B, Pin::BdSel3C),
];

// Which rotator and index switch belong to the digit wheel whose finger
// lifter is named in the zero table.
const ZERO_AXLES: &[(usize, usize)] = &[
    (F2_L, F2_R),
    (F3_L, F3_R),
    (A1_L, A1_R),
    (A2_L, A2_R),
    (A3_L, A3_R),
    (S1_L, S1_R),
    (S2_L, S2_R),
    (S3_L, S3_R),
    (S4_L, S4_R),
    (S5_L, S5_R),
    (S6_L, S6_R),
    (RR_L, RR_R),
];

// ── Engine context ───────────────────────────────────────────────────────

/// The whole engine state: motor table, scheduler bookkeeping, parser
/// history, and the process-wide flags, threaded through every operation.
pub struct Engine<H: Hardware, S: ConfigStore> {
    pub hw: H,
    store: S,
    pub motors: Vec<Option<Motor>>, // indexed by motor number; None = declared but not defined
    scan_order: Vec<usize>,         // definition order, longest names first
    pub calibration: CalibrationConfig,
    pub got_error: bool,
    pub debug: i32, // 0 quiet .. 6 every step of every motor
    pub timeunit_usec: u64,
    pub motors_queued: i32,
    pub cyclenum: i32,
    pub script_step: bool, // pause before each time unit awaiting a keystroke
    pub restart_requested: bool,
    cmdline: String,
    prev_cmd: String,
    prev_prev_cmd: String,
    saved_cmd: bool,
}

impl<H: Hardware, S: ConfigStore> Engine<H, S> {
    pub fn new(hw: H, mut store: S) -> Self {
        let mut motors: Vec<Option<Motor>> = vec![None; NUM_MOTORS];
        let mut scan_order = Vec::with_capacity(MOTOR_DEFS.len());
        for def in MOTOR_DEFS {
            if motors[def.num].is_some() {
                console_log!("ERROR: motor {} is duplicated!", def.num);
                continue;
            }
            motors[def.num] = Some(Motor {
                num: def.num,
                kind: def.kind,
                name: def.name,
                descr: def.descr,
                gear_big: def.gears.0,
                gear_small: def.gears.1,
                compensating_lifter: def.comp_lifter,
                full_steps: def.full_steps,
                always_on: def.always_on,
                temp_on: false,
                index_switch: def.index_switch,
                assigned: false,
                board_number: 0,
                board_position: 0,
                state: MotorState::Off,
                microstep_offset: 0,
                deficit: 0,
                move_queued: false,
                moving_now: false,
                clockwise: true,
                usteps_needed: 0,
                usteps_done: 0,
                ending_ustep: 0,
                start_time: 0,
                step_delta_time: 0,
                last_ustep_time: 0,
                start_pct: 0,
                end_pct: 99,
                current_position: 0,
            });
            scan_order.push(def.num);
        }
        for &(num, board, position) in ASSIGNMENTS {
            match motors[num].as_mut() {
                None => console_log!("ERROR: undefined motor {} in the board assignments", num),
                Some(m) if m.assigned => console_log!("ERROR: motor {} already assigned", m.name),
                Some(m) => {
                    m.assigned = true;
                    m.board_number = board;
                    m.board_position = position;
                }
            }
        }
        let calibration = match store.load() {
            Some(c) if c.id == CONFIG_ID && c.finger_zero_degrees.len() == NUM_MOTORS => c,
            Some(_) => {
                console_log!("calibration record is stale or corrupt; starting fresh");
                CalibrationConfig::default()
            }
            None => CalibrationConfig::default(),
        };
        Engine {
            hw,
            store,
            motors,
            scan_order,
            calibration,
            got_error: false,
            debug: 0,
            timeunit_usec: DEFAULT_TIMEUNIT_MSEC * 1000,
            motors_queued: 0,
            cyclenum: 0,
            script_step: false,
            restart_requested: false,
            cmdline: String::new(),
            prev_cmd: String::new(),
            prev_prev_cmd: String::new(),
            saved_cmd: false,
        }
    }

    fn motor(&self, num: usize) -> Option<&Motor> {
        self.motors.get(num).and_then(|m| m.as_ref())
    }

    fn motor_mut(&mut self, num: usize) -> Option<&mut Motor> {
        self.motors.get_mut(num).and_then(|m| m.as_mut())
    }

    // the time to move one degree, chosen to keep the same circumferential
    // speed as moving one digit
    fn timeunit_degree_usec(&self) -> u64 {
        self.timeunit_usec * 10 * DIGIT_REPETITIONS as u64 / 360
    }

    /// Boot-time hardware setup and self-report. Neutralises every
    /// possible controller cell once, then announces the motor census and
    /// checks the script library for tokens that will never parse.
    pub fn boot(&mut self) {
        self.initialize_pins();
        let defined = self.motors.iter().flatten().count();
        let assigned = self.motors.iter().flatten().filter(|m| m.assigned).count();
        console_log!(
            "{} motors were declared, {} were defined, and {} were assigned board positions",
            NUM_MOTORS, defined, assigned
        );
        self.validate_scripts();
    }

    // ── Addressing layer ─────────────────────────────────────────────────
    // One shared bus reaches every controller: the 4-bit mux picks a
    // position on a board, StepNotEnb picks whether the board-select pulse
    // is a STEP or an enable-latch write, and pulsing one group-2 plus one
    // group-3 select line picks the board. Setup and pulse widths stay
    // above the latch minimums (120 ns setup, 100 ns pulse) with a 1 usec
    // margin; STEP pulses hold 3 usec for the driver's 1.9 usec minimum.

    fn set_mux(&mut self, posn: usize) {
        self.hw.set_pin(Pin::MuxA, posn & 1 != 0);
        self.hw.set_pin(Pin::MuxB, posn & 2 != 0);
        self.hw.set_pin(Pin::MuxC, posn & 4 != 0);
        self.hw.set_pin(Pin::MuxD, posn & 8 != 0);
    }

    fn pulse_board_select(&mut self, board_number: usize, pulse_usec: u64) {
        let (grp2, grp3) = BOARD_SELECTS[board_number - 1];
        self.hw.delay_us(1); // bus setup
        self.hw.set_pin(grp2, false);
        self.hw.set_pin(grp3, false);
        self.hw.delay_us(pulse_usec);
        self.hw.set_pin(grp2, true);
        self.hw.set_pin(grp3, true);
    }

    fn initialize_pins(&mut self) {
        for pin in [
            Pin::MotorDir, Pin::MotorEnb, Pin::StepNotEnb,
            Pin::MuxA, Pin::MuxB, Pin::MuxC, Pin::MuxD,
            Pin::BdSel2A, Pin::BdSel2B, Pin::BdSel3A, Pin::BdSel3B, Pin::BdSel3C,
        ] {
            self.hw.set_pin(pin, true);
        }
        self.hw.set_pin(Pin::FanOn, false);
        // Disable every controller that might be populated even though no
        // motor is assigned to it, because it will draw power.
        self.hw.set_pin(Pin::StepNotEnb, false); // latching ENB, not stepping
        self.hw.set_pin(Pin::MotorEnb, MOTOR_OFF);
        for posn in 0..POSITIONS_PER_BOARD {
            self.set_mux(posn);
            for board in 1..=NUM_BOARDS {
                self.pulse_board_select(board, 1);
            }
        }
    }

    /// Step the selected motor once and track its offset from the last
    /// full-step detent.
    fn step_motor(&mut self, num: usize) {
        let (clockwise, posn, board, name) = {
            let m = self.motors[num].as_mut().expect("only defined motors are stepped");
            if m.clockwise {
                m.microstep_offset += 1;
                if m.microstep_offset >= USTEPS_PER_STEP {
                    m.microstep_offset = 0;
                }
            } else {
                m.microstep_offset -= 1;
                if m.microstep_offset < 0 {
                    m.microstep_offset = USTEPS_PER_STEP - 1;
                }
            }
            (m.clockwise, m.board_position - 1, m.board_number, m.name)
        };
        self.hw.set_pin(Pin::MotorDir, clockwise);
        self.set_mux(posn);
        self.hw.set_pin(Pin::StepNotEnb, true); // stepping, not latching ENB
        self.pulse_board_select(board, 3);
        if self.debug >= 6 {
            console_log!("motor {} ({}) stepped", num, name);
        }
    }

    fn read_switch(&mut self, switch_number: u8) -> bool {
        self.set_mux(switch_number as usize);
        self.hw.delay_us(3); // 1 is not enough (capacitive charging of long wires?)
        self.hw.read_pin(Pin::SwitchInput)
    }

    fn read_switches(&mut self) -> u16 {
        let mut switches: u16 = 0;
        for switch_number in (0..16).rev() {
            switches = (switches << 1) | self.read_switch(switch_number) as u16;
        }
        switches
    }

    // ── Power manager ────────────────────────────────────────────────────

    /// Power one motor on or off by writing the addressable enable latch
    /// on its board. A motor that sits between full-step detents, or that
    /// is marked always-on or temporarily-on, refuses to power off unless
    /// forced.
    pub fn power_motor(&mut self, num: usize, onoff: MotorState, forceoff: bool) {
        let Some(m) = self.motor(num) else {
            console_log!("ERROR: undefined motor in power_motor");
            return;
        };
        if !m.assigned {
            console_log!("ERROR: unassigned motor in power_motor: {}", m.name);
            return;
        }
        if m.state == onoff {
            return;
        }
        let (name, board, posn, offset) = (m.name, m.board_number, m.board_position, m.microstep_offset);
        if onoff == MotorState::Off {
            let m = self.motor(num).expect("motor was checked at entry");
            if !forceoff && (m.always_on || m.temp_on || m.microstep_offset != 0) {
                if self.debug >= 4 && offset != 0 {
                    console_log!(
                        "  motor {} ({} on board {} position {}) not at full step so left on",
                        num, name, board, posn
                    );
                }
                return;
            }
        } else {
            // the driver re-homes to a full step when it powers on
            self.motors[num]
                .as_mut()
                .expect("motor was checked at entry")
                .microstep_offset = 0;
        }
        self.set_mux(posn - 1);
        self.hw.set_pin(Pin::StepNotEnb, false); // latching ENB, not stepping
        self.hw.set_pin(Pin::MotorEnb, if onoff == MotorState::On { MOTOR_ON } else { MOTOR_OFF });
        self.pulse_board_select(board, 1);
        self.motors[num].as_mut().expect("motor was checked at entry").state = onoff;
        if self.debug >= 4 {
            console_log!(
                "  motor {} ({} on board {} position {}) turned {}",
                num, name, board, posn,
                if onoff == MotorState::On { "on" } else { "off" }
            );
        }
    }

    /// Power all assigned motors. `all` widens the sweep: powering off
    /// with `all` overrides the always-on policy, powering on with `all`
    /// energises everything instead of just the always-on locks. The
    /// narrow On flavor is the pre-dispatch refresh that re-tightens
    /// rotary locks and drops everything else.
    pub fn power_motors(&mut self, onoff: MotorState, all: bool) {
        if self.debug >= 5 {
            console_log!(
                "powering {} motors {}",
                if all { "all" } else { "some" },
                if onoff == MotorState::On { "on" } else { "off" }
            );
        }
        self.got_error = false;
        self.hw.set_pin(Pin::FanOn, onoff == MotorState::On);
        for num in 0..NUM_MOTORS {
            let Some(m) = self.motor(num) else { continue };
            if !m.assigned {
                continue;
            }
            if onoff == MotorState::Off {
                self.power_motor(num, MotorState::Off, all); // "all" even powers off always-on motors
            } else if all || self.motor(num).expect("assigned motor is defined").always_on {
                self.power_motor(num, MotorState::On, false);
            } else {
                self.power_motor(num, MotorState::Off, false);
            }
        }
    }

    // ── Deficit-exact queuer ─────────────────────────────────────────────

    /// Queue an elemental movement for the coming time unit, with exact
    /// accounting of the fractional microstep left over.
    ///
    /// Rotations run through the gearmotor and/or the external gearset;
    /// the descriptor carries the equivalent driven and driving tooth
    /// counts in series. The "5:1" gearmotor is really 57:11; in series
    /// with the Store's 50:16 the ratio is 1425:88, with the Mill's 32:16
    /// it is 114:11. There are 800 microsteps per revolution, so d degrees
    /// needs d * (big * 800) / (360 * small) microsteps: the integer part
    /// moves now and the remainder accumulates as the deficit.
    ///
    /// Lifters ride 8 mm leadscrews, so m mils needs
    /// m * (25.4 mm/in * 800 usteps/rev * big) / (1000 mil/in * 8 mm/rev * small),
    /// which reduces to m * (big * 254) / (100 * small).
    ///
    /// But lifters are also told to *rotate* exact degrees, to hold an
    /// axle's height while it turns. For the deficit to stay exact when
    /// degree and mil moves intersperse on one motor, both are kept over
    /// small times the lcm of 360 and 100: degree remainders scale by 18
    /// and mil remainders by 5 before accumulating.
    pub fn queue_movement(&mut self, num: usize, movetype: MotorKind, distance: i64, start: i64, end: i64) {
        // `end` beyond 99 spills the movement into subsequent time units
        let Some(m) = self.motor(num) else {
            console_log!("ERROR: bad call to queue_movement!");
            return;
        };
        if m.move_queued {
            console_log!("WARNING: axle {} is already scheduled to move", m.name);
            return;
        }
        let (gear_big, gear_small, kind, full_steps, comp_lifter, name) =
            (m.gear_big, m.gear_small, m.kind, m.full_steps, m.compensating_lifter, m.name);

        let (numer, denom) = match movetype {
            MotorKind::Rotate if kind == MotorKind::Rotate => {
                // normal rotator axle, possibly with gearset: distance is signed degrees
                (distance * gear_big * USTEPS_PER_ROTATION, 360 * gear_small)
            }
            MotorKind::Rotate => {
                // rotating a lifter by a specific number of degrees
                (distance * gear_big * USTEPS_PER_ROTATION * 18, 360 * gear_small * 18)
            }
            MotorKind::Lift => {
                // distance is signed mils
                (distance * 254 * gear_big * 5, 100 * gear_small * 5)
            }
        };
        // Rust integer division truncates toward zero and the modulus of a
        // negative number is negative, which works out nicely.
        let mut usteps_needed = numer / denom;
        if full_steps {
            usteps_needed &= !(USTEPS_PER_STEP - 1); // round down to whole steps
        } else {
            let m = self.motors[num].as_mut().expect("motor was checked at entry");
            m.deficit += numer % denom;
            if m.deficit >= denom {
                usteps_needed += 1;
                m.deficit -= denom;
                if self.debug >= 3 {
                    console_log!("  ...motor {} used an accumulated step forward", name);
                }
            } else if m.deficit <= -denom {
                usteps_needed -= 1;
                m.deficit += denom;
                if self.debug >= 3 {
                    console_log!("  ...motor {} used an accumulated step backward", name);
                }
            }
        }
        let clockwise = usteps_needed >= 0;
        if !clockwise {
            usteps_needed = -usteps_needed;
        }
        if usteps_needed == 0 {
            // nothing to deliver; the deficit, if any, is banked
            if self.debug >= 3 {
                console_log!("  motor {} accumulated less than a microstep", name);
            }
        } else {
            let m = self.motors[num].as_mut().expect("motor was checked at entry");
            m.move_queued = true;
            m.clockwise = clockwise;
            m.usteps_needed = usteps_needed;
            m.usteps_done = 0;
            m.start_pct = start;
            m.end_pct = end;
            self.motors_queued += 1;
            if self.debug >= 3 {
                let m = self.motor(num).expect("motor was checked at entry");
                console_log!(
                    "  queued {} of {} motor {} {} for {} {} by {} microsteps from {} to {}, with {} microsteps left over",
                    if movetype == MotorKind::Rotate { "rotation" } else { "lift" },
                    if kind == MotorKind::Rotate { "rotator" } else { "lifter" },
                    name,
                    if m.clockwise { "CW" } else { "CCW" },
                    distance.abs(),
                    if movetype == MotorKind::Rotate { "degrees" } else { "mils" },
                    m.usteps_needed, start, end, m.deficit
                );
            }
        }
        if movetype == MotorKind::Rotate {
            if let Some(lifter) = comp_lifter {
                // counter-rotate the compensating lifter so the axle's
                // height does not change, on the same slice of the unit
                self.queue_movement(lifter, MotorKind::Rotate, -distance, start, end);
            }
        }
    }

    /// Cancel every queued movement.
    pub fn clear_movements(&mut self) {
        for m in self.motors.iter_mut().flatten() {
            m.move_queued = false;
        }
        self.motors_queued = 0;
    }

    // ── Time-unit dispatcher ─────────────────────────────────────────────

    /// Conditions that abort the movements in progress: DEL (stop and
    /// return everything to neutral), ESC (stop where we are), or the
    /// MOTOR_FAULT line going low.
    fn check_abort(&mut self) -> bool {
        if let Some(chr) = self.hw.poll_key() {
            if chr == DEL {
                self.clear_movements();
                console_log!("...stop and reset to neutral");
                self.do_homescript();
                return true;
            }
            if chr == ESC {
                self.clear_movements();
                console_log!("...immediate abort");
                return true;
            }
        }
        if !self.hw.read_pin(Pin::MotorFault) {
            self.error("motor fault", "");
            return true;
        }
        false
    }

    /// Run all the movements queued for this time unit, spreading each
    /// motor's microsteps evenly across its slice of the unit, subject to
    /// the minimum microstep period (which may stretch the unit). Returns
    /// false if the unit was aborted.
    pub fn do_movements(&mut self, duration_usec: u64) -> bool {
        if self.motors_queued == 0 {
            return true;
        }
        if self.debug >= 2 {
            let mut names = format!("doing movements for {} motors:", self.motors_queued);
            for m in self.motors.iter().flatten() {
                if m.move_queued {
                    names += " ";
                    names += m.name;
                }
            }
            console_log!("{}", names);
        }
        if self.check_abort() {
            console_log!("ABORTED");
            self.motors_queued = 0;
            self.got_error = true;
            return false;
        }
        self.power_motors(MotorState::On, false); // refresh the always-on locks

        // 1. precompute the schedule for each queued motor and turn it on
        let mut motors_moving = 0;
        for num in 0..NUM_MOTORS {
            let Some(m) = self.motor(num) else { continue };
            if !m.move_queued {
                continue;
            }
            self.power_motor(num, MotorState::On, false);
            let m = self.motors[num].as_mut().expect("queued motor is defined");
            let end_pct_now = m.end_pct.min(99); // only the steps that land in this unit
            let span_now = end_pct_now - m.start_pct + 1;
            let span_all = m.end_pct - m.start_pct + 1;
            m.ending_ustep = m.usteps_needed * span_now / span_all;
            m.start_time = duration_usec * m.start_pct as u64 / 100;
            m.usteps_done = 0;
            m.last_ustep_time = 0;
            if m.ending_ustep > 0 {
                m.step_delta_time = (span_now as u64 * duration_usec / 100) / m.ending_ustep as u64;
                m.moving_now = true;
                motors_moving += 1;
            } else {
                m.moving_now = false; // too thin a slice to step in this unit
            }
            if self.debug >= 4 {
                let m = self.motor(num).expect("queued motor is defined");
                console_log!(
                    "  motor {} start time {}, delta {}, ending step {} of {}",
                    m.name, m.start_time, m.step_delta_time, m.ending_ustep, m.usteps_needed
                );
            }
        }

        // 2. do all the movement steps for this time unit, evenly spaced
        let mut totalsteps = 0;
        let timeorigin = self.hw.micros();
        let mut timenow: u64 = 0;
        while motors_moving > 0 {
            for num in 0..NUM_MOTORS {
                let Some(m) = self.motor(num) else { continue };
                if !m.moving_now || timenow <= m.start_time {
                    continue;
                }
                let deltatime = timenow - m.last_ustep_time;
                if deltatime > MIN_USTEP_PERIOD_USEC && deltatime >= m.step_delta_time {
                    if self.debug >= 5 {
                        console_log!(
                            "at time {} axle {} moves step {} of {} {}",
                            timenow, m.name, m.usteps_done + 1, m.usteps_needed,
                            if m.clockwise { "CW" } else { "CCW" }
                        );
                    }
                    self.step_motor(num);
                    totalsteps += 1;
                    let m = self.motors[num].as_mut().expect("moving motor is defined");
                    m.last_ustep_time = timenow;
                    m.usteps_done += 1;
                    if m.usteps_done >= m.ending_ustep {
                        m.moving_now = false;
                        motors_moving -= 1;
                        if !m.always_on {
                            self.power_motor(num, MotorState::Off, false); // if we're allowed to
                        }
                    }
                }
            }
            self.hw.delay_us(MOVE_TICK_USEC);
            timenow = self.hw.micros() - timeorigin;
        }

        // 3. restart motors whose movement extends into the next unit(s)
        for num in 0..NUM_MOTORS {
            let Some(m) = self.motors[num].as_mut() else { continue };
            if !m.move_queued {
                continue;
            }
            if m.end_pct <= 99 {
                m.move_queued = false;
                self.motors_queued -= 1;
            } else {
                m.usteps_needed -= m.ending_ustep;
                m.end_pct -= 100;
                m.start_pct = 0;
                if self.debug >= 3 {
                    let m = self.motor(num).expect("queued motor is defined");
                    console_log!(
                        "  requeued motor {} for {} microsteps from {} to {}",
                        m.name, m.usteps_needed, m.start_pct, m.end_pct
                    );
                }
            }
        }
        if self.debug >= 3 {
            console_log!("     did {} steps in {}.{:03} msec", totalsteps, timenow / 1000, timenow % 1000);
        }
        true
    }

    // ── Console helpers ──────────────────────────────────────────────────

    fn error(&mut self, msg: &str, info: &str) {
        if info.is_empty() {
            console_log!("{}", msg);
        } else {
            console_log!("{}: {}", msg, info);
        }
        self.got_error = true;
        self.clear_movements();
    }

    fn wait_for_char(&mut self) -> u8 {
        self.hw.flush_input();
        let key = loop {
            if let Some(k) = self.hw.poll_key() {
                break k;
            }
            self.hw.delay_us(1000);
        };
        if key == ESC {
            console_log!("...aborted");
            self.clear_movements();
        }
        key
    }

    fn check_endcmd(&mut self, cur: &mut Cursor) -> bool {
        cur.skip_blanks();
        if cur.at_end() || cur.peek() == b';' {
            return true;
        }
        let rest = cur.remainder();
        self.error("unknown", &rest);
        false
    }

    /// Scan for an axle name. A rotator only answers to its own movement
    /// kind; lifters answer to rotate commands too, because they rotate
    /// exact degrees to hold an axle's height.
    fn scan_axlename(&mut self, cur: &mut Cursor, which: Option<MotorKind>, showerr: bool) -> Option<usize> {
        for i in 0..self.scan_order.len() {
            let num = self.scan_order[i];
            let (name, kind) = {
                let m = self.motor(num).expect("the scan order only lists defined motors");
                (m.name, m.kind)
            };
            let save = cur.pos;
            if cur.scan_key(name) && (which.is_none() || kind == MotorKind::Lift || Some(kind) == which) {
                return Some(num);
            }
            cur.pos = save;
        }
        if showerr {
            let rest = cur.remainder();
            self.error("bad motor", &rest);
        }
        None
    }

    /// Like `scan_key`, but a match also saves the current line into the
    /// history slots. Only commands that queue work or start scripts come
    /// through here, so `timeunit`, `debug` and friends never clobber the
    /// repeat buffer.
    fn scan_cmd(&mut self, cur: &mut Cursor, keyword: &str) -> bool {
        if !cur.scan_key(keyword) {
            return false;
        }
        if !self.saved_cmd {
            self.prev_prev_cmd = std::mem::take(&mut self.prev_cmd);
            self.prev_cmd = self.cmdline.clone();
            self.saved_cmd = true;
        }
        true
    }

    // ── Functional motor movements ───────────────────────────────────────

    /// Queue the elementary motion of one functional-table entry, honoring
    /// the optional timing modifiers that follow the sub-keyword.
    fn do_move(&mut self, entry: &FctMove, cur: &mut Cursor) {
        let Some(m) = self.motor(entry.motor) else {
            self.error("undefined motor", entry.keyword);
            return;
        };
        if !m.assigned {
            let name = m.name;
            self.error("unassigned motor", name);
            return;
        }
        let (kind, current, name) = (m.kind, m.current_position, m.name);
        let mut start_pct = 0;
        let mut end_pct = 99;
        if cur.scan_key("delay") {
            start_pct = 50;
            end_pct = 99;
        } else if cur.scan_key("time ") {
            match (cur.scan_int(0, 99), cur.scan_int(1, 299)) {
                (Some(s), Some(e)) => {
                    start_pct = s;
                    end_pct = e;
                }
                _ => {
                    let rest = cur.remainder();
                    self.error("bad times", &rest);
                    return;
                }
            }
        }
        if entry.distance_given {
            self.queue_movement(entry.motor, kind, entry.target, start_pct, end_pct);
        } else {
            let distance = entry.target - current;
            if distance == 0 {
                console_log!("already there: {}", name);
            } else {
                self.queue_movement(entry.motor, kind, distance, start_pct, end_pct);
                self.motor_mut(entry.motor)
                    .expect("motor was checked at entry")
                    .current_position = entry.target;
            }
        }
    }

    /// Parse the axle sub-keyword(s) of a functional family and queue the
    /// matching move. A `NO_MOVE` entry matches without scheduling; the
    /// caller gets the entry either way.
    fn do_function(&mut self, table: &'static [FctMove], cur: &mut Cursor) -> Option<&'static FctMove> {
        for entry in table {
            if cur.scan_key(entry.keyword) {
                if entry.target != NO_MOVE {
                    self.do_move(entry, cur);
                }
                return Some(entry);
            }
        }
        let rest = cur.remainder();
        self.error("unknown axle and keywords", &rest);
        None
    }

    /// Give off one digit on an axle finger: the elementary
    /// number-transfer motion of the machine.
    fn do_giveoff(&mut self, cur: &mut Cursor) {
        for entry in FCT_GIVEOFF {
            if cur.scan_key(entry.keyword) {
                if self.motor(entry.motor).is_none() {
                    self.error("undefined motor in giveoff", entry.keyword);
                    return;
                }
                let reverse = cur.scan_key("reverse");
                let degrees = if reverse { -DEGREES_PER_DIGIT } else { DEGREES_PER_DIGIT };
                self.queue_movement(entry.motor, MotorKind::Rotate, degrees, 0, 99);
                return;
            }
        }
        let rest = cur.remainder();
        self.error("unknown axle", &rest);
    }

    fn do_onoff(&mut self, onoff: MotorState, cur: &mut Cursor) {
        if let Some(num) = self.scan_axlename(cur, None, false) {
            self.power_motor(num, onoff, false);
        } else {
            let doall = cur.scan_key("all"); // "all" overrides the always-on policy
            if self.check_endcmd(cur) {
                self.power_motors(onoff, doall);
            }
        }
    }

    // ── Zeroing and calibration ──────────────────────────────────────────

    fn set_temp_on(&mut self, rotator: usize, on: bool) {
        let comp = match self.motor_mut(rotator) {
            Some(m) => {
                m.temp_on = on;
                m.compensating_lifter
            }
            None => return,
        };
        if let Some(lifter) = comp {
            if let Some(lm) = self.motor_mut(lifter) {
                lm.temp_on = on;
            }
        }
    }

    /// Rotate the digit wheel (F, A, S, RR) whose finger lifter is given
    /// until it just reaches its index switch. Returns the rotator, with
    /// `temp_on` still set on it and its compensating lifter.
    fn move_to_switch(&mut self, lift_motor: usize) -> Option<usize> {
        let Some(&(_, rotate_motor)) = ZERO_AXLES.iter().find(|&&(lift, _)| lift == lift_motor) else {
            self.error("no rotator for that axle", "");
            return None;
        };
        let Some(rm) = self.motor(rotate_motor) else {
            self.error("undefined motor", "");
            return None;
        };
        let name = rm.name;
        let Some(switch_number) = rm.index_switch else {
            self.error("no index switch assigned", name);
            return None;
        };
        if self.debug >= 1 {
            console_log!("rotating {} 10 digits", name);
        }
        // hold the motors on through the whole search
        self.set_temp_on(rotate_motor, true);
        // rotate 10 digits so the wheel is sure to engage with the finger
        self.queue_movement(rotate_motor, MotorKind::Rotate, DEGREES_PER_DIGIT * 10, 0, 99);
        if !self.do_movements(self.timeunit_usec * 10) {
            self.set_temp_on(rotate_motor, false);
            return None;
        }
        let degree_unit = self.timeunit_degree_usec();
        let mut limit = 370;
        while limit > 0 && !self.read_switch(switch_number) {
            // sitting on the switch; get off it first
            if self.debug >= 1 {
                console_log!("getting {} off the switch", name);
            }
            self.queue_movement(rotate_motor, MotorKind::Rotate, 1, 0, 99);
            if !self.do_movements(degree_unit) {
                self.set_temp_on(rotate_motor, false);
                return None;
            }
            limit -= 1;
        }
        if limit == 0 {
            self.error("switch is always on!", "");
            self.set_temp_on(rotate_motor, false);
            return None;
        }
        if self.debug >= 1 {
            console_log!("rotating {} to the switch position", name);
        }
        // now rotate until it just gets on the switch; no need to find the
        // center point, since we always approach it the same way
        let mut limit = 370;
        while limit > 0 && self.read_switch(switch_number) {
            self.queue_movement(rotate_motor, MotorKind::Rotate, 1, 0, 99);
            if !self.do_movements(degree_unit) {
                self.set_temp_on(rotate_motor, false);
                return None;
            }
            limit -= 1;
        }
        if limit == 0 {
            self.error("switch is always off!", "");
            self.set_temp_on(rotate_motor, false);
            return None;
        }
        Some(rotate_motor)
    }

    /// `do_zero {Fn|An|Sn|RR} [calibrate]`: find the index switch, then
    /// either rotate the stored zero offset or interactively record a new
    /// one.
    fn do_zero(&mut self, cur: &mut Cursor) {
        let Some(entry) = self.do_function(FCT_ZERO, cur) else { return };
        let lift_motor = entry.motor;
        let calibrate = cur.scan_key("calibrate");
        if self.script_step && !self.do_step_wait() {
            return;
        }
        let Some(rotate_motor) = self.move_to_switch(lift_motor) else { return };
        let name = self
            .motor(rotate_motor)
            .expect("move_to_switch returns a defined rotator")
            .name;
        if calibrate {
            console_log!("hit space, 1-9, or a-z until the wheel is at zero and aligned, then hit Enter; ESC aborts");
            // 'i' is 18 degrees
            let mut degrees: i64 = 0;
            let ended_with = loop {
                let chr = self.wait_for_char();
                if chr == ESC || chr == b'\n' || chr == b'\r' {
                    break chr;
                }
                let delta: i64 = match chr {
                    b'1'..=b'9' => (chr - b'1') as i64,
                    b'a'..=b'z' => (chr - b'a') as i64 + 10,
                    b' ' => 1,
                    _ => 0,
                };
                if delta != 0 {
                    self.queue_movement(rotate_motor, MotorKind::Rotate, delta, 0, 99);
                    if !self.do_movements(self.timeunit_degree_usec()) {
                        self.set_temp_on(rotate_motor, false);
                        return;
                    }
                    self.hw.delay_us(DEBOUNCE_MSEC * 1000); // let the switch settle
                    degrees += delta;
                }
            };
            if ended_with != ESC {
                // Never shorten by going counter-clockwise: the finger
                // must move clockwise after the switch triggers or it is
                // not on the nib.
                let slot = &mut self.calibration.finger_zero_degrees[rotate_motor];
                console_log!(
                    "axle {} zero changed from {} to {} degrees past the switch",
                    name, slot.degrees, degrees
                );
                slot.degrees = degrees as i32;
                slot.unused = false;
                self.store.save(&self.calibration);
            }
        } else {
            // zero using the existing calibration
            let degrees = self.calibration.finger_zero_degrees[rotate_motor].degrees;
            if degrees == -1 {
                self.error("axle not calibrated", name);
            } else {
                if self.debug >= 1 {
                    console_log!("rotating {} {} degrees to zero", name, degrees);
                }
                self.queue_movement(rotate_motor, MotorKind::Rotate, degrees as i64, 0, 99);
                self.do_movements(self.timeunit_degree_usec() * degrees as u64);
            }
        }
        // cancel the temporary stay-on for the rotator and its lifter on
        // every exit path
        self.set_temp_on(rotate_motor, false);
    }

    /// `calibrate <axle> <deg>`: persist a zero offset directly.
    fn do_calibrate(&mut self, cur: &mut Cursor) {
        let Some(num) = self.scan_axlename(cur, Some(MotorKind::Rotate), true) else { return };
        match cur.scan_int(-360, 360) {
            Some(degrees) => {
                let name = self.motor(num).expect("scan_axlename returns a defined motor").name;
                let slot = &mut self.calibration.finger_zero_degrees[num];
                console_log!(
                    "axle {} zero changed from {} to {} degrees past the switch",
                    name, slot.degrees, degrees
                );
                slot.degrees = degrees as i32;
                slot.unused = false;
                self.store.save(&self.calibration);
            }
            None => {
                let rest = cur.remainder();
                self.error("bad degrees", &rest);
            }
        }
    }

    // ── Diagnostics ──────────────────────────────────────────────────────

    pub fn show_motors(&self) {
        for m in self.motors.iter().flatten() {
            if m.assigned {
                console_log!(
                    "  motor {} ({}, {}) is position {} on board {}, {}, step offset {}",
                    m.num, m.name, m.descr, m.board_position, m.board_number,
                    if m.state == MotorState::On { "ON" } else { "OFF" },
                    m.microstep_offset
                );
            }
        }
    }

    /// Show the motors not at neutral or still powered.
    pub fn show_state(&self) {
        for m in self.motors.iter().flatten() {
            if m.assigned && (m.current_position != 0 || m.state == MotorState::On) {
                console_log!(
                    "{} ({}) is at {} and is {}",
                    m.name, m.descr, m.current_position,
                    if m.state == MotorState::On { "on" } else { "off" }
                );
            }
        }
    }

    /// Monitor the digit-wheel index switches until a key is pressed.
    fn show_switches(&mut self) {
        let mut current = self.read_switches();
        console_log!("monitoring switches...");
        loop {
            if self.hw.poll_key().is_some() {
                break;
            }
            if self.read_switches() != current {
                self.hw.delay_us(DEBOUNCE_MSEC * 1000); // see if it persists
                let settled = self.read_switches();
                if settled != current {
                    let mut line = String::from("switches changed:");
                    for switch_number in 0..16 {
                        if (settled ^ current) & (1 << switch_number) != 0 {
                            line += &format!(
                                " sw{}={}",
                                switch_number,
                                (settled >> switch_number) & 1
                            );
                        }
                    }
                    console_log!("{}", line);
                    current = settled;
                }
            }
            self.hw.delay_us(1000);
        }
        console_log!("done");
    }

    /// Diagnostic input echo until ESC.
    fn do_test(&mut self) {
        console_log!("enter chars, ESC to exit");
        loop {
            match self.hw.poll_key() {
                Some(chr) if chr == ESC => break,
                Some(chr) => console_log!("{:02X}", chr),
                None => self.hw.delay_us(1000),
            }
        }
    }

    fn show_help(&self) {
        for line in HELP {
            console_log!("{}", line);
        }
        let mut names = String::new();
        for sp in SCRIPTS {
            if !names.is_empty() {
                names.push('|');
            }
            names += sp.name;
        }
        console_log!("scripts: {}", names);
        let mut axles = String::from("<axle> is one of:");
        for &num in &self.scan_order {
            let m = self.motor(num).expect("the scan order only lists defined motors");
            if m.assigned {
                axles += " ";
                axles += m.name;
            }
        }
        console_log!("{}", axles);
    }

    // ── Miscellaneous commands ───────────────────────────────────────────

    /// Complete all queued movements and then wait.
    fn do_pause(&mut self, cur: &mut Cursor) {
        while self.motors_queued > 0 {
            if !self.do_movements(self.timeunit_usec) {
                break;
            }
        }
        match cur.scan_int(1, 99999) {
            None => {
                console_log!("waiting...");
                if self.wait_for_char() == ESC {
                    self.got_error = true;
                }
            }
            Some(msec) => {
                let start = self.hw.micros();
                self.hw.flush_input();
                if self.debug >= 1 {
                    console_log!("pausing {} msec", msec);
                }
                while self.hw.micros() - start < msec as u64 * 1000 {
                    if self.hw.poll_key().is_some() {
                        break;
                    }
                    self.hw.delay_us(1000);
                }
            }
        }
    }

    /// Reset our internal idea of the machine, not the hardware.
    fn do_reset(&mut self) {
        for m in self.motors.iter_mut().flatten() {
            m.move_queued = false;
            m.current_position = 0;
        }
        self.motors_queued = 0;
    }

    fn do_homescript(&mut self) {
        // launched as "run home" so the script, not the command keyword,
        // is what re-parses
        self.execute_commands("run home", 1);
    }

    // ── The command interpreter ──────────────────────────────────────────

    /// Try to scan one primitive command and queue whatever movement it
    /// requires. Returns false if the text is not a primitive (it may
    /// still be a script launch).
    fn scan_command(&mut self, cur: &mut Cursor) -> bool {
        if self.got_error {
            return false;
        }
        cur.skip_blanks();
        // commands that save the command buffer for history
        if self.scan_cmd(cur, "rot ") {
            if let Some(num) = self.scan_axlename(cur, Some(MotorKind::Rotate), true) {
                match cur.scan_int(-360 * 6, 360 * 6) { // might have a 5.2:1 gearbox
                    Some(0) => console_log!(
                        "already there: {}",
                        self.motor(num).expect("scan_axlename returns a defined motor").name
                    ),
                    Some(degrees) => self.queue_movement(num, MotorKind::Rotate, degrees, 0, 99),
                    None => {
                        let rest = cur.remainder();
                        self.error("bad degrees", &rest);
                    }
                }
            }
        } else if self.scan_cmd(cur, "lift") {
            if let Some(num) = self.scan_axlename(cur, Some(MotorKind::Lift), true) {
                match cur.scan_int(-1500, 1500) {
                    Some(0) => console_log!(
                        "already there: {}",
                        self.motor(num).expect("scan_axlename returns a defined motor").name
                    ),
                    Some(mils) => self.queue_movement(num, MotorKind::Lift, mils, 0, 99),
                    None => {
                        let rest = cur.remainder();
                        self.error("bad mils", &rest);
                    }
                }
            }
        } else if self.scan_cmd(cur, "lock1") {
            self.do_function(FCT_LOCK1, cur);
        } else if self.scan_cmd(cur, "lock") {
            self.do_function(FCT_LOCK, cur);
        } else if self.scan_cmd(cur, "unlock") {
            self.do_function(FCT_UNLOCK, cur);
        } else if self.scan_cmd(cur, "mesh") {
            self.do_function(FCT_MESH, cur);
        } else if self.scan_cmd(cur, "unmesh") {
            self.do_function(FCT_UNMESH, cur);
        } else if self.scan_cmd(cur, "finger") {
            self.do_function(FCT_FINGER, cur);
        } else if self.scan_cmd(cur, "nofinger") {
            self.do_function(FCT_NOFINGER, cur);
        } else if self.scan_cmd(cur, "shift") {
            self.do_function(FCT_SHIFT, cur);
        } else if self.scan_cmd(cur, "do_zero") {
            self.do_zero(cur);
        } else if self.scan_cmd(cur, "giveoff") {
            self.do_giveoff(cur);
        } else if self.scan_cmd(cur, "setcarry") {
            self.do_function(FCT_SETCARRY, cur);
        } else if self.scan_cmd(cur, "carrywarn") {
            self.do_function(FCT_CARRYWARN, cur);
        } else if self.scan_cmd(cur, "carry") {
            self.do_function(FCT_CARRY, cur);
        } else if self.scan_cmd(cur, "keepers") {
            self.do_function(FCT_KEEPERS, cur);
        } else if self.scan_cmd(cur, "test") {
            self.do_test();
        } else if self.scan_cmd(cur, "repeat ") {
            let count = cur.scan_int(1, 9999).unwrap_or(9999);
            let rest = cur.remainder();
            cur.skip_to_end();
            for _ in 0..count {
                if self.got_error {
                    break;
                }
                self.execute_commands(&rest, 1);
            }
        }
        // commands that don't save the command buffer call scan_key directly
        else if cur.scan_key("timeunit ") {
            match cur.scan_int(10, 60 * 1000) {
                Some(msec) => self.timeunit_usec = msec as u64 * 1000,
                None => {
                    let rest = cur.remainder();
                    self.error("bad time in msec", &rest);
                }
            }
        } else if cur.scan_key("timeunit") {
            console_log!("{} msec", self.timeunit_usec / 1000);
        } else if cur.scan_key("tu") {
            self.timeunit_usec = 157 * 1000; // shortcut to Babbage's own time unit
        } else if cur.scan_key("debug ") {
            match cur.scan_int(0, 99) {
                Some(level) => self.debug = level as i32,
                None => {
                    let rest = cur.remainder();
                    self.error("bad debug level", &rest);
                }
            }
        } else if cur.scan_key("debug") {
            console_log!("debug {}", self.debug);
        } else if cur.scan_key("on") {
            self.do_onoff(MotorState::On, cur);
        } else if cur.scan_key("off") {
            self.do_onoff(MotorState::Off, cur);
        } else if cur.scan_key("home") {
            self.do_homescript();
        } else if cur.scan_key("pause") {
            self.do_pause(cur);
        } else if cur.scan_key("reset") {
            self.do_reset();
        } else if cur.scan_key("switches") {
            self.show_switches();
        } else if cur.scan_key("motors") {
            self.show_motors();
        } else if cur.scan_key("state") {
            self.show_state();
        } else if cur.scan_key("calibrate") {
            self.do_calibrate(cur);
        } else if cur.scan_key("bell") {
            console_log!("{}", BELL as char);
        } else if cur.scan_key("restart") {
            self.restart_requested = true;
        } else if cur.scan_key("help") || cur.scan_key("?") {
            self.show_help();
        } else {
            return false;
        }
        cur.scan_key(";");
        true
    }

    fn find_script(&mut self, cur: &mut Cursor) -> Option<&'static Script> {
        for sp in SCRIPTS {
            if cur.scan_key(sp.name) {
                return Some(sp);
            }
        }
        let rest = cur.remainder();
        self.error("unknown command or script", &rest);
        None
    }

    /// Wait for one keystroke before a time unit in `step` mode. `+`
    /// converts the remainder of the run into a continuous one; ESC
    /// aborts.
    fn do_step_wait(&mut self) -> bool {
        console_log!("...waiting (any key steps, + runs, ESC aborts)");
        let chr = self.wait_for_char();
        if chr == ESC {
            self.got_error = true;
            return false;
        }
        if chr == b'+' {
            self.script_step = false;
        }
        true
    }

    /// Consume one time unit: run every movement queued by the primitives
    /// and script lines since the last one.
    fn do_timeunit(&mut self) -> bool {
        if !self.got_error && self.motors_queued > 0 {
            self.cyclenum += 1;
            if self.script_step && !self.do_step_wait() {
                return false;
            }
            if self.debug >= 1 {
                console_log!("*** at time unit {}", self.cyclenum);
            }
            self.do_movements(self.timeunit_usec);
        }
        true
    }

    /// Execute all the commands in a string simultaneously, including
    /// running in parallel any embedded scripts, which advance one line
    /// per time unit. Recursive: an expanded script line may itself start
    /// further scripts at the next level.
    pub fn execute_commands(&mut self, line: &str, level: usize) {
        if level > MAX_SCRIPT_DEPTH {
            self.error("scripts nested too deeply", line);
            return;
        }
        struct Frame {
            script: &'static Script,
            next_line: usize,
            parms: Vec<String>,
        }
        let mut frames: Vec<Frame> = Vec::new();
        let mut cur = Cursor::new(line);
        cur.skip_blanks();
        if self.debug >= 2 && level > 1 {
            console_log!("executing at level {}: \"{}\"", level, cur.remainder());
        }
        // scan a run of primitive commands and script launches, all of
        // which execute in parallel
        while !self.got_error && !cur.at_end() {
            if self.scan_command(&mut cur) {
                continue;
            }
            if self.scan_cmd(&mut cur, "step ") {
                if level == 1 {
                    self.script_step = true;
                }
            } else {
                self.scan_cmd(&mut cur, "run "); // "run" is optional: any script name is a command
                if level == 1 {
                    self.script_step = false;
                }
            }
            let Some(script) = self.find_script(&mut cur) else { continue };
            if frames.len() >= MAX_SCRIPTS {
                self.error("too many parallel scripts", script.name);
                continue;
            }
            if self.debug >= 3 {
                console_log!("starting script \"{}\" with command \"{}\"", script.name, script.lines[0]);
            }
            let mut parms = Vec::with_capacity(MAX_PARMS);
            for _ in 0..MAX_PARMS {
                parms.push(cur.scan_word(MAX_PARMSIZE)); // unused ones stay empty
            }
            frames.push(Frame { script, next_line: 0, parms });
            cur.scan_key(";");
        }
        // All the primitive movements are queued and the scripts are
        // registered. Now advance every parallel script one line per time
        // unit.
        let mut running = frames.iter().filter(|f| f.next_line < f.script.lines.len()).count();
        while running > 0 && !self.got_error {
            for frame in frames.iter_mut() {
                if frame.next_line >= frame.script.lines.len() {
                    continue;
                }
                let (command, num_substitutions) =
                    substitute_parms(frame.script.lines[frame.next_line], &frame.parms);
                if num_substitutions > 0 && self.debug >= 3 {
                    console_log!(
                        "substituted {} parameters in script \"{}\" command \"{}\"",
                        num_substitutions, frame.script.name, command
                    );
                }
                frame.next_line += 1;
                let ended = frame.next_line >= frame.script.lines.len();
                self.execute_commands(&command, level + 1);
                if ended {
                    running -= 1;
                }
            }
            if running > 0 && !self.do_timeunit() {
                return;
            }
        }
        if level == 1 {
            self.do_timeunit(); // do leftover movements
        }
    }

    /// Resolve console shorthand against the history slots: an empty line
    /// repeats the last committed command, a lone backspace recalls the
    /// one before that (swapping the two slots).
    pub fn resolve_input(&mut self, raw: &str) -> String {
        self.saved_cmd = false;
        if raw.is_empty() {
            self.saved_cmd = true;
            console_log!("{}", self.prev_cmd);
            return self.prev_cmd.clone();
        }
        if raw == "\u{8}" {
            let line = self.prev_prev_cmd.clone();
            self.prev_prev_cmd = std::mem::take(&mut self.prev_cmd);
            self.prev_cmd = line.clone();
            self.saved_cmd = true;
            console_log!("{}", line);
            return line;
        }
        raw.to_string()
    }

    /// Execute one committed console line.
    pub fn handle_line(&mut self, raw: &str) {
        let line = self.resolve_input(raw);
        self.cmdline = line.clone();
        self.got_error = false;
        self.execute_commands(&line, 1);
    }

    pub fn prev_command(&self) -> &str {
        &self.prev_cmd
    }

    pub fn prev_prev_command(&self) -> &str {
        &self.prev_prev_cmd
    }

    /// Boot-time dry check of the script library: every `;`-separated
    /// command must lead with a known primitive, a known script name, or a
    /// `#n` substitution that only resolves at launch time.
    pub fn validate_scripts(&mut self) {
        for sp in SCRIPTS {
            for (lineno, line) in sp.lines.iter().enumerate() {
                for command in line.split(';') {
                    let Some(word) = command.split_whitespace().next() else { continue };
                    if word.contains('#') {
                        continue;
                    }
                    let known = COMMAND_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
                        || SCRIPTS.iter().any(|s| s.name.eq_ignore_ascii_case(word));
                    if !known {
                        console_log!(
                            "script \"{}\" line {}: unknown command \"{}\"",
                            sp.name, lineno + 1, word
                        );
                    }
                }
            }
        }
    }
}

// ── Command scanning ─────────────────────────────────────────────────────

/// A cursor over one command line. Keywords match case-insensitively and
/// a blank inside a keyword matches a run of blanks; integers are
/// range-checked at scan time and nothing is consumed on failure.
struct Cursor<'a> {
    s: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str) -> Self {
        Cursor { s: line.as_bytes(), pos: 0 }
    }

    fn peek(&self) -> u8 {
        if self.pos < self.s.len() { self.s[self.pos] } else { 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.s.len()
    }

    fn skip_blanks(&mut self) {
        while matches!(self.peek(), b' ' | b'\t' | b'\n' | b'\r') {
            self.pos += 1;
        }
    }

    fn scan_key(&mut self, keyword: &str) -> bool {
        self.skip_blanks();
        let mut t = self.pos;
        for &k in keyword.as_bytes() {
            let c = if t < self.s.len() { self.s[t] } else { 0 };
            if c.to_ascii_lowercase() != k.to_ascii_lowercase() {
                return false;
            }
            t += 1;
            if k == b' ' {
                while t < self.s.len() && self.s[t] == b' ' {
                    t += 1; // a blank matches a run of blanks
                }
            }
        }
        self.pos = t;
        self.skip_blanks();
        true
    }

    fn scan_int(&mut self, min: i64, max: i64) -> Option<i64> {
        let save = self.pos;
        self.skip_blanks();
        let mut t = self.pos;
        let negative = match self.s.get(t) {
            Some(b'-') => {
                t += 1;
                true
            }
            Some(b'+') => {
                t += 1;
                false
            }
            _ => false,
        };
        let digits_start = t;
        let mut num: i64 = 0;
        while t < self.s.len() && self.s[t].is_ascii_digit() {
            num = num.saturating_mul(10).saturating_add((self.s[t] - b'0') as i64);
            t += 1;
        }
        if t == digits_start {
            self.pos = save;
            return None;
        }
        if negative {
            num = -num;
        }
        if num < min || num > max {
            self.pos = save;
            return None;
        }
        self.pos = t;
        self.skip_blanks();
        Some(num)
    }

    /// Scan a word up to a blank or `;`.
    fn scan_word(&mut self, maxlen: usize) -> String {
        self.skip_blanks();
        let mut word = String::new();
        while !self.at_end() && word.len() < maxlen {
            let c = self.peek();
            if c == b';' || c == b' ' {
                break;
            }
            word.push(c as char);
            self.pos += 1;
        }
        word
    }

    fn remainder(&self) -> String {
        String::from_utf8_lossy(&self.s[self.pos.min(self.s.len())..]).into_owned()
    }

    fn skip_to_end(&mut self) {
        self.pos = self.s.len();
    }
}

/// Copy a script line, substituting the stored actuals for `#1`..`#9`.
/// Returns the expanded line (bounded by `MAX_CMDLEN`) and the number of
/// substitutions made.
fn substitute_parms(src: &str, parms: &[String]) -> (String, usize) {
    let bytes = src.as_bytes();
    let mut dst = String::new();
    let mut count = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'#' {
            if let Some(&p) = bytes.get(i + 1) {
                if p.is_ascii_digit() && p != b'0' {
                    if let Some(parm) = parms.get((p - b'1') as usize) {
                        for c in parm.chars() {
                            if dst.len() < MAX_CMDLEN {
                                dst.push(c);
                            }
                        }
                    }
                    count += 1;
                    i += 2;
                    continue;
                }
            }
            count += 1;
            i += 1; // a stray '#' is dropped
        } else {
            if dst.len() < MAX_CMDLEN {
                dst.push(bytes[i] as char);
            }
            i += 1;
        }
    }
    (dst, count)
}

// ── Functional move tables ───────────────────────────────────────────────

/// One basic movement: a sub-keyword (usually naming the axle), the motor
/// to move, and where it should go (positive is up or clockwise) — or the
/// distance to move it, when `distance_given` is set.
pub struct FctMove {
    keyword: &'static str,
    motor: usize,
    target: i64,
    distance_given: bool,
}

/// Matches its keyword but schedules nothing; used by the zero table to
/// identify which axle to calibrate.
pub const NO_MOVE: i64 = i64::MAX;

const fn to_position(keyword: &'static str, motor: usize, target: i64) -> FctMove {
    FctMove { keyword, motor, target, distance_given: false }
}

const FCT_GIVEOFF: &[FctMove] = &[
    to_position("A2", A2_R, 0),
    to_position("F2", F2_R, 0),
    to_position("F3", F3_R, 0),
    to_position("S1", S1_R, 0),
    to_position("S2", S2_R, 0),
    to_position("S3", S3_R, 0),
    to_position("S4", S4_R, 0),
    to_position("S5", S5_R, 0),
    to_position("S6", S6_R, 0),
    to_position("RR", RR_R, 0),
];

const FCT_LOCK: &[FctMove] = &[
    to_position("A1 top", A1K_L, -300),
    to_position("A1 bot", A1K_L, 300),
    to_position("A1", A1K_L, 0),
    to_position("A2 top", A2K_L, -300),
    to_position("A2 bot", A2K_L, 300),
    to_position("A2", A2K_L, 0),
    to_position("A3 top", A3K_L, -300),
    to_position("A3 bot", A3K_L, 300),
    to_position("A3", A3K_L, 0),
    to_position("FP1", FP1K_R, 0),
    to_position("MP1", MP1K_R, 0),
    to_position("FP2", FP2K_R, 0),
    to_position("MP2", MP2K_R, 0),
    to_position("FP3", FP3K_R, 0),
    to_position("MP3", MP3K_R, 0),
];

const FCT_LOCK1: &[FctMove] = &[
    to_position("FP1", FP1K_R, 30),
    to_position("MP1", MP1K_R, 30),
    to_position("FP2", FP2K_R, 30),
    to_position("MP2", MP2K_R, 30),
    to_position("FP3", FP3K_R, 30),
    to_position("MP3", MP3K_R, 30),
];

const FCT_UNLOCK: &[FctMove] = &[
    to_position("A1 top", A1K_L, 300),
    to_position("A1 bot", A1K_L, -300),
    to_position("A1", A1K_L, 550),
    to_position("A2 top", A2K_L, 300),
    to_position("A2 bot", A2K_L, -300),
    to_position("A2", A2K_L, 550),
    to_position("A3 top", A3K_L, 300),
    to_position("A3 bot", A3K_L, -300),
    to_position("A3", A3K_L, 550),
    to_position("FP1", FP1K_R, 15),
    to_position("MP1", MP1K_R, 15),
    to_position("FP2", FP2K_R, 15),
    to_position("MP2", MP2K_R, 15),
    to_position("FP3", FP3K_R, 15),
    to_position("MP3", MP3K_R, 15),
];

// how far in mils to move the store digit wheels to engage with only the
// rack (for writing), or with both the rack and the finger (for reading)
const STORE_RACK: i64 = 270;
const STORE_FINGER: i64 = 525;

const FCT_MESH: &[FctMove] = &[
    to_position("FP1 A1 top", P12_L, 400),
    to_position("FP1 A1 bot", P12_L, -400),
    to_position("MP1 A1 top", P11_L, 400),
    to_position("MP1 A1 bot", P11_L, -400),
    to_position("FP1 A2 top", P14_L, 400),
    to_position("FP1 A2 bot", P14_L, -400),
    to_position("MP1 A2 top", P13_L, 400),
    to_position("MP1 A2 bot", P13_L, -400),
    to_position("FP2 A2 top", P22_L, 400),
    to_position("FP2 A2 bot", P22_L, -400),
    to_position("MP2 A2 top", P21_L, 400),
    to_position("MP2 A2 bot", P21_L, -400),
    to_position("FP2 A3 top", P24_L, 400),
    to_position("FP2 A3 bot", P24_L, -400),
    to_position("MP2 A3 top", P23_L, 400),
    to_position("MP2 A3 bot", P23_L, -400),
    to_position("FP3 A3 top", P32_L, 400),
    to_position("FP3 A3 bot", P32_L, -400),
    to_position("MP3 A3 top", P31_L, 400),
    to_position("MP3 A3 bot", P31_L, -400),
    to_position("RP1 A1 top", RP1_L, 1220),
    to_position("RP1 A1 bot", RP1_L, 370),
    to_position("RP1 MP1", RP1_L, (1220 + 370) / 2),
    to_position("RP2 A2 top", RP2_L, 1220),
    to_position("RP2 A2 bot", RP2_L, 370),
    to_position("RP2 MP2", RP2_L, (1220 + 370) / 2),
    to_position("REV2", REV2_L, 400),
    to_position("FC2", FC2_L, 400),
    to_position("REV3", REV3_L, 400),
    to_position("FC3", FC3_L, 400),
    to_position("S1 top rack", S1_L, -STORE_RACK),
    to_position("S1 bot rack", S1_L, STORE_RACK),
    to_position("S1 top finger", S1_L, -STORE_FINGER),
    to_position("S1 bot finger", S1_L, STORE_FINGER),
    to_position("S2 top rack", S2_L, -STORE_RACK),
    to_position("S2 bot rack", S2_L, STORE_RACK),
    to_position("S2 top finger", S2_L, -STORE_FINGER),
    to_position("S2 bot finger", S2_L, STORE_FINGER),
    to_position("S3 top rack", S3_L, -STORE_RACK),
    to_position("S3 bot rack", S3_L, STORE_RACK),
    to_position("S3 top finger", S3_L, -STORE_FINGER),
    to_position("S3 bot finger", S3_L, STORE_FINGER),
    to_position("S4 top rack", S4_L, -STORE_RACK),
    to_position("S4 bot rack", S4_L, STORE_RACK),
    to_position("S4 top finger", S4_L, -STORE_FINGER),
    to_position("S4 bot finger", S4_L, STORE_FINGER),
    to_position("S5 top rack", S5_L, -STORE_RACK),
    to_position("S5 bot rack", S5_L, STORE_RACK),
    to_position("S5 top finger", S5_L, -STORE_FINGER),
    to_position("S5 bot finger", S5_L, STORE_FINGER),
    to_position("S6 top rack", S6_L, -STORE_RACK),
    to_position("S6 bot rack", S6_L, STORE_RACK),
    to_position("S6 top finger", S6_L, -STORE_FINGER),
    to_position("S6 bot finger", S6_L, STORE_FINGER),
    to_position("RR top rack", RR_L, -STORE_RACK),
    to_position("RR bot rack", RR_L, STORE_RACK),
    to_position("RR top finger", RR_L, -STORE_FINGER),
    to_position("RR bot finger", RR_L, STORE_FINGER),
];

const FCT_UNMESH: &[FctMove] = &[
    to_position("FP1 A1", P12_L, 0),
    to_position("MP1 A1", P11_L, 0),
    to_position("FP1 A2", P14_L, 0),
    to_position("MP1 A2", P13_L, 0),
    to_position("FP2 A2", P22_L, 0),
    to_position("MP2 A2", P21_L, 0),
    to_position("FP2 A3", P24_L, 0),
    to_position("MP2 A3", P23_L, 0),
    to_position("FP3 A3", P32_L, 0),
    to_position("MP3 A3", P31_L, 0),
    to_position("S1", S1_L, 0),
    to_position("S2", S2_L, 0),
    to_position("S3", S3_L, 0),
    to_position("S4", S4_L, 0),
    to_position("S5", S5_L, 0),
    to_position("S6", S6_L, 0),
    to_position("RR", RR_L, 0),
    to_position("RP1", RP1_L, 0),
    to_position("RP2", RP2_L, 0),
    to_position("RP3", RP3_L, 0),
    to_position("REV2", REV2_L, 0),
    to_position("FC2", FC2_L, 0),
    to_position("REV3", REV3_L, 0),
    to_position("FC3", FC3_L, 0),
];

const FCT_FINGER: &[FctMove] = &[
    to_position("F2", F2_L, -275),
    to_position("F3", F3_L, -275),
    to_position("A1 top", A1_L, 275),
    to_position("A1 bot", A1_L, -275),
    to_position("A2 top", A2_L, 275),
    to_position("A2 bot", A2_L, -275),
    to_position("A3 top", A3_L, 275),
    to_position("A3 bot", A3_L, -275),
];

const FCT_NOFINGER: &[FctMove] = &[
    to_position("F2", F2_L, 0),
    to_position("F3", F3_L, 0),
    to_position("A1", A1_L, 0),
    to_position("A2", A2_L, 0),
    to_position("A3", A3_L, 0),
    to_position("RR", RR_L, 0),
];

const FCT_SHIFT: &[FctMove] = &[
    to_position("MP1 up", MP1_L, 500),
    to_position("MP1 down", MP1_L, 0),
    to_position("MP2 up", MP2_L, 500),
    to_position("MP2 down", MP2_L, 0),
    to_position("MP3 up", MP3_L, 500),
    to_position("MP3 down", MP3_L, 0),
];

// used for searching, but not moving
const FCT_ZERO: &[FctMove] = &[
    to_position("F2", F2_L, NO_MOVE),
    to_position("F3", F3_L, NO_MOVE),
    to_position("A1", A1_L, NO_MOVE),
    to_position("A2", A2_L, NO_MOVE),
    to_position("A3", A3_L, NO_MOVE),
    to_position("S1", S1_L, NO_MOVE),
    to_position("S2", S2_L, NO_MOVE),
    to_position("S3", S3_L, NO_MOVE),
    to_position("S4", S4_L, NO_MOVE),
    to_position("S5", S5_L, NO_MOVE),
    to_position("S6", S6_L, NO_MOVE),
    to_position("RR", RR_L, NO_MOVE),
];

const FCT_SETCARRY: &[FctMove] = &[
    to_position("F2 0", CL2_R, 41),
    to_position("F2 9", CL2_R, 0),
    to_position("F3 0", CL3_R, 41),
    to_position("F3 9", CL3_R, 0),
];

const FCT_CARRYWARN: &[FctMove] = &[
    // .4 inch plus .05 slop from warning lever to lifter
    to_position("F2 up", CW2_L, 450),
    to_position("F2 down", CW2_L, 0),
    to_position("F2 reset", CW2_R, 20),
    to_position("F2 return", CW2_R, 0),
    to_position("F3 up", CW3_L, 450),
    to_position("F3 down", CW3_L, 0),
    to_position("F3 reset", CW3_R, 20),
    to_position("F3 return", CW3_R, 0),
];

const FCT_CARRY: &[FctMove] = &[
    to_position("F2 add", CS2_R, -(DEGREES_PER_DIGIT + EXTRA_DEGREES_FOR_CARRY)),
    to_position("F2 sub", CS2_R, EXTRA_DEGREES_FOR_CARRY),
    to_position("F2 home", CS2_R, 0),
    to_position("F3 add", CS3_R, -(DEGREES_PER_DIGIT + EXTRA_DEGREES_FOR_CARRY)),
    to_position("F3 sub", CS3_R, EXTRA_DEGREES_FOR_CARRY),
    to_position("F3 home", CS3_R, 0),
];

const FCT_KEEPERS: &[FctMove] = &[
    to_position("F2 top", CSK2_R, 0),
    to_position("F2 bottom", CSK2_R, 90),
    to_position("F2 up", CSK2_L, 500),
    to_position("F2 mid", CSK2_L, 450),
    to_position("F2 down", CSK2_L, 0),
    to_position("F3 top", CSK3_R, 0),
    to_position("F3 bottom", CSK3_R, 90),
    to_position("F3 up", CSK3_L, 500),
    to_position("F3 mid", CSK3_L, 450),
    to_position("F3 down", CSK3_L, 0),
];

// ── Predefined scripts ───────────────────────────────────────────────────

pub struct Script {
    pub name: &'static str,
    pub lines: &'static [&'static str],
}

const READ_SCRIPT: &[&str] = &[
    // read s {top|bot} a {top|bot}
    "mesh S#1 #2 finger; mesh RR top rack; mesh RP#3 A#3 #4; mesh MP#3 A#3 #4; unlock A#3 #4; unlock MP#3; unlock FP#3;",
    "giveoff S#1", "giveoff S#1", "giveoff S#1", "giveoff S#1", "giveoff S#1",
    "giveoff S#1", "giveoff S#1", "giveoff S#1", "giveoff S#1",
    "unmesh S#1; unmesh RR; unmesh MP#3 A#3; lock MP#3; lock FP#3; lock A#3 delay;",
    "giveoff S#1; unmesh RP#3;",
];

const READONLY_SCRIPT: &[&str] = &[
    // readonly s {top|bot}
    "mesh S#1 #2 finger; mesh RR top rack; mesh RP2 MP2; unlock MP2; unlock FP2;", // RP-MP-FP is only to create drag
    "giveoff S#1", "giveoff S#1", "giveoff S#1", "giveoff S#1", "giveoff S#1",
    "giveoff S#1", "giveoff S#1", "giveoff S#1", "giveoff S#1",
    "unmesh S#1; unmesh RR; unmesh RP2; lock MP2; lock FP2;",
    "giveoff S#1;",
];

const WRITE_SCRIPT: &[&str] = &[
    // write s {top|bot} a {top|bot}
    "mesh S#1 #2 rack; mesh RR top rack; mesh RP#3 A#3 #4; mesh MP#3 A#3 #4; finger A#3 #4; unlock A#3 #4; unlock MP#3; unlock FP#3;",
    "giveoff A#3", "giveoff A#3", "giveoff A#3", "giveoff A#3", "giveoff A#3",
    "giveoff A#3", "giveoff A#3", "giveoff A#3", "giveoff A#3",
    "nofinger A#3; lock A#3; lock MP#3; lock FP#3;",
    "unmesh S#1; unmesh RR; unmesh MP#3 A#3; giveoff A#3; unmesh RP#3;",
];

const RESTORE_SCRIPT: &[&str] = &[
    // restore the rack after writing
    "mesh RR top finger;",
    "giveoff RR", "giveoff RR", "giveoff RR", "giveoff RR", "giveoff RR",
    "giveoff RR", "giveoff RR", "giveoff RR", "giveoff RR",
    "unmesh RR",
    "giveoff RR",
];

const REVRESTORE_SCRIPT: &[&str] = &[
    // reverse restore the rack after reading
    "mesh RR top finger;",
    "giveoff RR reverse", "giveoff RR reverse", "giveoff RR reverse", "giveoff RR reverse", "giveoff RR reverse",
    "giveoff RR reverse", "giveoff RR reverse", "giveoff RR reverse", "giveoff RR reverse", "giveoff RR reverse",
    "unmesh RR",
];

const REWRITE_SCRIPT: &[&str] = &[
    // rewrite s top|bot (reverse restore after reading, and retain)
    "mesh S#1 #2 rack; mesh RR top finger;",
    "giveoff RR reverse", "giveoff RR reverse", "giveoff RR reverse", "giveoff RR reverse", "giveoff RR reverse",
    "giveoff RR reverse", "giveoff RR reverse", "giveoff RR reverse", "giveoff RR reverse", "giveoff RR reverse",
    "unmesh S#1; unmesh RR",
];

const ZERO_F_SCRIPT: &[&str] = &[
    // zeroF n [calibrate]
    "finger F#1; mesh FC#1;",
    "unlock FP#1; unlock MP#1",
    "do_zero F#1 #2",
    "unmesh FC#1; lock FP#1; lock MP#1",
    "nofinger F#1; carrywarn F#1 reset",
    "giveoff F#1; carrywarn F#1 return",
];

const ZERO_A_SCRIPT: &[&str] = &[
    // zeroA n [top|bot] [calibrate]
    "finger A#1 #2; mesh MP#1 A#1 #2;",
    "unlock A#1 #2; unlock MP#1; unlock FP#1",
    "do_zero A#1 #3",
    "nofinger A#1; unmesh MP#1 A#1",
    "lock A#1; lock MP#1; lock FP#1",
    "giveoff A#1;",
];

const ZERO_S_SCRIPT: &[&str] = &[
    // zeroS n [top|bot] [calibrate]
    "mesh S#1 #2 finger; mesh RP2 MP2; unlock MP2; unlock FP2;", // RP-MP-FP is only to create drag
    "do_zero S#1 #3",
    "unmesh RP2;",
    "lock MP2;",
    "lock FP2 delay;", // while S is still meshed with the rack
    "unmesh S#1;",
    "giveoff S#1",
];

const ZERO_RR_SCRIPT: &[&str] = &[
    // zeroRR [top|bot] [calibrate]
    "mesh RR #1 finger;",
    "do_zero RR #2",
    "unmesh RR",
    "giveoff RR",
];

const HOME_SCRIPT: &[&str] = &[
    // reset everything to initial positions
    "lock A2; lock FP2; lock MP2; nofinger A2; shift MP2 down;",
    "unmesh FC2; unmesh REV2; unmesh MP2 A2; unmesh FP2 A2; unmesh RP2; unmesh S1; unmesh RR;",
    "setcarry F2 9; carry F2 home; carrywarn F2 down;",
    "carrywarn F2 return;",
    "keepers F2 top;",
    "keepers F2 down;",
];

const A2TB_SCRIPT: &[&str] = &[
    // move A2 top to bottom
    "finger A2 top; mesh MP2 A2 top; mesh FP2 A2 bot;",
    "unlock A2; unlock MP2; unlock FP2;",
    "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2",
    "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2",
    "lock A2 top; lock MP2 delay;", // consecutive locking!
    "lock FP2; lock A2 delay; nofinger A2;",
    "unmesh MP2 A2; unmesh FP2 A2; giveoff A2",
];

const A2BF2_SCRIPT: &[&str] = &[
    // move A2 bottom to F2
    "finger A2 bot; mesh FC2; mesh MP2 A2 bot;",
    "unlock A2 bot; unlock FP2 delay; unlock MP2 delay",
    "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2",
    "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2",
    "lock A2; lock MP2 delay;", // consecutive locking
    "lock FP2; nofinger A2; unmesh FC2; unmesh MP2 A2;",
    "giveoff A2",
];

const F2A2T_SCRIPT: &[&str] = &[
    // move F2 to A2 top
    "finger F2; mesh FC2; mesh MP2 A2 top;",
    "unlock FP2; unlock MP2; unlock A2 top;",
    "giveoff F2", "giveoff F2", "giveoff F2", "giveoff F2", "giveoff F2",
    "giveoff F2", "giveoff F2", "giveoff F2", "giveoff F2",
    "lock FP2; lock MP2 delay",
    "lock A2; nofinger F2;",
    "unmesh FC2; unmesh MP2 A2; giveoff F2",
];

const ADD_SCRIPT: &[&str] = &[
    // add the number on A2 top to F2
    // assumes "keepers down" and "keepers top" to start
    "finger A2 top; mesh FC2; mesh MP2 A2 top; keepers F2 mid;",
    "unlock FP2; unlock MP2; unlock A2 delay;",
    "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2",
    "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2",
    "lock A2 top; lock MP2 delay;", // sequential locking
    "lock FP2; lock A2 delay;",
    "nofinger A2; unmesh FC2; unmesh MP2 A2; carrywarn F2 up;", // raise carry sector wheels
    "giveoff A2; keepers F2 bottom time 0 74; keepers F2 up time 75 99;", // support carry sector wheels
    "carrywarn F2 down;", // get wires out of the way and prepare to carry
    "carry F2 add;", // do the carries, which may create additional warns
    "keepers F2 top; carrywarn F2 reset;",
    "keepers F2 down; carrywarn F2 return;", // force carry sectors to disengage
    "setcarry F2 9 time 0 149; carry F2 home;", // restore wires to the carry-9 position
];

const SUB_SCRIPT: &[&str] = &[
    // subtract the number on A2 top from F2
    // assumes "keepers down" and "keepers top" to start
    "finger A2 top; mesh FC2; mesh MP2 A2 top; keepers F2 mid;",
    "unlock FP2; unlock MP2; unlock A2 delay; setcarry F2 0; carry F2 add;",
    "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2",
    "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2",
    "lock A2 top; lock MP2 delay;", // sequential locking
    "lock FP2; lock A2 delay;",
    "nofinger A2; unmesh FC2; unmesh MP2 A2; carrywarn F2 up;",
    "giveoff A2; keepers F2 bottom time 0 74; keepers F2 up time 75 99;", // support carry sector wheels
    "carrywarn F2 down;", // get wires out of the way and prepare to borrow
    "carry F2 sub;", // do the borrows, which may create additional warns
    "keepers F2 top; carrywarn F2 reset;",
    "keepers F2 down; carrywarn F2 return;", // force carry sectors to disengage
    "setcarry F2 9 time 0 149; carry F2 home;", // restore wires to the carry-9 position
];

const FIBONE_SCRIPT: &[&str] = &[
    // compute the next Fibonacci number
    // assumes FIB(n) is on A2 top, FIB(n-1) is on F2, and A2 bot is zero
    // cycle 1: add A2 top to F2 while simultaneously copying it to A2 bot
    "finger A2 top; mesh FC2; mesh MP2 A2 top; mesh FP2 A2 bot; keepers F2 mid;",
    "unlock FP2; unlock MP2; unlock A2 delay;",
    "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2",
    "giveoff A2", "giveoff A2", "giveoff A2", "giveoff A2",
    "lock A2 top; lock MP2 delay;",
    "lock FP2; lock A2 delay;",
    "nofinger A2; unmesh FC2; unmesh MP2 A2; unmesh FP2 A2; carrywarn F2 up;",
    "giveoff A2; keepers F2 bottom time 0 74; keepers F2 up time 75 99;",
    "carrywarn F2 down;",
    "carry F2 add",
    "keepers F2 top; carrywarn F2 reset;",
    "keepers F2 down; carrywarn F2 return;",
    // cycle 2: move F2 to A2 top
    "run f2a2t",
    // cycle 3: move A2 bot to F2
    "run a2bf2;",
    "bell; pause 1000",
];

const FIB_SCRIPT: &[&str] = &[
    // compute the first 19 Fibonacci numbers:
    // 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377, 610, 987, 1597, 2584, 4181, 6765
    "run zeroA 2 top;", // set everything to zero
    "run zeroA 2 bot; run zeroF 2",
    // set A2 top to 1 by moving the finger backwards
    "finger A2 top; unlock A2 top delay;",
    "giveoff A2 reverse;",
    "nofinger A2; lock A2;",
    "giveoff A2;", // restore the finger to its normal position
    "run fibone", "run fibone", "run fibone", "run fibone", "run fibone", "run fibone",
    "run fibone", "run fibone", "run fibone", "run fibone", "run fibone", "run fibone",
    "run fibone", "run fibone", "run fibone", "run fibone", "run fibone", "run fibone", "run fibone",
];

// Longer names come first so prefixes of later names never steal a match
// ("fibone" before "fib", "readonly" before "read").
pub const SCRIPTS: &[Script] = &[
    Script { name: "readonly", lines: READONLY_SCRIPT },
    Script { name: "read", lines: READ_SCRIPT },
    Script { name: "write", lines: WRITE_SCRIPT },
    Script { name: "restore", lines: RESTORE_SCRIPT },
    Script { name: "revrestore", lines: REVRESTORE_SCRIPT },
    Script { name: "rewrite", lines: REWRITE_SCRIPT },
    Script { name: "zeroF", lines: ZERO_F_SCRIPT },
    Script { name: "zeroA", lines: ZERO_A_SCRIPT },
    Script { name: "zeroS", lines: ZERO_S_SCRIPT },
    Script { name: "zeroRR", lines: ZERO_RR_SCRIPT },
    Script { name: "home", lines: HOME_SCRIPT },
    Script { name: "a2tb", lines: A2TB_SCRIPT },
    Script { name: "a2bf2", lines: A2BF2_SCRIPT },
    Script { name: "f2a2t", lines: F2A2T_SCRIPT },
    Script { name: "add", lines: ADD_SCRIPT },
    Script { name: "sub", lines: SUB_SCRIPT },
    Script { name: "fibone", lines: FIBONE_SCRIPT },
    Script { name: "fib", lines: FIB_SCRIPT },
];

// leading keywords the boot-time script check accepts
const COMMAND_KEYWORDS: &[&str] = &[
    "rot", "lift", "lock1", "lock", "unlock", "mesh", "unmesh", "finger", "nofinger",
    "shift", "do_zero", "giveoff", "setcarry", "carrywarn", "carry", "keepers", "test",
    "repeat", "timeunit", "tu", "debug", "on", "off", "home", "pause", "reset",
    "switches", "motors", "state", "calibrate", "bell", "restart", "help", "?",
    "run", "step",
];

const HELP: &[&str] = &[
    "rot <axle> <deg>        queue a rotation, -2160 to 2160 degrees",
    "lift <axle> <mils>      queue a lift, -1500 to 1500 mils",
    "lock|unlock|lock1 <kw>  move a lock to its named position",
    "mesh|unmesh <kw>        engage or park a connector or pinion",
    "finger|nofinger <kw>    engage or park a digit-wheel finger",
    "shift <MPn> up|down     shift a movable long pinion",
    "giveoff <axle> [reverse] rotate one digit position",
    "setcarry|carry|carrywarn|keepers <kw>  carry mechanism moves",
    "do_zero <axle> [calibrate]  rotate an axle to its index switch",
    "calibrate <axle> <deg>  store a zero offset, -360 to 360",
    "repeat <n> <command>    re-execute a command n times",
    "timeunit [<msec>]       show or set the time unit, 10 to 60000",
    "tu                      set the time unit to 157 msec",
    "debug [<n>]             show or set debug verbosity, 0 to 99",
    "on|off [<axle>|all]     enable or disable motors",
    "home                    run the home script",
    "pause [<msec>]          drain the queue, then wait",
    "reset                   clear queued moves and positions",
    "switches|motors|state   diagnostic reports",
    "test                    echo input until ESC",
    "bell / restart / help / ?",
    "<script> [args...], run <script>, or step <script>  launch a script",
];
