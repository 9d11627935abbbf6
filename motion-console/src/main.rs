//! Console front end for the Analytical Engine motion engine, running on
//! the Raspberry Pi that drives the daisy-chained controller boards. The
//! engine itself lives in `motion-core`; this binary wires its abstract
//! pin roles to real GPIO, paces microsecond delays with a spin sleeper,
//! feeds console keystrokes in, and keeps the calibration record in a
//! JSON file next to the binary.

use motion_core::{CalibrationConfig, ConfigStore, Engine, Hardware, Pin, PIN_COUNT};
use rppal::gpio::{Gpio, InputPin, OutputPin};
use spin_sleep::SpinSleeper;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

// BCM numbers for each abstract pin role; edit to match the loom of the
// actual installation.
const OUTPUT_PINS: &[(Pin, u8)] = &[
    (Pin::BdSel2A, 7),
    (Pin::BdSel2B, 8),
    (Pin::BdSel3A, 3),
    (Pin::BdSel3B, 4),
    (Pin::BdSel3C, 5),
    (Pin::MuxA, 17),
    (Pin::MuxB, 16),
    (Pin::MuxC, 15),
    (Pin::MuxD, 14),
    (Pin::StepNotEnb, 19),
    (Pin::MotorEnb, 22),
    (Pin::MotorDir, 21),
    (Pin::FanOn, 11),
];
const MOTOR_FAULT_PIN: u8 = 20;
const SWITCH_INPUT_PIN: u8 = 23;

struct PiHardware {
    outputs: Vec<Option<OutputPin>>, // indexed by Pin as usize
    fault: InputPin,
    switch_input: InputPin,
    started: Instant,
    sleeper: SpinSleeper,
    keys: Receiver<u8>,
}

impl PiHardware {
    fn new(gpio: &Gpio, keys: Receiver<u8>) -> Result<Self, rppal::gpio::Error> {
        let mut outputs: Vec<Option<OutputPin>> = (0..PIN_COUNT).map(|_| None).collect();
        for &(pin, bcm) in OUTPUT_PINS {
            outputs[pin as usize] = Some(gpio.get(bcm)?.into_output_high());
        }
        Ok(PiHardware {
            outputs,
            fault: gpio.get(MOTOR_FAULT_PIN)?.into_input_pullup(),
            switch_input: gpio.get(SWITCH_INPUT_PIN)?.into_input_pullup(),
            started: Instant::now(),
            sleeper: SpinSleeper::default(),
            keys,
        })
    }
}

impl Hardware for PiHardware {
    fn set_pin(&mut self, pin: Pin, high: bool) {
        if let Some(out) = self.outputs[pin as usize].as_mut() {
            if high {
                out.set_high();
            } else {
                out.set_low();
            }
        }
    }

    fn read_pin(&mut self, pin: Pin) -> bool {
        match pin {
            Pin::MotorFault => self.fault.is_high(),
            Pin::SwitchInput => self.switch_input.is_high(),
            _ => self.outputs[pin as usize]
                .as_ref()
                .map(|p| p.is_set_high())
                .unwrap_or(false),
        }
    }

    fn delay_us(&mut self, usec: u64) {
        self.sleeper.sleep(Duration::from_micros(usec));
    }

    fn micros(&mut self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    fn poll_key(&mut self) -> Option<u8> {
        self.keys.try_recv().ok()
    }

    fn flush_input(&mut self) {
        while self.keys.try_recv().is_ok() {}
    }
}

/// Calibration record as a JSON file, written atomically so a power cut
/// mid-save leaves the old record intact.
struct FileStore {
    path: PathBuf,
}

impl ConfigStore for FileStore {
    fn load(&mut self) -> Option<CalibrationConfig> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn save(&mut self, config: &CalibrationConfig) {
        let tmp = self.path.with_extension("tmp");
        let Ok(text) = serde_json::to_string_pretty(config) else { return };
        let written = std::fs::write(&tmp, text).and_then(|_| std::fs::rename(&tmp, &self.path));
        if let Err(err) = written {
            eprintln!("could not save the calibration record to {}: {}", self.path.display(), err);
        }
    }
}

/// Feed stdin into a byte channel so the engine can poll single
/// keystrokes (ESC, DEL, step-mode keys) while movements run.
fn spawn_key_reader() -> Receiver<u8> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { return };
            for byte in line.bytes() {
                if tx.send(byte).is_err() {
                    return;
                }
            }
            if tx.send(b'\n').is_err() {
                return;
            }
        }
    });
    rx
}

/// Assemble one command line from the key channel. A lone backspace on an
/// empty line becomes the history-recall sentinel the engine understands.
fn read_line(keys: &Receiver<u8>) -> Option<String> {
    let mut line = String::new();
    loop {
        match keys.recv() {
            Ok(b'\n') | Ok(b'\r') => return Some(line),
            Ok(c @ (0x08 | 0x7f)) => {
                if line.pop().is_none() && c == 0x08 {
                    return Some("\u{8}".to_string());
                }
            }
            Ok(byte) => line.push(byte as char),
            Err(_) => return None, // console closed
        }
    }
}

fn restart() -> ! {
    use std::os::unix::process::CommandExt;
    if let Ok(exe) = std::env::current_exe() {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let err = std::process::Command::new(exe).args(args).exec();
        eprintln!("restart failed: {}", err);
    }
    std::process::exit(1);
}

fn main() -> Result<(), rppal::gpio::Error> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "calibration.json".to_string());
    let gpio = Gpio::new()?;
    let hw = PiHardware::new(&gpio, spawn_key_reader())?;
    let store = FileStore { path: PathBuf::from(config_path) };
    let mut engine = Engine::new(hw, store);
    engine.boot();
    loop {
        print!(">");
        std::io::stdout().flush().ok();
        let Some(line) = read_line(&engine.hw.keys) else { break };
        engine.handle_line(&line);
        if engine.restart_requested {
            restart();
        }
    }
    Ok(())
}
