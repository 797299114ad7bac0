//! Input/output fan-in for the emulated machine.
//!
//! The hub owns the host-facing input queues: parallel keyboard, serial
//! keyboard and joystick state, each behind its own mutex so producers
//! on the host thread never contend with one another. Bytes put into
//! the parallel queue raise the `CA1` control line of the keyboard PIA,
//! but only on the empty-to-non-empty edge, and the raise itself is
//! deferred to the CPU thread through the scheduler's sync-exec inbox
//! so the CPU observes it between instructions.
//!
//! The hub also fans the scheduler's one-second tick out to the
//! real-time clock and tracks whether output goes to the terminal or
//! the graphic display.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;

use crate::scheduler::Scheduler;

/// Control lines of a peripheral interface adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLine {
    Ca1,
    Cb1,
}

/// A device with interrupt-capable control lines (the keyboard PIA).
pub trait ControlLineTarget: Send + Sync {
    /// Signal an active transition on `line`.
    fn active_transition(&self, line: ControlLine);
}

/// A device fed by the one-second tick (the real-time clock).
pub trait ClockDevice: Send + Sync {
    fn update_1_second(&self);
}

/// Where terminal output of the machine goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Terminal,
    Graphic,
}

/// Joystick sample: relative movement plus button mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoystickState {
    pub delta_x: i32,
    pub delta_y: i32,
    pub button_mask: u32,
}

#[derive(Debug, Default)]
struct JoystickSlot {
    state: JoystickState,
    new_values: bool,
}

/// Thread-safe input hub shared by the host and CPU threads.
#[derive(Default)]
pub struct IoHub {
    parallel: Mutex<VecDeque<u8>>,
    serial: Mutex<VecDeque<u8>>,
    joystick: Mutex<JoystickSlot>,
    scheduler: Mutex<Weak<Scheduler>>,
    keyboard_pia: Mutex<Option<Arc<dyn ControlLineTarget>>>,
    rtc: Mutex<Option<Arc<dyn ClockDevice>>>,
    display_attached: AtomicBool,
    output_mode: Mutex<OutputMode>,
}

impl IoHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wire the scheduler used to defer control-line raises onto the
    /// CPU thread.
    pub fn set_scheduler(&self, scheduler: &Arc<Scheduler>) {
        *self.scheduler.lock().expect("scheduler slot") = Arc::downgrade(scheduler);
    }

    pub fn set_keyboard_pia(&self, pia: Arc<dyn ControlLineTarget>) {
        *self.keyboard_pia.lock().expect("pia slot") = Some(pia);
    }

    pub fn set_rtc(&self, rtc: Arc<dyn ClockDevice>) {
        *self.rtc.lock().expect("rtc slot") = Some(rtc);
    }

    /// Raise CA1 on the CPU thread, or inline when no scheduler is
    /// attached (single-threaded use).
    fn raise_ca1(&self) {
        let Some(pia) = self.keyboard_pia.lock().expect("pia slot").clone() else {
            return;
        };
        match self.scheduler.lock().expect("scheduler slot").upgrade() {
            Some(scheduler) => {
                scheduler.sync_exec(Box::new(move || pia.active_transition(ControlLine::Ca1)));
            }
            None => pia.active_transition(ControlLine::Ca1),
        }
    }

    // Parallel keyboard path.

    pub fn reset_parallel(&self) {
        self.parallel.lock().expect("parallel queue").clear();
    }

    /// Queue a key for the parallel keyboard port. The empty-to-filled
    /// edge raises CA1 so the CPU sees exactly one interrupt per
    /// non-empty spell.
    pub fn put_char_parallel(&self, key: u8) {
        let was_empty = {
            let mut queue = self.parallel.lock().expect("parallel queue");
            let was_empty = queue.is_empty();
            queue.push_back(key);
            was_empty
        };
        if was_empty {
            self.raise_ca1();
        }
    }

    pub fn has_key_parallel(&self) -> bool {
        !self.parallel.lock().expect("parallel queue").is_empty()
    }

    /// Pop the next parallel key. While more keys remain, CA1 is raised
    /// again so the CPU keeps servicing the queue.
    pub fn read_char_parallel(&self) -> u8 {
        let (key, more) = {
            let mut queue = self.parallel.lock().expect("parallel queue");
            let key = queue.pop_front().unwrap_or(0);
            (key, !queue.is_empty())
        };
        if more {
            self.raise_ca1();
        }
        key
    }

    /// Read the next parallel key without consuming it.
    pub fn peek_char_parallel(&self) -> u8 {
        self.parallel
            .lock()
            .expect("parallel queue")
            .front()
            .copied()
            .unwrap_or(0)
    }

    // Serial keyboard path.

    pub fn reset_serial(&self) {
        self.serial.lock().expect("serial queue").clear();
    }

    pub fn put_char_serial(&self, key: u8) {
        self.serial.lock().expect("serial queue").push_back(key);
    }

    pub fn has_key_serial(&self) -> bool {
        !self.serial.lock().expect("serial queue").is_empty()
    }

    pub fn read_char_serial(&self) -> u8 {
        self.serial
            .lock()
            .expect("serial queue")
            .pop_front()
            .unwrap_or(0)
    }

    pub fn peek_char_serial(&self) -> u8 {
        self.serial
            .lock()
            .expect("serial queue")
            .front()
            .copied()
            .unwrap_or(0)
    }

    // Joystick path.

    pub fn reset_joystick(&self) {
        *self.joystick.lock().expect("joystick slot") = JoystickSlot::default();
    }

    /// Record a movement sample and mark it fresh.
    pub fn put_joystick(&self, delta_x: i32, delta_y: i32) {
        let mut slot = self.joystick.lock().expect("joystick slot");
        slot.state.delta_x = delta_x;
        slot.state.delta_y = delta_y;
        slot.new_values = true;
    }

    /// Update the button mask without marking the sample fresh.
    pub fn put_joystick_buttons(&self, button_mask: u32) {
        self.joystick.lock().expect("joystick slot").state.button_mask = button_mask;
    }

    /// Fetch-and-clear: returns the sample only when new movement
    /// arrived since the last call.
    pub fn get_joystick(&self) -> Option<JoystickState> {
        let mut slot = self.joystick.lock().expect("joystick slot");
        let fresh = slot.new_values;
        slot.new_values = false;
        fresh.then_some(slot.state)
    }

    // Output routing.

    pub fn set_display_attached(&self, attached: bool) {
        self.display_attached.store(attached, Ordering::Release);
    }

    pub fn is_display_attached(&self) -> bool {
        self.display_attached.load(Ordering::Acquire)
    }

    pub fn output_mode(&self) -> OutputMode {
        *self.output_mode.lock().expect("output mode")
    }

    pub fn output_to_terminal(&self) {
        *self.output_mode.lock().expect("output mode") = OutputMode::Terminal;
    }

    /// Switch to the graphic display; fails when none is attached.
    pub fn output_to_graphic(&self) -> bool {
        if !self.is_display_attached() {
            return false;
        }
        *self.output_mode.lock().expect("output mode") = OutputMode::Graphic;
        true
    }

    /// One-second tick fan-out, called by the scheduler.
    pub fn update_1_second(&self) {
        if let Some(rtc) = self.rtc.lock().expect("rtc slot").clone() {
            rtc.update_1_second();
        }
        debug!("one second tick");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingPia {
        ca1_raises: AtomicUsize,
    }

    impl ControlLineTarget for CountingPia {
        fn active_transition(&self, line: ControlLine) {
            assert_eq!(line, ControlLine::Ca1);
            let _ = self.ca1_raises.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_parallel_queue_raises_ca1_on_edge_only() {
        let hub = IoHub::new();
        let pia = Arc::new(CountingPia::default());
        hub.set_keyboard_pia(pia.clone());

        hub.put_char_parallel(b'A');
        hub.put_char_parallel(b'B');
        hub.put_char_parallel(b'C');
        // Only the empty->non-empty edge raises the line.
        assert_eq!(pia.ca1_raises.load(Ordering::SeqCst), 1);

        assert_eq!(hub.read_char_parallel(), b'A');
        assert_eq!(pia.ca1_raises.load(Ordering::SeqCst), 2);
        assert_eq!(hub.read_char_parallel(), b'B');
        assert_eq!(pia.ca1_raises.load(Ordering::SeqCst), 3);
        // Reading the last byte leaves the queue empty: no re-raise.
        assert_eq!(hub.read_char_parallel(), b'C');
        assert_eq!(pia.ca1_raises.load(Ordering::SeqCst), 3);
        assert_eq!(hub.read_char_parallel(), 0);
    }

    #[test]
    fn test_peek_leaves_queue_untouched() {
        let hub = IoHub::new();
        hub.put_char_parallel(b'X');
        assert_eq!(hub.peek_char_parallel(), b'X');
        assert!(hub.has_key_parallel());
        assert_eq!(hub.read_char_parallel(), b'X');
        assert!(!hub.has_key_parallel());
    }

    #[test]
    fn test_serial_queue_fifo() {
        let hub = IoHub::new();
        hub.put_char_serial(1);
        hub.put_char_serial(2);
        assert_eq!(hub.peek_char_serial(), 1);
        assert_eq!(hub.read_char_serial(), 1);
        assert_eq!(hub.read_char_serial(), 2);
        assert_eq!(hub.read_char_serial(), 0);
    }

    #[test]
    fn test_joystick_fetch_and_clear() {
        let hub = IoHub::new();
        assert_eq!(hub.get_joystick(), None);

        hub.put_joystick(3, -4);
        hub.put_joystick_buttons(0b101);
        let state = hub.get_joystick().expect("fresh sample");
        assert_eq!(state.delta_x, 3);
        assert_eq!(state.delta_y, -4);
        assert_eq!(state.button_mask, 0b101);

        // Consumed: second read sees nothing new.
        assert_eq!(hub.get_joystick(), None);
        // Button-only updates do not mark the sample fresh.
        hub.put_joystick_buttons(0);
        assert_eq!(hub.get_joystick(), None);
    }

    #[test]
    fn test_output_mode_switching() {
        let hub = IoHub::new();
        assert_eq!(hub.output_mode(), OutputMode::Terminal);
        assert!(!hub.output_to_graphic(), "no display attached");

        hub.set_display_attached(true);
        assert!(hub.output_to_graphic());
        assert_eq!(hub.output_mode(), OutputMode::Graphic);
        hub.output_to_terminal();
        assert_eq!(hub.output_mode(), OutputMode::Terminal);
    }
}
