//! CPU thread scheduling and frequency control.
//!
//! The scheduler owns the thread that steps the CPU in cycle batches.
//! A state machine over [`CpuState`] decides what each batch does:
//!
//! ```text
//! Run      -> runloop(RunningStart)   -> {Stop, Next, Step, Reset, ResetRun, Exit}
//! Next     -> runloop(SingleStepOver) -> ...
//! Step     -> runloop(SingleStepInto) -> ...
//! Stop     -> idleloop                -> ...
//! Reset    -> reset, resume previous state
//! ResetRun -> reset                   -> Run
//! Invalid  -> idleloop, previous state becomes Run
//! Exit     -> terminal
//! ```
//!
//! Other threads interact only through [`request_new_state`],
//! [`sync_exec`] and the getters; everything they touch is behind its
//! own mutex or atomic. A 1 ms ticker thread interrupts long batches,
//! drives the throttle and derives the once-per-second housekeeping
//! (measured frequency, RTC tick, status snapshot).
//!
//! [`request_new_state`]: Scheduler::request_new_state
//! [`sync_exec`]: Scheduler::sync_exec

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::cpu::{CpuState, CpuStatus, InterruptStatus, RunMode, ScheduledCpu};
use crate::iohub::IoHub;

/// Timer period driving batch scheduling.
pub const TIME_BASE: Duration = Duration::from_millis(1);

// Deferred-work bits, mirrored into an atomic so the CPU thread can
// poll them without locking.
const DO_TIMER: u8 = 0x01;
const DO_SET_STATUS: u8 = 0x02;
const DO_SYNCEXEC: u8 = 0x04;

/// A callable deferred onto the CPU thread.
pub type SyncCall = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
struct FrequencyControl {
    /// Target frequency in MHz; 0 disables throttling.
    target: f32,
    /// Last measured frequency in MHz.
    measured: f32,
    /// Timestamp of the previous throttle adjustment.
    time0: Option<Instant>,
    /// Cycle count at the previous one-second measurement.
    cycles0: u64,
}

/// Owner of the CPU thread.
pub struct Scheduler {
    cpu: Arc<dyn ScheduledCpu>,
    iohub: Arc<IoHub>,

    events: AtomicU8,
    user_input: Mutex<Option<CpuState>>,
    tick: Condvar,
    commands: Mutex<Vec<SyncCall>>,
    status: Mutex<Option<CpuStatus>>,
    irq_status: Mutex<InterruptStatus>,
    state: Mutex<CpuState>,
    finished: AtomicBool,
    total_cycles: AtomicU64,
    freq: Mutex<FrequencyControl>,

    cpu_thread: Mutex<Option<JoinHandle<()>>>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(cpu: Arc<dyn ScheduledCpu>, iohub: Arc<IoHub>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            cpu,
            iohub,
            events: AtomicU8::new(0),
            user_input: Mutex::new(None),
            tick: Condvar::new(),
            commands: Mutex::new(Vec::new()),
            status: Mutex::new(None),
            irq_status: Mutex::new(InterruptStatus::default()),
            state: Mutex::new(CpuState::Run),
            finished: AtomicBool::new(false),
            total_cycles: AtomicU64::new(0),
            freq: Mutex::new(FrequencyControl {
                target: 0.0,
                measured: 0.0,
                time0: None,
                cycles0: 0,
            }),
            cpu_thread: Mutex::new(None),
            timer_thread: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Spawn the CPU thread and the 1 ms ticker.
    pub fn start(&self) {
        let ticker = self.self_ref.upgrade().expect("scheduler inside an Arc");
        *self.timer_thread.lock().expect("timer thread slot") =
            Some(std::thread::spawn(move || {
                while !ticker.finished.load(Ordering::Acquire) {
                    std::thread::sleep(TIME_BASE);
                    ticker.timer_elapsed();
                }
            }));

        let worker = self.self_ref.upgrade().expect("scheduler inside an Arc");
        *self.cpu_thread.lock().expect("cpu thread slot") = Some(std::thread::spawn(move || {
            worker.statemachine(CpuState::Run);
        }));
    }

    /// Wait for the CPU thread (and ticker) to finish.
    pub fn join(&self) {
        if let Some(handle) = self.cpu_thread.lock().expect("cpu thread slot").take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.timer_thread.lock().expect("timer thread slot").take() {
            let _ = handle.join();
        }
    }

    // Host-facing surface.

    /// Ask the state machine to move to `state`. The CPU thread
    /// observes the request before the next instruction boundary.
    pub fn request_new_state(&self, state: CpuState) {
        *self.user_input.lock().expect("user input") = Some(state);
        self.cpu.exit_run();
        self.tick.notify_all();
    }

    /// Final state: the CPU thread has left its loop for good.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Defer `call` onto the CPU thread; it runs at the next
    /// scheduling boundary, before further instructions retire.
    pub fn sync_exec(&self, call: SyncCall) {
        self.commands.lock().expect("command inbox").push(call);
        self.events.fetch_or(DO_SYNCEXEC, Ordering::AcqRel);
        self.cpu.exit_run();
        self.tick.notify_all();
    }

    /// Consume the published status snapshot, if any.
    pub fn get_status(&self) -> Option<CpuStatus> {
        self.status.lock().expect("status slot").take()
    }

    pub fn get_interrupt_status(&self) -> InterruptStatus {
        *self.irq_status.lock().expect("irq status")
    }

    pub fn get_total_cycles(&self) -> u64 {
        self.total_cycles.load(Ordering::Acquire)
    }

    /// Target frequency while throttled, measured frequency otherwise.
    pub fn get_frequency(&self) -> f32 {
        let freq = self.freq.lock().expect("frequency control");
        if freq.target > 0.0 {
            freq.target
        } else {
            freq.measured
        }
    }

    /// Set the target frequency in MHz; 0 or below runs unthrottled.
    pub fn set_frequency(&self, target: f32) {
        {
            let mut freq = self.freq.lock().expect("frequency control");
            if target <= 0.0 {
                freq.target = 0.0;
            } else {
                freq.target = target;
                freq.time0 = None;
            }
        }
        self.cpu.set_required_cyclecount(u64::MAX);
        debug!("target frequency set to {:.2} MHz", target.max(0.0));
    }

    // CPU-thread internals.

    fn current_state(&self) -> CpuState {
        *self.state.lock().expect("state")
    }

    fn set_state(&self, state: CpuState) {
        *self.state.lock().expect("state") = state;
    }

    fn take_user_input(&self) -> Option<CpuState> {
        *self.user_input.lock().expect("user input")
    }

    fn timer_elapsed(&self) {
        self.events.fetch_or(DO_TIMER, Ordering::AcqRel);
        self.cpu.exit_run();
        self.tick.notify_all();
    }

    /// Block until the next timer tick (or an external wake-up).
    fn suspend(&self) {
        let guard = self.user_input.lock().expect("user input");
        let _ = self
            .tick
            .wait_timeout(guard, 2 * TIME_BASE)
            .expect("tick wait");
    }

    fn statemachine(&self, initial_state: CpuState) {
        let mut prev_state = initial_state;
        let mut second_origin = Instant::now();
        self.set_state(initial_state);

        loop {
            let state = self.current_state();
            if state == CpuState::Exit {
                break;
            }
            *self.user_input.lock().expect("user input") = None;

            let next = match state {
                CpuState::Run => {
                    prev_state = CpuState::Run;
                    self.runloop(RunMode::RunningStart, &mut second_origin)
                }
                CpuState::Next => self.runloop(RunMode::SingleStepOver, &mut second_origin),
                CpuState::Step => self.runloop(RunMode::SingleStepInto, &mut second_origin),
                CpuState::Stop => {
                    prev_state = CpuState::Stop;
                    self.idleloop(&mut second_origin)
                }
                CpuState::Reset => {
                    self.do_reset();
                    prev_state
                }
                CpuState::ResetRun => {
                    self.do_reset();
                    CpuState::Run
                }
                CpuState::Invalid => {
                    prev_state = CpuState::Run;
                    self.idleloop(&mut second_origin)
                }
                CpuState::Suspend | CpuState::Schedule | CpuState::Exit => {
                    // Batch results never become machine states.
                    warn!("state machine reached {:?}, forcing Run", state);
                    CpuState::Run
                }
            };
            self.set_state(next);

            if self.iohub.is_display_attached() {
                self.events.fetch_or(DO_SET_STATUS, Ordering::AcqRel);
            }
        }

        self.finished.store(true, Ordering::Release);
        debug!("cpu thread finished");
    }

    /// Issue cycle batches until the CPU returns a terminal state or a
    /// user request pre-empts it.
    fn runloop(&self, mut mode: RunMode, second_origin: &mut Instant) -> CpuState {
        loop {
            let mut new_state = self.cpu.run(mode);

            if new_state == CpuState::Suspend {
                // Budget exhausted: sleep until the next timer tick.
                self.suspend();
                new_state = CpuState::Schedule;
            }

            self.process_events(second_origin);

            if let Some(user_input) = self.take_user_input() {
                return user_input;
            }

            mode = RunMode::RunningContinue;
            if new_state != CpuState::Schedule {
                return new_state;
            }
        }
    }

    /// Wait in Stop/Invalid until the user requests something else.
    fn idleloop(&self, second_origin: &mut Instant) -> CpuState {
        loop {
            match self.take_user_input() {
                None | Some(CpuState::Stop) => {}
                Some(state) => return state,
            }
            self.process_events(second_origin);
            self.suspend();

            // Invalid is only a transient state to refresh the view.
            if self.current_state() == CpuState::Invalid {
                return CpuState::Stop;
            }
        }
    }

    fn process_events(&self, second_origin: &mut Instant) {
        let events = self.events.load(Ordering::Acquire);
        if events == 0 {
            return;
        }

        if events & DO_TIMER != 0 {
            *self.irq_status.lock().expect("irq status") = self.cpu.get_interrupt_status();
            self.total_cycles
                .store(self.cpu.get_cycles(true), Ordering::Release);

            let now = Instant::now();
            self.frequency_control(now);

            if now.duration_since(*second_origin) >= Duration::from_secs(1) {
                self.update_frequency();
                self.events.fetch_or(DO_SET_STATUS, Ordering::AcqRel);
                self.iohub.update_1_second();
                *second_origin += Duration::from_secs(1);
            }

            self.events.fetch_and(!DO_TIMER, Ordering::AcqRel);
        }

        if events & DO_SET_STATUS != 0 {
            let mut slot = self.status.lock().expect("status slot");
            if self.iohub.is_display_attached() && slot.is_none() {
                let freq = self.freq.lock().expect("frequency control");
                *slot = Some(CpuStatus {
                    registers: self.cpu.get_registers(),
                    total_cycles: self.total_cycles.load(Ordering::Acquire),
                    frequency: freq.measured,
                    state: self.current_state(),
                });
                self.events.fetch_and(!DO_SET_STATUS, Ordering::AcqRel);
            }
        }

        if events & DO_SYNCEXEC != 0 {
            self.execute_deferred();
        }
    }

    /// Throttle: grant the next batch as many cycles as the elapsed
    /// wall-clock time allows at the target frequency.
    fn frequency_control(&self, now: Instant) {
        let mut freq = self.freq.lock().expect("frequency control");
        if freq.target <= 0.0 {
            return;
        }
        let required = match freq.time0 {
            None => TIME_BASE.as_micros() as f64 * freq.target as f64,
            Some(time0) => now.duration_since(time0).as_micros() as f64 * freq.target as f64,
        };
        freq.time0 = Some(now);
        drop(freq);
        self.cpu.set_required_cyclecount(required as u64);
    }

    /// Once per second: derive the measured MHz from the cycle delta.
    fn update_frequency(&self) {
        let cycles = self.cpu.get_cycles(false);
        let mut freq = self.freq.lock().expect("frequency control");
        freq.measured = (cycles.saturating_sub(freq.cycles0)) as f32 / 1_000_000.0;
        freq.cycles0 = cycles;
    }

    fn execute_deferred(&self) {
        let calls: Vec<SyncCall> = {
            let mut inbox = self.commands.lock().expect("command inbox");
            self.events.fetch_and(!DO_SYNCEXEC, Ordering::AcqRel);
            std::mem::take(&mut *inbox)
        };
        for call in calls {
            call();
        }
    }

    fn do_reset(&self) {
        self.cpu.do_reset();
        self.total_cycles.store(0, Ordering::Release);
        self.freq.lock().expect("frequency control").cycles0 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuRegisters;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Scripted CPU: burns a fixed cycle count per batch and suspends.
    struct FakeCpu {
        cycles: AtomicU64,
        resets: AtomicU32,
        irqs: AtomicU32,
    }

    impl FakeCpu {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                cycles: AtomicU64::new(0),
                resets: AtomicU32::new(0),
                irqs: AtomicU32::new(0),
            })
        }
    }

    impl ScheduledCpu for FakeCpu {
        fn run(&self, _mode: RunMode) -> CpuState {
            let _ = self.cycles.fetch_add(100, Ordering::SeqCst);
            CpuState::Suspend
        }

        fn exit_run(&self) {}

        fn set_irq(&self) {
            let _ = self.irqs.fetch_add(1, Ordering::SeqCst);
        }

        fn set_firq(&self) {}
        fn set_nmi(&self) {}

        fn do_reset(&self) {
            let _ = self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn get_cycles(&self, _reset: bool) -> u64 {
            self.cycles.load(Ordering::SeqCst)
        }

        fn set_required_cyclecount(&self, _count: u64) {}

        fn get_registers(&self) -> CpuRegisters {
            CpuRegisters::default()
        }

        fn get_interrupt_status(&self) -> InterruptStatus {
            InterruptStatus::default()
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_exit_from_run_is_bounded() {
        let cpu = FakeCpu::new();
        let scheduler = Scheduler::new(cpu, IoHub::new());
        scheduler.start();

        scheduler.request_new_state(CpuState::Exit);
        assert!(
            wait_until(Duration::from_secs(2), || scheduler.is_finished()),
            "scheduler must exit promptly"
        );
        scheduler.join();
    }

    #[test]
    fn test_exit_from_stop_is_bounded() {
        let cpu = FakeCpu::new();
        let scheduler = Scheduler::new(cpu, IoHub::new());
        scheduler.start();

        scheduler.request_new_state(CpuState::Stop);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!scheduler.is_finished());

        scheduler.request_new_state(CpuState::Exit);
        assert!(wait_until(Duration::from_secs(2), || scheduler.is_finished()));
        scheduler.join();
    }

    #[test]
    fn test_reset_run_resets_cycle_count() {
        let cpu = FakeCpu::new();
        let scheduler = Scheduler::new(Arc::clone(&cpu) as Arc<dyn ScheduledCpu>, IoHub::new());
        scheduler.start();

        scheduler.request_new_state(CpuState::ResetRun);
        assert!(wait_until(Duration::from_secs(2), || {
            cpu.resets.load(Ordering::SeqCst) > 0
        }));

        scheduler.request_new_state(CpuState::Exit);
        assert!(wait_until(Duration::from_secs(2), || scheduler.is_finished()));
        scheduler.join();
    }

    #[test]
    fn test_sync_exec_runs_on_cpu_thread() {
        let cpu = FakeCpu::new();
        let scheduler = Scheduler::new(cpu, IoHub::new());
        scheduler.start();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        scheduler.sync_exec(Box::new(move || flag.store(true, Ordering::SeqCst)));

        assert!(wait_until(Duration::from_secs(2), || ran
            .load(Ordering::SeqCst)));

        scheduler.request_new_state(CpuState::Exit);
        assert!(wait_until(Duration::from_secs(2), || scheduler.is_finished()));
        scheduler.join();
    }

    #[test]
    fn test_total_cycles_advance_while_running() {
        let cpu = FakeCpu::new();
        let scheduler = Scheduler::new(cpu, IoHub::new());
        scheduler.start();

        assert!(wait_until(Duration::from_secs(2), || {
            scheduler.get_total_cycles() > 0
        }));

        scheduler.request_new_state(CpuState::Exit);
        assert!(wait_until(Duration::from_secs(2), || scheduler.is_finished()));
        scheduler.join();
    }

    #[test]
    fn test_frequency_reporting() {
        let cpu = FakeCpu::new();
        let scheduler = Scheduler::new(cpu, IoHub::new());

        assert_eq!(scheduler.get_frequency(), 0.0);
        scheduler.set_frequency(2.0);
        assert_eq!(scheduler.get_frequency(), 2.0);
        scheduler.set_frequency(0.0);
        assert_eq!(scheduler.get_frequency(), 0.0);
    }
}
