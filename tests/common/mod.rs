//! Shared helpers for the integration tests.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use eurocom_emu::cpu::{
    CpuRegisters, CpuState, InterruptStatus, RunMode, ScheduledCpu,
};
use eurocom_emu::{CommandChannel, FloppyController, IoHub, Scheduler};
use tempfile::TempDir;

/// Scripted CPU core: burns a fixed cycle count per batch, then asks
/// the scheduler to suspend until the next tick.
#[derive(Default)]
pub struct FakeCpu {
    pub cycles: AtomicU64,
    pub required: AtomicU64,
    pub irqs: AtomicU32,
    pub firqs: AtomicU32,
    pub nmis: AtomicU32,
    pub resets: AtomicU32,
}

impl FakeCpu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ScheduledCpu for FakeCpu {
    fn run(&self, _mode: RunMode) -> CpuState {
        let _ = self.cycles.fetch_add(1000, Ordering::SeqCst);
        CpuState::Suspend
    }

    fn exit_run(&self) {}

    fn set_irq(&self) {
        let _ = self.irqs.fetch_add(1, Ordering::SeqCst);
    }

    fn set_firq(&self) {
        let _ = self.firqs.fetch_add(1, Ordering::SeqCst);
    }

    fn set_nmi(&self) {
        let _ = self.nmis.fetch_add(1, Ordering::SeqCst);
    }

    fn do_reset(&self) {
        let _ = self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn get_cycles(&self, _reset: bool) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    fn set_required_cyclecount(&self, count: u64) {
        self.required.store(count, Ordering::SeqCst);
    }

    fn get_registers(&self) -> CpuRegisters {
        CpuRegisters::default()
    }

    fn get_interrupt_status(&self) -> InterruptStatus {
        InterruptStatus {
            irq: self.irqs.load(Ordering::SeqCst),
            firq: self.firqs.load(Ordering::SeqCst),
            nmi: self.nmis.load(Ordering::SeqCst),
            reset: self.resets.load(Ordering::SeqCst),
        }
    }
}

/// A complete host-side machine wiring around a scratch disk directory.
pub struct Machine {
    pub cpu: Arc<FakeCpu>,
    pub iohub: Arc<IoHub>,
    pub scheduler: Arc<Scheduler>,
    pub fdc: Arc<Mutex<FloppyController>>,
    pub channel: CommandChannel,
    pub disk_dir: TempDir,
}

pub fn machine() -> Machine {
    let disk_dir = tempfile::tempdir().expect("scratch directory");
    let cpu = FakeCpu::new();
    let iohub = IoHub::new();
    let scheduler = Scheduler::new(
        Arc::clone(&cpu) as Arc<dyn ScheduledCpu>,
        Arc::clone(&iohub),
    );
    iohub.set_scheduler(&scheduler);
    let fdc = Arc::new(Mutex::new(FloppyController::new(disk_dir.path())));
    let channel = CommandChannel::new(
        Arc::clone(&cpu) as Arc<dyn ScheduledCpu>,
        Arc::clone(&scheduler),
        Arc::clone(&iohub),
        Arc::clone(&fdc),
    );
    Machine {
        cpu,
        iohub,
        scheduler,
        fdc,
        channel,
        disk_dir,
    }
}

/// Feed a NUL-terminated command line into the channel.
pub fn send_command(channel: &mut CommandChannel, line: &str) {
    use eurocom_emu::IoDevice;

    for b in line.bytes() {
        channel.write_io(0, b);
    }
    channel.write_io(0, 0);
}

/// Drain the channel's answer up to the terminating NUL.
pub fn read_answer(channel: &mut CommandChannel) -> String {
    use eurocom_emu::IoDevice;

    let mut out = String::new();
    loop {
        let b = channel.read_io(0);
        if b == 0 {
            break;
        }
        out.push(b as char);
    }
    out
}

/// Poll `check` until it holds or `deadline` passes.
pub fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}
