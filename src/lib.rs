//! # Eurocom II emulation core
//!
//! The execution engine of an emulator for an MC6809-based late-1970s
//! microcomputer running the FLEX disk operating system. This crate
//! covers the parts behind the CPU: the scheduler that owns the CPU
//! thread, the WD1793-compatible floppy controller, the FLEX disk
//! containers backing it, the ASCII command channel the host drives the
//! machine through, and the thread-safe input hub.
//!
//! The CPU core itself is not part of this crate; it plugs in through
//! the [`ScheduledCpu`] contract and is stepped in cycle batches by the
//! [`Scheduler`].
//!
//! ## Architecture
//!
//! - `cpu`: the [`ScheduledCpu`] contract, batch modes and status
//!   snapshots
//! - `scheduler`: CPU thread, state machine, frequency control and the
//!   sync-exec inbox other threads use to reach the CPU thread
//! - `iohub`: parallel/serial keyboard queues, joystick state,
//!   one-second tick fan-out
//! - `devices`: memory-mapped peripherals (floppy controller, command
//!   channel)
//! - `disk`: FLEX containers (packed DSK/FLX sector images and
//!   host-directory containers) plus the on-disk structures
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::{Arc, Mutex};
//! use eurocom_emu::{CommandChannel, FloppyController, IoHub, Scheduler};
//! use eurocom_emu::cpu::{CpuState, ScheduledCpu};
//! # fn cpu_core() -> Arc<dyn ScheduledCpu> { unimplemented!() }
//!
//! let cpu: Arc<dyn ScheduledCpu> = cpu_core();
//! let iohub = IoHub::new();
//! let scheduler = Scheduler::new(Arc::clone(&cpu), Arc::clone(&iohub));
//! iohub.set_scheduler(&scheduler);
//!
//! let fdc = Arc::new(Mutex::new(FloppyController::new(std::path::Path::new("disks"))));
//! let channel = CommandChannel::new(
//!     Arc::clone(&cpu),
//!     Arc::clone(&scheduler),
//!     Arc::clone(&iohub),
//!     Arc::clone(&fdc),
//! );
//!
//! scheduler.start();
//! // ... wire fdc and channel into the machine's address decoding ...
//! scheduler.request_new_state(CpuState::Exit);
//! scheduler.join();
//! ```

pub mod cpu;
pub mod devices;
pub mod disk;
pub mod iohub;
pub mod scheduler;

pub use cpu::{CpuRegisters, CpuState, CpuStatus, InterruptStatus, RunMode, ScheduledCpu};
pub use devices::{CommandChannel, DriveState, FloppyController, IoDevice};
pub use disk::{
    format_disk, AccessMode, ContainerInfo, DirEntry, DirectoryContainer, DiskContainer,
    FileAttributes, FileBuffer, FlexDate, FlexError, ImageContainer, ImageFormat,
};
pub use iohub::{ControlLine, ControlLineTarget, IoHub, JoystickState, OutputMode};
pub use scheduler::Scheduler;
