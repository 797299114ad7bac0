//! ASCII command channel between the guest and the emulator.
//!
//! The guest writes command characters to a single memory-mapped
//! register and terminates the line with NUL; the channel tokenises the
//! line and executes the verb. Answers accumulate in a buffer the guest
//! drains byte by byte from the same register, with `\n` translated to
//! carriage return on the way out and a terminating NUL marking the
//! end.
//!
//! Errors never propagate: every failure becomes one of the fixed
//! answer strings below.

use std::sync::{Arc, Mutex};

use log::debug;

use crate::cpu::{CpuState, ScheduledCpu};
use crate::devices::fdc::{FloppyController, DRIVE_COUNT};
use crate::devices::IoDevice;
use crate::disk::{AccessMode, ImageFormat};
use crate::iohub::IoHub;
use crate::scheduler::Scheduler;

/// Longest accepted command line, including the terminator.
const MAX_COMMAND: usize = 128;

const CR: u8 = 0x0D;

// Fixed answer strings, kept verbatim for guest-side parsers.
pub const ERR_UNKNOWN: &str = "Unknown command";
pub const ERR_PARAM: &str = "Parameter invalid";
pub const ERR_PATH: &str = "Nonexistent path";
pub const ERR_UNABLE_MOUNT: &str = "Unable to mount drive";
pub const ERR_UNABLE_UMOUNT: &str = "Unable to umount drive";
pub const ERR_UNABLE_UPDATE: &str = "Unable to update drive. There are open files";
pub const ERR_CANT_CHANGE_GRAPHIC: &str = "Unable to change to graphic mode";
pub const ERR_UNABLE_FORMAT: &str = "Unable to format disk";
pub const ERR_MEMORY: &str = "Not enough memory to execute";

/// Memory-mapped control channel driving mount, format, frequency and
/// machine-state commands.
pub struct CommandChannel {
    cpu: Arc<dyn ScheduledCpu>,
    scheduler: Arc<Scheduler>,
    iohub: Arc<IoHub>,
    fdc: Arc<Mutex<FloppyController>>,
    command: Vec<u8>,
    answer: Vec<u8>,
    answer_index: usize,
}

impl CommandChannel {
    pub fn new(
        cpu: Arc<dyn ScheduledCpu>,
        scheduler: Arc<Scheduler>,
        iohub: Arc<IoHub>,
        fdc: Arc<Mutex<FloppyController>>,
    ) -> Self {
        Self {
            cpu,
            scheduler,
            iohub,
            fdc,
            command: Vec::with_capacity(MAX_COMMAND),
            answer: Vec::new(),
            answer_index: 0,
        }
    }

    fn set_answer(&mut self, text: &str) {
        self.answer = text.as_bytes().to_vec();
        self.answer_index = 0;
    }

    fn execute(&mut self, line: &str) {
        debug!("command: {:?}", line);
        let tokens: Vec<&str> = line.split(' ').filter(|t| !t.is_empty()).collect();

        match tokens.as_slice() {
            [verb] => self.execute_simple(verb),
            [verb, arg] => self.execute_with_arg(verb, arg),
            [verb, path, drive] => self.execute_mount(verb, path, drive),
            [verb, name, tracks, sectors] => self.execute_format(verb, name, tracks, sectors),
            _ => self.set_answer(ERR_UNKNOWN),
        }
    }

    fn execute_simple(&mut self, verb: &str) {
        if verb.eq_ignore_ascii_case("exit") {
            self.scheduler.request_new_state(CpuState::Exit);
        } else if verb.eq_ignore_ascii_case("irq") {
            self.cpu.set_irq();
        } else if verb.eq_ignore_ascii_case("firq") {
            self.cpu.set_firq();
        } else if verb.eq_ignore_ascii_case("nmi") {
            self.cpu.set_nmi();
        } else if verb.eq_ignore_ascii_case("terminal") {
            self.iohub.output_to_terminal();
        } else if verb.eq_ignore_ascii_case("graphic") {
            if !self.iohub.output_to_graphic() {
                self.set_answer(ERR_CANT_CHANGE_GRAPHIC);
            }
        } else if verb.eq_ignore_ascii_case("freq") {
            let text = format!("{:.2} MHz", self.scheduler.get_frequency());
            self.set_answer(&text);
        } else if verb.eq_ignore_ascii_case("cycles") {
            let text = format!("{} cycles", self.scheduler.get_total_cycles());
            self.set_answer(&text);
        } else if verb.eq_ignore_ascii_case("info") {
            let mut text = String::new();
            let mut fdc = self.fdc.lock().expect("fdc lock");
            for drive in 0..DRIVE_COUNT {
                text.push_str(&fdc.drive_info(drive));
            }
            drop(fdc);
            self.set_answer(&text);
        } else if verb.eq_ignore_ascii_case("update") {
            if self
                .fdc
                .lock()
                .expect("fdc lock")
                .update_all_drives()
                .is_err()
            {
                self.set_answer(ERR_UNABLE_UPDATE);
            }
        } else {
            self.set_answer(ERR_UNKNOWN);
        }
    }

    fn execute_with_arg(&mut self, verb: &str, arg: &str) {
        if verb.eq_ignore_ascii_case("freq") {
            // Malformed frequencies are silently ignored.
            if let Ok(freq) = arg.parse::<f32>() {
                if freq >= 0.0 {
                    self.scheduler.set_frequency(freq);
                }
            }
            return;
        }

        let Some(drive) = parse_drive(arg) else {
            self.set_answer(ERR_PARAM);
            return;
        };

        if verb.eq_ignore_ascii_case("umount") {
            if self
                .fdc
                .lock()
                .expect("fdc lock")
                .umount_drive(drive)
                .is_err()
            {
                self.set_answer(ERR_UNABLE_UMOUNT);
            }
        } else if verb.eq_ignore_ascii_case("info") {
            let text = self.fdc.lock().expect("fdc lock").drive_info(drive);
            self.set_answer(&text);
        } else if verb.eq_ignore_ascii_case("update") {
            if self
                .fdc
                .lock()
                .expect("fdc lock")
                .update_drive(drive)
                .is_err()
            {
                self.set_answer(ERR_UNABLE_UPDATE);
            }
        } else {
            self.set_answer(ERR_UNKNOWN);
        }
    }

    fn execute_mount(&mut self, verb: &str, path: &str, drive: &str) {
        let mode = if verb.eq_ignore_ascii_case("mount") {
            AccessMode::ReadWrite
        } else if verb.eq_ignore_ascii_case("rmount") {
            AccessMode::Ram
        } else {
            self.set_answer(ERR_UNKNOWN);
            return;
        };

        let Some(drive) = parse_drive(drive) else {
            self.set_answer(ERR_PARAM);
            return;
        };
        if self
            .fdc
            .lock()
            .expect("fdc lock")
            .mount_drive(path, drive, mode)
            .is_err()
        {
            self.set_answer(ERR_UNABLE_MOUNT);
        }
    }

    fn execute_format(&mut self, verb: &str, name: &str, tracks: &str, sectors: &str) {
        if !verb.eq_ignore_ascii_case("format") {
            self.set_answer(ERR_UNKNOWN);
            return;
        }
        let (Ok(tracks), Ok(sectors)) = (tracks.parse::<i32>(), sectors.parse::<i32>()) else {
            self.set_answer(ERR_PARAM);
            return;
        };
        if tracks < 2 || sectors < 5 {
            self.set_answer(ERR_PARAM);
            return;
        }
        let tracks = tracks.min(255) as u8;
        let sectors = sectors.min(255) as u8;
        if self
            .fdc
            .lock()
            .expect("fdc lock")
            .format_disk(tracks, sectors, name, ImageFormat::Dsk)
            .is_err()
        {
            self.set_answer(ERR_UNABLE_FORMAT);
        }
    }
}

fn parse_drive(arg: &str) -> Option<usize> {
    arg.parse::<usize>().ok().filter(|d| *d < DRIVE_COUNT)
}

impl IoDevice for CommandChannel {
    fn reset_io(&mut self) {
        self.command.clear();
        self.answer.clear();
        self.answer_index = 0;
    }

    fn read_io(&mut self, _offset: u16) -> u8 {
        if !self.answer.is_empty() {
            let character = self.answer.get(self.answer_index).copied().unwrap_or(0);
            self.answer_index += 1;
            if character == 0 {
                self.answer.clear();
                self.answer_index = 0;
                return 0;
            }
            if character == b'\n' {
                return CR;
            }
            return character;
        }
        0x00
    }

    fn write_io(&mut self, _offset: u16, value: u8) {
        self.answer.clear();
        self.answer_index = 0;

        if self.command.len() < MAX_COMMAND - 1 {
            self.command.push(value);
        } else if let Some(last) = self.command.last_mut() {
            *last = value;
        }

        if value == 0 {
            let line: String = self
                .command
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| b as char)
                .collect();
            self.command.clear();
            self.execute(&line);
        }
    }

    fn name(&self) -> &'static str {
        "command"
    }
}
