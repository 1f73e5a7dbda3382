//! Write a firmware to a target device
//!
//! The [Flasher] enum abstracts over the supported platforms. A flasher is
//! configured, given a port and a firmware, and then either [run](Flasher::run)
//! in place or [spawned](Flasher::spawn) onto a worker thread which reports
//! back through a channel of [FlasherEvent]s.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        mpsc::{self, Receiver},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::debug;
use serde::{Deserialize, Serialize};

pub use self::{
    client::{DigestResult, StubClient},
    esp8266::Esp8266Flasher,
    params::{FlashFrequency, FlashMode, FlashParams, FlashSize},
    stubs::FlashStub,
};
use crate::{
    error::Error,
    interface::Port,
    progress::{EventSink, FlasherEvent},
    targets::Chip,
};

pub mod client;
pub mod dedup;
pub mod esp8266;
pub mod id;
pub mod params;
pub mod stubs;

/// Bytes of flash in a 64 KiB erase block
const FLASH_BLOCK_SIZE: usize = 0x10000;
/// Time allowed for a frame the stub sends without further work
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Tuning of the flasher stub protocol
///
/// These are conservative values found to work with common modules, not
/// properties of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Timeouts {
    /// Maximum number of bytes sent ahead of the stub's acknowledgements
    pub write_window: usize,
    /// Size of a single chunk of write data
    pub write_chunk: usize,
    /// Size of the frames the stub sends when reading
    pub read_block_size: usize,
    pub block_read_write_ms: u64,
    pub block_erase_ms: u64,
    pub erase_min_ms: u64,
    pub chip_id_ms: u64,
    pub reboot_ms: u64,
    pub write_ack_ms: u64,
    /// Flash commands of the ROM bootloader
    pub rom_flash_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            write_window: 3072,
            write_chunk: 1024,
            read_block_size: 1024,
            block_read_write_ms: 250,
            block_erase_ms: 900,
            erase_min_ms: 5000,
            chip_id_ms: 1000,
            reboot_ms: 15000,
            write_ack_ms: 200,
            rom_flash_ms: 10000,
        }
    }
}

impl Timeouts {
    /// Greeting, read data and other frames needing no flash work
    pub fn response(&self) -> Duration {
        RESPONSE_TIMEOUT
    }

    /// Erasing `size` bytes
    pub fn erase(&self, size: usize) -> Duration {
        let blocks = (size / FLASH_BLOCK_SIZE + 1) as u64;
        Duration::from_millis(self.erase_min_ms.max(self.block_erase_ms * blocks))
    }

    pub fn write_ack(&self) -> Duration {
        Duration::from_millis(self.write_ack_ms)
    }

    pub fn block_read_write(&self) -> Duration {
        Duration::from_millis(self.block_read_write_ms)
    }

    /// Each digest frame of a `size` byte region
    pub fn digest(&self, size: usize, block_size: usize) -> Duration {
        let blocks = if block_size > 0 {
            10
        } else {
            (size / FLASH_BLOCK_SIZE + 1) as u64
        };
        Duration::from_millis(self.block_read_write_ms * blocks)
    }

    pub fn chip_id(&self) -> Duration {
        Duration::from_millis(self.chip_id_ms)
    }

    pub fn reboot(&self) -> Duration {
        Duration::from_millis(self.reboot_ms)
    }

    pub fn rom_flash(&self) -> Duration {
        Duration::from_millis(self.rom_flash_ms)
    }
}

/// Settings of a flashing run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FlasherConfig {
    /// Baud rate used once the stub is running
    pub flash_baud_rate: u32,
    /// Keep files already on the device's filesystem
    pub merge_fs: bool,
    /// Write a new device ID if the device has none
    pub generate_id: bool,
    /// Domain the generated IDs belong to
    pub id_domain: String,
    /// Overrides the flash parameters derived from the detected flash size
    pub flash_params: Option<FlashParams>,
    pub spiffs_offset: u32,
    pub spiffs_size: usize,
    /// Only write the flash sectors whose content changes
    pub minimize_writes: bool,
    /// Compensate for the ROM erasing too much when writing flash
    pub erase_bug_workaround: bool,
    /// Save the filesystem read from the device to this file
    pub dump_fs: Option<PathBuf>,
    /// Port carrying the protocol traffic, if not the one wired to the
    /// control lines
    pub data_port: Option<String>,
    /// Start with inverted DTR and RTS levels
    pub invert_signals: bool,
    pub timeouts: Timeouts,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        FlasherConfig {
            flash_baud_rate: 230_400,
            merge_fs: true,
            generate_id: true,
            id_domain: "api.cesanta.com".into(),
            flash_params: None,
            spiffs_offset: 0xec000,
            spiffs_size: 65536,
            minimize_writes: true,
            erase_bug_workaround: true,
            dump_fs: None,
            data_port: None,
            invert_signals: false,
            timeouts: Timeouts::default(),
        }
    }
}

/// What to do when the device's filesystem can not be merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Fail the run
    Abort,
    /// Write the filesystem of the new firmware, losing the device's files
    WriteNew,
    /// Leave the device's filesystem as it is
    KeepOld,
}

/// Decisions a flashing run leaves to the user
pub trait Prompter {
    /// Connecting to the bootloader failed, whether to try again
    fn retry_connect(&mut self, error: &Error) -> bool;

    fn merge_failed(&mut self, error: &Error) -> MergeDecision;
}

/// Never retries and aborts on merge failures
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompt;

impl Prompter for NoPrompt {
    fn retry_connect(&mut self, _error: &Error) -> bool {
        false
    }

    fn merge_failed(&mut self, _error: &Error) -> MergeDecision {
        MergeDecision::Abort
    }
}

/// A flasher for one of the supported platforms
pub enum Flasher {
    Esp8266(Esp8266Flasher),
}

impl Flasher {
    pub fn new(chip: Chip, config: FlasherConfig, stub: FlashStub) -> Self {
        match chip {
            Chip::Esp8266 => Flasher::Esp8266(Esp8266Flasher::new(config, stub)),
        }
    }

    /// Load the firmware directory at `path`
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        match self {
            Flasher::Esp8266(flasher) => flasher.load(path.as_ref()),
        }
    }

    /// Use `port` to talk to the device
    pub fn set_port(&mut self, port: Port) {
        match self {
            Flasher::Esp8266(flasher) => flasher.set_port(port),
        }
    }

    /// Send protocol traffic through `port`, keeping the control lines on
    /// the port given to [Flasher::set_port]
    pub fn set_data_port(&mut self, port: Port) {
        match self {
            Flasher::Esp8266(flasher) => flasher.set_data_port(port),
        }
    }

    /// Flash the loaded firmware, reporting to `events`
    pub fn run(&mut self, prompter: &mut dyn Prompter, events: &EventSink) -> Result<(), Error> {
        match self {
            Flasher::Esp8266(flasher) => flasher.run(prompter, events),
        }
    }

    /// Number of bytes a run processes, for progress reporting
    pub fn total_bytes(&self) -> usize {
        match self {
            Flasher::Esp8266(flasher) => flasher.total_bytes(),
        }
    }

    /// Run on a worker thread
    pub fn spawn(mut self, mut prompter: Box<dyn Prompter + Send>) -> FlashJob {
        let (tx, events) = mpsc::channel();
        let progress = Arc::new(AtomicU32::new(0));
        let total_bytes = self.total_bytes();
        let sink = EventSink::new(tx, progress.clone());

        let handle = thread::spawn(move || {
            debug!("Flashing worker started");
            self.run(prompter.as_mut(), &sink)
        });

        FlashJob {
            handle,
            events,
            progress,
            total_bytes,
        }
    }
}

/// A flashing run on a worker thread
pub struct FlashJob {
    handle: JoinHandle<Result<(), Error>>,
    events: Receiver<FlasherEvent>,
    progress: Arc<AtomicU32>,
    total_bytes: usize,
}

impl FlashJob {
    /// Events of the run, the channel closes when the run ends
    pub fn events(&self) -> &Receiver<FlasherEvent> {
        &self.events
    }

    /// Bytes processed so far
    pub fn progress(&self) -> u32 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Wait for the run to end
    pub fn join(self) -> Result<(), Error> {
        self.handle.join().map_err(|_| Error::InternalError)?
    }
}
