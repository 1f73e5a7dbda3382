//! In-memory serial port and a simulated ESP8266 for tests

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use md5::{Digest, Md5};

use crate::{error::Error, interface::SerialInterface, slip};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Line {
    Dtr,
    Rts,
}

/// Something on the far side of a [MockPort]
pub(crate) trait Device: Send {
    /// Bytes written by the host; returns bytes to send back
    fn receive(&mut self, bytes: &[u8]) -> Vec<u8>;

    fn control(&mut self, _line: Line, _level: bool) {}
}

#[derive(Default)]
struct Shared {
    rx: VecDeque<u8>,
    written: Vec<u8>,
    control_log: Vec<(Line, bool)>,
    baud_log: Vec<u32>,
    baud: u32,
    timeout: Duration,
    /// Port timeout in effect at the last write
    write_timeout: Option<Duration>,
    stalled: bool,
    device: Option<Box<dyn Device>>,
}

/// A [SerialInterface] whose reads time out immediately once nothing is
/// queued
pub(crate) struct MockPort {
    shared: Arc<Mutex<Shared>>,
}

/// Test-side view of a [MockPort]
#[derive(Clone)]
pub(crate) struct MockHandle {
    shared: Arc<Mutex<Shared>>,
}

impl MockPort {
    pub fn new() -> (Self, MockHandle) {
        let shared = Arc::new(Mutex::new(Shared {
            baud: 115_200,
            timeout: Duration::from_secs(3),
            ..Default::default()
        }));

        (
            MockPort {
                shared: shared.clone(),
            },
            MockHandle { shared },
        )
    }

    pub fn with_device(device: impl Device + 'static) -> (Self, MockHandle) {
        let (port, handle) = Self::new();
        handle.lock().device = Some(Box::new(device));
        (port, handle)
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }

    /// Queue a SLIP frame for the host to read
    pub fn push_frame(&self, data: &[u8]) {
        self.lock().rx.extend(slip::encode(data));
    }

    pub fn push_bytes(&self, data: &[u8]) {
        self.lock().rx.extend(data.iter().copied());
    }

    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// Everything the host wrote, split into SLIP frames
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        let written = self.written();
        let mut reader = written.as_slice();
        let mut frames = Vec::new();
        while let Ok(frame) = slip::recv(&mut reader) {
            frames.push(frame);
        }
        frames
    }

    pub fn control_log(&self) -> Vec<(Line, bool)> {
        self.lock().control_log.clone()
    }

    pub fn baud_log(&self) -> Vec<u32> {
        self.lock().baud_log.clone()
    }

    pub fn baud(&self) -> u32 {
        self.lock().baud
    }

    /// Make every following write time out
    pub fn stall_writes(&self) {
        self.lock().stalled = true;
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.lock().write_timeout
    }

    pub fn timeout(&self) -> Duration {
        self.lock().timeout
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut shared = self.lock();
        if shared.rx.is_empty() {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }

        let n = buf.len().min(shared.rx.len());
        for (slot, byte) in buf.iter_mut().zip(shared.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.lock();
        if shared.stalled {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        shared.write_timeout = Some(shared.timeout);
        shared.written.extend_from_slice(buf);

        if let Some(mut device) = shared.device.take() {
            let reply = device.receive(buf);
            shared.rx.extend(reply);
            shared.device = Some(device);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialInterface for MockPort {
    fn name(&self) -> Option<String> {
        Some("mock".into())
    }

    fn timeout(&self) -> Duration {
        self.lock().timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.lock().timeout = timeout;
        Ok(())
    }

    fn baud_rate(&self) -> Result<u32, Error> {
        Ok(self.lock().baud)
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
        let mut shared = self.lock();
        shared.baud = baud;
        shared.baud_log.push(baud);
        Ok(())
    }

    fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), Error> {
        self.control(Line::Dtr, level);
        Ok(())
    }

    fn write_request_to_send(&mut self, level: bool) -> Result<(), Error> {
        self.control(Line::Rts, level);
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), Error> {
        self.lock().rx.clear();
        Ok(())
    }
}

impl MockPort {
    fn control(&mut self, line: Line, level: bool) {
        let mut shared = self.lock();
        shared.control_log.push((line, level));
        if let Some(device) = shared.device.as_mut() {
            device.control(line, level);
        }
    }
}

/// Reassembles SLIP frames from an arbitrarily split byte stream
#[derive(Default)]
struct FrameReader {
    buf: Vec<u8>,
    in_frame: bool,
    escape: bool,
}

impl FrameReader {
    fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if !self.in_frame {
            if byte == 0xC0 {
                self.in_frame = true;
                self.buf.clear();
            }
            return None;
        }

        if self.escape {
            self.escape = false;
            self.buf.push(if byte == 0xDC { 0xC0 } else { 0xDB });
            return None;
        }

        match byte {
            0xC0 => {
                self.in_frame = false;
                Some(std::mem::take(&mut self.buf))
            }
            0xDB => {
                self.escape = true;
                None
            }
            _ => {
                self.buf.push(byte);
                None
            }
        }
    }
}

pub(crate) const SIM_FLASH_SIZE: usize = 1 << 20;
pub(crate) const SIM_STUB_ENTRY: u32 = 0x4010_e000;
pub(crate) const SIM_MAC0: u32 = 0x5a00_0000;
pub(crate) const SIM_MAC1: u32 = 0x0000_1234;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Held in reset or running the application: silent
    Firmware,
    Reset,
    Rom,
    Stub,
    /// Link dropped until the next reset
    Dead,
}

struct RawWrite {
    addr: usize,
    len: usize,
    received: usize,
    pending: Vec<u8>,
    hasher: Md5,
}

struct FlashBegin {
    addr: usize,
    erase_size: u32,
    blocks: u32,
    block_size: u32,
}

pub(crate) struct SimState {
    pub flash: Vec<u8>,
    pub mode: Mode,
    pub inverted_wiring: bool,
    pub chip_id: [u8; 4],
    pub stub_entry: u32,
    pub stub_params: Vec<u32>,
    /// Sent by the stub once it is running
    pub greeting: Vec<u8>,
    /// Flip a bit in the digest sent after a write
    pub corrupt_write_digest: bool,
    /// Drop the link after this many raw write bytes have been received
    pub drop_after: Option<usize>,
    /// Never answer the ROM FlashEnd command
    pub silent_flash_end: bool,
    /// Erase sizes requested through the ROM FlashBegin command
    pub rom_erase_sizes: Vec<u32>,
    pub soft_resets: usize,
    /// Stub commands with their arguments, in arrival order
    pub stub_commands: Vec<(u8, Vec<u32>)>,
    dtr: bool,
    rts: bool,
    frames: FrameReader,
    mem_begin: u32,
    mem_addr: u32,
    mem: Vec<(u32, Vec<u8>)>,
    flash_begin: Option<FlashBegin>,
    stub_cmd: Option<u8>,
    raw: Option<RawWrite>,
    raw_total: usize,
}

/// A device model speaking the ESP8266 ROM and flasher stub protocols
#[derive(Clone)]
pub(crate) struct SimulatedEsp8266(Arc<Mutex<SimState>>);

impl SimulatedEsp8266 {
    pub fn new() -> Self {
        SimulatedEsp8266(Arc::new(Mutex::new(SimState {
            flash: vec![0xff; SIM_FLASH_SIZE],
            mode: Mode::Firmware,
            inverted_wiring: false,
            // Winbond, 1 MiB
            chip_id: [0xef, 0x40, 0x14, 0x00],
            stub_entry: SIM_STUB_ENTRY,
            stub_params: Vec::new(),
            greeting: b"OHAI".to_vec(),
            corrupt_write_digest: false,
            drop_after: None,
            silent_flash_end: false,
            rom_erase_sizes: Vec::new(),
            soft_resets: 0,
            stub_commands: Vec::new(),
            dtr: false,
            rts: false,
            frames: FrameReader::default(),
            mem_begin: 0,
            mem_addr: 0,
            mem: Vec::new(),
            flash_begin: None,
            stub_cmd: None,
            raw: None,
            raw_total: 0,
        })))
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().unwrap()
    }

    /// A port connected to this device
    pub fn port(&self) -> (MockPort, MockHandle) {
        MockPort::with_device(self.clone())
    }
}

impl Device for SimulatedEsp8266 {
    fn receive(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut state = self.state();
        let mut out = Vec::new();
        let mut rest = bytes;

        while !rest.is_empty() {
            if state.mode == Mode::Stub && state.raw.is_some() {
                let taken = state.raw_data(rest, &mut out);
                rest = &rest[taken..];
                continue;
            }

            let byte = rest[0];
            rest = &rest[1..];
            if let Some(frame) = state.frames.push(byte) {
                match state.mode {
                    Mode::Rom => state.rom_frame(&frame, &mut out),
                    Mode::Stub => state.stub_frame(&frame, &mut out),
                    _ => {}
                }
            }
        }

        out
    }

    fn control(&mut self, line: Line, level: bool) {
        let mut state = self.state();
        let level = level ^ state.inverted_wiring;

        match line {
            Line::Dtr => state.dtr = level,
            Line::Rts => {
                let was_in_reset = state.rts;
                state.rts = level;
                if level {
                    state.mode = Mode::Reset;
                } else if was_in_reset {
                    // GPIO0 low at the end of reset selects the bootloader
                    state.mode = if state.dtr { Mode::Rom } else { Mode::Firmware };
                    state.frames = FrameReader::default();
                    state.raw = None;
                    state.stub_cmd = None;
                }
            }
        }
    }
}

fn send(out: &mut Vec<u8>, frame: &[u8]) {
    out.extend(slip::encode(frame));
}

fn words(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl SimState {
    fn rom_response(out: &mut Vec<u8>, op: u8, value: u32, status: u8, error: u8) {
        let mut frame = vec![0x01, op, 0x02, 0x00];
        frame.extend_from_slice(&value.to_le_bytes());
        frame.extend_from_slice(&[status, error]);
        send(out, &frame);
    }

    fn rom_frame(&mut self, frame: &[u8], out: &mut Vec<u8>) {
        if frame.len() < 8 || frame[0] != 0 {
            return;
        }
        let op = frame[1];
        let checksum = frame[4];
        let payload = &frame[8..];
        let args = words(payload);

        match op {
            // Sync: the ROM answers every sync burst several times
            0x08 => {
                for _ in 0..8 {
                    Self::rom_response(out, op, 0, 0, 0);
                }
            }
            // ReadReg
            0x0a => {
                let value = match args.first() {
                    Some(0x3ff0_0050) => SIM_MAC0,
                    Some(0x3ff0_0054) => SIM_MAC1,
                    _ => 0,
                };
                Self::rom_response(out, op, value, 0, 0);
            }
            // MemBegin
            0x05 => {
                self.mem_begin = args[3];
                self.mem_addr = args[3];
                Self::rom_response(out, op, 0, 0, 0);
            }
            // MemData
            0x07 | 0x03 => {
                let data = &payload[16..];
                let expected = data.iter().fold(0xEF, |acc, b| acc ^ b);
                if expected != checksum || data.len() != args[0] as usize {
                    Self::rom_response(out, op, 0, 1, 0x07);
                    return;
                }
                if op == 0x07 {
                    self.mem.push((self.mem_addr, data.to_vec()));
                    self.mem_addr += data.len() as u32;
                } else if let Some(begin) = &self.flash_begin {
                    let at = begin.addr + args[1] as usize * begin.block_size as usize;
                    self.flash[at..at + data.len()].copy_from_slice(data);
                }
                Self::rom_response(out, op, 0, 0, 0);
            }
            // MemEnd
            0x06 => {
                Self::rom_response(out, op, 0, 0, 0);
                let (no_entry, entry) = (args[0], args[1]);
                if no_entry != 0 {
                    return;
                }
                if entry == self.stub_entry {
                    let begin = self.mem_begin;
                    self.stub_params = self
                        .mem
                        .iter()
                        .find(|(addr, _)| *addr == begin)
                        .map(|(_, data)| words(&data[..4]))
                        .unwrap_or_default();
                    self.mode = Mode::Stub;
                    send(out, &self.greeting);
                } else if entry == 0x4000_0080 {
                    self.soft_resets += 1;
                    self.mode = Mode::Firmware;
                }
            }
            // FlashBegin
            0x02 => {
                self.rom_erase_sizes.push(args[0]);
                let start = args[3] as usize;
                let erase = (args[0] as usize).min(self.flash.len() - start);
                self.flash[start..start + erase].fill(0xff);
                self.flash_begin = Some(FlashBegin {
                    addr: start,
                    erase_size: args[0],
                    blocks: args[1],
                    block_size: args[2],
                });
                Self::rom_response(out, op, 0, 0, 0);
            }
            // FlashEnd: the ROM complains when it erased less than it was sent
            0x04 => match self.flash_begin.take() {
                _ if self.silent_flash_end => {}
                Some(begin) if begin.erase_size < begin.blocks * begin.block_size => {
                    Self::rom_response(out, op, 0, 1, 0x06)
                }
                _ => Self::rom_response(out, op, 0, 0, 0),
            },
            _ => Self::rom_response(out, op, 0, 1, 0x05),
        }
    }

    fn stub_frame(&mut self, frame: &[u8], out: &mut Vec<u8>) {
        let Some(cmd) = self.stub_cmd.take() else {
            match frame {
                [4] => {
                    self.stub_commands.push((4, Vec::new()));
                    send(out, &self.chip_id.clone());
                    send(out, &[0]);
                }
                [5] => {
                    self.stub_commands.push((5, Vec::new()));
                    send(out, &[0]);
                    self.mode = Mode::Firmware;
                }
                [cmd] => self.stub_cmd = Some(*cmd),
                _ => {}
            }
            return;
        };

        let args = words(frame);
        self.stub_commands.push((cmd, args.clone()));

        match (cmd, args.as_slice()) {
            (0, &[addr, len]) => {
                let (addr, len) = (addr as usize, len as usize);
                self.flash[addr..addr + len].fill(0xff);
                send(out, &[0]);
            }
            (1, &[addr, len, erase]) => {
                if addr % 4096 != 0 {
                    send(out, &[0x32]);
                    return;
                }
                if len % 4096 != 0 {
                    send(out, &[0x33]);
                    return;
                }
                let (addr, len) = (addr as usize, len as usize);
                if erase != 0 {
                    self.flash[addr..addr + len].fill(0xff);
                }
                send(out, &0u32.to_le_bytes());
                self.raw = Some(RawWrite {
                    addr,
                    len,
                    received: 0,
                    pending: Vec::new(),
                    hasher: Md5::new(),
                });
            }
            (2, &[addr, len, block]) => {
                let (addr, len) = (addr as usize, len as usize);
                let data = &self.flash[addr..addr + len];
                for chunk in data.chunks(block as usize) {
                    send(out, chunk);
                }
                send(out, &Md5::digest(data));
                send(out, &[0]);
            }
            (3, &[addr, len, block]) => {
                let (addr, len) = (addr as usize, len as usize);
                let data = &self.flash[addr..addr + len];
                if block > 0 {
                    for chunk in data.chunks(block as usize) {
                        send(out, &Md5::digest(chunk));
                    }
                }
                send(out, &Md5::digest(data));
                send(out, &[0]);
            }
            _ => send(out, &[0xff]),
        }
    }

    /// Consume raw write data; returns how many bytes of `bytes` were taken
    fn raw_data(&mut self, bytes: &[u8], out: &mut Vec<u8>) -> usize {
        let Some(mut raw) = self.raw.take() else {
            return 0;
        };

        let want = raw.len - raw.received - raw.pending.len();
        let taken = want.min(bytes.len());
        let mut data = &bytes[..taken];

        if let Some(limit) = self.drop_after {
            let allowed = limit.saturating_sub(self.raw_total);
            if data.len() >= allowed {
                data = &data[..allowed];
                self.drop_after = None;
                self.mode = Mode::Dead;
            }
        }
        self.raw_total += data.len();
        raw.pending.extend_from_slice(data);

        while raw.pending.len() >= 1024 {
            let chunk: Vec<u8> = raw.pending.drain(..1024).collect();
            let at = raw.addr + raw.received;
            self.flash[at..at + 1024].copy_from_slice(&chunk);
            raw.hasher.update(&chunk);
            raw.received += 1024;
            if self.mode == Mode::Dead {
                continue;
            }
            send(out, &(raw.received as u32).to_le_bytes());
        }

        if self.mode == Mode::Dead {
            return bytes.len();
        }

        if raw.received == raw.len {
            let mut digest = raw.hasher.finalize().to_vec();
            if self.corrupt_write_digest {
                digest[0] ^= 0x01;
            }
            send(out, &digest);
            send(out, &[0]);
        } else {
            self.raw = Some(raw);
        }

        taken
    }
}
