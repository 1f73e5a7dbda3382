//! Client for the flasher stub protocol
//!
//! Every command is a one byte opcode frame, followed by a frame with the
//! little endian `u32` arguments when the command takes any, and is
//! terminated by a one byte status frame from the stub.

use log::{debug, info, warn};
use md5::{Digest, Md5};
use strum::{Display, IntoStaticStr};

use crate::{
    connection::Connection,
    error::{Error, ProtocolError, ResultExt},
    flasher::{
        stubs::{FlashStub, EXPECTED_STUB_HANDSHAKE},
        Timeouts,
    },
};

/// Length of an MD5 digest
pub const DIGEST_LEN: usize = 16;

/// Commands understood by the flasher stub
#[derive(Copy, Clone, Debug, Display, IntoStaticStr, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum StubCommandType {
    Erase = 0,
    Write = 1,
    Read = 2,
    Digest = 3,
    ReadChipId = 4,
    Reboot = 5,
}

/// Digests of a flash region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestResult {
    /// MD5 of the whole region
    pub digest: [u8; DIGEST_LEN],
    /// MD5 of every block, empty unless a block size was requested
    pub block_digests: Vec<[u8; DIGEST_LEN]>,
}

/// A connection to a running flasher stub
pub struct StubClient {
    connection: Connection,
    timeouts: Timeouts,
    old_baud: Option<u32>,
}

impl StubClient {
    pub fn new(connection: Connection, timeouts: Timeouts) -> Self {
        StubClient {
            connection,
            timeouts,
            old_baud: None,
        }
    }

    /// The underlying ROM bootloader connection
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn into_connection(self) -> Connection {
        self.connection
    }

    /// Upload and start the stub, switching to `baud` if it differs from the
    /// current baud rate
    pub fn connect(&mut self, stub: &FlashStub, baud: u32) -> Result<(), Error> {
        let current = self.connection.get_baud()?;
        let baud = if baud == current { 0 } else { baud };

        self.connection.run_stub(stub, &[baud])?;

        if baud > 0 {
            self.old_baud = Some(current);
            self.connection.set_baud(baud)?;
        }

        let greeting = self
            .connection
            .with_timeout(self.timeouts.response(), |connection| {
                connection.read_frame()
            })?;

        if greeting != EXPECTED_STUB_HANDSHAKE {
            return Err(ProtocolError::InvalidGreeting(greeting).into());
        }

        info!("Flasher stub running");
        Ok(())
    }

    /// Restore the baud rate in effect before [StubClient::connect]
    pub fn disconnect(&mut self) -> Result<(), Error> {
        if let Some(baud) = self.old_baud.take() {
            self.connection.set_baud(baud)?;
        }
        Ok(())
    }

    /// Erase `size` bytes of flash at `addr`
    pub fn erase(&mut self, addr: u32, size: u32) -> Result<(), Error> {
        debug!("Erasing {size} bytes at {addr:#x}");

        let timeout = self.timeouts.erase(size as usize);
        self.connection
            .with_timeout(timeout, |connection| {
                write_command(connection, StubCommandType::Erase, &[addr, size])?;
                read_status(connection)
            })
            .for_command(StubCommandType::Erase)
    }

    /// Write `data` to flash at `addr`, erasing it first if `erase` is set
    ///
    /// Both `addr` and the length of `data` must be sector aligned. `progress`
    /// receives the number of bytes the stub has confirmed so far.
    pub fn write<F>(
        &mut self,
        addr: u32,
        data: &[u8],
        erase: bool,
        mut progress: F,
    ) -> Result<(), Error>
    where
        F: FnMut(usize),
    {
        debug!("Writing {} bytes at {addr:#x} (erase: {erase})", data.len());

        let len = data.len();
        let timeouts = self.timeouts;
        let connection = &mut self.connection;

        write_command(
            connection,
            StubCommandType::Write,
            &[addr, len as u32, u32::from(erase)],
        )?;

        let mut written = 0;
        let mut sent: usize = 0;
        while written < len {
            let timeout = if sent == 0 && erase {
                timeouts.erase(len)
            } else {
                timeouts.write_ack()
            };

            let frame = connection
                .with_timeout(timeout, |connection| connection.read_frame())
                .for_command(StubCommandType::Write)?;

            match frame[..] {
                [status] => return Err(ProtocolError::StubStatus(status).into()),
                [a, b, c, d] => {
                    written = u32::from_le_bytes([a, b, c, d]) as usize;
                    progress(written.min(len));
                }
                _ => {
                    return Err(ProtocolError::UnexpectedFrame {
                        expected: 4,
                        got: frame.len(),
                    }
                    .into())
                }
            }

            while sent.saturating_sub(written) <= timeouts.write_window && sent < len {
                let end = (sent + timeouts.write_chunk).min(len);
                connection.write_raw(&data[sent..end])?;
                sent = end;
            }
        }

        let received = read_digest(connection).for_command(StubCommandType::Write)?;
        let status = read_status(connection).for_command(StubCommandType::Write);

        let expected = Md5::digest(data);
        if received[..] != expected[..] {
            return Err(Error::DataLoss {
                expected: hex::encode(&expected),
                received: hex::encode(&received),
            });
        }

        status
    }

    /// Read `size` bytes of flash at `addr`
    pub fn read<F>(&mut self, addr: u32, size: usize, mut progress: F) -> Result<Vec<u8>, Error>
    where
        F: FnMut(usize),
    {
        debug!("Reading {size} bytes at {addr:#x}");

        let timeouts = self.timeouts;
        let connection = &mut self.connection;

        write_command(
            connection,
            StubCommandType::Read,
            &[addr, size as u32, timeouts.read_block_size as u32],
        )?;

        let mut data = Vec::with_capacity(size);
        while data.len() < size {
            let frame = connection
                .with_timeout(timeouts.response(), |connection| {
                    connection.read_frame()
                })
                .for_command(StubCommandType::Read)?;

            data.extend_from_slice(&frame);
            if data.len() > size {
                return Err(ProtocolError::ReadMoreThanExpected {
                    expected: size,
                    got: data.len(),
                }
                .into());
            }
            progress(data.len());
        }

        let received = read_digest(connection).for_command(StubCommandType::Read)?;
        let expected = Md5::digest(&data);
        if received[..] != expected[..] {
            return Err(Error::DataLoss {
                expected: hex::encode(&expected),
                received: hex::encode(&received),
            });
        }

        // The data is already verified, the status adds nothing
        if let Err(e) = read_status(connection) {
            warn!("Ignoring status after read: {e}");
        }

        Ok(data)
    }

    /// Compute MD5 digests of a flash region on the device
    ///
    /// With a non-zero `block_size` a digest of every block is returned as
    /// well.
    pub fn digest(
        &mut self,
        addr: u32,
        size: usize,
        block_size: usize,
    ) -> Result<DigestResult, Error> {
        debug!("Computing digest of {size} bytes at {addr:#x} (block size {block_size})");

        let timeout = self.timeouts.digest(size, block_size);
        self.connection
            .with_timeout(timeout, |connection| {
                write_command(
                    connection,
                    StubCommandType::Digest,
                    &[addr, size as u32, block_size as u32],
                )?;

                let mut digest: Option<[u8; DIGEST_LEN]> = None;
                let mut block_digests = Vec::new();
                loop {
                    let frame = connection.read_frame()?;
                    match frame[..] {
                        [0] => break,
                        [status] => return Err(ProtocolError::StubStatus(status).into()),
                        _ => {
                            let next = digest_from_frame(&frame)?;
                            // The last digest before the status covers the whole region
                            if let Some(previous) = digest.replace(next) {
                                block_digests.push(previous);
                            }
                        }
                    }
                }

                let digest = digest.ok_or(ProtocolError::UnexpectedFrame {
                    expected: DIGEST_LEN,
                    got: 1,
                })?;

                Ok(DigestResult {
                    digest,
                    block_digests,
                })
            })
            .for_command(StubCommandType::Digest)
    }

    /// Read the JEDEC ID of the SPI flash chip
    ///
    /// The manufacturer is in the most significant byte, followed by the
    /// memory type and the capacity.
    pub fn flash_chip_id(&mut self) -> Result<u32, Error> {
        let timeout = self.timeouts.chip_id();
        let id = self
            .connection
            .with_timeout(timeout, |connection| {
                write_command(connection, StubCommandType::ReadChipId, &[])?;

                let frame = connection.read_frame()?;
                let id: [u8; 4] = frame[..].try_into().map_err(|_| {
                    ProtocolError::UnexpectedFrame {
                        expected: 4,
                        got: frame.len(),
                    }
                })?;
                read_status(connection)?;

                Ok(u32::from_be_bytes(id))
            })
            .for_command(StubCommandType::ReadChipId)?;

        if id == 0 {
            return Err(ProtocolError::InvalidChipId.into());
        }

        debug!("Flash chip ID: {id:#010x}");
        Ok(id)
    }

    /// Ask the stub to restart the chip
    pub fn reboot(&mut self) -> Result<(), Error> {
        let timeout = self.timeouts.reboot();
        self.connection
            .with_timeout(timeout, |connection| {
                write_command(connection, StubCommandType::Reboot, &[])?;
                read_status(connection)
            })
            .for_command(StubCommandType::Reboot)
    }
}

fn write_command(
    connection: &mut Connection,
    command: StubCommandType,
    args: &[u32],
) -> Result<(), Error> {
    debug!("Writing stub command: {command} {args:#x?}");

    connection
        .write_frame(&[command as u8])
        .for_command(command)?;

    if !args.is_empty() {
        let args: Vec<u8> = args.iter().flat_map(|arg| arg.to_le_bytes()).collect();
        connection.write_frame(&args).for_command(command)?;
    }

    Ok(())
}

fn read_status(connection: &mut Connection) -> Result<(), Error> {
    let frame = connection.read_frame()?;
    match frame[..] {
        [0] => Ok(()),
        [status] => Err(ProtocolError::StubStatus(status).into()),
        _ => Err(ProtocolError::UnexpectedFrame {
            expected: 1,
            got: frame.len(),
        }
        .into()),
    }
}

fn read_digest(connection: &mut Connection) -> Result<[u8; DIGEST_LEN], Error> {
    let frame = connection.read_frame()?;
    digest_from_frame(&frame)
}

fn digest_from_frame(frame: &[u8]) -> Result<[u8; DIGEST_LEN], Error> {
    frame.try_into().map_err(|_| {
        ProtocolError::UnexpectedFrame {
            expected: DIGEST_LEN,
            got: frame.len(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        flasher::stubs::test_stub,
        testing::{MockHandle, MockPort, SimulatedEsp8266},
    };

    fn stub_client(sim: &SimulatedEsp8266) -> (StubClient, MockHandle) {
        let (port, handle) = sim.port();
        let mut connection = Connection::new(Box::new(port));
        connection.connect().unwrap();

        let mut client = StubClient::new(connection, Timeouts::default());
        client.connect(&test_stub(), 230_400).unwrap();
        (client, handle)
    }

    /// A client talking to a scripted port, without any handshake
    fn scripted() -> (StubClient, MockHandle) {
        let (port, handle) = MockPort::new();
        let client = StubClient::new(Connection::new(Box::new(port)), Timeouts::default());
        (client, handle)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn connect_switches_and_restores_baud() {
        let sim = SimulatedEsp8266::new();
        let (mut client, handle) = stub_client(&sim);

        assert_eq!(sim.state().stub_params, [230_400]);
        assert_eq!(handle.baud(), 230_400);

        client.disconnect().unwrap();
        assert_eq!(handle.baud(), 115_200);
        assert_eq!(handle.baud_log(), [230_400, 115_200]);
    }

    #[test]
    fn connect_at_current_baud_passes_zero() {
        let sim = SimulatedEsp8266::new();
        let (port, handle) = sim.port();
        let mut connection = Connection::new(Box::new(port));
        connection.connect().unwrap();
        let mut client = StubClient::new(connection, Timeouts::default());

        client.connect(&test_stub(), 115_200).unwrap();
        client.disconnect().unwrap();

        assert_eq!(sim.state().stub_params, [0]);
        assert!(handle.baud_log().is_empty());
    }

    #[test]
    fn wrong_greeting_is_rejected() {
        let sim = SimulatedEsp8266::new();
        sim.state().greeting = b"HELO".to_vec();
        let (port, _handle) = sim.port();
        let mut connection = Connection::new(Box::new(port));
        connection.connect().unwrap();
        let mut client = StubClient::new(connection, Timeouts::default());

        let err = client.connect(&test_stub(), 230_400).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidGreeting(ref g)) if g == b"HELO"
        ));
    }

    #[test]
    fn write_then_read_back() {
        let sim = SimulatedEsp8266::new();
        let (mut client, _handle) = stub_client(&sim);
        let data = pattern(3 * 4096, 7);

        let mut reported = Vec::new();
        client
            .write(0x2000, &data, true, |written| reported.push(written))
            .unwrap();

        assert_eq!(reported.first(), Some(&0));
        assert_eq!(reported.last(), Some(&data.len()));
        assert!(reported.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(&sim.state().flash[0x2000..0x5000], &data[..]);

        let mut last = 0;
        let read = client.read(0x2000, data.len(), |n| last = n).unwrap();
        assert_eq!(read, data);
        assert_eq!(last, data.len());
    }

    #[test]
    fn write_sends_data_unframed() {
        let sim = SimulatedEsp8266::new();
        let (mut client, handle) = stub_client(&sim);
        let before = handle.written().len();

        client.write(0, &pattern(4096, 1), false, |_| {}).unwrap();

        // Command and argument frames, then the raw data
        let sent = handle.written().len() - before;
        assert_eq!(sent, 3 + (2 + 12) + 4096);
    }

    #[test]
    fn write_digest_mismatch_is_data_loss() {
        let sim = SimulatedEsp8266::new();
        sim.state().corrupt_write_digest = true;
        let (mut client, _handle) = stub_client(&sim);

        let data = pattern(4096, 3);
        let err = client.write(0, &data, true, |_| {}).unwrap_err();
        match err {
            Error::DataLoss { expected, received } => {
                assert_eq!(expected, hex::encode(Md5::digest(&data)));
                assert_eq!(received.len(), 32);
                assert_ne!(received, expected);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn write_requires_sector_alignment() {
        let sim = SimulatedEsp8266::new();
        let (mut client, _handle) = stub_client(&sim);

        let err = client.write(0x100, &[0; 4096], false, |_| {}).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::StubStatus(0x32))
        ));
    }

    #[test]
    fn erase_fills_with_ones() {
        let sim = SimulatedEsp8266::new();
        sim.state().flash[0x1000..0x3000].fill(0);
        let (mut client, _handle) = stub_client(&sim);

        client.erase(0x1000, 0x1000).unwrap();

        let state = sim.state();
        assert!(state.flash[0x1000..0x2000].iter().all(|&b| b == 0xff));
        assert!(state.flash[0x2000..0x3000].iter().all(|&b| b == 0));
    }

    #[test]
    fn digest_with_blocks() {
        let sim = SimulatedEsp8266::new();
        let data = pattern(2 * 4096 + 100, 9);
        sim.state().flash[..data.len()].copy_from_slice(&data);
        let (mut client, _handle) = stub_client(&sim);

        let result = client.digest(0, data.len(), 4096).unwrap();

        assert_eq!(result.digest[..], Md5::digest(&data)[..]);
        assert_eq!(result.block_digests.len(), 3);
        for (block, digest) in data.chunks(4096).zip(&result.block_digests) {
            assert_eq!(digest[..], Md5::digest(block)[..]);
        }

        let whole = client.digest(0, data.len(), 0).unwrap();
        assert_eq!(whole.digest, result.digest);
        assert!(whole.block_digests.is_empty());
    }

    #[test]
    fn reads_flash_chip_id() {
        let sim = SimulatedEsp8266::new();
        let (mut client, _handle) = stub_client(&sim);

        assert_eq!(client.flash_chip_id().unwrap(), 0xef40_1400);
    }

    #[test]
    fn zero_chip_id_is_an_error() {
        let (mut client, handle) = scripted();
        handle.push_frame(&[0, 0, 0, 0]);
        handle.push_frame(&[0]);

        assert!(matches!(
            client.flash_chip_id(),
            Err(Error::Protocol(ProtocolError::InvalidChipId))
        ));
    }

    #[test]
    fn read_more_than_requested() {
        let (mut client, handle) = scripted();
        handle.push_frame(&[0; 600]);
        handle.push_frame(&[0; 600]);

        assert!(matches!(
            client.read(0, 1024, |_| {}),
            Err(Error::Protocol(ProtocolError::ReadMoreThanExpected {
                expected: 1024,
                got: 1200
            }))
        ));
    }

    #[test]
    fn read_tolerates_bad_status() {
        let (mut client, handle) = scripted();
        let data = pattern(100, 0);
        handle.push_frame(&data);
        handle.push_frame(&Md5::digest(&data));
        handle.push_frame(&[0x7f]);

        assert_eq!(client.read(0, 100, |_| {}).unwrap(), data);
    }

    #[test]
    fn read_digest_mismatch_is_data_loss() {
        let (mut client, handle) = scripted();
        handle.push_frame(&[1, 2, 3, 4]);
        handle.push_frame(&[0; 16]);
        handle.push_frame(&[0]);

        assert!(matches!(
            client.read(0, 4, |_| {}),
            Err(Error::DataLoss { .. })
        ));
    }

    #[test]
    fn digest_error_status() {
        let (mut client, handle) = scripted();
        handle.push_frame(&[0x63]);

        assert!(matches!(
            client.digest(0, 4096, 0),
            Err(Error::Protocol(ProtocolError::StubStatus(0x63)))
        ));
    }

    #[test]
    fn stub_commands_are_framed_separately() {
        let (mut client, handle) = scripted();
        handle.push_frame(&[0]);

        client.erase(0x3000, 0x2000).unwrap();

        assert_eq!(
            handle.written_frames(),
            [
                vec![0x00],
                vec![0x00, 0x30, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00]
            ]
        );
    }

    #[test]
    fn timeouts_name_the_command() {
        let (mut client, _handle) = scripted();

        let err = client.reboot().unwrap_err();
        assert_eq!(err.to_string(), "Timeout while running Reboot command");
    }
}
