//! SLIP framing
//!
//! Frames are delimited by `0xC0`; occurrences of `0xC0` and `0xDB` inside a
//! frame are replaced by `0xDB 0xDC` and `0xDB 0xDD` respectively. Neither
//! side retries anything at this layer.

use std::{
    io::{self, Read, Write},
    time::Duration,
};

use crate::{
    error::{Error, ProtocolError},
    interface::SerialInterface,
};

/// SLIP end of packet token
const END: u8 = 0xC0;
/// SLIP escape token
const ESC: u8 = 0xDB;
/// SLIP escaped 0xC0 token
const ESC_END: u8 = 0xDC;
/// SLIP escaped 0xDB token
const ESC_ESC: u8 = 0xDD;

/// Streaming SLIP encoder; every byte written to it is escaped, the frame is
/// delimited on creation and on [SlipEncoder::finish]
pub struct SlipEncoder<'a, W: Write> {
    writer: &'a mut W,
    len: usize,
}

impl<'a, W: Write> SlipEncoder<'a, W> {
    /// Creates a new encoder context
    pub fn new(writer: &'a mut W) -> io::Result<Self> {
        writer.write_all(&[END])?;
        Ok(Self { writer, len: 1 })
    }

    /// Terminate the frame, returning the number of encoded bytes written
    pub fn finish(self) -> io::Result<usize> {
        self.writer.write_all(&[END])?;
        Ok(self.len + 1)
    }
}

impl<W: Write> Write for SlipEncoder<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for value in buf.iter() {
            match *value {
                END => {
                    self.writer.write_all(&[ESC, ESC_END])?;
                    self.len += 2;
                }
                ESC => {
                    self.writer.write_all(&[ESC, ESC_ESC])?;
                    self.len += 2;
                }
                _ => {
                    self.writer.write_all(&[*value])?;
                    self.len += 1;
                }
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Write `data` as a single frame
pub fn send<W: Write>(writer: &mut W, data: &[u8]) -> Result<(), Error> {
    let mut encoder = SlipEncoder::new(writer)?;
    encoder.write_all(data)?;
    encoder.finish()?;
    writer.flush()?;

    Ok(())
}

/// Write `data` as a single frame to `port`, giving up when the port does
/// not take it within `timeout`
///
/// Write failures, a stalled port included, are reported as [Error::Io].
/// The port's previous timeout is restored afterwards.
pub fn send_timeout(
    port: &mut dyn SerialInterface,
    data: &[u8],
    timeout: Duration,
) -> Result<(), Error> {
    let frame = encode(data);

    let previous = port.timeout();
    port.set_timeout(timeout)?;
    let result = port.write_all(&frame).and_then(|()| port.flush());
    port.set_timeout(previous)?;

    result.map_err(Error::Io)
}

/// Encode `data` as a single frame in memory
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    // Writing into a Vec can not fail
    let _ = send(&mut out, data);
    out
}

/// Read a single frame
///
/// Bytes before the first delimiter are discarded. The source's own read
/// timeout bounds every blocking read; running out of data surfaces as
/// [Error::Timeout].
pub fn recv<R: Read + ?Sized>(source: &mut R) -> Result<Vec<u8>, Error> {
    while read_byte(source)? != END {}

    let mut frame = Vec::new();
    loop {
        match read_byte(source)? {
            END => return Ok(frame),
            ESC => match read_byte(source)? {
                ESC_END => frame.push(END),
                ESC_ESC => frame.push(ESC),
                other => return Err(ProtocolError::InvalidEscape(other).into()),
            },
            value => frame.push(value),
        }
    }
}

fn read_byte<R: Read + ?Sized>(source: &mut R) -> Result<u8, Error> {
    let mut byte = [0u8; 1];
    loop {
        match source.read(&mut byte) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::TimedOut).into()),
            Ok(_) => return Ok(byte[0]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPort;

    #[test]
    fn encode_escapes_special_bytes() {
        assert_eq!(
            encode(&[0x01, 0xc0, 0x02, 0xdb, 0x03]),
            [0xc0, 0x01, 0xdb, 0xdc, 0x02, 0xdb, 0xdd, 0x03, 0xc0]
        );
    }

    #[test]
    fn encoder_reports_encoded_length() {
        let mut out = Vec::new();
        let mut encoder = SlipEncoder::new(&mut out).unwrap();
        encoder.write_all(&[0xc0, 0x00]).unwrap();

        assert_eq!(encoder.finish().unwrap(), 5);
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn simple_decode() {
        const INPUT: [u8; 7] = [0xc0, 0x01, 0x02, 0x03, 0x04, 0x05, 0xc0];

        let frame = recv(&mut INPUT.as_ref()).unwrap();
        assert_eq!(frame, [0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn decode_discards_leading_garbage() {
        const INPUT: [u8; 6] = [0x55, 0x12, 0xc0, 0x01, 0x02, 0xc0];

        let frame = recv(&mut INPUT.as_ref()).unwrap();
        assert_eq!(frame, [0x01, 0x02]);
    }

    /// Ensure that [ESC, ESC_END] -> [END] and [ESC, ESC_ESC] -> [ESC]
    #[test]
    fn decode_escape_sequences() {
        const INPUT: [u8; 8] = [0xc0, 0x01, 0xdb, 0xdc, 0xdb, 0xdd, 0x03, 0xc0];

        let frame = recv(&mut INPUT.as_ref()).unwrap();
        assert_eq!(frame, [0x01, 0xc0, 0xdb, 0x03]);
    }

    #[test]
    fn invalid_escape_is_a_protocol_error() {
        const INPUT: [u8; 5] = [0xc0, 0x01, 0xdb, 0x42, 0xc0];

        let err = recv(&mut INPUT.as_ref()).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidEscape(0x42))
        ));
    }

    #[test]
    fn truncated_frame_times_out() {
        const INPUT: [u8; 3] = [0xc0, 0x01, 0x02];

        let err = recv(&mut INPUT.as_ref()).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn consecutive_frames() {
        const INPUT: [u8; 10] = [0xc0, 0x01, 0x02, 0xc0, 0xc0, 0x03, 0xc0, 0xc0, 0x04, 0xc0];

        let reader = &mut INPUT.as_ref();
        assert_eq!(recv(reader).unwrap(), [0x01, 0x02]);
        assert_eq!(recv(reader).unwrap(), [0x03]);
        assert_eq!(recv(reader).unwrap(), [0x04]);
    }

    #[test]
    fn round_trip_special_bytes() {
        let data: Vec<u8> = (0..=255u8).chain([0xc0, 0xdb, 0xdb, 0xc0]).collect();
        let encoded = encode(&data);

        assert_eq!(recv(&mut encoded.as_slice()).unwrap(), data);
    }

    #[test]
    fn send_uses_given_timeout() {
        let (mut port, handle) = MockPort::new();
        let before = handle.timeout();

        send_timeout(&mut port, &[0xc0, 0x01], Duration::from_millis(250)).unwrap();

        assert_eq!(handle.written(), [0xc0, 0xdb, 0xdc, 0x01, 0xc0]);
        assert_eq!(handle.write_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(handle.timeout(), before);
    }

    #[test]
    fn stalled_write_is_an_io_error() {
        let (mut port, handle) = MockPort::new();
        handle.stall_writes();

        let err = send_timeout(&mut port, &[0x01], Duration::from_millis(10)).unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert!(handle.written().is_empty());
    }
}
