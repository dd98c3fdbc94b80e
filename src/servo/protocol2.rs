// Dynamixel Protocol 2.0 over a serial port
//
// Instruction packet: [0xFF, 0xFF, 0xFD, 0x00, ID, LEN_L, LEN_H, Instruction, Params..., CRC_L, CRC_H]
// Status packet:      [0xFF, 0xFF, 0xFD, 0x00, ID, LEN_L, LEN_H, 0x55, Error, Params..., CRC_L, CRC_H]
// LEN counts everything after itself (instruction, error, params, CRC).

use serialport::{self, ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

use super::transport::{BusError, CommError, CommResult, DeviceFault, PacketTransport, StatusFrame};
use super::{BROADCAST_ID, DeviceId};

/// Default serial read timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Packet header bytes
const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    Status = 0x55,
    SyncRead = 0x82,
    SyncWrite = 0x83,
}

/// CRC-16 used by Protocol 2.0 (poly 0x8005, init 0, no reflection)
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Insert 0xFD after every FF FF FD in the parameter field so it can't be
/// mistaken for a header
fn add_stuffing(params: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(params.len() + params.len() / 3);
    for &byte in params {
        out.push(byte);
        if out.ends_with(&[0xFF, 0xFF, 0xFD]) {
            out.push(0xFD);
        }
    }
    out
}

fn remove_stuffing(params: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(params.len());
    let mut i = 0;
    while i < params.len() {
        out.push(params[i]);
        if out.ends_with(&[0xFF, 0xFF, 0xFD]) && params.get(i + 1) == Some(&0xFD) {
            i += 1;
        }
        i += 1;
    }
    out
}

/// Build an instruction packet with header, stuffing and CRC
fn build_packet(id: DeviceId, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    let stuffed = add_stuffing(params);
    let length = (stuffed.len() + 3) as u16; // instruction + params + crc
    let mut packet = Vec::with_capacity(10 + stuffed.len());

    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.extend_from_slice(&length.to_le_bytes());
    packet.push(instruction as u8);
    packet.extend_from_slice(&stuffed);

    let crc = crc16(&packet);
    packet.extend_from_slice(&crc.to_le_bytes());
    packet
}

fn corrupted(reason: String) -> CommError {
    CommError::CorruptedPacket { reason }
}

fn map_read_error(e: std::io::Error) -> CommError {
    if e.kind() == std::io::ErrorKind::TimedOut {
        CommError::Timeout
    } else {
        CommError::Port(e)
    }
}

/// Smallest status LEN: instruction, error and CRC
const MIN_STATUS_LEN: usize = 4;

/// Check the fixed part of a status packet and return its LEN.
///
/// Runs before the body is read, so garbage on the line never turns into a
/// large allocation or a long blocking read.
fn status_body_len(header: &[u8; 7]) -> CommResult<usize> {
    if header[..4] != HEADER {
        return Err(corrupted(format!("invalid header: {:02X?}", &header[..4])));
    }
    let length = u16::from_le_bytes([header[5], header[6]]) as usize;
    if length < MIN_STATUS_LEN {
        return Err(corrupted(format!("status length too short: {}", length)));
    }
    Ok(length)
}

/// Check that a read reply carries exactly the requested number of bytes
fn expect_len(id: DeviceId, data: Vec<u8>, length: u16) -> CommResult<Vec<u8>> {
    if data.len() != length as usize {
        return Err(corrupted(format!(
            "expected {} bytes from device {}, got {}",
            length,
            id,
            data.len()
        )));
    }
    Ok(data)
}

/// Parse one status packet.
///
/// `header` is the 7 bytes up to and including LEN, `body` the LEN bytes
/// that follow.
fn parse_status(header: &[u8; 7], body: &[u8]) -> CommResult<StatusFrame> {
    status_body_len(header)?;
    if body.len() < MIN_STATUS_LEN {
        return Err(corrupted(format!("status body too short: {} bytes", body.len())));
    }

    let (content, crc_bytes) = body.split_at(body.len() - 2);
    let mut crc_data = header.to_vec();
    crc_data.extend_from_slice(content);
    let expected = crc16(&crc_data);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if expected != received {
        return Err(corrupted(format!(
            "CRC mismatch for device {}: expected {:04X}, got {:04X}",
            header[4], expected, received
        )));
    }

    if content[0] != Instruction::Status as u8 {
        return Err(corrupted(format!("not a status packet: 0x{:02X}", content[0])));
    }

    Ok(StatusFrame {
        id: header[4],
        error: content[1],
        data: remove_stuffing(&content[2..]),
    })
}

/// Serial bus speaking Protocol 2.0
pub struct Protocol2Bus {
    port: Box<dyn SerialPort>,
}

impl Protocol2Bus {
    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> CommResult<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self { port })
    }

    fn send_packet(&mut self, packet: &[u8]) -> CommResult {
        // Drop anything left over from an earlier, timed out exchange
        self.port.clear(ClearBuffer::Input)?;
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read one status packet off the wire
    fn read_status(&mut self) -> CommResult<StatusFrame> {
        let mut header = [0u8; 7];
        self.port.read_exact(&mut header).map_err(map_read_error)?;

        let length = status_body_len(&header)?;
        let mut body = vec![0u8; length];
        self.port.read_exact(&mut body).map_err(map_read_error)?;

        parse_status(&header, &body)
    }

    /// Read the status reply for `expected_id` and turn its error byte into a `BusError`
    fn read_response(&mut self, expected_id: DeviceId) -> Result<Vec<u8>, BusError> {
        let frame = self.read_status()?;
        if frame.id != expected_id {
            return Err(corrupted(format!(
                "ID mismatch: expected {}, got {}",
                expected_id, frame.id
            ))
            .into());
        }
        if frame.error != 0 {
            return Err(BusError::Device {
                id: frame.id,
                fault: DeviceFault { code: frame.error },
            });
        }
        Ok(frame.data)
    }
}

impl PacketTransport for Protocol2Bus {
    fn ping(&mut self, id: DeviceId) -> Result<(), BusError> {
        let packet = build_packet(id, Instruction::Ping, &[]);
        self.send_packet(&packet)?;
        self.read_response(id).map(|_| ())
    }

    fn write(&mut self, id: DeviceId, address: u16, data: &[u8]) -> Result<(), BusError> {
        let mut params = address.to_le_bytes().to_vec();
        params.extend_from_slice(data);
        let packet = build_packet(id, Instruction::Write, &params);
        debug!("Write to device {}: addr={}, data={:02X?}", id, address, data);
        self.send_packet(&packet)?;

        let _ = self.read_response(id)?;
        Ok(())
    }

    fn read(&mut self, id: DeviceId, address: u16, length: u16) -> Result<Vec<u8>, BusError> {
        let mut params = address.to_le_bytes().to_vec();
        params.extend_from_slice(&length.to_le_bytes());
        let packet = build_packet(id, Instruction::Read, &params);
        self.send_packet(&packet)?;

        let data = self.read_response(id)?;
        Ok(expect_len(id, data, length)?)
    }

    fn sync_write(&mut self, address: u16, width: u16, payload: &[u8]) -> CommResult {
        // [addr_l, addr_h, len_l, len_h, id1, data1..., id2, data2..., ...]
        let mut params = Vec::with_capacity(4 + payload.len());
        params.extend_from_slice(&address.to_le_bytes());
        params.extend_from_slice(&width.to_le_bytes());
        params.extend_from_slice(payload);

        let packet = build_packet(BROADCAST_ID, Instruction::SyncWrite, &params);
        self.send_packet(&packet)?;

        // Sync write has no response
        Ok(())
    }

    fn sync_read(&mut self, address: u16, width: u16, ids: &[DeviceId]) -> CommResult<Vec<StatusFrame>> {
        // [addr_l, addr_h, len_l, len_h, id1, id2, ...]
        let mut params = Vec::with_capacity(4 + ids.len());
        params.extend_from_slice(&address.to_le_bytes());
        params.extend_from_slice(&width.to_le_bytes());
        params.extend_from_slice(ids);

        let packet = build_packet(BROADCAST_ID, Instruction::SyncRead, &params);
        debug!("Sync read from {} devices: addr={}", ids.len(), address);
        self.send_packet(&packet)?;

        // Devices answer one after another in request order
        let mut frames = Vec::with_capacity(ids.len());
        for _ in ids {
            frames.push(self.read_status()?);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16() {
        // CRC-16/BUYPASS check value
        assert_eq!(crc16(b"123456789"), 0xFEE8);
    }

    #[test]
    fn test_ping_packet() {
        // Reference ping for ID 1 from the protocol manual
        let packet = build_packet(1, Instruction::Ping, &[]);
        assert_eq!(
            packet,
            vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x03, 0x00, 0x01, 0x19, 0x4E]
        );
    }

    #[test]
    fn test_sync_write_layout() {
        // Goal position 150 on IDs 1 and 2, address 116, 4 bytes each
        let params = [
            0x74, 0x00, 0x04, 0x00, 0x01, 0x96, 0x00, 0x00, 0x00, 0x02, 0x96, 0x00, 0x00, 0x00,
        ];
        let packet = build_packet(BROADCAST_ID, Instruction::SyncWrite, &params);
        assert_eq!(packet[4], 0xFE);
        assert_eq!(u16::from_le_bytes([packet[5], packet[6]]), 17);
        assert_eq!(packet[7], 0x83);
        assert_eq!(&packet[8..22], &params);
    }

    #[test]
    fn test_stuffing_round_trip() {
        let raw = [0x01, 0xFF, 0xFF, 0xFD, 0x02];
        let stuffed = add_stuffing(&raw);
        assert_eq!(stuffed, vec![0x01, 0xFF, 0xFF, 0xFD, 0xFD, 0x02]);
        assert_eq!(remove_stuffing(&stuffed), raw.to_vec());
    }

    #[test]
    fn test_parse_status() {
        // Status from ID 1: error 0, params [0xD0, 0x07, 0x00, 0x00]
        let mut packet = vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x08, 0x00, 0x55, 0x00, 0xD0, 0x07, 0x00, 0x00];
        let crc = crc16(&packet);
        packet.extend_from_slice(&crc.to_le_bytes());

        let header: [u8; 7] = packet[..7].try_into().unwrap();
        let frame = parse_status(&header, &packet[7..]).unwrap();
        assert_eq!(frame.id, 1);
        assert_eq!(frame.error, 0);
        assert_eq!(frame.data, vec![0xD0, 0x07, 0x00, 0x00]);
    }

    #[test]
    fn test_parse_status_bad_crc() {
        let header = [0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x04, 0x00];
        let body = [0x55, 0x00, 0x00, 0x00];
        assert!(matches!(
            parse_status(&header, &body),
            Err(CommError::CorruptedPacket { .. })
        ));
    }

    #[test]
    fn test_invalid_header_rejected_before_body() {
        // Line noise with a huge LEN must fail on the header alone
        let header = [0x00, 0x00, 0x00, 0x00, 0x01, 0xFF, 0xFF];
        assert!(matches!(
            status_body_len(&header),
            Err(CommError::CorruptedPacket { .. })
        ));
    }

    #[test]
    fn test_short_status_length_rejected() {
        // LEN 3 can't hold instruction, error and CRC
        let header = [0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x03, 0x00];
        assert!(matches!(
            status_body_len(&header),
            Err(CommError::CorruptedPacket { .. })
        ));

        let header = [0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x08, 0x00];
        assert_eq!(status_body_len(&header).unwrap(), 8);
    }

    #[test]
    fn test_parse_status_bad_header() {
        let header = [0xFF, 0xFF, 0xFF, 0x00, 0x01, 0x04, 0x00];
        let body = [0x55, 0x00, 0x00, 0x00];
        assert!(matches!(
            parse_status(&header, &body),
            Err(CommError::CorruptedPacket { .. })
        ));
    }

    #[test]
    fn test_parse_status_short_body() {
        let header = [0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x04, 0x00];
        let body = [0x55, 0x00];
        assert!(matches!(
            parse_status(&header, &body),
            Err(CommError::CorruptedPacket { .. })
        ));
    }

    #[test]
    fn test_read_length_mismatch() {
        assert_eq!(expect_len(1, vec![0xD0, 0x07], 2).unwrap(), vec![0xD0, 0x07]);
        assert!(matches!(
            expect_len(1, vec![0xD0], 4),
            Err(CommError::CorruptedPacket { .. })
        ));
    }
}
