//! Client socket framing
//!
//! Every packet on the client socket is `packet_type | channel | length |
//! payload`, all header fields little endian.

use std::fmt;
use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::constants::*;
use super::ProtocolError;

/// One framed packet
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: u16,
    pub channel: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: u16, channel: u16, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            channel,
            payload,
        }
    }

    /// An HCI event packet on channel 0
    pub fn event(payload: Vec<u8>) -> Self {
        Self::new(HCI_EVENT_PACKET, 0, payload)
    }

    pub fn is_event(&self) -> bool {
        self.packet_type == HCI_EVENT_PACKET
    }

    /// First payload byte, the event code for event packets
    pub fn event_code(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Serialize with the frame header
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let length = u16::try_from(self.payload.len())
            .map_err(|_| ProtocolError::PayloadTooLong(self.payload.len()))?;
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        // Writes into a Vec cannot fail
        let _ = out.write_u16::<LittleEndian>(self.packet_type);
        let _ = out.write_u16::<LittleEndian>(self.channel);
        let _ = out.write_u16::<LittleEndian>(length);
        let _ = out.write_all(&self.payload);
        Ok(out)
    }

    /// Parse exactly one frame
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (packet_type, channel, length) = parse_header(data)?;
        let payload = &data[FRAME_HEADER_LEN..];
        if payload.len() != length {
            return Err(ProtocolError::LengthMismatch {
                declared: length,
                actual: payload.len(),
            });
        }
        Ok(Self::new(packet_type, channel, payload.to_vec()))
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("packet_type", &format_args!("0x{:02x}", self.packet_type))
            .field("channel", &format_args!("0x{:04x}", self.channel))
            .field("payload", &hex::encode(&self.payload))
            .finish()
    }
}

fn parse_header(data: &[u8]) -> Result<(u16, u16, usize), ProtocolError> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(ProtocolError::FrameTooShort(data.len()));
    }
    let mut cursor = Cursor::new(data);
    let packet_type = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| ProtocolError::FrameTooShort(data.len()))?;
    let channel = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| ProtocolError::FrameTooShort(data.len()))?;
    let length = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| ProtocolError::FrameTooShort(data.len()))?;
    Ok((packet_type, channel, usize::from(length)))
}

/// Splits a byte stream into frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete frame, if one is buffered
    pub fn next_packet(&mut self) -> Option<Packet> {
        let (packet_type, channel, length) = parse_header(&self.buffer).ok()?;
        let total = FRAME_HEADER_LEN + length;
        if self.buffer.len() < total {
            return None;
        }
        let payload = self.buffer[FRAME_HEADER_LEN..total].to_vec();
        self.buffer.drain(..total);
        Some(Packet::new(packet_type, channel, payload))
    }

    /// Bytes waiting for the rest of their frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
