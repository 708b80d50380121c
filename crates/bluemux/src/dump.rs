//! Packet dump
//!
//! Every packet exchanged with clients can be recorded, either to the log at
//! trace level or to a file in PacketLogger format readable by common
//! Bluetooth trace viewers.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, WriteBytesExt};
use log::trace;

use crate::protocol::constants::*;
use crate::protocol::Packet;

/// Which way a packet travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to daemon
    Inbound,
    /// Daemon to client
    Outbound,
}

/// Sink for packet traces
pub trait PacketDump {
    fn record(&mut self, direction: Direction, packet: &Packet) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes packets to the log at trace level
#[derive(Debug, Default)]
pub struct LogDump;

impl PacketDump for LogDump {
    fn record(&mut self, direction: Direction, packet: &Packet) -> io::Result<()> {
        let arrow = match direction {
            Direction::Inbound => "<-",
            Direction::Outbound => "->",
        };
        trace!(
            "{} type 0x{:02x} channel 0x{:04x}: {}",
            arrow,
            packet.packet_type,
            packet.channel,
            hex::encode(&packet.payload)
        );
        Ok(())
    }
}

// PacketLogger record types
const PKLG_COMMAND: u8 = 0x00;
const PKLG_EVENT: u8 = 0x01;
const PKLG_ACL_SENT: u8 = 0x02;
const PKLG_ACL_RECEIVED: u8 = 0x03;
const PKLG_LOG_MESSAGE: u8 = 0xFC;

/// PacketLogger record type for a client packet
fn record_type(direction: Direction, packet: &Packet) -> u8 {
    match packet.packet_type {
        HCI_COMMAND_DATA_PACKET => PKLG_COMMAND,
        HCI_EVENT_PACKET | SDP_CLIENT_PACKET | DAEMON_EVENT_PACKET => PKLG_EVENT,
        HCI_ACL_DATA_PACKET | L2CAP_DATA_PACKET | RFCOMM_DATA_PACKET => match direction {
            Direction::Inbound => PKLG_ACL_SENT,
            Direction::Outbound => PKLG_ACL_RECEIVED,
        },
        _ => PKLG_LOG_MESSAGE,
    }
}

/// PacketLogger file: `len u32 | secs u32 | usecs u32 | type u8 | payload`, big endian
pub struct PacketLoggerFile<W: Write> {
    writer: W,
}

impl PacketLoggerFile<BufWriter<File>> {
    /// Create (truncate) a dump file
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> PacketLoggerFile<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one record with an explicit timestamp
    pub fn record_at(
        &mut self,
        direction: Direction,
        packet: &Packet,
        timestamp: SystemTime,
    ) -> io::Result<()> {
        let since_epoch = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
        let len = u32::try_from(9 + packet.payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "packet too large"))?;

        self.writer.write_u32::<BigEndian>(len)?;
        self.writer
            .write_u32::<BigEndian>(since_epoch.as_secs() as u32)?;
        self.writer.write_u32::<BigEndian>(since_epoch.subsec_micros())?;
        self.writer.write_u8(record_type(direction, packet))?;
        self.writer.write_all(&packet.payload)?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> PacketDump for PacketLoggerFile<W> {
    fn record(&mut self, direction: Direction, packet: &Packet) -> io::Result<()> {
        self.record_at(direction, packet, SystemTime::now())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
