//! CCSDS space packet primary header.
//!
//! The router is protocol-agnostic and never reframes a datagram; this view
//! exists so that traffic can be labelled in logs and by client tooling.
//!
//! ```text
//! | version:3 | type:1 | sec_hdr:1 | apid:11 |   packet id
//! | seq_flags:2 |      seq_count:14         |   sequence control
//! |            data_len:16                  |   octets in data field - 1
//! ```

use byte_struct::*;
pub use byte_struct::{ByteStruct, ByteStructLen};

use crate::enum_with_unknown;

enum_with_unknown! {
    /// Direction of a packet, from the point of view of the flight target
    pub enum PacketType(u8) {
        Telemetry = 0,
        Command = 1,
    }
}

enum_with_unknown! {
    /// Segmentation of user data across consecutive packets
    pub enum SequenceFlags(u8) {
        Continuation = 0,
        First = 1,
        Last = 2,
        Unsegmented = 3,
    }
}

/// Raw big-endian primary header words.
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[byte_struct_be]
pub struct PrimaryHeader {
    pub packet_id: u16,
    pub sequence: u16,
    pub data_len: u16,
}

impl PrimaryHeader {
    /// Read the header from the front of a datagram, if there are enough bytes.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::BYTE_LEN {
            return None;
        }
        Some(Self::read_bytes(&bytes[..Self::BYTE_LEN]))
    }

    pub fn version(&self) -> u8 {
        (self.packet_id >> 13) as u8
    }

    pub fn packet_type(&self) -> PacketType {
        PacketType::from(((self.packet_id >> 12) & 0x1) as u8)
    }

    pub fn has_secondary_header(&self) -> bool {
        self.packet_id & 0x0800 != 0
    }

    /// Application process identifier
    pub fn apid(&self) -> u16 {
        self.packet_id & 0x07FF
    }

    pub fn sequence_flags(&self) -> SequenceFlags {
        SequenceFlags::from((self.sequence >> 14) as u8)
    }

    pub fn sequence_count(&self) -> u16 {
        self.sequence & 0x3FFF
    }

    /// Total length of the packet described by this header, header included.
    pub fn packet_len(&self) -> usize {
        Self::BYTE_LEN + self.data_len as usize + 1
    }
}
