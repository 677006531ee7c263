//! Parsing the byte stream read from a capture endpoint.
//!
//! The driver produces a pcap stream: one global header, then records made of
//! a pcap record header, a USBPcap packet header and the captured data.
//!
//! ```text
//! Offset  Size  Field
//! --- pcap record header ---
//! 0       4     ts_sec
//! 4       4     ts_usec
//! 8       4     incl_len
//! 12      4     orig_len
//! --- USBPcap packet header ---
//! 16      2     headerLen
//! 18      8     irpId
//! 26      4     status
//! 30      2     function
//! 32      1     info (bit 0 = direction: 0=OUT, 1=IN)
//! 33      2     bus
//! 35      2     device
//! 37      1     endpoint
//! 38      1     transfer (0=iso, 1=int, 2=ctrl, 3=bulk)
//! 39      4     dataLength
//! 43            data
//! ```
//!
//! All fields are little endian and unaligned.

use log::{debug, trace};

/// Size of the pcap global header.
pub const GLOBAL_HEADER_LEN: usize = 24;

/// Size of the pcap record header.
pub const RECORD_HEADER_LEN: usize = 16;

/// Size of the USBPcap packet header common to all transfer types.
pub const PACKET_HEADER_LEN: usize = 27;

/// Size of the record header and packet header together.
pub const ENVELOPE_HEADER_LEN: usize = RECORD_HEADER_LEN + PACKET_HEADER_LEN;

/// pcap magic number for microsecond timestamps, as read little endian.
pub const PCAP_MAGIC: u32 = 0xa1b2c3d4;

/// pcap link type of USBPcap captures.
pub const LINKTYPE_USBPCAP: u32 = 249;

/// `URB_FUNCTION_BULK_OR_INTERRUPT_TRANSFER`
pub const URB_FUNCTION_BULK_OR_INTERRUPT_TRANSFER: u16 = 0x0009;

fn u16_at(b: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([b[i], b[i + 1]])
}

fn u32_at(b: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]])
}

fn u64_at(b: &[u8], i: usize) -> u64 {
    let mut v = [0; 8];
    v.copy_from_slice(&b[i..i + 8]);
    u64::from_le_bytes(v)
}

/// pcap global header, sent once at the start of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalHeader {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    pub thiszone: i32,
    pub sigfigs: u32,
    pub snaplen: u32,
    pub network: u32,
}

impl GlobalHeader {
    /// Parse a global header. Returns `None` if `buf` is too short or the
    /// magic number does not match.
    pub fn parse(buf: &[u8]) -> Option<GlobalHeader> {
        if buf.len() < GLOBAL_HEADER_LEN || u32_at(buf, 0) != PCAP_MAGIC {
            return None;
        }
        Some(GlobalHeader {
            magic: u32_at(buf, 0),
            version_major: u16_at(buf, 4),
            version_minor: u16_at(buf, 6),
            thiszone: u32_at(buf, 8) as i32,
            sigfigs: u32_at(buf, 12),
            snaplen: u32_at(buf, 16),
            network: u32_at(buf, 20),
        })
    }
}

/// pcap record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub ts_sec: u32,
    pub ts_usec: u32,

    /// Number of bytes of the record present in the stream after this header.
    pub incl_len: u32,

    /// Length of the record before truncation to the snapshot length.
    pub orig_len: u32,
}

/// USB transfer type from the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Isochronous,
    Interrupt,
    Control,
    Bulk,
    Unknown(u8),
}

impl From<u8> for TransferType {
    fn from(b: u8) -> Self {
        match b {
            0 => TransferType::Isochronous,
            1 => TransferType::Interrupt,
            2 => TransferType::Control,
            3 => TransferType::Bulk,
            other => TransferType::Unknown(other),
        }
    }
}

/// USBPcap packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Length of the packet header including transfer-specific fields.
    pub header_len: u16,
    pub irp_id: u64,

    /// `USBD_STATUS` of the request.
    pub status: u32,

    /// URB function code.
    pub function: u16,
    pub info: u8,
    pub bus: u16,
    pub device: u16,
    pub endpoint: u8,
    pub transfer: TransferType,

    /// Number of data bytes following the header.
    pub data_length: u32,
}

impl PacketHeader {
    /// Transfer direction is device to host.
    pub fn is_in(&self) -> bool {
        self.info & 0x01 != 0
    }
}

/// Metadata preceding each payload in the capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub record: RecordHeader,
    pub packet: PacketHeader,
}

impl EnvelopeHeader {
    /// Parse the header at the start of `buf`. Returns `None` if `buf` is
    /// shorter than [`ENVELOPE_HEADER_LEN`].
    pub fn parse(buf: &[u8]) -> Option<EnvelopeHeader> {
        if buf.len() < ENVELOPE_HEADER_LEN {
            return None;
        }
        let p = &buf[RECORD_HEADER_LEN..];
        Some(EnvelopeHeader {
            record: RecordHeader {
                ts_sec: u32_at(buf, 0),
                ts_usec: u32_at(buf, 4),
                incl_len: u32_at(buf, 8),
                orig_len: u32_at(buf, 12),
            },
            packet: PacketHeader {
                header_len: u16_at(p, 0),
                irp_id: u64_at(p, 2),
                status: u32_at(p, 10),
                function: u16_at(p, 14),
                info: p[16],
                bus: u16_at(p, 17),
                device: u16_at(p, 19),
                endpoint: p[21],
                transfer: p[22].into(),
                data_length: u32_at(p, 23),
            },
        })
    }

    /// Whether this record carries bulk or interrupt data worth forwarding.
    pub fn is_bulk_or_interrupt_data(&self) -> bool {
        self.packet.function == URB_FUNCTION_BULK_OR_INTERRUPT_TRANSFER
            && self.packet.data_length != 0
    }

    /// The payload of the record in `buf`, which must start at this header.
    ///
    /// A transfer longer than the snapshot length is captured with `incl_len`
    /// smaller than the full packet; its payload is cut to the bytes present
    /// in the record.
    ///
    /// Returns `None` for records other than bulk/interrupt transfers, for
    /// empty transfers, and when `buf` is shorter than the record.
    pub fn payload<'a>(&self, buf: &'a [u8]) -> Option<&'a [u8]> {
        if !self.is_bulk_or_interrupt_data() {
            return None;
        }
        let record_end = RECORD_HEADER_LEN.checked_add(self.record.incl_len as usize)?;
        let record = buf.get(..record_end)?;
        let end = ENVELOPE_HEADER_LEN
            .checked_add(self.packet.data_length as usize)?
            .min(record.len());
        record.get(ENVELOPE_HEADER_LEN..end)
    }

    /// Whether the snapshot length cut off part of the transfer data.
    pub fn is_truncated(&self) -> bool {
        (self.record.incl_len as u64) < PACKET_HEADER_LEN as u64 + self.packet.data_length as u64
    }
}

/// Extract the bulk or interrupt payload from the bytes of one read.
///
/// A read exactly the size of the global header is the capture handshake and
/// yields nothing. Otherwise the read is expected to start with a record;
/// only its payload is considered. A transfer cut short by the snapshot
/// length yields the captured part.
pub fn decode(buf: &[u8]) -> Option<&[u8]> {
    if buf.len() == GLOBAL_HEADER_LEN {
        if let Some(h) = GlobalHeader::parse(buf) {
            debug!(
                "Capture started: pcap {}.{}, snaplen {}, link type {}",
                h.version_major, h.version_minor, h.snaplen, h.network
            );
        }
        return None;
    }

    let header = EnvelopeHeader::parse(buf)?;
    let payload = header.payload(buf);
    if payload.is_none() {
        trace!(
            "Dropping record: function {:#06x}, {} data bytes",
            header.packet.function,
            header.packet.data_length
        );
    }
    payload
}

/// One record of a capture stream.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub header: EnvelopeHeader,

    /// The whole record, starting with its header.
    pub bytes: &'a [u8],
}

impl<'a> Record<'a> {
    pub fn payload(&self) -> Option<&'a [u8]> {
        self.header.payload(self.bytes)
    }
}

/// Iterator over the records in a buffer, returned by [`records`].
#[derive(Debug, Clone)]
pub struct Records<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for Records<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Record<'a>> {
        if self.buf.is_empty() {
            return None;
        }

        let header = EnvelopeHeader::parse(self.buf);
        let len = header.and_then(|h| RECORD_HEADER_LEN.checked_add(h.record.incl_len as usize));

        match (header, len) {
            (Some(header), Some(len)) if len >= ENVELOPE_HEADER_LEN && len <= self.buf.len() => {
                let (bytes, rest) = self.buf.split_at(len);
                self.buf = rest;
                Some(Record { header, bytes })
            }
            _ => {
                trace!("Malformed record, dropping {} bytes", self.buf.len());
                self.buf = &[];
                None
            }
        }
    }
}

/// Iterate over the records in `buf`, which must start at a record boundary.
///
/// Iteration ends at the first record that is truncated or whose length is
/// inconsistent.
pub fn records(buf: &[u8]) -> Records<'_> {
    Records { buf }
}

/// Iterate over the bulk and interrupt payloads of every record in one read.
///
/// A leading global header is skipped. For a read holding a single record this
/// yields the same payload as [`decode`].
pub fn payloads(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    let buf = if GlobalHeader::parse(buf).is_some() {
        &buf[GLOBAL_HEADER_LEN..]
    } else {
        buf
    };
    records(buf).filter_map(|r| r.payload())
}
