//! Batch wire format.
//!
//! A batch is one push message:
//!
//! ```text
//! [16 bytes: system UUID, raw binary form]
//! repeated {
//!   [N+1 bytes: interface name, NUL-terminated]
//!   [4 bytes: capture time, seconds since epoch, big-endian]
//!   [K bytes: Ethernet + IPv4 + TCP/UDP header window]
//! }
//! ```
//!
//! There is no record count or length prefix. Readers delimit the name by its
//! NUL terminator and recover `K` by re-parsing the header window itself.

use uuid::Uuid;

use crate::capture::header::header_window;
pub use crate::error::DecodeError;

/// Length of the binary system identifier that opens every batch.
pub const SYSTEM_ID_LEN: usize = 16;
/// Length of the capture timestamp field.
pub const TIMESTAMP_LEN: usize = 4;

/// Encoded size of one record.
pub fn record_len(interface: &str, header_len: usize) -> usize {
    interface.len() + 1 + TIMESTAMP_LEN + header_len
}

/// One decoded frame record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub interface: String,
    pub timestamp: u32,
    pub header: Vec<u8>,
}

/// Sequential reader over one batch.
pub struct BatchReader<'a> {
    system_id: Uuid,
    data: &'a [u8],
    offset: usize,
}

impl<'a> BatchReader<'a> {
    pub fn new(batch: &'a [u8]) -> Result<Self, DecodeError> {
        let id: [u8; SYSTEM_ID_LEN] = batch
            .get(..SYSTEM_ID_LEN)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(DecodeError::MissingSystemId)?;

        Ok(Self {
            system_id: Uuid::from_bytes(id),
            data: batch,
            offset: SYSTEM_ID_LEN,
        })
    }

    pub fn system_id(&self) -> Uuid {
        self.system_id
    }

    fn read_record(&mut self) -> Result<FrameRecord, DecodeError> {
        let start = self.offset;
        let rest = &self.data[start..];

        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnterminatedInterface { offset: start })?;
        let interface = std::str::from_utf8(&rest[..nul])
            .map_err(|_| DecodeError::InvalidInterface { offset: start })?
            .to_string();

        let ts_start = nul + 1;
        let ts_bytes: [u8; TIMESTAMP_LEN] = rest
            .get(ts_start..ts_start + TIMESTAMP_LEN)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(DecodeError::MissingTimestamp {
                offset: start + ts_start,
            })?;
        let timestamp = u32::from_be_bytes(ts_bytes);

        let header_start = ts_start + TIMESTAMP_LEN;
        let header = &rest[header_start..];
        let window = header_window(header).ok_or(DecodeError::InvalidHeader {
            offset: start + header_start,
        })?;

        self.offset = start + header_start + window;
        Ok(FrameRecord {
            interface,
            timestamp,
            header: header[..window].to_vec(),
        })
    }
}

impl Iterator for BatchReader<'_> {
    type Item = Result<FrameRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let record = self.read_record();
        if record.is_err() {
            // Nothing after a malformed record can be delimited.
            self.offset = self.data.len();
        }
        Some(record)
    }
}

/// Decode a whole batch into its system id and records.
pub fn decode_batch(batch: &[u8]) -> Result<(Uuid, Vec<FrameRecord>), DecodeError> {
    let reader = BatchReader::new(batch)?;
    let system_id = reader.system_id();
    let records = reader.collect::<Result<Vec<_>, _>>()?;
    Ok((system_id, records))
}
