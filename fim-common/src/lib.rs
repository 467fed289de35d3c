#![cfg_attr(not(feature = "user"), no_std)]
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const TASK_COMM_LEN: usize = 16;
/// kernel table holding watched inodes
pub const RULES_MAP: &str = "rules";
/// perf event array the probe writes `RawEvent`s into
pub const EVENTS_MAP: &str = "events";
/// value stored for every watched key
pub const WATCH_FLAG: i32 = 1;

/// Encoded form of a kernel-key as handed to the rules table.
pub type RuleKey = [u8; 8];

#[repr(i32)]
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum EventMode {
    Write = 0,
    Rename = 1,
    /// never produced by the kernel, injected when a missing file shows up
    Found = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DecodeError {
    #[display("record is {_0} bytes, expected at least 48")]
    Short(usize),
    #[display("kernel key is {_0} bytes, expected 8")]
    KeyLength(usize),
}

#[cfg(feature = "user")]
impl std::error::Error for DecodeError {}

/// Record emitted by the probe on every write/rename of a watched inode.
///
/// Layout is little-endian: mode(4) pid(4) uid(4) size(4) inode(8) device(8) comm(16).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RawEvent {
    pub mode: i32,
    pub pid: u32,
    pub uid: u32,
    pub size: u32,
    pub inode: u64,
    pub device: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

const _: () = assert!(core::mem::size_of::<RawEvent>() == RawEvent::SIZE);

impl RawEvent {
    pub const SIZE: usize = 48;

    /// Decodes one record. Bytes past `SIZE` are perf padding and ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let record: &[u8; Self::SIZE] = buf
            .get(..Self::SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(DecodeError::Short(buf.len()))?;
        Ok(Self {
            mode: i32::from_le_bytes(field(record, 0)),
            pid: u32::from_le_bytes(field(record, 4)),
            uid: u32::from_le_bytes(field(record, 8)),
            size: u32::from_le_bytes(field(record, 12)),
            inode: u64::from_le_bytes(field(record, 16)),
            device: u64::from_le_bytes(field(record, 24)),
            comm: field(record, 32),
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.mode.to_le_bytes());
        out[4..8].copy_from_slice(&self.pid.to_le_bytes());
        out[8..12].copy_from_slice(&self.uid.to_le_bytes());
        out[12..16].copy_from_slice(&self.size.to_le_bytes());
        out[16..24].copy_from_slice(&self.inode.to_le_bytes());
        out[24..32].copy_from_slice(&self.device.to_le_bytes());
        out[32..48].copy_from_slice(&self.comm);
        out
    }

    /// kernel comm up to the first NUL
    pub fn comm(&self) -> &[u8] {
        let end = self
            .comm
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(TASK_COMM_LEN);
        &self.comm[..end]
    }
}

fn field<const N: usize>(record: &[u8; RawEvent::SIZE], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&record[at..at + N]);
    out
}

pub fn encode_key(inode: u64) -> RuleKey {
    inode.to_le_bytes()
}

pub fn decode_key(buf: &[u8]) -> Result<u64, DecodeError> {
    let key: RuleKey = buf
        .try_into()
        .map_err(|_| DecodeError::KeyLength(buf.len()))?;
    Ok(u64::from_le_bytes(key))
}
