use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Longest key the object store accepts, in bytes.
pub const MAX_KEY_LENGTH: usize = 256;
/// Upper bound on the bucket count chosen at store creation.
pub const MAX_TABLE_SIZE: u32 = 10000;
/// Upper bound on the dispatch pool's worker count.
pub const MAX_CONNECTIONS: usize = 10;
/// Largest serialized record frame, header and separator included.
pub const MAX_FRAME_SIZE: usize = 2048;
/// Session id meaning "no session assigned".
pub const DEFAULT_SESSION_ID: u32 = 0;
/// Longest username the session registry accepts, in bytes.
pub const MAX_USERNAME_LENGTH: usize = 64;
/// Largest session id the registry will hand out.
pub const MAX_SESSION_ID: u32 = 65535;
/// Byte terminating every persisted record frame.
pub const FRAME_SEPARATOR: u8 = 0x1E;
/// Fixed portion of a record frame: three u16 lengths plus the permission byte.
pub const FRAME_HEADER_LEN: usize = 7;
/// Upper bound on a single length-prefixed protocol message.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

pub type CofferResult<T> = Result<T, CofferError>;

/// Error taxonomy shared by every subsystem.
///
/// `NotFound` is an expected outcome for lookups and deletes and is never
/// logged as an error by callers. A duplicate key has no variant here:
/// inserting one is a success no-op, and the persistence loader reports it
/// as a counted skip rather than a failure.
#[derive(Debug, Error)]
pub enum CofferError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("not found")]
    NotFound,
    #[error("record frame exceeds {MAX_FRAME_SIZE} bytes")]
    FrameTooLarge,
    #[error("corrupt record frame: {0}")]
    CorruptFrame(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One owner-tagged entry of the object store.
///
/// `owner_permissions` is the privilege level a requester other than the
/// owner needs in order to see the record.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: Vec<u8>,
    pub owner: String,
    pub owner_permissions: u8,
}

impl Record {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        owner: impl Into<String>,
        owner_permissions: u8,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            owner: owner.into(),
            owner_permissions,
        }
    }
}

/// Encodes one record as a persisted frame, separator included:
/// `u16 key_len | u16 value_len | u16 owner_len | u8 permissions | key | value | owner | 0x1E`,
/// all lengths little-endian.
pub fn encode_frame(record: &Record) -> CofferResult<Vec<u8>> {
    let key = record.key.as_bytes();
    let value = record.value.as_slice();
    let owner = record.owner.as_bytes();

    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(CofferError::InvalidArgument("record key length out of range"));
    }
    if value.len() > u16::MAX as usize || owner.len() > u16::MAX as usize {
        return Err(CofferError::InvalidArgument("record field exceeds u16 length"));
    }

    let total = FRAME_HEADER_LEN + key.len() + value.len() + owner.len() + 1;
    if total > MAX_FRAME_SIZE {
        return Err(CofferError::FrameTooLarge);
    }

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(key.len() as u16).to_le_bytes());
    frame.extend_from_slice(&(value.len() as u16).to_le_bytes());
    frame.extend_from_slice(&(owner.len() as u16).to_le_bytes());
    frame.push(record.owner_permissions);
    frame.extend_from_slice(key);
    frame.extend_from_slice(value);
    frame.extend_from_slice(owner);
    frame.push(FRAME_SEPARATOR);
    Ok(frame)
}

/// Decodes one frame body (the bytes between separators, separator excluded).
///
/// The three length fields must account for every byte of the body; any
/// surplus or shortfall is reported as corruption rather than being read
/// past or silently ignored.
pub fn decode_frame(body: &[u8]) -> CofferResult<Record> {
    if body.len() + 1 > MAX_FRAME_SIZE {
        return Err(CofferError::FrameTooLarge);
    }
    if body.len() < FRAME_HEADER_LEN {
        return Err(CofferError::CorruptFrame("frame shorter than header"));
    }

    let key_len = u16::from_le_bytes([body[0], body[1]]) as usize;
    let value_len = u16::from_le_bytes([body[2], body[3]]) as usize;
    let owner_len = u16::from_le_bytes([body[4], body[5]]) as usize;
    let permissions = body[6];

    if key_len == 0 || key_len > MAX_KEY_LENGTH {
        return Err(CofferError::CorruptFrame("key length out of range"));
    }
    if FRAME_HEADER_LEN + key_len + value_len + owner_len != body.len() {
        return Err(CofferError::CorruptFrame("length fields disagree with frame size"));
    }

    let key_end = FRAME_HEADER_LEN + key_len;
    let value_end = key_end + value_len;
    let key = std::str::from_utf8(&body[FRAME_HEADER_LEN..key_end])
        .map_err(|_| CofferError::CorruptFrame("key is not valid utf-8"))?;
    let owner = std::str::from_utf8(&body[value_end..])
        .map_err(|_| CofferError::CorruptFrame("owner is not valid utf-8"))?;

    Ok(Record {
        key: key.to_owned(),
        value: body[key_end..value_end].to_vec(),
        owner: owner.to_owned(),
        owner_permissions: permissions,
    })
}

/// Client-to-server commands. Every stateful command carries the session id
/// handed out by `Login`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Request {
    Login {
        username: String,
        password: String,
    },
    Logout {
        session_id: u32,
    },
    Put {
        session_id: u32,
        key: String,
        value: Vec<u8>,
        permissions: u8,
    },
    Get {
        session_id: u32,
        key: String,
    },
    Delete {
        session_id: u32,
        key: String,
    },
    Keys {
        session_id: u32,
    },
    Search {
        session_id: u32,
        pattern: String,
    },
}

/// Server-to-client replies.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Response {
    LoggedIn { session_id: u32 },
    LoggedOut,
    Stored,
    Found { record: Record },
    Deleted,
    Keys { keys: Vec<String> },
    Error { reason: String },
}

/// Writes one length-prefixed bincode message: `u32 len (LE) | payload`.
pub fn write_message<T: Serialize>(writer: &mut impl Write, message: &T) -> io::Result<()> {
    let payload = bincode::serialize(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()
}

/// Reads one length-prefixed bincode message written by [`write_message`].
pub fn read_message<T: serde::de::DeserializeOwned>(reader: &mut impl Read) -> io::Result<T> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    bincode::deserialize(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
