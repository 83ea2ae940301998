//! Wire codec primitives
//!
//! All coordination messages are opcode-tagged big-endian byte streams.
//! Strings travel as a u16 length prefix followed by UTF-8 bytes. A log
//! identifier may be absent; absence is encoded as the (-1, -1, -1) sentinel
//! and decodes back to `None`.

use crate::common::{Error, Result};
use crate::coordinator::log::LogId;
use bytes::{Buf, BufMut, BytesMut};

// Message opcodes. Stable: these tag bytes on the wire.
pub const OP_LAST_OPID_REQUEST: u8 = 1;
pub const OP_LAST_OPID_RESPONSE: u8 = 2;
pub const OP_SYNC_REQUEST: u8 = 3;
pub const OP_TX_PHASE1: u8 = 4;
pub const OP_TX_PHASE2: u8 = 5;
pub const OP_TX_SUBMIT: u8 = 6;

/// Write a string as u16 length + UTF-8 bytes. Strings longer than the u16
/// length prefix can carry are rejected rather than silently wrapped.
pub fn put_utf(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(Error::Wire(format!(
            "string too long for wire: {} bytes",
            s.len()
        )));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Read a u16-length-prefixed UTF-8 string.
pub fn get_utf(buf: &mut impl Buf) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(Error::Wire("truncated string length".into()));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(Error::Wire("truncated string body".into()));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| Error::Wire("invalid UTF-8 in string".into()))
}

/// Write a log identifier, or the all-(-1) sentinel for "absent".
pub fn put_opt_log_id(buf: &mut BytesMut, id: Option<LogId>) {
    match id {
        Some(id) => {
            buf.put_i64(id.id);
            buf.put_i64(id.term);
            buf.put_i64(id.previous_term);
        }
        None => {
            buf.put_i64(-1);
            buf.put_i64(-1);
            buf.put_i64(-1);
        }
    }
}

/// Read a log identifier; the sentinel decodes to `None`.
pub fn get_opt_log_id(buf: &mut impl Buf) -> Result<Option<LogId>> {
    if buf.remaining() < 24 {
        return Err(Error::Wire("truncated log id".into()));
    }
    let id = buf.get_i64();
    let term = buf.get_i64();
    let previous_term = buf.get_i64();
    if id == -1 {
        Ok(None)
    } else {
        Ok(Some(LogId {
            id,
            term,
            previous_term,
        }))
    }
}

/// Write a bool-prefixed optional log identifier (present flag + body).
pub fn put_flagged_log_id(buf: &mut BytesMut, id: Option<LogId>) {
    match id {
        Some(id) => {
            buf.put_u8(1);
            put_opt_log_id(buf, Some(id));
        }
        None => buf.put_u8(0),
    }
}

/// Read a bool-prefixed optional log identifier.
pub fn get_flagged_log_id(buf: &mut impl Buf) -> Result<Option<LogId>> {
    if buf.remaining() < 1 {
        return Err(Error::Wire("truncated presence flag".into()));
    }
    if buf.get_u8() == 1 {
        get_opt_log_id(buf)
    } else {
        Ok(None)
    }
}

pub fn get_u8(buf: &mut impl Buf) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::Wire("truncated byte".into()));
    }
    Ok(buf.get_u8())
}

pub fn get_i32(buf: &mut impl Buf) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(Error::Wire("truncated i32".into()));
    }
    Ok(buf.get_i32())
}

pub fn get_i64(buf: &mut impl Buf) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(Error::Wire("truncated i64".into()));
    }
    Ok(buf.get_i64())
}

/// Read a length-prefixed byte payload.
pub fn get_bytes(buf: &mut impl Buf) -> Result<Vec<u8>> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Err(Error::Wire("negative payload length".into()));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(Error::Wire("truncated payload".into()));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(bytes);
}
