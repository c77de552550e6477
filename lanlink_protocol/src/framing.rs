// Length-delimited message framing for the reliable (TCP) channel.
//
// Wire format: a 4-byte little-endian length prefix followed by exactly that
// many payload bytes. Little-endian is fixed on both sides so that peers on
// any architecture agree; deployed clients already speak it. The payload is
// UTF-8 text from the vocabulary in `message.rs`, but this module stays
// byte-oriented and leaves decoding to the caller.
//
// The handshake is the one exchange that does not use this framing: the
// client's first write is the raw display name. Everything after it, in both
// directions, goes through `write_message` / `read_message`.
//
// `read_message` is split into `read_length` and `read_body` so the server can
// apply different read timeouts to the two halves of a frame (long idle wait
// for the prefix, short stall tolerance for the body).
//
// A `MAX_MESSAGE_SIZE` constant (16 MB) protects against unbounded allocation
// from malformed length prefixes.

use std::io::{self, Read, Write};

/// Maximum allowed message size (16 MB). Control traffic is small text; the
/// largest expected frames are user lists and file metadata.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Write a length-delimited message: 4-byte little-endian length, then payload.
///
/// Prefix and payload are written as a single buffer so that a writer shared
/// behind a lock never emits a prefix without its body.
pub fn write_message<W: Write>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    let len = u32::try_from(msg.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
                    msg.len()
                ),
            )
        })?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + msg.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(msg);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read just the 4-byte length prefix of the next frame.
///
/// Returns `InvalidData` if the announced length exceeds `MAX_MESSAGE_SIZE`.
pub fn read_length<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    Ok(len)
}

/// Read exactly `len` payload bytes following a length prefix.
pub fn read_body<R: Read>(reader: &mut R, len: u32) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read a length-delimited message: 4-byte little-endian length, then payload.
///
/// Returns `UnexpectedEof` if the stream closes before or during a message.
/// Returns `InvalidData` if the length exceeds `MAX_MESSAGE_SIZE`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = read_length(reader)?;
    read_body(reader, len)
}
