//! Plugin wire protocol
//!
//! Every message travels in one frame:
//!
//! ```text
//! +-----------+--------+---------------------+
//! | len: u32  | op: u8 | body (len - 1 bytes) |
//! +-----------+--------+---------------------+
//! ```
//!
//! All integers are big-endian. Names are `u16` length + UTF-8 bytes.
//!
//! | op | message    | body                                              |
//! |----|------------|---------------------------------------------------|
//! | 1  | REGISTER   | name                                              |
//! | 2  | UNREGISTER | name                                              |
//! | 3  | READ       | seq u32, offset u64, length u64                   |
//! | 4  | WRITE      | seq u32, offset u64, length u64, data             |
//! | 5  | SIZE       | seq u32                                           |
//! | 6  | FINISHED   | seq u32, status i32, length u64, has_data u8, data |
//!
//! Exactly one FINISHED answers every READ, WRITE and SIZE. The answer to
//! SIZE carries the store size in bytes in `length`.

#![allow(clippy::cast_possible_truncation)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tierio_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ── Opcodes ───────────────────────────────────────────────────────────────────

const OP_REGISTER: u8 = 1;
const OP_UNREGISTER: u8 = 2;
const OP_READ: u8 = 3;
const OP_WRITE: u8 = 4;
const OP_SIZE: u8 = 5;
const OP_FINISHED: u8 = 6;

/// Default upper bound for a frame (64 MiB)
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Register {
        name: String,
    },
    Unregister {
        name: String,
    },
    Read {
        seq: u32,
        offset: u64,
        length: u64,
    },
    Write {
        seq: u32,
        offset: u64,
        data: Bytes,
    },
    Size {
        seq: u32,
    },
    Finished {
        seq: u32,
        status: i32,
        length: u64,
        data: Option<Bytes>,
    },
}

impl Message {
    /// Encode into a complete frame, length prefix included
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u32(0); // patched below

        match self {
            Self::Register { name } => {
                buf.put_u8(OP_REGISTER);
                put_name(&mut buf, name);
            }
            Self::Unregister { name } => {
                buf.put_u8(OP_UNREGISTER);
                put_name(&mut buf, name);
            }
            Self::Read {
                seq,
                offset,
                length,
            } => {
                buf.put_u8(OP_READ);
                buf.put_u32(*seq);
                buf.put_u64(*offset);
                buf.put_u64(*length);
            }
            Self::Write { seq, offset, data } => {
                buf.reserve(data.len() + 21);
                buf.put_u8(OP_WRITE);
                buf.put_u32(*seq);
                buf.put_u64(*offset);
                buf.put_u64(data.len() as u64);
                buf.put_slice(data);
            }
            Self::Size { seq } => {
                buf.put_u8(OP_SIZE);
                buf.put_u32(*seq);
            }
            Self::Finished {
                seq,
                status,
                length,
                data,
            } => {
                buf.reserve(data.as_ref().map_or(0, Bytes::len) + 18);
                buf.put_u8(OP_FINISHED);
                buf.put_u32(*seq);
                buf.put_i32(*status);
                buf.put_u64(*length);
                match data {
                    Some(data) => {
                        buf.put_u8(1);
                        buf.put_slice(data);
                    }
                    None => buf.put_u8(0),
                }
            }
        }

        let len = (buf.len() - 4) as u32;
        buf[..4].copy_from_slice(&len.to_be_bytes());
        buf.freeze()
    }

    /// Decode a frame body (everything after the length prefix)
    pub fn decode(mut body: Bytes) -> Result<Self> {
        need(&body, 1, "opcode")?;
        let op = body.get_u8();

        let message = match op {
            OP_REGISTER => Self::Register {
                name: get_name(&mut body)?,
            },
            OP_UNREGISTER => Self::Unregister {
                name: get_name(&mut body)?,
            },
            OP_READ => {
                need(&body, 20, "READ")?;
                Self::Read {
                    seq: body.get_u32(),
                    offset: body.get_u64(),
                    length: body.get_u64(),
                }
            }
            OP_WRITE => {
                need(&body, 20, "WRITE")?;
                let seq = body.get_u32();
                let offset = body.get_u64();
                let length = body.get_u64();
                if body.len() as u64 != length {
                    return Err(Error::Protocol(format!(
                        "WRITE announces {length} bytes, carries {}",
                        body.len()
                    )));
                }
                Self::Write {
                    seq,
                    offset,
                    data: body.split_to(body.len()),
                }
            }
            OP_SIZE => {
                need(&body, 4, "SIZE")?;
                Self::Size { seq: body.get_u32() }
            }
            OP_FINISHED => {
                need(&body, 17, "FINISHED")?;
                let seq = body.get_u32();
                let status = body.get_i32();
                let length = body.get_u64();
                let data = match body.get_u8() {
                    0 => None,
                    _ => Some(body.split_to(body.len())),
                };
                Self::Finished {
                    seq,
                    status,
                    length,
                    data,
                }
            }
            other => return Err(Error::Protocol(format!("unknown opcode {other}"))),
        };

        if body.has_remaining() {
            return Err(Error::Protocol(format!(
                "{} trailing bytes after opcode {op}",
                body.remaining()
            )));
        }
        Ok(message)
    }

    /// Sequence number of a data-plane message
    #[must_use]
    pub const fn seq(&self) -> Option<u32> {
        match self {
            Self::Read { seq, .. }
            | Self::Write { seq, .. }
            | Self::Size { seq }
            | Self::Finished { seq, .. } => Some(*seq),
            Self::Register { .. } | Self::Unregister { .. } => None,
        }
    }
}

fn need(body: &Bytes, len: usize, what: &str) -> Result<()> {
    if body.len() < len {
        return Err(Error::Protocol(format!(
            "{what} needs {len} bytes, got {}",
            body.len()
        )));
    }
    Ok(())
}

/// Names longer than a u16 length allows are cut at a character boundary
fn put_name(buf: &mut BytesMut, name: &str) {
    let mut len = name.len().min(usize::from(u16::MAX));
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    let bytes = &name.as_bytes()[..len];
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn get_name(body: &mut Bytes) -> Result<String> {
    need(body, 2, "name length")?;
    let len = usize::from(body.get_u16());
    need(body, len, "name")?;
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Protocol("name is not UTF-8".into()))
}

// ── Stream helpers ────────────────────────────────────────────────────────────

/// Read one message; `Ok(None)` on a clean end of stream
pub async fn read_message<R>(reader: &mut R, max_frame: usize) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len == 0 || len > max_frame {
        return Err(Error::Protocol(format!(
            "frame of {len} bytes outside 1..={max_frame}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Message::decode(Bytes::from(body)).map(Some)
}

/// Write one message and flush the stream
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    writer.flush().await?;
    Ok(())
}
