use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::chunk_type::*;
use super::*;

pub(crate) const CHUNK_HEADER_SIZE: usize = 4;

/// The type / flags / length triple in front of every chunk,
/// RFC 4960 sec 3.2. The length on the wire includes this header but not
/// the trailing padding; `value_length` stores it with the header already
/// subtracted.
#[derive(Debug, Clone)]
pub(crate) struct ChunkHeader {
    pub(crate) typ: ChunkType,
    pub(crate) flags: u8,
    pub(crate) value_length: u16,
}

impl fmt::Display for ChunkHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.typ)
    }
}

impl Chunk for ChunkHeader {
    fn header(&self) -> ChunkHeader {
        self.clone()
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < CHUNK_HEADER_SIZE {
            return Err(Error::ErrChunkHeaderTooSmall);
        }

        let reader = &mut raw.clone();

        let typ = ChunkType(reader.get_u8());
        let flags = reader.get_u8();
        let length = reader.get_u16() as usize;

        if length < CHUNK_HEADER_SIZE || length > raw.len() {
            return Err(Error::ErrChunkHeaderInvalidLength);
        }

        let trailing = raw.len() - length;
        if trailing > 0 && trailing < 4 {
            // Up to 3 bytes of padding may follow the last chunk of a packet;
            // they must all be zero.
            for i in 0..trailing {
                if raw[length + i] != 0 {
                    return Err(Error::ErrChunkHeaderPaddingNonZero);
                }
            }
        }

        Ok(ChunkHeader {
            typ,
            flags,
            value_length: (length - CHUNK_HEADER_SIZE) as u16,
        })
    }

    fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        writer.put_u8(self.typ.0);
        writer.put_u8(self.flags);
        writer.put_u16(self.value_length + CHUNK_HEADER_SIZE as u16);
        Ok(writer.len())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn value_length(&self) -> usize {
        self.value_length as usize
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
