use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_header::*;
use super::*;

/// A chunk of a type this crate does not implement. The raw value is kept
/// so the chunk can be reported back in an ERROR(Unrecognized Chunk Type).
#[derive(Default, Debug, Clone)]
pub(crate) struct ChunkUnknown {
    pub(crate) typ: u8,
    pub(crate) flags: u8,
    pub(crate) value: Bytes,
}

impl fmt::Display for ChunkUnknown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header())
    }
}

impl Chunk for ChunkUnknown {
    fn header(&self) -> ChunkHeader {
        ChunkHeader {
            typ: chunk_type::ChunkType(self.typ),
            flags: self.flags,
            value_length: self.value.len() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        Ok(ChunkUnknown {
            typ: header.typ.0,
            flags: header.flags,
            value: raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length()),
        })
    }

    fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(writer)?;
        writer.extend_from_slice(&self.value);
        Ok(writer.len())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn value_length(&self) -> usize {
        self.value.len()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
