use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_header::*;
use super::chunk_type::*;
use super::*;
use crate::param::param_header::PARAM_HEADER_LENGTH;
use crate::param::{build_param, Param};
use crate::util::get_padding_size;

/// RECONFIG chunk, RFC 6525 sec 3.1. Holds one mandatory and one optional
/// re-configuration parameter.
#[derive(Default, Debug)]
pub(crate) struct ChunkReconfig {
    pub(crate) param_a: Option<Box<dyn Param + Send + Sync>>,
    pub(crate) param_b: Option<Box<dyn Param + Send + Sync>>,
}

impl Clone for ChunkReconfig {
    fn clone(&self) -> Self {
        ChunkReconfig {
            param_a: self.param_a.as_ref().cloned(),
            param_b: self.param_b.as_ref().cloned(),
        }
    }
}

impl fmt::Display for ChunkReconfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = String::new();
        if let Some(param_a) = &self.param_a {
            res += format!("Param A:\n {param_a}").as_str();
        }
        if let Some(param_b) = &self.param_b {
            res += format!("Param B:\n {param_b}").as_str()
        }
        write!(f, "{res}")
    }
}

impl Chunk for ChunkReconfig {
    fn header(&self) -> ChunkHeader {
        ChunkHeader {
            typ: CT_RECONFIG,
            flags: 0,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;

        if header.typ != CT_RECONFIG {
            return Err(Error::ErrChunkTypeNotReconfig);
        }

        let end = CHUNK_HEADER_SIZE + header.value_length();
        let param_a = build_param(&raw.slice(CHUNK_HEADER_SIZE..end))?;

        let a_len = PARAM_HEADER_LENGTH + param_a.value_length();
        let offset = CHUNK_HEADER_SIZE + a_len + get_padding_size(a_len);
        let param_b = if end > offset {
            Some(build_param(&raw.slice(offset..end))?)
        } else {
            None
        };

        Ok(ChunkReconfig {
            param_a: Some(param_a),
            param_b,
        })
    }

    fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(writer)?;

        let param_a = match &self.param_a {
            Some(p) => p,
            None => return Err(Error::ErrChunkReconfigInvalidParamA),
        };
        writer.extend_from_slice(&param_a.marshal()?);

        if let Some(param_b) = &self.param_b {
            // Param A carries its padding when another param follows.
            let pad = get_padding_size(PARAM_HEADER_LENGTH + param_a.value_length());
            writer.extend_from_slice(&[0u8; 4][..pad]);
            writer.extend_from_slice(&param_b.marshal()?);
        }
        Ok(writer.len())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn value_length(&self) -> usize {
        let mut l = 0;
        if let Some(param_a) = &self.param_a {
            l += PARAM_HEADER_LENGTH + param_a.value_length();
        }
        if let Some(param_b) = &self.param_b {
            l += get_padding_size(l) + PARAM_HEADER_LENGTH + param_b.value_length();
        }
        l
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
