use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_header::*;
use super::chunk_type::*;
use super::*;
use crate::param::param_header::PARAM_HEADER_LENGTH;
use crate::param::param_heartbeat_info::ParamHeartbeatInfo;
use crate::param::{build_param, Param};

/// HEARTBEAT-ACK chunk, RFC 4960 sec 3.3.6. Must carry exactly the
/// Heartbeat Info of the HEARTBEAT it answers.
#[derive(Default, Debug)]
pub(crate) struct ChunkHeartbeatAck {
    pub(crate) params: Vec<Box<dyn Param + Send + Sync>>,
}

impl fmt::Display for ChunkHeartbeatAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header())
    }
}

impl Chunk for ChunkHeartbeatAck {
    fn header(&self) -> ChunkHeader {
        ChunkHeader {
            typ: CT_HEARTBEAT_ACK,
            flags: 0,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;

        if header.typ != CT_HEARTBEAT_ACK {
            return Err(Error::ErrChunkTypeNotHeartbeatAck);
        }

        if raw.len() <= CHUNK_HEADER_SIZE {
            return Err(Error::ErrHeartbeatNotLongEnoughInfo);
        }

        let p = build_param(&raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length()))?;
        if p.as_any()
            .downcast_ref::<ParamHeartbeatInfo>()
            .is_none()
        {
            return Err(Error::ErrHeartbeatAckNotHeartbeatInfo);
        }

        Ok(ChunkHeartbeatAck { params: vec![p] })
    }

    fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(writer)?;
        for p in &self.params {
            writer.extend_from_slice(&p.marshal()?);
        }
        Ok(writer.len())
    }

    fn check(&self) -> Result<()> {
        if self.params.len() != 1 {
            return Err(Error::ErrHeartbeatAckNotHeartbeatInfo);
        }
        Ok(())
    }

    fn value_length(&self) -> usize {
        self.params
            .iter()
            .fold(0, |l, p| l + PARAM_HEADER_LENGTH + p.value_length())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
