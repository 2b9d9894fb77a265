use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::param_header::*;
use super::param_type::*;
use super::*;

/// Error detection method identifier for "the lower layer already provides
/// integrity", i.e. DTLS underneath, RFC 9653 sec 4.1.
pub(crate) const ZERO_CHECKSUM_EDMID_LOWER_LAYER_DTLS: u32 = 1;

/// Zero Checksum Acceptable parameter, RFC 9653. Including it in INIT or
/// INIT-ACK tells the peer that packets sent to us may carry a zero
/// checksum, provided the named error detection method covers the path.
///
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Parameter Type = 0x8001   |     Parameter Length = 8      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |       Error Detection Method Identifier (EDMID)               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParamZeroChecksumAcceptable {
    pub(crate) edmid: u32,
}

impl Default for ParamZeroChecksumAcceptable {
    fn default() -> Self {
        ParamZeroChecksumAcceptable {
            edmid: ZERO_CHECKSUM_EDMID_LOWER_LAYER_DTLS,
        }
    }
}

impl fmt::Display for ParamZeroChecksumAcceptable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (edmid={})", self.header(), self.edmid)
    }
}

impl Param for ParamZeroChecksumAcceptable {
    fn header(&self) -> ParamHeader {
        ParamHeader {
            typ: ParamType::ZeroChecksumAcceptable,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ParamHeader::unmarshal(raw)?;
        if header.value_length() < 4 {
            return Err(Error::ErrZeroChecksumParamTooShort);
        }

        let reader = &mut raw.slice(PARAM_HEADER_LENGTH..);
        let edmid = reader.get_u32();

        Ok(ParamZeroChecksumAcceptable { edmid })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf)?;
        buf.put_u32(self.edmid);
        Ok(buf.len())
    }

    fn value_length(&self) -> usize {
        4
    }

    fn clone_to(&self) -> Box<dyn Param + Send + Sync> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
