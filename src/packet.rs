use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::chunk::chunk_abort::ChunkAbort;
use crate::chunk::chunk_cookie_ack::ChunkCookieAck;
use crate::chunk::chunk_cookie_echo::ChunkCookieEcho;
use crate::chunk::chunk_error::ChunkError;
use crate::chunk::chunk_forward_tsn::ChunkForwardTsn;
use crate::chunk::chunk_header::*;
use crate::chunk::chunk_heartbeat::ChunkHeartbeat;
use crate::chunk::chunk_heartbeat_ack::ChunkHeartbeatAck;
use crate::chunk::chunk_init::ChunkInit;
use crate::chunk::chunk_payload_data::ChunkPayloadData;
use crate::chunk::chunk_reconfig::ChunkReconfig;
use crate::chunk::chunk_selective_ack::ChunkSelectiveAck;
use crate::chunk::chunk_shutdown::ChunkShutdown;
use crate::chunk::chunk_shutdown_ack::ChunkShutdownAck;
use crate::chunk::chunk_shutdown_complete::ChunkShutdownComplete;
use crate::chunk::chunk_type::*;
use crate::chunk::chunk_unknown::ChunkUnknown;
use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::util::*;

pub(crate) const PACKET_HEADER_SIZE: usize = 12;

/// One SCTP packet: the 12-byte common header followed by chunks.
///
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Source Port Number        |     Destination Port Number   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Verification Tag                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Checksum                            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Chunk #1..#n                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// The checksum is CRC32C over the packet with the checksum field zeroed,
/// stored little-endian. With RFC 9653 zero-checksum negotiated it may be
/// omitted (all zero) except on packets carrying INIT or COOKIE-ECHO.
#[derive(Default, Debug)]
pub(crate) struct Packet {
    pub(crate) source_port: u16,
    pub(crate) destination_port: u16,
    pub(crate) verification_tag: u32,
    pub(crate) chunks: Vec<Box<dyn Chunk + Send + Sync>>,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.source_port == other.source_port
            && self.destination_port == other.destination_port
            && self.verification_tag == other.verification_tag
            && self.chunks.len() == other.chunks.len()
            && self
                .chunks
                .iter()
                .zip(other.chunks.iter())
                .all(|(a, b)| a.marshal().ok() == b.marshal().ok())
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = format!(
            "Packet: sourcePort={} destinationPort={} verificationTag={}",
            self.source_port, self.destination_port, self.verification_tag,
        );
        for chunk in &self.chunks {
            res += format!("\nChunk: {chunk}").as_str();
        }
        write!(f, "{res}")
    }
}

impl Packet {
    pub(crate) fn unmarshal(raw: &Bytes, accept_zero_checksum: bool) -> Result<Self> {
        if raw.len() < PACKET_HEADER_SIZE {
            return Err(Error::ErrPacketRawTooSmall);
        }

        let reader = &mut raw.clone();

        let source_port = reader.get_u16();
        let destination_port = reader.get_u16();
        let verification_tag = reader.get_u32();
        let their_checksum = reader.get_u32_le();

        // RFC 9653: a zero checksum is only acceptable when negotiated, and
        // never on handshake packets that carry INIT or COOKIE-ECHO.
        let first_chunk_type = if raw.len() > PACKET_HEADER_SIZE {
            Some(ChunkType(raw[PACKET_HEADER_SIZE]))
        } else {
            None
        };
        let must_verify = matches!(first_chunk_type, Some(CT_INIT) | Some(CT_COOKIE_ECHO));
        if must_verify || their_checksum != 0 || !accept_zero_checksum {
            let our_checksum = generate_packet_checksum(raw);
            if their_checksum != our_checksum {
                return Err(Error::ErrChecksumMismatch);
            }
        }

        let mut chunks = vec![];
        let mut offset = PACKET_HEADER_SIZE;
        loop {
            if offset == raw.len() {
                break;
            } else if offset + CHUNK_HEADER_SIZE > raw.len() {
                return Err(Error::ErrParseSctpChunkNotEnoughData);
            }

            let ct = ChunkType(raw[offset]);
            let c: Box<dyn Chunk + Send + Sync> = match ct {
                CT_INIT | CT_INIT_ACK => Box::new(ChunkInit::unmarshal(&raw.slice(offset..))?),
                CT_ABORT => Box::new(ChunkAbort::unmarshal(&raw.slice(offset..))?),
                CT_COOKIE_ECHO => Box::new(ChunkCookieEcho::unmarshal(&raw.slice(offset..))?),
                CT_COOKIE_ACK => Box::new(ChunkCookieAck::unmarshal(&raw.slice(offset..))?),
                CT_HEARTBEAT => Box::new(ChunkHeartbeat::unmarshal(&raw.slice(offset..))?),
                CT_HEARTBEAT_ACK => Box::new(ChunkHeartbeatAck::unmarshal(&raw.slice(offset..))?),
                CT_PAYLOAD_DATA => Box::new(ChunkPayloadData::unmarshal(&raw.slice(offset..))?),
                CT_SACK => Box::new(ChunkSelectiveAck::unmarshal(&raw.slice(offset..))?),
                CT_RECONFIG => Box::new(ChunkReconfig::unmarshal(&raw.slice(offset..))?),
                CT_FORWARD_TSN => Box::new(ChunkForwardTsn::unmarshal(&raw.slice(offset..))?),
                CT_ERROR => Box::new(ChunkError::unmarshal(&raw.slice(offset..))?),
                CT_SHUTDOWN => Box::new(ChunkShutdown::unmarshal(&raw.slice(offset..))?),
                CT_SHUTDOWN_ACK => Box::new(ChunkShutdownAck::unmarshal(&raw.slice(offset..))?),
                CT_SHUTDOWN_COMPLETE => {
                    Box::new(ChunkShutdownComplete::unmarshal(&raw.slice(offset..))?)
                }
                _ => Box::new(ChunkUnknown::unmarshal(&raw.slice(offset..))?),
            };

            offset += CHUNK_HEADER_SIZE + c.value_length() + get_padding_size(c.value_length());
            chunks.push(c);
        }

        Ok(Packet {
            source_port,
            destination_port,
            verification_tag,
            chunks,
        })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut, do_checksum: bool) -> Result<usize> {
        writer.put_u16(self.source_port);
        writer.put_u16(self.destination_port);
        writer.put_u32(self.verification_tag);

        // Filled in below once the chunks are serialized.
        let checksum_pos = writer.len();
        writer.extend_from_slice(&[0, 0, 0, 0]);

        for c in &self.chunks {
            c.marshal_to(writer)?;

            let pad = get_padding_size(writer.len());
            writer.extend_from_slice(&[0u8; PADDING_MULTIPLE][..pad]);
        }

        if do_checksum {
            let mut digest = ISCSI_CRC.digest();
            digest.update(writer);
            let checksum = digest.finalize();

            // Stored little-endian, so the CRC bytes land in the order the
            // digest produced them.
            writer[checksum_pos..checksum_pos + 4].copy_from_slice(&checksum.to_le_bytes());
        }

        Ok(writer.len())
    }

    pub(crate) fn marshal(&self, do_checksum: bool) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.marshal_to(&mut buf, do_checksum)?;
        Ok(buf.freeze())
    }

    /// True when this packet must always carry a real checksum, regardless
    /// of zero-checksum negotiation.
    pub(crate) fn always_checksummed(&self) -> bool {
        self.chunks.iter().any(|c| {
            let typ = c.header().typ;
            typ == CT_INIT || typ == CT_COOKIE_ECHO
        })
    }

    pub(crate) fn check_packet(&self) -> Result<()> {
        // Port 0 is invalid as either source or destination.
        if self.source_port == 0 {
            return Err(Error::ErrSctpPacketSourcePortZero);
        }
        if self.destination_port == 0 {
            return Err(Error::ErrSctpPacketDestinationPortZero);
        }

        for c in &self.chunks {
            if let Some(ci) = c.as_any().downcast_ref::<ChunkInit>() {
                if !ci.is_ack {
                    // INIT must be the only chunk in its packet and the
                    // packet must carry verification tag 0.
                    if self.chunks.len() != 1 {
                        return Err(Error::ErrInitChunkBundled);
                    }
                    if self.verification_tag != 0 {
                        return Err(Error::ErrInitChunkVerifyTagNotZero);
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_packet_unmarshal_too_small() {
        assert!(Packet::unmarshal(&Bytes::new(), false).is_err());
    }

    #[test]
    fn test_packet_unmarshal_header_only() -> Result<()> {
        let header_only = Bytes::from_static(&[
            0x13, 0x88, 0x13, 0x88, 0x00, 0x00, 0x00, 0x00, 0x06, 0xa9, 0x00, 0xe1,
        ]);
        let pkt = Packet::unmarshal(&header_only, false)?;
        assert_eq!(pkt.source_port, 5000);
        assert_eq!(pkt.destination_port, 5000);
        assert_eq!(pkt.verification_tag, 0);
        assert!(pkt.chunks.is_empty());
        Ok(())
    }

    #[test]
    fn test_packet_marshal_round_trip() -> Result<()> {
        let header_only = Bytes::from_static(&[
            0x13, 0x88, 0x13, 0x88, 0x00, 0x00, 0x00, 0x00, 0x06, 0xa9, 0x00, 0xe1,
        ]);
        let pkt = Packet::unmarshal(&header_only, false)?;
        let remarshaled = pkt.marshal(true)?;
        assert_eq!(header_only, remarshaled);
        Ok(())
    }

    #[test]
    fn test_packet_data_chunk_round_trip() -> Result<()> {
        use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};

        let pkt = Packet {
            source_port: 5000,
            destination_port: 5000,
            verification_tag: 0x1234_5678,
            chunks: vec![Box::new(ChunkPayloadData {
                beginning_fragment: true,
                ending_fragment: true,
                tsn: 42,
                stream_identifier: 7,
                stream_sequence_number: 3,
                payload_type: PayloadProtocolIdentifier::Binary,
                user_data: Bytes::from_static(b"hello"),
                ..Default::default()
            })],
        };

        let raw = pkt.marshal(true)?;
        let parsed = Packet::unmarshal(&raw, false)?;
        assert_eq!(parsed.verification_tag, 0x1234_5678);
        assert_eq!(parsed.chunks.len(), 1);
        let d = parsed.chunks[0]
            .as_any()
            .downcast_ref::<ChunkPayloadData>()
            .expect("should be DATA");
        assert_eq!(d.tsn, 42);
        assert_eq!(d.stream_identifier, 7);
        assert_eq!(&d.user_data[..], b"hello");
        Ok(())
    }

    #[test]
    fn test_packet_checksum_mismatch() -> Result<()> {
        let pkt = Packet {
            source_port: 5000,
            destination_port: 5000,
            verification_tag: 1,
            chunks: vec![],
        };
        let mut raw = BytesMut::from(&pkt.marshal(true)?[..]);
        raw[8] ^= 0xff;
        assert_eq!(
            Packet::unmarshal(&raw.freeze(), false),
            Err(Error::ErrChecksumMismatch)
        );
        Ok(())
    }

    #[test]
    fn test_packet_zero_checksum_acceptance() -> Result<()> {
        let pkt = Packet {
            source_port: 5000,
            destination_port: 5000,
            verification_tag: 1,
            chunks: vec![],
        };
        // Checksum elided entirely.
        let raw = pkt.marshal(false)?;

        // Rejected unless the receiver accepts zero checksums.
        assert_eq!(
            Packet::unmarshal(&raw, false),
            Err(Error::ErrChecksumMismatch)
        );
        assert!(Packet::unmarshal(&raw, true).is_ok());
        Ok(())
    }

    #[test]
    fn test_packet_zero_checksum_rejected_for_init() -> Result<()> {
        use crate::chunk::chunk_init::ChunkInit;

        let init = ChunkInit {
            initiate_tag: 1,
            num_outbound_streams: 1,
            num_inbound_streams: 1,
            initial_tsn: 0,
            advertised_receiver_window_credit: 1500,
            ..Default::default()
        };
        let pkt = Packet {
            source_port: 5000,
            destination_port: 5000,
            verification_tag: 0,
            chunks: vec![Box::new(init)],
        };
        let raw = pkt.marshal(false)?;
        // INIT always needs a real checksum, even when zero is acceptable.
        assert_eq!(
            Packet::unmarshal(&raw, true),
            Err(Error::ErrChecksumMismatch)
        );
        Ok(())
    }

    #[test]
    fn test_check_packet_rules() -> Result<()> {
        use crate::chunk::chunk_init::ChunkInit;

        let mut pkt = Packet {
            source_port: 0,
            destination_port: 5000,
            verification_tag: 0,
            chunks: vec![],
        };
        assert_eq!(pkt.check_packet(), Err(Error::ErrSctpPacketSourcePortZero));

        pkt.source_port = 5000;
        pkt.destination_port = 0;
        assert_eq!(
            pkt.check_packet(),
            Err(Error::ErrSctpPacketDestinationPortZero)
        );

        pkt.destination_port = 5000;
        pkt.verification_tag = 9;
        pkt.chunks = vec![Box::new(ChunkInit {
            initiate_tag: 1,
            num_outbound_streams: 1,
            num_inbound_streams: 1,
            advertised_receiver_window_credit: 1500,
            ..Default::default()
        })];
        assert_eq!(
            pkt.check_packet(),
            Err(Error::ErrInitChunkVerifyTagNotZero)
        );

        pkt.verification_tag = 0;
        assert!(pkt.check_packet().is_ok());
        Ok(())
    }
}
