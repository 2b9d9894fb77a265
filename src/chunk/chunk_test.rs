use bytes::Bytes;

use super::chunk_abort::*;
use super::chunk_forward_tsn::*;
use super::chunk_init::*;
use super::chunk_payload_data::*;
use super::chunk_reconfig::*;
use super::chunk_selective_ack::*;
use super::chunk_shutdown::*;
use super::chunk_type::*;
use super::*;
use crate::error_cause::{ErrorCause, PROTOCOL_VIOLATION};
use crate::param::param_outgoing_reset_request::ParamOutgoingResetRequest;
use crate::param::param_reconfig_response::{ParamReconfigResponse, ReconfigResult};
use crate::param::param_state_cookie::ParamStateCookie;
use crate::error::Result;

///////////////////////////////////////////////////////////////////
// chunk_payload_data
///////////////////////////////////////////////////////////////////

#[test]
fn test_payload_data_round_trip() -> Result<()> {
    let orig = ChunkPayloadData {
        unordered: true,
        beginning_fragment: true,
        ending_fragment: false,
        immediate_sack: true,
        tsn: 0xdead_beef,
        stream_identifier: 42,
        stream_sequence_number: 19,
        payload_type: PayloadProtocolIdentifier::Binary,
        user_data: Bytes::from_static(b"some user data"),
        ..Default::default()
    };

    let raw = orig.marshal()?;
    let parsed = ChunkPayloadData::unmarshal(&raw)?;

    assert!(parsed.unordered);
    assert!(parsed.beginning_fragment);
    assert!(!parsed.ending_fragment);
    assert!(parsed.immediate_sack);
    assert_eq!(parsed.tsn, 0xdead_beef);
    assert_eq!(parsed.stream_identifier, 42);
    assert_eq!(parsed.stream_sequence_number, 19);
    assert_eq!(parsed.payload_type, PayloadProtocolIdentifier::Binary);
    assert_eq!(&parsed.user_data[..], b"some user data");
    Ok(())
}

#[test]
fn test_payload_data_rejects_wrong_type() {
    let shutdown = ChunkShutdown {
        cumulative_tsn_ack: 1,
    };
    let raw = shutdown.marshal().unwrap();
    assert!(ChunkPayloadData::unmarshal(&raw).is_err());
}

///////////////////////////////////////////////////////////////////
// chunk_init
///////////////////////////////////////////////////////////////////

#[test]
fn test_init_round_trip_with_params() -> Result<()> {
    let mut orig = ChunkInit {
        is_ack: false,
        initiate_tag: 12345,
        advertised_receiver_window_credit: 1024 * 1024,
        num_outbound_streams: 65535,
        num_inbound_streams: 65535,
        initial_tsn: 1234567,
        params: vec![],
    };
    orig.set_supported_extensions();
    orig.set_zero_checksum_acceptable();

    let raw = orig.marshal()?;
    let parsed = ChunkInit::unmarshal(&raw)?;

    assert!(!parsed.is_ack);
    assert_eq!(parsed.initiate_tag, 12345);
    assert_eq!(parsed.advertised_receiver_window_credit, 1024 * 1024);
    assert_eq!(parsed.initial_tsn, 1234567);
    assert_eq!(parsed.params.len(), 3);
    parsed.check()?;
    Ok(())
}

#[test]
fn test_init_ack_round_trip_with_cookie() -> Result<()> {
    let cookie = ParamStateCookie::new();
    let orig = ChunkInit {
        is_ack: true,
        initiate_tag: 9,
        advertised_receiver_window_credit: 100_000,
        num_outbound_streams: 10,
        num_inbound_streams: 10,
        initial_tsn: 42,
        params: vec![Box::new(cookie.clone())],
    };

    let raw = orig.marshal()?;
    let parsed = ChunkInit::unmarshal(&raw)?;
    assert!(parsed.is_ack);

    let mut found_cookie = false;
    for p in &parsed.params {
        if let Some(c) = p.as_any().downcast_ref::<ParamStateCookie>() {
            assert_eq!(c.cookie, cookie.cookie);
            found_cookie = true;
        }
    }
    assert!(found_cookie, "state cookie should survive the round trip");
    Ok(())
}

#[test]
fn test_init_check_validation() {
    let mut init = ChunkInit {
        initiate_tag: 0,
        advertised_receiver_window_credit: 1500,
        num_outbound_streams: 1,
        num_inbound_streams: 1,
        ..Default::default()
    };
    assert!(init.check().is_err(), "zero initiate tag must fail");

    init.initiate_tag = 1;
    init.num_outbound_streams = 0;
    assert!(init.check().is_err(), "zero outbound streams must fail");

    init.num_outbound_streams = 1;
    init.advertised_receiver_window_credit = 1499;
    assert!(init.check().is_err(), "a_rwnd below 1500 must fail");

    init.advertised_receiver_window_credit = 1500;
    assert!(init.check().is_ok());
}

///////////////////////////////////////////////////////////////////
// chunk_selective_ack
///////////////////////////////////////////////////////////////////

#[test]
fn test_selective_ack_round_trip() -> Result<()> {
    let orig = ChunkSelectiveAck {
        cumulative_tsn_ack: 1000,
        advertised_receiver_window_credit: 111,
        gap_ack_blocks: vec![
            GapAckBlock { start: 2, end: 4 },
            GapAckBlock { start: 7, end: 7 },
        ],
        duplicate_tsn: vec![999, 999],
    };

    let raw = orig.marshal()?;
    let parsed = ChunkSelectiveAck::unmarshal(&raw)?;

    assert_eq!(parsed.cumulative_tsn_ack, 1000);
    assert_eq!(parsed.advertised_receiver_window_credit, 111);
    assert_eq!(parsed.gap_ack_blocks.len(), 2);
    assert_eq!(parsed.gap_ack_blocks[0], GapAckBlock { start: 2, end: 4 });
    assert_eq!(parsed.gap_ack_blocks[1], GapAckBlock { start: 7, end: 7 });
    assert_eq!(parsed.duplicate_tsn, vec![999, 999]);
    Ok(())
}

#[test]
fn test_selective_ack_too_short() {
    let raw = Bytes::from_static(&[0x03, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x01]);
    assert!(ChunkSelectiveAck::unmarshal(&raw).is_err());
}

///////////////////////////////////////////////////////////////////
// chunk_forward_tsn
///////////////////////////////////////////////////////////////////

#[test]
fn test_forward_tsn_round_trip() -> Result<()> {
    let orig = ChunkForwardTsn {
        new_cumulative_tsn: 3,
        streams: vec![
            ChunkForwardTsnStream {
                identifier: 1,
                sequence: 2,
            },
            ChunkForwardTsnStream {
                identifier: 9,
                sequence: 8,
            },
        ],
    };

    let raw = orig.marshal()?;
    let parsed = ChunkForwardTsn::unmarshal(&raw)?;

    assert_eq!(parsed.new_cumulative_tsn, 3);
    assert_eq!(parsed.streams.len(), 2);
    assert_eq!(parsed.streams[0].identifier, 1);
    assert_eq!(parsed.streams[0].sequence, 2);
    assert_eq!(parsed.streams[1].identifier, 9);
    assert_eq!(parsed.streams[1].sequence, 8);
    Ok(())
}

///////////////////////////////////////////////////////////////////
// chunk_reconfig
///////////////////////////////////////////////////////////////////

#[test]
fn test_reconfig_round_trip_reset_request() -> Result<()> {
    let orig = ChunkReconfig {
        param_a: Some(Box::new(ParamOutgoingResetRequest {
            reconfig_request_sequence_number: 1,
            reconfig_response_sequence_number: 2,
            sender_last_tsn: 3,
            stream_identifiers: vec![4, 5, 6],
        })),
        param_b: None,
    };

    let raw = orig.marshal()?;
    let parsed = ChunkReconfig::unmarshal(&raw)?;

    let req = parsed
        .param_a
        .as_ref()
        .unwrap()
        .as_any()
        .downcast_ref::<ParamOutgoingResetRequest>()
        .expect("param A should be an outgoing reset request");
    assert_eq!(req.reconfig_request_sequence_number, 1);
    assert_eq!(req.sender_last_tsn, 3);
    assert_eq!(req.stream_identifiers, vec![4, 5, 6]);
    assert!(parsed.param_b.is_none());
    Ok(())
}

#[test]
fn test_reconfig_round_trip_two_params() -> Result<()> {
    let orig = ChunkReconfig {
        param_a: Some(Box::new(ParamOutgoingResetRequest {
            reconfig_request_sequence_number: 1,
            sender_last_tsn: 3,
            stream_identifiers: vec![4], // odd value length forces padding
            ..Default::default()
        })),
        param_b: Some(Box::new(ParamReconfigResponse {
            reconfig_response_sequence_number: 24,
            result: ReconfigResult::SuccessPerformed,
        })),
    };

    let raw = orig.marshal()?;
    let parsed = ChunkReconfig::unmarshal(&raw)?;

    assert!(parsed.param_a.is_some());
    let resp = parsed
        .param_b
        .as_ref()
        .unwrap()
        .as_any()
        .downcast_ref::<ParamReconfigResponse>()
        .expect("param B should be a reconfig response");
    assert_eq!(resp.reconfig_response_sequence_number, 24);
    assert_eq!(resp.result, ReconfigResult::SuccessPerformed);
    Ok(())
}

///////////////////////////////////////////////////////////////////
// chunk_abort
///////////////////////////////////////////////////////////////////

#[test]
fn test_abort_round_trip_with_cause() -> Result<()> {
    let orig = ChunkAbort {
        error_causes: vec![ErrorCause {
            code: PROTOCOL_VIOLATION,
            raw: Bytes::from_static(b"oops"),
        }],
    };

    let raw = orig.marshal()?;
    let parsed = ChunkAbort::unmarshal(&raw)?;

    assert_eq!(parsed.error_causes.len(), 1);
    assert_eq!(parsed.error_causes[0].code, PROTOCOL_VIOLATION);
    assert_eq!(&parsed.error_causes[0].raw[..], b"oops");
    Ok(())
}

///////////////////////////////////////////////////////////////////
// chunk_shutdown
///////////////////////////////////////////////////////////////////

#[test]
fn test_shutdown_round_trip() -> Result<()> {
    let orig = ChunkShutdown {
        cumulative_tsn_ack: 0xfeed_f00d,
    };
    let raw = orig.marshal()?;
    let parsed = ChunkShutdown::unmarshal(&raw)?;
    assert_eq!(parsed.cumulative_tsn_ack, 0xfeed_f00d);
    Ok(())
}

#[test]
fn test_chunk_header_padding_must_be_zero() {
    // SHUTDOWN-ACK (length 4) followed by 3 bytes of nonzero padding.
    let raw = Bytes::from_static(&[0x08, 0x00, 0x00, 0x04, 0x01, 0x00, 0x00]);
    assert!(ChunkHeader::unmarshal(&raw).is_err());
}

#[test]
fn test_chunk_type_filters_in_header() {
    let orig = ChunkShutdown {
        cumulative_tsn_ack: 1,
    };
    assert_eq!(orig.header().typ, CT_SHUTDOWN);
}
