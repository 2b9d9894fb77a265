use bytes::Bytes;

use super::param_forward_tsn_supported::ParamForwardTsnSupported;
use super::param_outgoing_reset_request::ParamOutgoingResetRequest;
use super::param_reconfig_response::{ParamReconfigResponse, ReconfigResult};
use super::param_state_cookie::ParamStateCookie;
use super::param_supported_extensions::ParamSupportedExtensions;
use super::param_zero_checksum::*;
use super::*;
use crate::chunk::chunk_type::{CT_FORWARD_TSN, CT_RECONFIG};
use crate::error::Result;

#[test]
fn test_outgoing_reset_request_round_trip() -> Result<()> {
    let orig = ParamOutgoingResetRequest {
        reconfig_request_sequence_number: 0x0102_0304,
        reconfig_response_sequence_number: 0x0507_0902,
        sender_last_tsn: 0x0406_0811,
        stream_identifiers: vec![0x0205, 0x0400, 0x0defu16],
    };

    let raw = orig.marshal()?;
    let parsed = ParamOutgoingResetRequest::unmarshal(&raw)?;
    assert_eq!(parsed, orig);
    Ok(())
}

#[test]
fn test_outgoing_reset_request_too_short() {
    let raw = Bytes::from_static(&[0x0, 0xd, 0x0, 0x4]);
    assert!(ParamOutgoingResetRequest::unmarshal(&raw).is_err());
}

#[test]
fn test_reconfig_response_round_trip() -> Result<()> {
    let orig = ParamReconfigResponse {
        reconfig_response_sequence_number: 0x0102_0304,
        result: ReconfigResult::SuccessPerformed,
    };

    let raw = orig.marshal()?;
    let parsed = ParamReconfigResponse::unmarshal(&raw)?;
    assert_eq!(parsed, orig);
    Ok(())
}

#[test]
fn test_reconfig_response_too_short() {
    let raw = Bytes::from_static(&[0x0, 0x10, 0x0, 0x4]);
    assert!(ParamReconfigResponse::unmarshal(&raw).is_err());
}

#[test]
fn test_reconfig_result_from_u32() {
    assert_eq!(ReconfigResult::from(0), ReconfigResult::SuccessNop);
    assert_eq!(ReconfigResult::from(1), ReconfigResult::SuccessPerformed);
    assert_eq!(ReconfigResult::from(6), ReconfigResult::InProgress);
    assert_eq!(ReconfigResult::from(99), ReconfigResult::Unknown);
}

#[test]
fn test_state_cookie_is_random() {
    let a = ParamStateCookie::new();
    let b = ParamStateCookie::new();
    assert_eq!(a.cookie.len(), 32);
    assert_ne!(a.cookie, b.cookie, "two cookies should not collide");
}

#[test]
fn test_state_cookie_round_trip() -> Result<()> {
    let orig = ParamStateCookie::new();
    let raw = orig.marshal()?;
    let parsed = ParamStateCookie::unmarshal(&raw)?;
    assert_eq!(parsed.cookie, orig.cookie);
    Ok(())
}

#[test]
fn test_supported_extensions_round_trip() -> Result<()> {
    let orig = ParamSupportedExtensions {
        chunk_types: vec![CT_RECONFIG, CT_FORWARD_TSN],
    };

    let raw = orig.marshal()?;
    let parsed = ParamSupportedExtensions::unmarshal(&raw)?;
    assert_eq!(parsed.chunk_types, orig.chunk_types);
    Ok(())
}

#[test]
fn test_forward_tsn_supported_round_trip() -> Result<()> {
    let orig = ParamForwardTsnSupported {};
    let raw = orig.marshal()?;
    let parsed = ParamForwardTsnSupported::unmarshal(&raw)?;
    assert_eq!(parsed, orig);
    assert_eq!(&raw[..], &[0xc0, 0x00, 0x00, 0x04]);
    Ok(())
}

#[test]
fn test_zero_checksum_round_trip() -> Result<()> {
    let orig = ParamZeroChecksumAcceptable::default();
    assert_eq!(orig.edmid, ZERO_CHECKSUM_EDMID_LOWER_LAYER_DTLS);

    let raw = orig.marshal()?;
    assert_eq!(&raw[..], &[0x80, 0x01, 0x00, 0x08, 0x00, 0x00, 0x00, 0x01]);

    let parsed = ParamZeroChecksumAcceptable::unmarshal(&raw)?;
    assert_eq!(parsed, orig);
    Ok(())
}

#[test]
fn test_build_param_dispatch() -> Result<()> {
    let raw = ParamZeroChecksumAcceptable::default().marshal()?;
    let p = build_param(&raw)?;
    assert!(p
        .as_any()
        .downcast_ref::<ParamZeroChecksumAcceptable>()
        .is_some());
    Ok(())
}

#[test]
fn test_build_param_unknown_types() {
    // Type 0x4001: top bit clear, processing must stop.
    let stop = Bytes::from_static(&[0x40, 0x01, 0x00, 0x04]);
    assert!(build_param(&stop).is_err());

    // Type 0x8123: top bit set, carried as an opaque unknown param.
    let keep = Bytes::from_static(&[0x81, 0x23, 0x00, 0x04]);
    assert!(build_param(&keep).is_ok());

    // Too short for a header at all.
    let short = Bytes::from_static(&[0x81, 0x23]);
    assert!(build_param(&short).is_err());
}
