use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    // Packet / chunk framing
    #[error("raw is smaller than the minimum length for a SCTP packet")]
    ErrPacketRawTooSmall,
    #[error("unable to parse SCTP chunk, not enough data for complete header")]
    ErrParseSctpChunkNotEnoughData,
    #[error("checksum mismatch theirs")]
    ErrChecksumMismatch,
    #[error("raw is too small for a SCTP chunk")]
    ErrChunkHeaderTooSmall,
    #[error("not enough data left in SCTP packet to satisfy requested length")]
    ErrChunkHeaderNotEnoughSpace,
    #[error("chunk PADDING is non-zero at offset")]
    ErrChunkHeaderPaddingNonZero,
    #[error("chunk has invalid length")]
    ErrChunkHeaderInvalidLength,
    #[error("chunk too short")]
    ErrChunkTooShort,

    // Chunk type guards
    #[error("ChunkType is not of type INIT or INIT-ACK")]
    ErrChunkTypeNotTypeInit,
    #[error("ChunkType is not of type ABORT")]
    ErrChunkTypeNotAbort,
    #[error("ChunkType is not of type COOKIE-ACK")]
    ErrChunkTypeNotCookieAck,
    #[error("ChunkType is not of type COOKIE-ECHO")]
    ErrChunkTypeNotCookieEcho,
    #[error("ChunkType is not of type ERROR")]
    ErrChunkTypeNotCtError,
    #[error("ChunkType is not of type FORWARD-TSN")]
    ErrChunkTypeNotForwardTsn,
    #[error("ChunkType is not of type HEARTBEAT")]
    ErrChunkTypeNotHeartbeat,
    #[error("ChunkType is not of type HEARTBEAT-ACK")]
    ErrChunkTypeNotHeartbeatAck,
    #[error("ChunkType is not of type DATA")]
    ErrChunkTypeNotPayloadData,
    #[error("ChunkType is not of type RECONFIG")]
    ErrChunkTypeNotReconfig,
    #[error("ChunkType is not of type SACK")]
    ErrChunkTypeNotSack,
    #[error("ChunkType is not of type SHUTDOWN")]
    ErrChunkTypeNotShutdown,
    #[error("ChunkType is not of type SHUTDOWN-ACK")]
    ErrChunkTypeNotShutdownAck,
    #[error("ChunkType is not of type SHUTDOWN-COMPLETE")]
    ErrChunkTypeNotShutdownComplete,

    // Chunk body validation
    #[error("chunk value isn't long enough for mandatory parameters")]
    ErrChunkValueNotLongEnough,
    #[error("ChunkType of type INIT flags must be all 0")]
    ErrChunkTypeInitFlagZero,
    #[error("ChunkType of type INIT InitiateTag must not be 0")]
    ErrChunkTypeInitInitiateTagZero,
    #[error("INIT inbound stream request must be > 0")]
    ErrInitInboundStreamRequestZero,
    #[error("INIT outbound stream request must be > 0")]
    ErrInitOutboundStreamRequestZero,
    #[error("INIT Advertised Receiver Window Credit (a_rwnd) must be >= 1500")]
    ErrInitAdvertisedReceiver1500,
    #[error("packet is smaller than the header size")]
    ErrChunkPayloadSmall,
    #[error("SACK chunk size is not large enough to contain header")]
    ErrSackSizeNotLargeEnough,
    #[error("invalid chunk size")]
    ErrInvalidChunkSize,
    #[error("ChunkReconfig has invalid ParamA")]
    ErrChunkReconfigInvalidParamA,
    #[error("heartbeat is not long enough to contain Heartbeat Info")]
    ErrHeartbeatNotLongEnoughInfo,
    #[error("heartbeat should only have HEARTBEAT param")]
    ErrHeartbeatParam,
    #[error("heartbeat Ack must have one param, and it should be a HeartbeatInfo")]
    ErrHeartbeatAckNotHeartbeatInfo,

    // Parameter codec
    #[error("unhandled ParamType `{typ}`")]
    ErrParamTypeUnhandled { typ: u16 },
    #[error("unexpected ParamType")]
    ErrParamTypeUnexpected,
    #[error("param header too short")]
    ErrParamHeaderTooShort,
    #[error("outgoing SSN reset request parameter too short")]
    ErrSsnResetRequestParamTooShort,
    #[error("reconfig response parameter too short")]
    ErrReconfigRespParamTooShort,
    #[error("zero checksum parameter too short")]
    ErrZeroChecksumParamTooShort,
    #[error("raw is too small for error cause")]
    ErrErrorCauseTooSmall,

    // Association
    #[error("ABORT chunk, with following errors: {0}")]
    ErrAbortChunk(String),
    #[error("shutdown called in non-Established state")]
    ErrShutdownNonEstablished,
    #[error("association closed before connecting")]
    ErrAssociationClosedBeforeConn,
    #[error("association is closed or shutting down")]
    ErrAssociationClosed,
    #[error("association handshake closed")]
    ErrAssociationHandshakeClosed,
    #[error("silently discard")]
    ErrSilentlyDiscard,
    #[error("the init not stored to send")]
    ErrInitNotStoredToSend,
    #[error("cookieEcho not stored to send")]
    ErrCookieEchoNotStoredToSend,
    #[error("sctp packet must not have a source port of 0")]
    ErrSctpPacketSourcePortZero,
    #[error("sctp packet must not have a destination port of 0")]
    ErrSctpPacketDestinationPortZero,
    #[error("init chunk must not be bundled with any other chunk")]
    ErrInitChunkBundled,
    #[error("init chunk expects a verification tag of 0 on the packet when out-of-the-blue")]
    ErrInitChunkVerifyTagNotZero,
    #[error("unexpected INIT in state")]
    ErrHandleInitState,
    #[error("no cookie in InitAck")]
    ErrInitAckNoCookie,
    #[error("there already exists a stream with identifier")]
    ErrStreamAlreadyExist,
    #[error("failed to create a stream with identifier")]
    ErrStreamCreateFailed,
    #[error("unable to be popped from inflight queue TSN")]
    ErrInflightQueueTsnPop,
    #[error("requested non-existent TSN")]
    ErrTsnRequestNotExist,
    #[error("sending reset packet in non-Established state")]
    ErrResetPacketInStateNotExist,
    #[error("unexpected parameter type")]
    ErrParameterType,
    #[error("sending payload data in non-Established state")]
    ErrPayloadDataStateNotExist,
    #[error("unhandled chunk type")]
    ErrChunkTypeUnhandled,
    #[error("handshake failed (INIT ACK)")]
    ErrHandshakeInitAck,
    #[error("handshake failed (COOKIE ECHO)")]
    ErrHandshakeCookieEcho,
    #[error("too many outstanding reconfig requests")]
    ErrTooManyReconfigRequests,

    // Stream API
    #[error("outbound packet larger than maximum message size")]
    ErrOutboundPacketTooLarge,
    #[error("stream closed")]
    ErrStreamClosed,
    #[error("short buffer (size: {size:?}) to be filled")]
    ErrShortBuffer { size: usize },
    #[error("io EOF")]
    ErrEof,
    #[error("try again")]
    ErrTryAgain,
    #[error("invalid SystemTime")]
    ErrInvalidSystemTime,

    #[error("{0}")]
    Other(String),
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            e @ Error::ErrEof => io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()),
            e @ Error::ErrStreamClosed => {
                io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string())
            }
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}
