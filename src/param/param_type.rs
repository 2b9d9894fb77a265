use std::fmt;

/// INIT/INIT-ACK/RECONFIG parameter types this crate knows about. AUTH and
/// ASCONF related parameters are deliberately absent; anything unlisted
/// round-trips as `Unknown`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum ParamType {
    /// Heartbeat Info (1), RFC 4960
    HeartbeatInfo,
    /// State Cookie (7), RFC 4960
    StateCookie,
    /// Unrecognized Parameters (8), RFC 4960
    UnrecognizedParam,
    /// Outgoing SSN Reset Request (13), RFC 6525
    OutSsnResetReq,
    /// Incoming SSN Reset Request (14), RFC 6525
    IncSsnResetReq,
    /// SSN/TSN Reset Request (15), RFC 6525
    SsnTsnResetReq,
    /// Re-configuration Response (16), RFC 6525
    ReconfigResp,
    /// Zero Checksum Acceptable (0x8001), RFC 9653
    ZeroChecksumAcceptable,
    /// Supported Extensions (0x8008), RFC 5061
    SupportedExt,
    /// Forward TSN supported (0xC000), RFC 3758
    ForwardTsnSupp,
    Unknown { param_type: u16 },
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ParamType::HeartbeatInfo => "Heartbeat Info",
            ParamType::StateCookie => "State Cookie",
            ParamType::UnrecognizedParam => "Unrecognized Parameters",
            ParamType::OutSsnResetReq => "Outgoing SSN Reset Request Parameter",
            ParamType::IncSsnResetReq => "Incoming SSN Reset Request Parameter",
            ParamType::SsnTsnResetReq => "SSN/TSN Reset Request Parameter",
            ParamType::ReconfigResp => "Re-configuration Response Parameter",
            ParamType::ZeroChecksumAcceptable => "Zero Checksum Acceptable",
            ParamType::SupportedExt => "Supported Extensions",
            ParamType::ForwardTsnSupp => "Forward TSN supported",
            ParamType::Unknown { .. } => "Unknown ParamType",
        };
        write!(f, "{s}")
    }
}

impl From<u16> for ParamType {
    fn from(v: u16) -> ParamType {
        match v {
            1 => ParamType::HeartbeatInfo,
            7 => ParamType::StateCookie,
            8 => ParamType::UnrecognizedParam,
            13 => ParamType::OutSsnResetReq,
            14 => ParamType::IncSsnResetReq,
            15 => ParamType::SsnTsnResetReq,
            16 => ParamType::ReconfigResp,
            0x8001 => ParamType::ZeroChecksumAcceptable,
            0x8008 => ParamType::SupportedExt,
            0xc000 => ParamType::ForwardTsnSupp,
            unknown => ParamType::Unknown {
                param_type: unknown,
            },
        }
    }
}

impl From<ParamType> for u16 {
    fn from(v: ParamType) -> u16 {
        match v {
            ParamType::HeartbeatInfo => 1,
            ParamType::StateCookie => 7,
            ParamType::UnrecognizedParam => 8,
            ParamType::OutSsnResetReq => 13,
            ParamType::IncSsnResetReq => 14,
            ParamType::SsnTsnResetReq => 15,
            ParamType::ReconfigResp => 16,
            ParamType::ZeroChecksumAcceptable => 0x8001,
            ParamType::SupportedExt => 0x8008,
            ParamType::ForwardTsnSupp => 0xc000,
            ParamType::Unknown { param_type } => param_type,
        }
    }
}
