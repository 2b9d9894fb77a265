use std::collections::VecDeque;

use crate::packet::Packet;

/// Outbound control packets awaiting the next write-loop pass.
pub(crate) type ControlQueue = VecDeque<Packet>;
