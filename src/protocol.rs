//! ClickHouse native protocol packet types and revision gates.

use crate::error::Error;
use crate::wire::{Agent, Ver};

/// Servers advertise the session timezone starting from this revision.
pub const DBMS_MIN_REVISION_WITH_SERVER_TIMEZONE: u64 = 54058;
/// Client info carries the quota key starting from this revision.
pub const DBMS_MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO: u64 = 54060;

/// Revision we present when talking to an upstream server.
pub const CLIENT_REVISION: u64 = 54213;
/// Revision we advertise to downstream clients.
pub const SERVER_REVISION: u64 = 54450;

/// Query processing stage: run to completion.
pub const STATE_COMPLETE: u64 = 2;

pub fn default_client_agent() -> Agent {
    Agent {
        name: "clickhouse-proxy".into(),
        ver: Ver {
            major: 1,
            minor: 1,
            revision: CLIENT_REVISION,
        },
    }
}

pub fn default_server_agent() -> Agent {
    Agent {
        name: "Clickhouse".into(),
        ver: Ver {
            major: 21,
            minor: 11,
            revision: SERVER_REVISION,
        },
    }
}

/// Packets a client sends to a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ClientPacket {
    Hello = 0,
    Query = 1,
    Data = 2,
    Cancel = 3,
    Ping = 4,
}

/// Packets a server sends to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ServerPacket {
    Hello = 0,
    Data = 1,
    Exception = 2,
    Progress = 3,
    Pong = 4,
    EndOfStream = 5,
    ProfileInfo = 6,
    Totals = 7,
    Extremes = 8,
}

impl ClientPacket {
    pub fn code(self) -> u64 {
        self as u64
    }
}

impl ServerPacket {
    pub fn code(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u64> for ClientPacket {
    type Error = Error;

    fn try_from(tp: u64) -> Result<Self, Error> {
        Ok(match tp {
            0 => ClientPacket::Hello,
            1 => ClientPacket::Query,
            2 => ClientPacket::Data,
            3 => ClientPacket::Cancel,
            4 => ClientPacket::Ping,
            _ => return Err(Error::UnexpectedPacket(tp)),
        })
    }
}

impl TryFrom<u64> for ServerPacket {
    type Error = Error;

    fn try_from(tp: u64) -> Result<Self, Error> {
        Ok(match tp {
            0 => ServerPacket::Hello,
            1 => ServerPacket::Data,
            2 => ServerPacket::Exception,
            3 => ServerPacket::Progress,
            4 => ServerPacket::Pong,
            5 => ServerPacket::EndOfStream,
            6 => ServerPacket::ProfileInfo,
            7 => ServerPacket::Totals,
            8 => ServerPacket::Extremes,
            _ => return Err(Error::UnexpectedPacket(tp)),
        })
    }
}
