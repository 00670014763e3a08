//! Wire envelope: command tags, status codes, versions and the framed codec.
//!
//! Every request is `u16 command; u16 version; u32 body_length; bytes[]`,
//! every reply is `u16 status; u16 version; u32 body_length; bytes[]`.
//! Multi-byte integers are big-endian on the wire; strings are a `u32`
//! length followed by raw bytes.

mod inbuf;
mod netio;
mod outbuf;

pub use inbuf::InBuf;
pub use netio::{NetReader, NetWriter};
pub use outbuf::{ChainedOut, OutBuf};

/// Default port for the binary search API (IANA-assigned).
pub const API_PORT: u16 = 9312;
/// Default port for the MySQL-wire frontend (IANA-assigned).
pub const SQL_PORT: u16 = 9306;

/// Protocol hello exchanged once per fresh connection, as a big-endian `u32`.
pub const PROTO_HELLO: u32 = 1;

/// Request and reply envelope sizes.
pub const REQUEST_HEADER_LEN: usize = 8;
pub const REPLY_HEADER_LEN: usize = 8;

/// Known command tags. The numeric values are stable wire IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Search = 0,
    Excerpt = 1,
    Update = 2,
    Keywords = 3,
    Persist = 4,
    Status = 5,
    FlushAttrs = 7,
    Sql = 8,
    Ping = 9,
    Delete = 10,
    Uvar = 11,
    Insert = 12,
    Replace = 13,
    Commit = 14,
    Suggest = 15,
    Json = 16,
    CallPq = 17,
    ClusterPq = 18,
}

/// Number of command slots, sized for per-command counters.
pub const COMMAND_COUNT: usize = 19;

impl Command {
    pub fn from_u16(v: u16) -> Option<Command> {
        use Command::*;
        Some(match v {
            0 => Search,
            1 => Excerpt,
            2 => Update,
            3 => Keywords,
            4 => Persist,
            5 => Status,
            7 => FlushAttrs,
            8 => Sql,
            9 => Ping,
            10 => Delete,
            11 => Uvar,
            12 => Insert,
            13 => Replace,
            14 => Commit,
            15 => Suggest,
            16 => Json,
            17 => CallPq,
            18 => ClusterPq,
            _ => return None,
        })
    }

    /// The daemon-side version of this command's body format.
    pub fn version(self) -> u16 {
        use Command::*;
        match self {
            Search => VER_SEARCH,
            Excerpt => 0x104,
            Update => 0x104,
            Keywords => 0x101,
            Status => VER_STATUS,
            FlushAttrs => 0x100,
            Sql => 0x100,
            Json => 0x100,
            Ping => VER_PING,
            Uvar => 0x100,
            CallPq => 0x100,
            ClusterPq => 0x102,
            _ => 0x100,
        }
    }

    pub fn name(self) -> &'static str {
        use Command::*;
        match self {
            Search => "search",
            Excerpt => "excerpt",
            Update => "update",
            Keywords => "keywords",
            Persist => "persist",
            Status => "status",
            FlushAttrs => "flush-attrs",
            Sql => "sql",
            Ping => "ping",
            Delete => "delete",
            Uvar => "uvar",
            Insert => "insert",
            Replace => "replace",
            Commit => "commit",
            Suggest => "suggest",
            Json => "json",
            CallPq => "call-pq",
            ClusterPq => "cluster-pq",
        }
    }
}

pub const VER_SEARCH: u16 = 0x121;
pub const VER_STATUS: u16 = 0x101;
pub const VER_PING: u16 = 0x100;

/// Reply status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReplyStatus {
    Ok = 0,
    Error = 1,
    Retry = 2,
    Warning = 3,
}

impl ReplyStatus {
    pub fn from_u16(v: u16) -> Option<ReplyStatus> {
        Some(match v {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::Error,
            2 => ReplyStatus::Retry,
            3 => ReplyStatus::Warning,
            _ => return None,
        })
    }
}

/// Check a client's command version against ours. Major versions must match
/// and the client must not be newer than the daemon.
pub fn check_command_version(client: u16, daemon: u16) -> Result<(), String> {
    if client >> 8 != daemon >> 8 {
        return Err(format!(
            "major command version mismatch (expected v.{}.x, got v.{}.{})",
            daemon >> 8,
            client >> 8,
            client & 0xff
        ));
    }
    if client > daemon {
        return Err(format!(
            "client version is higher than daemon version (client is v.{}.{}, daemon is v.{}.{})",
            client >> 8,
            client & 0xff,
            daemon >> 8,
            daemon & 0xff
        ));
    }
    Ok(())
}

/// Write a reply envelope around `body`: status, version, then the deferred
/// body length committed once the closure returns.
pub fn reply_envelope<F>(out: &mut OutBuf, status: ReplyStatus, version: u16, body: F)
where
    F: FnOnce(&mut OutBuf),
{
    out.send_u16(status as u16);
    out.send_u16(version);
    out.begin_length();
    body(out);
    out.commit_length();
}

/// Write a request envelope around `body`: command, version, deferred length.
pub fn request_envelope<F>(out: &mut OutBuf, command: Command, version: u16, body: F)
where
    F: FnOnce(&mut OutBuf),
{
    out.send_u16(command as u16);
    out.send_u16(version);
    out.begin_length();
    body(out);
    out.commit_length();
}

/// Build a complete error reply with a bare message body.
pub fn error_reply(message: &str) -> OutBuf {
    let mut out = OutBuf::new();
    reply_envelope(&mut out, ReplyStatus::Error, 0, |out| {
        out.send_string(message);
    });
    out
}

/// Build a complete retry reply with a bare message body.
pub fn retry_reply(message: &str) -> OutBuf {
    let mut out = OutBuf::new();
    reply_envelope(&mut out, ReplyStatus::Retry, 0, |out| {
        out.send_string(message);
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_ids_are_stable() {
        assert_eq!(Command::Search as u16, 0);
        assert_eq!(Command::Persist as u16, 4);
        assert_eq!(Command::Ping as u16, 9);
        assert_eq!(Command::ClusterPq as u16, 18);
        assert_eq!(Command::from_u16(6), None);
        assert_eq!(Command::from_u16(8), Some(Command::Sql));
    }

    #[test]
    fn version_check() {
        assert!(check_command_version(0x121, VER_SEARCH).is_ok());
        assert!(check_command_version(0x118, VER_SEARCH).is_ok());
        // newer minor than the daemon
        assert!(check_command_version(0x122, VER_SEARCH).is_err());
        // major mismatch
        assert!(check_command_version(0x021, VER_SEARCH).is_err());
    }

    #[test]
    fn envelope_roundtrip() {
        let mut out = OutBuf::new();
        request_envelope(&mut out, Command::Ping, VER_PING, |out| {
            out.send_u32(0xdeadbeef);
        });
        let bytes = out.into_bytes();
        assert_eq!(bytes.len(), REQUEST_HEADER_LEN + 4);

        let mut inb = InBuf::new(&bytes);
        assert_eq!(inb.get_u16(), Command::Ping as u16);
        assert_eq!(inb.get_u16(), VER_PING);
        assert_eq!(inb.get_u32(), 4);
        assert_eq!(inb.get_u32(), 0xdeadbeef);
        assert!(!inb.error());
    }
}
