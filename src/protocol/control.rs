use std::string::FromUtf8Error;

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_slice, encode_to_vec,
};
use thiserror::Error;

use crate::message::{Message, MessageError, MessagePool};

/// Answer of a resolve reply for a name nobody registered.
pub const UNKNOWN_TARGET: i32 = -1;
/// Lowest target id an application may address.
pub const MIN_TARGET: i32 = 1;

pub fn is_valid_target(target: i32) -> bool {
    target >= MIN_TARGET
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to encode control payload: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode control payload: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("target name is not valid UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("malformed control frame: {0}")]
    Message(#[from] MessageError),
    #[error("target {0} is not a control code")]
    Unknown(i32),
}

/// Reserved negative targets. Frames addressed to one of these never reach a
/// service receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ControlCode {
    RouteReturn = -2,
    RouteTimeout = -3,
    RouteOverflow = -4,
    TtlExpired = -5,
    RouteFailed = -6,
    ResolveRequest = -7,
    ResolveReply = -8,
    Chirp = -9,
    ProxyRegistration = -10,
    BindClient = -11,
    UnresolvedTarget = -12,
    Health = -13,
}

impl ControlCode {
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Codes a peer answers a routed frame with when it could not deliver it.
    pub fn is_route_failure(self) -> bool {
        matches!(
            self,
            Self::RouteTimeout
                | Self::RouteOverflow
                | Self::TtlExpired
                | Self::RouteFailed
                | Self::UnresolvedTarget
        )
    }
}

impl TryFrom<i32> for ControlCode {
    type Error = ControlError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        let code = match value {
            -2 => Self::RouteReturn,
            -3 => Self::RouteTimeout,
            -4 => Self::RouteOverflow,
            -5 => Self::TtlExpired,
            -6 => Self::RouteFailed,
            -7 => Self::ResolveRequest,
            -8 => Self::ResolveReply,
            -9 => Self::Chirp,
            -10 => Self::ProxyRegistration,
            -11 => Self::BindClient,
            -12 => Self::UnresolvedTarget,
            -13 => Self::Health,
            other => return Err(ControlError::Unknown(other)),
        };
        Ok(code)
    }
}

/// Liveness announcement of one registered service.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Chirp {
    pub service: i32,
    /// Seconds since the epoch the service was registered at.
    pub created: u64,
    /// Sender clock, or 0 for a member of a replicated group.
    pub now: u64,
    pub flags: u32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ProxyRegistration {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct BindClient {
    pub name: String,
}

fn config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Builds a control frame carrying a bincode payload.
pub fn control_message<P: Encode>(
    pool: &MessagePool,
    code: ControlCode,
    payload: &P,
) -> Result<Message, ControlError> {
    let bytes = encode_to_vec(payload, config())?;
    let mut msg = pool.allocate(0);
    msg.put_bytes(&bytes);
    msg.reset();
    msg.set_target(code.code());
    Ok(msg)
}

pub fn decode_payload<P: Decode<()>>(msg: &Message) -> Result<P, ControlError> {
    let (payload, _) = decode_from_slice(msg.body(), config())?;
    Ok(payload)
}

/// Resolve requests carry the raw UTF-8 name as their body.
pub fn resolve_request(pool: &MessagePool, name: &str) -> Message {
    let mut msg = pool.allocate(0);
    msg.put_bytes(name.as_bytes());
    msg.reset();
    msg.set_target(ControlCode::ResolveRequest.code());
    msg
}

pub fn parse_resolve_request(msg: &Message) -> Result<String, ControlError> {
    Ok(String::from_utf8(msg.body().to_vec())?)
}

/// Resolve replies carry the id followed by the name it answers.
pub fn resolve_reply(pool: &MessagePool, id: i32, name: &str) -> Message {
    let mut msg = pool.allocate(0);
    msg.put_i32(id);
    msg.put_bytes(name.as_bytes());
    msg.reset();
    msg.set_target(ControlCode::ResolveReply.code());
    msg
}

pub fn parse_resolve_reply(msg: &mut Message) -> Result<(i32, String), ControlError> {
    msg.reset();
    let id = msg.get_i32()?;
    let left = msg.length_left();
    let name = msg.get_slice(left)?.to_vec();
    Ok((id, String::from_utf8(name)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for value in -13..=-2 {
            let code = ControlCode::try_from(value).unwrap();
            assert_eq!(code.code(), value);
        }
        assert!(matches!(
            ControlCode::try_from(UNKNOWN_TARGET),
            Err(ControlError::Unknown(-1))
        ));
        assert!(ControlCode::try_from(5).is_err());
    }

    #[test]
    fn route_failures() {
        assert!(ControlCode::TtlExpired.is_route_failure());
        assert!(ControlCode::UnresolvedTarget.is_route_failure());
        assert!(!ControlCode::RouteReturn.is_route_failure());
        assert!(!ControlCode::Chirp.is_route_failure());
    }

    #[test]
    fn target_range() {
        assert!(is_valid_target(1));
        assert!(is_valid_target(i32::MAX));
        assert!(!is_valid_target(0));
        assert!(!is_valid_target(ControlCode::Chirp.code()));
    }

    #[test]
    fn chirp_payload() {
        let pool = MessagePool::new();
        let chirp = Chirp {
            service: 40,
            created: 1_700_000_000,
            now: 0,
            flags: 0,
            name: Some("echo".into()),
        };
        let msg = control_message(&pool, ControlCode::Chirp, &chirp).unwrap();

        assert_eq!(msg.target(), -9);
        assert_eq!(&msg.body()[..4], &40i32.to_be_bytes());
        assert_eq!(decode_payload::<Chirp>(&msg).unwrap(), chirp);
    }

    #[test]
    fn resolve_frames() {
        let pool = MessagePool::new();
        let request = resolve_request(&pool, "billing");
        assert_eq!(request.target(), ControlCode::ResolveRequest.code());
        assert_eq!(parse_resolve_request(&request).unwrap(), "billing");

        let mut reply = resolve_reply(&pool, 12, "billing");
        assert_eq!(&reply.body()[..4], &[0, 0, 0, 12]);
        assert_eq!(
            parse_resolve_reply(&mut reply).unwrap(),
            (12, "billing".to_string())
        );
    }

    #[test]
    fn truncated_resolve_reply_fails() {
        let pool = MessagePool::new();
        let mut reply = pool.allocate(2);

        assert!(matches!(
            parse_resolve_reply(&mut reply),
            Err(ControlError::Message(_))
        ));
    }
}
