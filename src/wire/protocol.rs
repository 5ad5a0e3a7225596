//! Message layouts for the wire protocol.
//!
//! Three message families cross the stream after framing:
//! - login request/response (first frame in each direction)
//! - procedure invocation request: execution id, UTF-8 procedure name,
//!   parameter block
//! - invocation response: execution id, status byte, server-reported
//!   duration, optional error string, result payload
//!
//! Integers are big-endian; strings are u32-length-prefixed UTF-8.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::types::{Error, Result};
use crate::wire::values::ParamPack;

/// Wire protocol version carried in the login request.
pub const PROTOCOL_VERSION: u8 = 1;

/// Login accepted.
pub const LOGIN_OK: u8 = 1;
/// Login rejected (bad credentials).
pub const LOGIN_REJECTED: u8 = 0;

/// Longest accepted procedure name, bytes of UTF-8.
pub const MAX_PROCEDURE_NAME_BYTES: usize = 1024;

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn short_frame() -> Error {
    Error::transport_lost("malformed message: frame truncated")
}

fn get_str(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 4 {
        return Err(short_frame());
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(short_frame());
    }
    let raw = buf.split_to(len);
    std::str::from_utf8(&raw)
        .map(str::to_string)
        .map_err(|_| Error::transport_lost("malformed message: invalid UTF-8"))
}

/// Identity triple learned from the first successful child of a cluster.
/// All later children (including reconnections) must match.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClusterIdentity {
    pub build_string: String,
    pub cluster_start_timestamp: i64,
    pub leader_endpoint: String,
}

/// Everything the server reports in a successful login response.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HandshakeInfo {
    pub host_id: i32,
    pub connection_id: i64,
    pub identity: ClusterIdentity,
}

/// Encode a login request: version, user, SHA-256 of the password.
pub fn encode_login_request(user: &str, password: &str) -> Bytes {
    let digest = Sha256::digest(password.as_bytes());
    let mut buf = BytesMut::with_capacity(1 + 4 + user.len() + digest.len());
    buf.put_u8(PROTOCOL_VERSION);
    put_str(&mut buf, user);
    buf.put_slice(&digest);
    buf.freeze()
}

/// Decode a login response. A rejection decodes to `AuthFailed`.
pub fn decode_login_response(mut payload: Bytes) -> Result<HandshakeInfo> {
    if !payload.has_remaining() {
        return Err(short_frame());
    }
    let status = payload.get_u8();
    if status != LOGIN_OK {
        return Err(Error::auth_failed("server rejected credentials"));
    }
    if payload.remaining() < 4 + 8 + 8 {
        return Err(short_frame());
    }
    let host_id = payload.get_i32();
    let connection_id = payload.get_i64();
    let cluster_start_timestamp = payload.get_i64();
    let leader_endpoint = get_str(&mut payload)?;
    let build_string = get_str(&mut payload)?;
    Ok(HandshakeInfo {
        host_id,
        connection_id,
        identity: ClusterIdentity {
            build_string,
            cluster_start_timestamp,
            leader_endpoint,
        },
    })
}

/// Encode a login response. Server side of the handshake; mock servers in
/// the test suite speak through this.
pub fn encode_login_response(info: &HandshakeInfo) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(LOGIN_OK);
    buf.put_i32(info.host_id);
    buf.put_i64(info.connection_id);
    buf.put_i64(info.identity.cluster_start_timestamp);
    put_str(&mut buf, &info.identity.leader_endpoint);
    put_str(&mut buf, &info.identity.build_string);
    buf.freeze()
}

/// Encode a login rejection.
pub fn encode_login_rejection() -> Bytes {
    Bytes::from_static(&[LOGIN_REJECTED])
}

/// Encode a procedure invocation. Validates the name and parameters before
/// any I/O: an empty or oversize name and any parameter failing the codec
/// precondition raise `BadArgument` here.
pub fn encode_invocation<P: ParamPack>(
    execution_id: u64,
    procedure: &str,
    params: &P,
) -> Result<Bytes> {
    if procedure.is_empty() {
        return Err(Error::bad_argument("procedure name is empty"));
    }
    if procedure.len() > MAX_PROCEDURE_NAME_BYTES {
        return Err(Error::bad_argument(format!(
            "procedure name too long: {} bytes",
            procedure.len()
        )));
    }
    if params.arity() > u16::MAX as usize {
        return Err(Error::bad_argument(format!(
            "too many parameters: {}",
            params.arity()
        )));
    }

    let mut buf = BytesMut::new();
    buf.put_u64(execution_id);
    put_str(&mut buf, procedure);
    buf.put_u16(params.arity() as u16);
    params.encode_into(&mut buf)?;
    Ok(buf.freeze())
}

/// A decoded invocation request. The server side of `encode_invocation`;
/// exists for the mock servers in the test suite.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub execution_id: u64,
    pub procedure: String,
    pub param_count: u16,
    pub param_block: Bytes,
}

pub fn decode_invocation(mut payload: Bytes) -> Result<InvocationRequest> {
    if payload.remaining() < 8 {
        return Err(short_frame());
    }
    let execution_id = payload.get_u64();
    let procedure = get_str(&mut payload)?;
    if payload.remaining() < 2 {
        return Err(short_frame());
    }
    let param_count = payload.get_u16();
    Ok(InvocationRequest {
        execution_id,
        procedure,
        param_count,
        param_block: payload,
    })
}

/// Server status byte in an invocation response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    UserAbort,
    GracefulFailure,
    UnexpectedFailure,
}

impl ResponseStatus {
    pub fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(ResponseStatus::Success),
            2 => Ok(ResponseStatus::UserAbort),
            3 => Ok(ResponseStatus::GracefulFailure),
            4 => Ok(ResponseStatus::UnexpectedFailure),
            other => Err(Error::transport_lost(format!(
                "malformed message: unknown response status 0x{:02X}",
                other
            ))),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            ResponseStatus::Success => 1,
            ResponseStatus::UserAbort => 2,
            ResponseStatus::GracefulFailure => 3,
            ResponseStatus::UnexpectedFailure => 4,
        }
    }
}

/// A decoded invocation response, result payload still undecoded.
#[derive(Debug, Clone)]
pub struct InvocationResponse {
    pub execution_id: u64,
    pub status: ResponseStatus,
    /// Server-reported execution duration. Negative values are clamped to 0
    /// at decode time.
    pub duration_ms: i32,
    pub server_message: Option<String>,
    pub payload: Bytes,
}

pub fn decode_response(mut payload: Bytes) -> Result<InvocationResponse> {
    if payload.remaining() < 8 + 1 + 4 + 1 {
        return Err(short_frame());
    }
    let execution_id = payload.get_u64();
    let status = ResponseStatus::from_wire(payload.get_u8())?;
    let duration_ms = payload.get_i32().max(0);
    let has_message = payload.get_u8() != 0;
    let server_message = if has_message {
        Some(get_str(&mut payload)?)
    } else {
        None
    };
    Ok(InvocationResponse {
        execution_id,
        status,
        duration_ms,
        server_message,
        payload,
    })
}

/// Encode an invocation response. Server side, for the mock servers.
pub fn encode_response(
    execution_id: u64,
    status: ResponseStatus,
    duration_ms: i32,
    server_message: Option<&str>,
    result_payload: &[u8],
) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u64(execution_id);
    buf.put_u8(status.to_wire());
    buf.put_i32(duration_ms);
    match server_message {
        Some(msg) => {
            buf.put_u8(1);
            put_str(&mut buf, msg);
        }
        None => buf.put_u8(0),
    }
    buf.put_slice(result_payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::values::{encode_rows, ScalarValue};

    fn identity() -> ClusterIdentity {
        ClusterIdentity {
            build_string: "pulsedb-2.4.1".to_string(),
            cluster_start_timestamp: 1_700_000_000,
            leader_endpoint: "10.0.0.1:21212".to_string(),
        }
    }

    #[test]
    fn test_login_round_trip() {
        let info = HandshakeInfo {
            host_id: 3,
            connection_id: 42,
            identity: identity(),
        };
        let decoded = decode_login_response(encode_login_response(&info)).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_login_rejection_decodes_to_auth_failed() {
        assert!(matches!(
            decode_login_response(encode_login_rejection()),
            Err(Error::AuthFailed(_))
        ));
    }

    #[test]
    fn test_login_request_hashes_password() {
        let payload = encode_login_request("alice", "secret");
        // version + user + 32-byte digest; the cleartext must not appear.
        assert_eq!(payload.len(), 1 + 4 + 5 + 32);
        assert!(!payload.windows(6).any(|w| w == &b"secret"[..]));
    }

    #[test]
    fn test_invocation_round_trip() {
        let payload = encode_invocation(9, "Vote", &(7i64, "ballot")).unwrap();
        let decoded = decode_invocation(payload).unwrap();
        assert_eq!(decoded.execution_id, 9);
        assert_eq!(decoded.procedure, "Vote");
        assert_eq!(decoded.param_count, 2);
    }

    #[test]
    fn test_empty_procedure_name_rejected() {
        assert!(matches!(
            encode_invocation(1, "", &()),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn test_oversize_procedure_name_rejected() {
        let name = "p".repeat(MAX_PROCEDURE_NAME_BYTES + 1);
        assert!(matches!(
            encode_invocation(1, &name, &()),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn test_response_round_trip() {
        let rows = encode_rows(&[vec![ScalarValue::I64(1)]]).unwrap();
        let frame = encode_response(5, ResponseStatus::Success, 12, None, &rows);
        let decoded = decode_response(frame).unwrap();
        assert_eq!(decoded.execution_id, 5);
        assert_eq!(decoded.status, ResponseStatus::Success);
        assert_eq!(decoded.duration_ms, 12);
        assert!(decoded.server_message.is_none());
        assert_eq!(decoded.payload, rows);
    }

    #[test]
    fn test_negative_duration_clamped() {
        let frame = encode_response(5, ResponseStatus::Success, -250, None, &[]);
        let decoded = decode_response(frame).unwrap();
        assert_eq!(decoded.duration_ms, 0);
    }

    #[test]
    fn test_failure_carries_server_message() {
        let frame = encode_response(
            8,
            ResponseStatus::GracefulFailure,
            3,
            Some("constraint violation"),
            &[],
        );
        let decoded = decode_response(frame).unwrap();
        assert_eq!(decoded.status, ResponseStatus::GracefulFailure);
        assert_eq!(decoded.server_message.as_deref(), Some("constraint violation"));
    }

    #[test]
    fn test_unknown_status_rejected() {
        let mut frame = encode_response(8, ResponseStatus::Success, 3, None, &[]).to_vec();
        frame[8] = 0x77;
        assert!(matches!(
            decode_response(Bytes::from(frame)),
            Err(Error::TransportLost(_))
        ));
    }
}
