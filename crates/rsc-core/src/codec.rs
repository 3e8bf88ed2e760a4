//! Length-prefixed frames carrying typed requests and responses.
//!
//! ```text
//! u32 BE   body length
//! u8       protocol version
//! u8       frame kind (1 request, 2 response, 3 handshake)
//! u64 BE   correlation id
//! u16 BE   opcode
//! u64 BE   result code (responses only)
//! ...      JSON payload
//! ```

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::Handshake;
use crate::error::{RscError, RscResult};
use crate::types::{
    Attribute, AttributeRequest, AttributeValue, LibraryInfo, Mechanism, MechanismInfo,
    OutputBuffer, SessionInfo, SlotInfo, TokenInfo, b64,
};

pub const PROTOCOL_VERSION: u8 = 1;
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;
const KIND_HANDSHAKE: u8 = 3;

const REQUEST_HEADER_LEN: usize = 1 + 1 + 8 + 2;
const RESPONSE_HEADER_LEN: usize = REQUEST_HEADER_LEN + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Handshake = 0,
    GetInfo = 1,
    GetSlotList = 2,
    GetSlotInfo = 3,
    GetTokenInfo = 4,
    GetMechanismList = 5,
    GetMechanismInfo = 6,
    OpenSession = 7,
    CloseSession = 8,
    CloseAllSessions = 9,
    GetSessionInfo = 10,
    Login = 11,
    Logout = 12,
    CreateObject = 13,
    DestroyObject = 14,
    GetAttributeValue = 15,
    FindObjectsInit = 16,
    FindObjects = 17,
    FindObjectsFinal = 18,
    EncryptInit = 19,
    Encrypt = 20,
    DecryptInit = 21,
    Decrypt = 22,
    SignInit = 23,
    Sign = 24,
    SignUpdate = 25,
    SignFinal = 26,
    VerifyInit = 27,
    Verify = 28,
    GenerateRandom = 29,
}

impl TryFrom<u16> for Opcode {
    type Error = RscError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let op = match value {
            0 => Self::Handshake,
            1 => Self::GetInfo,
            2 => Self::GetSlotList,
            3 => Self::GetSlotInfo,
            4 => Self::GetTokenInfo,
            5 => Self::GetMechanismList,
            6 => Self::GetMechanismInfo,
            7 => Self::OpenSession,
            8 => Self::CloseSession,
            9 => Self::CloseAllSessions,
            10 => Self::GetSessionInfo,
            11 => Self::Login,
            12 => Self::Logout,
            13 => Self::CreateObject,
            14 => Self::DestroyObject,
            15 => Self::GetAttributeValue,
            16 => Self::FindObjectsInit,
            17 => Self::FindObjects,
            18 => Self::FindObjectsFinal,
            19 => Self::EncryptInit,
            20 => Self::Encrypt,
            21 => Self::DecryptInit,
            22 => Self::Decrypt,
            23 => Self::SignInit,
            24 => Self::Sign,
            25 => Self::SignUpdate,
            26 => Self::SignFinal,
            27 => Self::VerifyInit,
            28 => Self::Verify,
            29 => Self::GenerateRandom,
            other => return Err(RscError::framing(format!("unknown opcode {other}"))),
        };
        Ok(op)
    }
}

/// A forwarded token-interface call. Handles are the server-assigned
/// identifiers; the shim translates before encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    GetInfo,
    GetSlotList {
        token_present: bool,
    },
    GetSlotInfo {
        slot: u64,
    },
    GetTokenInfo {
        slot: u64,
    },
    GetMechanismList {
        slot: u64,
    },
    GetMechanismInfo {
        slot: u64,
        mechanism: u64,
    },
    OpenSession {
        slot: u64,
        flags: u64,
    },
    CloseSession {
        session: u64,
    },
    CloseAllSessions {
        slot: u64,
    },
    GetSessionInfo {
        session: u64,
    },
    Login {
        session: u64,
        user_type: u64,
        #[serde(with = "b64")]
        pin: Vec<u8>,
    },
    Logout {
        session: u64,
    },
    CreateObject {
        session: u64,
        template: Vec<Attribute>,
    },
    DestroyObject {
        session: u64,
        object: u64,
    },
    GetAttributeValue {
        session: u64,
        object: u64,
        template: Vec<AttributeRequest>,
    },
    FindObjectsInit {
        session: u64,
        template: Vec<Attribute>,
    },
    FindObjects {
        session: u64,
        max: u64,
    },
    FindObjectsFinal {
        session: u64,
    },
    EncryptInit {
        session: u64,
        mechanism: Mechanism,
        key: u64,
    },
    Encrypt {
        session: u64,
        #[serde(with = "b64")]
        data: Vec<u8>,
        capacity: Option<u64>,
    },
    DecryptInit {
        session: u64,
        mechanism: Mechanism,
        key: u64,
    },
    Decrypt {
        session: u64,
        #[serde(with = "b64")]
        data: Vec<u8>,
        capacity: Option<u64>,
    },
    SignInit {
        session: u64,
        mechanism: Mechanism,
        key: u64,
    },
    Sign {
        session: u64,
        #[serde(with = "b64")]
        data: Vec<u8>,
        capacity: Option<u64>,
    },
    SignUpdate {
        session: u64,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    SignFinal {
        session: u64,
        capacity: Option<u64>,
    },
    VerifyInit {
        session: u64,
        mechanism: Mechanism,
        key: u64,
    },
    Verify {
        session: u64,
        #[serde(with = "b64")]
        data: Vec<u8>,
        #[serde(with = "b64")]
        signature: Vec<u8>,
    },
    GenerateRandom {
        session: u64,
        len: u64,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::GetInfo => Opcode::GetInfo,
            Self::GetSlotList { .. } => Opcode::GetSlotList,
            Self::GetSlotInfo { .. } => Opcode::GetSlotInfo,
            Self::GetTokenInfo { .. } => Opcode::GetTokenInfo,
            Self::GetMechanismList { .. } => Opcode::GetMechanismList,
            Self::GetMechanismInfo { .. } => Opcode::GetMechanismInfo,
            Self::OpenSession { .. } => Opcode::OpenSession,
            Self::CloseSession { .. } => Opcode::CloseSession,
            Self::CloseAllSessions { .. } => Opcode::CloseAllSessions,
            Self::GetSessionInfo { .. } => Opcode::GetSessionInfo,
            Self::Login { .. } => Opcode::Login,
            Self::Logout { .. } => Opcode::Logout,
            Self::CreateObject { .. } => Opcode::CreateObject,
            Self::DestroyObject { .. } => Opcode::DestroyObject,
            Self::GetAttributeValue { .. } => Opcode::GetAttributeValue,
            Self::FindObjectsInit { .. } => Opcode::FindObjectsInit,
            Self::FindObjects { .. } => Opcode::FindObjects,
            Self::FindObjectsFinal { .. } => Opcode::FindObjectsFinal,
            Self::EncryptInit { .. } => Opcode::EncryptInit,
            Self::Encrypt { .. } => Opcode::Encrypt,
            Self::DecryptInit { .. } => Opcode::DecryptInit,
            Self::Decrypt { .. } => Opcode::Decrypt,
            Self::SignInit { .. } => Opcode::SignInit,
            Self::Sign { .. } => Opcode::Sign,
            Self::SignUpdate { .. } => Opcode::SignUpdate,
            Self::SignFinal { .. } => Opcode::SignFinal,
            Self::VerifyInit { .. } => Opcode::VerifyInit,
            Self::Verify { .. } => Opcode::Verify,
            Self::GenerateRandom { .. } => Opcode::GenerateRandom,
        }
    }

    /// The session a request is bound to, if any. Requests sharing a session
    /// must reach the provider in submission order.
    pub fn session(&self) -> Option<u64> {
        match self {
            Self::GetInfo
            | Self::GetSlotList { .. }
            | Self::GetSlotInfo { .. }
            | Self::GetTokenInfo { .. }
            | Self::GetMechanismList { .. }
            | Self::GetMechanismInfo { .. }
            | Self::OpenSession { .. }
            | Self::CloseAllSessions { .. } => None,
            Self::CloseSession { session }
            | Self::GetSessionInfo { session }
            | Self::Login { session, .. }
            | Self::Logout { session }
            | Self::CreateObject { session, .. }
            | Self::DestroyObject { session, .. }
            | Self::GetAttributeValue { session, .. }
            | Self::FindObjectsInit { session, .. }
            | Self::FindObjects { session, .. }
            | Self::FindObjectsFinal { session }
            | Self::EncryptInit { session, .. }
            | Self::Encrypt { session, .. }
            | Self::DecryptInit { session, .. }
            | Self::Decrypt { session, .. }
            | Self::SignInit { session, .. }
            | Self::Sign { session, .. }
            | Self::SignUpdate { session, .. }
            | Self::SignFinal { session, .. }
            | Self::VerifyInit { session, .. }
            | Self::Verify { session, .. }
            | Self::GenerateRandom { session, .. } => Some(*session),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Empty,
    Info(LibraryInfo),
    Slots { slots: Vec<u64> },
    SlotInfo(SlotInfo),
    TokenInfo(TokenInfo),
    Mechanisms { mechanisms: Vec<u64> },
    MechanismInfo(MechanismInfo),
    Session { session: u64 },
    SessionInfo(SessionInfo),
    Object { object: u64 },
    Objects { objects: Vec<u64> },
    Attributes { values: Vec<AttributeValue> },
    Output(OutputBuffer),
    Random {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
}

impl Reply {
    /// Whether this payload shape can answer `opcode`. Any opcode may be
    /// answered with `Empty` when the result code is an error.
    pub fn answers(&self, opcode: Opcode) -> bool {
        match self {
            Self::Empty => true,
            Self::Info(_) => opcode == Opcode::GetInfo,
            Self::Slots { .. } => opcode == Opcode::GetSlotList,
            Self::SlotInfo(_) => opcode == Opcode::GetSlotInfo,
            Self::TokenInfo(_) => opcode == Opcode::GetTokenInfo,
            Self::Mechanisms { .. } => opcode == Opcode::GetMechanismList,
            Self::MechanismInfo(_) => opcode == Opcode::GetMechanismInfo,
            Self::Session { .. } => opcode == Opcode::OpenSession,
            Self::SessionInfo(_) => opcode == Opcode::GetSessionInfo,
            Self::Object { .. } => opcode == Opcode::CreateObject,
            Self::Objects { .. } => opcode == Opcode::FindObjects,
            Self::Attributes { .. } => opcode == Opcode::GetAttributeValue,
            Self::Output(_) => matches!(
                opcode,
                Opcode::Encrypt | Opcode::Decrypt | Opcode::Sign | Opcode::SignFinal
            ),
            Self::Random { .. } => opcode == Opcode::GenerateRandom,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub correlation: u64,
    pub opcode: Opcode,
    pub rv: u64,
    pub reply: Reply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request { correlation: u64, request: Request },
    Response(Response),
    Handshake(Handshake),
}

/// Encodes a frame including its length prefix.
pub fn encode_frame(frame: &Frame, max_len: usize) -> RscResult<Vec<u8>> {
    let mut body = Vec::with_capacity(128);
    body.push(PROTOCOL_VERSION);
    let payload = match frame {
        Frame::Request {
            correlation,
            request,
        } => {
            body.push(KIND_REQUEST);
            body.extend_from_slice(&correlation.to_be_bytes());
            body.extend_from_slice(&(request.opcode() as u16).to_be_bytes());
            serde_json::to_vec(request)
        }
        Frame::Response(response) => {
            body.push(KIND_RESPONSE);
            body.extend_from_slice(&response.correlation.to_be_bytes());
            body.extend_from_slice(&(response.opcode as u16).to_be_bytes());
            body.extend_from_slice(&response.rv.to_be_bytes());
            serde_json::to_vec(&response.reply)
        }
        Frame::Handshake(message) => {
            body.push(KIND_HANDSHAKE);
            body.extend_from_slice(&0u64.to_be_bytes());
            body.extend_from_slice(&(Opcode::Handshake as u16).to_be_bytes());
            serde_json::to_vec(message)
        }
    }
    .map_err(RscError::framing)?;
    body.extend_from_slice(&payload);

    if body.len() > max_len {
        return Err(RscError::FrameTooLarge {
            len: body.len(),
            max: max_len,
        });
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a frame body (without its length prefix).
pub fn decode_body(body: &[u8]) -> RscResult<Frame> {
    if body.len() < REQUEST_HEADER_LEN {
        return Err(RscError::framing(format!(
            "frame body of {} bytes is shorter than the header",
            body.len()
        )));
    }
    if body[0] != PROTOCOL_VERSION {
        return Err(RscError::framing(format!(
            "unsupported protocol version {}",
            body[0]
        )));
    }
    let kind = body[1];
    let correlation = u64::from_be_bytes(fixed(&body[2..10])?);
    let opcode = Opcode::try_from(u16::from_be_bytes(fixed(&body[10..12])?))?;

    match kind {
        KIND_REQUEST => {
            let request: Request =
                serde_json::from_slice(&body[REQUEST_HEADER_LEN..]).map_err(RscError::framing)?;
            if request.opcode() != opcode || correlation == 0 {
                return Err(RscError::framing(format!(
                    "request payload does not match header opcode {opcode:?}"
                )));
            }
            Ok(Frame::Request {
                correlation,
                request,
            })
        }
        KIND_RESPONSE => {
            if body.len() < RESPONSE_HEADER_LEN {
                return Err(RscError::framing("response header truncated"));
            }
            let rv = u64::from_be_bytes(fixed(&body[12..20])?);
            let reply: Reply =
                serde_json::from_slice(&body[RESPONSE_HEADER_LEN..]).map_err(RscError::framing)?;
            if !reply.answers(opcode) {
                return Err(RscError::framing(format!(
                    "response payload does not answer opcode {opcode:?}"
                )));
            }
            Ok(Frame::Response(Response {
                correlation,
                opcode,
                rv,
                reply,
            }))
        }
        KIND_HANDSHAKE => {
            if opcode != Opcode::Handshake {
                return Err(RscError::framing("handshake frame with request opcode"));
            }
            let message: Handshake =
                serde_json::from_slice(&body[REQUEST_HEADER_LEN..]).map_err(RscError::framing)?;
            Ok(Frame::Handshake(message))
        }
        other => Err(RscError::framing(format!("unknown frame kind {other}"))),
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> RscResult<[u8; N]> {
    <[u8; N]>::try_from(bytes).map_err(RscError::framing)
}

/// Reads one frame. Returns `Ok(None)` when the peer closed the stream
/// between frames.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> RscResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(RscError::FrameTooLarge { len, max: max_len });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            RscError::framing(format!("stream ended inside a {len} byte frame"))
        } else {
            RscError::Io(err)
        }
    })?;
    decode_body(&body).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame, max_len: usize) -> RscResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame, max_len)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoki_sys::{CKM_SHA256_HMAC, CKR_BUFFER_TOO_SMALL, CKR_OK};

    fn sign_request() -> Frame {
        Frame::Request {
            correlation: 7,
            request: Request::SignInit {
                session: 3,
                mechanism: Mechanism::new(CKM_SHA256_HMAC as u64),
                key: 11,
            },
        }
    }

    #[test]
    fn request_frame_decodes_to_same_request() {
        let frame = sign_request();
        let bytes = encode_frame(&frame, DEFAULT_MAX_FRAME_LEN).expect("encode");
        let len = u32::from_be_bytes(bytes[..4].try_into().expect("prefix")) as usize;
        assert_eq!(len, bytes.len() - 4);
        assert_eq!(decode_body(&bytes[4..]).expect("decode"), frame);
    }

    #[test]
    fn response_carries_result_code_and_required_length() {
        let frame = Frame::Response(Response {
            correlation: 9,
            opcode: Opcode::Sign,
            rv: CKR_BUFFER_TOO_SMALL as u64,
            reply: Reply::Output(OutputBuffer::length(32)),
        });
        let bytes = encode_frame(&frame, DEFAULT_MAX_FRAME_LEN).expect("encode");
        assert_eq!(decode_body(&bytes[4..]).expect("decode"), frame);
    }

    #[test]
    fn mismatched_opcode_is_a_framing_error() {
        let mut bytes = encode_frame(&sign_request(), DEFAULT_MAX_FRAME_LEN).expect("encode");
        // header opcode sits after length(4) + version(1) + kind(1) + correlation(8)
        bytes[14..16].copy_from_slice(&(Opcode::Login as u16).to_be_bytes());
        assert!(matches!(
            decode_body(&bytes[4..]),
            Err(RscError::Framing(_))
        ));
    }

    #[test]
    fn reply_shape_must_answer_opcode() {
        let frame = Frame::Response(Response {
            correlation: 1,
            opcode: Opcode::GetInfo,
            rv: CKR_OK as u64,
            reply: Reply::Slots { slots: vec![0] },
        });
        let bytes = encode_frame(&frame, DEFAULT_MAX_FRAME_LEN).expect("encode");
        assert!(decode_body(&bytes[4..]).is_err());
    }

    #[test]
    fn short_and_unknown_bodies_are_rejected() {
        assert!(decode_body(&[PROTOCOL_VERSION, KIND_REQUEST, 0]).is_err());

        let mut bytes = encode_frame(&sign_request(), DEFAULT_MAX_FRAME_LEN).expect("encode");
        bytes[4] = 9;
        assert!(decode_body(&bytes[4..]).is_err());

        let mut bytes = encode_frame(&sign_request(), DEFAULT_MAX_FRAME_LEN).expect("encode");
        bytes[5] = 42;
        assert!(decode_body(&bytes[4..]).is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_reading_body() {
        let mut prefix = Vec::new();
        prefix.extend_from_slice(&(64u32 * 1024).to_be_bytes());
        let mut reader = prefix.as_slice();
        let err = read_frame(&mut reader, 1024).await.expect_err("too large");
        assert!(matches!(err, RscError::FrameTooLarge { max: 1024, .. }));
    }

    #[tokio::test]
    async fn truncated_frame_is_a_framing_error() {
        let bytes = encode_frame(&sign_request(), DEFAULT_MAX_FRAME_LEN).expect("encode");
        let mut reader = &bytes[..bytes.len() - 3];
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN)
            .await
            .expect_err("truncated");
        assert!(matches!(err, RscError::Framing(_)));
    }

    #[tokio::test]
    async fn clean_eof_between_frames_is_not_an_error() {
        let bytes = encode_frame(&sign_request(), DEFAULT_MAX_FRAME_LEN).expect("encode");
        let mut reader = bytes.as_slice();
        assert!(read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN)
            .await
            .expect("first")
            .is_some());
        assert!(read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN)
            .await
            .expect("eof")
            .is_none());
    }
}
