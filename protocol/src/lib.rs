use serde::{Deserialize, Serialize};

pub mod buffer;
pub mod codec;

pub use buffer::{BoundedBuf, BufferError};
pub use codec::{
    peek_context, peek_pid, CancelPendingWaits, CodecError, ExecStart, GetOutput,
    GuestProcessSpec, Message, ReportInputStatus, ReportOutput, ReportStatus, SetInput,
};

/// Vsock port the host-side execution control service listens on.
pub const HOST_SERVICE_PORT: u32 = 5000;

/// Well-known vsock CID of the hypervisor host (VMADDR_CID_HOST).
pub const HOST_CID: u32 = 2;

/// Maximum frame size (16 MiB) to prevent unbounded allocations.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the stdin staging buffer for one `SetInput` message (1 MiB).
pub const MAX_INPUT_BUFFER: usize = 1024 * 1024;

/// Size of the buffer one `GetOutput` request reads into (64 KiB).
pub const MAX_OUTPUT_BUFFER: usize = 64 * 1024;

/// Limit for the packed argument block of an `ExecStart` message.
pub const MAX_ARGS_BLOCK: usize = 64 * 1024;

/// Limit for the packed environment block of an `ExecStart` message.
pub const MAX_ENV_BLOCK: usize = 64 * 1024;

// Framing: each message is a 4-byte big-endian length prefix followed by JSON bytes.
// The length prefix encodes the size of the JSON payload only (not including itself).

// ---------------------------------------------------------------------------
// Typed parameters
// ---------------------------------------------------------------------------

/// One typed parameter of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Param {
    U32(u32),
    U64(u64),
    /// Raw bytes, base64-encoded on the wire.
    Buffer(#[serde(with = "base64_bytes")] Vec<u8>),
}

impl Param {
    pub fn kind(&self) -> ParamKind {
        match self {
            Param::U32(_) => ParamKind::U32,
            Param::U64(_) => ParamKind::U64,
            Param::Buffer(_) => ParamKind::Buffer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    U32,
    U64,
    Buffer,
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamKind::U32 => write!(f, "u32"),
            ParamKind::U64 => write!(f, "u64"),
            ParamKind::Buffer => write!(f, "buffer"),
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// A complete message as it travels over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Message id (see [`HostMessageType`] and [`GuestMessageType`]).
    pub msg: u32,
    #[serde(default)]
    pub params: Vec<Param>,
}

impl Frame {
    pub fn new(msg: u32, params: Vec<Param>) -> Self {
        Self { msg, params }
    }

    pub fn param_count(&self) -> u32 {
        self.params.len() as u32
    }
}

// ---------------------------------------------------------------------------
// Message identifiers
// ---------------------------------------------------------------------------

/// Messages the host sends to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostMessageType {
    /// The host is tearing the channel down; stop blocking waits.
    CancelPendingWaits,
    /// Start a new guest process.
    ExecStart,
    /// Deliver stdin bytes to a guest process.
    SetInput,
    /// Collect buffered stdout/stderr of a guest process.
    GetOutput,
}

impl HostMessageType {
    pub const fn id(self) -> u32 {
        match self {
            HostMessageType::CancelPendingWaits => 0,
            HostMessageType::ExecStart => 100,
            HostMessageType::SetInput => 101,
            HostMessageType::GetOutput => 102,
        }
    }

    /// Unknown ids map to `None`; callers must tolerate them.
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(HostMessageType::CancelPendingWaits),
            100 => Some(HostMessageType::ExecStart),
            101 => Some(HostMessageType::SetInput),
            102 => Some(HostMessageType::GetOutput),
            _ => None,
        }
    }
}

/// Messages the guest sends to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestMessageType {
    ReportStatus,
    ReportOutput,
    ReportInputStatus,
}

impl GuestMessageType {
    pub const fn id(self) -> u32 {
        match self {
            GuestMessageType::ReportStatus => 100,
            GuestMessageType::ReportOutput => 101,
            GuestMessageType::ReportInputStatus => 102,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            100 => Some(GuestMessageType::ReportStatus),
            101 => Some(GuestMessageType::ReportOutput),
            102 => Some(GuestMessageType::ReportInputStatus),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Scalar types and codes
// ---------------------------------------------------------------------------

/// Host-chosen correlation id carried unmodified through one round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextToken(pub u32);

impl std::fmt::Display for ContextToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Flags of an `ExecStart` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecFlags(pub u32);

impl ExecFlags {
    pub const NONE: ExecFlags = ExecFlags(0);
    /// Leave the process running when the guest stops tracking it.
    pub const IGNORE_ORPHANED_PROCESSES: ExecFlags = ExecFlags(1 << 1);
    pub const HIDDEN: ExecFlags = ExecFlags(1 << 2);
    pub const NO_PROFILE: ExecFlags = ExecFlags(1 << 3);
    /// Capture stdout so the host can collect it with `GetOutput`.
    pub const WAIT_STDOUT: ExecFlags = ExecFlags(1 << 4);
    /// Capture stderr so the host can collect it with `GetOutput`.
    pub const WAIT_STDERR: ExecFlags = ExecFlags(1 << 5);

    pub const fn contains(self, other: ExecFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ExecFlags {
    type Output = ExecFlags;

    fn bitor(self, rhs: ExecFlags) -> ExecFlags {
        ExecFlags(self.0 | rhs.0)
    }
}

/// Flags of a `SetInput` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputFlags(pub u32);

impl InputFlags {
    pub const NONE: InputFlags = InputFlags(0);
    /// Close stdin after this block has been written.
    pub const EOF: InputFlags = InputFlags(1 << 0);

    pub const fn is_eof(self) -> bool {
        self.0 & Self::EOF.0 != 0
    }
}

/// Stream selector of a `GetOutput` / `ReportOutput` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputHandle {
    /// Old hosts send 0 for stdout.
    StdoutDeprecated,
    Stdout,
    Stderr,
}

impl OutputHandle {
    pub const fn id(self) -> u32 {
        match self {
            OutputHandle::StdoutDeprecated => 0,
            OutputHandle::Stdout => 1,
            OutputHandle::Stderr => 2,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(OutputHandle::StdoutDeprecated),
            1 => Some(OutputHandle::Stdout),
            2 => Some(OutputHandle::Stderr),
            _ => None,
        }
    }

    pub fn is_stderr(self) -> bool {
        matches!(self, OutputHandle::Stderr)
    }
}

/// Process status carried by `ReportStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessStatus {
    Undefined,
    Started,
    /// Flags carry the exit code.
    TerminatedNormally,
    /// Flags carry the signal number.
    TerminatedSignal,
    TerminatedAbnormally,
    TimedOutKilled,
    TimedOutAbandoned,
    /// The guest service went down while the process was tracked.
    Down,
    /// Flags carry an [`ErrorCode`].
    Error,
}

impl ProcessStatus {
    pub const fn code(self) -> u32 {
        match self {
            ProcessStatus::Undefined => 0,
            ProcessStatus::Started => 1,
            ProcessStatus::TerminatedNormally => 2,
            ProcessStatus::TerminatedSignal => 3,
            ProcessStatus::TerminatedAbnormally => 4,
            ProcessStatus::TimedOutKilled => 5,
            ProcessStatus::TimedOutAbandoned => 6,
            ProcessStatus::Down => 7,
            ProcessStatus::Error => 8,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => ProcessStatus::Undefined,
            1 => ProcessStatus::Started,
            2 => ProcessStatus::TerminatedNormally,
            3 => ProcessStatus::TerminatedSignal,
            4 => ProcessStatus::TerminatedAbnormally,
            5 => ProcessStatus::TimedOutKilled,
            6 => ProcessStatus::TimedOutAbandoned,
            7 => ProcessStatus::Down,
            8 => ProcessStatus::Error,
            _ => return None,
        })
    }

    /// True for every status after which the process no longer runs.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcessStatus::Undefined | ProcessStatus::Started)
    }
}

/// Result of a stdin delivery carried by `ReportInputStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputStatus {
    Undefined,
    Written,
    Error,
    /// The process (or its stdin) is gone.
    Terminated,
    /// The block did not fit the input buffer.
    Overflow,
}

impl InputStatus {
    pub const fn code(self) -> u32 {
        match self {
            InputStatus::Undefined => 0,
            InputStatus::Written => 1,
            InputStatus::Error => 20,
            InputStatus::Terminated => 21,
            InputStatus::Overflow => 100,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => InputStatus::Undefined,
            1 => InputStatus::Written,
            20 => InputStatus::Error,
            21 => InputStatus::Terminated,
            100 => InputStatus::Overflow,
            _ => return None,
        })
    }
}

/// Error codes carried in the flags of error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotFound,
    InvalidParameter,
    AdmissionDenied,
    SpawnFailed,
    Io,
    Timeout,
    Internal,
}

impl ErrorCode {
    pub const fn code(self) -> u32 {
        match self {
            ErrorCode::NotFound => 1,
            ErrorCode::InvalidParameter => 2,
            ErrorCode::AdmissionDenied => 3,
            ErrorCode::SpawnFailed => 4,
            ErrorCode::Io => 5,
            ErrorCode::Timeout => 6,
            ErrorCode::Internal => 7,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => ErrorCode::NotFound,
            2 => ErrorCode::InvalidParameter,
            3 => ErrorCode::AdmissionDenied,
            4 => ErrorCode::SpawnFailed,
            5 => ErrorCode::Io,
            6 => ErrorCode::Timeout,
            7 => ErrorCode::Internal,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short for length prefix")]
    ShortPrefix,

    #[error("buffer too short for payload: need {needed} bytes, have {available}")]
    ShortPayload { needed: usize, available: usize },

    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: u32, max: u32 },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Encode a message as length-prefixed JSON bytes.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decode a length-prefixed JSON message from a byte buffer.
/// Returns the deserialized message and the number of bytes consumed.
pub fn decode_message<T: serde::de::DeserializeOwned>(buf: &[u8]) -> Result<(T, usize), FrameError> {
    if buf.len() < 4 {
        return Err(FrameError::ShortPrefix);
    }
    let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if declared > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            size: declared,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let len = declared as usize;
    if buf.len() < 4 + len {
        return Err(FrameError::ShortPayload {
            needed: 4 + len,
            available: buf.len(),
        });
    }
    let msg: T = serde_json::from_slice(&buf[4..4 + len])?;
    Ok((msg, 4 + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Param serialization
    // -----------------------------------------------------------------------

    #[test]
    fn test_param_buffer_is_base64_on_the_wire() {
        let param = Param::Buffer(b"hello".to_vec());
        let json = serde_json::to_string(&param).unwrap();
        assert_eq!(json, r#"{"type":"Buffer","value":"aGVsbG8="}"#);
        let rt: Param = serde_json::from_str(&json).unwrap();
        assert_eq!(rt, param);
    }

    #[test]
    fn test_param_binary_buffer_roundtrip() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let param = Param::Buffer(bytes.clone());
        let rt: Param = serde_json::from_str(&serde_json::to_string(&param).unwrap()).unwrap();
        assert_eq!(rt, Param::Buffer(bytes));
    }

    #[test]
    fn test_param_scalars_roundtrip() {
        for param in [Param::U32(u32::MAX), Param::U64(u64::MAX), Param::U32(0)] {
            let rt: Param = serde_json::from_str(&serde_json::to_string(&param).unwrap()).unwrap();
            assert_eq!(rt, param);
        }
    }

    #[test]
    fn test_param_invalid_base64_rejected() {
        let json = r#"{"type":"Buffer","value":"not base64!!"}"#;
        assert!(serde_json::from_str::<Param>(json).is_err());
    }

    #[test]
    fn test_frame_missing_params_defaults_empty() {
        let frame: Frame = serde_json::from_str(r#"{"msg":0}"#).unwrap();
        assert_eq!(frame.msg, HostMessageType::CancelPendingWaits.id());
        assert_eq!(frame.param_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Identifiers and codes
    // -----------------------------------------------------------------------

    #[test]
    fn test_host_message_ids() {
        for ty in [
            HostMessageType::CancelPendingWaits,
            HostMessageType::ExecStart,
            HostMessageType::SetInput,
            HostMessageType::GetOutput,
        ] {
            assert_eq!(HostMessageType::from_id(ty.id()), Some(ty));
        }
        assert_eq!(HostMessageType::from_id(4242), None);
    }

    #[test]
    fn test_guest_message_ids() {
        for ty in [
            GuestMessageType::ReportStatus,
            GuestMessageType::ReportOutput,
            GuestMessageType::ReportInputStatus,
        ] {
            assert_eq!(GuestMessageType::from_id(ty.id()), Some(ty));
        }
        assert_eq!(GuestMessageType::from_id(1), None);
    }

    #[test]
    fn test_output_handle_aliases() {
        assert_eq!(OutputHandle::from_id(0), Some(OutputHandle::StdoutDeprecated));
        assert_eq!(OutputHandle::from_id(1), Some(OutputHandle::Stdout));
        assert_eq!(OutputHandle::from_id(2), Some(OutputHandle::Stderr));
        assert_eq!(OutputHandle::from_id(3), None);
        assert!(!OutputHandle::StdoutDeprecated.is_stderr());
        assert!(OutputHandle::Stderr.is_stderr());
    }

    #[test]
    fn test_status_codes_roundtrip() {
        for code in 0..=8 {
            let status = ProcessStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert!(ProcessStatus::from_code(9).is_none());
        assert!(!ProcessStatus::Started.is_terminal());
        assert!(ProcessStatus::TimedOutKilled.is_terminal());

        for status in [
            InputStatus::Undefined,
            InputStatus::Written,
            InputStatus::Error,
            InputStatus::Terminated,
            InputStatus::Overflow,
        ] {
            assert_eq!(InputStatus::from_code(status.code()), Some(status));
        }
    }

    #[test]
    fn test_all_error_codes_roundtrip() {
        for code in [
            ErrorCode::NotFound,
            ErrorCode::InvalidParameter,
            ErrorCode::AdmissionDenied,
            ErrorCode::SpawnFailed,
            ErrorCode::Io,
            ErrorCode::Timeout,
            ErrorCode::Internal,
        ] {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(0), None);
    }

    #[test]
    fn test_flag_helpers() {
        let flags = ExecFlags::WAIT_STDOUT | ExecFlags::WAIT_STDERR;
        assert!(flags.contains(ExecFlags::WAIT_STDOUT));
        assert!(!flags.contains(ExecFlags::IGNORE_ORPHANED_PROCESSES));
        assert!(InputFlags::EOF.is_eof());
        assert!(!InputFlags::NONE.is_eof());
        assert!(InputFlags(0x3).is_eof());
    }

    #[test]
    fn test_context_token_display() {
        assert_eq!(ContextToken(0xbeef).to_string(), "0x0000beef");
    }

    // -----------------------------------------------------------------------
    // Length-prefixed framing
    // -----------------------------------------------------------------------

    #[test]
    fn test_encode_decode_framing() {
        let frame = Frame::new(HostMessageType::GetOutput.id(), vec![Param::U32(7)]);
        let encoded = encode_message(&frame).unwrap();

        // First 4 bytes are big-endian length.
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len() - 4);

        let (decoded, consumed): (Frame, usize) = decode_message(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_decode_consumes_only_first_frame() {
        let a = encode_message(&Frame::new(100, vec![])).unwrap();
        let b = encode_message(&Frame::new(101, vec![])).unwrap();
        let mut both = a.clone();
        both.extend_from_slice(&b);
        let (first, consumed): (Frame, usize) = decode_message(&both).unwrap();
        assert_eq!(first.msg, 100);
        assert_eq!(consumed, a.len());
        let (second, _): (Frame, usize) = decode_message(&both[consumed..]).unwrap();
        assert_eq!(second.msg, 101);
    }

    #[test]
    fn test_decode_buffer_too_short() {
        let result = decode_message::<Frame>(&[0, 0]);
        assert!(matches!(result, Err(FrameError::ShortPrefix)));
    }

    #[test]
    fn test_decode_payload_incomplete() {
        // Length prefix says 100 bytes but only 4 bytes of payload follow.
        let buf = vec![0, 0, 0, 100, 1, 2, 3, 4];
        let result = decode_message::<Frame>(&buf);
        assert!(matches!(result, Err(FrameError::ShortPayload { needed: 104, .. })));
    }

    #[test]
    fn test_decode_rejects_oversized_prefix() {
        let buf = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let result = decode_message::<Frame>(&buf);
        assert!(matches!(result, Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn test_buffer_constants_are_powers_of_two() {
        assert!(MAX_INPUT_BUFFER.is_power_of_two());
        assert!(MAX_OUTPUT_BUFFER.is_power_of_two());
        assert_eq!(MAX_OUTPUT_BUFFER, 64 * 1024);
        assert_eq!(MAX_MESSAGE_SIZE, 16 * 1024 * 1024);
    }
}
