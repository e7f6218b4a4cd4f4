//! Typed encode/decode of the fixed message shapes.
//!
//! Each message converts to and from a flat parameter list whose index order
//! is part of the wire contract. Decoding is total: wrong counts, wrong
//! parameter kinds, bad UTF-8 and oversized declared sizes all come back as
//! [`CodecError`], never as a panic or a silently truncated value.

use crate::buffer::{BoundedBuf, BufferError};
use crate::{
    ContextToken, ErrorCode, ExecFlags, Frame, GuestMessageType, HostMessageType, InputFlags,
    InputStatus, OutputHandle, Param, ParamKind, ProcessStatus, MAX_ARGS_BLOCK, MAX_ENV_BLOCK,
    MAX_INPUT_BUFFER, MAX_OUTPUT_BUFFER,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("expected {expected} parameters, got {actual}")]
    ParamCount { expected: usize, actual: usize },

    #[error("parameter {index}: expected {expected}, got {actual}")]
    ParamType {
        index: usize,
        expected: ParamKind,
        actual: ParamKind,
    },

    #[error("parameter {index}: {source}")]
    Buffer {
        index: usize,
        #[source]
        source: BufferError,
    },

    #[error("parameter {index}: not valid UTF-8")]
    Utf8 { index: usize },

    #[error("parameter {index}: {reason}")]
    Invalid { index: usize, reason: String },

    #[error("expected message {expected}, got {actual}")]
    WrongMessage { expected: u32, actual: u32 },
}

impl CodecError {
    /// True when a declared size exceeded a fixed buffer.
    pub fn is_overflow(&self) -> bool {
        matches!(
            self,
            CodecError::Buffer {
                source: BufferError::Oversize { .. },
                ..
            }
        )
    }

    /// Every decode failure is an invalid parameter as far as the host is concerned.
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::InvalidParameter
    }
}

/// A message with a fixed parameter layout.
pub trait Message: Sized {
    /// Message id on the wire.
    const ID: u32;
    /// Number of parameters in the layout.
    const PARAM_COUNT: usize;

    fn encode(&self) -> Vec<Param>;

    fn decode(params: &[Param]) -> Result<Self, CodecError>;

    fn to_frame(&self) -> Frame {
        Frame::new(Self::ID, self.encode())
    }

    fn from_frame(frame: &Frame) -> Result<Self, CodecError> {
        if frame.msg != Self::ID {
            return Err(CodecError::WrongMessage {
                expected: Self::ID,
                actual: frame.msg,
            });
        }
        Self::decode(&frame.params)
    }
}

/// The context token, if the first parameter carries one.
///
/// Used to answer messages whose full decode failed.
pub fn peek_context(params: &[Param]) -> Option<ContextToken> {
    match params.first() {
        Some(Param::U32(v)) => Some(ContextToken(*v)),
        _ => None,
    }
}

/// The PID of a per-process message (`SetInput`/`GetOutput`), if present.
pub fn peek_pid(params: &[Param]) -> Option<u32> {
    match params.get(1) {
        Some(Param::U32(v)) => Some(*v),
        _ => None,
    }
}

struct ParamReader<'a> {
    params: &'a [Param],
    index: usize,
}

impl<'a> ParamReader<'a> {
    fn new(params: &'a [Param], expected: usize) -> Result<Self, CodecError> {
        if params.len() != expected {
            return Err(CodecError::ParamCount {
                expected,
                actual: params.len(),
            });
        }
        Ok(Self { params, index: 0 })
    }

    fn next(&mut self, expected: ParamKind) -> Result<(usize, &'a Param), CodecError> {
        let index = self.index;
        let param = &self.params[index];
        self.index += 1;
        if param.kind() != expected {
            return Err(CodecError::ParamType {
                index,
                expected,
                actual: param.kind(),
            });
        }
        Ok((index, param))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        match self.next(ParamKind::U32)? {
            (_, Param::U32(v)) => Ok(*v),
            _ => unreachable!("kind checked by next()"),
        }
    }

    fn buffer(&mut self) -> Result<(usize, &'a [u8]), CodecError> {
        match self.next(ParamKind::Buffer)? {
            (index, Param::Buffer(bytes)) => Ok((index, bytes.as_slice())),
            _ => unreachable!("kind checked by next()"),
        }
    }

    fn context(&mut self) -> Result<ContextToken, CodecError> {
        self.u32().map(ContextToken)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let (index, bytes) = self.buffer()?;
        decode_string(index, bytes)
    }
}

fn decode_string(index: usize, bytes: &[u8]) -> Result<String, CodecError> {
    let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);
    if bytes.contains(&0) {
        return Err(CodecError::Invalid {
            index,
            reason: "embedded NUL".into(),
        });
    }
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::Utf8 { index })
}

fn pack_block(entries: &[String]) -> Vec<u8> {
    let mut block = Vec::with_capacity(entries.iter().map(|e| e.len() + 1).sum());
    for entry in entries {
        block.extend_from_slice(entry.as_bytes());
        block.push(0);
    }
    block
}

fn unpack_block(index: usize, block: &[u8], declared_count: u32) -> Result<Vec<String>, CodecError> {
    let entries: Vec<String> = if block.is_empty() {
        Vec::new()
    } else {
        let body = block.strip_suffix(&[0]).unwrap_or(block);
        body.split(|b| *b == 0)
            .map(|raw| {
                String::from_utf8(raw.to_vec()).map_err(|_| CodecError::Utf8 { index })
            })
            .collect::<Result<_, _>>()?
    };
    if entries.len() != declared_count as usize {
        return Err(CodecError::Invalid {
            index,
            reason: format!(
                "declared {} entries, block holds {}",
                declared_count,
                entries.len()
            ),
        });
    }
    Ok(entries)
}

fn bounded(index: usize, declared: usize, source: &[u8], capacity: usize) -> Result<BoundedBuf, CodecError> {
    BoundedBuf::from_declared(declared, source, capacity)
        .map_err(|source| CodecError::Buffer { index, source })
}

// ---------------------------------------------------------------------------
// Host -> Guest
// ---------------------------------------------------------------------------

/// Immutable description of a process to start.
#[derive(Clone, PartialEq, Eq)]
pub struct GuestProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` sets a variable, a bare `KEY` removes it.
    pub env: Vec<String>,
    pub user: String,
    pub password: String,
    pub flags: ExecFlags,
    /// Zero means no limit.
    pub time_limit_ms: u32,
}

impl GuestProcessSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            user: String::new(),
            password: String::new(),
            flags: ExecFlags::NONE,
            time_limit_ms: 0,
        }
    }
}

// Keep the password out of logs.
impl std::fmt::Debug for GuestProcessSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestProcessSpec")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env", &self.env.len())
            .field("user", &self.user)
            .field("flags", &self.flags)
            .field("time_limit_ms", &self.time_limit_ms)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecStart {
    pub context: ContextToken,
    pub spec: GuestProcessSpec,
}

impl Message for ExecStart {
    const ID: u32 = HostMessageType::ExecStart.id();
    const PARAM_COUNT: usize = 11;

    fn encode(&self) -> Vec<Param> {
        let spec = &self.spec;
        let env = pack_block(&spec.env);
        vec![
            Param::U32(self.context.0),
            Param::Buffer(spec.command.as_bytes().to_vec()),
            Param::U32(spec.flags.0),
            Param::U32(spec.args.len() as u32),
            Param::Buffer(pack_block(&spec.args)),
            Param::U32(spec.env.len() as u32),
            Param::U32(env.len() as u32),
            Param::Buffer(env),
            Param::Buffer(spec.user.as_bytes().to_vec()),
            Param::Buffer(spec.password.as_bytes().to_vec()),
            Param::U32(spec.time_limit_ms),
        ]
    }

    fn decode(params: &[Param]) -> Result<Self, CodecError> {
        let mut r = ParamReader::new(params, Self::PARAM_COUNT)?;
        let context = r.context()?;
        let command = r.string()?;
        if command.is_empty() {
            return Err(CodecError::Invalid {
                index: 1,
                reason: "empty command".into(),
            });
        }
        let flags = ExecFlags(r.u32()?);

        let arg_count = r.u32()?;
        let (args_index, args_block) = r.buffer()?;
        let args_block = bounded(args_index, args_block.len(), args_block, MAX_ARGS_BLOCK)?;
        let args = unpack_block(args_index, args_block.as_slice(), arg_count)?;

        let env_count = r.u32()?;
        let env_size = r.u32()? as usize;
        let (env_index, env_block) = r.buffer()?;
        let env_block = bounded(env_index, env_size, env_block, MAX_ENV_BLOCK)?;
        let env = unpack_block(env_index, env_block.as_slice(), env_count)?;
        if let Some(bad) = env.iter().find(|e| e.is_empty() || e.starts_with('=')) {
            return Err(CodecError::Invalid {
                index: env_index,
                reason: format!("malformed environment entry {bad:?}"),
            });
        }

        let user = r.string()?;
        let password = r.string()?;
        let time_limit_ms = r.u32()?;

        Ok(Self {
            context,
            spec: GuestProcessSpec {
                command,
                args,
                env,
                user,
                password,
                flags,
                time_limit_ms,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetInput {
    pub context: ContextToken,
    pub pid: u32,
    pub flags: InputFlags,
    pub data: BoundedBuf,
}

impl SetInput {
    pub fn new(context: ContextToken, pid: u32, flags: InputFlags, data: &[u8]) -> Result<Self, BufferError> {
        Ok(Self {
            context,
            pid,
            flags,
            data: BoundedBuf::from_slice(data, MAX_INPUT_BUFFER)?,
        })
    }
}

impl Message for SetInput {
    const ID: u32 = HostMessageType::SetInput.id();
    const PARAM_COUNT: usize = 5;

    fn encode(&self) -> Vec<Param> {
        vec![
            Param::U32(self.context.0),
            Param::U32(self.pid),
            Param::U32(self.flags.0),
            Param::Buffer(self.data.as_slice().to_vec()),
            Param::U32(self.data.len() as u32),
        ]
    }

    fn decode(params: &[Param]) -> Result<Self, CodecError> {
        let mut r = ParamReader::new(params, Self::PARAM_COUNT)?;
        let context = r.context()?;
        let pid = r.u32()?;
        let flags = InputFlags(r.u32()?);
        let (data_index, data) = r.buffer()?;
        let size = r.u32()? as usize;
        let data = bounded(data_index, size, data, MAX_INPUT_BUFFER)?;
        Ok(Self {
            context,
            pid,
            flags,
            data,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOutput {
    pub context: ContextToken,
    pub pid: u32,
    pub handle: OutputHandle,
    pub flags: u32,
}

impl Message for GetOutput {
    const ID: u32 = HostMessageType::GetOutput.id();
    const PARAM_COUNT: usize = 4;

    fn encode(&self) -> Vec<Param> {
        vec![
            Param::U32(self.context.0),
            Param::U32(self.pid),
            Param::U32(self.handle.id()),
            Param::U32(self.flags),
        ]
    }

    fn decode(params: &[Param]) -> Result<Self, CodecError> {
        let mut r = ParamReader::new(params, Self::PARAM_COUNT)?;
        let context = r.context()?;
        let pid = r.u32()?;
        let raw_handle = r.u32()?;
        let handle = OutputHandle::from_id(raw_handle).ok_or_else(|| CodecError::Invalid {
            index: 2,
            reason: format!("unknown output handle {raw_handle}"),
        })?;
        let flags = r.u32()?;
        Ok(Self {
            context,
            pid,
            handle,
            flags,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelPendingWaits;

impl Message for CancelPendingWaits {
    const ID: u32 = HostMessageType::CancelPendingWaits.id();
    const PARAM_COUNT: usize = 0;

    fn encode(&self) -> Vec<Param> {
        Vec::new()
    }

    fn decode(params: &[Param]) -> Result<Self, CodecError> {
        ParamReader::new(params, Self::PARAM_COUNT)?;
        Ok(CancelPendingWaits)
    }
}

// ---------------------------------------------------------------------------
// Guest -> Host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportStatus {
    pub context: ContextToken,
    pub pid: u32,
    pub status: ProcessStatus,
    pub flags: u32,
    pub data: Vec<u8>,
}

impl ReportStatus {
    pub fn started(context: ContextToken, pid: u32) -> Self {
        Self {
            context,
            pid,
            status: ProcessStatus::Started,
            flags: 0,
            data: Vec::new(),
        }
    }

    /// An error reply; the message travels as UTF-8 in the data buffer.
    pub fn error(context: ContextToken, pid: u32, code: ErrorCode, message: &str) -> Self {
        Self {
            context,
            pid,
            status: ProcessStatus::Error,
            flags: code.code(),
            data: message.as_bytes().to_vec(),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self.status {
            ProcessStatus::Error => ErrorCode::from_code(self.flags),
            _ => None,
        }
    }
}

impl Message for ReportStatus {
    const ID: u32 = GuestMessageType::ReportStatus.id();
    const PARAM_COUNT: usize = 5;

    fn encode(&self) -> Vec<Param> {
        vec![
            Param::U32(self.context.0),
            Param::U32(self.pid),
            Param::U32(self.status.code()),
            Param::U32(self.flags),
            Param::Buffer(self.data.clone()),
        ]
    }

    fn decode(params: &[Param]) -> Result<Self, CodecError> {
        let mut r = ParamReader::new(params, Self::PARAM_COUNT)?;
        let context = r.context()?;
        let pid = r.u32()?;
        let raw_status = r.u32()?;
        let status = ProcessStatus::from_code(raw_status).ok_or_else(|| CodecError::Invalid {
            index: 2,
            reason: format!("unknown process status {raw_status}"),
        })?;
        let flags = r.u32()?;
        let (_, data) = r.buffer()?;
        Ok(Self {
            context,
            pid,
            status,
            flags,
            data: data.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutput {
    pub context: ContextToken,
    pub pid: u32,
    pub handle: OutputHandle,
    /// Zero on success, otherwise an [`ErrorCode`].
    pub flags: u32,
    pub data: Vec<u8>,
}

impl Message for ReportOutput {
    const ID: u32 = GuestMessageType::ReportOutput.id();
    const PARAM_COUNT: usize = 5;

    fn encode(&self) -> Vec<Param> {
        vec![
            Param::U32(self.context.0),
            Param::U32(self.pid),
            Param::U32(self.handle.id()),
            Param::U32(self.flags),
            Param::Buffer(self.data.clone()),
        ]
    }

    fn decode(params: &[Param]) -> Result<Self, CodecError> {
        let mut r = ParamReader::new(params, Self::PARAM_COUNT)?;
        let context = r.context()?;
        let pid = r.u32()?;
        let raw_handle = r.u32()?;
        let handle = OutputHandle::from_id(raw_handle).ok_or_else(|| CodecError::Invalid {
            index: 2,
            reason: format!("unknown output handle {raw_handle}"),
        })?;
        let flags = r.u32()?;
        let (data_index, data) = r.buffer()?;
        let data = bounded(data_index, data.len(), data, MAX_OUTPUT_BUFFER)?;
        Ok(Self {
            context,
            pid,
            handle,
            flags,
            data: data.into_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportInputStatus {
    pub context: ContextToken,
    pub pid: u32,
    pub status: InputStatus,
    pub flags: u32,
    pub written: u32,
}

impl Message for ReportInputStatus {
    const ID: u32 = GuestMessageType::ReportInputStatus.id();
    const PARAM_COUNT: usize = 5;

    fn encode(&self) -> Vec<Param> {
        vec![
            Param::U32(self.context.0),
            Param::U32(self.pid),
            Param::U32(self.status.code()),
            Param::U32(self.flags),
            Param::U32(self.written),
        ]
    }

    fn decode(params: &[Param]) -> Result<Self, CodecError> {
        let mut r = ParamReader::new(params, Self::PARAM_COUNT)?;
        let context = r.context()?;
        let pid = r.u32()?;
        let raw_status = r.u32()?;
        let status = InputStatus::from_code(raw_status).ok_or_else(|| CodecError::Invalid {
            index: 2,
            reason: format!("unknown input status {raw_status}"),
        })?;
        let flags = r.u32()?;
        let written = r.u32()?;
        Ok(Self {
            context,
            pid,
            status,
            flags,
            written,
        })
    }
}
