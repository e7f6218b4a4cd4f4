use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

use guestctl_protocol::{encode_message, Frame, FrameError, Param, MAX_MESSAGE_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Channel, ChannelError, ClientId, HostMessageHeader};
use crate::config::{ChannelConfig, Transport};
use crate::sync::lock;

/// Receive capacity before the first oversized message grows it.
const INITIAL_RECV_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Vsock { cid: u32, port: u32 },
    Tcp(SocketAddr),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Vsock { cid, port } => write!(f, "vsock:{cid}:{port}"),
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Channel to the host control service over a stream socket.
///
/// I/O runs on the tokio runtime behind `runtime`; the [`Channel`] methods
/// block the calling thread on it. They must therefore be called from plain
/// OS threads or `spawn_blocking`, never from inside an async task.
/// `cancel_pending_waits` is the exception and is safe to call anywhere.
pub struct SocketChannel {
    endpoint: Endpoint,
    runtime: Handle,
    recv_capacity: usize,
    next_client: AtomicU32,
    modules_tried: AtomicBool,
    session: Mutex<Option<Arc<Session>>>,
}

struct Session {
    client: ClientId,
    reader: tokio::sync::Mutex<FrameReader>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    cancel: watch::Sender<bool>,
    pending: Mutex<Option<Frame>>,
}

impl SocketChannel {
    pub fn new(config: &ChannelConfig, runtime: Handle) -> Result<Self, ChannelError> {
        let endpoint = match config.transport {
            Transport::Vsock => Endpoint::Vsock {
                cid: config.host_cid,
                port: config.port,
            },
            Transport::Tcp => {
                let addr = config.tcp_addr.parse::<SocketAddr>().map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid tcp address {}: {e}", config.tcp_addr),
                    )
                })?;
                Endpoint::Tcp(addr)
            }
        };
        Ok(Self::with_endpoint(endpoint, runtime))
    }

    pub fn with_endpoint(endpoint: Endpoint, runtime: Handle) -> Self {
        Self {
            endpoint,
            runtime,
            recv_capacity: INITIAL_RECV_CAPACITY,
            next_client: AtomicU32::new(1),
            modules_tried: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    /// Start with a different receive capacity. Larger messages still get
    /// through after one `TooMuchData` round.
    pub fn with_recv_capacity(mut self, capacity: usize) -> Self {
        self.recv_capacity = capacity;
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn session_for(&self, client: ClientId) -> Result<Arc<Session>, ChannelError> {
        match lock(&self.session).as_ref() {
            Some(session) if session.client == client => Ok(session.clone()),
            _ => Err(ChannelError::NotConnected(client)),
        }
    }

    fn open_stream(&self) -> Result<(BoxedReader, BoxedWriter), ChannelError> {
        match self.endpoint {
            Endpoint::Vsock { cid, port } => {
                let fd = match create_vsock_connection(cid, port) {
                    Ok(fd) => fd,
                    Err(e)
                        if e.raw_os_error() == Some(libc::EAFNOSUPPORT)
                            && !self.modules_tried.swap(true, Ordering::SeqCst) =>
                    {
                        info!(error = %e, "vsock not available, loading kernel modules...");
                        load_vsock_modules();
                        retry_vsock_connection(cid, port).map_err(classify_connect_error)?
                    }
                    Err(e) => return Err(classify_connect_error(e)),
                };
                // AsyncFd registration needs the runtime context.
                let _guard = self.runtime.enter();
                let stream = VsockStream::new(fd)?;
                let (reader, writer) = tokio::io::split(stream);
                Ok((Box::new(reader), Box::new(writer)))
            }
            Endpoint::Tcp(addr) => {
                let stream = self
                    .runtime
                    .block_on(tokio::net::TcpStream::connect(addr))
                    .map_err(classify_connect_error)?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
        }
    }
}

impl Channel for SocketChannel {
    fn connect(&self) -> Result<ClientId, ChannelError> {
        let (reader, writer) = self.open_stream()?;
        let client = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        let (cancel, _) = watch::channel(false);
        let session = Arc::new(Session {
            client,
            reader: tokio::sync::Mutex::new(FrameReader::new(reader, self.recv_capacity)),
            writer: tokio::sync::Mutex::new(writer),
            cancel,
            pending: Mutex::new(None),
        });
        if let Some(old) = lock(&self.session).replace(session) {
            debug!(client = %old.client, "replacing stale session");
            old.cancel.send_replace(true);
        }
        info!(client = %client, endpoint = %self.endpoint, "connected to host control service");
        Ok(client)
    }

    fn disconnect(&self, client: ClientId) {
        let session = {
            let mut current = lock(&self.session);
            match current.as_ref() {
                Some(s) if s.client == client => current.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            debug!(client = %client, "disconnect for unknown client ignored");
            return;
        };
        session.cancel.send_replace(true);
        let result = self
            .runtime
            .block_on(async { session.writer.lock().await.shutdown().await });
        if let Err(e) = result {
            debug!(client = %client, error = %e, "shutdown of host connection failed");
        }
        info!(client = %client, "disconnected from host control service");
    }

    fn wait_for_host_message(&self, client: ClientId) -> Result<HostMessageHeader, ChannelError> {
        let session = self.session_for(client)?;
        let mut cancelled = session.cancel.subscribe();
        if *cancelled.borrow() {
            return Err(ChannelError::Cancelled);
        }

        let frame = self.runtime.block_on(async {
            tokio::select! {
                _ = cancelled.wait_for(|c| *c) => Err(ChannelError::Cancelled),
                res = async { session.reader.lock().await.next_frame().await } => res,
            }
        })?;

        let header = HostMessageHeader {
            msg_type: frame.msg,
            param_count: frame.param_count(),
        };
        debug!(
            client = %client,
            msg_type = header.msg_type,
            param_count = header.param_count,
            "host message received"
        );
        *lock(&session.pending) = Some(frame);
        Ok(header)
    }

    fn fetch_params(&self, client: ClientId) -> Result<Vec<Param>, ChannelError> {
        let session = self.session_for(client)?;
        let frame = lock(&session.pending).take();
        frame.map(|f| f.params).ok_or(ChannelError::NoMessage)
    }

    fn cancel_pending_waits(&self, client: ClientId) -> Result<(), ChannelError> {
        let session = self.session_for(client)?;
        session.cancel.send_replace(true);
        Ok(())
    }

    fn call(&self, msg_type: u32, params: Vec<Param>) -> Result<(), ChannelError> {
        let session = lock(&self.session)
            .clone()
            .ok_or(ChannelError::Disconnected)?;
        let encoded = encode_message(&Frame::new(msg_type, params))?;
        let size = (encoded.len() - 4) as u32;
        if size > MAX_MESSAGE_SIZE {
            return Err(FrameError::TooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            }
            .into());
        }
        self.runtime
            .block_on(async {
                let mut writer = session.writer.lock().await;
                writer.write_all(&encoded).await?;
                writer.flush().await
            })
            .map_err(disconnect_or_io)
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Reads length-prefixed frames, never buffering more than `capacity` bytes
/// of payload without first telling the caller to retry.
struct FrameReader {
    inner: BoxedReader,
    capacity: usize,
    /// Length prefix already consumed from the stream.
    pending_len: Option<u32>,
    broken: bool,
}

impl FrameReader {
    fn new(inner: BoxedReader, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            pending_len: None,
            broken: false,
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, ChannelError> {
        if self.broken {
            return Err(ChannelError::Disconnected);
        }

        let len = match self.pending_len {
            Some(len) => len,
            None => {
                let len = self.inner.read_u32().await.map_err(disconnect_or_io)?;
                if len > MAX_MESSAGE_SIZE {
                    // The stream cannot be resynchronised after this.
                    self.broken = true;
                    return Err(FrameError::TooLarge {
                        size: len,
                        max: MAX_MESSAGE_SIZE,
                    }
                    .into());
                }
                self.pending_len = Some(len);
                len
            }
        };

        let needed = len as usize;
        if needed > self.capacity {
            self.capacity = needed.next_power_of_two().min(MAX_MESSAGE_SIZE as usize);
            return Err(ChannelError::TooMuchData { needed });
        }

        let mut buf = vec![0u8; needed];
        if let Err(e) = self.inner.read_exact(&mut buf).await {
            self.broken = true;
            return Err(disconnect_or_io(e));
        }
        self.pending_len = None;
        Ok(serde_json::from_slice(&buf)?)
    }
}

fn disconnect_or_io(e: io::Error) -> ChannelError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => ChannelError::Disconnected,
        _ => ChannelError::Io(e),
    }
}

/// Errors meaning "nobody is listening" are soft; anything else is real.
fn classify_connect_error(e: io::Error) -> ChannelError {
    match e.raw_os_error() {
        Some(
            libc::ECONNREFUSED
            | libc::ECONNRESET
            | libc::EHOSTUNREACH
            | libc::ENETUNREACH
            | libc::ENODEV
            | libc::EAFNOSUPPORT
            | libc::ETIMEDOUT,
        ) => ChannelError::ServiceUnavailable(e.to_string()),
        _ => ChannelError::Io(e),
    }
}

// ---------------------------------------------------------------------------
// vsock plumbing
// ---------------------------------------------------------------------------

const AF_VSOCK: i32 = 40;

// sockaddr_vm layout per include/uapi/linux/vm_sockets.h
#[repr(C)]
struct SockaddrVm {
    svm_family: libc::sa_family_t,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_flags: u8,
    svm_zero: [u8; 3],
}

/// Open a blocking AF_VSOCK connection to `cid:port`, then switch the fd to
/// non-blocking for `AsyncFd`. Errors keep their OS code for classification.
fn create_vsock_connection(cid: u32, port: u32) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Owned from here on so every early return closes it.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let addr = SockaddrVm {
        svm_family: AF_VSOCK as libc::sa_family_t,
        svm_reserved1: 0,
        svm_port: port,
        svm_cid: cid,
        svm_flags: 0,
        svm_zero: [0u8; 3],
    };
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const SockaddrVm as *const libc::sockaddr,
            std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        debug!(cid, port, error = %err, "vsock connect failed");
        return Err(err);
    }

    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Modules need a moment to register the address family.
fn retry_vsock_connection(cid: u32, port: u32) -> io::Result<OwnedFd> {
    let mut last_err = None;
    for attempt in 0..20 {
        std::thread::sleep(Duration::from_millis(50));
        match create_vsock_connection(cid, port) {
            Ok(fd) => {
                info!(cid, port, attempt, "connected over vsock (after module load)");
                return Ok(fd);
            }
            Err(e) if e.raw_os_error() == Some(libc::EAFNOSUPPORT) => last_err = Some(e),
            // The family exists now; any other failure is final.
            Err(e) => return Err(e),
        }
    }
    let err = last_err.unwrap_or_else(|| io::Error::from_raw_os_error(libc::EAFNOSUPPORT));
    warn!(error = %err, "vsock still unavailable after module load");
    Err(err)
}

const VSOCK_MODULES: &[&str] = &[
    "vsock.ko",
    "vmw_vsock_virtio_transport_common.ko",
    "vmw_vsock_virtio_transport.ko",
];

/// Load the vsock kernel modules via insmod. Minimal guest images often
/// boot without them.
fn load_vsock_modules() {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let kdir = format!("/lib/modules/{release}/kernel/net/vmw_vsock");
    info!(kernel = %release, "loading vsock kernel modules");

    for module in VSOCK_MODULES {
        let path = format!("{kdir}/{module}");
        match std::process::Command::new("insmod").arg(&path).output() {
            Ok(output) if output.status.success() => {
                info!(module = %module, "loaded kernel module");
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.contains("File exists") {
                    debug!(module = %module, "kernel module already loaded");
                } else {
                    warn!(module = %module, path = %path, error = %stderr.trim(), "insmod failed");
                }
            }
            Err(e) => warn!(module = %module, error = %e, "failed to run insmod"),
        }
    }
}

/// An async vsock stream backed by `AsyncFd<OwnedFd>` with raw read/write.
///
/// `tokio::net::UnixStream` cannot wrap a vsock fd because mio expects
/// `AF_UNIX` semantics, so `AsyncRead`/`AsyncWrite` go straight to libc.
struct VsockStream {
    inner: tokio::io::unix::AsyncFd<OwnedFd>,
}

impl VsockStream {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        let inner = tokio::io::unix::AsyncFd::new(fd)?;
        Ok(Self { inner })
    }
}

impl AsyncRead for VsockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = match self.inner.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        unfilled.as_mut_ptr() as *mut libc::c_void,
                        unfilled.len(),
                    )
                };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(io::Error::last_os_error())
                }
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for VsockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = match self.inner.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.get_ref().as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                    )
                };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(io::Error::last_os_error())
                }
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<io::Result<()>> {
        let ret = unsafe { libc::shutdown(self.inner.get_ref().as_raw_fd(), libc::SHUT_WR) };
        if ret == 0 {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(io::Error::last_os_error()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestctl_protocol::{
        ContextToken, GuestMessageType, HostMessageType, Message, ProcessStatus, ReportStatus,
    };
    use tokio::net::{TcpListener, TcpStream};
    use tokio::runtime::Runtime;

    async fn host_write(stream: &mut TcpStream, frame: &Frame) {
        let encoded = encode_message(frame).unwrap();
        stream.write_all(&encoded).await.unwrap();
    }

    async fn host_read(stream: &mut TcpStream) -> Frame {
        let len = stream.read_u32().await.unwrap();
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await.unwrap();
        serde_json::from_slice(&buf).unwrap()
    }

    fn bind(rt: &Runtime) -> (TcpListener, SocketAddr) {
        rt.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            (listener, addr)
        })
    }

    #[test]
    fn test_connect_refused_is_service_unavailable() {
        let rt = Runtime::new().unwrap();
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let channel = SocketChannel::with_endpoint(Endpoint::Tcp(addr), rt.handle().clone());
        let err = channel.connect().unwrap_err();
        assert!(err.is_service_unavailable(), "unexpected error: {err}");
    }

    #[test]
    fn test_new_rejects_bad_tcp_addr() {
        let rt = Runtime::new().unwrap();
        let config = ChannelConfig {
            transport: Transport::Tcp,
            tcp_addr: "nope".into(),
            ..ChannelConfig::default()
        };
        assert!(matches!(
            SocketChannel::new(&config, rt.handle().clone()),
            Err(ChannelError::Io(_))
        ));
    }

    #[test]
    fn test_message_roundtrip_over_tcp() {
        let rt = Runtime::new().unwrap();
        let (listener, addr) = bind(&rt);
        let host = rt.spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            host_write(
                &mut stream,
                &Frame::new(HostMessageType::GetOutput.id(), vec![Param::U32(7), Param::U32(1)]),
            )
            .await;
            host_read(&mut stream).await
        });

        let channel = SocketChannel::with_endpoint(Endpoint::Tcp(addr), rt.handle().clone());
        let client = channel.connect().unwrap();
        let header = channel.wait_for_host_message(client).unwrap();
        assert_eq!(header.msg_type, 102);
        assert_eq!(header.param_count, 2);
        assert_eq!(
            channel.fetch_params(client).unwrap(),
            vec![Param::U32(7), Param::U32(1)]
        );
        // Params are handed out once
        assert!(matches!(channel.fetch_params(client), Err(ChannelError::NoMessage)));

        let report = ReportStatus::started(ContextToken(7), 1234);
        channel.call(ReportStatus::ID, report.encode()).unwrap();
        let reply = rt.block_on(host).unwrap();
        assert_eq!(reply.msg, GuestMessageType::ReportStatus.id());
        let decoded = ReportStatus::from_frame(&reply).unwrap();
        assert_eq!(decoded.status, ProcessStatus::Started);
        assert_eq!(decoded.pid, 1234);

        channel.disconnect(client);
        assert!(matches!(
            channel.wait_for_host_message(client),
            Err(ChannelError::NotConnected(_))
        ));
    }

    #[test]
    fn test_oversized_message_asks_for_retry() {
        let rt = Runtime::new().unwrap();
        let (listener, addr) = bind(&rt);
        let big = vec![0xabu8; 8 * 1024];
        let sent = Frame::new(HostMessageType::SetInput.id(), vec![Param::Buffer(big.clone())]);
        let to_send = sent.clone();
        let host = rt.spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            host_write(&mut stream, &to_send).await;
            // Keep the connection open until the guest is done.
            let _ = stream.read_u8().await;
        });

        let channel = SocketChannel::with_endpoint(Endpoint::Tcp(addr), rt.handle().clone())
            .with_recv_capacity(1024);
        let client = channel.connect().unwrap();
        match channel.wait_for_host_message(client) {
            Err(ChannelError::TooMuchData { needed }) => assert!(needed > 1024),
            other => panic!("expected TooMuchData, got {other:?}"),
        }
        let header = channel.wait_for_host_message(client).unwrap();
        assert_eq!(header.msg_type, sent.msg);
        assert_eq!(channel.fetch_params(client).unwrap(), sent.params);

        channel.disconnect(client);
        rt.block_on(host).unwrap();
    }

    #[test]
    fn test_cancel_wakes_blocked_wait() {
        let rt = Runtime::new().unwrap();
        let (listener, addr) = bind(&rt);
        let host = rt.spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = stream.read_u8().await;
        });

        let channel = Arc::new(SocketChannel::with_endpoint(
            Endpoint::Tcp(addr),
            rt.handle().clone(),
        ));
        let client = channel.connect().unwrap();
        let waiter = {
            let channel = channel.clone();
            std::thread::spawn(move || channel.wait_for_host_message(client))
        };
        std::thread::sleep(Duration::from_millis(50));
        channel.cancel_pending_waits(client).unwrap();
        assert!(matches!(waiter.join().unwrap(), Err(ChannelError::Cancelled)));
        // Later waits return immediately as well.
        assert!(matches!(
            channel.wait_for_host_message(client),
            Err(ChannelError::Cancelled)
        ));

        channel.disconnect(client);
        rt.block_on(host).unwrap();
    }

    #[test]
    fn test_host_close_is_disconnected() {
        let rt = Runtime::new().unwrap();
        let (listener, addr) = bind(&rt);
        let host = rt.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let channel = SocketChannel::with_endpoint(Endpoint::Tcp(addr), rt.handle().clone());
        let client = channel.connect().unwrap();
        rt.block_on(host).unwrap();
        assert!(matches!(
            channel.wait_for_host_message(client),
            Err(ChannelError::Disconnected)
        ));
    }

    #[test]
    fn test_call_without_session_fails() {
        let rt = Runtime::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let channel = SocketChannel::with_endpoint(Endpoint::Tcp(addr), rt.handle().clone());
        assert!(matches!(
            channel.call(ReportStatus::ID, vec![]),
            Err(ChannelError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_frame_reader_grows_capacity_and_keeps_prefix() {
        let (mut host, guest) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(Box::new(guest), 16);
        let frame = ReportStatus::started(ContextToken(3), 42).to_frame();
        host.write_all(&encode_message(&frame).unwrap()).await.unwrap();

        let needed = match reader.next_frame().await {
            Err(ChannelError::TooMuchData { needed }) => needed,
            other => panic!("expected retry signal, got {other:?}"),
        };
        assert!(needed > 16);
        assert!(reader.capacity >= needed);
        assert_eq!(reader.next_frame().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_frame_reader_rejects_oversized_prefix() {
        let (mut host, guest) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(Box::new(guest), 1024);
        host.write_u32(MAX_MESSAGE_SIZE + 1).await.unwrap();

        assert!(matches!(
            reader.next_frame().await,
            Err(ChannelError::Frame(FrameError::TooLarge { .. }))
        ));
        assert!(matches!(
            reader.next_frame().await,
            Err(ChannelError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_frame_reader_eof_is_disconnect() {
        let (host, guest) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(Box::new(guest), 1024);
        drop(host);
        assert!(matches!(
            reader.next_frame().await,
            Err(ChannelError::Disconnected)
        ));
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::Vsock { cid: 2, port: 5000 }.to_string(), "vsock:2:5000");
        assert_eq!(
            Endpoint::Tcp("127.0.0.1:5000".parse().unwrap()).to_string(),
            "tcp:127.0.0.1:5000"
        );
    }
}
