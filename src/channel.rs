use std::io::{self, BufRead, BufReader, Read, Write};
#[cfg(target_family = "unix")]
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Every frame starts with one header line:
/// `"PAGEDRIVER_FRAME {json_len} {payload_len}\n"`, followed by exactly
/// `json_len` bytes of JSON and `payload_len` raw payload bytes. The payload
/// segment carries binary blobs (pixel buffers) byte-exactly, with no upper
/// size bound.
const FRAME_PREFIX: &str = "PAGEDRIVER_FRAME ";

#[derive(Debug)]
pub enum ChannelError {
    /// The peer endpoint is gone (end-of-stream or broken pipe).
    Closed,
    Io(io::Error),
    /// The byte stream no longer matches the protocol. Fatal: the session
    /// must be torn down, never resynchronized.
    Desync(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "channel closed by peer"),
            ChannelError::Io(err) => write!(f, "channel io error: {err}"),
            ChannelError::Desync(message) => write!(f, "protocol desync: {message}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset => ChannelError::Closed,
            _ => ChannelError::Io(err),
        }
    }
}

/// One decoded frame: a message plus its (possibly empty) binary payload.
#[derive(Debug)]
pub struct Frame<T> {
    pub message: T,
    pub payload: Vec<u8>,
}

pub struct FrameReader {
    inner: BufReader<Box<dyn Read + Send>>,
}

impl FrameReader {
    pub fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            inner: BufReader::new(reader),
        }
    }

    /// Blocking-receive one frame. `ChannelError::Closed` reports a clean
    /// end-of-stream from the peer closing its end.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Frame<T>, ChannelError> {
        let mut header = String::new();
        let bytes = self.inner.read_line(&mut header)?;
        if bytes == 0 {
            return Err(ChannelError::Closed);
        }
        let (json_len, payload_len) = parse_frame_header(&header)
            .ok_or_else(|| ChannelError::Desync(format!("bad frame header {header:?}")))?;
        let mut json = vec![0u8; json_len];
        self.inner.read_exact(&mut json)?;
        let message = serde_json::from_slice(&json)
            .map_err(|err| ChannelError::Desync(format!("bad frame body: {err}")))?;
        let mut payload = vec![0u8; payload_len];
        self.inner.read_exact(&mut payload)?;
        Ok(Frame { message, payload })
    }
}

pub struct FrameWriter {
    inner: Box<dyn Write + Send>,
}

impl FrameWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self { inner: writer }
    }

    pub fn send<T: Serialize>(&mut self, message: &T, payload: &[u8]) -> Result<(), ChannelError> {
        let json = serde_json::to_vec(message).map_err(io::Error::other)?;
        let header = format!("{FRAME_PREFIX}{} {}\n", json.len(), payload.len());
        self.inner.write_all(header.as_bytes())?;
        self.inner.write_all(&json)?;
        self.inner.write_all(payload)?;
        self.inner.flush()?;
        Ok(())
    }
}

fn parse_frame_header(line: &str) -> Option<(usize, usize)> {
    let rest = line.trim_end_matches(['\n', '\r']).strip_prefix(FRAME_PREFIX)?;
    let (json_len, payload_len) = rest.split_once(' ')?;
    Some((json_len.parse().ok()?, payload_len.parse().ok()?))
}

/// An ordered, reliable, full-duplex frame pipe between exactly two
/// endpoints.
pub struct Channel {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Channel {
    pub fn new(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    /// A connected in-process pair over OS pipes, for tests and embedding.
    pub fn pair() -> io::Result<(Channel, Channel)> {
        let (a_read, b_write) = io::pipe()?;
        let (b_read, a_write) = io::pipe()?;
        Ok((
            Channel::new(Box::new(a_read), Box::new(a_write)),
            Channel::new(Box::new(b_read), Box::new(b_write)),
        ))
    }

    pub fn send<T: Serialize>(&mut self, message: &T, payload: &[u8]) -> Result<(), ChannelError> {
        self.writer.send(message, payload)
    }

    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Frame<T>, ChannelError> {
        self.reader.recv()
    }

    pub fn split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// The controller's half of a session: the command channel, the interceptor
/// channel, and a duplicate handle of the worker-side url writer so `quit`
/// can inject the listener shutdown sentinel.
pub struct ControllerEnds {
    pub command: Channel,
    pub interceptor: Channel,
    pub sentinel: FrameWriter,
}

/// The worker's half of a session.
pub struct WorkerEnds {
    pub command: Channel,
    pub interceptor: Channel,
}

/// Build both halves of a session in one process (tests, embedding). The
/// worker half is handed to `worker::run_with_channels` on its own thread.
pub fn bridge_pair() -> io::Result<(ControllerEnds, WorkerEnds)> {
    // Command channel: controller sends commands, worker sends replies.
    let (cmd_worker_read, cmd_write) = io::pipe()?;
    let (cmd_read, cmd_worker_write) = io::pipe()?;
    // Interceptor channel: worker sends urls, controller sends verdicts.
    let (url_read, url_write) = io::pipe()?;
    let sentinel = url_write.try_clone()?;
    let (verdict_read, verdict_write) = io::pipe()?;

    Ok((
        ControllerEnds {
            command: Channel::new(Box::new(cmd_read), Box::new(cmd_write)),
            interceptor: Channel::new(Box::new(url_read), Box::new(verdict_write)),
            sentinel: FrameWriter::new(Box::new(sentinel)),
        },
        WorkerEnds {
            command: Channel::new(Box::new(cmd_worker_read), Box::new(cmd_worker_write)),
            interceptor: Channel::new(Box::new(verdict_read), Box::new(url_write)),
        },
    ))
}

#[cfg(target_family = "unix")]
pub(crate) fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let new_flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, new_flags) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Raw descriptors destined for the worker process, inheritable across exec.
#[cfg(target_family = "unix")]
pub(crate) struct ChildFds {
    pub(crate) cmd_read: RawFd,
    pub(crate) cmd_write: RawFd,
    pub(crate) intercept_read: RawFd,
    pub(crate) intercept_write: RawFd,
}

#[cfg(target_family = "unix")]
impl ChildFds {
    /// Close the parent's copies once the worker owns them. The parent must
    /// do this after spawn so end-of-stream propagates when it later closes
    /// its own channel ends.
    pub(crate) fn close(self) {
        unsafe {
            libc::close(self.cmd_read);
            libc::close(self.cmd_write);
            libc::close(self.intercept_read);
            libc::close(self.intercept_write);
        }
    }
}

#[cfg(target_family = "unix")]
fn into_inherited_fd(owned: impl IntoRawFd) -> io::Result<RawFd> {
    let fd = owned.into_raw_fd();
    set_cloexec(fd, false)?;
    Ok(fd)
}

/// Create the four pipes of a session, keeping the controller ends here and
/// returning the worker ends as inheritable raw descriptors.
#[cfg(target_family = "unix")]
pub(crate) fn create_process_ends() -> io::Result<(ControllerEnds, ChildFds)> {
    let (cmd_worker_read, cmd_write) = io::pipe()?;
    let (cmd_read, cmd_worker_write) = io::pipe()?;
    let (url_read, url_write) = io::pipe()?;
    let sentinel = url_write.try_clone()?;
    let (verdict_read, verdict_write) = io::pipe()?;

    let child = ChildFds {
        cmd_read: into_inherited_fd(cmd_worker_read)?,
        cmd_write: into_inherited_fd(cmd_worker_write)?,
        intercept_read: into_inherited_fd(verdict_read)?,
        intercept_write: into_inherited_fd(url_write)?,
    };

    // Controller ends must not leak into the worker, or end-of-stream never
    // arrives on its listener.
    set_cloexec(cmd_read.as_raw_fd(), true)?;
    set_cloexec(cmd_write.as_raw_fd(), true)?;
    set_cloexec(url_read.as_raw_fd(), true)?;
    set_cloexec(verdict_write.as_raw_fd(), true)?;
    set_cloexec(sentinel.as_raw_fd(), true)?;

    Ok((
        ControllerEnds {
            command: Channel::new(Box::new(cmd_read), Box::new(cmd_write)),
            interceptor: Channel::new(Box::new(url_read), Box::new(verdict_write)),
            sentinel: FrameWriter::new(Box::new(sentinel)),
        },
        child,
    ))
}

#[cfg(target_family = "unix")]
fn fd_from_env(name: &str) -> io::Result<std::fs::File> {
    let value = std::env::var(name)
        .map_err(|_| io::Error::new(io::ErrorKind::NotFound, format!("{name} missing")))?;
    let fd: RawFd = value
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid {name}")))?;
    set_cloexec(fd, true)?;
    Ok(unsafe { std::fs::File::from_raw_fd(fd) })
}

/// Worker-side binding: reconstruct both channel ends from the descriptors
/// the controller passed through the environment.
pub fn channels_from_env() -> io::Result<WorkerEnds> {
    #[cfg(target_family = "unix")]
    {
        use crate::protocol::{
            CMD_READ_FD_ENV, CMD_WRITE_FD_ENV, INTERCEPT_READ_FD_ENV, INTERCEPT_WRITE_FD_ENV,
        };
        let cmd_read = fd_from_env(CMD_READ_FD_ENV)?;
        let cmd_write = fd_from_env(CMD_WRITE_FD_ENV)?;
        let intercept_read = fd_from_env(INTERCEPT_READ_FD_ENV)?;
        let intercept_write = fd_from_env(INTERCEPT_WRITE_FD_ENV)?;
        Ok(WorkerEnds {
            command: Channel::new(Box::new(cmd_read), Box::new(cmd_write)),
            interceptor: Channel::new(Box::new(intercept_read), Box::new(intercept_write)),
        })
    }
    #[cfg(not(target_family = "unix"))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "pipe transport is unsupported on this platform",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Reply, Value};

    #[test]
    fn frame_header_round_trip() {
        assert_eq!(
            parse_frame_header("PAGEDRIVER_FRAME 12 4096\n"),
            Some((12, 4096))
        );
        assert_eq!(parse_frame_header("PAGEDRIVER_FRAME 12\n"), None);
        assert_eq!(parse_frame_header("FRAME 1 2\n"), None);
        assert_eq!(parse_frame_header("PAGEDRIVER_FRAME a b\n"), None);
    }

    #[test]
    fn message_and_payload_round_trip() {
        let (mut a, mut b) = Channel::pair().unwrap();
        let payload: Vec<u8> = (0..=255).cycle().take(100_000).map(|b: u16| b as u8).collect();
        a.send(
            &Reply::Pixels {
                width: 250,
                height: 100,
                stride: 1000,
                format: 4,
            },
            &payload,
        )
        .unwrap();

        let frame = b.recv::<Reply>().unwrap();
        assert_eq!(frame.payload, payload);
        assert_eq!(
            frame.message,
            Reply::Pixels {
                width: 250,
                height: 100,
                stride: 1000,
                format: 4,
            }
        );
    }

    #[test]
    fn empty_payload_is_the_common_case() {
        let (mut a, mut b) = Channel::pair().unwrap();
        a.send(&Command::ContentSize, &[]).unwrap();
        let frame = b.recv::<Command>().unwrap();
        assert_eq!(frame.message, Command::ContentSize);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn peer_drop_reports_closed() {
        let (a, mut b) = Channel::pair().unwrap();
        drop(a);
        assert!(matches!(b.recv::<Reply>(), Err(ChannelError::Closed)));
    }

    #[test]
    fn garbage_header_is_a_desync() {
        let (reader, mut writer) = std::io::pipe().unwrap();
        let mut reader = FrameReader::new(Box::new(reader));
        writer.write_all(b"not a frame\n").unwrap();
        assert!(matches!(
            reader.recv::<Reply>(),
            Err(ChannelError::Desync(_))
        ));
    }

    #[test]
    fn wrong_shape_body_is_a_desync() {
        let (mut a, mut b) = Channel::pair().unwrap();
        a.send(&Value::Int(7), &[]).unwrap();
        assert!(matches!(
            b.recv::<Command>(),
            Err(ChannelError::Desync(_))
        ));
    }
}
