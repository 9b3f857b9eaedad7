//! Simulator ports
//!
//! The simulator sits on the adapter side of a byte link: a pseudo-terminal
//! a logger can open like a real serial adapter, a TCP listener, a real tty,
//! or any async stream in tests. Every port splits its input into command
//! lines and can echo raw input back the way an ELM327 does.

use crate::error::SimError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Longest command line kept before the buffer is discarded
pub const MAX_LINE_LENGTH: usize = 1024;

/// Baud rate the simulator opens real serial devices at
pub const SIM_TTY_BAUD: u32 = 9600;

/// The adapter end of a link
#[async_trait]
pub trait SimPort: Send {
    /// Human readable location clients connect to
    fn name(&self) -> String;

    /// Wait at most `wait` for one complete line.
    ///
    /// `Ok(None)` when no full line arrived in time. An empty string is an
    /// empty line, which the adapter treats as "repeat last command".
    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, SimError>;

    async fn write_data(&mut self, data: &str) -> Result<(), SimError>;

    fn set_echo(&mut self, echo: bool);
}

/// Accumulates raw input and hands out complete lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    lines: VecDeque<String>,
}

impl LineBuffer {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        while let Some(end) = self.buf.iter().position(|b| *b == b'\r' || *b == b'\n') {
            let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
            let skip = self.buf[end..]
                .iter()
                .take_while(|b| **b == b'\r' || **b == b'\n')
                .count();
            self.buf.drain(..end + skip);
            self.lines.push_back(line);
        }
        if self.buf.len() > MAX_LINE_LENGTH {
            warn!("Discarding {} bytes without a line terminator", self.buf.len());
            self.buf.clear();
        }
    }

    pub fn next_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }
}

/// A peer that hung up is a disconnect, not a port failure
fn write_error(err: std::io::Error) -> SimError {
    match err.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => SimError::Disconnected,
        _ => err.into(),
    }
}

/// Port over any async byte stream
pub struct StreamPort<S> {
    stream: S,
    name: String,
    lines: LineBuffer,
    echo: bool,
}

impl<S> StreamPort<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, name: impl Into<String>) -> Self {
        Self {
            stream,
            name: name.into(),
            lines: LineBuffer::default(),
            echo: true,
        }
    }
}

#[async_trait]
impl<S> SimPort for StreamPort<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, SimError> {
        if let Some(line) = self.lines.next_line() {
            return Ok(Some(line));
        }
        let mut buf = [0u8; 256];
        let n = match tokio::time::timeout(wait, self.stream.read(&mut buf)).await {
            Err(_) => return Ok(None),
            Ok(result) => result?,
        };
        if n == 0 {
            return Err(SimError::Disconnected);
        }
        if self.echo {
            self.stream.write_all(&buf[..n]).await.map_err(write_error)?;
        }
        self.lines.push(&buf[..n]);
        Ok(self.lines.next_line())
    }

    async fn write_data(&mut self, data: &str) -> Result<(), SimError> {
        self.stream
            .write_all(data.as_bytes())
            .await
            .map_err(write_error)?;
        self.stream.flush().await.map_err(write_error)?;
        Ok(())
    }

    fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }
}

/// Open a real serial device, raw 8N1
pub fn open_tty(path: &str) -> Result<StreamPort<SerialStream>, SimError> {
    let stream = tokio_serial::new(path, SIM_TTY_BAUD)
        .data_bits(tokio_serial::DataBits::Eight)
        .stop_bits(tokio_serial::StopBits::One)
        .parity(tokio_serial::Parity::None)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| SimError::Port(format!("{}: {}", path, e)))?;
    info!("Opened serial device {}", path);
    Ok(StreamPort::new(stream, path))
}

/// Listens on a TCP port and serves one client at a time
pub struct TcpPort {
    listener: TcpListener,
    client: Option<StreamPort<TcpStream>>,
    echo: bool,
}

impl TcpPort {
    pub async fn bind(port: u16) -> Result<Self, SimError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            client: None,
            echo: true,
        })
    }
}

#[async_trait]
impl SimPort for TcpPort {
    fn name(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "tcp".to_string(),
        }
    }

    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, SimError> {
        if self.client.is_none() {
            let Ok(accepted) = tokio::time::timeout(wait, self.listener.accept()).await else {
                return Ok(None);
            };
            let (stream, addr) = accepted?;
            info!("Client connected from {}", addr);
            let mut client = StreamPort::new(stream, addr.to_string());
            client.set_echo(self.echo);
            self.client = Some(client);
        }
        let Some(client) = self.client.as_mut() else {
            return Ok(None);
        };

        match client.read_line(wait).await {
            Err(SimError::Disconnected) => {
                info!("Client {} disconnected", client.name());
                self.client = None;
                Ok(None)
            }
            other => other,
        }
    }

    async fn write_data(&mut self, data: &str) -> Result<(), SimError> {
        let Some(client) = self.client.as_mut() else {
            debug!("No client, dropping {} bytes", data.len());
            return Ok(());
        };
        if let Err(e) = client.write_data(data).await {
            warn!("Write to {} failed: {}", client.name(), e);
            self.client = None;
        }
        Ok(())
    }

    fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
        if let Some(client) = self.client.as_mut() {
            client.set_echo(echo);
        }
    }
}

#[cfg(target_os = "linux")]
pub use pty::PtyPort;

#[cfg(target_os = "linux")]
mod pty {
    use super::{LineBuffer, SimPort};
    use crate::error::SimError;
    use async_trait::async_trait;
    use std::ffi::CStr;
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd, RawFd};
    use std::time::Duration;
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, info};

    /// Retry interval while no client has the slave side open
    const NO_CLIENT_POLL: Duration = Duration::from_millis(50);

    fn check(ret: libc::c_int) -> io::Result<()> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn configure(fd: RawFd) -> io::Result<()> {
        // SAFETY: fd is an open pty master owned by the caller; termios is
        // plain data filled in by tcgetattr before use.
        unsafe {
            let mut tio: libc::termios = std::mem::zeroed();
            check(libc::tcgetattr(fd, &mut tio))?;
            libc::cfmakeraw(&mut tio);
            check(libc::tcsetattr(fd, libc::TCSANOW, &tio))?;

            let flags = libc::fcntl(fd, libc::F_GETFL);
            check(flags)?;
            check(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        }
        Ok(())
    }

    fn is_no_client(err: &io::Error) -> bool {
        err.raw_os_error() == Some(libc::EIO)
    }

    /// Pseudo-terminal master; clients open [`PtyPort::slave_path`]
    pub struct PtyPort {
        master: AsyncFd<File>,
        slave_path: String,
        lines: LineBuffer,
        echo: bool,
    }

    impl PtyPort {
        pub fn open() -> Result<Self, SimError> {
            // SAFETY: posix_openpt returns a new fd or -1; on success the
            // File takes ownership and closes it on every later error path.
            let master = unsafe {
                let fd = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
                check(fd)?;
                File::from_raw_fd(fd)
            };
            let fd = master.as_raw_fd();

            let mut name = [0 as libc::c_char; 128];
            // SAFETY: fd is the master opened above and name outlives the
            // calls; ptsname_r nul-terminates within the given length.
            let slave_path = unsafe {
                check(libc::grantpt(fd))?;
                check(libc::unlockpt(fd))?;
                if libc::ptsname_r(fd, name.as_mut_ptr(), name.len()) != 0 {
                    return Err(io::Error::last_os_error().into());
                }
                CStr::from_ptr(name.as_ptr()).to_string_lossy().into_owned()
            };
            configure(fd)?;

            info!("Pseudo-terminal slave is {}", slave_path);
            Ok(Self {
                master: AsyncFd::new(master)?,
                slave_path,
                lines: LineBuffer::default(),
                echo: true,
            })
        }

        pub fn slave_path(&self) -> &str {
            &self.slave_path
        }

        async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.master.readable().await?;
                match guard.try_io(|inner| inner.get_ref().read(buf)) {
                    Ok(Err(e)) if is_no_client(&e) => {
                        guard.clear_ready();
                        tokio::time::sleep(NO_CLIENT_POLL).await;
                    }
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        async fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
            while !data.is_empty() {
                let mut guard = self.master.writable().await?;
                match guard.try_io(|inner| inner.get_ref().write(data)) {
                    Ok(Ok(n)) => data = &data[n..],
                    Ok(Err(e)) if is_no_client(&e) => {
                        debug!("No client on {}, dropping output", self.slave_path);
                        return Ok(());
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_would_block) => continue,
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SimPort for PtyPort {
        fn name(&self) -> String {
            self.slave_path.clone()
        }

        async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, SimError> {
            if let Some(line) = self.lines.next_line() {
                return Ok(Some(line));
            }
            let mut buf = [0u8; 256];
            let n = match tokio::time::timeout(wait, self.read_some(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(result) => result?,
            };
            if self.echo {
                self.write_all(&buf[..n]).await?;
            }
            self.lines.push(&buf[..n]);
            Ok(self.lines.next_line())
        }

        async fn write_data(&mut self, data: &str) -> Result<(), SimError> {
            Ok(self.write_all(data.as_bytes()).await?)
        }

        fn set_echo(&mut self, echo: bool) {
            self.echo = echo;
        }
    }
}
