//! Identification string exchange (RFC 4253 Section 4.2).
//!
//! Each side opens the connection with one line of the form
//! `SSH-protoversion-softwareversion [comments]\r\n`. A server may print
//! arbitrary banner lines first; those are skipped, up to
//! [`MAX_PRE_BANNER_LINES`] of them.
//!
//! ```rust
//! use tern_proto::ssh::version::Version;
//!
//! let ours = Version::new("Tern_0.1.0", Some("client"));
//! assert_eq!(ours.to_string(), "SSH-2.0-Tern_0.1.0 client");
//!
//! let theirs = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(theirs.software(), "OpenSSH_8.9");
//! ```

use std::fmt;

use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Longest identification line accepted, CR LF excluded.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Banner lines tolerated before the server identification.
pub const MAX_PRE_BANNER_LINES: usize = 64;

/// Protocol versions this stack speaks. `1.99` announces SSH-2 compatibility.
const COMPATIBLE_PROTOCOLS: [&str; 2] = ["2.0", "1.99"];

fn protocol_error(msg: impl Into<String>) -> TernError {
    TernError::Protocol(msg.into())
}

/// A parsed or locally built identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    protocol: String,
    software: String,
    comments: Option<String>,
}

impl Version {
    /// Builds a protocol 2.0 identification.
    ///
    /// ```rust
    /// use tern_proto::ssh::version::Version;
    ///
    /// assert_eq!(Version::new("Tern_0.1.0", None).to_string(), "SSH-2.0-Tern_0.1.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            protocol: "2.0".to_owned(),
            software: software.to_owned(),
            comments: comments.map(str::to_owned),
        }
    }

    /// Identification sent by this crate: `Tern_<crate version>`.
    pub fn default_tern() -> Self {
        Self::new(concat!("Tern_", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses one identification line. A trailing CR LF or LF is ignored.
    ///
    /// # Errors
    ///
    /// [`TernError::Protocol`] when the line is longer than
    /// [`MAX_VERSION_LENGTH`], holds a NUL, lacks the `SSH-` prefix or a
    /// software field, or names a protocol other than 2.0 / 1.99.
    pub fn parse(line: &str) -> TernResult<Self> {
        let line = line
            .strip_suffix('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .unwrap_or(line);

        if line.len() > MAX_VERSION_LENGTH {
            return Err(protocol_error(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }
        if line.contains('\0') {
            return Err(protocol_error("Version string contains null byte"));
        }

        let body = line
            .strip_prefix("SSH-")
            .ok_or_else(|| protocol_error(format!("Not an identification line: '{}'", line)))?;
        let (protocol, rest) = body
            .split_once('-')
            .ok_or_else(|| protocol_error(format!("Missing software version in '{}'", line)))?;

        if !COMPATIBLE_PROTOCOLS.contains(&protocol) {
            return Err(protocol_error(format!(
                "Unsupported protocol version: '{}'",
                protocol
            )));
        }

        let (software, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software, Some(comments.trim().to_owned())),
            None => (rest, None),
        };
        if software.is_empty() {
            return Err(protocol_error(format!("Empty software version in '{}'", line)));
        }

        Ok(Self {
            protocol: protocol.to_owned(),
            software: software.to_owned(),
            comments,
        })
    }

    /// `2.0` or `1.99`.
    pub fn proto_version(&self) -> &str {
        &self.protocol
    }

    /// Software field, e.g. `OpenSSH_9.6`.
    pub fn software(&self) -> &str {
        &self.software
    }

    /// Text after the first space, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The line as sent on the wire, CR LF included.
    pub fn to_wire_format(&self) -> Vec<u8> {
        let mut line = self.to_string().into_bytes();
        line.extend_from_slice(b"\r\n");
        line
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::default_tern()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SSH-{}-{}", self.protocol, self.software)?;
        match &self.comments {
            Some(comments) => write!(f, " {}", comments),
            None => Ok(()),
        }
    }
}

/// Writes `ours`, then reads the peer identification.
///
/// Returns the peer version and the raw line without CR LF; the raw line
/// is an input of the exchange hash.
pub async fn exchange<S>(stream: &mut S, ours: &Version) -> TernResult<(Version, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&ours.to_wire_format()).await?;
    stream.flush().await?;
    read_identification(stream).await
}

/// Skips banner lines until one starts with `SSH-`.
///
/// The stream is consumed byte by byte so the first binary packet stays
/// unread.
pub async fn read_identification<R>(reader: &mut R) -> TernResult<(Version, String)>
where
    R: AsyncRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let line = read_line(reader).await?;
        if line.starts_with("SSH-") {
            return Version::parse(&line).map(|version| (version, line));
        }
        if skipped == MAX_PRE_BANNER_LINES {
            return Err(protocol_error(format!(
                "No identification string within {} lines",
                MAX_PRE_BANNER_LINES
            )));
        }
        skipped += 1;
        debug!(line = %line, "Skipping pre-banner line");
    }
}

async fn read_line<R>(reader: &mut R) -> TernResult<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(64);
    loop {
        match reader.read_u8().await {
            Ok(b'\n') => break,
            Ok(_) if buf.len() > MAX_VERSION_LENGTH => {
                return Err(protocol_error(format!(
                    "Identification line exceeds {} bytes",
                    MAX_VERSION_LENGTH
                )));
            }
            Ok(byte) => buf.push(byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TernError::TransportClosed(
                    "Connection closed during version exchange".to_owned(),
                ));
            }
            Err(e) => return Err(e.into()),
        }
    }
    if buf.ends_with(b"\r") {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|_| protocol_error("Identification line is not UTF-8"))
}
