//! ZRE wire codec: fixed binary layout for peer-to-peer messages.
//!
//! Every message starts with the same six bytes:
//!
//! ```text
//! 0xAA 0xA1 | command (u8) | version (u8) | sequence (u16 BE)
//! ```
//!
//! followed by a command-specific body. WHISPER and SHOUT payloads are not
//! part of the body; they travel as a second, opaque transport segment.

use indexmap::IndexMap;

/// HELLO headers. Keys go on the wire in insertion order.
pub type Headers = IndexMap<String, String>;

/// Magic bytes at the start of every message.
pub const ZRE_SIGNATURE: [u8; 2] = [0xAA, 0xA1];

/// Protocol version carried in every message.
pub const ZRE_VERSION: u8 = 2;

/// Longest string a one-byte length prefix can carry.
pub const MAX_SHORT_STRING: usize = u8::MAX as usize;

/// Size of the fixed header (signature, command, version, sequence).
pub const HEADER_LEN: usize = 6;

/// The transport segments of one message: header+body first, then the
/// content segment for WHISPER and SHOUT.
pub type Frames = Vec<Vec<u8>>;

/// Numeric command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Hello = 1,
    Whisper = 2,
    Shout = 3,
    Join = 4,
    Leave = 5,
    Ping = 6,
    PingOk = 7,
}

impl Command {
    fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Hello,
            2 => Self::Whisper,
            3 => Self::Shout,
            4 => Self::Join,
            5 => Self::Leave,
            6 => Self::Ping,
            7 => Self::PingOk,
            _ => return None,
        })
    }

    /// Upper-case protocol name, used in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Whisper => "WHISPER",
            Self::Shout => "SHOUT",
            Self::Join => "JOIN",
            Self::Leave => "LEAVE",
            Self::Ping => "PING",
            Self::PingOk => "PING_OK",
        }
    }
}

/// HELLO body: the sender's full self-description.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hello {
    pub endpoint: String,
    pub groups: Vec<String>,
    pub status: u8,
    pub name: String,
    pub headers: Headers,
}

/// Command-specific part of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Hello(Hello),
    Whisper { content: Vec<u8> },
    Shout { group: String, content: Vec<u8> },
    Join { group: String, status: u8 },
    Leave { group: String, status: u8 },
    Ping,
    PingOk,
}

impl MessageKind {
    pub fn command(&self) -> Command {
        match self {
            Self::Hello(_) => Command::Hello,
            Self::Whisper { .. } => Command::Whisper,
            Self::Shout { .. } => Command::Shout,
            Self::Join { .. } => Command::Join,
            Self::Leave { .. } => Command::Leave,
            Self::Ping => Command::Ping,
            Self::PingOk => Command::PingOk,
        }
    }
}

/// A ZRE message. The sequence is assigned by the sending peer right before
/// transmission; freshly built messages carry sequence 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sequence: u16,
    pub kind: MessageKind,
}

/// Reasons a message cannot be encoded or decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("message shorter than header ({0} bytes)")]
    TooShort(usize),
    #[error("bad signature {0:02x?}")]
    BadSignature([u8; 2]),
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unknown command {0}")]
    UnknownCommand(u8),
    #[error("HELLO must carry sequence 1, got {0}")]
    HelloSequence(u16),
    #[error("body truncated")]
    Truncated,
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("string of {len} bytes exceeds its {max} byte limit")]
    StringTooLong { len: usize, max: usize },
    #[error("message has no segments")]
    Empty,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self { sequence: 1, kind }
    }

    pub fn command(&self) -> Command {
        self.kind.command()
    }

    /// Encode into transport segments.
    pub fn encode(&self) -> Result<Frames, CodecError> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&ZRE_SIGNATURE);
        out.push(self.command() as u8);
        out.push(ZRE_VERSION);
        out.extend_from_slice(&self.sequence.to_be_bytes());

        let content = match &self.kind {
            MessageKind::Hello(hello) => {
                put_string(&mut out, &hello.endpoint)?;
                put_strings(&mut out, &hello.groups)?;
                out.push(hello.status);
                put_string(&mut out, &hello.name)?;
                put_dictionary(&mut out, &hello.headers)?;
                None
            }
            MessageKind::Whisper { content } => Some(content),
            MessageKind::Shout { group, content } => {
                put_string(&mut out, group)?;
                Some(content)
            }
            MessageKind::Join { group, status } | MessageKind::Leave { group, status } => {
                put_string(&mut out, group)?;
                out.push(*status);
                None
            }
            MessageKind::Ping | MessageKind::PingOk => None,
        };

        let mut frames = vec![out];
        if let Some(content) = content {
            frames.push(content.clone());
        }
        Ok(frames)
    }

    /// Decode a message from its header segment and optional content segment.
    ///
    /// The content segment is taken verbatim; a WHISPER or SHOUT without one
    /// decodes with an empty payload.
    pub fn decode(header: &[u8], content: Option<&[u8]>) -> Result<Self, CodecError> {
        if header.len() < HEADER_LEN {
            return Err(CodecError::TooShort(header.len()));
        }
        if header[..2] != ZRE_SIGNATURE {
            return Err(CodecError::BadSignature([header[0], header[1]]));
        }
        if header[3] != ZRE_VERSION {
            return Err(CodecError::BadVersion(header[3]));
        }
        let command = Command::from_u8(header[2]).ok_or(CodecError::UnknownCommand(header[2]))?;
        let sequence = u16::from_be_bytes([header[4], header[5]]);

        let mut r = Reader::new(&header[HEADER_LEN..]);
        let payload = || content.map(<[u8]>::to_vec).unwrap_or_default();

        let kind = match command {
            Command::Hello => {
                if sequence != 1 {
                    return Err(CodecError::HelloSequence(sequence));
                }
                MessageKind::Hello(Hello {
                    endpoint: r.string()?,
                    groups: r.strings()?,
                    status: r.u8()?,
                    name: r.string()?,
                    headers: r.dictionary()?,
                })
            }
            Command::Whisper => MessageKind::Whisper { content: payload() },
            Command::Shout => MessageKind::Shout {
                group: r.string()?,
                content: payload(),
            },
            Command::Join => MessageKind::Join {
                group: r.string()?,
                status: r.u8()?,
            },
            Command::Leave => MessageKind::Leave {
                group: r.string()?,
                status: r.u8()?,
            },
            Command::Ping => MessageKind::Ping,
            Command::PingOk => MessageKind::PingOk,
        };

        Ok(Self { sequence, kind })
    }

    /// Decode from a list of transport segments.
    pub fn from_frames(frames: &[Vec<u8>]) -> Result<Self, CodecError> {
        let (header, rest) = frames.split_first().ok_or(CodecError::Empty)?;
        Self::decode(header, rest.first().map(Vec::as_slice))
    }
}

// ---------------------------------------------------------------------------
// Field encoding
// ---------------------------------------------------------------------------

/// Fail unless `s` fits a short-string length prefix (names, groups,
/// header keys, endpoints).
pub fn check_short_string(s: &str) -> Result<(), CodecError> {
    if s.len() > MAX_SHORT_STRING {
        return Err(CodecError::StringTooLong {
            len: s.len(),
            max: MAX_SHORT_STRING,
        });
    }
    Ok(())
}

fn put_string(out: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    check_short_string(s)?;
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_long_string(out: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    let len = u32::try_from(s.len()).map_err(|_| CodecError::StringTooLong {
        len: s.len(),
        max: u32::MAX as usize,
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_count(out: &mut Vec<u8>, n: usize) -> Result<(), CodecError> {
    let n = u32::try_from(n).map_err(|_| CodecError::StringTooLong {
        len: n,
        max: u32::MAX as usize,
    })?;
    out.extend_from_slice(&n.to_be_bytes());
    Ok(())
}

fn put_strings(out: &mut Vec<u8>, list: &[String]) -> Result<(), CodecError> {
    put_count(out, list.len())?;
    for s in list {
        put_long_string(out, s)?;
    }
    Ok(())
}

fn put_dictionary(out: &mut Vec<u8>, map: &Headers) -> Result<(), CodecError> {
    put_count(out, map.len())?;
    for (key, value) in map {
        put_string(out, key)?;
        put_long_string(out, value)?;
    }
    Ok(())
}

/// Cursor over a message body. Every read checks bounds.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn utf8(&mut self, n: usize) -> Result<String, CodecError> {
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let n = self.u8()? as usize;
        self.utf8(n)
    }

    fn long_string(&mut self) -> Result<String, CodecError> {
        let n = self.u32()? as usize;
        self.utf8(n)
    }

    fn strings(&mut self) -> Result<Vec<String>, CodecError> {
        let count = self.u32()? as usize;
        // Each entry needs at least its 4-byte length prefix.
        if count > self.buf.len() / 4 {
            return Err(CodecError::Truncated);
        }
        (0..count).map(|_| self.long_string()).collect()
    }

    fn dictionary(&mut self) -> Result<Headers, CodecError> {
        let count = self.u32()? as usize;
        if count > self.buf.len() / 5 {
            return Err(CodecError::Truncated);
        }
        let mut map = Headers::new();
        for _ in 0..count {
            let key = self.string()?;
            let value = self.long_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
