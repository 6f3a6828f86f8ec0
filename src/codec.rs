use std::{borrow::Cow, fmt, future::Future, io};

use encoding_rs::Encoding;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use crate::{InvalidMessage, Message, MessageParseError};


const CONTENT_LENGTH: &str = "Content-Length";
const CONTENT_TYPE: &str = "Content-Type";
const JSON_MIME_TYPE: &str = "application/vscode-jsonrpc";

/// Largest body [`MessageReader`] accepts unless configured otherwise.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

/// Character encoding of message bodies.
///
/// Any label known to the WHATWG Encoding Standard is accepted. Labels such as
/// `UTF-16` or `ISO-8859-1` resolve to the encodings browsers use for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charset(&'static Encoding);

impl Charset {
    pub const UTF_8: Self = Self(encoding_rs::UTF_8);
    pub const UTF_16LE: Self = Self(encoding_rs::UTF_16LE);
    pub const UTF_16BE: Self = Self(encoding_rs::UTF_16BE);

    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().trim_matches('"');
        Encoding::for_label(label.as_bytes())
            .filter(|&encoding| encoding != encoding_rs::REPLACEMENT)
            .map(Self)
    }
    pub fn encoding(self) -> &'static Encoding {
        self.0
    }

    fn encode(self, s: &str) -> io::Result<Vec<u8>> {
        // encoding_rs only decodes UTF-16
        if self == Self::UTF_16LE {
            return Ok(s.encode_utf16().flat_map(u16::to_le_bytes).collect());
        }
        if self == Self::UTF_16BE {
            return Ok(s.encode_utf16().flat_map(u16::to_be_bytes).collect());
        }
        let (bytes, _, unmappable) = self.0.encode(s);
        if unmappable {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message contains characters not representable in {self}"),
            ));
        }
        Ok(bytes.into_owned())
    }
    fn decode(self, body: &[u8]) -> Result<String, ReadError> {
        self.0
            .decode_without_bom_handling_and_without_replacement(body)
            .map(Cow::into_owned)
            .ok_or(ReadError::Decode(self))
    }
}
impl Default for Charset {
    fn default() -> Self {
        Self::UTF_8
    }
}
impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.name())
    }
}

/// Failure to read one framed message.
///
/// Only [`ReadError::Io`] leaves the stream in an unknown state; after any other
/// error the reader is positioned at the start of the next message.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length header: `{0}`")]
    InvalidContentLength(String),
    #[error("Content-Length {length} exceeds the limit of {max} bytes")]
    ContentTooLarge { length: usize, max: usize },
    #[error("malformed header line: `{0}`")]
    MalformedHeader(String),
    #[error("unsupported charset `{0}`")]
    UnsupportedCharset(String),
    #[error("message body is not valid {0}")]
    Decode(Charset),
    #[error("failed to parse message body: {0}")]
    Json(#[source] serde_json::Error),
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] InvalidMessage),
}
impl ReadError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}
impl From<MessageParseError> for ReadError {
    fn from(e: MessageParseError) -> Self {
        match e {
            MessageParseError::Json(e) => Self::Json(e),
            MessageParseError::Invalid(e) => Self::InvalidMessage(e),
        }
    }
}

pub trait MessageRead {
    /// Reads the next message, or `None` at end of stream.
    fn read(&mut self) -> impl Future<Output = Result<Option<Message>, ReadError>> + Send;
}

pub trait MessageWrite {
    fn write(&self, message: &Message) -> impl Future<Output = io::Result<()>> + Send;
    fn close(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Decodes `Content-Length` framed messages from a byte stream.
pub struct MessageReader<R> {
    reader: R,
    line: Vec<u8>,
    max_content_length: usize,
}

impl<R> MessageReader<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }

    /// Bodies longer than `max` are rejected with [`ReadError::ContentTooLarge`]
    /// without being read.
    pub fn with_max_content_length(mut self, max: usize) -> Self {
        self.max_content_length = max;
        self
    }

    async fn read_line(&mut self) -> io::Result<Option<&[u8]>> {
        self.line.clear();
        if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
            return Ok(None);
        }
        let mut line = self.line.as_slice();
        line = line.strip_suffix(b"\n").unwrap_or(line);
        line = line.strip_suffix(b"\r").unwrap_or(line);
        Ok(Some(line))
    }

    async fn read_headers(&mut self) -> Result<Option<Headers>, ReadError> {
        let mut headers = Headers::default();
        let mut seen_any = false;
        loop {
            let Some(line) = self.read_line().await? else {
                if seen_any {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                return Ok(None);
            };
            if line.is_empty() {
                if seen_any {
                    return Ok(Some(headers));
                }
                continue;
            }
            seen_any = true;
            headers.parse_line(line);
        }
    }
}

impl<R> MessageRead for MessageReader<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn read(&mut self) -> Result<Option<Message>, ReadError> {
        let Some(headers) = self.read_headers().await? else {
            return Ok(None);
        };
        let len = match headers.content_length {
            Some(Ok(len)) => len,
            Some(Err(value)) => return Err(ReadError::InvalidContentLength(value)),
            None => return Err(ReadError::MissingContentLength),
        };
        if len > self.max_content_length {
            let max = self.max_content_length;
            return Err(ReadError::ContentTooLarge { length: len, max });
        }
        let mut body = Vec::new();
        (&mut self.reader).take(len as u64).read_to_end(&mut body).await?;
        if body.len() < len {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        if let Some(e) = headers.error {
            return Err(e);
        }
        let body = headers.charset.decode(&body)?;
        Ok(Some(Message::from_slice(body.as_bytes())?))
    }
}

#[derive(Default)]
struct Headers {
    content_length: Option<Result<usize, String>>,
    charset: Charset,
    error: Option<ReadError>,
}
impl Headers {
    fn parse_line(&mut self, line: &[u8]) {
        let parsed = std::str::from_utf8(line)
            .ok()
            .filter(|line| line.is_ascii())
            .and_then(|line| line.split_once(':'));
        let Some((name, value)) = parsed else {
            let line = String::from_utf8_lossy(line).into_owned();
            self.error.get_or_insert(ReadError::MalformedHeader(line));
            return;
        };
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case(CONTENT_LENGTH) {
            self.content_length = Some(value.parse().map_err(|_| value.to_string()));
        } else if name.eq_ignore_ascii_case(CONTENT_TYPE) {
            let charset = value.split(';').skip(1).find_map(|param| {
                let (key, value) = param.split_once('=')?;
                key.trim().eq_ignore_ascii_case("charset").then_some(value)
            });
            if let Some(label) = charset {
                match Charset::from_label(label) {
                    Some(charset) => self.charset = charset,
                    None => {
                        self.error
                            .get_or_insert(ReadError::UnsupportedCharset(label.trim().into()));
                    }
                }
            }
        }
    }
}

/// Encodes messages onto a byte stream.
///
/// Writes through a shared reference are serialized by an internal lock so the
/// header and body of one message are never interleaved with another message.
pub struct MessageWriter<W> {
    writer: Mutex<W>,
    charset: Charset,
}

impl<W> MessageWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self::with_charset(writer, Charset::UTF_8)
    }
    pub fn with_charset(writer: W, charset: Charset) -> Self {
        Self {
            writer: Mutex::new(writer),
            charset,
        }
    }
    pub fn charset(&self) -> Charset {
        self.charset
    }
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    /// Returns the exact bytes [`MessageWrite::write`] puts on the stream for `message`.
    pub fn encode(&self, message: &Message) -> io::Result<Vec<u8>> {
        let content = serde_json::to_string(message)?;
        let body = self.charset.encode(&content)?;
        let mut bytes = header(body.len(), self.charset).into_bytes();
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }
}

impl<W> MessageWrite for MessageWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&self, message: &Message) -> io::Result<()> {
        let bytes = self.encode(message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await
    }
    async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

pub fn header(content_length: usize, charset: Charset) -> String {
    let mut header = format!("{CONTENT_LENGTH}: {content_length}\r\n");
    if charset != Charset::UTF_8 {
        header.push_str(&format!(
            "{CONTENT_TYPE}: {JSON_MIME_TYPE}; charset={charset}\r\n"
        ));
    }
    header.push_str("\r\n");
    header
}
