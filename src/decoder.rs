//! The interface to the archive/decompression collaborator.
//!
//! The decompression library is deliberately not part of this crate. It is
//! modelled after the streaming archive readers in the wild (libarchive et
//! al.): a session is opened over a byte stream, entry headers are iterated
//! strictly in order, and an entry's decompressed bytes can only be read
//! front-to-back. Seeking backwards mid-stream is impossible; the only
//! recovery is opening a brand-new session.
//!
//! Decoders do not report passphrase problems through designated error
//! codes. The only portable signal is the error text, so
//! [`classify_error_message`] matches it against a fixed, ordered list of
//! known prefixes. Those exact strings are a compatibility contract with
//! current decoder versions; they are fragile against upstream rewording
//! and must not be "improved" locally.

use std::{
    fmt,
    io::{Read, Seek},
};

use bstr::BString;

#[cfg(feature = "lzma")]
pub mod xz;

pub type Result<T, E = DecoderError> = std::result::Result<T, E>;

/// The byte stream a decode session consumes.
///
/// Decoders may seek forward over stored (uncompressed) regions; they never
/// seek backwards past data they already consumed.
pub trait ArchiveInput: Read + Seek + Send {}
impl<T: Read + Seek + Send + ?Sized> ArchiveInput for T {}

/// A factory for decode sessions over one archive.
///
/// Every call to [`Decoder::open`] must yield an independent session with
/// its own stream cursor, so that sessions never contend with each other.
pub trait Decoder: Send + Sync {
    fn open(
        &self,
        input: Box<dyn ArchiveInput>,
        passphrase: Option<&[u8]>,
    ) -> Result<Box<dyn DecoderSession>>;
}

/// One sequential pass over an archive.
pub trait DecoderSession: Send {
    /// Advance to the next entry and return its metadata, or `None` at
    /// end-of-archive. Reading entry bytes is only valid after at least one
    /// successful `next_entry`.
    fn next_entry(&mut self) -> Result<Option<Entry>>;

    /// Decompress up to `buf.len()` bytes of the current entry into `buf`.
    /// Returns the number of bytes produced; 0 means end-of-entry. Short
    /// reads are allowed anywhere, not only at end-of-entry.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Whether the stream is a "raw" archive: a bare compressed stream (e.g.
    /// plain `.gz`/`.xz`) presented as an archive with exactly one implicit
    /// entry. Meaningful once the first header has been read.
    fn is_raw(&self) -> bool;

    /// Whether at least one decompression filter matched the stream. Used to
    /// reject mounting arbitrary uncompressed data as a raw archive.
    fn has_decode_filter(&self) -> bool;
}

/// Metadata of one archive entry, as produced by [`DecoderSession::next_entry`].
#[derive(Debug, Clone)]
pub struct Entry {
    /// Pathname as stored in the archive. Not normalized, not necessarily
    /// UTF-8, possibly hostile.
    pub pathname: BString,
    /// Unix file mode, including the file-type bits.
    pub mode: u32,
    /// Decompressed size, if the archive records one. Raw archives usually
    /// do not.
    pub size: Option<u64>,
    /// Modification time in seconds since the epoch.
    pub mtime: i64,
    /// Symlink target, for symlink entries.
    pub symlink_target: Option<BString>,
    /// Whether the entry's content is encrypted.
    pub encrypted: bool,
}

/// An error reported by the decoder library.
///
/// The message text is preserved verbatim: it is the input to
/// [`classify_error_message`] and it is what gets logged.
pub struct DecoderError(Box<DecoderErrorInner>);

#[derive(Debug)]
struct DecoderErrorInner {
    message: String,
    cancelled: bool,
}

impl DecoderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(Box::new(DecoderErrorInner {
            message: message.into(),
            cancelled: false,
        }))
    }

    /// The decoder's error text.
    pub fn message(&self) -> &str {
        &self.0.message
    }

    /// Whether this error was raised by a cancelled initialization scan
    /// rather than by malformed data.
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled
    }
}

impl fmt::Debug for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0.message)
    }
}

impl std::error::Error for DecoderError {}

impl From<std::io::Error> for DecoderError {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        let cancelled = is_cancellation(&err);
        Self(Box::new(DecoderErrorInner {
            message: err.to_string(),
            cancelled,
        }))
    }
}

/// The marker payload of I/O errors raised by a cancelled scan stream.
#[derive(Debug)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("operation cancelled: shutting down")
    }
}

impl std::error::Error for Cancelled {}

fn is_cancellation(err: &std::io::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = err.get_ref().map(|e| e as _);
    while let Some(err) = source {
        if err.is::<Cancelled>() {
            return true;
        }
        // `io::Error::source()` skips the error's own payload, so step into
        // the payload of nested I/O errors before walking further down.
        source = err
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io.get_ref().map(|e| e as _))
            .or_else(|| err.source());
    }
    false
}

/// What a decode failure means for the mount as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    PassphraseRequired,
    PassphraseIncorrect,
    PassphraseNotSupported,
    InvalidContents,
}

/// Classify a decoder error message, most specific prefix first.
///
/// The prefix list mirrors the error strings emitted by current decoder
/// libraries for encrypted archives. Anything unrecognized is treated as
/// generically invalid contents.
pub fn classify_error_message(message: &str) -> ErrorClass {
    if message.starts_with("Incorrect passphrase") {
        return ErrorClass::PassphraseIncorrect;
    }

    if message.starts_with("Passphrase required") {
        return ErrorClass::PassphraseRequired;
    }

    const NOT_SUPPORTED_PREFIXES: &[&str] = &[
        "Crypto codec not supported",
        "Decryption is unsupported",
        "Encrypted file is unsupported",
        "Encryption is not supported",
        "RAR encryption support unavailable",
        "The archive header is encrypted, but currently not supported",
        "The file content is encrypted, but currently not supported",
        "Unsupported encryption format",
    ];

    if NOT_SUPPORTED_PREFIXES
        .iter()
        .any(|prefix| message.starts_with(prefix))
    {
        return ErrorClass::PassphraseNotSupported;
    }

    ErrorClass::InvalidContents
}
