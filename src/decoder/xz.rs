//! A decode backend for raw `.xz` streams.
//!
//! A raw archive is a bare compressed stream with no container around it:
//! it decodes to exactly one entry with no recorded metadata, not even a
//! decompressed size. This backend presents such a stream through the
//! [`Decoder`] interface; the scan discovers the size by decompressing
//! once.

use std::io::{ErrorKind, Read, Seek, SeekFrom};

use bstr::BString;
use liblzma::read::XzDecoder;

use super::{ArchiveInput, Decoder, DecoderSession, Entry, Result};

const XZ_MAGIC: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];

/// Decodes a single xz stream as a one-entry raw archive.
pub struct RawXz {
    entry_pathname: BString,
}

impl RawXz {
    /// `entry_pathname` names the single entry, conventionally the
    /// archive's filename minus its `.xz` suffix.
    pub fn new(entry_pathname: impl Into<BString>) -> Self {
        Self {
            entry_pathname: entry_pathname.into(),
        }
    }
}

impl Decoder for RawXz {
    fn open(
        &self,
        mut input: Box<dyn ArchiveInput>,
        _passphrase: Option<&[u8]>,
    ) -> Result<Box<dyn DecoderSession>> {
        // Sniff the stream magic up front: an input that is not xz at all
        // must be reported as filter-less so the mount is refused, rather
        // than erroring on the first data read.
        let mut magic = [0u8; 6];
        let filter = match input.read_exact(&mut magic) {
            Ok(()) => magic == XZ_MAGIC,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => false,
            Err(err) => bail!(err),
        };
        input.seek(SeekFrom::Start(0))?;

        Ok(Box::new(RawXzSession {
            entry: Some(Entry {
                pathname: self.entry_pathname.clone(),
                mode: 0o100644,
                size: None,
                mtime: 0,
                symlink_target: None,
                encrypted: false,
            }),
            // Multi-stream mode: concatenated xz streams decode as one
            // contiguous entry, like `xz --decompress` would.
            stream: XzDecoder::new_multi_decoder(input),
            filter,
        }))
    }
}

struct RawXzSession {
    /// Taken by the first `next_entry`.
    entry: Option<Entry>,
    stream: XzDecoder<Box<dyn ArchiveInput>>,
    filter: bool,
}

impl DecoderSession for RawXzSession {
    fn next_entry(&mut self) -> Result<Option<Entry>> {
        Ok(self.entry.take())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream.read(buf)?)
    }

    fn is_raw(&self) -> bool {
        true
    }

    fn has_decode_filter(&self) -> bool {
        self.filter
    }
}
