//! Mount the contents of an archive (tar, zip, 7z, gz, xz, ...) as a
//! read-only virtual filesystem, without decompressing it to disk first.
//!
//! Archive decoders are sequential: entries are visited in order and each
//! entry's bytes are produced front-to-back. A filesystem demands random
//! access. This crate bridges the two with a bounded amount of memory:
//!
//! - A [`tree::Tree`] of all entries is built once from archive metadata,
//!   either eagerly (blocking the first request) or in a background task.
//! - A pool of warm decompression cursors ([`reader::Reader`]s) is kept so
//!   that opening entry `k` after entry `j <= k` skips `k - j` headers
//!   instead of rescanning the whole archive.
//! - Small recently-decompressed byte ranges are cached in a
//!   [`buffer::SideBufferPool`] so that reordered or overlapping reads are
//!   served by a memcpy instead of a fresh decompression pass.
//!
//! The decompression library itself is a collaborator behind the
//! [`Decoder`]/[`DecoderSession`] traits; a backend for raw `.xz` streams
//! ships behind the `lzma` feature. The filesystem transport (e.g. a FUSE
//! binding) drives a [`MountSession`] from its worker threads.

#[cfg(feature = "log")]
#[macro_use(trace_time)]
extern crate measure_time;

#[cfg(feature = "log")]
#[macro_use(trace, warn, error)]
extern crate log;

#[cfg(not(feature = "log"))]
#[macro_use]
mod macros {
    macro_rules! trace {
        ($($tt:tt)*) => {
            let _ = if false {
                let _ = ::std::format_args!($($tt)*);
            };
        };
    }

    macro_rules! warn {
        ($($tt:tt)*) => {
            trace!($($tt)*)
        };
    }

    macro_rules! error {
        ($($tt:tt)*) => {
            trace!($($tt)*)
        };
    }

    macro_rules! trace_time {
        ($($tt:tt)*) => {
            trace!($($tt)*)
        };
    }
}

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

pub mod buffer;
pub mod decoder;
mod init;
pub mod reader;
pub mod session;
pub mod tree;

pub use decoder::{Decoder, DecoderError, DecoderSession, Entry};
pub use session::{
    AccessMode, Config, DirEntry, Error, FileAttr, FileHandle, MountError, MountErrorKind,
    MountOptions, MountSession, Result,
};
pub use tree::{Node, NodeId, NodeKind, Tree};

/// The scale of initialization progress reports: a fully scanned archive
/// reports `1_000_000`.
pub const PROGRESS_SCALE: u32 = 1_000_000;
