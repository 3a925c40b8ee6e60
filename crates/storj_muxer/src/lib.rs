//! Deterministic file demultiplexing into fixed-size shards ([`Demuxer`]) and
//! reassembly of shard streams back into a file, read in strict shard-index order
//! ([`Muxer`]) — §4.5.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, ReadBuf, Take};

/// Default shard size used when no explicit size is configured (§4.5): 8 MiB.
pub const DEFAULT_SHARD_SIZE: u64 = 8 * 1024 * 1024;

/// Errors raised by [`Demuxer`] or [`Muxer`].
#[derive(Debug, Error)]
pub enum MuxerError {
    #[error("Cannot multiplex a 0 shard stream")]
    ZeroShards,
    #[error("You must supply a length parameter")]
    MissingLength,
    #[error("Cannot add more inputs than the declared shard count")]
    InputsExceedDeclaredShards,
    #[error("Input exceeds the declared length")]
    InputExceedsDeclaredLength,
    #[error("reading before any inputs are registered")]
    UnexpectedEndOfInput,
    #[error("input stream ended after {actual} bytes, short of its {expected}-byte share")]
    ShortInput { expected: u64, actual: u64 },
    #[error("growing a muxer is disabled by configuration")]
    GrowDisabled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Splits a local file into ascending-index, fixed-size shard readers. Concatenating
/// the bytes of every shard, in index order, reproduces the file exactly (§8 property 3).
pub struct Demuxer {
    path: PathBuf,
    shard_size: u64,
    total_size: u64,
}

impl Demuxer {
    /// Opens `path`, using its on-disk length as the total size hint, and reports
    /// shards of `shard_size` bytes (the final shard may be shorter).
    pub async fn open(path: impl AsRef<Path>, shard_size: u64) -> Result<Self, MuxerError> {
        let path = path.as_ref().to_path_buf();
        let total_size = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, shard_size, total_size })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn shard_size(&self) -> u64 {
        self.shard_size
    }

    /// Number of shards the file splits into; the last one may be partial.
    pub fn shard_count(&self) -> u64 {
        if self.total_size == 0 {
            return 0;
        }
        self.total_size.div_ceil(self.shard_size)
    }

    /// Opens a reader bounded to shard `index`'s bytes. Callers are expected to read
    /// shards in ascending order (§4.5: "Emits shards strictly in order"); this type
    /// does not itself enforce that ordering, it only bounds each reader's length.
    pub async fn shard_reader(&self, index: u64) -> Result<Take<File>, MuxerError> {
        if index >= self.shard_count() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("shard index {index} is past the last shard"),
            )
            .into());
        }
        let offset = index * self.shard_size;
        let remaining = self.total_size - offset;
        let len = remaining.min(self.shard_size);
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file.take(len))
    }
}

type BoxedInput = Pin<Box<dyn AsyncRead + Send>>;

/// Reassembles a declared number of shard streams, of a declared total byte length,
/// back into one ordered byte stream. Drains input 0 to completion before reading any
/// byte of input 1, and so on (§4.5's read behaviour).
pub struct Muxer {
    declared_shards: u64,
    declared_length: u64,
    allow_grow: bool,
    inputs: Vec<BoxedInput>,
    current: usize,
    total_read: u64,
}

/// Construction parameters for [`Muxer::new`]. `shards` and `length` are signed so
/// that a caller's zero/negative mistake is a normal value this type rejects, rather
/// than a type-system impossibility that would hide the intended error message.
#[derive(Clone, Copy, Debug)]
pub struct MuxerParams {
    pub shards: i64,
    pub length: Option<i64>,
    /// Whether [`Muxer::grow`] may later be called. Default `false` per the Open
    /// Question resolution in the design notes: no implicit growth.
    pub allow_grow: bool,
}

impl Default for MuxerParams {
    fn default() -> Self {
        Self { shards: 0, length: None, allow_grow: false }
    }
}

impl Muxer {
    pub fn new(params: MuxerParams) -> Result<Self, MuxerError> {
        if params.shards <= 0 {
            return Err(MuxerError::ZeroShards);
        }
        let length = params.length.ok_or(MuxerError::MissingLength)?;
        if length <= 0 {
            return Err(MuxerError::MissingLength);
        }
        Ok(Self {
            declared_shards: params.shards as u64,
            declared_length: length as u64,
            allow_grow: params.allow_grow,
            inputs: Vec::new(),
            current: 0,
            total_read: 0,
        })
    }

    pub fn declared_shards(&self) -> u64 {
        self.declared_shards
    }

    pub fn declared_length(&self) -> u64 {
        self.declared_length
    }

    /// Registers `reader` as the next input, in arrival order.
    pub fn input(&mut self, reader: impl AsyncRead + Send + 'static) -> Result<(), MuxerError> {
        if self.inputs.len() as u64 >= self.declared_shards {
            return Err(MuxerError::InputsExceedDeclaredShards);
        }
        self.inputs.push(Box::pin(reader));
        Ok(())
    }

    /// Explicitly extends the declared shard count and length, per the design notes'
    /// resolution of the muxer-growth open question (no implicit field mutation).
    /// Disabled unless the muxer was constructed with `allow_grow: true`.
    pub fn grow(&mut self, additional_shards: u64, additional_length: u64) -> Result<(), MuxerError> {
        if !self.allow_grow {
            return Err(MuxerError::GrowDisabled);
        }
        self.declared_shards += additional_shards;
        self.declared_length += additional_length;
        Ok(())
    }
}

impl AsyncRead for Muxer {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.inputs.is_empty() {
            return Poll::Ready(Err(MuxerError::UnexpectedEndOfInput.into()));
        }
        loop {
            if this.current >= this.inputs.len() {
                if this.total_read < this.declared_length {
                    return Poll::Ready(Err(MuxerError::ShortInput {
                        expected: this.declared_length,
                        actual: this.total_read,
                    }
                    .into()));
                }
                return Poll::Ready(Ok(()));
            }

            let before = out.filled().len();
            match this.inputs[this.current].as_mut().poll_read(cx, out) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Ready(Ok(())) => {
                    let read = out.filled().len() - before;
                    if read == 0 {
                        this.current += 1;
                        continue;
                    }
                    this.total_read += read as u64;
                    if this.total_read > this.declared_length {
                        return Poll::Ready(Err(MuxerError::InputExceedsDeclaredLength.into()));
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl From<MuxerError> for std::io::Error {
    fn from(err: MuxerError) -> Self {
        std::io::Error::other(err)
    }
}
