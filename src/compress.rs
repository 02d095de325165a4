//! Compressed column streams.
//!
//! Column data files are sequences of lz4 frames, each prefixed with
//! `(compressed_len: u32, plain_len: u32)` little-endian. The writer exposes
//! the two coordinates a mark records: `count()` — compressed bytes flushed
//! so far, i.e. the file offset where the current frame will begin — and
//! `offset()` — plain bytes pending inside the current frame. The reader
//! seeks to a mark by seeking to the frame start and skipping the plain
//! offset after decompression.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{StorageResult, TracedStorageError};

const FRAME_HEADER_SIZE: usize = 4 + 4;

pub struct CompressedWriter {
    file: BufWriter<File>,
    buf: Vec<u8>,
    block_size: usize,
    flushed: u64,
}

impl CompressedWriter {
    pub fn create(path: impl AsRef<Path>, block_size: usize) -> StorageResult<Self> {
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: BufWriter::new(file),
            buf: Vec::with_capacity(block_size),
            block_size,
            flushed: 0,
        })
    }

    /// Compressed bytes flushed to the file so far.
    pub fn count(&self) -> u64 {
        self.flushed
    }

    /// Plain bytes pending in the current frame.
    pub fn offset(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> StorageResult<()> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() >= self.block_size {
            self.flush_frame()?;
        }
        Ok(())
    }

    fn flush_frame(&mut self) -> StorageResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let compressed = lz4_flex::compress(&self.buf);
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[..4].copy_from_slice(&(compressed.len() as u32).to_le_bytes());
        header[4..].copy_from_slice(&(self.buf.len() as u32).to_le_bytes());
        self.file.write_all(&header)?;
        self.file.write_all(&compressed)?;
        self.flushed += (FRAME_HEADER_SIZE + compressed.len()) as u64;
        self.buf.clear();
        Ok(())
    }

    /// Flushes the pending frame and syncs the file.
    pub fn finish(mut self) -> StorageResult<()> {
        self.flush_frame()?;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }
}

pub struct CompressedReader {
    file: BufReader<File>,
    block: Vec<u8>,
    pos: usize,
}

impl CompressedReader {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Ok(Self {
            file: BufReader::new(File::open(path.as_ref())?),
            block: vec![],
            pos: 0,
        })
    }

    /// Positions the stream at a mark: `compressed_offset` bytes into the
    /// file (a frame boundary), then `block_offset` plain bytes into the
    /// frame found there.
    pub fn seek_to(&mut self, compressed_offset: u64, block_offset: u64) -> StorageResult<()> {
        self.file.seek(SeekFrom::Start(compressed_offset))?;
        self.block.clear();
        self.pos = 0;
        if block_offset > 0 {
            if !self.fill()? {
                return Err(TracedStorageError::decode("seek past end of stream"));
            }
            if block_offset as usize > self.block.len() {
                return Err(TracedStorageError::decode("mark offset outside frame"));
            }
            self.pos = block_offset as usize;
        }
        Ok(())
    }

    pub fn read_exact(&mut self, out: &mut [u8]) -> StorageResult<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.pos == self.block.len() && !self.fill()? {
                return Err(TracedStorageError::decode("unexpected end of stream"));
            }
            let n = (out.len() - filled).min(self.block.len() - self.pos);
            out[filled..filled + n].copy_from_slice(&self.block[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        Ok(())
    }

    /// True when the stream is exhausted at a frame boundary.
    pub fn is_eof(&mut self) -> StorageResult<bool> {
        if self.pos < self.block.len() {
            return Ok(false);
        }
        Ok(!self.fill()?)
    }

    /// Decompresses the next frame. Returns false on clean end of file.
    fn fill(&mut self) -> StorageResult<bool> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut got = 0;
        while got < FRAME_HEADER_SIZE {
            let n = self.file.read(&mut header[got..])?;
            if n == 0 {
                if got == 0 {
                    return Ok(false);
                }
                return Err(TracedStorageError::decode("truncated frame header"));
            }
            got += n;
        }
        let compressed_len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
        let plain_len = u32::from_le_bytes(header[4..].try_into().unwrap()) as usize;
        let mut compressed = vec![0u8; compressed_len];
        self.file.read_exact(&mut compressed)?;
        self.block = lz4_flex::decompress(&compressed, plain_len)
            .map_err(|e| TracedStorageError::decode(e))?;
        if self.block.len() != plain_len {
            return Err(TracedStorageError::decode("frame length mismatch"));
        }
        self.pos = 0;
        Ok(true)
    }
}
