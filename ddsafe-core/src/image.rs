//! Image files used as restore sources.
//!
//! Images ending in `.gz`, `.xz` or `.zst` are decoded on the fly. Nothing is
//! staged on disk: the decoded stream is fed straight into the executor's
//! stdin, and the Verification Engine digests the same decoded stream.
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

/// Compression wrapper detected from the file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "gz" | "gzip" => Compression::Gzip,
            "xz" => Compression::Xz,
            "zst" | "zstd" => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

/// An existing image file on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageFile {
    path: PathBuf,
    compression: Compression,
    len: u64,
}

impl ImageFile {
    /// Stats `path` and records its compression.
    pub fn open(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path.to_path_buf()),
            _ => Error::Io(e),
        })?;

        if !metadata.is_file() {
            return Err(Error::InvalidRequest(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            compression: Compression::from_path(path),
            len: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn is_compressed(&self) -> bool {
        self.compression != Compression::None
    }

    /// Size of the raw image, known only when it is not compressed.
    pub fn decoded_len(&self) -> Option<u64> {
        (!self.is_compressed()).then_some(self.len)
    }

    /// Opens the image and returns a reader over its decoded bytes.
    pub fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        let input_file = File::open(&self.path)?;

        let reader: Box<dyn Read + Send> = match self.compression {
            Compression::Gzip => Box::new(GzDecoder::new(BufReader::new(input_file))),
            Compression::Xz => Box::new(XzDecoder::new(BufReader::new(input_file))),
            Compression::Zstd => Box::new(ZstdDecoder::new(input_file)?),
            Compression::None => Box::new(input_file),
        };
        Ok(reader)
    }
}
