//! Layer compression: magic-number detection, decompressing readers and
//! compressing writers.

use std::io::{self, BufRead, BufReader, Read, Write};

use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const BZIP2_MAGIC: &[u8] = b"BZh";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
    Bzip2,
}

impl Compression {
    /// Identify compression from the first bytes of a stream.
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(GZIP_MAGIC) {
            Compression::Gzip
        } else if header.starts_with(ZSTD_MAGIC) {
            Compression::Zstd
        } else if header.starts_with(BZIP2_MAGIC) {
            Compression::Bzip2
        } else {
            Compression::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Bzip2 => "bzip2",
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" | "uncompressed" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            "bzip2" | "bz2" => Ok(Compression::Bzip2),
            other => Err(StevedoreError::InvalidArgument(format!(
                "unknown compression {:?}",
                other
            ))),
        }
    }
}

/// Wrap `reader` so that it yields uncompressed bytes, detecting the
/// compression from the stream's magic number.
pub fn decompressed_reader<'a, R: Read + 'a>(
    reader: R,
) -> StevedoreResult<(Compression, Box<dyn Read + 'a>)> {
    let mut buffered = BufReader::new(reader);
    let header = buffered
        .fill_buf()
        .map_err(|e| StevedoreError::Storage(format!("Failed to read stream header: {}", e)))?;
    let compression = Compression::detect(header);

    let reader: Box<dyn Read + 'a> = match compression {
        Compression::None => Box::new(buffered),
        Compression::Gzip => Box::new(GzDecoder::new(buffered)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(buffered).map_err(
            |e| StevedoreError::Storage(format!("Failed to initialise zstd decoder: {}", e)),
        )?),
        Compression::Bzip2 => {
            return Err(StevedoreError::Unsupported(
                "bzip2-compressed layers are not supported".into(),
            ));
        }
    };
    Ok((compression, reader))
}

/// Writer that compresses with the chosen algorithm. `finish` must be
/// called to flush trailers.
pub enum CompressWriter<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> CompressWriter<W> {
    pub fn new(inner: W, compression: Compression) -> StevedoreResult<Self> {
        match compression {
            Compression::None => Ok(CompressWriter::Plain(inner)),
            Compression::Gzip => Ok(CompressWriter::Gzip(GzEncoder::new(
                inner,
                GzLevel::default(),
            ))),
            Compression::Zstd => zstd::stream::write::Encoder::new(inner, 3)
                .map(CompressWriter::Zstd)
                .map_err(|e| {
                    StevedoreError::Storage(format!("Failed to initialise zstd encoder: {}", e))
                }),
            Compression::Bzip2 => Err(StevedoreError::InvalidArgument(
                "bzip2 compression is not supported for image layers".into(),
            )),
        }
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressWriter::Plain(w) => Ok(w),
            CompressWriter::Gzip(w) => w.finish(),
            CompressWriter::Zstd(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressWriter::Plain(w) => w.write(buf),
            CompressWriter::Gzip(w) => w.write(buf),
            CompressWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressWriter::Plain(w) => w.flush(),
            CompressWriter::Gzip(w) => w.flush(),
            CompressWriter::Zstd(w) => w.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(compression: Compression) -> (Compression, Vec<u8>) {
        let mut writer = CompressWriter::new(Vec::new(), compression).unwrap();
        writer.write_all(b"payload payload payload").unwrap();
        let compressed = writer.finish().unwrap();

        let (detected, mut reader) = decompressed_reader(&compressed[..]).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        (detected, out)
    }

    #[test]
    fn test_detect_magic() {
        assert_eq!(Compression::detect(&[0x1f, 0x8b, 0x08]), Compression::Gzip);
        assert_eq!(
            Compression::detect(&[0x28, 0xb5, 0x2f, 0xfd, 0]),
            Compression::Zstd
        );
        assert_eq!(Compression::detect(b"BZh91AY"), Compression::Bzip2);
        assert_eq!(Compression::detect(b"ustar"), Compression::None);
        assert_eq!(Compression::detect(b""), Compression::None);
    }

    #[test]
    fn test_gzip_and_zstd_streams_decode() {
        assert_eq!(
            roundtrip(Compression::Gzip),
            (Compression::Gzip, b"payload payload payload".to_vec())
        );
        assert_eq!(
            roundtrip(Compression::Zstd),
            (Compression::Zstd, b"payload payload payload".to_vec())
        );
    }

    #[test]
    fn test_bzip2_rejected_both_directions() {
        assert!(CompressWriter::new(Vec::new(), Compression::Bzip2).is_err());
        assert!(decompressed_reader(&b"BZh91AY&SY"[..]).is_err());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!("".parse::<Compression>().unwrap(), Compression::None);
        assert!("lz4".parse::<Compression>().is_err());
    }
}
