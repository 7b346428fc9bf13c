//! Bundle source access: local file or HTTP download, with a running
//! checksum of the stream as delivered.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use anyhow::Context;
use crc::{Crc, Digest, CRC_32_ISCSI};

static BUNDLE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const USER_AGENT: &str = concat!("bos-restore/", env!("CARGO_PKG_VERSION"));

/// Open a firmware source: a local path if one exists there, a URL otherwise.
pub fn open_source(source: &str) -> anyhow::Result<Box<dyn Read>> {
    let path = Path::new(source);
    if path.is_file() {
        let file = File::open(path).with_context(|| format!("cannot open {source}"))?;
        return Ok(Box::new(file));
    }

    let response = ureq::get(source)
        .set("User-Agent", USER_AGENT)
        .call()
        .with_context(|| format!("cannot download {source}"))?;
    Ok(Box::new(response.into_reader()))
}

/// Passthrough reader that checksums every byte it delivers.
///
/// The digest covers the stream as transferred (compressed), so the reported
/// checksum can be compared against the published one for the bundle.
pub struct DigestReader<R> {
    inner: R,
    digest: Digest<'static, u32>,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digest: BUNDLE_CRC.digest(),
        }
    }

    /// Consume the reader and return the checksum of everything read so far.
    pub fn finish(self) -> u32 {
        self.digest.finalize()
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

#[test]
fn test_digest_reader_matches_whole_buffer() -> io::Result<()> {
    let data = b"firmware bundle bytes";

    let mut reader = DigestReader::new(&data[..]);
    let mut out = Vec::new();
    // Read in small chunks to exercise incremental updates
    let mut chunk = [0u8; 5];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }

    assert_eq!(out, data);
    assert_eq!(reader.finish(), BUNDLE_CRC.checksum(data));
    Ok(())
}
