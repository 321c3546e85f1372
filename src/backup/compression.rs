// Gzip helpers for artifacts - in-memory and file-to-file

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::Result;

/// Compression level used for every artifact (balanced speed/size)
pub const COMPRESSION_LEVEL: u32 = 6;

/// Gzip a byte slice
pub fn compress_bytes(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
    encoder.write_all(data)?;
    encoder.finish()
}

/// Gunzip a byte slice
pub fn decompress_bytes(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Stream-compress `src` into `dst`, returning the compressed size
pub async fn compress_file(src: &Path, dst: &Path) -> Result<u64> {
    let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
    let size = tokio::task::spawn_blocking(move || compress_file_blocking(&src, &dst)).await??;
    Ok(size)
}

/// Stream-decompress `src` into `dst`, returning the decompressed size
pub async fn decompress_file(src: &Path, dst: &Path) -> Result<u64> {
    let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
    let size = tokio::task::spawn_blocking(move || decompress_file_blocking(&src, &dst)).await??;
    Ok(size)
}

/// Hex SHA-256 of a file's contents
pub async fn sha256_file(path: &Path) -> Result<String> {
    let path: PathBuf = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || -> io::Result<String> {
        let mut reader = BufReader::new(File::open(&path)?);
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await??;
    Ok(digest)
}

fn compress_file_blocking(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(src)?);
    let out = BufWriter::new(File::create(dst)?);
    let mut encoder = GzEncoder::new(out, Compression::new(COMPRESSION_LEVEL));
    io::copy(&mut reader, &mut encoder)?;
    let mut out = encoder.finish()?;
    out.flush()?;
    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

fn decompress_file_blocking(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let mut out = BufWriter::new(File::create(dst)?);
    let written = io::copy(&mut decoder, &mut out)?;
    out.flush()?;
    Ok(written)
}
