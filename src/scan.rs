use crate::errors::{Error, Result};
use crate::message::{Message, MAGIC};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Everything a scan found: parsed messages plus the offsets where a magic
/// sequence turned out not to head a parseable message.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub messages: Vec<Message>,
    pub failures: Vec<(u64, Error)>,
}

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Read a file, transparently inflating gzip, and scan it for messages.
pub fn scan_path<P: AsRef<Path>>(path: P) -> Result<ScanResult> {
    let mut file = File::open(path)?;
    let mut head = [0u8; 2];
    let n = file.read(&mut head)?;

    let mut bytes = Vec::new();
    if n == 2 && head == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(std::io::Cursor::new(head).chain(file));
        decoder.read_to_end(&mut bytes)?;
    } else {
        bytes.extend_from_slice(&head[..n]);
        file.read_to_end(&mut bytes)?;
    }
    Ok(scan_bytes(&bytes))
}

/// Scan a byte stream for "BUFR" magics and parse a message at each one.
/// A successful parse skips the scan past the message; a failed one is
/// recorded and the scan resumes just after the magic, so garbage between
/// messages never hides the next one.
pub fn scan_bytes(bytes: &[u8]) -> ScanResult {
    let mut result = ScanResult::default();
    let mut pos = 0usize;
    while let Some(found) = find_magic(&bytes[pos..]) {
        let offset = pos + found;
        match Message::parse(&bytes[offset..], offset as u64) {
            Ok(msg) => {
                pos = offset + msg.section0.total_length as usize;
                result.messages.push(msg);
            }
            Err(err) => {
                result.failures.push((offset as u64, err));
                pos = offset + MAGIC.len();
            }
        }
    }
    result
}

fn find_magic(haystack: &[u8]) -> Option<usize> {
    haystack.windows(MAGIC.len()).position(|w| w == MAGIC)
}
