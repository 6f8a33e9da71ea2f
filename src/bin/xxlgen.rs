//! Converts sample records from textual to binary form.
//!
//! One record per input line, whitespace-separated:
//!
//! ```text
//! KEY FLAGS CRC BODY_SIZE BODY_SEED
//! ```
//!
//! The key is truncated or zero-padded to 64 bytes; the body is
//! synthesized from a PRNG seeded with `BODY_SEED`, so the same line
//! always produces the same record. Lines that do not parse, or that
//! declare an oversized body, are reported and skipped.

use std::io::{self, BufRead};
use std::process;

use env_logger;
use log;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use xxlsort::buffer::RenderBuf;
use xxlsort::file::{FileId, OutputFile};
use xxlsort::mem::MIB;
use xxlsort::record::{ExternalHeader, Key, KEY_SIZE};
use xxlsort::{Result, MAX_BODY_SIZE};

struct Record {
    header: ExternalHeader,
    body_seed: u64,
}

fn parse_line(line: &str) -> Option<Record> {
    let mut fields = line.split_whitespace();

    let key_text = fields.next()?;
    let flags = fields.next()?.parse().ok()?;
    let crc = fields.next()?.parse().ok()?;
    let body_size: u64 = fields.next()?.parse().ok()?;
    let body_seed = fields.next()?.parse().ok()?;
    if fields.next().is_some() || body_size > MAX_BODY_SIZE {
        return None;
    }

    let mut key: Key = [0u8; KEY_SIZE];
    let key_bytes = key_text.as_bytes();
    let used = key_bytes.len().min(KEY_SIZE);
    key[..used].copy_from_slice(&key_bytes[..used]);

    Some(Record {
        header: ExternalHeader {
            key,
            flags,
            crc,
            body_size,
        },
        body_seed,
    })
}

fn write_body(out: &mut RenderBuf<'_>, seed: u64, size: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut words = [0u8; 1024];

    let mut left = size;
    while left > 0 {
        for word in words.chunks_exact_mut(8) {
            word.copy_from_slice(&rng.next_u64().to_le_bytes());
        }
        let portion = left.min(words.len() as u64) as usize;
        out.write(&words[..portion])?;
        left -= portion as u64;
    }
    Ok(())
}

fn generate(output: &str) -> Result<()> {
    let id = FileId::with_path(output);
    let mut mem = vec![0u8; 4 * MIB];
    let mut out = RenderBuf::new(&mut mem, Some(OutputFile::create(&id)?));

    let stdin = io::stdin();
    for (lineno, line) in stdin.lock().lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::warn!("line {} unreadable: {}", lineno + 1, err);
                continue;
            }
        };
        let record = match parse_line(&line) {
            Some(record) => record,
            None => {
                log::warn!("line {} ignored", lineno + 1);
                continue;
            }
        };

        out.put(&record.header)?;
        write_body(&mut out, record.body_seed, record.header.body_size)?;
    }
    out.flush()
}

fn main() {
    env_logger::init();

    let arg_parser = clap::App::new("xxlgen")
        .about("converts textual sample records (KEY FLAGS CRC BODY_SIZE BODY_SEED per line) to binary")
        .arg(
            clap::Arg::new("output")
                .help("file to write binary records to")
                .default_value("/dev/stdout")
                .takes_value(true),
        )
        .get_matches();

    let output = arg_parser.value_of("output").expect("value has a default");
    if let Err(err) = generate(output) {
        log::error!("{}", err);
        process::exit(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_line() {
        let record = parse_line("abc 1 2 10 42").unwrap();
        assert_eq!(&record.header.key[..3], b"abc");
        assert_eq!(&record.header.key[3..], &[0u8; 61][..]);
        assert_eq!(record.header.flags, 1);
        assert_eq!(record.header.crc, 2);
        assert_eq!(record.header.body_size, 10);
        assert_eq!(record.body_seed, 42);
    }

    #[test]
    fn test_parse_line_rejects_garbage() {
        assert!(parse_line("").is_none());
        assert!(parse_line("a 1 2 3").is_none());
        assert!(parse_line("a 1 2 3 4 5").is_none());
        assert!(parse_line("a one 2 3 4").is_none());
        assert!(parse_line(&format!("a 1 2 {} 4", MAX_BODY_SIZE + 1)).is_none());
    }

    #[test]
    fn test_key_longer_than_field_is_truncated() {
        let long_key = "x".repeat(100);
        let record = parse_line(&format!("{} 0 0 0 0", long_key)).unwrap();
        assert_eq!(record.header.key, [b'x'; KEY_SIZE]);
    }

    #[test]
    fn test_body_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for name in ["a", "b"] {
            let id = FileId::with_path(dir.path().join(name));
            let mut mem = vec![0u8; 4096];
            let mut out = RenderBuf::new(&mut mem, Some(OutputFile::create(&id).unwrap()));
            write_body(&mut out, 7, 3000).unwrap();
            out.flush().unwrap();
            files.push(std::fs::read(id.path()).unwrap());
        }
        assert_eq!(files[0].len(), 3000);
        assert_eq!(files[0], files[1]);
    }
}
