//! Process-environment configuration.

use std::env;

use crate::error::{Error, Result};
use crate::mem::{GIB, KIB, MIB};
use crate::sort::DEFAULT_ARENA_SIZE;

/// The variable the arena size is read from.
pub const AVAILABLE_MEM_VAR: &str = "AVAILABLE_MEM";

/// Arena size from `AVAILABLE_MEM`, falling back to
/// [`DEFAULT_ARENA_SIZE`] when the variable is absent. An ill-formed
/// value is a fatal configuration error.
pub fn arena_size_from_env() -> Result<usize> {
    match env::var(AVAILABLE_MEM_VAR) {
        Err(_) => Ok(DEFAULT_ARENA_SIZE),
        Ok(value) => parse_mem_size(&value).ok_or_else(|| {
            Error::Config(format!(
                "Invalid settings in env: {}={}",
                AVAILABLE_MEM_VAR, value
            ))
        }),
    }
}

/// Parses a memory-size spec: a decimal number (fractions allowed) with
/// an optional `k`/`K`, `m`/`M` or `g`/`G` suffix (multipliers 1024,
/// 1024² and 1024³). No suffix means bytes.
pub fn parse_mem_size(spec: &str) -> Option<usize> {
    let spec = spec.trim();

    let (number, multiplier) = match spec.char_indices().last()? {
        (pos, 'k') | (pos, 'K') => (&spec[..pos], KIB),
        (pos, 'm') | (pos, 'M') => (&spec[..pos], MIB),
        (pos, 'g') | (pos, 'G') => (&spec[..pos], GIB),
        _ => (spec, 1),
    };

    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }

    let bytes = value * multiplier as f64;
    if bytes > usize::MAX as f64 {
        return None;
    }
    Some(bytes as usize)
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case("0", Some(0))]
    #[case("1024", Some(1024))]
    #[case("64k", Some(64 * KIB))]
    #[case("64K", Some(64 * KIB))]
    #[case("100m", Some(100 * MIB))]
    #[case("2G", Some(2 * GIB))]
    #[case("1.5k", Some(1536))]
    #[case(" 8m ", Some(8 * MIB))]
    #[case("", None)]
    #[case("k", None)]
    #[case("-1", None)]
    #[case("12q", None)]
    #[case("twelve", None)]
    fn test_parse_mem_size(#[case] spec: &str, #[case] expected: Option<usize>) {
        assert_eq!(parse_mem_size(spec), expected);
    }
}
