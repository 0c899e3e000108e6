use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::cli::Serve;

/// How `k`, `m` and `g` suffixes scale the requested magnitude.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum UnitConvention {
    #[default]
    Binary,
    Decimal,
}

impl UnitConvention {
    pub fn from_decimal_flag(decimal: bool) -> Self {
        if decimal {
            UnitConvention::Decimal
        } else {
            UnitConvention::Binary
        }
    }

    fn base(self) -> u64 {
        match self {
            UnitConvention::Binary => 1024,
            UnitConvention::Decimal => 1000,
        }
    }

    pub fn multiplier(self, unit: Option<char>) -> Option<u64> {
        let base = self.base();
        match unit.map(|c| c.to_ascii_lowercase()) {
            None => Some(1),
            Some('k') => Some(base),
            Some('m') => Some(base * base),
            Some('g') => Some(base * base * base),
            Some(_) => None,
        }
    }

    pub fn megabyte(self) -> u64 {
        self.base() * self.base()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("minimum size {min} is above maximum size {max}")]
    InvertedBounds { min: u64, max: u64 },
    #[error("default size {default} is outside [{min}, {max}]")]
    DefaultOutOfBounds { default: u64, min: u64, max: u64 },
    #[error("chunk size must be non-zero")]
    ZeroChunk,
    #[error("chunk size {chunk} is above maximum size {max}")]
    ChunkTooLarge { chunk: usize, max: u64 },
    #[error("stream depth must be non-zero")]
    ZeroDepth,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub default_bytes: u64,
    pub chunk_bytes: usize,
    pub depth: usize,
    pub units: UnitConvention,
}

impl Default for Limits {
    fn default() -> Self {
        let units = UnitConvention::Binary;
        Self {
            min_bytes: units.megabyte(),
            max_bytes: 1000 * units.megabyte(),
            default_bytes: 100 * units.megabyte(),
            chunk_bytes: 64 * 1024,
            depth: 8,
            units,
        }
    }
}

impl Limits {
    pub fn from_serve(serve: &Serve) -> Result<Self, ConfigError> {
        let units = serve.units();
        let mb = units.megabyte();
        Self {
            min_bytes: serve.min_mb.saturating_mul(mb),
            max_bytes: serve.max_mb.saturating_mul(mb),
            default_bytes: serve.default_mb.saturating_mul(mb),
            chunk_bytes: serve.chunk_kb.saturating_mul(1024),
            depth: serve.depth,
            units,
        }
        .validated()
    }

    pub fn validated(self) -> Result<Self, ConfigError> {
        if self.min_bytes > self.max_bytes {
            return Err(ConfigError::InvertedBounds { min: self.min_bytes, max: self.max_bytes });
        }
        if !(self.min_bytes..=self.max_bytes).contains(&self.default_bytes) {
            return Err(ConfigError::DefaultOutOfBounds {
                default: self.default_bytes,
                min: self.min_bytes,
                max: self.max_bytes,
            });
        }
        if self.chunk_bytes == 0 {
            return Err(ConfigError::ZeroChunk);
        }
        if self.chunk_bytes as u64 > self.max_bytes {
            return Err(ConfigError::ChunkTooLarge { chunk: self.chunk_bytes, max: self.max_bytes });
        }
        if self.depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }
        Ok(self)
    }

    pub fn default_path(&self) -> String {
        let mb = self.units.megabyte();
        if self.default_bytes % mb == 0 {
            format!("/{}m", self.default_bytes / mb)
        } else {
            format!("/{}", self.default_bytes)
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeError {
    #[error("malformed size path: {0:?}")]
    Malformed(String),
    #[error("size out of range: {path:?} (allowed {min}..={max} bytes)")]
    OutOfRange { path: String, min: u64, max: u64 },
}

impl IntoResponse for SizeError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SizeRequest {
    bytes: u64,
}

impl SizeRequest {
    pub fn from_path(path: &str, limits: &Limits) -> Result<Self, SizeError> {
        let trimmed = path.trim_start_matches('/').trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(Self { bytes: limits.default_bytes });
        }

        let split = trimmed
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(trimmed.len());
        let (digits, suffix) = trimmed.split_at(split);

        let mut suffix_chars = suffix.chars();
        let unit = suffix_chars.next();
        if digits.is_empty() || suffix_chars.next().is_some() {
            return Err(SizeError::Malformed(trimmed.to_string()));
        }
        let multiplier = limits
            .units
            .multiplier(unit)
            .ok_or_else(|| SizeError::Malformed(trimmed.to_string()))?;

        let out_of_range = || SizeError::OutOfRange {
            path: trimmed.to_string(),
            min: limits.min_bytes,
            max: limits.max_bytes,
        };
        // Digit-only strings only fail to parse on overflow.
        let magnitude: u64 = digits.parse().map_err(|_| out_of_range())?;
        let bytes = magnitude.checked_mul(multiplier).ok_or_else(out_of_range)?;

        if bytes < limits.min_bytes || bytes > limits.max_bytes {
            return Err(out_of_range());
        }
        Ok(Self { bytes })
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn file_name(&self) -> String {
        format!("{}.bin", self.bytes)
    }
}
