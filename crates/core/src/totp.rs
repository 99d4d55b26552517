//! Time-based one-time passcodes (RFC 6238) and reservation bookkeeping.
//!
//! Code generation is pure; the exclusive reservation of a code lives in the
//! shared store under [`reservation_key`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;

use crate::error::CoreError;
use crate::types::{BatchId, Timestamp};

/// Default time-step length in seconds.
pub const DEFAULT_PERIOD_SECS: u64 = 30;

/// Default number of digits in a code.
pub const DEFAULT_DIGITS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TotpAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl FromStr for TotpAlgorithm {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            other => Err(CoreError::Validation(format!(
                "Unsupported TOTP algorithm '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotpParams {
    pub period_secs: u64,
    pub digits: u32,
    pub algorithm: TotpAlgorithm,
}

impl Default for TotpParams {
    fn default() -> Self {
        Self {
            period_secs: DEFAULT_PERIOD_SECS,
            digits: DEFAULT_DIGITS,
            algorithm: TotpAlgorithm::Sha1,
        }
    }
}

impl TotpParams {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Shared secret for one provider. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct TotpSecret(Vec<u8>);

impl TotpSecret {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse an RFC 4648 base32 secret. Whitespace, dashes and padding are
    /// ignored and the alphabet is case-insensitive.
    pub fn from_base32(encoded: &str) -> Result<Self, CoreError> {
        let bytes = base32::decode(encoded)?;
        if bytes.is_empty() {
            return Err(CoreError::Validation("TOTP secret is empty".to_string()));
        }
        Ok(Self(bytes))
    }
}

impl fmt::Debug for TotpSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TotpSecret(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// Time steps
// ---------------------------------------------------------------------------

/// Time-step counter for a point in time.
pub fn time_step(at: Timestamp, period_secs: u64) -> u64 {
    let secs = at.timestamp().max(0) as u64;
    secs / period_secs.max(1)
}

/// How long the code for the step containing `at` stays valid.
pub fn remaining_validity(at: Timestamp, period_secs: u64) -> Duration {
    let period_ms = period_secs.max(1) * 1000;
    let now_ms = at.timestamp_millis().max(0) as u64;
    Duration::from_millis(period_ms - now_ms % period_ms)
}

/// HOTP value for `step` (RFC 4226 dynamic truncation), zero-padded.
pub fn generate_code(secret: &TotpSecret, step: u64, params: &TotpParams) -> Result<String, CoreError> {
    let message = step.to_be_bytes();
    let digest = match params.algorithm {
        TotpAlgorithm::Sha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(&secret.0)
                .map_err(|e| CoreError::Internal(format!("HMAC key rejected: {e}")))?;
            mac.update(&message);
            mac.finalize().into_bytes().to_vec()
        }
        TotpAlgorithm::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(&secret.0)
                .map_err(|e| CoreError::Internal(format!("HMAC key rejected: {e}")))?;
            mac.update(&message);
            mac.finalize().into_bytes().to_vec()
        }
    };

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((u32::from(digest[offset]) & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);
    let modulus = 10u64.pow(params.digits);
    let value = u64::from(binary) % modulus;
    Ok(format!("{value:0width$}", width = params.digits as usize))
}

/// Code valid at `at`.
pub fn code_at(secret: &TotpSecret, at: Timestamp, params: &TotpParams) -> Result<String, CoreError> {
    generate_code(secret, time_step(at, params.period_secs), params)
}

// ---------------------------------------------------------------------------
// Reservations
// ---------------------------------------------------------------------------

pub fn reservation_key(provider: &str, code: &str) -> String {
    format!("totp:used:{provider}:{code}")
}

/// Value stored under [`reservation_key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotpReservation {
    pub owner_batch_id: BatchId,
    pub reserved_at: Timestamp,
}

/// How long a reservation blocks its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReservationTtlPolicy {
    /// Remaining validity of the current step plus one full step.
    #[default]
    NextWindow,
    /// A fixed TTL, never shorter than the remaining validity.
    Fixed(Duration),
}

impl ReservationTtlPolicy {
    pub fn ttl(&self, remaining: Duration, period: Duration) -> Duration {
        match self {
            ReservationTtlPolicy::NextWindow => remaining + period,
            ReservationTtlPolicy::Fixed(ttl) => (*ttl).max(remaining),
        }
    }
}

impl FromStr for ReservationTtlPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "next-window" {
            return Ok(Self::NextWindow);
        }
        s.parse::<u64>()
            .map(|secs| Self::Fixed(Duration::from_secs(secs)))
            .map_err(|_| {
                CoreError::Validation(format!(
                    "TOTP reservation TTL must be 'next-window' or seconds, got '{s}'"
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotpCounter {
    Generated,
    Consumed,
    Successful,
}

impl TotpCounter {
    pub const ALL: [TotpCounter; 3] = [
        TotpCounter::Generated,
        TotpCounter::Consumed,
        TotpCounter::Successful,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TotpCounter::Generated => "generated",
            TotpCounter::Consumed => "consumed",
            TotpCounter::Successful => "successful",
        }
    }
}

pub fn metrics_key(provider: &str, counter: TotpCounter) -> String {
    format!("totp:metrics:{provider}:{}", counter.as_str())
}

/// Per-provider TOTP counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotpMetrics {
    pub provider: String,
    pub generated: u64,
    pub consumed: u64,
    pub successful: u64,
}

impl TotpMetrics {
    pub fn failed(&self) -> u64 {
        self.consumed.saturating_sub(self.successful)
    }

    /// Successful share of consumed codes in percent.
    pub fn success_rate(&self) -> f64 {
        if self.consumed == 0 {
            return 0.0;
        }
        self.successful as f64 / self.consumed as f64 * 100.0
    }
}

// ---------------------------------------------------------------------------
// base32 decoding helper (no extra dep)
// ---------------------------------------------------------------------------

mod base32 {
    use crate::error::CoreError;

    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    pub fn decode(input: &str) -> Result<Vec<u8>, CoreError> {
        let mut out = Vec::with_capacity(input.len() * 5 / 8);
        let mut buffer: u64 = 0;
        let mut bits = 0u32;

        for ch in input.chars() {
            if ch.is_whitespace() || ch == '-' || ch == '=' {
                continue;
            }
            let upper = ch.to_ascii_uppercase() as u8;
            let value = ALPHABET
                .iter()
                .position(|&c| c == upper)
                .ok_or_else(|| CoreError::Validation(format!("Invalid base32 character '{ch}'")))?;
            buffer = (buffer << 5) | value as u64;
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                out.push((buffer >> bits) as u8);
                buffer &= (1 << bits) - 1;
            }
        }
        Ok(out)
    }
}
