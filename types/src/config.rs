use core::{num::NonZeroU64, time::Duration};
use std::borrow::Cow;

use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use serde_with::{As, DurationMilliSeconds};
use thiserror::Error;

/// Network parameters and local limits of the blob sidecar subsystem.
///
/// Field names follow the upper case keys used in `config.yaml` files of public networks.
/// Missing keys take their value from [`Config::default`], which is the mainnet configuration.
#[expect(
    clippy::unsafe_derive_deserialize,
    reason = "A false positive triggered by `nonzero!`. \
              `Config` has no invariants checked at construction. \
              It is validated separately with `Config::validate`."
)]
#[expect(
    clippy::struct_field_names,
    reason = "config_name is the name used in configuration files"
)]
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    // Meta
    pub config_name: Cow<'static, str>,

    // Time parameters
    pub slots_per_epoch: NonZeroU64,

    // Networking
    pub min_epochs_for_blob_sidecars_requests: u64,
    pub max_request_blocks: u64,
    pub max_request_blob_sidecars: u64,
    pub max_chunk_size: usize,
    #[serde(with = "As::<DurationMilliSeconds<u64>>")]
    pub response_timeout: Duration,
    #[serde(with = "As::<DurationMilliSeconds<u64>>")]
    pub write_timeout: Duration,

    // Local limits
    #[serde(with = "As::<DurationMilliSeconds<u64>>")]
    pub response_pacing_interval: Duration,
    pub rate_limit_capacity: u64,
    pub rate_limit_refill_per_second: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Meta
            config_name: Cow::Borrowed("mainnet"),

            // Time parameters
            slots_per_epoch: nonzero!(32_u64),

            // Networking
            min_epochs_for_blob_sidecars_requests: 4096,
            max_request_blocks: 128,
            max_request_blob_sidecars: 768,
            max_chunk_size: 10_485_760,
            response_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),

            // Local limits
            response_pacing_interval: Duration::from_secs(1),
            rate_limit_capacity: 64 << 10,
            rate_limit_refill_per_second: 16 << 10,
        }
    }
}

impl Config {
    #[must_use]
    pub fn mainnet() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn minimal() -> Self {
        Self {
            // Meta
            config_name: Cow::Borrowed("minimal"),

            // Time parameters
            slots_per_epoch: nonzero!(8_u64),

            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.config_name.is_empty() {
            return Err(Error::NameEmpty);
        }

        for character in self.config_name.chars() {
            if !matches!(character, 'a'..='z' | '0'..='9' | '-') {
                return Err(Error::NameContainsIllegalCharacters);
            }
        }

        if self.max_request_blocks == 0 || self.max_request_blob_sidecars == 0 {
            return Err(Error::RequestLimitZero);
        }

        self.retention_window().map(|_| ())
    }

    /// Number of slots for which blob sidecars must be kept and served.
    ///
    /// Storage keys are bucketed by `slot % retention_window`, so this must stay the same for the
    /// lifetime of a database.
    pub fn retention_window(&self) -> Result<NonZeroU64, Error> {
        self.slots_per_epoch
            .checked_mul(
                NonZeroU64::new(self.min_epochs_for_blob_sidecars_requests)
                    .ok_or(Error::RetentionWindowZero)?,
            )
            .ok_or(Error::RetentionWindowOverflow)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration name is empty")]
    NameEmpty,
    #[error("configuration name contains illegal characters")]
    NameContainsIllegalCharacters,
    #[error("request limits must be greater than zero")]
    RequestLimitZero,
    #[error("retention window is zero")]
    RetentionWindowZero,
    #[error("retention window does not fit in 64 bits")]
    RetentionWindowOverflow,
}

#[expect(
    clippy::needless_pass_by_value,
    reason = "Refactoring worsens readability, which is more important in tests."
)]
