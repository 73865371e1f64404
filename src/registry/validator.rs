// Structural validation (spec §4.4). Pure, free functions; no I/O, no
// dependency on the adapter or config loader beyond the values passed in.
// Grounded in the teacher's inline guard-clause style
// (`verification.rs`/`rate_limit.rs`) rather than the `validator` derive
// crate: these are cross-field/business checks, not per-field annotations.

use super::errors::RegistryError;
use super::model::{CreateTokenData, TokenRecord};

pub const DEFAULT_MAX_TOKEN_LEN: usize = 255;

/// `validateToken(s, maxLen)`.
pub fn validate_token(token: &str, max_len: usize) -> Result<(), RegistryError> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::Validation("token must not be blank".into()));
    }
    if token.chars().count() > max_len {
        return Err(RegistryError::Validation(format!(
            "token exceeds max length of {max_len}"
        )));
    }
    Ok(())
}

fn validate_identifier(name: &str, value: &str) -> Result<(), RegistryError> {
    let len = value.chars().count();
    if len == 0 || len > 255 {
        return Err(RegistryError::Validation(format!(
            "{name} must be 1..255 characters"
        )));
    }
    Ok(())
}

/// `validateCreateData({subject, deviceId})`.
pub fn validate_create_data(data: &CreateTokenData) -> Result<(), RegistryError> {
    validate_identifier("subject", &data.subject)?;
    validate_identifier("deviceId", &data.device_id)?;
    Ok(())
}

/// `validateRecord(r)` — presence and shape of all four canonical fields.
pub fn validate_record(record: &TokenRecord) -> Result<(), RegistryError> {
    validate_identifier("subject", &record.subject)?;
    validate_identifier("deviceId", &record.device_id)?;
    if record.issued_at <= 0 {
        return Err(RegistryError::Validation(
            "issuedAt must be a positive integer".into(),
        ));
    }
    Ok(())
}

/// Config shape checked by `validateConfig`; kept separate from
/// `RegistryConfig` so the validator has no dependency on the config
/// loader and can be exercised with bare values in tests.
pub struct ConfigRanges {
    pub ttl_secs: u64,
    pub used_token_ttl_secs: u64,
}

const MAX_TTL_SECS: u64 = 365 * 24 * 3600;
const MAX_USED_TOKEN_TTL_SECS: u64 = 3600;

/// `validateConfig(cfg)`.
pub fn validate_config(ranges: &ConfigRanges) -> Result<(), RegistryError> {
    if ranges.ttl_secs < 1 || ranges.ttl_secs > MAX_TTL_SECS {
        return Err(RegistryError::Configuration(format!(
            "ttl must be in [1, {MAX_TTL_SECS}]"
        )));
    }
    if ranges.used_token_ttl_secs < 1 || ranges.used_token_ttl_secs > MAX_USED_TOKEN_TTL_SECS {
        return Err(RegistryError::Configuration(format!(
            "usedTokenTtl must be in [1, {MAX_USED_TOKEN_TTL_SECS}]"
        )));
    }
    Ok(())
}

/// Outcome of `validateBatch`: entries that failed structural validation
/// are silently dropped from `survivors`; the cap violation is the only
/// hard error.
pub struct BatchValidationResult<T> {
    pub survivors: Vec<T>,
    pub dropped: usize,
}

/// `validateBatch(batch, maxBatch, maxLen)`.
pub fn validate_batch<T>(
    batch: Vec<T>,
    max_batch: usize,
    max_len: usize,
    token_of: impl Fn(&T) -> &str,
) -> Result<BatchValidationResult<T>, RegistryError> {
    if batch.len() > max_batch {
        return Err(RegistryError::Validation(format!(
            "batch of {} exceeds cap of {max_batch}",
            batch.len()
        )));
    }
    let mut survivors = Vec::with_capacity(batch.len());
    let mut dropped = 0;
    for item in batch {
        if validate_token(token_of(&item), max_len).is_ok() {
            survivors.push(item);
        } else {
            dropped += 1;
        }
    }
    Ok(BatchValidationResult { survivors, dropped })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_and_oversized_tokens() {
        assert!(validate_token("   ", 255).is_err());
        assert!(validate_token(&"a".repeat(256), 255).is_err());
        assert!(validate_token("abc", 255).is_ok());
    }

    #[test]
    fn create_data_requires_both_fields() {
        let ok = CreateTokenData {
            subject: "u1".into(),
            device_id: "d1".into(),
            meta: None,
        };
        assert!(validate_create_data(&ok).is_ok());

        let bad = CreateTokenData {
            subject: String::new(),
            device_id: "d1".into(),
            meta: None,
        };
        assert!(validate_create_data(&bad).is_err());
    }

    #[test]
    fn config_rejects_out_of_range_ttls() {
        assert!(validate_config(&ConfigRanges {
            ttl_secs: 0,
            used_token_ttl_secs: 300,
        })
        .is_err());
        assert!(validate_config(&ConfigRanges {
            ttl_secs: 604800,
            used_token_ttl_secs: 4000,
        })
        .is_err());
        assert!(validate_config(&ConfigRanges {
            ttl_secs: 604800,
            used_token_ttl_secs: 300,
        })
        .is_ok());
    }

    #[test]
    fn batch_drops_bad_entries_but_counts_cap_as_hard_error() {
        let batch = vec!["good".to_string(), "".to_string(), "also-good".to_string()];
        let result = validate_batch(batch, 10, 255, |s| s.as_str()).unwrap();
        assert_eq!(result.survivors.len(), 2);
        assert_eq!(result.dropped, 1);

        let oversized: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        assert!(validate_batch(oversized, 3, 255, |s| s.as_str()).is_err());
    }
}
