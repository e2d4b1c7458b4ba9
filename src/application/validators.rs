use crate::app_error::{AppError, AppResult};

/// Validates an ISO 4217 style currency code.
/// Rules:
/// - Exactly 3 characters
/// - ASCII letters only, any case
pub fn is_valid_currency_code(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic())
}

/// Trims and lower-cases a currency code, the form it is stored in.
pub fn normalize_currency(raw: &str) -> AppResult<String> {
    let code = raw.trim();
    if !is_valid_currency_code(code) {
        return Err(AppError::InvalidInput(format!("invalid currency: {raw}")));
    }
    Ok(code.to_ascii_lowercase())
}

/// Metadata keys must be non-blank and at most 64 characters.
pub fn is_valid_metadata_key(key: &str) -> bool {
    !key.trim().is_empty() && key.chars().count() <= 64
}

pub fn validate_metadata<'a>(keys: impl IntoIterator<Item = &'a String>) -> AppResult<()> {
    match keys.into_iter().find(|k| !is_valid_metadata_key(k)) {
        Some(bad) => Err(AppError::InvalidInput(format!(
            "invalid metadata key: {bad:?}"
        ))),
        None => Ok(()),
    }
}

/// Wallet config is opaque, but it has to be a JSON object.
pub fn validate_wallet_config(config: &serde_json::Value) -> AppResult<()> {
    if !config.is_object() {
        return Err(AppError::InvalidInput(
            "wallet config must be a JSON object".into(),
        ));
    }
    Ok(())
}
