//! `summarize_at` resolution.
//!
//! The value is either a share of the budget limit (`"80%"`) or an absolute
//! token count (`"60000"`).

use anyhow::{Result, bail};

/// Resolve `summarize_at` against `limit` into a token threshold.
pub fn resolve_threshold(summarize_at: &str, limit: u64) -> Result<u64> {
    let raw = summarize_at.trim();

    if let Some(share) = raw.strip_suffix('%') {
        let Ok(share) = share.trim().parse::<f64>() else {
            bail!("`{}` is not a percentage", raw);
        };
        // Also rejects NaN.
        if !(share > 0.0 && share <= 100.0) {
            bail!("percentage must be above 0 and at most 100, got {}", share);
        }
        return Ok((limit as f64 * share / 100.0) as u64);
    }

    match raw.parse::<u64>() {
        Ok(0) => bail!("threshold must be a positive token count"),
        Ok(tokens) => Ok(tokens),
        Err(_) => bail!("`{}` is neither a percentage nor a token count", raw),
    }
}
