//! Runtime configuration, read once from the environment at startup.
//!
//! The coin policy numbers (deploy cost, daily claim, signup baselines) are
//! deliberately plain settings rather than code constants; they can be tuned
//! per deployment without touching the reconciler.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub http_port: u16,
    /// Root directory for the file-backed profile and bot stores.
    pub data_dir: String,
    /// The single account granted the admin console.
    pub admin_email: String,

    /// Base URL of the third-party deployment API.
    pub deploy_api_url: String,
    /// API key sent as a bearer token to the deployment API.
    pub deploy_api_key: String,
    /// URL of the serverless verification-email function.
    pub email_fn_url: String,
    /// Externally visible base URL, used to build verification links.
    pub public_url: String,

    /// Coins charged per bot deployment.
    pub deploy_cost: i64,
    /// Coins granted per daily claim.
    pub daily_claim_amount: i64,
    /// Minimum gap between two claims.
    pub claim_cooldown: Duration,
    /// Starting balance for an ordinary signup.
    pub signup_bonus: i64,
    /// Starting balance when the registrant presented a referral code.
    pub referral_bonus: i64,
    /// Length of a freshly generated shareable referral code.
    pub referral_code_len: usize,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            http_port: env_parse("HACKLINK_HTTP_PORT", 7979),
            data_dir: env_or("HACKLINK_DATA_DIR", "data"),
            admin_email: env_or("HACKLINK_ADMIN_EMAIL", "admin@hacklink.com"),
            deploy_api_url: env_or("HACKLINK_DEPLOY_API_URL", "http://localhost:9090"),
            deploy_api_key: env_or("HACKLINK_DEPLOY_API_KEY", ""),
            email_fn_url: env_or("HACKLINK_EMAIL_FN_URL", ""),
            public_url: env_or("HACKLINK_PUBLIC_URL", "http://localhost:7979"),
            deploy_cost: env_parse("HACKLINK_DEPLOY_COST", 10),
            daily_claim_amount: env_parse("HACKLINK_DAILY_CLAIM", 10),
            claim_cooldown: Duration::from_secs(env_parse("HACKLINK_CLAIM_COOLDOWN_SECS", 86_400)),
            signup_bonus: env_parse("HACKLINK_SIGNUP_BONUS", 10),
            referral_bonus: env_parse("HACKLINK_REFERRAL_BONUS", 20),
            referral_code_len: env_parse("HACKLINK_REFERRAL_CODE_LEN", 6),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let c = Config::from_env();
        assert_eq!(c.deploy_cost, 10);
        assert_eq!(c.daily_claim_amount, 10);
        assert_eq!(c.claim_cooldown.as_secs(), 86_400);
        assert_eq!(c.signup_bonus, 10);
        assert_eq!(c.referral_bonus, 20);
        assert_eq!(c.referral_code_len, 6);
    }
}
