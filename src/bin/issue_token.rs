//! Print a connection token for a user id.
//!
//! Usage: `issue-token <user-uuid>`. Reads `JWT_SECRET` and `TOKEN_TTL_HOURS`
//! from the environment (or `.env`) the same way the relay does.

use anyhow::{bail, Context, Result};
use chat_relay::auth::{ttl_from_hours, HmacTokenVerifier};
use uuid::Uuid;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let Some(raw) = std::env::args().nth(1) else {
        bail!("usage: issue-token <user-uuid>");
    };
    let user_id = Uuid::parse_str(&raw).with_context(|| format!("invalid user id: {raw}"))?;

    let secret = std::env::var("JWT_SECRET").context("JWT_SECRET missing")?;
    if secret.is_empty() {
        bail!("JWT_SECRET must not be empty");
    }
    let ttl_hours: u64 = match std::env::var("TOKEN_TTL_HOURS") {
        Ok(v) => v.parse().context("TOKEN_TTL_HOURS must be a number")?,
        Err(_) => 72,
    };

    let ttl = ttl_from_hours(ttl_hours).context("TOKEN_TTL_HOURS is too large")?;

    let verifier = HmacTokenVerifier::new(secret, ttl);
    println!("{}", verifier.issue(user_id));
    Ok(())
}
