use crate::auth::ttl_from_hours;
use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Per-connection WebSocket limits
///
/// `ping_period` must stay strictly below `pong_wait` so that a healthy
/// peer's read deadline is refreshed before it can lapse.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Time allowed for a single write (data or ping) to the peer
    pub write_wait: Duration,
    /// Time allowed between pongs before the peer is considered dead
    pub pong_wait: Duration,
    /// Heartbeat interval
    pub ping_period: Duration,
    /// Largest inbound application message accepted, in bytes
    pub max_message_bytes: usize,
    /// Capacity of each connection's outbound queue
    pub outbound_capacity: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            max_message_bytes: 512,
            outbound_capacity: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Name of the NOTIFY channel carrying `{room, id}` envelopes
    pub channel: String,
    /// Delay before resubscribing after the subscription fails
    pub retry_delay: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channel: "chat".to_string(),
            retry_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Upper bound on concurrent store-and-notify attempts
    pub max_in_flight: usize,
    /// Send a `message.failed` frame back to the sender when persisting fails
    pub report_failures: bool,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            report_failures: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub ws_port: u16,
    pub http_port: u16,
    pub token_secret: String,
    pub token_ttl: Duration,
    pub ws: WsConfig,
    pub listener: ListenerConfig,
    pub persist: PersistConfig,
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, AppError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw:?}"))),
        Err(_) => Ok(None),
    }
}

/// Channel names are interpolated into `LISTEN`, so only plain identifiers are allowed
fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;
        let token_secret = env::var("JWT_SECRET")
            .map_err(|_| AppError::Config("JWT_SECRET missing".into()))?;

        let ws_port = parse_env("WS_PORT")?.unwrap_or(8080);
        let http_port = parse_env("HTTP_PORT")?.unwrap_or(9090);
        let ttl_hours = parse_env::<u64>("TOKEN_TTL_HOURS")?.unwrap_or(72);
        let token_ttl = ttl_from_hours(ttl_hours)
            .ok_or_else(|| AppError::Config(format!("TOKEN_TTL_HOURS {ttl_hours} is too large")))?;

        let defaults = WsConfig::default();
        let pong_wait = parse_env("WS_PONG_WAIT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.pong_wait);
        let ws = WsConfig {
            write_wait: parse_env("WS_WRITE_WAIT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.write_wait),
            pong_wait,
            ping_period: parse_env("WS_PING_PERIOD_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(pong_wait * 9 / 10),
            max_message_bytes: parse_env("WS_MAX_MESSAGE_BYTES")?
                .unwrap_or(defaults.max_message_bytes),
            outbound_capacity: parse_env("WS_OUTBOUND_CAPACITY")?
                .unwrap_or(defaults.outbound_capacity),
        };

        let listener_defaults = ListenerConfig::default();
        let listener = ListenerConfig {
            channel: env::var("NOTIFY_CHANNEL").unwrap_or(listener_defaults.channel),
            retry_delay: parse_env("LISTENER_RETRY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(listener_defaults.retry_delay),
        };

        let persist_defaults = PersistConfig::default();
        let persist = PersistConfig {
            max_in_flight: parse_env("PERSIST_MAX_IN_FLIGHT")?
                .unwrap_or(persist_defaults.max_in_flight),
            report_failures: parse_env("PERSIST_REPORT_FAILURES")?
                .unwrap_or(persist_defaults.report_failures),
        };

        let config = Self {
            database_url,
            ws_port,
            http_port,
            token_secret,
            token_ttl,
            ws,
            listener,
            persist,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.token_secret.is_empty() {
            return Err(AppError::Config("JWT_SECRET must not be empty".into()));
        }
        if self.ws.ping_period >= self.ws.pong_wait {
            return Err(AppError::Config(format!(
                "ping period ({:?}) must be shorter than pong wait ({:?})",
                self.ws.ping_period, self.ws.pong_wait
            )));
        }
        if self.ws.ping_period.is_zero() || self.ws.write_wait.is_zero() {
            return Err(AppError::Config(
                "ping period and write wait must be non-zero".into(),
            ));
        }
        if self.ws.outbound_capacity == 0 || self.ws.max_message_bytes == 0 {
            return Err(AppError::Config(
                "outbound capacity and max message size must be non-zero".into(),
            ));
        }
        if self.persist.max_in_flight == 0 {
            return Err(AppError::Config(
                "PERSIST_MAX_IN_FLIGHT must be non-zero".into(),
            ));
        }
        if !is_plain_identifier(&self.listener.channel) {
            return Err(AppError::Config(format!(
                "NOTIFY_CHANNEL {:?} is not a plain identifier",
                self.listener.channel
            )));
        }
        Ok(())
    }
}
