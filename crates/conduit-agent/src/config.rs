//! Agent configuration, read from the command line or the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

/// Raw agent settings. Every flag has an environment variable fallback.
#[derive(Parser, Debug, Clone)]
#[command(name = "conduit-agent")]
#[command(
    version,
    about = "Conduit agent - bridges a game server's management endpoint to the relay"
)]
pub struct AgentArgs {
    /// Relay agent socket URL (e.g. "wss://relay.example.com/agent/connect").
    #[arg(long, env = "CONDUIT_API_WS")]
    pub control_url: Option<String>,

    /// Token identifying this agent's server to the relay.
    #[arg(long, env = "CONDUIT_AGENT_TOKEN", hide_env_values = true)]
    pub control_token: Option<String>,

    /// Management endpoint socket URL.
    #[arg(long, env = "MC_MGMT_WS")]
    pub endpoint_url: Option<String>,

    /// Bearer token for the management endpoint.
    #[arg(long, env = "MC_MGMT_TOKEN", hide_env_values = true)]
    pub endpoint_token: Option<String>,

    /// Endpoint TLS verification: strict|verify|on|default or skip|insecure|disabled|off.
    #[arg(long, env = "MC_TLS_MODE")]
    pub tls_mode: Option<String>,

    /// Skip endpoint certificate verification (true|1|yes). Overridden by --tls-mode.
    #[arg(long, env = "MC_TLS_INSECURE")]
    pub tls_insecure: Option<String>,

    /// PEM file with the CA that signed the endpoint's certificate.
    #[arg(long, env = "MC_TLS_ROOT_CA")]
    pub tls_root_ca: Option<PathBuf>,

    /// Name to verify the endpoint certificate against instead of the URL host.
    #[arg(long, env = "MC_TLS_SERVER_NAME")]
    pub tls_server_name: Option<String>,

    /// Deadline for connecting to either side, including the TLS handshake.
    #[arg(long, env = "MC_TLS_HANDSHAKE_TIMEOUT", default_value = "15s", value_parser = parse_duration)]
    pub handshake_timeout: Duration,

    #[arg(long, env = "AGENT_BACKOFF_INITIAL", default_value = "1s", value_parser = parse_duration)]
    pub backoff_initial: Duration,

    #[arg(long, env = "AGENT_BACKOFF_MAX", default_value = "30s", value_parser = parse_duration)]
    pub backoff_max: Duration,

    #[arg(long, env = "AGENT_BACKOFF_MULTIPLIER", default_value_t = 2.0)]
    pub backoff_multiplier: f64,

    /// Upper bound of the random delay added to each backoff.
    #[arg(long, env = "AGENT_BACKOFF_JITTER", default_value = "500ms", value_parser = parse_duration)]
    pub backoff_jitter: Duration,

    /// A bridge that stayed up this long resets the backoff after it fails.
    #[arg(long, env = "AGENT_STABLE_AFTER", default_value = "60s", value_parser = parse_duration)]
    pub stable_after: Duration,

    #[arg(long, env = "AGENT_TELEMETRY_INTERVAL", default_value = "1m", value_parser = parse_duration)]
    pub telemetry_interval: Duration,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    pub log_json: bool,
}

/// One side of the bridge: where to dial and which bearer token to present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub url: String,
    pub token: String,
}

/// TLS settings for the management endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// Accept any certificate. Logged loudly on every dial.
    pub insecure: bool,
    pub root_ca: Option<PathBuf>,
    pub server_name: Option<String>,
}

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Upper bound (exclusive) of the random delay added to each wait.
    pub jitter: Duration,
    /// Bridging for longer than this before failing resets the delay.
    pub stable_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: Duration::from_millis(500),
            stable_after: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Apply the normalisation rules: a zero initial delay becomes one
    /// second, a cap below the initial delay is raised to it, and a
    /// multiplier that is not finite or under 1.1 becomes 2.0.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.initial_delay.is_zero() {
            self.initial_delay = Duration::from_secs(1);
        }
        if self.max_delay < self.initial_delay {
            self.max_delay = self.initial_delay;
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.1 {
            self.multiplier = 2.0;
        }
        self
    }
}

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub control: Peer,
    pub endpoint: Peer,
    pub tls: TlsSettings,
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub telemetry_interval: Duration,
}

impl AgentConfig {
    /// Validate and normalise raw arguments.
    pub fn from_args(args: &AgentArgs) -> Result<Self, ConfigError> {
        let required = [
            ("CONDUIT_API_WS", &args.control_url),
            ("CONDUIT_AGENT_TOKEN", &args.control_token),
            ("MC_MGMT_WS", &args.endpoint_url),
            ("MC_MGMT_TOKEN", &args.endpoint_token),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| trimmed(value.as_deref()).is_none())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing.join(", ")));
        }
        let value = |v: &Option<String>| trimmed(v.as_deref()).unwrap_or_default().to_string();

        let mut insecure = trimmed(args.tls_insecure.as_deref())
            .is_some_and(|raw| matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes"));
        if let Some(mode) = trimmed(args.tls_mode.as_deref()) {
            insecure = parse_tls_mode(mode)?;
        }

        Ok(Self {
            control: Peer {
                url: value(&args.control_url),
                token: value(&args.control_token),
            },
            endpoint: Peer {
                url: value(&args.endpoint_url),
                token: value(&args.endpoint_token),
            },
            tls: TlsSettings {
                insecure,
                root_ca: args
                    .tls_root_ca
                    .clone()
                    .filter(|p| !p.as_os_str().is_empty()),
                server_name: trimmed(args.tls_server_name.as_deref()).map(str::to_string),
            },
            handshake_timeout: if args.handshake_timeout.is_zero() {
                Duration::from_secs(15)
            } else {
                args.handshake_timeout
            },
            reconnect: ReconnectPolicy {
                initial_delay: args.backoff_initial,
                max_delay: args.backoff_max,
                multiplier: args.backoff_multiplier,
                jitter: args.backoff_jitter,
                stable_after: args.stable_after,
            }
            .normalized(),
            telemetry_interval: if args.telemetry_interval.is_zero() {
                Duration::from_secs(60)
            } else {
                args.telemetry_interval
            },
        })
    }

    /// Whether the endpoint is reached over TLS.
    pub fn endpoint_uses_tls(&self) -> bool {
        self.endpoint.url.to_ascii_lowercase().starts_with("wss://")
    }
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// `true` when the mode disables verification.
fn parse_tls_mode(raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "skip" | "insecure" | "disabled" | "off" => Ok(true),
        "strict" | "verify" | "on" | "default" => Ok(false),
        _ => Err(ConfigError::InvalidTlsMode(raw.to_string())),
    }
}

/// Parse `500ms`, `1.5s`, `2m`, `1h` or a bare number of seconds.
///
/// Negative values clamp to zero.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {raw:?}"))?;
    let seconds = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit {other:?} in {raw:?}")),
    };
    Duration::try_from_secs_f64(seconds.max(0.0))
        .map_err(|_| format!("duration {raw:?} is out of range"))
}
