//! Process bootstrap configuration: CLI flags (`clap`) with environment
//! fallback, producing a single immutable [`Config`] threaded through
//! `bootstrap()`. Generalizes the host's env-var-driven feature toggles
//! (`std::env::set_var`/`var` in the host's `lib.rs`) into a typed struct
//! validated once at startup instead of read ad-hoc.

use clap::Parser;
use nostr_sdk::prelude::*;
use std::path::PathBuf;

use crate::support::SupportPolicy;
use crate::util::validate_relay_urls;

#[derive(Parser, Debug, Clone)]
#[command(name = "pidgeon", about = "Privacy-preserving scheduled-publishing DVM for Nostr")]
pub struct Cli {
    /// Hex secret key or nsec. Falls back to DVM_SECRET.
    #[arg(long, env = "DVM_SECRET")]
    pub secret: Option<String>,

    #[arg(long, env = "DVM_NAME", default_value = "Pidgeon")]
    pub name: String,

    #[arg(long, env = "DVM_ABOUT", default_value = "Schedule Nostr notes, reposts and DMs for future publish.")]
    pub about: String,

    #[arg(long, env = "DVM_PICTURE", default_value = "")]
    pub picture: String,

    /// Relay(s) the DVM listens on for inbound requests. Repeatable.
    #[arg(long = "relay", env = "DVM_RELAYS", value_delimiter = ',')]
    pub relays: Vec<String>,

    /// Relay(s) used to probe/resolve repost targets. Repeatable.
    #[arg(long = "indexer-relay", env = "INDEXER_RELAYS", value_delimiter = ',')]
    pub indexer_relays: Vec<String>,

    /// Default publish targets when a request provides none. Repeatable.
    #[arg(long = "publish-relay", env = "DVM_PUBLISH_RELAYS", value_delimiter = ',')]
    pub publish_relays: Vec<String>,

    /// Allows localhost/private relay targets (for local load-testing only).
    #[arg(long, env = "DVM_LOADTEST", default_value_t = false)]
    pub loadtest: bool,

    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "MAILBOX_DEBOUNCE_MS", default_value_t = 500)]
    pub mailbox_debounce_ms: u64,

    #[arg(long, env = "MAILBOX_FLUSH_WORKERS", default_value_t = 1)]
    pub mailbox_flush_workers: usize,

    #[arg(long, env = "MAILBOX_RETRY_MAX_MS", default_value_t = 10_000)]
    pub mailbox_retry_max_ms: u64,

    #[arg(long, env = "MAILBOX_PUBLISH_CONCURRENCY", default_value_t = 4)]
    pub mailbox_publish_concurrency: usize,

    #[arg(long, env = "DVM_REQUEST_CONCURRENCY", default_value_t = 4)]
    pub request_concurrency: usize,

    #[arg(long, env = "DVM_MAX_PUBLISH_RELAYS", default_value_t = 20)]
    pub max_publish_relays: usize,

    #[arg(long, env = "DVM_SUPPORT_HORIZON_DAYS", default_value_t = 0)]
    pub support_horizon_days: i64,

    #[arg(long, env = "DVM_SUPPORT_WINDOW_SCHEDULES", default_value_t = 10)]
    pub support_window_schedules: u64,

    /// Comma-separated feature names gated regardless of horizon (e.g. "dm17,quote").
    #[arg(long, env = "DVM_SUPPORT_GATED_FEATURES", value_delimiter = ',')]
    pub support_gated_features: Vec<String>,

    #[arg(long, env = "DVM_SUPPORT_LUD16", default_value = "")]
    pub support_lud16: String,

    #[arg(long, env = "DVM_SUPPORT_MESSAGE", default_value = "Support Pidgeon to keep scheduling notes")]
    pub support_message: String,

    /// "lnurl_verify" or "disabled".
    #[arg(long, env = "DVM_SUPPORT_PAYMENT_MODE", default_value = "disabled")]
    pub support_payment_mode: String,

    #[arg(long, env = "DVM_SUPPORT_INVOICE_SATS", default_value_t = 1000)]
    pub support_invoice_sats: u64,

    #[arg(long, env = "DVM_SUPPORT_MIN_SATS", default_value_t = 1000)]
    pub support_min_sats: u64,

    #[arg(long, env = "DVM_SUPPORT_SUPPORTER_DAYS", default_value_t = 30)]
    pub support_supporter_days: i64,

    #[arg(long, env = "DVM_SUPPORT_INVOICE_TTL_SEC", default_value_t = 900)]
    pub support_invoice_ttl_sec: u64,

    #[arg(long, env = "DVM_SUPPORT_VERIFY_POLL_SEC", default_value_t = 30)]
    pub support_verify_poll_sec: u64,

    #[arg(long, env = "DVM_SUPPORT_VERIFY_TIMEOUT_MS", default_value_t = 5000)]
    pub support_verify_timeout_ms: u64,
}

/// Resolved, validated process configuration. Immutable after `bootstrap()`.
#[derive(Debug, Clone)]
pub struct Config {
    pub secret: Option<String>,
    pub name: String,
    pub about: String,
    pub picture: String,
    pub relays: Vec<String>,
    pub indexer_relays: Vec<String>,
    pub publish_relays: Vec<String>,
    pub loadtest: bool,
    pub data_dir: PathBuf,
    pub mailbox_debounce_ms: u64,
    pub mailbox_flush_workers: usize,
    pub mailbox_retry_max_ms: u64,
    pub mailbox_publish_concurrency: usize,
    pub request_concurrency: usize,
    pub max_publish_relays: usize,
    pub support: SupportPolicy,
}

impl Config {
    /// Parse CLI + environment, validate, and produce an immutable `Config`.
    /// Returns `Err` (exit code 1 per the CLI contract) on any bad input.
    pub fn from_args_and_env() -> Result<Config, String> {
        let cli = Cli::parse();

        if cli.relays.is_empty() {
            return Err("at least one --relay/DVM_RELAYS is required".to_string());
        }

        let relays = validate_relay_urls(&cli.relays, cli.loadtest);
        if relays.is_empty() {
            return Err("no valid DVM relays after validation".to_string());
        }
        let indexer_relays = validate_relay_urls(&cli.indexer_relays, cli.loadtest);
        let publish_relays = validate_relay_urls(&cli.publish_relays, cli.loadtest);

        if !cli.picture.is_empty() && Url::parse(&cli.picture).is_err() {
            return Err(format!("invalid --picture URL: {}", cli.picture));
        }

        let payment_mode = match cli.support_payment_mode.as_str() {
            "lnurl_verify" | "disabled" => cli.support_payment_mode.clone(),
            other => return Err(format!("unknown --support-payment-mode: {}", other)),
        };

        let gated_features = cli
            .support_gated_features
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let support = SupportPolicy {
            horizon_days: cli.support_horizon_days,
            window_schedules: cli.support_window_schedules,
            gated_features,
            lud16: cli.support_lud16,
            cta_message: cli.support_message,
            payment_mode,
            invoice_sats: cli.support_invoice_sats,
            min_sats: cli.support_min_sats,
            supporter_days: cli.support_supporter_days,
            invoice_ttl_sec: cli.support_invoice_ttl_sec,
            verify_poll_sec: cli.support_verify_poll_sec,
            verify_timeout_ms: cli.support_verify_timeout_ms,
        };

        Ok(Config {
            secret: cli.secret,
            name: cli.name,
            about: cli.about,
            picture: cli.picture,
            relays,
            indexer_relays,
            publish_relays,
            loadtest: cli.loadtest,
            data_dir: cli.data_dir,
            mailbox_debounce_ms: cli.mailbox_debounce_ms,
            mailbox_flush_workers: cli.mailbox_flush_workers.max(1),
            mailbox_retry_max_ms: cli.mailbox_retry_max_ms,
            mailbox_publish_concurrency: cli.mailbox_publish_concurrency.max(1),
            request_concurrency: cli.request_concurrency.max(1),
            max_publish_relays: cli.max_publish_relays,
            support,
        })
    }
}
