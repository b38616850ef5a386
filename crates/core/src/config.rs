use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `NURTURE__`, e.g. `NURTURE__SCHEDULER__TOLERANCE_SECS`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub sendgrid: SendGridConfig,
    #[serde(default)]
    pub attribution: AttributionConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
    #[serde(default)]
    pub links: LinksConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "nurture-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    3001
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            scheduler: SchedulerConfig::default(),
            delivery: DeliveryConfig::default(),
            sendgrid: SendGridConfig::default(),
            attribution: AttributionConfig::default(),
            payment: PaymentConfig::default(),
            links: LinksConfig::default(),
        }
    }
}

// ─── Scheduler Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Grace period after a stage becomes due during which it may still fire.
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: u64,
    /// Uniform multiplier applied to every stage delay (test acceleration).
    #[serde(default = "default_delay_scale")]
    pub delay_scale: f64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_archive_after_days")]
    pub archive_after_days: i64,
    #[serde(default = "default_archive_interval_secs")]
    pub archive_interval_secs: u64,
}

fn default_scheduler_enabled() -> bool { true }
fn default_sweep_interval_secs() -> u64 { 15 * 60 }
fn default_tolerance_secs() -> u64 { 2 * 60 * 60 }
fn default_delay_scale() -> f64 { 1.0 }
fn default_max_concurrency() -> usize { 16 }
fn default_archive_after_days() -> i64 { 7 }
fn default_archive_interval_secs() -> u64 { 24 * 60 * 60 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            sweep_interval_secs: default_sweep_interval_secs(),
            tolerance_secs: default_tolerance_secs(),
            delay_scale: default_delay_scale(),
            max_concurrency: default_max_concurrency(),
            archive_after_days: default_archive_after_days(),
            archive_interval_secs: default_archive_interval_secs(),
        }
    }
}

// ─── Delivery Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// A claim older than this is treated as abandoned by a crashed send.
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: i64,
}

fn default_send_timeout_ms() -> u64 { 10_000 }
fn default_claim_ttl_secs() -> i64 { 120 }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            claim_ttl_secs: default_claim_ttl_secs(),
        }
    }
}

// ─── SendGrid Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SendGridConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_sendgrid_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_tracking")]
    pub open_tracking: bool,
    #[serde(default = "default_tracking")]
    pub click_tracking: bool,
}

fn default_from_email() -> String { "hello@nurture.local".to_string() }
fn default_from_name() -> String { "Nurture".to_string() }
fn default_sendgrid_base_url() -> String { "https://api.sendgrid.com".to_string() }
fn default_tracking() -> bool { true }

impl Default for SendGridConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            from_email: default_from_email(),
            from_name: default_from_name(),
            api_base_url: default_sendgrid_base_url(),
            open_tracking: default_tracking(),
            click_tracking: default_tracking(),
        }
    }
}

// ─── Attribution Config ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AttributionConfig {
    #[serde(default)]
    pub pixel_id: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_graph_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_graph_version")]
    pub api_version: String,
    #[serde(default)]
    pub test_event_code: Option<String>,
    #[serde(default = "default_attribution_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_action_source")]
    pub action_source: String,
    /// Repeats of the same (event, id) inside this window are not resent.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: i64,
}

fn default_graph_base_url() -> String { "https://graph.facebook.com".to_string() }
fn default_graph_version() -> String { "v19.0".to_string() }
fn default_attribution_timeout_ms() -> u64 { 5_000 }
fn default_action_source() -> String { "website".to_string() }
fn default_dedup_window_secs() -> i64 { 48 * 60 * 60 }

impl AttributionConfig {
    /// Both the pixel id and the access token are present and non-blank.
    pub fn is_configured(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.pixel_id) && present(&self.access_token)
    }
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            pixel_id: None,
            access_token: None,
            api_base_url: default_graph_base_url(),
            api_version: default_graph_version(),
            test_event_code: None,
            timeout_ms: default_attribution_timeout_ms(),
            action_source: default_action_source(),
            dedup_window_secs: default_dedup_window_secs(),
        }
    }
}

// ─── Payment Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_signature_tolerance_secs")]
    pub signature_tolerance_secs: i64,
    #[serde(default = "default_currency")]
    pub default_currency: String,
    /// How long after payment a replayed webhook may retry a lost confirmation.
    #[serde(default = "default_confirmation_retry_secs")]
    pub confirmation_retry_secs: i64,
}

fn default_signature_tolerance_secs() -> i64 { 300 }
fn default_confirmation_retry_secs() -> i64 { 24 * 60 * 60 }
fn default_currency() -> String { "USD".to_string() }

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            signature_tolerance_secs: default_signature_tolerance_secs(),
            default_currency: default_currency(),
            confirmation_retry_secs: default_confirmation_retry_secs(),
        }
    }
}

// ─── Links Config ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LinksConfig {
    /// Public web client, used for call-to-action links.
    #[serde(default = "default_app_url")]
    pub app_url: String,
    /// Public base URL of this service, used for unsubscribe links.
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_app_url() -> String { "http://localhost:3000".to_string() }
fn default_api_url() -> String { "http://localhost:3001".to_string() }

impl LinksConfig {
    pub fn unsubscribe_url(&self, session_id: &uuid::Uuid) -> String {
        format!(
            "{}/v1/unsubscribe?token={}",
            self.api_url.trim_end_matches('/'),
            session_id
        )
    }
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            app_url: default_app_url(),
            api_url: default_api_url(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("NURTURE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.tolerance_secs, 7200);
        assert_eq!(config.scheduler.sweep_interval_secs, 900);
        assert_eq!(config.delivery.send_timeout_ms, 10_000);
        assert!(!config.attribution.is_configured());
    }

    #[test]
    fn test_attribution_requires_both_credentials() {
        let mut attribution = AttributionConfig {
            pixel_id: Some("123".into()),
            ..Default::default()
        };
        assert!(!attribution.is_configured());
        attribution.access_token = Some("  ".into());
        assert!(!attribution.is_configured());
        attribution.access_token = Some("EAAB".into());
        assert!(attribution.is_configured());
    }

    #[test]
    fn test_unsubscribe_url() {
        let links = LinksConfig {
            app_url: "https://app.example".into(),
            api_url: "https://api.example/".into(),
        };
        let id = uuid::Uuid::nil();
        assert_eq!(
            links.unsubscribe_url(&id),
            "https://api.example/v1/unsubscribe?token=00000000-0000-0000-0000-000000000000"
        );
    }
}
