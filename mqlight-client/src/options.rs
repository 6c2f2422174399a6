//! Client configuration and the options of the individual operations.
//!
//! `ClientOptions` can be built in code or loaded from a TOML file:
//!
//! ```toml
//! id = "client1"
//! user = "guest"
//! password = "guest"
//! connect_timeout_ms = 5000
//!
//! [retry]
//! initial_delay_ms = 1000
//! max_delay_ms = 60000
//! ```

use crate::client_error;
use crate::model::Qos;
use anyhow::{Context, Result};
use rand::Rng;
use serde_derive::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Maximum length of a client id.
pub const MAX_CLIENT_ID_LENGTH: usize = 256;

/// Reconnection policy of the connection manager.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Give up and stop the client after this many failed reconnection rounds. `None` retries
    /// forever.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next reconnection round, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let delay = self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms);

        Duration::from_millis(delay)
    }

    /// Delay with a random jitter of +-25%.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.75..1.25);

        self.base_delay(attempt).mul_f64(jitter)
    }
}

/// Options of a client.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientOptions {
    /// Identifier of the client, generated when it is not set.
    pub id: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Certificate (PEM) used for validating the server certificate.
    pub ssl_trust_certificate: Option<PathBuf>,
    pub ssl_client_certificate: Option<PathBuf>,
    pub ssl_client_key: Option<PathBuf>,
    pub ssl_client_key_passphrase: Option<String>,
    /// Key store holding both the trusted and the client certificates.
    pub ssl_keystore: Option<PathBuf>,
    pub ssl_keystore_passphrase: Option<String>,
    pub ssl_verify_name: bool,
    /// How long the constructor waits for the client to start. `None` waits forever.
    pub connect_timeout_ms: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            id: None,
            user: None,
            password: None,
            ssl_trust_certificate: None,
            ssl_client_certificate: None,
            ssl_client_key: None,
            ssl_client_key_passphrase: None,
            ssl_keystore: None,
            ssl_keystore_passphrase: None,
            ssl_verify_name: true,
            connect_timeout_ms: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// User name and password sent to the server.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials {{ user={}, password=**** }}", self.user)
    }
}

/// TLS related settings passed to the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityOptions {
    pub trust_certificate: Option<PathBuf>,
    pub client_certificate: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub client_key_passphrase: Option<String>,
    pub keystore: Option<PathBuf>,
    pub keystore_passphrase: Option<String>,
    pub verify_name: bool,
}

impl ClientOptions {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let cfg = std::fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;

        Self::from_toml_str(&cfg)
    }

    pub fn id(mut self, value: &str) -> Self {
        self.id = Some(value.to_owned());
        self
    }

    pub fn credentials(mut self, user: &str, password: &str) -> Self {
        self.user = Some(user.to_owned());
        self.password = Some(password.to_owned());
        self
    }

    pub fn connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout_ms = Some(value.as_millis() as u64);
        self
    }

    pub fn retry(mut self, value: RetryPolicy) -> Self {
        self.retry = value;
        self
    }

    pub(crate) fn connect_timeout_duration(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Validate the options and return the client id (generating one if needed).
    pub(crate) fn client_id(&self) -> Result<String> {
        match &self.id {
            Some(id) => {
                validate_client_id(id)?;
                Ok(id.clone())
            }
            None => Ok(generate_client_id()),
        }
    }

    pub(crate) fn credentials_pair(&self) -> Result<Option<Credentials>> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Ok(Some(Credentials {
                user: user.clone(),
                password: password.clone(),
            })),
            (None, None) => Ok(None),
            (Some(_), None) => client_error!(Argument, "user name is supplied without a password"),
            (None, Some(_)) => client_error!(Argument, "password is supplied without a user name"),
        }
    }

    pub(crate) fn security(&self) -> Result<SecurityOptions> {
        if self.ssl_keystore.is_some()
            && (self.ssl_trust_certificate.is_some()
                || self.ssl_client_certificate.is_some()
                || self.ssl_client_key.is_some()
                || self.ssl_client_key_passphrase.is_some())
        {
            return client_error!(
                Argument,
                "ssl_keystore cannot be combined with the trust certificate or client certificate options"
            );
        }

        if self.ssl_keystore_passphrase.is_some() && self.ssl_keystore.is_none() {
            return client_error!(Argument, "ssl_keystore_passphrase is supplied without ssl_keystore");
        }

        let client_group = [
            self.ssl_client_certificate.is_some(),
            self.ssl_client_key.is_some(),
            self.ssl_client_key_passphrase.is_some(),
        ];

        if client_group.iter().any(|v| *v) && !client_group.iter().all(|v| *v) {
            return client_error!(
                Argument,
                "ssl_client_certificate, ssl_client_key and ssl_client_key_passphrase must be supplied together"
            );
        }

        let files = [
            ("ssl_trust_certificate", &self.ssl_trust_certificate),
            ("ssl_client_certificate", &self.ssl_client_certificate),
            ("ssl_client_key", &self.ssl_client_key),
            ("ssl_keystore", &self.ssl_keystore),
        ];

        for (name, path) in files {
            if let Some(path) = path {
                if !path.is_file() {
                    return client_error!(Argument, format!("{} {} is not a file", name, path.display()));
                }
            }
        }

        Ok(SecurityOptions {
            trust_certificate: self.ssl_trust_certificate.clone(),
            client_certificate: self.ssl_client_certificate.clone(),
            client_key: self.ssl_client_key.clone(),
            client_key_passphrase: self.ssl_client_key_passphrase.clone(),
            keystore: self.ssl_keystore.clone(),
            keystore_passphrase: self.ssl_keystore_passphrase.clone(),
            verify_name: self.ssl_verify_name,
        })
    }
}

/// Check the length and the character set of a client id.
pub fn validate_client_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return client_error!(Argument, "client id cannot be empty");
    }

    if id.len() > MAX_CLIENT_ID_LENGTH {
        return client_error!(
            Argument,
            format!("client id is longer than {} characters", MAX_CLIENT_ID_LENGTH)
        );
    }

    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '%' | '/' | '.' | '_')))
    {
        return client_error!(Argument, format!("client id {} contains invalid character {:?}", id, c));
    }

    Ok(())
}

fn generate_client_id() -> String {
    format!("AUTO_{:07x}", rand::thread_rng().gen_range(0..0x1000_0000u32))
}

/// Parse and check the service URLs. Only `amqp` and `amqps` are supported, credentials
/// embedded in a URL must match the ones in the options.
pub(crate) fn parse_services<I, S>(services: I, credentials: Option<&Credentials>) -> Result<Vec<Url>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut result = vec![];

    for service in services {
        let service = service.as_ref();
        let url = match Url::parse(service) {
            Ok(url) => url,
            Err(e) => return client_error!(Argument, format!("invalid service {}: {}", service, e)),
        };

        match url.scheme() {
            "amqp" | "amqps" => (),
            other => return client_error!(Unsupported, format!("unsupported service scheme {}", other)),
        }

        if url.host_str().map_or(true, str::is_empty) {
            return client_error!(Argument, format!("service {} has no host", service));
        }

        if !(url.path().is_empty() || url.path() == "/") {
            return client_error!(Argument, format!("service {} cannot have a path", service));
        }

        if !url.username().is_empty() || url.password().is_some() {
            let embedded = Credentials {
                user: url.username().to_owned(),
                password: url.password().unwrap_or_default().to_owned(),
            };

            match credentials {
                Some(c) if *c != embedded => {
                    return client_error!(Argument, format!("credentials of service {} do not match", service));
                }
                _ => (),
            }
        }

        result.push(url);
    }

    if result.is_empty() {
        return client_error!(Argument, "service list is empty");
    }

    Ok(result)
}

/// Credentials used for a service: the ones from the options, or the ones embedded in the URL.
pub(crate) fn service_credentials(service: &Url, credentials: Option<&Credentials>) -> Option<Credentials> {
    if let Some(c) = credentials {
        return Some(c.clone());
    }

    if service.username().is_empty() {
        None
    } else {
        Some(Credentials {
            user: service.username().to_owned(),
            password: service.password().unwrap_or_default().to_owned(),
        })
    }
}

/// Options of `send`.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// 0 - at most once, 1 - at least once
    pub qos: u8,
    /// Message expiry in milliseconds.
    pub ttl: Option<i64>,
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn qos(mut self, value: u8) -> Self {
        self.qos = value;
        self
    }

    pub fn ttl(mut self, value: i64) -> Self {
        self.ttl = Some(value);
        self
    }

    pub fn timeout(mut self, value: Duration) -> Self {
        self.timeout = Some(value);
        self
    }
}

/// Options of `subscribe`.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    pub qos: u8,
    /// How long the destination lives after the last subscriber left (ms).
    pub ttl: Option<i64>,
    pub share: Option<String>,
    pub auto_confirm: bool,
    pub timeout: Option<Duration>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            qos: Qos::AtMostOnce as u8,
            ttl: None,
            share: None,
            auto_confirm: true,
            timeout: None,
        }
    }
}

impl SubscribeOptions {
    pub fn qos(mut self, value: u8) -> Self {
        self.qos = value;
        self
    }

    pub fn ttl(mut self, value: i64) -> Self {
        self.ttl = Some(value);
        self
    }

    pub fn share(mut self, value: &str) -> Self {
        self.share = Some(value.to_owned());
        self
    }

    pub fn auto_confirm(mut self, value: bool) -> Self {
        self.auto_confirm = value;
        self
    }

    pub fn timeout(mut self, value: Duration) -> Self {
        self.timeout = Some(value);
        self
    }
}

/// Options of `receive`.
#[derive(Clone, Debug, Default)]
pub struct ReceiveOptions {
    pub share: Option<String>,
    pub timeout: Option<Duration>,
}

impl ReceiveOptions {
    pub fn share(mut self, value: &str) -> Self {
        self.share = Some(value.to_owned());
        self
    }

    pub fn timeout(mut self, value: Duration) -> Self {
        self.timeout = Some(value);
        self
    }
}

/// Options of `unsubscribe`.
#[derive(Clone, Debug, Default)]
pub struct UnsubscribeOptions {
    pub share: Option<String>,
    /// Only 0 is accepted: delete the destination immediately.
    pub ttl: Option<i64>,
}

impl UnsubscribeOptions {
    pub fn share(mut self, value: &str) -> Self {
        self.share = Some(value.to_owned());
        self
    }

    pub fn ttl(mut self, value: i64) -> Self {
        self.ttl = Some(value);
        self
    }
}

pub(crate) fn validate_topic(topic: &str, what: &str) -> Result<()> {
    if topic.is_empty() {
        return client_error!(Argument, format!("{} cannot be empty", what));
    }

    Ok(())
}

pub(crate) fn validate_share(share: Option<&str>) -> Result<()> {
    match share {
        Some(s) if s.is_empty() => client_error!(Argument, "share name cannot be empty"),
        Some(s) if s.contains(':') => client_error!(Argument, format!("share name {} contains a colon", s)),
        _ => Ok(()),
    }
}
