//! Configuration for a signaling session
//!
//! `SessionConfig` is what `SignalingClient::initialize` consumes.
//! `SessionArgs` fills one from CLI arguments or environment variables
//! using clap.

use clap::Parser;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SignalError};
use crate::transport::{LoggingListener, SignalTransport, TransportEventListener};

/// Configuration held for the lifetime of a signaling session.
#[derive(Clone)]
pub struct SessionConfig {
    /// Tenant identifier for the transport
    pub app_id: String,
    /// Caller-owned transport client. When absent the session creates and
    /// owns one; when present the caller is responsible for login/logout.
    pub transport: Option<Arc<dyn SignalTransport>>,
    /// Receives connection-state and credential-expiry notifications.
    /// Only handed to the transport when the session creates it.
    pub event_listener: Arc<dyn TransportEventListener>,
    /// Credential used for login
    pub token: String,
    /// Identity used to log in and to receive publishes addressed to it
    pub user_id: String,
    /// Application data attached to every outgoing envelope
    pub extension: Option<Map<String, Value>>,
}

impl SessionConfig {
    pub fn new(
        app_id: impl Into<String>,
        user_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            transport: None,
            event_listener: Arc::new(LoggingListener),
            token: token.into(),
            user_id: user_id.into(),
            extension: None,
        }
    }

    /// Use a caller-owned transport client
    pub fn with_transport(mut self, transport: Arc<dyn SignalTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn TransportEventListener>) -> Self {
        self.event_listener = listener;
        self
    }

    /// Attach extension data to every envelope
    pub fn with_extension(mut self, extension: Map<String, Value>) -> Self {
        self.extension = Some(extension);
        self
    }

    /// Whether the caller supplied its own transport client
    pub fn has_external_transport(&self) -> bool {
        self.transport.is_some()
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("app_id", &self.app_id)
            .field("external_transport", &self.transport.is_some())
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("extension", &self.extension)
            .finish()
    }
}

/// Signaling session settings from CLI arguments or environment
#[derive(Parser, Debug, Clone)]
#[command(name = "call-signaling")]
#[command(about = "One-to-one call signaling session settings")]
pub struct SessionArgs {
    /// Tenant identifier for the transport
    #[arg(long, env = "CALL_APP_ID")]
    pub app_id: String,

    /// Identity the session logs in as
    #[arg(long, env = "CALL_USER_ID")]
    pub user_id: String,

    /// Login credential
    #[arg(long, env = "CALL_TOKEN", default_value = "")]
    pub token: String,

    /// Extension data as a JSON object, e.g. '{"videoType":"match"}'
    #[arg(long, env = "CALL_USER_EXTENSION")]
    pub user_extension: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl SessionArgs {
    /// Parse from the process arguments after loading `.env` if present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::parse()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.app_id.trim().is_empty() {
            return Err(SignalError::Config("CALL_APP_ID must not be empty".into()));
        }
        if self.user_id.trim().is_empty() {
            return Err(SignalError::Config("CALL_USER_ID must not be empty".into()));
        }
        self.extension()?;
        Ok(())
    }

    /// Parsed extension object, if one was given
    pub fn extension(&self) -> Result<Option<Map<String, Value>>> {
        let Some(raw) = &self.user_extension else {
            return Ok(None);
        };

        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(_) => Err(SignalError::Config(
                "CALL_USER_EXTENSION must be a JSON object".into(),
            )),
            Err(e) => Err(SignalError::Config(format!(
                "CALL_USER_EXTENSION is not valid JSON: {}",
                e
            ))),
        }
    }

    /// Build a session config that lets the session create its own client.
    pub fn into_config(self, listener: Arc<dyn TransportEventListener>) -> Result<SessionConfig> {
        self.validate()?;
        let extension = self.extension()?;

        let mut config =
            SessionConfig::new(self.app_id, self.user_id, self.token).with_listener(listener);
        config.extension = extension;
        Ok(config)
    }
}
