// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Parameters
//!
//! Host, port, protocol, credentials and heartbeat are passed through to the broker
//! handshake unchanged. The broker performs the only validation.

use serde::Deserialize;
use std::env;

pub const ENV_RABBITMQ_PROTOCOL: &str = "RABBITMQ_PROTOCOL";
pub const ENV_RABBITMQ_HOST: &str = "RABBITMQ_HOST";
pub const ENV_RABBITMQ_PORT: &str = "RABBITMQ_PORT";
pub const ENV_RABBITMQ_USER: &str = "RABBITMQ_USER";
pub const ENV_RABBITMQ_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_RABBITMQ_VHOST: &str = "RABBITMQ_VHOST";
pub const ENV_RABBITMQ_HEARTBEAT: &str = "RABBITMQ_HEARTBEAT";
pub const ENV_RABBITMQ_CONNECTION_NAME: &str = "RABBITMQ_CONNECTION_NAME";

/// Wire protocol used to reach the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Amqp,
    Amqps,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Amqp => "amqp",
            Protocol::Amqps => "amqps",
        }
    }

    fn parse(value: &str) -> Option<Protocol> {
        match value.to_ascii_lowercase().as_str() {
            "amqp" => Some(Protocol::Amqp),
            "amqps" => Some(Protocol::Amqps),
            _ => None,
        }
    }
}

/// Parameters used to dial the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat interval in seconds, `None` keeps the broker's proposal.
    pub heartbeat: Option<u16>,
    pub connection_name: Option<String>,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        ConnectionParams {
            protocol: Protocol::Amqp,
            host: "localhost".to_owned(),
            port: 5672,
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            heartbeat: None,
            connection_name: None,
        }
    }
}

impl ConnectionParams {
    /// Reads `RABBITMQ_*` variables, falling back to the defaults for anything unset or
    /// unparsable.
    pub fn from_env() -> Self {
        let defaults = ConnectionParams::default();

        ConnectionParams {
            protocol: env::var(ENV_RABBITMQ_PROTOCOL)
                .ok()
                .and_then(|v| Protocol::parse(&v))
                .unwrap_or(defaults.protocol),
            host: env::var(ENV_RABBITMQ_HOST).unwrap_or(defaults.host),
            port: env::var(ENV_RABBITMQ_PORT)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            username: env::var(ENV_RABBITMQ_USER).unwrap_or(defaults.username),
            password: env::var(ENV_RABBITMQ_PASSWORD).unwrap_or(defaults.password),
            vhost: env::var(ENV_RABBITMQ_VHOST).unwrap_or(defaults.vhost),
            heartbeat: env::var(ENV_RABBITMQ_HEARTBEAT)
                .ok()
                .and_then(|v| v.parse().ok()),
            connection_name: env::var(ENV_RABBITMQ_CONNECTION_NAME).ok(),
        }
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_owned();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_owned();
        self.password = password.to_owned();
        self
    }

    pub fn vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_owned();
        self
    }

    pub fn heartbeat(mut self, seconds: u16) -> Self {
        self.heartbeat = Some(seconds);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    /// AMQP URI understood by lapin.
    pub fn uri(&self) -> String {
        let mut uri = format!(
            "{}://{}:{}@{}:{}/{}",
            self.protocol.scheme(),
            self.username,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f"),
        );

        if let Some(heartbeat) = self.heartbeat {
            uri.push_str(&format!("?heartbeat={}", heartbeat));
        }

        uri
    }
}
