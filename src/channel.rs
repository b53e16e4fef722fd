// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! `ConnectionManager` owns the process-wide broker connection together with its single
//! confirm channel. Connecting is serialized: callers arriving while a dial is in flight
//! wait for it and then return without dialing again, so at most one dial ever happens
//! per connect cycle.
//!
//! The broker itself sits behind the [`Dialer`] / [`BrokerSession`] pair; [`LapinDialer`]
//! is the production implementation.

use crate::{
    config::ConnectionParams,
    errors::AmqpError,
    publisher::{ChannelEvent, ConfirmChannel, LapinConfirmChannel},
    topology::TopologyChannel,
};
use async_trait::async_trait;
use lapin::{
    options::ConfirmSelectOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, warn};

/// Capacity of the per-connection channel event hub
const CHANNEL_EVENTS_CAPACITY: usize = 64;

/// Reply code sent when the client closes a channel or the connection
const REPLY_SUCCESS: u16 = 200;

/// Lifecycle of the shared connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// An open broker connection with its confirm channel.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// The confirm channel shared by every publisher.
    fn confirm_channel(&self) -> Arc<dyn ConfirmChannel>;

    /// Channel used for exchange declarations and bindings.
    fn topology_channel(&self) -> Arc<dyn TopologyChannel>;

    /// Closes the confirm channel, then the connection. Never fails on resources that are
    /// already closed.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens broker sessions.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Session: BrokerSession + 'static;

    async fn dial(&self, params: &ConnectionParams) -> Result<Self::Session, AmqpError>;
}

struct Shared<S> {
    state: ConnectionState,
    session: Option<Arc<S>>,
}

/// Owner of the shared connection.
pub struct ConnectionManager<D: Dialer = LapinDialer> {
    dialer: D,
    params: ConnectionParams,
    dialing: Mutex<()>,
    shared: RwLock<Shared<D::Session>>,
}

impl ConnectionManager<LapinDialer> {
    pub fn new(params: ConnectionParams) -> Self {
        ConnectionManager::with_dialer(LapinDialer, params)
    }
}

impl<D: Dialer> ConnectionManager<D> {
    pub fn with_dialer(dialer: D, params: ConnectionParams) -> Self {
        ConnectionManager {
            dialer,
            params,
            dialing: Mutex::new(()),
            shared: RwLock::new(Shared {
                state: ConnectionState::Disconnected,
                session: None,
            }),
        }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Dials the broker unless a session is already open.
    ///
    /// Fails with `ConnectionError` when the dial fails, leaving the state disconnected.
    /// There is no reconnect loop; the caller decides whether to try again.
    ///
    /// # Returns
    /// `Ok` once connected, also when another caller connected first
    pub async fn connect(&self) -> Result<(), AmqpError> {
        let _dialing = self.dialing.lock().await;

        if self.is_connected() {
            debug!("amqp already connected");
            return Ok(());
        }

        self.update(|shared| shared.state = ConnectionState::Connecting);
        debug!(
            host = self.params.host.as_str(),
            port = self.params.port,
            "creating amqp connection..."
        );

        match self.dialer.dial(&self.params).await {
            Ok(session) => {
                self.update(|shared| {
                    shared.session = Some(Arc::new(session));
                    shared.state = ConnectionState::Connected;
                });
                debug!("amqp connected");
                Ok(())
            }
            Err(err) => {
                self.update(|shared| shared.state = ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Closes the session if one is open.
    ///
    /// # Returns
    /// `Ok` even when the channel or connection was already gone
    pub async fn close(&self) -> Result<(), AmqpError> {
        let _dialing = self.dialing.lock().await;

        let mut session = None;
        self.update(|shared| {
            session = shared.session.take();
            shared.state = ConnectionState::Disconnected;
        });

        let Some(session) = session else {
            debug!("amqp not connected, nothing to close");
            return Ok(());
        };

        if let Err(err) = session.close().await {
            warn!(error = err.to_string(), "error while closing the connection");
        }

        debug!("connection closed");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        match self.shared.read() {
            Ok(shared) => shared.state,
            Err(poisoned) => poisoned.into_inner().state,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The open session, `NotConnected` before `connect` succeeded.
    pub fn session(&self) -> Result<Arc<D::Session>, AmqpError> {
        let session = match self.shared.read() {
            Ok(shared) => shared.session.clone(),
            Err(poisoned) => poisoned.into_inner().session.clone(),
        };

        session.ok_or(AmqpError::NotConnected)
    }

    fn update(&self, f: impl FnOnce(&mut Shared<D::Session>)) {
        match self.shared.write() {
            Ok(mut shared) => f(&mut shared),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

/// Dials RabbitMQ through lapin.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinDialer;

#[async_trait]
impl Dialer for LapinDialer {
    type Session = LapinSession;

    async fn dial(&self, params: &ConnectionParams) -> Result<LapinSession, AmqpError> {
        let mut options = ConnectionProperties::default();
        if let Some(name) = &params.connection_name {
            options = options.with_connection_name(LongString::from(name.as_str()));
        }

        let conn = match Connection::connect(&params.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;

        debug!("creating amqp channel...");
        let channel = match open_confirm_channel(&conn).await {
            Ok(channel) => channel,
            Err(err) => {
                // a connection without its confirm channel is useless
                let _ = conn.close(REPLY_SUCCESS, "channel setup failed").await;
                return Err(err);
            }
        };
        debug!("channel created");

        let (events, _) = broadcast::channel(CHANNEL_EVENTS_CAPACITY);

        conn.on_error({
            let events = events.clone();
            move |err| {
                error!(error = err.to_string(), "amqp connection error");
                let _ = events.send(ChannelEvent::Closed(err.to_string()));
            }
        });
        channel.on_error({
            let events = events.clone();
            move |err| {
                error!(error = err.to_string(), "amqp channel error");
                let _ = events.send(ChannelEvent::Error(err.to_string()));
            }
        });

        Ok(LapinSession {
            confirm: Arc::new(LapinConfirmChannel::new(channel.clone(), events.clone())),
            topology: Arc::new(channel),
            connection: conn,
            events,
        })
    }
}

async fn open_confirm_channel(conn: &Connection) -> Result<Channel, AmqpError> {
    let channel = match conn.create_channel().await {
        Ok(c) => c,
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            return Err(AmqpError::ChannelError);
        }
    };

    match channel
        .confirm_select(ConfirmSelectOptions { nowait: false })
        .await
    {
        Ok(_) => Ok(channel),
        Err(err) => {
            error!(error = err.to_string(), "error to enable publisher confirms");
            Err(AmqpError::ChannelError)
        }
    }
}

/// A lapin connection and its confirm channel.
pub struct LapinSession {
    connection: Connection,
    confirm: Arc<LapinConfirmChannel>,
    topology: Arc<Channel>,
    events: broadcast::Sender<ChannelEvent>,
}

impl LapinSession {
    /// Opens an additional channel, used for consuming.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        match self.connection.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

#[async_trait]
impl BrokerSession for LapinSession {
    fn confirm_channel(&self) -> Arc<dyn ConfirmChannel> {
        self.confirm.clone()
    }

    fn topology_channel(&self) -> Arc<dyn TopologyChannel> {
        self.topology.clone()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let channel = self.confirm.channel();
        if channel.status().connected() {
            if let Err(err) = channel.close(REPLY_SUCCESS, "OK").await {
                debug!(error = err.to_string(), "confirm channel already closed");
            }
        }

        if self.connection.status().connected() {
            if let Err(err) = self.connection.close(REPLY_SUCCESS, "OK").await {
                debug!(error = err.to_string(), "connection already closed");
            }
        }

        let _ = self
            .events
            .send(ChannelEvent::Closed("connection closed by client".to_owned()));

        Ok(())
    }
}
