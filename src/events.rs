// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Events
//!
//! A typed registry mapping each event kind to an ordered list of listeners. Registering
//! appends; dispatch calls every listener in order, logging a failing or panicking
//! listener and moving on to the next one.

use std::{
    collections::HashMap,
    error::Error,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection and topology setup succeeded
    Connect { host: String, port: u16 },
    /// `close` completed
    Disconnect { reason: Option<String> },
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Connect { .. } => EventKind::Connect,
            TransportEvent::Disconnect { .. } => EventKind::Disconnect,
        }
    }
}

pub type ListenerResult = Result<(), Box<dyn Error + Send + Sync>>;

pub type Listener = Arc<dyn Fn(&TransportEvent) -> ListenerResult + Send + Sync>;

#[derive(Default)]
pub struct EventRegistry {
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
}

impl EventRegistry {
    pub fn new() -> EventRegistry {
        EventRegistry::default()
    }

    /// Registry with the listener logging every successful connect.
    pub fn with_default_listeners() -> EventRegistry {
        let registry = EventRegistry::new();

        registry.on(EventKind::Connect, |event| {
            if let TransportEvent::Connect { host, port } = event {
                info!("Connected to {}:{}", host, port);
            }
            Ok(())
        });

        registry
    }

    /// Appends `listener` to the listeners of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&TransportEvent) -> ListenerResult + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);

        match self.listeners.lock() {
            Ok(mut map) => map.entry(kind).or_default().push(listener),
            Err(poisoned) => poisoned.into_inner().entry(kind).or_default().push(listener),
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.snapshot(kind).len()
    }

    /// Calls every listener of the event's kind in registration order.
    pub fn emit(&self, event: &TransportEvent) {
        // listeners run outside the lock so they may register further listeners
        for listener in self.snapshot(event.kind()) {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = err.to_string(), event = ?event.kind(), "event listener failed");
                }
                Err(_) => {
                    error!(event = ?event.kind(), "event listener panicked");
                }
            }
        }
    }

    fn snapshot(&self, kind: EventKind) -> Vec<Listener> {
        let listeners = match self.listeners.lock() {
            Ok(map) => map.get(&kind).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&kind).cloned(),
        };

        listeners.unwrap_or_default()
    }
}
