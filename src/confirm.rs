// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Settlement race for confirmed publishes.
//!
//! A [`ConfirmWait`] subscribes to the channel's error and close signals before the message
//! is written, then `settle` races them against broker confirmation and a deadline. The
//! confirmation branch waits for the channel-wide confirm and then reads the publish's own
//! verdict, which is where a returned message shows up. The first participant to settle
//! decides the outcome; every other waiter and the timer are dropped before `settle`
//! returns, so repeated publishes do not accumulate subscriptions.

use crate::{
    errors::AmqpError,
    publisher::{ChannelEvent, ConfirmChannel, PublishConfirm},
};
use futures_util::future::{self, BoxFuture};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Error,
    Closed,
}

pub(crate) struct ConfirmWait {
    deadline: Duration,
    errors: broadcast::Receiver<ChannelEvent>,
    closes: broadcast::Receiver<ChannelEvent>,
}

impl ConfirmWait {
    /// Subscribes the error and close waiters.
    pub(crate) fn arm(channel: &dyn ConfirmChannel, deadline: Duration) -> Self {
        ConfirmWait {
            deadline,
            errors: channel.subscribe(),
            closes: channel.subscribe(),
        }
    }

    /// Waits for the first of confirmation, error, close or deadline.
    ///
    /// Channel signals are polled ahead of the confirmation. Once the channel-wide wait
    /// resolves, `own` decides between success, `Unroutable` and `BrokerError`.
    pub(crate) async fn settle(
        self,
        confirms: BoxFuture<'static, Result<(), AmqpError>>,
        own: PublishConfirm,
    ) -> Result<(), AmqpError> {
        let ConfirmWait {
            deadline,
            mut errors,
            mut closes,
        } = self;

        let confirmed = async move {
            confirms.await?;
            own.into_verdict().await
        };

        let outcome = tokio::select! {
            biased;

            err = wait_for(&mut errors, Signal::Error) => Err(err),
            err = wait_for(&mut closes, Signal::Closed) => Err(err),
            verdict = confirmed => verdict,
            _ = tokio::time::sleep(deadline) => {
                Err(AmqpError::PublishTimeout(deadline.as_millis() as u64))
            }
        };

        // the losing waiters were dropped with the select; release the subscriptions too
        drop(errors);
        drop(closes);

        outcome
    }
}

/// Resolves with the classified error once `signal` shows up on the subscription.
async fn wait_for(events: &mut broadcast::Receiver<ChannelEvent>, signal: Signal) -> AmqpError {
    loop {
        match events.recv().await {
            Ok(ChannelEvent::Error(reason)) if signal == Signal::Error => {
                return AmqpError::BrokerError(reason);
            }
            Ok(ChannelEvent::Closed(reason)) if signal == Signal::Closed => {
                return AmqpError::ChannelClosed(reason);
            }
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "channel event subscription lagged");
            }
            Err(RecvError::Closed) => {
                // the session dropped its event hub, which only happens on close
                if signal == Signal::Closed {
                    return AmqpError::ChannelClosed("channel event hub closed".to_owned());
                }
                return future::pending().await;
            }
        }
    }
}
