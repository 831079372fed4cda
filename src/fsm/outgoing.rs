//! Outgoing message pump of an established session

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::counters::MessageCounter;
use super::timers::keepalive_ticker;
use super::transport::Writer;
use super::{Outgoing, Shared};
use crate::bgp::{Message, Notification, RouteRefresh, Update};
use crate::table;
use futures_util::SinkExt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Write deadline for a negotiated hold time, none for 0
pub(super) fn write_deadline(hold_time: u16) -> Option<Duration> {
    (hold_time != 0).then(|| Duration::from_secs(u64::from(hold_time)))
}

/// Write and flush one message, counting it once written
pub(super) async fn write_message(
    writer: &mut Writer,
    message: Message,
    deadline: Option<Duration>,
    counter: &MessageCounter,
) -> io::Result<()> {
    let type_ = message.message_type();
    let write = async {
        writer.feed(message).await?;
        writer.flush().await
    };
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, write)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??,
        None => write.await?,
    }
    counter.count(type_);
    Ok(())
}

/// Why the pump stopped
#[derive(Debug)]
pub(super) enum PumpExit {
    WriteFailed(io::Error),
    NotificationSent(Notification),
    Stopped,
}

pub(super) struct Pump {
    pub writer: Writer,
    pub outgoing_rx: mpsc::Receiver<Outgoing>,
    /// NOTIFICATIONs from the session task, sent before anything else
    pub notification_rx: mpsc::Receiver<Notification>,
    pub shared: Arc<Shared>,
    pub token: CancellationToken,
}

impl Pump {
    /// Run until a write fails, a NOTIFICATION is written, or the token is
    /// cancelled, then give the outgoing queue back
    pub(super) async fn run(mut self) -> (mpsc::Receiver<Outgoing>, PumpExit) {
        let exit = self.pump().await;
        (self.outgoing_rx, exit)
    }

    async fn pump(&mut self) -> PumpExit {
        let addr = self.shared.neighbor_address;
        let Some(negotiated) = self.shared.negotiated() else {
            return PumpExit::Stopped;
        };
        let deadline = write_deadline(negotiated.hold_time);
        let mut keepalive = keepalive_ticker(negotiated.keepalive_interval);
        loop {
            let messages = tokio::select! {
                biased;
                () = self.token.cancelled() => return PumpExit::Stopped,
                Some(notification) = self.notification_rx.recv() => {
                    return self.send_notification(notification, deadline).await;
                }
                _ = keepalive.tick() => vec![Message::Keepalive],
                Some(outgoing) = self.outgoing_rx.recv() => match outgoing {
                    Outgoing::Notification(notification) => {
                        return self.send_notification(notification, deadline).await;
                    }
                    other => self.expand(other),
                },
            };
            for message in messages {
                log::trace!("{addr}: sending {message:?}");
                if let Err(e) =
                    write_message(&mut self.writer, message, deadline, &self.shared.counters.sent)
                        .await
                {
                    log::warn!("{addr}: write failed: {e}");
                    return PumpExit::WriteFailed(e);
                }
            }
        }
    }

    async fn send_notification(
        &mut self,
        notification: Notification,
        deadline: Option<Duration>,
    ) -> PumpExit {
        let message = Message::Notification(notification.clone());
        match write_message(&mut self.writer, message, deadline, &self.shared.counters.sent).await
        {
            Ok(()) => PumpExit::NotificationSent(notification),
            Err(e) => PumpExit::WriteFailed(e),
        }
    }

    /// Turn a request into messages, using the current negotiated state
    fn expand(&self, outgoing: Outgoing) -> Vec<Message> {
        let addr = self.shared.neighbor_address;
        let Some(negotiated) = self.shared.negotiated() else {
            return Vec::new();
        };
        match outgoing {
            Outgoing::Paths(paths) => table::updates_from_paths(paths, &negotiated.send_options())
                .into_iter()
                .map(Message::Update)
                .collect(),
            Outgoing::EndOfRib(families) => families
                .into_iter()
                .filter(|family| {
                    let negotiated = negotiated.families().contains(family);
                    if !negotiated {
                        log::debug!("{addr}: not sending End-of-RIB of {family}");
                    }
                    negotiated
                })
                .map(|family| Message::Update(Update::end_of_rib(family)))
                .collect(),
            Outgoing::RouteRefresh(family) => {
                if negotiated.route_refresh && negotiated.families().contains(&family) {
                    vec![Message::RouteRefresh(RouteRefresh::new(family))]
                } else {
                    log::warn!("{addr}: peer cannot refresh {family}");
                    Vec::new()
                }
            }
            // Written by `pump` itself since it ends the session
            Outgoing::Notification(_) => Vec::new(),
        }
    }
}
