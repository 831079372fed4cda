//! Per-direction message counters

// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::bgp::MessageType;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counts of one direction, updated from the session tasks
#[derive(Debug, Default)]
pub struct MessageCounter {
    open: AtomicU64,
    update: AtomicU64,
    notification: AtomicU64,
    keepalive: AtomicU64,
    route_refresh: AtomicU64,
    discarded: AtomicU64,
    total: AtomicU64,
}

impl MessageCounter {
    /// Count a message of type `type_`
    pub fn count(&self, type_: MessageType) {
        let counter = match type_ {
            MessageType::Open => &self.open,
            MessageType::Update => &self.update,
            MessageType::Notification => &self.notification,
            MessageType::Keepalive => &self.keepalive,
            MessageType::RouteRefresh => &self.route_refresh,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a message that was parsed but not acted on
    pub fn discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MessageCounts {
        MessageCounts {
            open: self.open.load(Ordering::Relaxed),
            update: self.update.load(Ordering::Relaxed),
            notification: self.notification.load(Ordering::Relaxed),
            keepalive: self.keepalive.load(Ordering::Relaxed),
            route_refresh: self.route_refresh.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a [`MessageCounter`]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "impl-serde", derive(serde::Serialize))]
pub struct MessageCounts {
    pub open: u64,
    pub update: u64,
    pub notification: u64,
    pub keepalive: u64,
    pub route_refresh: u64,
    pub discarded: u64,
    pub total: u64,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub sent: MessageCounter,
    pub received: MessageCounter,
}
