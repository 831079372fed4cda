//! pabgpd -- a pretty average BGP speaker
//!
//! The crate is split into the wire format ([`bgp`]), the per-peer session
//! state machine ([`fsm`]), the conversion between UPDATE messages and paths
//! ([`table`]), configuration ([`config`]), and the peer supervisor
//! ([`server`]).

// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod bgp;
pub mod config;
pub mod fsm;
pub mod server;
pub mod table;

pub use bgp::Error;
