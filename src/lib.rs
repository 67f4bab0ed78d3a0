//! # Slipgate
//!
//! Core datapath and session machinery of a circumvention-oriented VPN:
//! a client that intercepts a device's IP traffic and a server that
//! terminates encrypted control and data channels, performs NAT, and
//! forwards packets to the public Internet.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Client core (classify, catcher, channel upkeep)          │
//! ├───────────────────────────────────────────────────────────┤
//! │  Tunnel (fan-in/out, MTU discipline, accounting)          │
//! │    StreamDatagramChannel │ UdpChannel │ StreamProxyChannel │
//! ├───────────────────────────────────────────────────────────┤
//! │  Server (dispatch, sessions, quotas, net-scan)            │
//! ├───────────────────────────────────────────────────────────┤
//! │  Proxies (UDP pools, ping pool) + NAT table               │
//! ├───────────────────────────────────────────────────────────┤
//! │  Access manager (HTTP / file / in-memory)                 │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Platform packet capture, TLS handshaking and the token-issuing portal
//! live outside this crate and plug in through the interfaces in
//! [`client::capture`] and [`access`].

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod access;
pub mod client;
pub mod crypto;
pub mod error;
pub mod nat;
pub mod packet;
pub mod proxy;
pub mod server;
pub mod token;
pub mod tunnel;
pub mod util;
pub mod wire;

pub use error::{Error, ErrorCode, Result};
pub use token::Token;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 4;
