//! WinRM transport: WS-Man shell protocol over HTTP(S) with basic, NTLM or
//! client-certificate authentication, optionally tunneled through an SSH
//! bastion.

pub(crate) mod client;
pub(crate) mod ntlm;
pub(crate) mod protocol;

pub use client::{WinRmTransport, WinRmWaiter};
