pub mod ber;
pub mod client;
pub mod config;
pub mod control;
pub mod dn;
pub mod entry;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod result_code;
pub mod sasl;
pub mod server;
pub mod tls;
pub mod transport;
pub mod url;

#[cfg(test)]
mod testing;

pub use client::LdapClient;
pub use config::{ClientOptions, Config, ServerOptions};
pub use error::{LdapError, Result};
pub use metrics::{run_metrics_server, Metrics};
pub use server::{LdapServer, MemoryDirectory};
