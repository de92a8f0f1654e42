//! Transport servers.
//!
//! Two equivalent front doors hand fully parsed tile requests to the
//! ingestion controller: a raw socket speaking length-prefixed binary
//! frames ([`TcpServer`]) and an HTTP surface ([`HttpServer`]). Within one
//! socket connection requests are handled serially, so responses keep the
//! request order; across connections there are no ordering guarantees.

mod http;
mod tcp;

pub use http::HttpServer;
pub use tcp::TcpServer;
