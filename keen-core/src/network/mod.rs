//! HTTP access to the Keen API
//!
//! - [`transport`]: the request/response seam and its reqwest implementation
//! - [`query`]: query descriptions and their wire form
//! - [`client`]: authenticated requests and failed-query bookkeeping

pub mod client;
pub mod query;
pub mod transport;

pub use client::{sdk_version, NetworkClient, QueryRetry, SDK_HEADER};
pub use query::{AnalysisType, Query, QueryType};
pub use transport::{
    HttpMethod, HttpRequest, HttpResponse, ReqwestTransport, ReqwestTransportFactory, Transport,
    TransportFactory, TransportSettings,
};
