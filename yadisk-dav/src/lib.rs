mod client;
mod multistatus;

pub use client::{ApiErrorClass, CollectionStatus, DavClient, DavError};
pub use multistatus::{DavEntry, parse_multistatus};
pub use reqwest::StatusCode;
