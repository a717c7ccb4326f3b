//! Venue access: the `MarketClient` capability and its Polymarket, paper
//! and scripted implementations.

mod clob_client;
mod data_client;
mod paper;
mod polymarket;
mod types;
mod venue;

#[cfg(test)]
pub mod testing;

pub use clob_client::ClobClient;
pub use data_client::DataClient;
pub use paper::PaperVenue;
pub use polymarket::PolymarketVenue;
pub use venue::{MarketClient, OrderRequest, VenueOrder};

#[cfg(test)]
pub use venue::VenueOrderState;
