//! Offline request cache for the transport portal.
//!
//! Requests are classified by origin and path, routed to a cache-first,
//! network-first or stale-while-revalidate strategy, and answered from named
//! stores that belong to one cache generation. Installing a generation
//! pre-populates the app shell; activating it evicts every older store.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod worker;

#[cfg(test)]
mod testing;
