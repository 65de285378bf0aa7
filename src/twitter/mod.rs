//! Twitter/X API integration module.
//!
//! Outbound posting with OAuth 2.0 User Context authentication.

mod api;
mod tweets;

pub use api::sanitize_for_logging;
pub use tweets::{PublishGateway, XPublisher};
