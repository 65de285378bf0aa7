//! Core Twitter API utilities.
//!
//! Low-level helpers shared by the endpoint modules: log sanitizing and
//! sending a prepared request with uniform status handling.

use log::{debug, error, info};

use crate::error::BoxError;

/// Sanitizes text for safe logging by truncating and escaping control characters.
///
/// Newlines and tabs become spaces, other control characters become `?`, and
/// text longer than `max_len` characters is cut with a note of its full size.
pub fn sanitize_for_logging(text: &str, max_len: usize) -> String {
    let sanitized: String = text
        .chars()
        .map(|c| match c {
            '\n' | '\r' | '\t' => ' ',
            c if c.is_control() => '?',
            c => c,
        })
        .collect();

    if sanitized.chars().count() > max_len {
        let head: String = sanitized.chars().take(max_len).collect();
        format!("{}... [truncated, {} total bytes]", head, text.len())
    } else {
        sanitized
    }
}

/// Sends a prepared request and returns the response body on success.
///
/// Non-success statuses become an error carrying the status; the body is only
/// logged, sanitized, at debug level.
pub(crate) async fn send_request(
    request_builder: reqwest::RequestBuilder,
    operation_name: &str,
) -> Result<String, BoxError> {
    info!("Sending request for operation: {}", operation_name);

    let response = request_builder.send().await?;
    let status = response.status();
    info!(
        "Received response with status: {} for operation: {}",
        status, operation_name
    );

    let response_text = response.text().await?;

    if status.is_success() {
        debug!(
            "Response summary for '{}': {} bytes received",
            operation_name,
            response_text.len()
        );
        return Ok(response_text);
    }

    error!("Operation '{}' failed - Status: {}", operation_name, status);
    debug!(
        "Error response for '{}': {}",
        operation_name,
        sanitize_for_logging(&response_text, 200)
    );
    Err(format!("Twitter API error for operation '{}' ({})", operation_name, status).into())
}
