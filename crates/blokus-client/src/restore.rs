use serde::Deserialize;
use thiserror::Error;

use blokus_core::net::messages::RestoreSnapshot;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("restore request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("restore returned {status}: {message}")]
    Status { status: u16, message: String },
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Fetch the authoritative state of `room_id` from a host server.
pub async fn fetch_snapshot(
    client: &reqwest::Client,
    base_url: &str,
    room_id: &str,
) -> Result<RestoreSnapshot, RestoreError> {
    let url = format!(
        "{}/api/v1/rooms/{room_id}/restore",
        base_url.trim_end_matches('/')
    );
    let response = client.get(&url).send().await?;
    let status = response.status();
    if !status.is_success() {
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_default();
        tracing::warn!(%room_id, status = status.as_u16(), reason = %message, "Restore fetch refused");
        return Err(RestoreError::Status {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response.json().await?)
}
