use std::time::Duration;

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::{Failure, FailureReason};

/// Health check against the agent's HTTP root before opening a stream.
pub(crate) async fn check(
    http: &reqwest::Client,
    endpoint: &Endpoint,
    timeout: Duration,
) -> std::result::Result<(), Failure> {
    let url = endpoint.probe_url();
    let resp = http
        .get(url.clone())
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| Failure::new(FailureReason::Probe, format!("health check {url}: {e}")))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(Failure::new(
            FailureReason::Probe,
            format!("health check {url}: {status}"),
        ));
    }
    debug!(%url, "agent health check passed");
    Ok(())
}
