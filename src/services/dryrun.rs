//! Shadow traffic comparison: a primary backend's response is returned to
//! the client synchronously, while a secondary backend runs the same
//! request on an independent background context purely for comparison.

use std::sync::Arc;

use crate::models::error::ProxyError;
use crate::models::router::DryRunArm;
use crate::services::proxy::{ProxyRequest, ProxyResponse, SingleBackendProxy};

/// Outcome of one arm of a dry-run comparison.
#[derive(Debug, Clone)]
pub struct ArmOutcome {
    /// Status code, if the call completed.
    pub status: Option<u16>,
    /// Headers captured, if the call completed.
    pub headers: Vec<(String, String)>,
    /// Body captured, truncated to `max_response_size` bytes.
    pub body: Vec<u8>,
    /// Non-empty when the call failed at the transport/circuit-breaker layer.
    pub error: String,
}

impl ArmOutcome {
    fn from_result(result: &Result<ProxyResponse, ProxyError>, max_size: usize) -> Self {
        match result {
            Ok(response) => ArmOutcome {
                status: Some(response.status),
                headers: response.headers.clone(),
                body: response.body.iter().take(max_size).copied().collect(),
                error: String::new(),
            },
            Err(e) => ArmOutcome {
                status: None,
                headers: Vec::new(),
                body: Vec::new(),
                error: e.to_string(),
            },
        }
    }
}

/// A logged comparison between the two arms of a dry-run route.
#[derive(Debug, Clone)]
pub struct DryRunComparison {
    /// Which arm's response was sent to the client.
    pub chosen: DryRunArm,
    /// Outcome of the primary arm.
    pub primary: ArmOutcome,
    /// Outcome of the secondary arm.
    pub secondary: ArmOutcome,
    /// True if both arms agree on status, byte-identical bodies, and every
    /// header name present in both arms carries the same value.
    pub responses_match: bool,
}

/// Every header name present in both `a` and `b` must carry the same value;
/// a header present in only one arm (e.g. a backend-specific `Date` or
/// request-id header) does not count against the match.
fn headers_match_as_subset(a: &[(String, String)], b: &[(String, String)]) -> bool {
    let find = |headers: &[(String, String)], name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };
    let agrees = |from: &[(String, String)], into: &[(String, String)]| {
        from.iter().all(|(k, v)| match find(into, k) {
            Some(other) => other == v,
            None => true,
        })
    };
    agrees(a, b) && agrees(b, a)
}

/// Runs a request against two backends, returning the designated arm's
/// response to the caller while comparing against the other in the background.
pub struct DryRunHandler {
    primary: Arc<SingleBackendProxy>,
    secondary: Arc<SingleBackendProxy>,
    default_response_backend: DryRunArm,
    log_responses: bool,
    max_response_size: usize,
}

impl DryRunHandler {
    /// Builds a handler shadowing `secondary` against `primary`, returning
    /// whichever arm `default_response_backend` names to the client.
    pub fn new(
        primary: Arc<SingleBackendProxy>,
        secondary: Arc<SingleBackendProxy>,
        default_response_backend: DryRunArm,
        log_responses: bool,
        max_response_size: usize,
    ) -> Self {
        Self {
            primary,
            secondary,
            default_response_backend,
            log_responses,
            max_response_size,
        }
    }

    /// Issues `req` against both arms; the chosen arm's response is
    /// returned synchronously, the other is compared in the background and logged.
    pub async fn handle(&self, req: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        // Both arms forward the same already-buffered request body: `req` is
        // cloned per arm, never re-read, so neither call observes a drained
        // reader left behind by the other.
        let chosen_proxy: &Arc<SingleBackendProxy> = match self.default_response_backend {
            DryRunArm::Primary => &self.primary,
            DryRunArm::Secondary => &self.secondary,
        };
        let background_proxy = match self.default_response_backend {
            DryRunArm::Primary => self.secondary.clone(),
            DryRunArm::Secondary => self.primary.clone(),
        };

        let chosen_req = req.clone();
        let background_req = req.clone();

        let chosen_result = chosen_proxy.forward(&chosen_req).await;
        let chosen_outcome = ArmOutcome::from_result(&chosen_result, self.max_response_size);

        let chosen_arm = self.default_response_backend;
        let log_responses = self.log_responses;
        let max_size = self.max_response_size;

        // Spawned onto the runtime rather than awaited inline: this task
        // must keep running after the client response has been written, and
        // must not be cancelled when the inbound request's context ends.
        tokio::spawn(async move {
            let background_result = background_proxy.forward(&background_req).await;
            let background_outcome = ArmOutcome::from_result(&background_result, max_size);

            let (primary_outcome, secondary_outcome) = match chosen_arm {
                DryRunArm::Primary => (chosen_outcome, background_outcome),
                DryRunArm::Secondary => (background_outcome, chosen_outcome),
            };

            let responses_match = primary_outcome.status == secondary_outcome.status
                && headers_match_as_subset(&primary_outcome.headers, &secondary_outcome.headers)
                && primary_outcome.body == secondary_outcome.body;

            let comparison = DryRunComparison {
                chosen: chosen_arm,
                primary: primary_outcome,
                secondary: secondary_outcome,
                responses_match,
            };

            if comparison.responses_match {
                log::debug!("dry-run comparison matches for chosen arm {chosen_arm:?}");
            } else {
                log::warn!(
                    "dry-run comparison diverges: primary status={:?} secondary status={:?}",
                    comparison.primary.status,
                    comparison.secondary.status
                );
            }
            if log_responses {
                log::debug!(
                    "dry-run bodies: primary={} bytes secondary={} bytes",
                    comparison.primary.body.len(),
                    comparison.secondary.body.len()
                );
            }
        });

        chosen_result
    }
}
