// crates/rlm-engine/src/llm/mod.rs
// Completion provider capability and call helpers

mod logging;
mod provider;
mod registry;
mod tokens;

pub use provider::{
    Completion, CompletionProvider, CompletionRequest, Message, ProviderKind, RawEventStream,
};
pub use registry::{ProviderRegistry, ProviderResolver, StaticResolver};
pub use tokens::{estimate_tokens, truncate_to_tokens};

use crate::error::{Result, RlmError};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Issue one completion call under a timeout and the request's cancellation
/// token. Every outbound model call in the engine goes through here.
pub async fn invoke(
    provider: &dyn CompletionProvider,
    request: CompletionRequest,
    timeout: Duration,
    stage: &str,
) -> Result<Completion> {
    let request_id = Uuid::new_v4().to_string();
    let start = Instant::now();
    logging::log_request(&request_id, stage, provider.provider_tag(), &request);

    let cancel = request.cancel.clone();
    let call = tokio::time::timeout(timeout, provider.complete(request));
    let outcome = match cancel {
        Some(token) => tokio::select! {
            biased;

            _ = token.cancelled() => {
                logging::log_failure(&request_id, stage, "cancelled");
                return Err(RlmError::Cancelled);
            }
            res = call => res,
        },
        None => call.await,
    };

    let result = match outcome {
        Ok(Ok(completion)) => Ok(completion),
        Ok(Err(e)) => Err(RlmError::Provider(format!("{e:#}"))),
        Err(_) => Err(RlmError::Timeout(timeout)),
    };

    match &result {
        Ok(completion) => logging::log_completion(
            &request_id,
            stage,
            start.elapsed().as_millis() as u64,
            completion,
        ),
        Err(e) => logging::log_failure(&request_id, stage, &e.to_string()),
    }
    result
}

/// Open a provider stream under the same timeout/cancellation rules as
/// [`invoke`]. The timeout covers establishing the stream only.
pub async fn open_stream(
    provider: &dyn CompletionProvider,
    request: CompletionRequest,
    timeout: Duration,
    stage: &str,
) -> Result<RawEventStream> {
    let request_id = Uuid::new_v4().to_string();
    logging::log_request(&request_id, stage, provider.provider_tag(), &request);

    let cancel = request.cancel.clone();
    let open = tokio::time::timeout(timeout, provider.stream(request));
    let outcome = match cancel {
        Some(token) => tokio::select! {
            biased;

            _ = token.cancelled() => return Err(RlmError::Cancelled),
            res = open => res,
        },
        None => open.await,
    };

    match outcome {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => {
            logging::log_failure(&request_id, stage, &format!("{e:#}"));
            Err(RlmError::Provider(format!("{e:#}")))
        }
        Err(_) => {
            logging::log_failure(&request_id, stage, "stream open timed out");
            Err(RlmError::Timeout(timeout))
        }
    }
}
