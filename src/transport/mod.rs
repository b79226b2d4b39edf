mod fallback;
mod http_transport;
mod retry_policy;

pub use fallback::{FallbackContext, UpstreamFailure};
pub use http_transport::{ChatMessage, CompletionRequest, UpstreamClient};
pub use retry_policy::RetryPolicy;
