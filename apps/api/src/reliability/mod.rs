// Reliability primitives shared by the webhook ingress and the outbound clients.

pub mod rate_limit;
pub mod retry;
pub mod signature;
