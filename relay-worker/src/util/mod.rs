//! Small helpers shared by the outbound HTTP code.

pub mod retry;
pub mod user_agent;
