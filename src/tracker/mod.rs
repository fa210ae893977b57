pub mod decisions;
pub mod forwarding;
