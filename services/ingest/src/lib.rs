pub mod accounting;
pub mod breaker;
pub mod clock;
pub mod engine;
pub mod scheduler;
pub mod transform;
pub mod webhook;
