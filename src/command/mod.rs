//! Remote command execution: one-shot sessions and persistent
//! prompt-synchronized sessions.

mod commander;
mod session;

pub use commander::Commander;
pub use session::{
    default_error_matcher, default_prompt_matcher, CommandSession, CommandSessionBuilder,
};
