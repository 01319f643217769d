//! Context window budgeting

use crate::inference::engine::EngineError;

/// Tokens kept free at the end of the window when the budget is clamped
pub const CONTEXT_SAFETY_MARGIN: u32 = 4;

/// Computes how many tokens may be generated after a prompt.
///
/// A request that would overflow the window is shrunk rather than rejected;
/// only a prompt that fills the window on its own is an error.
pub fn plan_budget(prompt_tokens: usize, requested: u32, capacity: u32) -> Result<u32, EngineError> {
    let capacity_tokens = capacity as usize;
    if prompt_tokens >= capacity_tokens {
        return Err(EngineError::PromptTooLong {
            prompt_tokens,
            capacity,
        });
    }

    // prompt_tokens < capacity, so this fits in u32
    let prompt = prompt_tokens as u32;
    if prompt as u64 + requested as u64 <= capacity as u64 {
        return Ok(requested);
    }

    let budget = capacity
        .saturating_sub(prompt)
        .saturating_sub(CONTEXT_SAFETY_MARGIN)
        .max(1);

    tracing::warn!(
        "Prompt of {} tokens leaves no room for {} new tokens in a {} token window, generating at most {}",
        prompt_tokens,
        requested,
        capacity,
        budget
    );

    Ok(budget)
}
