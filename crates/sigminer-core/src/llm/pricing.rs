//! Per-model token prices used to cost each extraction

/// USD per million (input, output) tokens
fn price_per_million(model: &str) -> Option<(f64, f64)> {
    let model = model.rsplit('/').next().unwrap_or(model);
    let price = match model {
        m if m.starts_with("gpt-4o-mini") => (0.15, 0.60),
        m if m.starts_with("gpt-4o-2024-05-13") => (5.00, 15.00),
        m if m.starts_with("gpt-4o") => (2.50, 10.00),
        m if m.starts_with("gpt-4.1-nano") => (0.10, 0.40),
        m if m.starts_with("gpt-4.1-mini") => (0.40, 1.60),
        m if m.starts_with("gpt-4.1") => (2.00, 8.00),
        m if m.starts_with("gpt-4-turbo") => (10.00, 30.00),
        m if m.starts_with("gpt-4") => (30.00, 60.00),
        m if m.starts_with("gpt-3.5-turbo") => (0.50, 1.50),
        m if m.starts_with("o1-mini") => (1.10, 4.40),
        m if m.starts_with("o1") => (15.00, 60.00),
        _ => return None,
    };
    Some(price)
}

/// Cost in USD of one completion, 0 for models without a known price
pub fn completion_cost(model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    match price_per_million(model) {
        Some((input, output)) => {
            (prompt_tokens as f64 * input + completion_tokens as f64 * output) / 1_000_000.0
        }
        None => 0.0,
    }
}
