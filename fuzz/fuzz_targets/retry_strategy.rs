#![no_main]

use libfuzzer_sys::fuzz_target;
use agentrelay_retry::{calculate_delay, RetryStrategyConfig, RetryStrategyType};
use std::time::Duration;

fuzz_target!(|data: (u32, u8, u64, u64, u8)| {
    let (attempt, strategy_type, base_ms, max_ms, multiplier_byte) = data;

    let attempt = attempt % 100 + 1; // 1-100
    let strategy = match strategy_type % 4 {
        0 => RetryStrategyType::Immediate,
        1 => RetryStrategyType::Exponential,
        2 => RetryStrategyType::Linear,
        _ => RetryStrategyType::Constant,
    };
    let base_delay = Duration::from_millis(base_ms % 10000 + 1); // 1-10000ms
    let max_delay = Duration::from_millis(max_ms % 300000 + 100); // 100-300000ms
    let multiplier = 1.0 + (multiplier_byte as f64) / 64.0; // 1.0-4.98

    let config = RetryStrategyConfig {
        strategy,
        max_attempts: 100,
        base_delay,
        max_delay,
        multiplier,
        jitter: 0.0,
    };

    let delay = calculate_delay(&config, attempt);

    // Invariants:
    // 1. Delay never exceeds max_delay.
    assert!(delay <= max_delay);

    // 2. Immediate strategy always returns zero.
    if strategy == RetryStrategyType::Immediate {
        assert_eq!(delay, Duration::ZERO);
    }

    // 3. Constant strategy always returns base_delay, capped at max_delay.
    if strategy == RetryStrategyType::Constant {
        assert_eq!(delay, base_delay.min(max_delay));
    }
});
