//! Block-level gauges published through the `metrics` facade.

use metrics::gauge;

/// Incarnations started in the last block.
pub const EXECUTED_TXNS: &str = "block_stm_executed_txns";

/// Validation tasks issued in the last block.
pub const VALIDATED_TXNS: &str = "block_stm_validated_txns";

pub fn set_block_gauges(executed_txns: usize, validated_txns: usize) {
    gauge!(EXECUTED_TXNS).set(executed_txns as f64);
    gauge!(VALIDATED_TXNS).set(validated_txns as f64);
}
