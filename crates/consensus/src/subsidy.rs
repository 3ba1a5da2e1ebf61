//! Block subsidy schedule.

use crate::money::{Amount, COIN};
use crate::params::ConsensusParams;

pub fn block_subsidy(height: i32, params: &ConsensusParams) -> Amount {
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}

/// Total amount the coinbase of a block at `height` may claim.
pub fn block_value(height: i32, fees: Amount, params: &ConsensusParams) -> Amount {
    block_subsidy(height, params) + fees
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{chain_params, Network};

    #[test]
    fn subsidy_halves_on_schedule() {
        let params = chain_params(Network::Mainnet).consensus;
        assert_eq!(block_subsidy(0, &params), 50 * COIN);
        assert_eq!(block_subsidy(209_999, &params), 50 * COIN);
        assert_eq!(block_subsidy(210_000, &params), 25 * COIN);
        assert_eq!(block_subsidy(420_000, &params), 50 * COIN / 4);
        assert_eq!(block_subsidy(210_000 * 64, &params), 0);
    }

    #[test]
    fn block_value_includes_fees() {
        let params = chain_params(Network::Regtest).consensus;
        assert_eq!(block_value(1, 1234, &params), 50 * COIN + 1234);
    }
}
