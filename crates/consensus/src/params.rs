//! Per-network chain parameters.

use std::fmt;

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mainnet" => Some(Self::Mainnet),
            "testnet" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// A historical block exempt from the duplicate-coinbase overwrite rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OverwriteException {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,
    /// Easiest admissible proof-of-work target, little-endian.
    pub pow_limit: Hash256,
    pub pow_target_timespan: i64,
    pub pow_target_spacing: i64,
    /// Allow min-difficulty blocks after twice the target spacing.
    pub pow_allow_min_difficulty: bool,
    /// Skip the retarget function entirely (regtest only).
    pub pow_no_retarget: bool,
    pub subsidy_halving_interval: i32,
    /// Version-2 height-in-coinbase enforcement threshold.
    pub majority_enforce_upgrade: usize,
    /// Version-1 rejection threshold.
    pub majority_reject_outdated: usize,
    /// Ancestor window the two thresholds are evaluated over.
    pub majority_window: usize,
    /// Blocks grandfathered out of the coinbase no-overwrite rule.
    pub overwrite_exceptions: Vec<OverwriteException>,
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub checkpoints: Vec<Checkpoint>,
    /// Whether relay policy enforces standard transaction shapes.
    pub require_standard: bool,
    /// Whether the mempool replacement path is enabled.
    pub allow_replacement: bool,
}

impl ChainParams {
    pub fn last_checkpoint_height(&self) -> i32 {
        self.checkpoints
            .iter()
            .map(|checkpoint| checkpoint.height)
            .max()
            .unwrap_or(0)
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HexError;

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid 64-character hex hash")
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex hash into internal byte order.
pub fn hash256_from_hex(hex: &str) -> Result<Hash256, HexError> {
    let bytes = hex.as_bytes();
    if bytes.len() != 64 {
        return Err(HexError);
    }
    let mut out = [0u8; 32];
    for (i, chunk) in bytes.chunks_exact(2).enumerate() {
        let high = (chunk[0] as char).to_digit(16).ok_or(HexError)? as u8;
        let low = (chunk[1] as char).to_digit(16).ok_or(HexError)? as u8;
        out[31 - i] = (high << 4) | low;
    }
    Ok(out)
}

fn expect_hash(hex: &str) -> Hash256 {
    hash256_from_hex(hex).expect("hard-coded hash constant")
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            consensus: ConsensusParams {
                hash_genesis_block: expect_hash(
                    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
                ),
                genesis_time: 1_231_006_505,
                genesis_bits: 0x1d00_ffff,
                genesis_nonce: 2_083_236_893,
                pow_limit: expect_hash(
                    "00000000ffff0000000000000000000000000000000000000000000000000000",
                ),
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_target_spacing: 10 * 60,
                pow_allow_min_difficulty: false,
                pow_no_retarget: false,
                subsidy_halving_interval: 210_000,
                majority_enforce_upgrade: 750,
                majority_reject_outdated: 950,
                majority_window: 1000,
                overwrite_exceptions: vec![
                    OverwriteException {
                        height: 91_842,
                        hash: expect_hash(
                            "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec",
                        ),
                    },
                    OverwriteException {
                        height: 91_880,
                        hash: expect_hash(
                            "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721",
                        ),
                    },
                ],
            },
            checkpoints: vec![
                Checkpoint {
                    height: 11_111,
                    hash: expect_hash(
                        "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
                    ),
                },
                Checkpoint {
                    height: 33_333,
                    hash: expect_hash(
                        "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
                    ),
                },
                Checkpoint {
                    height: 74_000,
                    hash: expect_hash(
                        "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20",
                    ),
                },
                Checkpoint {
                    height: 105_000,
                    hash: expect_hash(
                        "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
                    ),
                },
                Checkpoint {
                    height: 134_444,
                    hash: expect_hash(
                        "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe",
                    ),
                },
                Checkpoint {
                    height: 168_000,
                    hash: expect_hash(
                        "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763",
                    ),
                },
                Checkpoint {
                    height: 193_000,
                    hash: expect_hash(
                        "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317",
                    ),
                },
                Checkpoint {
                    height: 210_000,
                    hash: expect_hash(
                        "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e",
                    ),
                },
            ],
            require_standard: true,
            allow_replacement: false,
        },
        Network::Testnet => ChainParams {
            network,
            consensus: ConsensusParams {
                hash_genesis_block: expect_hash(
                    "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
                ),
                genesis_time: 1_296_688_602,
                genesis_bits: 0x1d00_ffff,
                genesis_nonce: 414_098_458,
                pow_limit: expect_hash(
                    "00000000ffff0000000000000000000000000000000000000000000000000000",
                ),
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_target_spacing: 10 * 60,
                pow_allow_min_difficulty: true,
                pow_no_retarget: false,
                subsidy_halving_interval: 210_000,
                majority_enforce_upgrade: 51,
                majority_reject_outdated: 75,
                majority_window: 100,
                overwrite_exceptions: Vec::new(),
            },
            checkpoints: vec![Checkpoint {
                height: 546,
                hash: expect_hash(
                    "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
                ),
            }],
            require_standard: false,
            allow_replacement: true,
        },
        Network::Regtest => ChainParams {
            network,
            consensus: ConsensusParams {
                hash_genesis_block: expect_hash(
                    "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
                ),
                genesis_time: 1_296_688_602,
                genesis_bits: 0x207f_ffff,
                genesis_nonce: 2,
                pow_limit: expect_hash(
                    "7fffff0000000000000000000000000000000000000000000000000000000000",
                ),
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_target_spacing: 10 * 60,
                pow_allow_min_difficulty: true,
                pow_no_retarget: true,
                subsidy_halving_interval: 150,
                majority_enforce_upgrade: 750,
                majority_reject_outdated: 950,
                majority_window: 1000,
                overwrite_exceptions: Vec::new(),
            },
            checkpoints: Vec::new(),
            require_standard: false,
            allow_replacement: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parsing_reverses_display_order() {
        let hash = hash256_from_hex(
            "00000000000000000000000000000000000000000000000000000000000000ff",
        )
        .expect("parse");
        assert_eq!(hash[0], 0xff);
        assert_eq!(hash[31], 0x00);
        assert!(hash256_from_hex("abcd").is_err());
        assert!(hash256_from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn mainnet_keeps_grandfathered_overwrites() {
        let params = chain_params(Network::Mainnet);
        let heights: Vec<i32> = params
            .consensus
            .overwrite_exceptions
            .iter()
            .map(|e| e.height)
            .collect();
        assert_eq!(heights, vec![91_842, 91_880]);
    }

    #[test]
    fn checkpoint_lookup() {
        let params = chain_params(Network::Mainnet);
        assert!(params.checkpoint_at(11_111).is_some());
        assert!(params.checkpoint_at(11_112).is_none());
        assert_eq!(params.last_checkpoint_height(), 210_000);
        assert_eq!(chain_params(Network::Regtest).last_checkpoint_height(), 0);
    }
}
