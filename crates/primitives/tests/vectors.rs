use kestrel_consensus::hash256_from_hex;
use kestrel_primitives::block::{Block, BlockHeader};
use kestrel_primitives::hash::hex_to_bytes;
use kestrel_primitives::outpoint::OutPoint;
use kestrel_primitives::transaction::{Transaction, TxIn, TxOut};

const GENESIS_HEADLINE: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";
const GENESIS_PUBKEY_HEX: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";

fn genesis_block() -> Block {
    // scriptSig pushes the genesis target, the value 4, and the headline.
    let mut script_sig = vec![0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04];
    let headline = GENESIS_HEADLINE.as_bytes();
    script_sig.push(headline.len() as u8);
    script_sig.extend_from_slice(headline);

    let pubkey = hex_to_bytes(GENESIS_PUBKEY_HEX).expect("pubkey hex");
    let mut script_pubkey = Vec::with_capacity(pubkey.len() + 2);
    script_pubkey.push(pubkey.len() as u8);
    script_pubkey.extend_from_slice(&pubkey);
    script_pubkey.push(0xac);

    let tx = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::new(5_000_000_000, script_pubkey)],
        lock_time: 0,
    };

    let merkle_root = tx.txid();
    Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root,
            time: 1_231_006_505,
            bits: 0x1d00_ffff,
            nonce: 2_083_236_893,
        },
        transactions: vec![tx],
    }
}

#[test]
fn genesis_block_hashes_to_known_constants() {
    let block = genesis_block();
    let expected_root =
        hash256_from_hex("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
            .expect("merkle constant");
    let expected_hash =
        hash256_from_hex("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f")
            .expect("hash constant");
    assert_eq!(block.merkle_root(), expected_root);
    assert_eq!(block.header.merkle_root, expected_root);
    assert_eq!(block.hash(), expected_hash);
}

#[test]
fn genesis_block_round_trips_through_serialization() {
    let block = genesis_block();
    let bytes = block.consensus_encode();
    let decoded = Block::consensus_decode(&bytes).expect("decode");
    assert_eq!(decoded, block);
    assert_eq!(decoded.consensus_encode(), bytes);
    assert_eq!(decoded.hash(), block.hash());

    // The 80-byte header prefix decodes on its own.
    let header = BlockHeader::consensus_decode(&bytes[..80]).expect("header");
    assert_eq!(header, block.header);
}
