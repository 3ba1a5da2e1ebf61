//! Script parsing, policy classification, and signature verification.

pub mod interpreter;
pub mod opcodes;
pub mod script;
pub mod sighash;
pub mod standard;

pub use interpreter::{
    EcdsaVerifier, ScriptVerifier, VERIFY_NOCACHE, VERIFY_NONE, VERIFY_P2SH, VERIFY_STRICTENC,
};
pub use script::{
    count_sigops, height_script, is_p2sh, is_push_only, p2sh_sigop_count, push_data, push_int,
};
pub use standard::{classify, is_dust, is_standard_script, ScriptClass};
