pub mod hash;
pub mod keypair;
pub mod merkle;

pub use hash::{keccak256, sha256};
pub use keypair::{recover_signer, verify, Keypair, Signature};
pub use merkle::{merkle_proof, merkle_root, verify_proof, ProofStep, SiblingSide};
