//! Literal-encryption algorithms and the module checksum.
//!
//! Encryption here raises the cost of static analysis; it is deliberately
//! deterministic (fixed IV/nonce) so that repeated occurrences of one
//! literal share one ciphertext. All three algorithms are XOR-stream shaped,
//! so decryption is encryption with the same parameters.

use aes::Aes256;
use chacha20::ChaCha20;
use cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;
use modshield_config::EncryptionAlgorithm;
use sha2::{Digest, Sha256};

use crate::module::{Module, Operand};

type Aes256Ctr = Ctr128BE<Aes256>;

/// 256-bit key derived from arbitrary key material.
pub fn derive_key(material: &[u8]) -> [u8; 32] {
    Sha256::digest(material).into()
}

/// Encrypt `plaintext` under `algorithm` with the given key material.
pub fn encrypt(algorithm: EncryptionAlgorithm, plaintext: &[u8], key: &[u8]) -> Vec<u8> {
    let mut buf = plaintext.to_vec();
    apply(algorithm, &mut buf, key);
    buf
}

/// Inverse of [`encrypt`] for the same algorithm and key.
pub fn decrypt(algorithm: EncryptionAlgorithm, ciphertext: &[u8], key: &[u8]) -> Vec<u8> {
    let mut buf = ciphertext.to_vec();
    apply(algorithm, &mut buf, key);
    buf
}

fn apply(algorithm: EncryptionAlgorithm, buf: &mut [u8], key: &[u8]) {
    match algorithm {
        EncryptionAlgorithm::SymmetricBlock => {
            // AES-256-CTR, zero IV: deterministic by requirement.
            let key = derive_key(key);
            let iv = [0u8; 16];
            let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
            cipher.apply_keystream(buf);
        }
        EncryptionAlgorithm::Stream => {
            // ChaCha20, zero 12-byte nonce, 1-origin block counter.
            let key = derive_key(key);
            let nonce = [0u8; 12];
            let mut cipher = ChaCha20::new(&key.into(), &nonce.into());
            cipher.seek(64u64);
            cipher.apply_keystream(buf);
        }
        EncryptionAlgorithm::Custom => {
            for (i, byte) in buf.iter_mut().enumerate() {
                let k = if key.is_empty() { 0 } else { key[i % key.len()] };
                *byte ^= k ^ ((i as u32 * 17) & 0xff) as u8;
            }
        }
    }
}

/// SHA-256 over a stable summary of the metadata graph. Baked into the
/// integrity probe before that probe's own body exists, so the hash covers
/// names and shapes rather than raw bytes.
pub fn module_checksum(module: &Module) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(module.name.as_bytes());
    for ty in &module.types {
        hasher.update(ty.namespace.as_bytes());
        hasher.update([b'.']);
        hasher.update(ty.name.as_bytes());
        hasher.update(ty.flags.bits().to_le_bytes());
    }
    for method in &module.methods {
        hasher.update(method.name.as_bytes());
        hasher.update(method.flags.bits().to_le_bytes());
        let body_len = method.body.as_ref().map_or(0, |b| b.len());
        hasher.update((body_len as u64).to_le_bytes());
        if let Some(body) = &method.body {
            for instruction in &body.instructions {
                hasher.update([opcode_tag(instruction)]);
            }
        }
    }
    for field in &module.fields {
        hasher.update(field.name.as_bytes());
    }
    hasher.finalize().into()
}

fn opcode_tag(instruction: &crate::module::Instruction) -> u8 {
    // Cheap stable discriminant; collisions across opcodes are acceptable
    // for an integrity fingerprint.
    let operand_tag = match &instruction.operand {
        Operand::None => 0u8,
        Operand::Int32(_) => 1,
        Operand::Int64(_) => 2,
        Operand::Float64(_) => 3,
        Operand::Str(_) => 4,
        Operand::Local(_) => 5,
        Operand::Arg(_) => 6,
        Operand::Type(_) => 7,
        Operand::Method(_) => 8,
        Operand::Field(_) => 9,
        Operand::Member(_) => 10,
        Operand::Target(_) => 11,
        Operand::Targets(_) => 12,
    };
    (instruction.opcode as u8).wrapping_mul(13).wrapping_add(operand_tag)
}
