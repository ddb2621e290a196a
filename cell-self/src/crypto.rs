use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes256};

pub(crate) type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// AES-128-CBC decrypts `data` in place. `data` must be block-aligned.
pub(crate) fn aes128_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    debug_assert_eq!(data.len() % 16, 0);

    let mut decryptor = cbc::Decryptor::<Aes128>::new(key.into(), iv.into());

    for block in data.chunks_exact_mut(16) {
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// AES-256-CBC decrypts `data` in place. `data` must be block-aligned.
pub(crate) fn aes256_cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) {
    debug_assert_eq!(data.len() % 16, 0);

    let mut decryptor = cbc::Decryptor::<Aes256>::new(key.into(), iv.into());

    for block in data.chunks_exact_mut(16) {
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// AES-128-ECB decrypts a single block.
pub(crate) fn aes128_ecb_decrypt(key: &[u8; 16], block: &mut [u8; 16]) {
    Aes128::new(key.into()).decrypt_block(GenericArray::from_mut_slice(block));
}

/// Applies an AES-128-CTR keystream to `data`.
///
/// The counter is the full 128-bit `iv`, incremented big-endian once per
/// block, starting fresh on every call.
pub(crate) fn aes128_ctr_apply(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    Aes128Ctr::new(key.into(), iv.into()).apply_keystream(data);
}
