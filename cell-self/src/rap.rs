//! RAP to RIF key conversion.
//!
//! A `.rap` license file holds a 16-byte key that has to go through a fixed
//! AES + permutation schedule before it can be used as a klicensee.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};

const RAP_KEY: [u8; 16] = [
    0x86, 0x9F, 0x77, 0x45, 0xC1, 0x3F, 0xD8, 0x90, 0xCC, 0xF2, 0x91, 0x88, 0xE3, 0xCC, 0x3E, 0xDF,
];

const RAP_PBOX: [usize; 16] = [
    0x0C, 0x03, 0x06, 0x04, 0x01, 0x0B, 0x0F, 0x08, 0x02, 0x07, 0x00, 0x05, 0x0A, 0x0E, 0x0D, 0x09,
];

const RAP_E1: [u8; 16] = [
    0xA9, 0x3E, 0x1F, 0xD6, 0x7C, 0x55, 0xA3, 0x29, 0xB7, 0x5F, 0xDD, 0xA6, 0x2A, 0x95, 0xC7, 0xA5,
];

const RAP_E2: [u8; 16] = [
    0x67, 0xD4, 0x5D, 0xA3, 0x29, 0x6D, 0x00, 0x6A, 0x4E, 0x7C, 0x53, 0x7B, 0xF5, 0x53, 0x8C, 0x74,
];

/// Converts the key of a `.rap` file into the RIF key (klicensee).
#[must_use]
pub fn rap_to_rif(rap: &[u8; 16]) -> [u8; 16] {
    let mut key = *rap;

    Aes128::new((&RAP_KEY).into()).decrypt_block(GenericArray::from_mut_slice(&mut key));

    for _ in 0..5 {
        for &p in &RAP_PBOX {
            key[p] ^= RAP_E1[p];
        }

        for i in (1..16).rev() {
            let p = RAP_PBOX[i];
            let pp = RAP_PBOX[i - 1];
            key[p] ^= key[pp];
        }

        // Byte-wise subtraction with borrow, in permutation order.
        let mut borrow = 0u8;

        for &p in &RAP_PBOX {
            let kc = key[p].wrapping_sub(borrow);
            let ec2 = RAP_E2[p];

            key[p] = kc.wrapping_sub(ec2);

            if borrow != 1 || kc != 0xFF {
                borrow = u8::from(kc < ec2);
            }
        }
    }

    key
}
