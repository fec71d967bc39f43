//! AES-CMAC (RFC 4493) and the counter-mode KDF built on it.

use aes::cipher::generic_array::GenericArray;
use aes::{Aes128, Aes256};
use cmac::{Cmac, Mac};

pub const BLOCK_LEN: usize = 16;

pub type Block = [u8; BLOCK_LEN];

type Aes128Cmac = Cmac<Aes128>;
type Aes256Cmac = Cmac<Aes256>;

fn tag<M: Mac>(mac: M) -> Block {
    let mut out = [0u8; BLOCK_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

pub fn aes128_cmac(key: &[u8; 16], message: &[u8]) -> Block {
    let mut mac = <Aes128Cmac as Mac>::new(GenericArray::from_slice(key));
    mac.update(message);
    tag(mac)
}

pub fn aes256_cmac(key: &[u8; 32], message: &[u8]) -> Block {
    let mut mac = <Aes256Cmac as Mac>::new(GenericArray::from_slice(key));
    mac.update(message);
    tag(mac)
}

/// Output length in bits, encoded after the context.
const KDF_OUTPUT_BITS: u16 = 256;

/// Counter-mode KDF producing a 256-bit key from a 128-bit key:
/// `CMAC(key, i || label || 0x00 || context || L)` for `i = 1, 2`.
pub fn derive_access_key(device_key: &[u8; 16], label: &[u8], context: &[u8]) -> [u8; 32] {
    let keyed = <Aes128Cmac as Mac>::new(GenericArray::from_slice(device_key));

    let mut key = [0u8; 32];
    for (i, out) in key.chunks_exact_mut(BLOCK_LEN).enumerate() {
        let mut mac = keyed.clone();
        mac.update(&(i as u16 + 1).to_be_bytes());
        mac.update(label);
        mac.update(&[0x00]);
        mac.update(context);
        mac.update(&KDF_OUTPUT_BITS.to_be_bytes());
        out.copy_from_slice(&tag(mac));
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_encoding::HEXLOWER;

    fn hex(s: &str) -> Vec<u8> {
        HEXLOWER.decode(s.replace(' ', "").as_bytes()).unwrap()
    }

    const MESSAGE: &str = "6bc1bee22e409f96e93d7e117393172a ae2d8a571e03ac9c9eb76fac45af8e51 \
                           30c81c46a35ce411e5fbc1191a0a52ef f69f2445df4f9b17ad2b417be66c3710";

    fn key128() -> [u8; 16] {
        hex("2b7e151628aed2a6abf7158809cf4f3c").try_into().unwrap()
    }

    fn key256() -> [u8; 32] {
        hex("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4")
            .try_into()
            .unwrap()
    }

    #[test]
    fn test_aes128_vectors() {
        let message = hex(MESSAGE);
        let key = key128();
        assert_eq!(
            aes128_cmac(&key, &[]).to_vec(),
            hex("bb1d6929e95937287fa37d129b756746")
        );
        assert_eq!(
            aes128_cmac(&key, &message[..16]).to_vec(),
            hex("070a16b46b4d4144f79bdd9dd04a287c")
        );
        assert_eq!(
            aes128_cmac(&key, &message[..40]).to_vec(),
            hex("dfa66747de9ae63030ca32611497c827")
        );
        assert_eq!(
            aes128_cmac(&key, &message).to_vec(),
            hex("51f0bebf7e3b9d92fc49741779363cfe")
        );
    }

    #[test]
    fn test_aes256_vectors() {
        let message = hex(MESSAGE);
        let key = key256();
        assert_eq!(
            aes256_cmac(&key, &[]).to_vec(),
            hex("028962f61b7bf89efc6b551f4667d983")
        );
        assert_eq!(
            aes256_cmac(&key, &message[..16]).to_vec(),
            hex("28a7023f452e8f82bd4bf28d8c37c35c")
        );
        assert_eq!(
            aes256_cmac(&key, &message).to_vec(),
            hex("e1992190549f6ed5696a2c056c315410")
        );
    }

    #[test]
    fn test_split_updates_match_vector() {
        // 40-byte message fed across block boundaries.
        let message = hex(MESSAGE);
        let mut mac = <Aes128Cmac as Mac>::new(GenericArray::from_slice(&key128()));
        for chunk in message[..40].chunks(7) {
            mac.update(chunk);
        }
        assert_eq!(tag(mac).to_vec(), hex("dfa66747de9ae63030ca32611497c827"));
    }

    #[test]
    fn test_kdf_blocks() {
        let key = key128();
        let derived = derive_access_key(&key, b"label", b"ctx");

        let mut first = vec![0x00, 0x01];
        first.extend_from_slice(b"label\0ctx");
        first.extend_from_slice(&[0x01, 0x00]);
        let mut second = first.clone();
        second[1] = 0x02;

        assert_eq!(&derived[..16], &aes128_cmac(&key, &first));
        assert_eq!(&derived[16..], &aes128_cmac(&key, &second));
        assert_ne!(derived[..16], derived[16..]);
    }
}
