//! Local secp256k1 signing of legacy (EIP-155) transactions.

use alloy_core::{
    primitives::{Address, Bytes, U256, keccak256},
    rlp::{BufMut, EMPTY_STRING_CODE, Encodable, Header},
};
use anyhow::Context;
use k256::ecdsa::SigningKey;

/// A signing key held in memory.
#[derive(Clone)]
pub struct LocalSigner {
    key: SigningKey,
    address: Address,
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl LocalSigner {
    /// Create a signer from a hex-encoded private key, with or without `0x` prefix.
    pub fn from_hex(private_key: &str) -> anyhow::Result<Self> {
        let private_key_bytes: [u8; 32] = hex::decode(private_key.trim().trim_start_matches("0x"))
            .context("Private key must be hex-encoded")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("Private key must be exactly 32 bytes"))?;

        let key = SigningKey::from_bytes(&private_key_bytes.into())
            .map_err(|e| anyhow::anyhow!("Invalid secp256k1 private key: {}", e))?;

        // Uncompressed point: 0x04 marker followed by the 64-byte public key.
        let public_key_point = key.verifying_key().to_encoded_point(false);
        let hash = keccak256(&public_key_point.as_bytes()[1..]);
        let address = Address::from_slice(&hash[12..]);

        Ok(Self { key, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign a transaction and return its raw RLP encoding, ready for `eth_sendRawTransaction`.
    pub fn sign(&self, tx: &LegacyTransaction) -> anyhow::Result<Bytes> {
        let hash = tx.signature_hash();

        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash.as_slice())
            .context("Failed to sign transaction")?;

        let bytes = signature.to_bytes();
        let r = U256::from_be_slice(&bytes[..32]);
        let s = U256::from_be_slice(&bytes[32..]);
        let v = u64::from(recovery_id.to_byte()) + tx.chain_id * 2 + 35;

        Ok(tx.encode_signed(v, r, s).into())
    }
}

/// A pre-EIP-2718 transaction with EIP-155 replay protection.
///
/// Accepted by every EVM chain the toolchain targets, including those without EIP-1559.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub chain_id: u64,
}

/// RLP form of the `to` field: an address, or the empty string for contract creation.
struct TxKind(Option<Address>);

impl Encodable for TxKind {
    fn encode(&self, out: &mut dyn BufMut) {
        match &self.0 {
            Some(address) => address.encode(out),
            None => out.put_u8(EMPTY_STRING_CODE),
        }
    }

    fn length(&self) -> usize {
        match &self.0 {
            Some(address) => address.length(),
            None => 1,
        }
    }
}

fn rlp_list(fields: &[&dyn Encodable]) -> Vec<u8> {
    let payload_length = fields.iter().map(|f| f.length()).sum();
    let mut out = Vec::with_capacity(payload_length + 9);
    Header {
        list: true,
        payload_length,
    }
    .encode(&mut out);
    for field in fields {
        field.encode(&mut out);
    }
    out
}

impl LegacyTransaction {
    /// Hash signed by the sender: `keccak256(rlp([nonce, gasPrice, gas, to, value, data, chainId, 0, 0]))`.
    pub fn signature_hash(&self) -> alloy_core::primitives::B256 {
        let to = TxKind(self.to);
        keccak256(rlp_list(&[
            &self.nonce,
            &self.gas_price,
            &self.gas_limit,
            &to,
            &self.value,
            &self.data,
            &self.chain_id,
            &0u8,
            &0u8,
        ]))
    }

    fn encode_signed(&self, v: u64, r: U256, s: U256) -> Vec<u8> {
        let to = TxKind(self.to);
        rlp_list(&[
            &self.nonce,
            &self.gas_price,
            &self.gas_limit,
            &to,
            &self.value,
            &self.data,
            &v,
            &r,
            &s,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Example transaction from EIP-155.
    fn eip155_example() -> (LocalSigner, LegacyTransaction) {
        let signer = LocalSigner::from_hex(
            "0x4646464646464646464646464646464646464646464646464646464646464646",
        )
        .unwrap();
        let tx = LegacyTransaction {
            nonce: 9,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: Some(Address::repeat_byte(0x35)),
            value: U256::from(1_000_000_000_000_000_000u128),
            data: Bytes::new(),
            chain_id: 1,
        };
        (signer, tx)
    }

    #[test]
    fn test_eip155_signature_hash() {
        let (_, tx) = eip155_example();
        assert_eq!(
            hex::encode(tx.signature_hash()),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn test_eip155_signed_transaction() {
        let (signer, tx) = eip155_example();
        let raw = signer.sign(&tx).unwrap();
        assert_eq!(
            hex::encode(&raw),
            "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
        );
    }

    #[test]
    fn test_signer_address() {
        let (signer, _) = eip155_example();
        assert_eq!(
            signer.address(),
            "0x9d8A62f656a8d1615C1294fd71e9CFb3E4855A4F"
                .parse::<Address>()
                .unwrap()
        );
    }

    #[test]
    fn test_creation_encodes_empty_recipient() {
        let (signer, mut tx) = eip155_example();
        tx.to = None;
        tx.data = Bytes::from_static(&[0x60, 0x80]);

        let raw = signer.sign(&tx).unwrap();
        // nonce 0x09, gas price (0x85 + 5 bytes), gas limit (0x82 + 2 bytes), then `to`.
        let to_offset = 2 + 1 + 6 + 3;
        assert_eq!(raw[to_offset], EMPTY_STRING_CODE);
    }

    #[test]
    fn test_invalid_private_keys() {
        assert!(LocalSigner::from_hex("0x1234").is_err());
        assert!(LocalSigner::from_hex("not-hex").is_err());
        assert!(LocalSigner::from_hex(&"00".repeat(32)).is_err());
    }
}
