//! Peer identity: public key + network endpoint.
//!
//! A `Peer` is immutable after construction and compares equal by public
//! key *and* endpoint — two peers with the same key but a different
//! advertised endpoint are distinct registry entries until one is
//! explicitly removed, but removal keys off the public key alone
//! ("key-identity dominates endpoint changes").

use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};
use std::fmt;

/// 20-byte address derived from a peer's public key: a SHA-256 digest
/// truncated to 20 bytes, stable and collision-resistant enough for a
/// short identifier (see `DESIGN.md`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[..20]);
        Address(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// A remote node: public key plus the endpoint it is reachable at.
#[derive(Clone, Copy)]
pub struct Peer {
    pub public_key: VerifyingKey,
    pub host: std::net::IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn new(public_key: VerifyingKey, host: std::net::IpAddr, port: u16) -> Self {
        Peer { public_key, host, port }
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key)
    }

    pub fn endpoint(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.host, self.port)
    }

    pub fn zmq_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key && self.endpoint() == other.endpoint()
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.public_key.as_bytes().hash(state);
        self.endpoint().hash(state);
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address(), self.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn rand_peer(port: u16) -> Peer {
        let signing = SigningKey::generate(&mut OsRng);
        Peer::new(signing.verifying_key(), "127.0.0.1".parse().unwrap(), port)
    }

    #[test]
    fn equality_is_key_and_endpoint() {
        let a = rand_peer(9001);
        let b = Peer::new(a.public_key, a.host, 9002);
        assert_ne!(a, b, "same key, different port must be distinct");
    }

    #[test]
    fn address_is_stable_for_same_key() {
        let a = rand_peer(9001);
        let b = Peer::new(a.public_key, a.host, 9002);
        assert_eq!(a.address(), b.address());
    }
}
