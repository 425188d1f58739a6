//! Stable signatures over everything that could affect a plan or a task.
//!
//! A signature is recorded for each task and compared on the next build to
//! decide whether the task is up to date, and the same machinery keys the
//! build description cache.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A 256-bit blake3 digest.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(pub [u8; 32]);

impl Signature {
    pub fn of_bytes(data: &[u8]) -> Self {
        Signature(*blake3::hash(data).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex).ok().map(|h| Signature(*h.as_bytes()))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Signature::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("bad signature {:?}", hex)))
    }
}

const UNIT_SEPARATOR: u8 = 0x1F;

/// Incrementally hashes the attributes of a task or request.
/// Every variable-length field is followed by a separator so that
/// ["ab", "c"] and ["a", "bc"] hash differently.
pub struct SignatureHasher(blake3::Hasher);

impl SignatureHasher {
    /// The domain keeps signatures of different kinds of things apart.
    pub fn new(domain: &str) -> Self {
        let mut hasher = SignatureHasher(blake3::Hasher::new());
        hasher.write_str(domain);
        hasher
    }

    pub fn write_str(&mut self, s: &str) {
        self.0.update(s.as_bytes());
        self.write_separator();
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
    }

    pub fn write_strs<S: AsRef<str>>(&mut self, strs: &[S]) {
        self.0.update(&(strs.len() as u64).to_le_bytes());
        for s in strs {
            self.write_str(s.as_ref());
        }
    }

    pub fn write_u64(&mut self, n: u64) {
        self.0.update(&n.to_le_bytes());
    }

    pub fn write_bool(&mut self, b: bool) {
        self.0.update(&[b as u8]);
    }

    pub fn write_signature(&mut self, sig: &Signature) {
        self.0.update(&sig.0);
    }

    /// Hashes any serializable value through its JSON form.  Only used for
    /// values whose maps are ordered, so the encoding is stable.
    pub fn write_json<T: Serialize>(&mut self, value: &T) -> serde_json::Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.write_bytes(&bytes);
        Ok(())
    }

    pub fn write_separator(&mut self) {
        self.0.update(&[UNIT_SEPARATOR]);
    }

    pub fn finish(&self) -> Signature {
        Signature(*self.0.finalize().as_bytes())
    }
}
