use std::hash::{Hash, Hasher};
use std::ops::Deref;

use crate::hash::StableHasher;

#[derive(Debug, Default, Clone, PartialEq, Eq, Copy, Ord, PartialOrd)]
pub struct Signature(u64);

/// implement hash which returns the value of the inner u64
impl Hash for Signature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Deref for Signature {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

const EMPTY_LIST_SIGNATURE: u64 = 0x9e3779b97f4a7c15;
const EMPTY_NAME_VALUE: u64 = 0x9e3779b97f4a7c16;

impl Signature {
    pub fn new(s: &str) -> Signature {
        let mut hasher = StableHasher::new();
        write_name(&mut hasher, s);
        Signature(hasher.finish())
    }

    /// Computes the signature of a metric name given as the name and its (already sorted) tags.
    pub fn from_name_and_tags<'a>(
        name: &str,
        iter: impl Iterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut hasher = StableHasher::new();
        let mut has_tags = false;

        write_name(&mut hasher, name);
        for (key, value) in iter {
            hasher.write(key.as_bytes());
            hasher.write_u8(0xff);
            hasher.write(value.as_bytes());
            hasher.write_u8(0xfe);
            has_tags = true;
        }
        if !has_tags {
            hasher.write_u64(EMPTY_LIST_SIGNATURE);
        }
        Signature(hasher.finish())
    }
}

fn write_name(hasher: &mut StableHasher, name: &str) {
    if !name.is_empty() {
        hasher.write(name.as_bytes());
    } else {
        hasher.write_u64(EMPTY_NAME_VALUE);
    }
}

impl From<Signature> for u64 {
    fn from(sig: Signature) -> Self {
        sig.0
    }
}

impl From<u64> for Signature {
    fn from(sig: u64) -> Self {
        Signature(sig)
    }
}

impl From<&str> for Signature {
    fn from(s: &str) -> Self {
        Signature::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::Signature;

    #[test]
    fn signature_is_stable_and_tag_sensitive() {
        let tags = [("job", "api"), ("instance", "a")];
        let a = Signature::from_name_and_tags("up", tags.iter().copied());
        let b = Signature::from_name_and_tags("up", tags.iter().copied());
        assert_eq!(a, b);

        let other = [("job", "api"), ("instance", "b")];
        let c = Signature::from_name_and_tags("up", other.iter().copied());
        assert_ne!(a, c);
    }

    #[test]
    fn empty_name_and_tags_differ_from_empty_strings() {
        let empty = Signature::from_name_and_tags("", std::iter::empty());
        let tagged = Signature::from_name_and_tags("", [("", "")].iter().copied());
        assert_ne!(empty, tagged);
    }
}
