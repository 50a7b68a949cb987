use crate::{utils::create_rng, Error, Result};
use fnv::FnvHasher;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::hash::Hasher;
use std::sync::Arc;

pub type HashPrimitive = u64;
/// Hash values of a sketch. One slot per permutation.
pub type Hash = Vec<HashPrimitive>;
/// Feature set of a single record.
pub type Fingerprint = [u64];

/// Modulus of the affine permutations, 2^61 - 1.
pub const MERSENNE_PRIME: u64 = (1 << 61) - 1;
/// Value of an untouched slot.
pub const MAX_HASH: HashPrimitive = u64::MAX;

/// Hashes a single fingerprint element before the permutations are applied.
pub type ElementHash = fn(u64) -> u64;

/// FNV-1a over the little endian bytes of the element.
pub fn fnv_element_hash(x: u64) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write_u64(x);
    hasher.finish()
}

/// Uses the element as its own hash.
pub fn identity_hash(x: u64) -> u64 {
    x
}

/// The `K` affine permutations `(a_i * h + b_i) mod p` shared by every sketch
/// that will ever be compared, merged or indexed together.
///
/// Deserializing checks the parameters, so a family read back from a store is always usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredFamily")]
pub struct PermutationFamily {
    seed: u64,
    a: Vec<u64>,
    b: Vec<u64>,
}

#[derive(Deserialize)]
struct StoredFamily {
    seed: u64,
    a: Vec<u64>,
    b: Vec<u64>,
}

impl TryFrom<StoredFamily> for PermutationFamily {
    type Error = Error;

    fn try_from(stored: StoredFamily) -> Result<Self> {
        let StoredFamily { seed, a, b } = stored;
        if a.len() != b.len() {
            return Err(Error::param(format!(
                "permutation family has {} multipliers and {} offsets",
                a.len(),
                b.len()
            )));
        }
        if a.len() < 2 {
            return Err(Error::param("too few permutation functions in family"));
        }
        let in_range = a.iter().all(|&x| x >= 1 && x < MERSENNE_PRIME)
            && b.iter().all(|&x| x < MERSENNE_PRIME);
        if !in_range {
            return Err(Error::param("permutation parameter out of range"));
        }
        Ok(PermutationFamily { seed, a, b })
    }
}

impl PermutationFamily {
    /// # Arguments
    ///
    /// * `num_perm` - Number of permutations `K`. This is also the sketch length.
    /// * `seed` - Seed of the permutation parameters. If 0, randomness is seeded from the os.
    pub fn new(num_perm: usize, seed: u64) -> Result<Self> {
        if num_perm < 2 {
            return Err(Error::param(format!(
                "too few permutation functions: {}, need at least 2",
                num_perm
            )));
        }
        let mut rng = create_rng(seed);
        let mut a = Vec::with_capacity(num_perm);
        let mut b = Vec::with_capacity(num_perm);
        for _ in 0..num_perm {
            a.push(rng.gen_range(1, MERSENNE_PRIME));
            b.push(rng.gen_range(0, MERSENNE_PRIME));
        }
        Ok(PermutationFamily { seed, a, b })
    }

    pub fn num_perm(&self) -> usize {
        self.a.len()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[inline]
    fn permute(&self, i: usize, h: u64) -> u64 {
        let v = self.a[i] as u128 * h as u128 + self.b[i] as u128;
        (v % MERSENNE_PRIME as u128) as u64
    }
}

/// MinHash sketch of a fingerprint.
///
/// Slots only ever decrease, so a sketch can be fed in any number of batches.
///
/// # Examples
///
/// ```
/// use molsketch::{MinHash, PermutationFamily};
/// use std::sync::Arc;
///
/// let family = Arc::new(PermutationFamily::new(128, 1).unwrap());
/// let mut a = MinHash::new(family.clone());
/// let mut b = MinHash::new(family);
/// a.update_batch(0..100);
/// b.update_batch(50..150);
/// let j = a.jaccard(&b).unwrap();
/// assert!(j > 0.1 && j < 0.6);
/// ```
#[derive(Debug, Clone)]
pub struct MinHash {
    family: Arc<PermutationFamily>,
    hashfunc: ElementHash,
    hashvalues: Hash,
}

impl MinHash {
    pub fn new(family: Arc<PermutationFamily>) -> Self {
        Self::with_hashfunc(family, fnv_element_hash)
    }

    pub fn with_hashfunc(family: Arc<PermutationFamily>, hashfunc: ElementHash) -> Self {
        let hashvalues = vec![MAX_HASH; family.num_perm()];
        MinHash {
            family,
            hashfunc,
            hashvalues,
        }
    }

    /// Sketch a whole fingerprint in one go.
    pub fn from_fingerprint(family: Arc<PermutationFamily>, fingerprint: &Fingerprint) -> Self {
        let mut m = Self::new(family);
        m.update_batch(fingerprint.iter().copied());
        m
    }

    pub fn update(&mut self, element: u64) {
        let h = (self.hashfunc)(element);
        for (i, slot) in self.hashvalues.iter_mut().enumerate() {
            let v = self.family.permute(i, h);
            if v < *slot {
                *slot = v
            }
        }
    }

    pub fn update_batch<I>(&mut self, elements: I)
    where
        I: IntoIterator<Item = u64>,
    {
        for element in elements {
            self.update(element)
        }
    }

    /// Estimated Jaccard similarity: the fraction of equal slots.
    pub fn jaccard(&self, other: &MinHash) -> Result<f64> {
        self.check_compatible(other)?;
        let equal = self
            .hashvalues
            .iter()
            .zip(&other.hashvalues)
            .filter(|(a, b)| a == b)
            .count();
        Ok(equal as f64 / self.num_perm() as f64)
    }

    /// Turn this sketch into the sketch of the union of both sets.
    pub fn merge(&mut self, other: &MinHash) -> Result<()> {
        self.check_compatible(other)?;
        for (slot, &v) in self.hashvalues.iter_mut().zip(&other.hashvalues) {
            if v < *slot {
                *slot = v
            }
        }
        Ok(())
    }

    /// Cardinality estimate of the sketched set.
    pub fn count(&self) -> f64 {
        if self.is_empty() {
            return 0.;
        }
        let p = MERSENNE_PRIME as f64;
        let sum: f64 = self.hashvalues.iter().map(|&v| v as f64 / p).sum();
        self.num_perm() as f64 / sum - 1.
    }

    pub fn is_empty(&self) -> bool {
        self.hashvalues.iter().all(|&v| v == MAX_HASH)
    }

    pub fn hashvalues(&self) -> &[HashPrimitive] {
        &self.hashvalues
    }

    pub fn num_perm(&self) -> usize {
        self.hashvalues.len()
    }

    pub fn family(&self) -> &Arc<PermutationFamily> {
        &self.family
    }

    pub(crate) fn check_compatible(&self, other: &MinHash) -> Result<()> {
        if self.num_perm() != other.num_perm() {
            return Err(Error::MismatchedSketch {
                expected: format!("num_perm {}", self.num_perm()),
                found: format!("num_perm {}", other.num_perm()),
            });
        }
        if !Arc::ptr_eq(&self.family, &other.family) && self.family != other.family {
            return Err(Error::MismatchedSketch {
                expected: format!("permutation seed {}", self.family.seed()),
                found: format!("permutation seed {}", other.family.seed()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::create_rng;
    use fnv::FnvHashSet;

    fn family(k: usize) -> Arc<PermutationFamily> {
        Arc::new(PermutationFamily::new(k, 1).unwrap())
    }

    #[test]
    fn test_family_rejects_small_k() {
        assert!(PermutationFamily::new(1, 1).unwrap_err().is_parameter_error());
        assert!(PermutationFamily::new(0, 1).is_err());
    }

    #[test]
    fn test_family_is_reproducible() {
        let a = PermutationFamily::new(64, 3).unwrap();
        let b = PermutationFamily::new(64, 3).unwrap();
        let c = PermutationFamily::new(64, 4).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.a.iter().all(|&x| x >= 1 && x < MERSENNE_PRIME));
        assert!(a.b.iter().all(|&x| x < MERSENNE_PRIME));
    }

    #[test]
    fn test_family_is_checked_on_load() {
        let f = PermutationFamily::new(8, 3).unwrap();
        let v = serde_json::to_value(&f).unwrap();
        let back: PermutationFamily = serde_json::from_value(v.clone()).unwrap();
        assert_eq!(f, back);

        let mut short = v.clone();
        short["b"].as_array_mut().unwrap().pop();
        assert!(serde_json::from_value::<PermutationFamily>(short).is_err());

        let mut zero = v.clone();
        zero["a"][0] = serde_json::json!(0);
        assert!(serde_json::from_value::<PermutationFamily>(zero).is_err());

        let mut large = v;
        large["b"][3] = serde_json::json!(MERSENNE_PRIME);
        assert!(serde_json::from_value::<PermutationFamily>(large).is_err());
    }

    #[test]
    fn test_new_sketch_is_empty() {
        let m = MinHash::new(family(16));
        assert!(m.is_empty());
        assert_eq!(m.hashvalues(), &[MAX_HASH; 16][..]);
        assert_eq!(m.count(), 0.);
    }

    #[test]
    fn test_update_is_monotone_and_idempotent() {
        let mut m = MinHash::new(family(64));
        m.update_batch(vec![1, 2, 3]);
        let before = m.hashvalues().to_vec();

        // re-inserting the same elements changes nothing
        m.update_batch(vec![3, 2, 1, 1]);
        assert_eq!(before, m.hashvalues());

        m.update_batch(100..200);
        for (b, a) in before.iter().zip(m.hashvalues()) {
            assert!(a <= b);
        }
    }

    #[test]
    fn test_identical_sets() {
        let f = family(128);
        let a = MinHash::from_fingerprint(f.clone(), &[5, 10, 15, 20]);
        let b = MinHash::from_fingerprint(f, &[20, 15, 10, 5]);
        assert_eq!(a.jaccard(&b).unwrap(), 1.);
    }

    #[test]
    fn test_jaccard_estimate() {
        // |A ∩ B| = 100, |A ∪ B| = 300
        let f = family(128);
        let mut rng = create_rng(42);
        let trials = 50;
        let mut hits = 0;
        for _ in 0..trials {
            let offset: u64 = rng.gen_range(0, 1_000_000);
            let a = MinHash::from_fingerprint(
                f.clone(),
                &(offset..offset + 200).collect::<Vec<_>>(),
            );
            let b = MinHash::from_fingerprint(
                f.clone(),
                &(offset + 100..offset + 300).collect::<Vec<_>>(),
            );
            let j = a.jaccard(&b).unwrap();
            if (j - 1. / 3.).abs() <= 0.1 {
                hits += 1
            }
        }
        assert!(hits as f64 / trials as f64 >= 0.9, "hits: {}", hits);
    }

    #[test]
    fn test_disjoint_sets() {
        let f = family(128);
        let a = MinHash::from_fingerprint(f.clone(), &(0..500).collect::<Vec<_>>());
        let b = MinHash::from_fingerprint(f, &(1000..1500).collect::<Vec<_>>());
        assert!(a.jaccard(&b).unwrap() < 0.05);
    }

    #[test]
    fn test_mismatched_sketches() {
        let a = MinHash::new(family(64));
        let b = MinHash::new(family(128));
        match a.jaccard(&b) {
            Err(Error::MismatchedSketch { .. }) => (),
            r => panic!("unexpected {:?}", r),
        }

        let c = MinHash::new(Arc::new(PermutationFamily::new(64, 2).unwrap()));
        assert!(a.jaccard(&c).is_err());

        // an equal family behind another Arc is fine
        let d = MinHash::new(family(64));
        assert!(a.jaccard(&d).is_ok());
    }

    #[test]
    fn test_merge_is_union() {
        let f = family(64);
        let mut a = MinHash::from_fingerprint(f.clone(), &[1, 2, 3]);
        let b = MinHash::from_fingerprint(f.clone(), &[4, 5, 6]);
        let union = MinHash::from_fingerprint(f, &[1, 2, 3, 4, 5, 6]);
        a.merge(&b).unwrap();
        assert_eq!(a.hashvalues(), union.hashvalues());
    }

    #[test]
    fn test_count() {
        let f = family(128);
        let m = MinHash::from_fingerprint(f, &(0..1000).collect::<Vec<_>>());
        let c = m.count();
        assert!(c > 700. && c < 1300., "count: {}", c);
    }

    #[test]
    fn test_custom_hashfunc() {
        let f = family(32);
        let mut a = MinHash::with_hashfunc(f.clone(), identity_hash);
        let mut b = MinHash::new(f);
        a.update(7);
        b.update(7);
        assert_ne!(a.hashvalues(), b.hashvalues());
        let set: FnvHashSet<u64> = a.hashvalues().iter().copied().collect();
        assert!(set.len() > 1);
    }
}
