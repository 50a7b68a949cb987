use crate::{table::general::ParameterStore, Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Settings of the index build pipeline.
///
/// Loaded once from a [ParameterStore] and passed by reference to the build functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Permutations of molecule similarity sketches.
    pub lsh_num_permute: usize,
    /// Jaccard threshold of the molecule similarity index.
    pub lsh_threshold: f64,
    pub cgr_lsh_num_permute: usize,
    pub cgr_lsh_threshold: f64,
    /// Cardinality partitions of the containment index.
    pub ensemble_num_part: usize,
    pub ensemble_max_r: usize,
    /// Relative cost of (false positives, false negatives).
    pub weights: (f64, f64),
    /// Seed of the permutation family. 0 seeds from the os.
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            lsh_num_permute: 64,
            lsh_threshold: 0.7,
            cgr_lsh_num_permute: 64,
            cgr_lsh_threshold: 0.7,
            ensemble_num_part: 16,
            ensemble_max_r: 8,
            weights: (0.5, 0.5),
            seed: 1,
        }
    }
}

fn load_key<T: DeserializeOwned, S: ParameterStore + ?Sized>(
    store: &S,
    key: &str,
    default: T,
) -> Result<T> {
    match store.get(key)? {
        None | Some(Value::Null) => Ok(default),
        Some(v) => serde_json::from_value(v)
            .map_err(|e| Error::param(format!("config key {}: {}", key, e))),
    }
}

impl IndexConfig {
    /// Read every key from `store`, falling back to the default of keys that are absent.
    pub fn load<S: ParameterStore + ?Sized>(store: &S) -> Result<Self> {
        let d = Self::default();
        let config = IndexConfig {
            lsh_num_permute: load_key(store, "lsh_num_permute", d.lsh_num_permute)?,
            lsh_threshold: load_key(store, "lsh_threshold", d.lsh_threshold)?,
            cgr_lsh_num_permute: load_key(store, "cgr_lsh_num_permute", d.cgr_lsh_num_permute)?,
            cgr_lsh_threshold: load_key(store, "cgr_lsh_threshold", d.cgr_lsh_threshold)?,
            ensemble_num_part: load_key(store, "ensemble_num_part", d.ensemble_num_part)?,
            ensemble_max_r: load_key(store, "ensemble_max_r", d.ensemble_max_r)?,
            weights: load_key(store, "weights", d.weights)?,
            seed: load_key(store, "seed", d.seed)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Write every key to `store`.
    pub fn store<S: ParameterStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        if let Value::Object(map) = serde_json::to_value(self)? {
            for (k, v) in map {
                store.put(&k, v)?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, k) in &[
            ("lsh_num_permute", self.lsh_num_permute),
            ("cgr_lsh_num_permute", self.cgr_lsh_num_permute),
        ] {
            if *k < 2 {
                return Err(Error::param(format!("{} must be at least 2", name)));
            }
        }
        for (name, t) in &[
            ("lsh_threshold", self.lsh_threshold),
            ("cgr_lsh_threshold", self.cgr_lsh_threshold),
        ] {
            if !(*t > 0. && *t < 1.) {
                return Err(Error::param(format!("{} must be in (0.0, 1.0)", name)));
            }
        }
        if self.ensemble_num_part < 1 {
            return Err(Error::param("ensemble_num_part must be at least 1"));
        }
        if self.ensemble_max_r < 2 || self.ensemble_max_r > self.lsh_num_permute {
            return Err(Error::param(
                "ensemble_max_r must be in the range of [2, lsh_num_permute]",
            ));
        }
        let (fp_w, fn_w) = self.weights;
        if !(fp_w >= 0. && fn_w >= 0.) || fp_w + fn_w == 0. {
            return Err(Error::param("weights must be non negative and not both zero"));
        }
        Ok(())
    }

    /// Weights scaled to sum to 1, as the containment solver expects.
    pub fn normalized_weights(&self) -> (f64, f64) {
        let (fp_w, fn_w) = self.weights;
        let total = fp_w + fn_w;
        (fp_w / total, fn_w / total)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::table::mem::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let store = MemoryStore::new();
        let config = IndexConfig::load(&store).unwrap();
        assert_eq!(config, IndexConfig::default());
        assert_eq!(config.lsh_num_permute, 64);
        assert_eq!(config.lsh_threshold, 0.7);
    }

    #[test]
    fn test_load_overrides() {
        let mut store = MemoryStore::new();
        store.put("lsh_num_permute", json!(128)).unwrap();
        store.put("cgr_lsh_threshold", json!(0.9)).unwrap();
        store.put("lsh_threshold", Value::Null).unwrap();
        let config = IndexConfig::load(&store).unwrap();
        assert_eq!(config.lsh_num_permute, 128);
        assert_eq!(config.cgr_lsh_threshold, 0.9);
        assert_eq!(config.lsh_threshold, 0.7);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut store = MemoryStore::new();
        store.put("lsh_threshold", json!(1.5)).unwrap();
        assert!(IndexConfig::load(&store).unwrap_err().is_parameter_error());

        let mut store = MemoryStore::new();
        store.put("lsh_num_permute", json!("many")).unwrap();
        assert!(IndexConfig::load(&store).unwrap_err().is_parameter_error());

        let config = IndexConfig {
            weights: (0., 0.),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = IndexConfig {
            ensemble_max_r: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_round_trip() {
        let mut store = MemoryStore::new();
        let config = IndexConfig {
            seed: 42,
            weights: (0.3, 0.7),
            ..Default::default()
        };
        config.store(&mut store).unwrap();
        assert_eq!(IndexConfig::load(&store).unwrap(), config);
    }

    #[test]
    fn test_normalized_weights() {
        let config = IndexConfig {
            weights: (1., 3.),
            ..Default::default()
        };
        assert_eq!(config.normalized_weights(), (0.25, 0.75));
    }
}
