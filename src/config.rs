//! Tree configuration, loadable from TOML.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::types::{FosterError, Result};

/// Split-point heuristics. The defaults reproduce the classic foster B-tree
/// tuning; none of them affect correctness, only page fill.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SplitTuning {
    /// `|skew|` above which inserts count as skewed left or right.
    pub skew_threshold: i16,
    /// Skew above which right-skew is "extreme" regardless of record count.
    pub extreme_skew: i16,
    /// Right-skew is also extreme once it exceeds this fraction of the
    /// record count (numerator, over `extreme_skew_den`).
    pub extreme_skew_num: u16,
    /// Denominator for `extreme_skew_num`.
    pub extreme_skew_den: u16,
    /// A no-record split is premature while free space exceeds
    /// `used * norecord_used_multiplier / nrecs`...
    pub norecord_used_multiplier: u32,
    /// ...and also exceeds `page_size / norecord_min_free_divisor`.
    pub norecord_min_free_divisor: u32,
    /// Where a skewed split lands, as a percentage of the record count.
    pub skew_bias_percent: u8,
    /// The separator search window is `nrecs / fence_window_divisor` wide
    /// on each side of the split point.
    pub fence_window_divisor: u16,
    /// Absolute bound on the stored skew counter.
    pub skew_clamp: i16,
}

impl Default for SplitTuning {
    fn default() -> Self {
        Self {
            skew_threshold: 5,
            extreme_skew: 50,
            extreme_skew_num: 9,
            extreme_skew_den: 10,
            norecord_used_multiplier: 3,
            norecord_min_free_divisor: 10,
            skew_bias_percent: 90,
            fence_window_divisor: 10,
            skew_clamp: 100,
        }
    }
}

/// Configuration knobs for the foster B-tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BTreeOptions {
    /// Page size in bytes.
    pub page_size: u32,
    /// Optional cap on records per page, used to force splits in tests.
    pub max_records_per_page: Option<u16>,
    /// Adopt foster children into parents while descending.
    pub adopt_eagerly: bool,
    /// Restarts allowed after lock conflicts before giving up.
    pub max_lock_retries: u32,
    /// How long an unconditional key-lock request waits.
    pub lock_wait_ms: u64,
    /// Run page self-checks after every change, even in release builds.
    pub verify_on_write: bool,
    /// Split heuristics.
    pub split: SplitTuning,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_records_per_page: None,
            adopt_eagerly: true,
            max_lock_retries: 64,
            lock_wait_ms: 200,
            verify_on_write: false,
            split: SplitTuning::default(),
        }
    }
}

impl BTreeOptions {
    /// Parses options from TOML text; missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(text).map_err(|err| FosterError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Rejects values the page format or the split logic cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(FosterError::Config(format!(
                "page_size {} outside {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        if matches!(self.max_records_per_page, Some(cap) if cap < 2) {
            return Err(FosterError::Config(
                "max_records_per_page must be at least 2".into(),
            ));
        }
        let s = &self.split;
        if s.extreme_skew_den == 0 || s.norecord_min_free_divisor == 0 || s.fence_window_divisor == 0
        {
            return Err(FosterError::Config("split divisors must be non-zero".into()));
        }
        if !(50..100).contains(&s.skew_bias_percent) {
            return Err(FosterError::Config(
                "split.skew_bias_percent must be in 50..100".into(),
            ));
        }
        if s.skew_threshold <= 0 || s.skew_clamp < s.extreme_skew {
            return Err(FosterError::Config(
                "split skew thresholds are inconsistent".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_toml_keeps_defaults() -> Result<()> {
        let options = BTreeOptions::from_toml_str(
            r#"
            page_size = 4096
            max_records_per_page = 8

            [split]
            skew_bias_percent = 80
            "#,
        )?;
        assert_eq!(options.page_size, 4096);
        assert_eq!(options.max_records_per_page, Some(8));
        assert!(options.adopt_eagerly);
        assert_eq!(options.split.skew_bias_percent, 80);
        assert_eq!(options.split.skew_threshold, 5);
        Ok(())
    }

    #[test]
    fn rejects_bad_values_and_unknown_keys() {
        assert!(BTreeOptions::from_toml_str("page_size = 100").is_err());
        assert!(BTreeOptions::from_toml_str("max_records_per_page = 1").is_err());
        assert!(BTreeOptions::from_toml_str("no_such_knob = true").is_err());
        assert!(BTreeOptions::from_toml_str("[split]\nfence_window_divisor = 0").is_err());
    }

    #[test]
    fn load_reads_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "adopt_eagerly = false")?;
        let options = BTreeOptions::load(file.path())?;
        assert!(!options.adopt_eagerly);
        Ok(())
    }
}
