//! Sequential-scan detection.
//!
//! Every fetched key is logged per file. When the latest fetches of a sheet
//! form a chain of row windows, each starting where the previous one ended,
//! the next window of the same size is suggested for prefetch.
use crate::cache::SectionKey;
use crate::governor::GovernorPolicy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use tracing::trace;

/// Keys remembered per file.
pub const PATTERN_CAPACITY: usize = 50;

/// Files whose state is kept at once; the least recently used one goes first.
pub const TRACKED_FILES: usize = 256;

const PAIR_CONFIDENCE: f32 = 0.6;
const CHAIN_CONFIDENCE: f32 = 0.85;

/// A range worth reading before it is requested.
#[derive(Clone, Debug, PartialEq)]
pub struct PrefetchHint {
    pub key: SectionKey,
    pub confidence: f32,
}

#[derive(Default)]
struct Patterns {
    clock: u64,
    files: HashMap<PathBuf, AccessPattern>,
}

struct AccessPattern {
    last_seen: u64,
    keys: VecDeque<SectionKey>,
}

#[derive(Default)]
pub struct PrefetchPredictor {
    patterns: Mutex<Patterns>,
}

impl PrefetchPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, key: &SectionKey) {
        let mut patterns = self.patterns.lock();
        patterns.clock += 1;
        let clock = patterns.clock;
        let path = &key.fingerprint.path;
        if !patterns.files.contains_key(path) && patterns.files.len() >= TRACKED_FILES {
            let oldest = patterns
                .files
                .iter()
                .min_by_key(|(_, pattern)| pattern.last_seen)
                .map(|(path, _)| path.clone());
            if let Some(oldest) = oldest {
                patterns.files.remove(&oldest);
            }
        }
        let pattern = patterns.files.entry(path.clone()).or_insert_with(|| AccessPattern {
            last_seen: clock,
            keys: VecDeque::new(),
        });
        pattern.last_seen = clock;
        if pattern.keys.len() == PATTERN_CAPACITY {
            pattern.keys.pop_front();
        }
        pattern.keys.push_back(key.clone());
    }

    /// Hints for `file`, based on the sheet of its most recent fetch.
    pub fn predict(&self, file: &Path, policy: &GovernorPolicy) -> Vec<PrefetchHint> {
        if !policy.prefetch_enabled {
            return Vec::new();
        }
        let patterns = self.patterns.lock();
        let Some(pattern) = patterns.files.get(file) else {
            return Vec::new();
        };
        let Some(latest) = pattern.keys.back() else {
            return Vec::new();
        };

        let mut chain = 1usize;
        let mut current = latest;
        for previous in pattern
            .keys
            .iter()
            .rev()
            .skip(1)
            .filter(|key| key.sheet_index == latest.sheet_index && key.fingerprint == latest.fingerprint)
        {
            if !previous.range.is_followed_by(&current.range) {
                break;
            }
            chain += 1;
            current = previous;
        }

        let confidence = match chain {
            1 => return Vec::new(),
            2 => PAIR_CONFIDENCE,
            _ => CHAIN_CONFIDENCE,
        };
        let hint = PrefetchHint {
            key: latest.with_range(latest.range.next_rows()),
            confidence,
        };
        trace!(range = %hint.key.range, confidence, chain, "Predict prefetch");
        vec![hint]
    }

    /// Drops the access log of `file`.
    pub fn forget(&self, file: &Path) {
        self.patterns.lock().files.remove(file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Fingerprint;
    use crate::config::Config;
    use crate::governor::GovernorState;
    use crate::selection::RangeSpec;

    fn key(file: &str, sheet_index: usize, start_row: usize, end_row: usize) -> SectionKey {
        SectionKey::new(
            Fingerprint {
                path: PathBuf::from(file),
                size: 1,
                modified: None,
            },
            sheet_index,
            RangeSpec::new(start_row, end_row, 0, 5).unwrap(),
        )
    }

    fn policy(prefetch_enabled: bool) -> GovernorPolicy {
        GovernorPolicy {
            prefetch_enabled,
            ..GovernorPolicy::new(GovernorState::Normal, false, &Config::default())
        }
    }

    #[test]
    fn adjacent_pair_then_chain() {
        let predictor = PrefetchPredictor::new();
        predictor.observe(&key("/a", 0, 0, 100));
        assert!(predictor.predict(Path::new("/a"), &policy(true)).is_empty());

        predictor.observe(&key("/a", 0, 100, 200));
        assert_eq!(
            predictor.predict(Path::new("/a"), &policy(true)),
            vec![PrefetchHint {
                key: key("/a", 0, 200, 300),
                confidence: 0.6,
            }]
        );

        predictor.observe(&key("/a", 0, 200, 300));
        let hints = predictor.predict(Path::new("/a"), &policy(true));
        assert_eq!(hints[0].key, key("/a", 0, 300, 400));
        assert_eq!(hints[0].confidence, 0.85);
    }

    #[test]
    fn other_sheets_do_not_break_the_chain() {
        let predictor = PrefetchPredictor::new();
        predictor.observe(&key("/a", 0, 0, 10));
        predictor.observe(&key("/a", 1, 50, 60));
        predictor.observe(&key("/a", 0, 10, 20));
        let hints = predictor.predict(Path::new("/a"), &policy(true));
        assert_eq!(hints[0].key, key("/a", 0, 20, 30));
        assert_eq!(hints[0].confidence, 0.6);
    }

    #[test]
    fn random_access_yields_nothing() {
        let predictor = PrefetchPredictor::new();
        for (start, end) in [(0, 10), (50, 60), (5, 15), (5, 15)] {
            predictor.observe(&key("/a", 0, start, end));
        }
        assert!(predictor.predict(Path::new("/a"), &policy(true)).is_empty());
    }

    #[test]
    fn disabled_policy_yields_nothing() {
        let predictor = PrefetchPredictor::new();
        predictor.observe(&key("/a", 0, 0, 10));
        predictor.observe(&key("/a", 0, 10, 20));
        assert!(predictor.predict(Path::new("/a"), &policy(false)).is_empty());
    }

    #[test]
    fn bounded_log_and_forget() {
        let predictor = PrefetchPredictor::new();
        for row in 0..200 {
            predictor.observe(&key("/a", 0, row, row + 1));
        }
        assert_eq!(predictor.patterns.lock().files[Path::new("/a")].keys.len(), PATTERN_CAPACITY);

        predictor.forget(Path::new("/a"));
        assert!(predictor.predict(Path::new("/a"), &policy(true)).is_empty());
    }

    #[test]
    fn least_recently_seen_file_is_dropped() {
        let predictor = PrefetchPredictor::new();
        for index in 0..TRACKED_FILES {
            predictor.observe(&key(&format!("/f{index}"), 0, 0, 10));
        }
        predictor.observe(&key("/f0", 0, 10, 20));
        predictor.observe(&key("/new", 0, 0, 10));

        let patterns = predictor.patterns.lock();
        assert_eq!(patterns.files.len(), TRACKED_FILES);
        assert!(patterns.files.contains_key(Path::new("/f0")));
        assert!(!patterns.files.contains_key(Path::new("/f1")));
    }
}
