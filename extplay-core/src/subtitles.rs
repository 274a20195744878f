//! Subtitle cue storage ordered by display deadline.

use serde::Serialize;

/// One subtitle with absolute display times in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtitleCue {
    pub start_ms: u32,
    pub end_ms: u32,
    pub text: String,
}

/// Cues keyed by end time, so the next cue still worth showing at a given
/// playback position is a single lower-bound lookup.
#[derive(Debug, Default)]
pub struct CueMap {
    cues: std::collections::BTreeMap<u32, SubtitleCue>,
}

impl CueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a cue. A cue ending at the same millisecond replaces the
    /// earlier one.
    pub fn insert(&mut self, cue: SubtitleCue) {
        self.cues.insert(cue.end_ms, cue);
    }

    /// First cue whose end time has not passed at `now_ms`.
    pub fn next_relevant(&self, now_ms: u32) -> Option<&SubtitleCue> {
        self.cues.range(now_ms..).next().map(|(_, cue)| cue)
    }

    /// Drop every cue that ended at or before `now_ms`.
    pub fn prune(&mut self, now_ms: u32) {
        self.cues = self.cues.split_off(&now_ms);
    }

    pub fn clear(&mut self) {
        self.cues.clear();
    }

    pub fn len(&self) -> usize {
        self.cues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cue(start_ms: u32, end_ms: u32, text: &str) -> SubtitleCue {
        SubtitleCue {
            start_ms,
            end_ms,
            text: text.to_string(),
        }
    }

    #[test]
    fn next_relevant_is_a_lower_bound_on_end_time() {
        let mut map = CueMap::new();
        map.insert(cue(0, 1000, "first"));
        map.insert(cue(1500, 2500, "second"));

        assert_eq!(map.next_relevant(500).unwrap().text, "first");
        // First cue already over, second one is next.
        assert_eq!(map.next_relevant(1200).unwrap().text, "second");
        assert_eq!(map.next_relevant(2501), None);
    }

    #[test]
    fn prune_discards_expired_cues() {
        let mut map = CueMap::new();
        map.insert(cue(0, 1000, "a"));
        map.insert(cue(2000, 3000, "b"));
        map.prune(1500);
        assert_eq!(map.len(), 1);
        assert_eq!(map.next_relevant(0).unwrap().text, "b");
    }

    #[test]
    fn same_end_time_replaces() {
        let mut map = CueMap::new();
        map.insert(cue(0, 1000, "old"));
        map.insert(cue(100, 1000, "new"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.next_relevant(0).unwrap().text, "new");
    }
}
