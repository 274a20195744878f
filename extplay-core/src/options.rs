//! Player option tables and the settings registry.
//!
//! Each player flavour carries a table of launch options keyed by a
//! stable name. Values arrive as strings from the embedding application
//! (configuration UI, or per-stream `sapp_` HTTP header overrides) and
//! are validated per key. The registry keeps one table per settings
//! profile so a media service, a dedicated player service and ad-hoc
//! user settings can coexist without global state.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

/// Reserved header namespace for per-stream option overrides. Headers
/// carrying this prefix are consumed locally and never forwarded to the
/// origin server.
pub const HEADER_OPTION_PREFIX: &str = "sapp_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("unknown option: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerOption {
    /// CLI flag the option renders to, e.g. `-v`.
    pub flag: &'static str,
    pub value: OptionValue,
    /// Options start unset and render nothing until updated.
    pub set: bool,
    /// Inclusive upper bound for integer options.
    pub max: Option<i64>,
}

/// Ordered option table for one player flavour.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptionSet {
    options: BTreeMap<&'static str, PlayerOption>,
}

impl OptionSet {
    fn insert(&mut self, key: &'static str, flag: &'static str, value: OptionValue) {
        self.options.insert(
            key,
            PlayerOption {
                flag,
                value,
                set: false,
                max: None,
            },
        );
    }

    fn insert_bounded(&mut self, key: &'static str, flag: &'static str, max: i64) {
        self.options.insert(
            key,
            PlayerOption {
                flag,
                value: OptionValue::Int(0),
                set: false,
                max: Some(max),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<&PlayerOption> {
        self.options.get(key)
    }

    /// Update one option from its string representation.
    ///
    /// Unknown keys and invalid values are distinct errors; neither stops
    /// the caller from applying the remaining keys of a batch.
    pub fn update(&mut self, key: &str, raw: &str) -> Result<(), OptionsError> {
        let option = self
            .options
            .get_mut(key)
            .ok_or_else(|| OptionsError::UnknownKey(key.to_string()))?;

        let invalid = |reason: &str| OptionsError::InvalidValue {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        match &mut option.value {
            OptionValue::Bool(b) => match raw {
                "0" => *b = false,
                "1" => *b = true,
                _ => return Err(invalid("expected \"0\" or \"1\"")),
            },
            OptionValue::Int(i) => {
                let parsed: i64 = raw
                    .parse()
                    .map_err(|_| invalid("expected a nonnegative integer"))?;
                if parsed < 0 {
                    return Err(invalid("expected a nonnegative integer"));
                }
                if let Some(max) = option.max {
                    if parsed > max {
                        return Err(invalid("value above the allowed maximum"));
                    }
                }
                *i = parsed;
            }
            OptionValue::Str(s) => {
                if raw.is_empty() {
                    return Err(invalid("expected a non-empty string"));
                }
                *s = raw.to_string();
            }
        }
        option.set = true;
        Ok(())
    }

    /// Render every set option as launch arguments: bare flag for true
    /// booleans, `flag value` pairs otherwise.
    pub fn argv_flags(&self) -> Vec<String> {
        let mut args = Vec::new();
        for option in self.options.values() {
            if !option.set {
                continue;
            }
            match &option.value {
                OptionValue::Bool(true) => args.push(option.flag.to_string()),
                OptionValue::Bool(false) => {}
                OptionValue::Int(i) => {
                    args.push(option.flag.to_string());
                    args.push(i.to_string());
                }
                OptionValue::Str(s) => {
                    args.push(option.flag.to_string());
                    args.push(s.clone());
                }
            }
        }
        args
    }

    /// Keys in table order, mostly useful for diagnostics and tests.
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.options.keys().copied()
    }
}

/// Default option table for the GStreamer flavour.
pub fn gst_options() -> OptionSet {
    let mut set = OptionSet::default();
    set.insert("videoSink", "-v", OptionValue::Str(String::new()));
    set.insert("audioSink", "-a", OptionValue::Str(String::new()));
    set.insert("subtitleEnabled", "-e", OptionValue::Bool(false));
    // Buffer limits are capped: 100 MB / 100 s.
    set.insert_bounded("bufferSize", "-s", 100);
    set.insert_bounded("bufferDuration", "-d", 100);
    set
}

/// Default option table for the exteplayer3 flavour (all toggles).
pub fn exteplayer3_options() -> OptionSet {
    let mut set = OptionSet::default();
    set.insert("aacSwDecoding", "-a", OptionValue::Bool(false));
    set.insert("dtsSwDecoding", "-d", OptionValue::Bool(false));
    set.insert("wmaSwDecoding", "-w", OptionValue::Bool(false));
    set.insert("lpcmInjection", "-l", OptionValue::Bool(false));
    set.insert("downmix", "-s", OptionValue::Bool(false));
    set
}

/// Split `sapp_`-prefixed override headers out of a header map.
///
/// Returns the cleaned headers (forwarded to the origin server) and the
/// override pairs with the prefix stripped, to be applied to an
/// [`OptionSet`] one by one.
pub fn split_option_headers(
    headers: &HashMap<String, String>,
) -> (HashMap<String, String>, Vec<(String, String)>) {
    let mut clean = HashMap::new();
    let mut overrides = Vec::new();
    for (key, value) in headers {
        match key.strip_prefix(HEADER_OPTION_PREFIX) {
            Some(option_key) => overrides.push((option_key.to_string(), value.clone())),
            None => {
                clean.insert(key.clone(), value.clone());
            }
        }
    }
    (clean, overrides)
}

/// Apply override pairs to an option set. Failures are logged per key
/// and do not abort the rest of the batch.
pub fn apply_overrides(set: &mut OptionSet, overrides: &[(String, String)]) {
    for (key, value) in overrides {
        if let Err(e) = set.update(key, value) {
            tracing::warn!("ignoring option override: {}", e);
        }
    }
}

// ============================================================================
// Settings registry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PlayerKind {
    Gst,
    ExtEplayer3,
}

/// Settings context an option table belongs to. `ServiceMp3` covers the
/// generic media service replacing the stock player, the two dedicated
/// profiles cover explicit service types, `User` holds ad-hoc settings
/// applied on top by the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SettingsProfile {
    ServiceMp3,
    ServiceGst,
    ServiceExt3,
    User,
}

const ALL_PROFILES: [SettingsProfile; 4] = [
    SettingsProfile::ServiceMp3,
    SettingsProfile::ServiceGst,
    SettingsProfile::ServiceExt3,
    SettingsProfile::User,
];

/// Per-profile option tables for both flavours, owned by the embedding
/// service factory and handed into player construction by reference.
#[derive(Debug, Clone)]
pub struct OptionsRegistry {
    tables: HashMap<(PlayerKind, SettingsProfile), OptionSet>,
}

impl Default for OptionsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionsRegistry {
    pub fn new() -> Self {
        let mut tables = HashMap::new();
        for profile in ALL_PROFILES {
            tables.insert((PlayerKind::Gst, profile), gst_options());
            tables.insert((PlayerKind::ExtEplayer3, profile), exteplayer3_options());
        }
        OptionsRegistry { tables }
    }

    /// Update one option in one profile's table.
    pub fn update(
        &mut self,
        kind: PlayerKind,
        profile: SettingsProfile,
        key: &str,
        raw: &str,
    ) -> Result<(), OptionsError> {
        self.tables
            .get_mut(&(kind, profile))
            .expect("registry is fully populated")
            .update(key, raw)
    }

    /// Snapshot of one profile's table, for player construction.
    pub fn options(&self, kind: PlayerKind, profile: SettingsProfile) -> OptionSet {
        self.tables
            .get(&(kind, profile))
            .expect("registry is fully populated")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_is_distinct_from_invalid_value() {
        let mut set = gst_options();
        assert_eq!(
            set.update("noSuchOption", "1"),
            Err(OptionsError::UnknownKey("noSuchOption".to_string()))
        );
        assert!(matches!(
            set.update("subtitleEnabled", "yes"),
            Err(OptionsError::InvalidValue { .. })
        ));
        // Failures leave the rest of the table usable.
        assert!(set.update("subtitleEnabled", "1").is_ok());
    }

    #[test]
    fn int_options_enforce_bounds() {
        let mut set = gst_options();
        assert!(set.update("bufferSize", "8").is_ok());
        assert!(matches!(
            set.update("bufferSize", "-1"),
            Err(OptionsError::InvalidValue { .. })
        ));
        assert!(matches!(
            set.update("bufferSize", "101"),
            Err(OptionsError::InvalidValue { .. })
        ));
        assert!(matches!(
            set.update("videoSink", ""),
            Err(OptionsError::InvalidValue { .. })
        ));
    }

    #[test]
    fn argv_flags_render_only_set_options() {
        let mut set = gst_options();
        assert!(set.argv_flags().is_empty());
        set.update("subtitleEnabled", "1").unwrap();
        set.update("bufferDuration", "3").unwrap();
        set.update("videoSink", "dvbvideosink").unwrap();
        let flags = set.argv_flags();
        assert!(flags.windows(2).any(|w| w == ["-d", "3"]));
        assert!(flags.windows(2).any(|w| w == ["-v", "dvbvideosink"]));
        assert!(flags.contains(&"-e".to_string()));
        // A false boolean renders nothing.
        set.update("subtitleEnabled", "0").unwrap();
        assert!(!set.argv_flags().contains(&"-e".to_string()));
    }

    #[test]
    fn argv_round_trips_through_the_option_table() {
        let mut set = gst_options();
        set.update("subtitleEnabled", "1").unwrap();
        set.update("bufferSize", "10").unwrap();
        set.update("audioSink", "dvbaudiosink").unwrap();
        let flags = set.argv_flags();

        // Parse the argv back against the same table definition.
        let mut parsed = gst_options();
        let mut i = 0;
        while i < flags.len() {
            let flag = &flags[i];
            let (key, option) = parsed
                .options
                .iter()
                .find(|(_, o)| o.flag == flag.as_str())
                .map(|(k, o)| (*k, o.clone()))
                .expect("flag belongs to the table");
            match option.value {
                OptionValue::Bool(_) => {
                    parsed.update(key, "1").unwrap();
                    i += 1;
                }
                _ => {
                    parsed.update(key, &flags[i + 1]).unwrap();
                    i += 2;
                }
            }
        }
        for key in set.keys().collect::<Vec<_>>() {
            let original = set.get(key).unwrap();
            let reparsed = parsed.get(key).unwrap();
            assert_eq!(original.set, reparsed.set, "{key}");
            assert_eq!(original.value, reparsed.value, "{key}");
        }
    }

    #[test]
    fn sapp_headers_are_split_off_and_applied() {
        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), "test-agent".to_string());
        headers.insert("sapp_subtitleEnabled".to_string(), "1".to_string());
        headers.insert("sapp_bogus".to_string(), "1".to_string());

        let (clean, overrides) = split_option_headers(&headers);
        assert_eq!(clean.len(), 1);
        assert!(clean.contains_key("User-Agent"));
        assert_eq!(overrides.len(), 2);

        let mut set = gst_options();
        apply_overrides(&mut set, &overrides);
        assert!(set.get("subtitleEnabled").unwrap().set);
    }

    #[test]
    fn registry_profiles_are_independent() {
        let mut registry = OptionsRegistry::new();
        registry
            .update(PlayerKind::Gst, SettingsProfile::User, "bufferSize", "5")
            .unwrap();
        let user = registry.options(PlayerKind::Gst, SettingsProfile::User);
        let service = registry.options(PlayerKind::Gst, SettingsProfile::ServiceGst);
        assert!(user.get("bufferSize").unwrap().set);
        assert!(!service.get("bufferSize").unwrap().set);
    }
}
