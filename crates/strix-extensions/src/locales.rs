//! Per-extension localization tables.
//!
//! Extensions ship message tables under `_locales/<locale>/messages.json`
//! (`{ "key": { "message": "..." } }`). The resolver loads every table found
//! in the package and answers lookups for the active locale, falling back to
//! the manifest's default locale. Manifest fields may reference messages via
//! `__MSG_key__` placeholders, which are substituted at load time.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

/// Directory name holding locale subdirectories inside a package
pub const LOCALES_DIR: &str = "_locales";

/// File name of a locale message table
pub const MESSAGES_FILE: &str = "messages.json";

const MSG_PREFIX: &str = "__MSG_";
const MSG_SUFFIX: &str = "__";

#[derive(Debug, Deserialize)]
struct LocaleMessage {
    message: String,
}

/// Loaded locale tables for one extension
#[derive(Debug, Clone, Default)]
pub struct Locales {
    default_locale: Option<String>,
    tables: HashMap<String, HashMap<String, String>>,
}

impl Locales {
    /// Load every locale table found under `root/_locales`.
    ///
    /// A package without locales is valid; malformed tables are skipped with
    /// a debug log rather than failing the whole package.
    pub fn load(root: &Path, default_locale: Option<&str>) -> Self {
        let mut tables = HashMap::new();
        let locales_dir = root.join(LOCALES_DIR);

        if let Ok(entries) = fs::read_dir(&locales_dir) {
            for entry in entries.flatten() {
                let locale = entry.file_name().to_string_lossy().into_owned();
                let file = entry.path().join(MESSAGES_FILE);
                match fs::read_to_string(&file) {
                    Ok(raw) => {
                        match serde_json::from_str::<HashMap<String, LocaleMessage>>(&raw) {
                            Ok(parsed) => {
                                let table = parsed
                                    .into_iter()
                                    .map(|(key, msg)| (key, msg.message))
                                    .collect();
                                tables.insert(locale, table);
                            }
                            Err(e) => {
                                debug!("skipping malformed locale table {}: {}", file.display(), e);
                            }
                        }
                    }
                    Err(_) => {
                        debug!("no messages file for locale {}", locale);
                    }
                }
            }
        }

        Self {
            default_locale: default_locale.map(str::to_string),
            tables,
        }
    }

    /// Number of loaded locale tables
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Look up a message key for the given locale.
    ///
    /// Falls back to the language prefix (`en` for `en-US`) and then to the
    /// default locale before giving up.
    #[must_use]
    pub fn message(&self, locale: &str, key: &str) -> Option<&str> {
        if let Some(msg) = self.table_lookup(locale, key) {
            return Some(msg);
        }
        if let Some((lang, _)) = locale.split_once('-') {
            if let Some(msg) = self.table_lookup(lang, key) {
                return Some(msg);
            }
        }
        let default = self.default_locale.as_deref()?;
        self.table_lookup(default, key)
    }

    fn table_lookup(&self, locale: &str, key: &str) -> Option<&str> {
        self.tables.get(locale)?.get(key).map(String::as_str)
    }

    /// Substitute `__MSG_key__` placeholders in `text`.
    ///
    /// Unknown keys are left in place so a missing translation is visible
    /// instead of silently producing an empty field.
    #[must_use]
    pub fn localize(&self, locale: &str, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find(MSG_PREFIX) {
            out.push_str(&rest[..start]);
            let after_prefix = &rest[start + MSG_PREFIX.len()..];
            match after_prefix.find(MSG_SUFFIX) {
                Some(end) => {
                    let key = &after_prefix[..end];
                    match self.message(locale, key) {
                        Some(msg) => out.push_str(msg),
                        None => {
                            out.push_str(MSG_PREFIX);
                            out.push_str(key);
                            out.push_str(MSG_SUFFIX);
                        }
                    }
                    rest = &after_prefix[end + MSG_SUFFIX.len()..];
                }
                None => {
                    out.push_str(MSG_PREFIX);
                    rest = after_prefix;
                }
            }
        }
        out.push_str(rest);
        out
    }
}
