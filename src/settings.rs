//! Resolved per-target settings.
//!
//! Settings arrive already evaluated: this crate never expands macros, it
//! only reads string values and fills in a few path defaults.

use crate::hash::{Signature, SignatureHasher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PRODUCT_NAME: &str = "PRODUCT_NAME";
pub const PRODUCT_MODULE_NAME: &str = "PRODUCT_MODULE_NAME";
pub const PROJECT_DIR: &str = "PROJECT_DIR";
pub const PROJECT_TEMP_DIR: &str = "PROJECT_TEMP_DIR";
pub const BUILT_PRODUCTS_DIR: &str = "BUILT_PRODUCTS_DIR";
pub const TARGET_TEMP_DIR: &str = "TARGET_TEMP_DIR";
pub const SDKROOT: &str = "SDKROOT";
pub const TOOLCHAIN_DIR: &str = "TOOLCHAIN_DIR";
pub const ARCHS: &str = "ARCHS";
pub const CONFIGURATION: &str = "CONFIGURATION";
pub const CC: &str = "CC";
pub const SWIFTC: &str = "SWIFTC";
pub const LD: &str = "LD";
pub const LIBTOOL: &str = "LIBTOOL";
pub const OTHER_CFLAGS: &str = "OTHER_CFLAGS";
pub const OTHER_SWIFT_FLAGS: &str = "OTHER_SWIFT_FLAGS";
pub const OTHER_LDFLAGS: &str = "OTHER_LDFLAGS";
pub const ENABLE_COMPILE_CACHE: &str = "ENABLE_COMPILE_CACHE";
pub const COMPILATION_CACHE_CAS_PATH: &str = "COMPILATION_CACHE_CAS_PATH";
pub const COMPILATION_CACHE_PLUGIN_PATH: &str = "COMPILATION_CACHE_PLUGIN_PATH";
pub const COMPILATION_CACHE_REMOTE_SERVICE_PATH: &str = "COMPILATION_CACHE_REMOTE_SERVICE_PATH";
pub const ENABLE_PREFIX_MAPPING: &str = "ENABLE_PREFIX_MAPPING";
pub const OTHER_PREFIX_MAPPINGS: &str = "OTHER_PREFIX_MAPPINGS";
pub const LINK_DEPENDENCIES: &str = "LINK_DEPENDENCIES";
pub const VALIDATE_LINK_DEPENDENCIES: &str = "VALIDATE_LINK_DEPENDENCIES";
pub const MODULE_DEPENDENCIES: &str = "MODULE_DEPENDENCIES";
pub const VALIDATE_MODULE_DEPENDENCIES: &str = "VALIDATE_MODULE_DEPENDENCIES";
pub const DUMP_DEPENDENCIES: &str = "DUMP_DEPENDENCIES";
pub const PLATFORM_NAME: &str = "PLATFORM_NAME";

/// A flat map of setting name to evaluated value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<String, String>);

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|s| s.as_str())
    }

    pub fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    /// Boolean settings use "YES"/"NO"; anything else is false.
    pub fn bool(&self, name: &str) -> bool {
        matches!(self.get(name), Some("YES") | Some("yes") | Some("true") | Some("1"))
    }

    /// List settings are whitespace separated.
    pub fn list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn set_default(&mut self, name: &str, value: impl Into<String>) {
        if !self.0.contains_key(name) {
            self.0.insert(name.to_string(), value.into());
        }
    }

    /// Returns self with every entry of `over` applied on top.
    pub fn overlay(&self, over: &Settings) -> Settings {
        let mut merged = self.clone();
        for (k, v) in &over.0 {
            merged.0.insert(k.clone(), v.clone());
        }
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn write_signature(&self, hasher: &mut SignatureHasher) {
        hasher.write_u64(self.0.len() as u64);
        for (k, v) in &self.0 {
            hasher.write_str(k);
            hasher.write_str(v);
        }
    }

    pub fn signature(&self) -> Signature {
        let mut hasher = SignatureHasher::new("settings");
        self.write_signature(&mut hasher);
        hasher.finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Settings(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
