//! Bypass registry
//!
//! Named boolean flags that let an operator skip a safety check or lie
//! about the loaded plate. Some names come in exclusive pairs: setting one
//! clears its partner.

use crate::error::{SopError, SopResult};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Every bypassable subsystem, in reporting order
pub const BYPASS_NAMES: [&str; 11] = [
    "ffs",
    "ff_lamp",
    "hgcd_lamp",
    "ne_lamp",
    "axes",
    "brightPlate",
    "darkPlate",
    "gangCart",
    "gangPodium",
    "slewToField",
    "guiderDark",
];

const EXCLUSIVE_PAIRS: [(&str, &str); 2] = [("brightPlate", "darkPlate"), ("gangCart", "gangPodium")];

#[derive(Debug, Clone)]
pub struct Bypass {
    flags: Arc<RwLock<BTreeMap<&'static str, bool>>>,
}

impl Bypass {
    pub fn new() -> Self {
        let flags = BYPASS_NAMES.iter().map(|name| (*name, false)).collect();
        Self {
            flags: Arc::new(RwLock::new(flags)),
        }
    }

    fn canonical(name: &str) -> Option<&'static str> {
        BYPASS_NAMES.iter().copied().find(|n| *n == name)
    }

    /// Unknown names read as not bypassed
    pub fn get(&self, name: &str) -> bool {
        self.flags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(false)
    }

    /// Set a flag; returns the partner name that was cleared, if any
    pub fn set(&self, name: &str, bypassed: bool) -> SopResult<Option<&'static str>> {
        let name = Self::canonical(name).ok_or_else(|| SopError::UnknownBypass(name.to_string()))?;
        let mut flags = self.flags.write().unwrap_or_else(PoisonError::into_inner);
        flags.insert(name, bypassed);

        if !bypassed {
            return Ok(None);
        }
        let partner = EXCLUSIVE_PAIRS.iter().find_map(|(a, b)| {
            if *a == name {
                Some(*b)
            } else if *b == name {
                Some(*a)
            } else {
                None
            }
        });
        if let Some(partner) = partner {
            flags.insert(partner, false);
        }
        Ok(partner)
    }

    /// All flags in reporting order
    pub fn entries(&self) -> Vec<(&'static str, bool)> {
        let flags = self.flags.read().unwrap_or_else(PoisonError::into_inner);
        BYPASS_NAMES
            .iter()
            .map(|name| (*name, flags.get(name).copied().unwrap_or(false)))
            .collect()
    }

    pub fn bypassed_names(&self) -> Vec<&'static str> {
        self.entries()
            .into_iter()
            .filter(|(_, on)| *on)
            .map(|(name, _)| name)
            .collect()
    }
}

impl Default for Bypass {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_name_rejected() {
        let bypass = Bypass::new();
        assert_eq!(
            bypass.set("dome", true),
            Err(SopError::UnknownBypass("dome".to_string()))
        );
        assert!(!bypass.get("dome"));
    }

    #[test]
    fn test_plate_bypasses_are_exclusive() {
        let bypass = Bypass::new();
        bypass.set("darkPlate", true).unwrap();
        assert_eq!(bypass.set("brightPlate", true).unwrap(), Some("darkPlate"));
        assert!(bypass.get("brightPlate"));
        assert!(!bypass.get("darkPlate"));

        // Clearing does not touch the partner
        bypass.set("darkPlate", true).unwrap();
        assert_eq!(bypass.set("darkPlate", false).unwrap(), None);
        assert!(!bypass.get("brightPlate"));
    }

    #[test]
    fn test_entries_in_reporting_order() {
        let bypass = Bypass::new();
        bypass.set("axes", true).unwrap();
        let entries = bypass.entries();
        assert_eq!(entries.len(), BYPASS_NAMES.len());
        assert_eq!(entries[0], ("ffs", false));
        assert_eq!(entries[4], ("axes", true));
        assert_eq!(bypass.bypassed_names(), vec!["axes"]);
    }
}
