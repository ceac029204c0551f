//! Storage tier ordinal / alias association.

use std::collections::HashMap;

use crate::error::ConfigError;

/// Default worker tiers, fastest first.
pub const DEFAULT_TIER_ALIASES: [&str; 3] = ["MEM", "SSD", "HDD"];

/// Ordinal rank 0 is the tier new temp blocks are created on.
pub const TEMP_BLOCK_TIER_ORDINAL: usize = 0;

/// Stable mapping between tier ordinals and their aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTierAssoc {
    aliases: Vec<String>,
    ordinals: HashMap<String, usize>,
}

impl StorageTierAssoc {
    /// Builds the association from aliases listed in ordinal order.
    pub fn new<I, S>(aliases: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let aliases: Vec<String> = aliases.into_iter().map(Into::into).collect();
        if aliases.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one storage tier is required".to_string(),
            ));
        }
        let mut ordinals = HashMap::with_capacity(aliases.len());
        for (ordinal, alias) in aliases.iter().enumerate() {
            if alias.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "tier alias at ordinal {ordinal} is blank"
                )));
            }
            if ordinals.insert(alias.clone(), ordinal).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tier alias {alias}"
                )));
            }
        }
        Ok(Self { aliases, ordinals })
    }

    /// MEM, SSD, HDD.
    pub fn worker_default() -> Self {
        let aliases: Vec<String> = DEFAULT_TIER_ALIASES.iter().map(|a| a.to_string()).collect();
        let ordinals = aliases
            .iter()
            .enumerate()
            .map(|(ordinal, alias)| (alias.clone(), ordinal))
            .collect();
        Self { aliases, ordinals }
    }

    pub fn alias(&self, ordinal: usize) -> Option<&str> {
        self.aliases.get(ordinal).map(String::as_str)
    }

    pub fn ordinal(&self, alias: &str) -> Option<usize> {
        self.ordinals.get(alias).copied()
    }

    /// Alias of the tier temp blocks are created on.
    pub fn temp_block_alias(&self) -> &str {
        &self.aliases[TEMP_BLOCK_TIER_ORDINAL]
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.aliases.iter().map(String::as_str)
    }
}

impl Default for StorageTierAssoc {
    fn default() -> Self {
        Self::worker_default()
    }
}
