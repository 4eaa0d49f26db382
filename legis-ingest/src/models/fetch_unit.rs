//! Units of fetch work
//!
//! A `FetchUnit` names one upstream entity ("bill 118/hr/82", "vote roll
//! 118/1/290"). Units are immutable: enumeration produces them, a worker
//! consumes each one once.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Upstream API a collection is served by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    /// Congress.gov API
    Congress,
    /// Senate Lobbying Disclosure Act API
    Lda,
}

impl SourceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Congress => "congress",
            SourceId::Lda => "lda",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of fetchable entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Bill,
    Vote,
    Member,
    LobbyingFiling,
    Committee,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Member,
        Collection::Committee,
        Collection::Bill,
        Collection::Vote,
        Collection::LobbyingFiling,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Bill => "bill",
            Collection::Vote => "vote",
            Collection::Member => "member",
            Collection::LobbyingFiling => "lobbyingFiling",
            Collection::Committee => "committee",
        }
    }

    /// Directory name used by the record store
    pub fn dir_name(&self) -> &'static str {
        match self {
            Collection::LobbyingFiling => "lobbying-filing",
            other => other.as_str(),
        }
    }

    pub fn source(&self) -> SourceId {
        match self {
            Collection::LobbyingFiling => SourceId::Lda,
            _ => SourceId::Congress,
        }
    }

    /// Validate and normalize an operator-supplied unit key
    ///
    /// Bill types are lower-cased so "118/HR/82" and "118/hr/82" name the
    /// same unit.
    pub fn normalize_key(&self, key: &str) -> Result<String, String> {
        let key = key.trim();
        if key.is_empty() || key.contains("..") || key.contains('\\') {
            return Err(format!("invalid {} key: {:?}", self, key));
        }

        let normalized = match self {
            Collection::Bill => {
                let parts: Vec<&str> = key.split('/').collect();
                match parts.as_slice() {
                    [congress, bill_type, number]
                        if congress.parse::<u32>().is_ok() && number.parse::<u32>().is_ok() =>
                    {
                        Ok(format!("{}/{}/{}", congress, bill_type.to_lowercase(), number))
                    }
                    _ => Err(format!("bill key must be congress/type/number, got {:?}", key)),
                }
            }
            Collection::Vote => {
                let parts: Vec<&str> = key.split('/').collect();
                if parts.len() == 3 && parts.iter().all(|p| p.parse::<u32>().is_ok()) {
                    Ok(key.to_string())
                } else {
                    Err(format!("vote key must be congress/session/roll, got {:?}", key))
                }
            }
            Collection::Member | Collection::Committee | Collection::LobbyingFiling => {
                if key.contains('/') {
                    Err(format!("{} key must not contain '/', got {:?}", self, key))
                } else {
                    Ok(key.to_string())
                }
            }
        }?;

        // Record ids must not shadow the index files or a versioned record file
        let id = record_id_for_key(&normalized);
        if id.starts_with('_') || has_version_suffix(&id) {
            return Err(format!("{} key {:?} collides with a store file name", self, key));
        }
        Ok(normalized)
    }
}

/// `true` for keys ending in `.v<digits>`, the suffix of versioned record files
fn has_version_suffix(key: &str) -> bool {
    match key.rsplit_once(".v") {
        Some((_, digits)) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "bill" | "bills" => Ok(Collection::Bill),
            "vote" | "votes" => Ok(Collection::Vote),
            "member" | "members" => Ok(Collection::Member),
            "committee" | "committees" => Ok(Collection::Committee),
            "lobbyingfiling" | "lobbyingfilings" | "filing" | "filings" => {
                Ok(Collection::LobbyingFiling)
            }
            other => Err(format!("unknown collection: {}", other)),
        }
    }
}

/// Key of the record collection holding one collection of one congress
pub fn collection_key(collection: Collection, congress: u32) -> String {
    format!("{}-{}", collection.dir_name(), congress)
}

/// File-safe record id derived from a unit key
///
/// "118/hr/82" becomes "118-hr-82"; characters outside `[A-Za-z0-9._-]`
/// become '_'.
pub fn record_id_for_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' => '-',
            c if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' => c,
            _ => '_',
        })
        .collect()
}

/// One fetchable entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchUnit {
    pub collection: Collection,
    pub congress: u32,
    pub key: String,
    /// Extra query parameters for the detail request
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl FetchUnit {
    pub fn new(collection: Collection, congress: u32, key: impl Into<String>) -> Self {
        Self {
            collection,
            congress,
            key: key.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn collection_key(&self) -> String {
        collection_key(self.collection, self.congress)
    }

    pub fn record_id(&self) -> String {
        record_id_for_key(&self.key)
    }
}

impl fmt::Display for FetchUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.collection, self.key)
    }
}

/// Calendar years covered by a congress (congress N starts in 1789 + 2(N-1))
pub fn congress_years(congress: u32) -> [u32; 2] {
    let first = 1789 + 2 * congress.saturating_sub(1);
    [first, first + 1]
}
