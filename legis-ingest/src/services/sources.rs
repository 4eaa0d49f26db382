//! Upstream routes per collection
//!
//! Maps a [`FetchUnit`] to the detail request(s) that produce its record,
//! and a collection/congress pair to the list requests that enumerate its
//! units. Only paths and response shapes live here; the HTTP mechanics are
//! in `api_client`.

use crate::error::{IngestError, IngestResult};
use crate::models::{congress_years, Collection, FetchUnit};
use crate::services::api_client::ApiClient;
use serde_json::Value;
use std::ops::RangeInclusive;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Bill types tracked by Congress.gov
pub const BILL_TYPES: [&str; 8] = ["hr", "s", "hjres", "sjres", "hconres", "sconres", "hres", "sres"];

/// Sessions of one congress
pub const SESSIONS: [u32; 2] = [1, 2];

/// A nested list fetched with a second (paginated) call per logical unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubResource {
    pub path: String,
    /// Keys leading from the response root to the item array
    pub items: &'static [&'static str],
    /// Key the collected items are stored under in the record payload
    pub merge_key: &'static str,
}

/// Request(s) producing one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailRoute {
    pub path: String,
    /// Response key wrapping the entity; the record stores the unwrapped object
    pub envelope: Option<&'static str>,
    pub sub_resource: Option<SubResource>,
}

/// Detail route of a unit
pub fn detail_route(unit: &FetchUnit) -> IngestResult<DetailRoute> {
    let key = unit
        .collection
        .normalize_key(&unit.key)
        .map_err(IngestError::BadRequest)?;

    let route = match unit.collection {
        Collection::Bill => DetailRoute {
            path: format!("/bill/{}", key),
            envelope: Some("bill"),
            sub_resource: None,
        },
        Collection::Vote => DetailRoute {
            path: format!("/house-vote/{}", key),
            envelope: Some("houseRollCallVote"),
            sub_resource: Some(SubResource {
                path: format!("/house-vote/{}/members", key),
                items: &["houseRollCallVoteMemberVotes", "results"],
                merge_key: "members",
            }),
        },
        Collection::Member => DetailRoute {
            path: format!("/member/{}", key),
            envelope: Some("member"),
            sub_resource: None,
        },
        Collection::Committee => DetailRoute {
            path: format!("/committee/{}/{}", committee_chamber(&key)?, key),
            envelope: Some("committee"),
            sub_resource: None,
        },
        Collection::LobbyingFiling => DetailRoute {
            path: format!("/filings/{}/", key),
            envelope: None,
            sub_resource: None,
        },
    };
    Ok(route)
}

/// Chamber segment of a committee system code ("hsag00" → "house")
pub fn committee_chamber(system_code: &str) -> IngestResult<&'static str> {
    match system_code.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('h') => Ok("house"),
        Some('s') => Ok("senate"),
        Some('j') => Ok("joint"),
        _ => Err(IngestError::BadRequest(format!(
            "committee system code {:?} does not start with h, s or j",
            system_code
        ))),
    }
}

/// What to enumerate for one collection and congress
#[derive(Debug, Clone, Default)]
pub struct Enumeration {
    /// Vote sessions; empty means both
    pub sessions: Vec<u32>,
    /// Bill types; empty means all
    pub bill_types: Vec<String>,
    /// Explicit number range (bill numbers or roll numbers) instead of
    /// asking upstream for the count
    pub range: Option<RangeInclusive<u32>>,
}

/// Enumerate the units of `collection` for `congress`
pub async fn enumerate_units(
    client: &ApiClient,
    collection: Collection,
    congress: u32,
    request: &Enumeration,
    cancel: &CancellationToken,
) -> IngestResult<Vec<FetchUnit>> {
    let units = match collection {
        Collection::Bill => {
            let types: Vec<String> = if request.bill_types.is_empty() {
                BILL_TYPES.iter().map(|t| t.to_string()).collect()
            } else {
                request.bill_types.iter().map(|t| t.to_lowercase()).collect()
            };

            let mut units = Vec::new();
            for bill_type in types {
                let range = match &request.range {
                    Some(range) => range.clone(),
                    None => {
                        let count = client
                            .count(&format!("/bill/{}/{}", congress, bill_type), cancel)
                            .await?;
                        1..=count as u32
                    }
                };
                debug!(congress, bill_type = %bill_type, count = range.clone().count(), "Enumerated bill numbers");
                units.extend(range.map(|n| {
                    FetchUnit::new(collection, congress, format!("{}/{}/{}", congress, bill_type, n))
                }));
            }
            units
        }
        Collection::Vote => {
            let sessions: Vec<u32> = if request.sessions.is_empty() {
                SESSIONS.to_vec()
            } else {
                request.sessions.clone()
            };

            let mut units = Vec::new();
            for session in sessions {
                let range = match &request.range {
                    Some(range) => range.clone(),
                    None => {
                        let count = client
                            .count(&format!("/house-vote/{}/{}", congress, session), cancel)
                            .await?;
                        1..=count as u32
                    }
                };
                units.extend(range.map(|roll| {
                    FetchUnit::new(collection, congress, format!("{}/{}/{}", congress, session, roll))
                }));
            }
            units
        }
        Collection::Member => {
            let items = client
                .list(&format!("/member/congress/{}", congress), &[], &["members"], cancel)
                .await?;
            keys_from(&items, "bioguideId")
                .into_iter()
                .map(|id| FetchUnit::new(collection, congress, id))
                .collect()
        }
        Collection::Committee => {
            let items = client
                .list(&format!("/committee/{}", congress), &[], &["committees"], cancel)
                .await?;
            keys_from(&items, "systemCode")
                .into_iter()
                .map(|code| FetchUnit::new(collection, congress, code))
                .collect()
        }
        Collection::LobbyingFiling => {
            let mut units = Vec::new();
            for year in congress_years(congress) {
                let query = [("filing_year".to_string(), year.to_string())];
                let items = client.list("/filings/", &query, &["results"], cancel).await?;
                units.extend(
                    keys_from(&items, "filing_uuid")
                        .into_iter()
                        .map(|uuid| FetchUnit::new(collection, congress, uuid)),
                );
            }
            units
        }
    };

    info!(collection = %collection, congress, units = units.len(), "Enumeration complete");
    Ok(units)
}

/// String values of `field`, de-duplicated, in first-seen order
fn keys_from(items: &[Value], field: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .iter()
        .filter_map(|item| item.get(field).and_then(Value::as_str))
        .filter(|key| !key.trim().is_empty())
        .filter(|key| seen.insert(key.to_string()))
        .map(str::to_string)
        .collect()
}

/// Follow `path` (a list of object keys) from `value`
pub fn select<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(*key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detail_routes() {
        let bill = FetchUnit::new(Collection::Bill, 118, "118/HR/82");
        let route = detail_route(&bill).unwrap();
        assert_eq!(route.path, "/bill/118/hr/82");
        assert_eq!(route.envelope, Some("bill"));

        let vote = FetchUnit::new(Collection::Vote, 118, "118/1/290");
        let route = detail_route(&vote).unwrap();
        assert_eq!(route.path, "/house-vote/118/1/290");
        assert_eq!(route.sub_resource.unwrap().path, "/house-vote/118/1/290/members");

        let committee = FetchUnit::new(Collection::Committee, 118, "ssju00");
        assert_eq!(detail_route(&committee).unwrap().path, "/committee/senate/ssju00");

        let filing = FetchUnit::new(Collection::LobbyingFiling, 118, "abc-123");
        let route = detail_route(&filing).unwrap();
        assert_eq!(route.path, "/filings/abc-123/");
        assert!(route.envelope.is_none());
    }

    #[test]
    fn test_bad_keys_rejected() {
        let committee = FetchUnit::new(Collection::Committee, 118, "xyz00");
        assert!(matches!(detail_route(&committee), Err(IngestError::BadRequest(_))));

        let bill = FetchUnit::new(Collection::Bill, 118, "hr-82");
        assert!(detail_route(&bill).is_err());
    }

    #[test]
    fn test_keys_from_dedups_and_skips_missing() {
        let items = vec![
            json!({"bioguideId": "A000001"}),
            json!({"bioguideId": "B000002"}),
            json!({"bioguideId": "A000001"}),
            json!({"name": "no id"}),
        ];
        assert_eq!(keys_from(&items, "bioguideId"), vec!["A000001", "B000002"]);
    }

    #[test]
    fn test_select_nested() {
        let value = json!({"a": {"b": [1, 2]}});
        assert_eq!(select(&value, &["a", "b"]), Some(&json!([1, 2])));
        assert!(select(&value, &["a", "c"]).is_none());
        assert_eq!(select(&value, &[]), Some(&value));
    }
}
