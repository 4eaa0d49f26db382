//! Record → target row transforms
//!
//! Payload field names follow the upstream JSON (camelCase for Congress.gov,
//! snake_case for LDA). Natural keys come from the record id, which the
//! fetch side derived from the unit key, so a validation pass can compare
//! source ids and target keys directly.

use crate::db::rows::{
    BillRow, CommitteeRow, FilingRow, MemberRow, TargetRow, VotePositionRow, VoteRow,
};
use crate::error::{IngestError, IngestResult};
use crate::models::{EntityType, Record};
use serde_json::Value;

/// Transform one record into its target row
pub fn transform(entity_type: EntityType, record: &Record) -> IngestResult<TargetRow> {
    let checksum = record.checksum();
    match entity_type {
        EntityType::Member => member_row(record, checksum).map(TargetRow::Member),
        EntityType::Committee => committee_row(record, checksum).map(TargetRow::Committee),
        EntityType::Bill => bill_row(record, checksum).map(TargetRow::Bill),
        EntityType::Vote => vote_row(record, checksum).map(TargetRow::Vote),
        EntityType::LobbyingFiling => filing_row(record, checksum).map(TargetRow::Filing),
    }
}

fn invalid(record: &Record, message: impl Into<String>) -> IngestError {
    IngestError::Transform {
        id: record.id.clone(),
        message: message.into(),
    }
}

/// Non-empty string at `key`
fn text(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Integer at `key`, accepting numeric strings
fn integer(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Decimal at `key`, accepting numeric strings ("12000.00")
fn decimal(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

/// Array at `key`, also accepting the `{"item": [...]}` wrapping
fn list<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    let inner = value.get(key);
    let array = match inner {
        Some(Value::Object(map)) => map.get("item"),
        other => other,
    };
    array.and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

/// Segments of a record id: "118-hr-82" → ["118", "hr", "82"]
fn id_parts(record: &Record) -> Vec<&str> {
    record.id.split('-').collect()
}

fn member_row(record: &Record, checksum: String) -> IngestResult<MemberRow> {
    let p = &record.payload;

    let full_name = text(p, "directOrderName")
        .or_else(|| text(p, "name"))
        .or_else(|| text(p, "invertedOrderName"))
        .or_else(|| match (text(p, "firstName"), text(p, "lastName")) {
            (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
            (None, Some(last)) => Some(last),
            _ => None,
        })
        .ok_or_else(|| invalid(record, "member has no name"))?;

    let party = list(p, "partyHistory")
        .last()
        .and_then(|entry| text(entry, "partyAbbreviation").or_else(|| text(entry, "partyName")))
        .or_else(|| text(p, "partyName"));

    let chamber = list(p, "terms")
        .last()
        .and_then(|term| text(term, "chamber"));

    Ok(MemberRow {
        bioguide_id: record.id.clone(),
        full_name,
        party,
        state: text(p, "state"),
        district: integer(p, "district"),
        chamber,
        source_checksum: checksum,
    })
}

fn committee_row(record: &Record, checksum: String) -> IngestResult<CommitteeRow> {
    let p = &record.payload;

    let name = text(p, "name")
        .or_else(|| {
            list(p, "history")
                .first()
                .and_then(|h| text(h, "officialName").or_else(|| text(h, "libraryOfCongressName")))
        })
        .ok_or_else(|| invalid(record, "committee has no name"))?;

    let chamber = text(p, "chamber").or_else(|| {
        match record.id.chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('h') => Some("House".to_string()),
            Some('s') => Some("Senate".to_string()),
            Some('j') => Some("Joint".to_string()),
            _ => None,
        }
    });

    Ok(CommitteeRow {
        system_code: record.id.clone(),
        name,
        chamber,
        committee_type: text(p, "type").or_else(|| text(p, "committeeTypeCode")),
        parent_system_code: p.get("parent").and_then(|parent| text(parent, "systemCode")),
        source_checksum: checksum,
    })
}

fn bill_row(record: &Record, checksum: String) -> IngestResult<BillRow> {
    let p = &record.payload;

    let (congress, bill_type, bill_number) = match id_parts(record).as_slice() {
        [congress, bill_type, number] => (
            congress.parse::<i64>().ok(),
            bill_type.to_lowercase(),
            number.parse::<i64>().ok(),
        ),
        _ => return Err(invalid(record, "bill id is not congress-type-number")),
    };
    let congress = integer(p, "congress")
        .or(congress)
        .ok_or_else(|| invalid(record, "bill has no congress"))?;
    let bill_number = bill_number
        .or_else(|| integer(p, "number"))
        .ok_or_else(|| invalid(record, "bill has no number"))?;

    let title = text(p, "title").ok_or_else(|| invalid(record, "bill has no title"))?;
    let latest_action = p.get("latestAction");

    Ok(BillRow {
        bill_id: record.id.clone(),
        congress,
        bill_type,
        bill_number,
        title,
        introduced_date: text(p, "introducedDate"),
        sponsor_bioguide_id: list(p, "sponsors").first().and_then(|s| text(s, "bioguideId")),
        policy_area: p.get("policyArea").and_then(|a| text(a, "name")),
        latest_action_date: latest_action.and_then(|a| text(a, "actionDate")),
        latest_action_text: latest_action.and_then(|a| text(a, "text")),
        source_checksum: checksum,
    })
}

fn vote_row(record: &Record, checksum: String) -> IngestResult<VoteRow> {
    let p = &record.payload;

    let parts: Vec<i64> = id_parts(record)
        .iter()
        .filter_map(|part| part.parse().ok())
        .collect();
    let &[congress, session, roll_number] = parts.as_slice() else {
        return Err(invalid(record, "vote id is not congress-session-roll"));
    };

    // "HR" + "82" → "118-hr-82", the bill's record id
    let bill_id = match (text(p, "legislationType"), text(p, "legislationNumber")) {
        (Some(kind), Some(number)) => {
            let kind: String = kind
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            Some(format!("{}-{}-{}", congress, kind, number))
        }
        _ => None,
    };

    let positions = p
        .get("members")
        .and_then(Value::as_array)
        .map(|members| {
            members
                .iter()
                .filter_map(|m| {
                    let bioguide_id = text(m, "bioguideID").or_else(|| text(m, "bioguideId"))?;
                    Some(VotePositionRow {
                        bioguide_id,
                        position: text(m, "voteCast").unwrap_or_else(|| "Not Voting".to_string()),
                        party: text(m, "voteParty"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(VoteRow {
        vote_id: record.id.clone(),
        congress,
        session,
        roll_number,
        chamber: text(p, "chamber").unwrap_or_else(|| "House".to_string()),
        vote_date: text(p, "startDate").or_else(|| text(p, "date")),
        question: text(p, "voteQuestion").or_else(|| text(p, "question")),
        result: text(p, "result"),
        bill_id,
        positions,
        source_checksum: checksum,
    })
}

fn filing_row(record: &Record, checksum: String) -> IngestResult<FilingRow> {
    let p = &record.payload;
    if !p.is_object() {
        return Err(invalid(record, "filing payload is not an object"));
    }

    Ok(FilingRow {
        filing_uuid: record.id.clone(),
        filing_year: integer(p, "filing_year"),
        filing_period: text(p, "filing_period"),
        filing_type: text(p, "filing_type"),
        registrant_name: p.get("registrant").and_then(|r| text(r, "name")),
        client_name: p.get("client").and_then(|c| text(c, "name")),
        income: decimal(p, "income"),
        expenses: decimal(p, "expenses"),
        posted_at: text(p, "dt_posted"),
        source_checksum: checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bill_row_from_payload() {
        let record = Record::new(
            "bill-118",
            "118-hr-82",
            json!({
                "congress": 118,
                "type": "HR",
                "number": "82",
                "title": "Social Security Fairness Act of 2023",
                "introducedDate": "2023-01-09",
                "sponsors": [{"bioguideId": "G000553"}],
                "policyArea": {"name": "Social Welfare"},
                "latestAction": {"actionDate": "2025-01-05", "text": "Became Public Law"}
            }),
        );

        let TargetRow::Bill(row) = transform(EntityType::Bill, &record).unwrap() else {
            panic!("expected bill row");
        };
        assert_eq!(row.bill_id, "118-hr-82");
        assert_eq!(row.bill_type, "hr");
        assert_eq!(row.bill_number, 82);
        assert_eq!(row.sponsor_bioguide_id.as_deref(), Some("G000553"));
        assert_eq!(row.policy_area.as_deref(), Some("Social Welfare"));
        assert_eq!(row.source_checksum, record.checksum());
    }

    #[test]
    fn test_bill_without_title_rejected() {
        let record = Record::new("bill-118", "118-s-1", json!({"congress": 118}));
        assert!(matches!(
            transform(EntityType::Bill, &record),
            Err(IngestError::Transform { .. })
        ));
    }

    #[test]
    fn test_vote_row_links_bill_and_positions() {
        let record = Record::new(
            "vote-118",
            "118-1-290",
            json!({
                "startDate": "2023-06-21T12:00:00-04:00",
                "voteQuestion": "On Passage",
                "result": "Passed",
                "legislationType": "HR",
                "legislationNumber": "82",
                "members": [
                    {"bioguideID": "A000001", "voteCast": "Yea", "voteParty": "D"},
                    {"bioguideID": "B000002", "voteCast": "Nay", "voteParty": "R"},
                    {"voteCast": "Yea"}
                ]
            }),
        );

        let TargetRow::Vote(row) = transform(EntityType::Vote, &record).unwrap() else {
            panic!("expected vote row");
        };
        assert_eq!((row.congress, row.session, row.roll_number), (118, 1, 290));
        assert_eq!(row.bill_id.as_deref(), Some("118-hr-82"));
        assert_eq!(row.positions.len(), 2);
        assert_eq!(row.chamber, "House");
    }

    #[test]
    fn test_member_row_handles_item_wrapping() {
        let record = Record::new(
            "member-118",
            "P000197",
            json!({
                "directOrderName": "Nancy Pelosi",
                "state": "California",
                "district": 11,
                "partyHistory": [{"partyAbbreviation": "D"}],
                "terms": {"item": [{"chamber": "House of Representatives"}]}
            }),
        );

        let TargetRow::Member(row) = transform(EntityType::Member, &record).unwrap() else {
            panic!("expected member row");
        };
        assert_eq!(row.full_name, "Nancy Pelosi");
        assert_eq!(row.party.as_deref(), Some("D"));
        assert_eq!(row.district, Some(11));
        assert_eq!(row.chamber.as_deref(), Some("House of Representatives"));
    }

    #[test]
    fn test_committee_chamber_from_system_code() {
        let record = Record::new("committee-118", "ssju00", json!({"name": "Judiciary"}));
        let TargetRow::Committee(row) = transform(EntityType::Committee, &record).unwrap() else {
            panic!("expected committee row");
        };
        assert_eq!(row.chamber.as_deref(), Some("Senate"));
    }

    #[test]
    fn test_filing_amounts_parse_from_strings() {
        let record = Record::new(
            "lobbying-filing-118",
            "f1",
            json!({
                "filing_year": 2023,
                "filing_period": "first_quarter",
                "income": "12,000.00",
                "expenses": null,
                "registrant": {"name": "Acme Advocacy"},
                "client": {"name": "Widgets Inc"}
            }),
        );
        let TargetRow::Filing(row) = transform(EntityType::LobbyingFiling, &record).unwrap() else {
            panic!("expected filing row");
        };
        assert_eq!(row.income, Some(12_000.0));
        assert_eq!(row.expenses, None);
        assert_eq!(row.client_name.as_deref(), Some("Widgets Inc"));
    }
}
