//! Decoding of `ovn-nbctl --format=json` output.
//!
//! Tables come as `{"headings": [...], "data": [[cell, ...], ...]}` where a
//! cell is an atom, `["uuid", "..."]`, `["set", [...]]` or
//! `["map", [[k, v], ...]]`. One-element sets are usually written as the bare
//! atom and empty sets as `["set", []]`.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OvsdbJsonError {
    #[error("Couldn't parse the database output! {}", .0)]
    Syntax(String),
    #[error("Column {} is missing from the database output!", .0)]
    MissingColumn(String),
    #[error("Column {} has an unexpected shape: {}", .0, .1)]
    UnexpectedShape(String, String),
}

#[derive(Debug, Deserialize)]
struct RawTable {
    headings: Vec<String>,
    data: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    cells: BTreeMap<String, Value>,
}

pub fn parse_table(output: &str) -> Result<Vec<Row>, OvsdbJsonError> {
    if output.trim().is_empty() {
        return Ok(vec![]);
    }

    let table: RawTable =
        serde_json::from_str(output).map_err(|e| OvsdbJsonError::Syntax(e.to_string()))?;

    Ok(table
        .data
        .into_iter()
        .map(|cells| Row {
            cells: table.headings.iter().cloned().zip(cells).collect(),
        })
        .collect())
}

impl Row {
    fn cell(&self, column: &str) -> Result<&Value, OvsdbJsonError> {
        self.cells
            .get(column)
            .ok_or_else(|| OvsdbJsonError::MissingColumn(column.to_owned()))
    }

    fn shape_error(column: &str, value: &Value) -> OvsdbJsonError {
        OvsdbJsonError::UnexpectedShape(column.to_owned(), value.to_string())
    }

    /// Members of a set column; bare atoms count as one-element sets.
    fn members<'a>(&self, column: &str, value: &'a Value) -> Result<Vec<&'a Value>, OvsdbJsonError> {
        match value {
            Value::Array(pair) if pair.len() == 2 && pair[0] == "set" => match &pair[1] {
                Value::Array(members) => Ok(members.iter().collect()),
                other => Err(Self::shape_error(column, other)),
            },
            atom => Ok(vec![atom]),
        }
    }

    pub fn string(&self, column: &str) -> Result<String, OvsdbJsonError> {
        let value = self.cell(column)?;

        atom_string(value).ok_or_else(|| Self::shape_error(column, value))
    }

    /// Optional string column, i.e. a set with at most one member.
    pub fn optional_string(&self, column: &str) -> Result<Option<String>, OvsdbJsonError> {
        let value = self.cell(column)?;
        let members = self.members(column, value)?;

        match members.as_slice() {
            [] => Ok(None),
            [single] => atom_string(single)
                .map(Some)
                .ok_or_else(|| Self::shape_error(column, value)),
            _ => Err(Self::shape_error(column, value)),
        }
    }

    pub fn strings(&self, column: &str) -> Result<Vec<String>, OvsdbJsonError> {
        let value = self.cell(column)?;

        self.members(column, value)?
            .into_iter()
            .map(|member| atom_string(member).ok_or_else(|| Self::shape_error(column, value)))
            .collect()
    }

    pub fn uuid(&self, column: &str) -> Result<String, OvsdbJsonError> {
        let value = self.cell(column)?;

        uuid_atom(value).ok_or_else(|| Self::shape_error(column, value))
    }

    pub fn uuids(&self, column: &str) -> Result<Vec<String>, OvsdbJsonError> {
        let value = self.cell(column)?;

        self.members(column, value)?
            .into_iter()
            .map(|member| uuid_atom(member).ok_or_else(|| Self::shape_error(column, value)))
            .collect()
    }

    pub fn map(&self, column: &str) -> Result<BTreeMap<String, String>, OvsdbJsonError> {
        let value = self.cell(column)?;

        let pairs = match value {
            Value::Array(outer) if outer.len() == 2 && outer[0] == "map" => match &outer[1] {
                Value::Array(pairs) => pairs,
                _ => return Err(Self::shape_error(column, value)),
            },
            _ => return Err(Self::shape_error(column, value)),
        };

        pairs
            .iter()
            .map(|pair| match pair {
                Value::Array(kv) if kv.len() == 2 => atom_string(&kv[0])
                    .zip(atom_string(&kv[1]))
                    .ok_or_else(|| Self::shape_error(column, value)),
                _ => Err(Self::shape_error(column, value)),
            })
            .collect()
    }
}

fn atom_string(value: &Value) -> Option<String> {
    match value {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        Value::Bool(value) => Some(value.to_string()),
        other => uuid_atom(other),
    }
}

fn uuid_atom(value: &Value) -> Option<String> {
    match value {
        Value::Array(pair) if pair.len() == 2 && (pair[0] == "uuid" || pair[0] == "named-uuid") => {
            pair[1].as_str().map(str::to_owned)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::{parse_table, OvsdbJsonError};

    const SWITCH_PORTS: &str = r#"{
        "data": [
            [
                ["uuid", "1b4f7c0e-7d55-4a0c-9a76-7a3b1f0f5a10"],
                "default_web",
                "0a:58:0a:00:00:02 10.0.0.2",
                ["set", []],
                "",
                ["map", [["pod", "true"], ["namespace", "default"]]],
                ["set", ["a", "b"]]
            ]
        ],
        "headings": ["_uuid", "name", "addresses", "port_security", "type", "external_ids", "tag"]
    }"#;

    #[test]
    fn cells_decode_by_heading() {
        let rows = parse_table(SWITCH_PORTS).unwrap();
        let row = &rows[0];

        assert_eq!(rows.len(), 1);
        assert_eq!(row.uuid("_uuid").unwrap(), "1b4f7c0e-7d55-4a0c-9a76-7a3b1f0f5a10");
        assert_eq!(row.string("name").unwrap(), "default_web");
        assert_eq!(row.strings("addresses").unwrap(), vec!["0a:58:0a:00:00:02 10.0.0.2"]);
        assert!(row.strings("port_security").unwrap().is_empty());
        assert_eq!(row.optional_string("port_security").unwrap(), None);
        assert_eq!(row.strings("tag").unwrap(), vec!["a", "b"]);
        assert_eq!(
            row.map("external_ids").unwrap(),
            btreemap! {
                "namespace".to_owned() => "default".to_owned(),
                "pod".to_owned() => "true".to_owned(),
            }
        );
    }

    #[test]
    fn shape_mismatches_are_reported() {
        let rows = parse_table(SWITCH_PORTS).unwrap();

        assert!(matches!(
            rows[0].map("name"),
            Err(OvsdbJsonError::UnexpectedShape(..))
        ));
        assert_eq!(
            rows[0].string("options"),
            Err(OvsdbJsonError::MissingColumn("options".to_owned()))
        );
        assert!(matches!(
            rows[0].optional_string("tag"),
            Err(OvsdbJsonError::UnexpectedShape(..))
        ));
    }

    #[test]
    fn empty_output_is_an_empty_table() {
        assert!(parse_table("").unwrap().is_empty());
        assert!(parse_table(r#"{"headings": ["name"], "data": []}"#).unwrap().is_empty());
        assert!(matches!(parse_table("{"), Err(OvsdbJsonError::Syntax(_))));
    }
}
