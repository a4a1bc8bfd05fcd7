//! In-memory measurement metadata.
//!
//! The publisher filters subscriptions against a flattened
//! `ActiveMeasurements` table: one row per available signal, carrying the
//! measurement key (`SOURCE:ID`), the signal's UUID, its type, and a
//! description. Filter expressions select rows either declaratively
//! (`FILTER ActiveMeasurements WHERE SignalType='FREQ'`) or as a
//! semicolon-separated list of signal IDs or measurement keys.

use std::collections::HashMap;

use uuid::Uuid;

pub const ACTIVE_MEASUREMENTS: &str = "ActiveMeasurements";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown table \"{0}\"")]
    UnknownTable(String),
    #[error("unknown column \"{0}\"")]
    UnknownColumn(String),
    #[error("filter syntax error: {0}")]
    Syntax(String),
}

/// One row of the `ActiveMeasurements` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeasurementRecord {
    pub signal_id: Uuid,
    /// Measurement key in `SOURCE:ID` form.
    pub key: String,
    pub signal_type: String,
    pub description: String,
}

impl MeasurementRecord {
    /// Column lookup by case-insensitive name.
    pub fn field(&self, column: &str) -> Option<String> {
        match column.to_ascii_lowercase().as_str() {
            "id" => Some(self.key.clone()),
            "signalid" => Some(self.signal_id.to_string()),
            "signaltype" => Some(self.signal_type.clone()),
            "description" => Some(self.description.clone()),
            _ => None,
        }
    }
}

/// The in-memory dataset the publisher evaluates filters against.
#[derive(Clone, Debug, Default)]
pub struct MetadataSet {
    rows: Vec<MeasurementRecord>,
}

impl MetadataSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_record(
        &mut self,
        signal_id: Uuid,
        key: impl Into<String>,
        signal_type: impl Into<String>,
        description: impl Into<String>,
    ) {
        self.rows.push(MeasurementRecord {
            signal_id,
            key: key.into(),
            signal_type: signal_type.into(),
            description: description.into(),
        });
    }

    pub fn rows(&self) -> &[MeasurementRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Evaluate a filter expression, returning selected rows in declaration
    /// order. An empty expression selects no signals.
    pub fn evaluate_filter(&self, expression: &str) -> Result<Vec<MeasurementRecord>> {
        let expression = expression.trim();
        if expression.is_empty() || expression == Uuid::nil().to_string() {
            return Ok(Vec::new());
        }

        if expression.to_ascii_lowercase().starts_with("filter ") {
            return self.evaluate_declarative(expression);
        }

        // Direct selection: signal IDs or measurement keys, semicolon separated.
        let mut selected = Vec::new();
        for term in expression.split(';') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let matched = if let Ok(signal_id) = term.parse::<Uuid>() {
                self.rows.iter().find(|row| row.signal_id == signal_id)
            } else {
                self.rows
                    .iter()
                    .find(|row| row.key.eq_ignore_ascii_case(term))
            };
            match matched {
                Some(row) => selected.push(row.clone()),
                None => {
                    return Err(Error::Syntax(format!(
                        "no measurement matches selection term \"{term}\""
                    )))
                }
            }
        }
        Ok(selected)
    }

    fn evaluate_declarative(&self, expression: &str) -> Result<Vec<MeasurementRecord>> {
        // FILTER <table> WHERE <column>='<value>'
        let rest = &expression[7..];
        let (table, rest) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::Syntax("expected table name after FILTER".into()))?;
        if !table.eq_ignore_ascii_case(ACTIVE_MEASUREMENTS) {
            return Err(Error::UnknownTable(table.to_string()));
        }

        let rest = rest.trim_start();
        let condition = match rest.get(..6) {
            Some(keyword) if keyword.eq_ignore_ascii_case("where ") => &rest[6..],
            _ => return Err(Error::Syntax("expected WHERE clause".into())),
        };

        let (column, value) = condition
            .split_once('=')
            .ok_or_else(|| Error::Syntax("expected <column>='<value>' condition".into()))?;
        let column = column.trim();
        let value = value.trim();
        let value = value
            .strip_prefix('\'')
            .and_then(|value| value.strip_suffix('\''))
            .ok_or_else(|| Error::Syntax("expected quoted comparison value".into()))?;

        if self
            .rows
            .first()
            .map(|row| row.field(column).is_none())
            .unwrap_or(false)
        {
            return Err(Error::UnknownColumn(column.to_string()));
        }

        Ok(self
            .rows
            .iter()
            .filter(|row| {
                row.field(column)
                    .map(|field| field.eq_ignore_ascii_case(value))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    /// Serialize the dataset to bytes for a metadata-refresh response,
    /// applying any per-table filter expressions first.
    pub fn serialize(&self, table_filters: &HashMap<String, String>) -> Result<Vec<u8>> {
        let rows = match table_filters
            .iter()
            .find(|(table, _)| table.eq_ignore_ascii_case(ACTIVE_MEASUREMENTS))
        {
            Some((_, expression)) => self.evaluate_filter(expression)?,
            None => self.rows.clone(),
        };

        let mut document = String::new();
        document.push_str("<DataSet>\n  <ActiveMeasurements>\n");
        for row in &rows {
            document.push_str("    <Row>\n");
            document.push_str(&format!("      <ID>{}</ID>\n", escape_xml(&row.key)));
            document.push_str(&format!("      <SignalID>{}</SignalID>\n", row.signal_id));
            document.push_str(&format!(
                "      <SignalType>{}</SignalType>\n",
                escape_xml(&row.signal_type)
            ));
            document.push_str(&format!(
                "      <Description>{}</Description>\n",
                escape_xml(&row.description)
            ));
            document.push_str("    </Row>\n");
        }
        document.push_str("  </ActiveMeasurements>\n</DataSet>\n");
        Ok(document.into_bytes())
    }
}

/// Split a `SOURCE:ID` measurement key. Keys missing a numeric id yield the
/// whole key as source with id zero.
pub fn parse_measurement_key(key: &str) -> (String, u64) {
    match key.rsplit_once(':') {
        Some((source, id)) => match id.trim().parse::<u64>() {
            Ok(id) => (source.trim().to_string(), id),
            Err(_) => (key.trim().to_string(), 0),
        },
        None => (key.trim().to_string(), 0),
    }
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> MetadataSet {
        let mut set = MetadataSet::new();
        set.add_record(Uuid::new_v4(), "PPA:1", "FREQ", "Device A frequency");
        set.add_record(Uuid::new_v4(), "PPA:2", "VPHM", "Device A voltage magnitude");
        set.add_record(Uuid::new_v4(), "PPA:3", "FREQ", "Device B frequency");
        set
    }

    #[test]
    fn declarative_filter_selects_matching_rows() {
        let set = sample_set();
        let rows = set
            .evaluate_filter("FILTER ActiveMeasurements WHERE SignalType='FREQ'")
            .expect("evaluate");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "PPA:1");
        assert_eq!(rows[1].key, "PPA:3");
    }

    #[test]
    fn direct_selection_preserves_order() {
        let set = sample_set();
        let second = set.rows()[1].signal_id;
        let rows = set
            .evaluate_filter(&format!("{second};PPA:1"))
            .expect("evaluate");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].signal_id, second);
        assert_eq!(rows[1].key, "PPA:1");
    }

    #[test]
    fn empty_filter_selects_nothing() {
        let set = sample_set();
        assert!(set.evaluate_filter("").expect("empty").is_empty());
        assert!(set
            .evaluate_filter(&Uuid::nil().to_string())
            .expect("nil guid")
            .is_empty());
    }

    #[test]
    fn syntax_errors_are_reported() {
        let set = sample_set();
        assert!(matches!(
            set.evaluate_filter("FILTER Imaginary WHERE SignalType='FREQ'"),
            Err(Error::UnknownTable(_))
        ));
        assert!(matches!(
            set.evaluate_filter("FILTER ActiveMeasurements WHERE Bogus='x'"),
            Err(Error::UnknownColumn(_))
        ));
        assert!(matches!(
            set.evaluate_filter("FILTER ActiveMeasurements SignalType='FREQ'"),
            Err(Error::Syntax(_))
        ));
        assert!(set.evaluate_filter("not-a-guid-or-key").is_err());
    }

    #[test]
    fn serialize_honors_table_filters() {
        let set = sample_set();
        let mut filters = HashMap::new();
        filters.insert(
            ACTIVE_MEASUREMENTS.to_string(),
            "FILTER ActiveMeasurements WHERE SignalType='VPHM'".to_string(),
        );
        let bytes = set.serialize(&filters).expect("serialize");
        let document = String::from_utf8(bytes).expect("utf8");
        assert!(document.contains("PPA:2"));
        assert!(!document.contains("PPA:1"));

        let all = set.serialize(&HashMap::new()).expect("serialize all");
        let document = String::from_utf8(all).expect("utf8");
        assert!(document.contains("PPA:1"));
        assert!(document.contains("PPA:3"));
    }

    #[test]
    fn measurement_key_parsing() {
        assert_eq!(parse_measurement_key("PPA:42"), ("PPA".to_string(), 42));
        assert_eq!(
            parse_measurement_key("SHELBY:7 "),
            ("SHELBY".to_string(), 7)
        );
        assert_eq!(parse_measurement_key("NOID"), ("NOID".to_string(), 0));
    }
}
