//! JSON payload parser.

use serde_json::Value;

use crate::error::ParserError;
use crate::{StreamParser, FORMAT_JSON};

/// Parser for the default `application/json` format.
///
/// JSON payloads arrive either as already-parsed values or as serialized
/// strings, depending on how the multiplexed connection framed them; both
/// are accepted. JSON carries no schemas, so the schema accessors are empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonParser;

impl JsonParser {
    pub fn new() -> Self {
        Self
    }
}

impl StreamParser for JsonParser {
    fn format(&self) -> &str {
        FORMAT_JSON
    }

    fn parse(&mut self, data: &Value, _schema_name: Option<&str>) -> Result<Value, ParserError> {
        match data {
            Value::String(raw) => {
                serde_json::from_str(raw).map_err(|e| ParserError::Malformed(e.to_string()))
            }
            value => Ok(value.clone()),
        }
    }

    fn add_schema(&mut self, _schema: &str, _name: &str) -> Result<(), ParserError> {
        Ok(())
    }

    fn schema_names(&self) -> Option<Vec<String>> {
        None
    }

    fn schema_name(&self) -> Option<&str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_passes_structured_values_through() {
        let mut parser = JsonParser::new();
        let data = json!({"Quote": {"Bid": 1.1, "Ask": 1.2}});
        assert_eq!(parser.parse(&data, None).unwrap(), data);
    }

    #[test]
    fn test_parse_decodes_serialized_strings() {
        let mut parser = JsonParser::new();
        let data = Value::String(r#"{"a": 1}"#.to_string());
        assert_eq!(parser.parse(&data, None).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_parse_rejects_malformed_strings() {
        let mut parser = JsonParser::new();
        let data = Value::String("{not json".to_string());
        assert!(matches!(
            parser.parse(&data, None),
            Err(ParserError::Malformed(_))
        ));
    }

    #[test]
    fn test_json_has_no_schemas() {
        let mut parser = JsonParser::new();
        parser.add_schema("ignored", "Quote").unwrap();
        assert_eq!(parser.schema_names(), None);
        assert_eq!(parser.schema_name(), None);
    }
}
