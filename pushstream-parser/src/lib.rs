//! Wire-format parser selection for streaming subscriptions.
//!
//! A subscription asks the server for payloads in a particular MIME format
//! and decodes every snapshot and delta through a matching [`StreamParser`].
//! This crate provides the parser trait, the JSON implementation, and the
//! [`ParserFacade`] that maps a MIME type to a parser instance, falling back
//! to JSON for formats nobody registered.

mod error;
mod facade;
mod json;

pub use error::ParserError;
pub use facade::ParserFacade;
pub use json::JsonParser;

use serde_json::Value;

/// MIME type of the default wire format.
pub const FORMAT_JSON: &str = "application/json";
/// MIME type of the schema-based binary wire format.
pub const FORMAT_PROTOBUF: &str = "application/x-protobuf";

/// Decodes streaming payloads for one subscription.
///
/// Parser instances are owned by a single subscription and mutated only by
/// it: schema registration happens when a subscribe response carries a
/// `Schema`/`SchemaName` pair, and the last registered name is cached for
/// decoding subsequent deltas. Formats without schemas (JSON) return `None`
/// from the schema accessors.
pub trait StreamParser: Send {
    /// The MIME format this parser decodes.
    fn format(&self) -> &str;

    /// Decode one payload. `schema_name` is the subscription's cached schema
    /// name, if any.
    fn parse(&mut self, data: &Value, schema_name: Option<&str>) -> Result<Value, ParserError>;

    /// Register a schema delivered by the server.
    fn add_schema(&mut self, schema: &str, name: &str) -> Result<(), ParserError>;

    /// Names of all registered schemas, sent as `KnownSchemas` on subscribe.
    fn schema_names(&self) -> Option<Vec<String>>;

    /// The most recently registered schema name.
    fn schema_name(&self) -> Option<&str>;
}
