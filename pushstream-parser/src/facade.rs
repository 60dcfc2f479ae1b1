//! MIME-type to parser lookup.

use std::collections::HashMap;

use tracing::debug;

use crate::json::JsonParser;
use crate::{StreamParser, FORMAT_JSON};

type ParserFactory = Box<dyn Fn() -> Box<dyn StreamParser> + Send + Sync>;

/// Maps a MIME format to a fresh parser instance.
///
/// The facade is shared between all subscriptions; parsers it hands out are
/// per-subscription and owned by their subscription. JSON is registered out
/// of the box and doubles as the fallback for unknown formats. Binary
/// formats are registered by the application:
///
/// ```ignore
/// let mut parsers = ParserFacade::new();
/// parsers.register(FORMAT_PROTOBUF, || Box::new(MyProtobufParser::new()));
/// ```
pub struct ParserFacade {
    factories: HashMap<String, ParserFactory>,
}

impl ParserFacade {
    pub fn new() -> Self {
        let mut facade = Self {
            factories: HashMap::new(),
        };
        facade.register(FORMAT_JSON, || Box::new(JsonParser::new()));
        facade
    }

    /// Register a parser factory for a MIME format, replacing any previous
    /// registration.
    pub fn register<F>(&mut self, format: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn StreamParser> + Send + Sync + 'static,
    {
        self.factories.insert(format.into(), Box::new(factory));
    }

    pub fn is_registered(&self, format: &str) -> bool {
        self.factories.contains_key(format)
    }

    /// The format used when none is requested or the requested one is
    /// unknown.
    pub fn default_format(&self) -> &'static str {
        FORMAT_JSON
    }

    /// Create a parser for `format`, falling back to JSON for unknown or
    /// absent formats.
    pub fn parser_for(&self, format: Option<&str>) -> Box<dyn StreamParser> {
        if let Some(format) = format {
            if let Some(factory) = self.factories.get(format) {
                return factory();
            }
            debug!(%format, "no parser registered; falling back to {FORMAT_JSON}");
        }
        Box::new(JsonParser::new())
    }
}

impl Default for ParserFacade {
    fn default() -> Self {
        Self::new()
    }
}
