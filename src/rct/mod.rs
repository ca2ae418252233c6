pub mod frame;
pub mod inverter;
pub mod registry;
pub mod value;

use crate::prelude::*;
use frame::Response;
use value::DataType;

/// A response frame resolved against the registry
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedResult {
    pub id: ObjectId,
    pub crc_ok: bool,
    pub name: Option<String>,
    pub description: Option<String>,
    pub data_type: Option<DataType>,
    pub unit: String,
    /// None when the CRC failed or the id is unknown
    pub result: Option<Value>,
    pub info_text: String,
}

impl DecodedResult {
    pub fn new(registry: &Registry, response: &Response) -> Self {
        let mut r = Self {
            id: response.id,
            crc_ok: response.crc_ok,
            name: None,
            description: None,
            data_type: None,
            unit: String::new(),
            result: None,
            info_text: response.info_text(),
        };

        // data might be faulty
        if !response.crc_ok {
            return r;
        }

        let Some(definition) = registry.lookup_by_id(response.id) else {
            debug!("unknown response id {}", response.id);
            return r;
        };

        r.name = Some(definition.name.clone());
        if !definition.description.is_empty() {
            r.description = Some(definition.description.clone());
        }
        r.data_type = definition.data_type;
        r.unit = definition.unit.clone();
        r.result = Some(definition.decode(&response.data));
        r
    }

    pub fn text(&self) -> String {
        let result = self.result.as_ref().map(|v| v.to_string()).unwrap_or_default();
        match (&self.description, &self.name) {
            (Some(description), _) => format!("{}: {} {}", description, result, self.unit),
            (None, Some(name)) => format!("{}: {} {}", name, result, self.unit),
            (None, None) => self.info_text.clone(),
        }
    }
}
