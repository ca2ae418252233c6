use crate::prelude::*;
use crate::rct::value::DataType;

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisterDefinition {
    pub name: String,
    pub id: ObjectId,
    #[serde(rename = "type", default)]
    pub data_type: Option<DataType>,
    /// declared payload length; informational only
    #[serde(default)]
    pub length: Option<u16>,
    #[serde(default)]
    pub multiplier: Option<f64>,
    #[serde(default)]
    pub precision: Option<u8>,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
}

impl RegisterDefinition {
    pub fn new(name: &str, id: u32, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            id: ObjectId::new(id),
            data_type: Some(data_type),
            length: None,
            multiplier: None,
            precision: None,
            unit: String::new(),
            description: String::new(),
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = Some(precision);
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn decode(&self, data: &[u8]) -> Value {
        match self.data_type {
            Some(data_type) => data_type.decode(data, self.multiplier, self.precision),
            None => Value::Empty,
        }
    }
}

/// Where a register's value lives in the state tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateInfo {
    pub channel: String,
    pub state: String,
    pub full: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryFile {
    registers: Vec<RegisterDefinition>,
}

#[derive(Debug, Clone)]
pub struct Registry {
    definitions: Vec<RegisterDefinition>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<ObjectId, usize>,
}

impl Registry {
    pub fn new(definitions: Vec<RegisterDefinition>) -> Result<Self> {
        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();

        for (i, definition) in definitions.iter().enumerate() {
            if by_name.insert(definition.name.clone(), i).is_some() {
                return Err(file_error!("duplicate register name {}", definition.name));
            }
            if by_id.insert(definition.id, i).is_some() {
                return Err(file_error!(
                    "duplicate register id {} ({})",
                    definition.id,
                    definition.name
                ));
            }
        }

        Ok(Self {
            definitions,
            by_name,
            by_id,
        })
    }

    pub fn from_file(file: &str) -> Result<Self> {
        let content = std::fs::read_to_string(file)
            .map_err(|err| file_error!("Error reading register file {}: {}", file, err))?;

        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(content)
            .map_err(|err| file_error_with_source!(err, "Error parsing register file"))?;

        Self::new(file.registers)
    }

    pub fn builtin() -> Self {
        let definitions = BUILTIN
            .iter()
            .map(|(name, id, data_type, multiplier, unit, description)| {
                let mut definition = RegisterDefinition::new(name, *id, *data_type)
                    .with_unit(unit)
                    .with_description(description);
                if *multiplier != 1.0 {
                    definition = definition.with_multiplier(*multiplier);
                }
                definition
            })
            .collect();

        Self {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            definitions,
        }
        .indexed()
    }

    // BUILTIN is known to be free of duplicates
    fn indexed(mut self) -> Self {
        for (i, definition) in self.definitions.iter().enumerate() {
            self.by_name.insert(definition.name.clone(), i);
            self.by_id.insert(definition.id, i);
        }
        self
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<&RegisterDefinition> {
        self.by_name.get(name).map(|i| &self.definitions[*i])
    }

    pub fn lookup_by_id(&self, id: ObjectId) -> Option<&RegisterDefinition> {
        self.by_id.get(&id).map(|i| &self.definitions[*i])
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn definitions(&self) -> &[RegisterDefinition] {
        &self.definitions
    }

    /// Split a register name into channel and state name.
    ///
    /// `]` is dropped; a `[` before the first `.` becomes a separator so the
    /// index ends up in the state name; remaining `.` and `[` in the state
    /// name become `_`, with runs of `_` collapsed.
    ///
    ///   g_sync.u_l_rms[0]  => g_sync.u_l_rms_0
    ///   grid_pll[0].f      => grid_pll.0_f
    pub fn state_info(&self, name: &str) -> Option<StateInfo> {
        if self.lookup_by_name(name).is_none() {
            warn!("Invalid RCT name: {}", name);
            return None;
        }

        Some(Self::normalize(name))
    }

    pub fn normalize(name: &str) -> StateInfo {
        let mut name = name.replace(']', "");

        if let (Some(bracket), Some(dot)) = (name.find('['), name.find('.')) {
            if bracket < dot {
                name = name.replace('[', ".");
            }
        }

        let mut elements = name.split('.');
        let first = elements.next().unwrap_or_default();
        let rest: Vec<&str> = elements.collect();

        if rest.is_empty() {
            let state = flatten(first);
            StateInfo {
                channel: String::new(),
                full: state.clone(),
                state,
            }
        } else {
            let channel = first.to_string();
            let state = flatten(&rest.join("_"));
            StateInfo {
                full: format!("{}.{}", channel, state),
                channel,
                state,
            }
        }
    }
}

fn flatten(name: &str) -> String {
    let mut r = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if c == '.' || c == '[' { '_' } else { c };
        if c == '_' && r.ends_with('_') {
            continue;
        }
        r.push(c);
    }
    r
}

type Builtin = (&'static str, u32, DataType, f64, &'static str, &'static str);

#[rustfmt::skip]
const BUILTIN: &[Builtin] = &[
    ("battery.soc",                        0x959930BF, DataType::Float,  100.0, "%",   "Battery state of charge"),
    ("battery.soh",                        0x381B8BF9, DataType::Float,  100.0, "%",   "Battery state of health"),
    ("battery.soc_target",                 0x8B9FF008, DataType::Float,  100.0, "%",   "Battery target SOC"),
    ("battery.voltage",                    0xA7FA5C5D, DataType::Float,    1.0, "V",   "Battery voltage"),
    ("battery.temperature",                0x902AFAFB, DataType::Float,    1.0, "°C",  "Battery temperature"),
    ("battery.cycles",                     0xC0DF2978, DataType::Int32,    1.0, "",    "Battery charge cycles"),
    ("battery.stored_energy",              0x5570401B, DataType::Float,  0.001, "kWh", "Battery total stored energy"),
    ("battery.used_energy",                0xA9033880, DataType::Float,  0.001, "kWh", "Battery total used energy"),
    ("power_mng.soc_min",                  0xCE266F0F, DataType::Float,  100.0, "%",   "Minimum SOC"),
    ("power_mng.soc_max",                  0x97997C93, DataType::Float,  100.0, "%",   "Maximum SOC"),
    ("dc_conv.dc_conv_struct[0].p_dc",     0xDB11855B, DataType::Float,    1.0, "W",   "Solar generator A power"),
    ("dc_conv.dc_conv_struct[1].p_dc",     0x0CB5D21B, DataType::Float,    1.0, "W",   "Solar generator B power"),
    ("dc_conv.dc_conv_struct[0].u_sg_lp",  0xB5317B78, DataType::Float,    1.0, "V",   "Solar generator A voltage"),
    ("dc_conv.dc_conv_struct[1].u_sg_lp",  0xB0041187, DataType::Float,    1.0, "V",   "Solar generator B voltage"),
    ("g_sync.p_ac_load_sum_lp",            0x1AC87AA0, DataType::Float,    1.0, "W",   "Household load power"),
    ("g_sync.p_ac_grid_sum_lp",            0x91617C58, DataType::Float,    1.0, "W",   "Grid power"),
    ("g_sync.p_ac_sum_lp",                 0xDB2D69AE, DataType::Float,    1.0, "W",   "Inverter AC power"),
    ("g_sync.p_acc_lp",                    0x400F015B, DataType::Float,    1.0, "W",   "Battery power"),
    ("g_sync.u_l_rms[0]",                  0xCF053085, DataType::Float,    1.0, "V",   "Grid voltage phase 1"),
    ("g_sync.u_l_rms[1]",                  0x54B4684E, DataType::Float,    1.0, "V",   "Grid voltage phase 2"),
    ("g_sync.u_l_rms[2]",                  0x2545E22D, DataType::Float,    1.0, "V",   "Grid voltage phase 3"),
    ("grid_pll[0].f",                      0x1C4A665F, DataType::Float,    1.0, "Hz",  "Grid frequency"),
    ("db.temp1",                           0xF79D41D9, DataType::Float,    1.0, "°C",  "Heat sink temperature"),
    ("prim_sm.state",                      0x5F33284E, DataType::UInt8,    1.0, "",    "Inverter state"),
    ("energy.e_ac_day",                    0xBD55905F, DataType::Float,  0.001, "kWh", "Inverter energy today"),
    ("inverter_sn",                        0x7924ABD9, DataType::Text,     1.0, "",    "Inverter serial number"),
    ("android_description",                0xEBC62737, DataType::Text,     1.0, "",    "Device name"),
];
