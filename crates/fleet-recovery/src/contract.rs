//! Machine-readable contract for the persisted and emitted shapes.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::Serialize;
use serde_json::Value;

use fleet_kernel::{Event, FleetRecoveredData};

use crate::models::{Checkpoint, RecoveryCandidate};

pub const WIRE_CONTRACT_VERSION: &str = "v1";

#[derive(Clone, Debug, Serialize)]
pub struct WireContract {
    pub contract_version: &'static str,
    pub contract_kind: &'static str,
    pub schemas: BTreeMap<String, Value>,
}

pub fn generate_wire_contract() -> Result<WireContract, serde_json::Error> {
    let mut schemas = BTreeMap::new();
    add_schema::<Event>(&mut schemas, "Event")?;
    add_schema::<Checkpoint>(&mut schemas, "Checkpoint")?;
    add_schema::<FleetRecoveredData>(&mut schemas, "FleetRecoveredData")?;
    add_schema::<RecoveryCandidate>(&mut schemas, "RecoveryCandidate")?;
    Ok(WireContract {
        contract_version: WIRE_CONTRACT_VERSION,
        contract_kind: "fleet-recovery-wire",
        schemas,
    })
}

pub fn wire_contract_pretty_json() -> Result<String, serde_json::Error> {
    let contract = generate_wire_contract()?;
    serde_json::to_string_pretty(&contract)
}

fn add_schema<T: JsonSchema>(
    schemas: &mut BTreeMap<String, Value>,
    name: &str,
) -> Result<(), serde_json::Error> {
    let schema = schemars::schema_for!(T);
    let value = canonicalize_json(serde_json::to_value(&schema)?);
    schemas.insert(name.to_string(), value);
    Ok(())
}

fn canonicalize_json(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize_json).collect()),
        Value::Object(entries) => {
            let mut sorted = BTreeMap::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize_json(value));
            }
            Value::Object(sorted.into_iter().collect())
        }
        other => other,
    }
}
