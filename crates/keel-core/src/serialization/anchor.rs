//! Safe anchors: per-entry wrappers that turn a failure to write or read one
//! polymorphic state into a flag instead of an error.
//!
//! An anchored value is stored as `{ "type": <state name>, "data": <state> }`,
//! or `null` when it could not be written. Every anchor is its own JSON node,
//! so a bad entry never disturbs the entries around it.

use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use super::types::StateTypeRegistry;
use crate::error::Result;
use crate::state::ModuleState;

const TYPE_KEY: &str = "type";
const DATA_KEY: &str = "data";
const TAG_KEY: &str = "tag";
const VALUE_KEY: &str = "value";

/// Wraps one polymorphic state value together with the outcome of its last
/// save or load.
#[derive(Debug, Clone, Default)]
pub struct SafeAnchor {
    value: Option<Rc<dyn ModuleState>>,
    failure: Option<String>,
}

impl SafeAnchor {
    pub fn new(value: Rc<dyn ModuleState>) -> Self {
        Self {
            value: Some(value),
            failure: None,
        }
    }

    pub fn value(&self) -> Option<&Rc<dyn ModuleState>> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<Rc<dyn ModuleState>> {
        self.value
    }

    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    /// Why the last save or load of this anchor failed.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Write the value. An unregistered state type yields `null` and marks the
    /// anchor as failed; errors from the serializer itself propagate.
    pub fn save(&mut self, types: &StateTypeRegistry) -> Result<Value> {
        self.failure = None;
        let Some(state) = &self.value else {
            self.failure = Some("no value to save".into());
            return Ok(Value::Null);
        };
        if !types.accepts(&**state) {
            self.failure = Some(format!(
                "state type '{}' was never registered",
                state.state_name()
            ));
            return Ok(Value::Null);
        }
        let data = state.to_value()?;
        let mut node = Map::new();
        node.insert(TYPE_KEY.into(), Value::String(state.state_name().into()));
        node.insert(DATA_KEY.into(), data);
        Ok(Value::Object(node))
    }

    /// Read a value from `node`. Never fails; check [`success`](Self::success).
    pub fn load(node: &Value, types: &StateTypeRegistry) -> Self {
        match decode_value(node, types) {
            Ok(state) => Self::new(state),
            Err(reason) => Self {
                value: None,
                failure: Some(reason),
            },
        }
    }
}

fn decode_value(
    node: &Value,
    types: &StateTypeRegistry,
) -> std::result::Result<Rc<dyn ModuleState>, String> {
    let fields = match node {
        Value::Null => return Err("no value was stored".into()),
        Value::Object(fields) => fields,
        _ => return Err("stored value is not an object".into()),
    };
    let name = fields
        .get(TYPE_KEY)
        .and_then(Value::as_str)
        .ok_or("stored value has no type name")?;
    let data = fields.get(DATA_KEY).cloned().unwrap_or(Value::Null);
    match types.decode(name, data) {
        None => Err(format!("unknown state type '{name}'")),
        Some(Err(err)) => Err(format!("corrupt data for state type '{name}': {err}")),
        Some(Ok(state)) => Ok(state),
    }
}

/// A [`SafeAnchor`] keyed by a tag, usually the owning module's id.
#[derive(Debug, Clone)]
pub struct TaggedSafeAnchor<T> {
    tag: T,
    anchor: SafeAnchor,
}

impl<T> TaggedSafeAnchor<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(tag: T, value: Rc<dyn ModuleState>) -> Self {
        Self {
            tag,
            anchor: SafeAnchor::new(value),
        }
    }

    pub fn tag(&self) -> &T {
        &self.tag
    }

    pub fn anchor(&self) -> &SafeAnchor {
        &self.anchor
    }

    pub fn success(&self) -> bool {
        self.anchor.success()
    }

    pub fn failure(&self) -> Option<&str> {
        self.anchor.failure()
    }

    pub fn into_parts(self) -> (T, SafeAnchor) {
        (self.tag, self.anchor)
    }

    pub fn save(&mut self, types: &StateTypeRegistry) -> Result<Value> {
        let tag = serde_json::to_value(&self.tag)?;
        let value = self.anchor.save(types)?;
        let mut node = Map::new();
        node.insert(TAG_KEY.into(), tag);
        node.insert(VALUE_KEY.into(), value);
        Ok(Value::Object(node))
    }

    /// Read a tagged entry. A missing or malformed tag leaves the default tag
    /// and marks the anchor as failed.
    pub fn load(node: &Value, types: &StateTypeRegistry) -> Self {
        let tag = node
            .get(TAG_KEY)
            .map(|tag| T::deserialize(tag).map_err(|err| err.to_string()));
        let value = node.get(VALUE_KEY).unwrap_or(&Value::Null);
        match tag {
            Some(Ok(tag)) => Self {
                tag,
                anchor: SafeAnchor::load(value, types),
            },
            Some(Err(reason)) => Self::untagged(format!("malformed tag: {reason}")),
            None => Self::untagged("entry has no tag".into()),
        }
    }

    fn untagged(reason: String) -> Self {
        Self {
            tag: T::default(),
            anchor: SafeAnchor {
                value: None,
                failure: Some(reason),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::NameKey;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Volume {
        level: u8,
    }

    impl NameKey for Volume {
        const NAME: &'static str = "test.volume";
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Forgotten {
        flag: bool,
    }

    impl NameKey for Forgotten {
        const NAME: &'static str = "test.forgotten";
    }

    fn types() -> StateTypeRegistry {
        let mut types = StateTypeRegistry::new();
        types.register::<Volume>().unwrap();
        types
    }

    #[test]
    fn registered_state_is_written_with_its_name() {
        let mut anchor = SafeAnchor::new(Rc::new(Volume { level: 2 }));
        let node = anchor.save(&types()).unwrap();
        assert!(anchor.success());
        assert_eq!(node, json!({ "type": "test.volume", "data": { "level": 2 } }));
    }

    #[test]
    fn unregistered_state_is_written_as_null() {
        let mut anchor = SafeAnchor::new(Rc::new(Forgotten { flag: true }));
        let node = anchor.save(&types()).unwrap();
        assert_eq!(node, Value::Null);
        assert!(!anchor.success());
        assert!(anchor.failure().unwrap().contains("test.forgotten"));
    }

    #[test]
    fn tagged_anchor_reads_back() {
        let types = types();
        let mut anchor = TaggedSafeAnchor::new("keel.audio".to_string(), Rc::new(Volume { level: 9 }));
        let node = anchor.save(&types).unwrap();

        let loaded = TaggedSafeAnchor::<String>::load(&node, &types);
        assert!(loaded.success());
        assert_eq!(loaded.tag(), "keel.audio");
        let state = loaded.anchor().value().unwrap();
        assert_eq!(state.as_any().downcast_ref::<Volume>(), Some(&Volume { level: 9 }));
    }

    #[test]
    fn load_failures_are_flagged_not_raised() {
        let types = types();
        let cases = [
            (json!({ "tag": "a", "value": null }), "no value"),
            (json!({ "tag": "a", "value": 5 }), "not an object"),
            (json!({ "tag": "a", "value": { "data": {} } }), "no type name"),
            (
                json!({ "tag": "a", "value": { "type": "test.forgotten", "data": {} } }),
                "unknown state type",
            ),
            (
                json!({ "tag": "a", "value": { "type": "test.volume", "data": { "level": -1 } } }),
                "corrupt data",
            ),
            (json!({ "value": null }), "no tag"),
            (json!({ "tag": 12, "value": null }), "malformed tag"),
        ];
        for (node, expected) in cases {
            let anchor = TaggedSafeAnchor::<String>::load(&node, &types);
            assert!(!anchor.success(), "{node} should fail");
            let failure = anchor.failure().unwrap();
            assert!(failure.contains(expected), "{failure} should mention {expected}");
        }
    }
}
