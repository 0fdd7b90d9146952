use std::io::{Read, Write};

use semver::{Version, VersionReq};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Result, RuntimeError};

/// Format version stamped into every saved document.
pub const FORMAT_VERSION: &str = "1.0.0";

/// Document versions this build can read.
pub const SUPPORTED_FORMAT: &str = "^1.0";

const VERSION_KEY: &str = "version";

/// A document being written: named top-level entries in a JSON object.
#[derive(Debug, Clone)]
pub struct OutputArchive {
    root: Map<String, Value>,
}

impl Default for OutputArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputArchive {
    pub fn new() -> Self {
        let mut root = Map::new();
        root.insert(VERSION_KEY.into(), Value::String(FORMAT_VERSION.into()));
        Self { root }
    }

    pub fn save_named<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.save_value(name, value);
        Ok(())
    }

    pub fn save_value(&mut self, name: &str, value: Value) {
        self.root.insert(name.to_string(), value);
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, &self.root)?;
        Ok(())
    }

    pub fn to_string_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.root)?)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.root)
    }
}

/// A parsed document whose format version has been checked.
#[derive(Debug, Clone)]
pub struct InputArchive {
    root: Map<String, Value>,
}

impl InputArchive {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let value: Value = serde_json::from_reader(reader)?;
        Self::from_value(value)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(root) = value else {
            return Err(RuntimeError::SerializationIo(
                "document root is not an object".into(),
            ));
        };
        check_version(root.get(VERSION_KEY))?;
        Ok(Self { root })
    }

    pub fn version(&self) -> Option<&str> {
        self.root.get(VERSION_KEY).and_then(Value::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.root.contains_key(name)
    }

    pub fn load_named<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self.root.get(name).ok_or_else(|| missing(name))?;
        Ok(T::deserialize(value)?)
    }

    /// The array stored under `name`; each element is an independent node.
    pub fn load_collection(&self, name: &str) -> Result<&[Value]> {
        match self.root.get(name) {
            Some(Value::Array(items)) => Ok(items.as_slice()),
            Some(_) => Err(RuntimeError::SerializationIo(format!(
                "entry '{name}' is not a collection"
            ))),
            None => Err(missing(name)),
        }
    }
}

fn missing(name: &str) -> RuntimeError {
    RuntimeError::SerializationIo(format!("document has no entry '{name}'"))
}

fn check_version(found: Option<&Value>) -> Result<()> {
    let incompatible = |found: &str| RuntimeError::IncompatibleDocument {
        found: found.to_string(),
        supported: SUPPORTED_FORMAT.to_string(),
    };
    let found = found.and_then(Value::as_str).ok_or_else(|| incompatible("<none>"))?;
    let version = Version::parse(found).map_err(|_| incompatible(found))?;
    let req = VersionReq::parse(SUPPORTED_FORMAT).map_err(|_| incompatible(found))?;
    if !req.matches(&version) {
        return Err(incompatible(found));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn output_is_stamped_with_version() {
        let archive = OutputArchive::new();
        let input = InputArchive::from_value(archive.into_value()).unwrap();
        assert_eq!(input.version(), Some(FORMAT_VERSION));
    }

    #[test]
    fn named_entries_are_read_back() {
        let mut archive = OutputArchive::new();
        archive.save_named("answer", &42u32).unwrap();
        archive.save_value("items", json!([1, 2]));
        let text = archive.to_string_pretty().unwrap();

        let input = InputArchive::from_json(&text).unwrap();
        assert_eq!(input.load_named::<u32>("answer").unwrap(), 42);
        assert_eq!(input.load_collection("items").unwrap().len(), 2);
        assert!(input.contains("items"));
    }

    #[test]
    fn write_to_produces_parsable_json() {
        let mut buf = Vec::new();
        OutputArchive::new().write_to(&mut buf).unwrap();
        assert!(InputArchive::from_reader(buf.as_slice()).is_ok());
    }

    #[test]
    fn missing_or_wrong_collection_is_an_error() {
        let input = InputArchive::from_value(json!({ "version": "1.0.0", "x": 3 })).unwrap();
        assert!(matches!(
            input.load_collection("x"),
            Err(RuntimeError::SerializationIo(_))
        ));
        assert!(matches!(
            input.load_collection("y"),
            Err(RuntimeError::SerializationIo(_))
        ));
    }

    #[test]
    fn truncated_document_is_an_error() {
        let err = InputArchive::from_json("{\"version\": \"1.0").unwrap_err();
        assert!(matches!(err, RuntimeError::SerializationIo(_)));
    }

    #[test]
    fn non_object_root_is_an_error() {
        let err = InputArchive::from_value(json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, RuntimeError::SerializationIo(_)));
    }

    #[test]
    fn newer_minor_version_is_accepted() {
        assert!(InputArchive::from_value(json!({ "version": "1.4.2" })).is_ok());
    }

    #[test]
    fn incompatible_versions_are_rejected() {
        for doc in [
            json!({ "version": "2.0.0" }),
            json!({ "version": "0.9.0" }),
            json!({ "version": "banana" }),
            json!({}),
        ] {
            let err = InputArchive::from_value(doc).unwrap_err();
            assert!(
                matches!(err, RuntimeError::IncompatibleDocument { .. }),
                "got {err}"
            );
        }
    }
}
