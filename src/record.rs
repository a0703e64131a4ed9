use serde::ser::{Serialize, SerializeMap, Serializer};

/// A single typed field value inside a [`Record`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i32),
    Int64(i64),
    Double(f64),
}

impl Value {
    /// Returns the value as i64 if it is an `Int64`.
    pub fn as_int64(&self) -> Option<i64> {
        match self {
            Value::Int64(n) => Some(*n),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Str(s) => serializer.serialize_str(s),
            Value::Int(n) => serializer.serialize_i32(*n),
            Value::Int64(n) => serializer.serialize_i64(*n),
            Value::Double(n) => serializer.serialize_f64(*n),
        }
    }
}

/// One structured log record: an ordered field-name -> value mapping.
///
/// Field order is emission order (schema order), so the record is a plain
/// vector of pairs rather than a hash map; records are small enough that
/// linear lookup wins over hashing. Serialized exactly once, on handoff.
#[derive(Debug, Clone, Default)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self {
            fields: Vec::with_capacity(16),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields
            .iter_mut()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Sets a field, replacing an existing one of the same name in place
    /// (keeping its original position) or appending a new one.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.get_mut(&name) {
            Some(slot) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Keeps only fields whose name satisfies the predicate.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.fields.retain(|(k, _)| keep(k));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Serializes to a JSON object followed by a newline, ready for the
    /// tunnel send queue.
    pub fn to_ndjson(&self) -> Vec<u8> {
        // Serialization of string/number-only maps cannot fail.
        let mut out = serde_json::to_vec(self).unwrap_or_default();
        out.push(b'\n');
        out
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_appends_in_order() {
        let mut rec = Record::new();
        rec.set("type", Value::Str("nginx".into()));
        rec.set("a", Value::Str("hello".into()));
        rec.set("b", Value::Int(42));
        rec.set("c", Value::Double(3.14));

        let json = String::from_utf8(rec.to_ndjson()).expect("utf8");
        assert_eq!(
            json,
            "{\"type\":\"nginx\",\"a\":\"hello\",\"b\":42,\"c\":3.14}\n"
        );
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut rec = Record::new();
        rec.set("a", Value::Int(1));
        rec.set("b", Value::Int(2));
        rec.set("a", Value::Str("override".into()));

        assert_eq!(rec.len(), 2);
        assert_eq!(rec.get("a"), Some(&Value::Str("override".into())));

        // Replacement keeps the original position.
        let names: Vec<&str> = rec.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_retain_prunes_fields() {
        let mut rec = Record::new();
        rec.set("keep", Value::Int64(1));
        rec.set("drop", Value::Int64(2));
        rec.retain(|name| name != "drop");

        assert!(rec.contains("keep"));
        assert!(!rec.contains("drop"));
    }

    #[test]
    fn test_ndjson_escapes_strings() {
        let mut rec = Record::new();
        rec.set("msg", Value::Str("a \"quoted\" value".into()));

        let json = String::from_utf8(rec.to_ndjson()).expect("utf8");
        assert_eq!(json, "{\"msg\":\"a \\\"quoted\\\" value\"}\n");
    }

    #[test]
    fn test_int64_accessor() {
        let mut rec = Record::new();
        rec.set("n", Value::Int64(7));
        rec.set("s", Value::Str("x".into()));

        assert_eq!(rec.get("n").and_then(Value::as_int64), Some(7));
        assert_eq!(rec.get("s").and_then(Value::as_int64), None);
    }
}
