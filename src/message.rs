use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// Key under which every message carries its correlation id.
pub const MSGID: &str = "_msgid";

/// A value that travels with a message but is never cloned on fan-out,
/// e.g. an open HTTP response.
pub type Handle = Arc<dyn Any + Send + Sync>;

/// The record passed along wires.
///
/// `Clone` deep-copies every JSON field and shares the handles, so sibling
/// branches of a fan-out can mutate their copy freely while still pointing at
/// the same response object.
#[derive(Clone, Default)]
pub struct Message {
    fields: Map<String, Value>,
    handles: HashMap<String, Handle>,
}

impl Message {
    pub fn new(payload: Value) -> Self {
        let mut fields = Map::new();
        fields.insert(MSGID.to_string(), Value::String(new_msgid()));
        fields.insert("payload".to_string(), payload);
        Self {
            fields,
            handles: HashMap::new(),
        }
    }

    /// Builds a message from a JSON object, keeping an existing `_msgid`.
    /// Non-object values become the payload of a fresh message.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut fields) => {
                if !matches!(fields.get(MSGID), Some(Value::String(_))) {
                    fields.insert(MSGID.to_string(), Value::String(new_msgid()));
                }
                Self {
                    fields,
                    handles: HashMap::new(),
                }
            }
            other => Self::new(other),
        }
    }

    pub fn msgid(&self) -> &str {
        self.fields
            .get(MSGID)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.get_mut(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        if key == MSGID {
            return None;
        }
        self.fields.remove(key)
    }

    pub fn payload(&self) -> &Value {
        self.fields.get("payload").unwrap_or(&Value::Null)
    }

    pub fn set_payload(&mut self, payload: Value) {
        self.set("payload", payload);
    }

    pub fn topic(&self) -> Option<&str> {
        self.fields.get("topic").and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn handle<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.handles
            .get(key)
            .cloned()
            .and_then(|h| h.downcast::<T>().ok())
    }

    pub fn set_handle<T: Any + Send + Sync>(&mut self, key: &str, handle: Arc<T>) {
        self.handles.insert(key.to_string(), handle);
    }

    pub fn has_handles(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Moves the handles of `other` onto this message, keeping our own on
    /// key clashes.
    pub fn adopt_handles(&mut self, other: &Message) {
        for (key, handle) in &other.handles {
            self.handles.entry(key.clone()).or_insert_with(|| handle.clone());
        }
    }
}

fn new_msgid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("fields", &self.fields)
            .field("handles", &self.handles.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_new_message_has_msgid_and_payload() {
        let msg = Message::new(json!({"key": "value"}));
        assert_eq!(msg.msgid().len(), 32);
        assert_eq!(msg.payload(), &json!({"key": "value"}));
    }

    #[test]
    fn test_from_value_keeps_existing_msgid() {
        let msg = Message::from_value(json!({"_msgid": "abc", "payload": 1}));
        assert_eq!(msg.msgid(), "abc");

        let wrapped = Message::from_value(json!(42));
        assert_eq!(wrapped.payload(), &json!(42));
        assert!(!wrapped.msgid().is_empty());
    }

    #[test]
    fn test_msgid_cannot_be_removed() {
        let mut msg = Message::new(json!(null));
        assert!(msg.remove(MSGID).is_none());
        assert!(!msg.msgid().is_empty());
    }

    #[test]
    fn test_clone_is_deep_for_fields_and_shared_for_handles() {
        let mut original = Message::new(json!({"count": 1}));
        original.set_handle("res", Arc::new(Mutex::new(Vec::<String>::new())));

        let mut copy = original.clone();
        copy.get_mut("payload").unwrap()["count"] = json!(2);

        assert_eq!(original.payload()["count"], json!(1));
        assert_eq!(copy.msgid(), original.msgid());

        let a = original.handle::<Mutex<Vec<String>>>("res").unwrap();
        let b = copy.handle::<Mutex<Vec<String>>>("res").unwrap();
        a.lock().unwrap().push("written".into());
        assert_eq!(b.lock().unwrap().len(), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_serialize_skips_handles() {
        let mut msg = Message::from_value(json!({"_msgid": "m1", "topic": "t"}));
        msg.set_handle("res", Arc::new(5u32));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"_msgid": "m1", "topic": "t"}));
        assert_eq!(msg.topic(), Some("t"));
    }
}
