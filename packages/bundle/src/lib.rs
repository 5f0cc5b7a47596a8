//! Mapping of named, typed fields, as carried back and forth across a process boundary.

pub extern crate bytes;

use bytes::Bytes;
use std::{
    collections::BTreeMap,
    fmt::{self, Formatter, Display},
};
use thiserror::Error;


/// Single typed field value in a [`Bundle`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Long(i64),
    String(String),
    StringArray(Vec<String>),
    Bytes(Bytes),
    Bundle(Bundle),
}

impl Value {
    /// Name of this value's type, as used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::String(_) => "string",
            Value::StringArray(_) => "string array",
            Value::Bytes(_) => "bytes",
            Value::Bundle(_) => "bundle",
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident,)*)=>{$(
        impl From<$t> for Value {
            fn from(inner: $t) -> Self {
                Value::$variant(inner.into())
            }
        }
    )*};
}

value_from!(
    bool => Bool,
    i32 => Int,
    i64 => Long,
    String => String,
    &str => String,
    Vec<String> => StringArray,
    Bytes => Bytes,
    Bundle => Bundle,
);


/// Error for pulling a field out of a [`Bundle`] by key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleError {
    /// No field with this key.
    #[error("missing key {key:?}")]
    Missing { key: String },
    /// A field with this key exists, but holds a different type.
    #[error("key {key:?} holds a {found}, expected a {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}


/// Mapping of named, typed fields.
///
/// There is no fixed schema. Consumers pull fields by key with the typed getters, each of which
/// comes in two flavors:
///
/// - `get_*` treats the key as required, and errors if it's missing.
/// - `opt_*` treats the key as optional, and returns `Ok(None)` if it's missing.
///
/// Both flavors error if the key is present but holds a value of a different type.
///
/// Fields are kept sorted by key, so equality, hashing, and iteration order are all structural.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Bundle {
    fields: BTreeMap<String, Value>,
}

macro_rules! typed_getters {
    ($($get:ident $opt:ident $variant:ident($v:ident) -> $t:ty = $conv:expr, $name:literal;)*)=>{$(
        #[doc = concat!("Get the required ", $name, " field with this key.")]
        pub fn $get(&self, key: &str) -> Result<$t, BundleError> {
            self.$opt(key)?.ok_or_else(|| BundleError::Missing { key: key.to_owned() })
        }

        #[doc = concat!("Get the optional ", $name, " field with this key.")]
        pub fn $opt(&self, key: &str) -> Result<Option<$t>, BundleError> {
            match self.fields.get(key) {
                None => Ok(None),
                Some(Value::$variant($v)) => Ok(Some($conv)),
                Some(other) => Err(BundleError::WrongType {
                    key: key.to_owned(),
                    expected: $name,
                    found: other.type_name(),
                }),
            }
        }
    )*};
}

impl Bundle {
    /// Construct empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether a field with this key exists, of any type.
    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Insert a field, returning the value it replaced, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    /// Ownership-chaining version of [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Remove a field, returning its value, if any.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Get the untyped value with this key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Iterate over fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate over keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.fields.keys().map(String::as_str)
    }

    typed_getters!(
        get_bool opt_bool Bool(v) -> bool = *v, "bool";
        get_int opt_int Int(v) -> i32 = *v, "int";
        get_long opt_long Long(v) -> i64 = *v, "long";
        get_str opt_str String(v) -> &str = v.as_str(), "string";
        get_string_array opt_string_array StringArray(v) -> &[String] = v.as_slice(), "string array";
        get_bytes opt_bytes Bytes(v) -> Bytes = v.clone(), "bytes";
        get_bundle opt_bundle Bundle(v) -> &Bundle = v, "bundle";
    );
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Bundle {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Bundle {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> Extend<(K, V)> for Bundle {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl IntoIterator for Bundle {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl Display for Bundle {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        // keys only. values may be credentials.
        f.write_str("Bundle[")?;
        for (i, key) in self.keys().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(key)?;
        }
        f.write_str("]")
    }
}

/// Construct a [`Bundle`] from `key => value` pairs.
///
/// ```
/// let b = bundle::bundle! { "accountName" => "a@b.com", "retry" => true };
/// assert_eq!(b.get_str("accountName"), Ok("a@b.com"));
/// ```
#[macro_export]
macro_rules! bundle {
    () => { $crate::Bundle::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {
        $crate::Bundle::new()$(.with($key, $value))+
    };
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_and_optional_getters() {
        let b = bundle! {
            "accountName" => "a@b.com",
            "accountType" => "com.example",
            "retry" => true,
            "errorCode" => 5,
        };
        assert_eq!(b.len(), 4);
        assert_eq!(b.get_str("accountName"), Ok("a@b.com"));
        assert_eq!(b.get_bool("retry"), Ok(true));
        assert_eq!(b.get_int("errorCode"), Ok(5));
        assert_eq!(b.opt_str("authtoken"), Ok(None));
        assert_eq!(
            b.get_str("authtoken"),
            Err(BundleError::Missing { key: "authtoken".into() }),
        );
    }

    #[test]
    fn wrong_type_is_not_missing() {
        let b = bundle! { "retry" => "yes" };
        assert_eq!(
            b.opt_bool("retry"),
            Err(BundleError::WrongType { key: "retry".into(), expected: "bool", found: "string" }),
        );
        assert_eq!(
            b.get_bool("retry").unwrap_err().to_string(),
            "key \"retry\" holds a string, expected a bool",
        );
    }

    #[test]
    fn nested_and_binary_fields() {
        let inner = bundle! { "k" => 1i64 };
        let b = bundle! {
            "inner" => inner.clone(),
            "blob" => Bytes::from_static(b"\x00\x01"),
            "names" => vec!["a".to_owned(), "b".to_owned()],
        };
        assert_eq!(b.get_bundle("inner"), Ok(&inner));
        assert_eq!(b.get_bundle("inner").unwrap().get_long("k"), Ok(1));
        assert_eq!(b.get_bytes("blob").unwrap().as_ref(), b"\x00\x01");
        assert_eq!(b.get_string_array("names").unwrap().len(), 2);
    }

    #[test]
    fn equality_is_structural() {
        let a: Bundle = [("x", 1), ("y", 2)].into_iter().collect();
        let mut b = Bundle::new();
        b.insert("y", 2);
        b.insert("x", 1);
        assert_eq!(a, b);
        b.insert("x", 3);
        assert_ne!(a, b);
    }

    #[test]
    fn display_hides_values() {
        let b = bundle! { "password" => "hunter2", "accountName" => "a@b.com" };
        assert_eq!(b.to_string(), "Bundle[accountName, password]");
    }
}
