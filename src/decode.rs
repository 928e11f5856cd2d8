//! Lenient decoding of stored payloads into typed values.
//!
//! Payloads come back from storage drivers as generic JSON records. Some
//! backends (and some historical writers) store numbers as strings, so the
//! decoder here accepts a wider set of inputs than strict `serde_json`
//! deserialization would:
//!
//! - strings parseable as integers, floats, or booleans coerce when the
//!   target field asks for those primitives;
//! - numbers coerce to strings when the target field is a string;
//! - date-time fields use RFC 3339 text, which `chrono`'s serde support
//!   handles directly.
//!
//! Unknown payload fields are ignored. Payload types that must tolerate
//! absent fields should derive `#[serde(default)]`.

use serde::de::{self, DeserializeOwned, IntoDeserializer, Visitor};
use serde_json::Value;

/// Decode a generic JSON record into a typed value with weak coercions.
///
/// This is the decode path used for stored event payloads, snapshot state,
/// and change-log envelopes. Strictly typed input decodes exactly as it
/// would with `serde_json::from_value`; stringified primitives are coerced.
///
/// # Errors
///
/// Returns the underlying `serde_json::Error` when the value cannot be
/// mapped onto `T`, including when a string fails to parse as the target
/// primitive.
pub fn from_value_weak<T: DeserializeOwned>(value: Value) -> Result<T, serde_json::Error> {
    T::deserialize(Weak(value))
}

/// Deserializer over a `serde_json::Value` applying the weak coercions.
struct Weak(Value);

macro_rules! weak_number {
    ($method:ident, $visit:ident, $ty:ty) => {
        fn $method<V>(self, visitor: V) -> Result<V::Value, Self::Error>
        where
            V: Visitor<'de>,
        {
            match self.0 {
                Value::String(text) => match text.trim().parse::<$ty>() {
                    Ok(parsed) => visitor.$visit(parsed),
                    Err(_) => Err(de::Error::custom(format_args!(
                        "cannot parse {:?} as {}",
                        text,
                        stringify!($ty)
                    ))),
                },
                other => other.$method(visitor),
            }
        }
    };
}

impl<'de> de::Deserializer<'de> for Weak {
    type Error = serde_json::Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_any(visitor)
    }

    weak_number!(deserialize_i8, visit_i8, i8);
    weak_number!(deserialize_i16, visit_i16, i16);
    weak_number!(deserialize_i32, visit_i32, i32);
    weak_number!(deserialize_i64, visit_i64, i64);
    weak_number!(deserialize_u8, visit_u8, u8);
    weak_number!(deserialize_u16, visit_u16, u16);
    weak_number!(deserialize_u32, visit_u32, u32);
    weak_number!(deserialize_u64, visit_u64, u64);
    weak_number!(deserialize_f32, visit_f32, f32);
    weak_number!(deserialize_f64, visit_f64, f64);

    fn deserialize_bool<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::String(text) => match text.trim() {
                "1" => visitor.visit_bool(true),
                "0" => visitor.visit_bool(false),
                trimmed => match trimmed.parse::<bool>() {
                    Ok(parsed) => visitor.visit_bool(parsed),
                    Err(_) => Err(de::Error::custom(format_args!(
                        "cannot parse {text:?} as bool"
                    ))),
                },
            },
            other => other.deserialize_bool(visitor),
        }
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.deserialize_string(visitor)
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Number(number) => visitor.visit_string(number.to_string()),
            Value::Bool(flag) => visitor.visit_string(flag.to_string()),
            other => other.deserialize_string(visitor),
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Null => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Array(elements) => visitor.visit_seq(WeakSeq {
                iter: elements.into_iter(),
            }),
            other => other.deserialize_seq(visitor),
        }
    }

    fn deserialize_tuple<V>(self, _len: usize, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Object(entries) => visitor.visit_map(WeakMap {
                iter: entries.into_iter(),
                pending: None,
            }),
            other => other.deserialize_map(visitor),
        }
    }

    fn deserialize_struct<V>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.deserialize_map(visitor)
    }

    fn deserialize_enum<V>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_enum(name, variants, visitor)
    }

    fn deserialize_char<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_char(visitor)
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_bytes(visitor)
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_byte_buf(visitor)
    }

    fn deserialize_unit<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_unit(visitor)
    }

    fn deserialize_unit_struct<V>(
        self,
        name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_unit_struct(name, visitor)
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_identifier(visitor)
    }

    fn deserialize_i128<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_i128(visitor)
    }

    fn deserialize_u128<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_u128(visitor)
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_ignored_any(visitor)
    }
}

/// Sequence access that re-wraps each element for weak coercion.
struct WeakSeq {
    iter: std::vec::IntoIter<Value>,
}

impl<'de> de::SeqAccess<'de> for WeakSeq {
    type Error = serde_json::Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, Self::Error>
    where
        T: de::DeserializeSeed<'de>,
    {
        match self.iter.next() {
            Some(element) => seed.deserialize(Weak(element)).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

/// Map access that re-wraps each value for weak coercion.
struct WeakMap {
    iter: serde_json::map::IntoIter,
    pending: Option<Value>,
}

impl<'de> de::MapAccess<'de> for WeakMap {
    type Error = serde_json::Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error>
    where
        K: de::DeserializeSeed<'de>,
    {
        match self.iter.next() {
            Some((key, value)) => {
                self.pending = Some(value);
                seed.deserialize(key.into_deserializer()).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, Self::Error>
    where
        V: de::DeserializeSeed<'de>,
    {
        let value = self
            .pending
            .take()
            .expect("next_value_seed called before next_key_seed");
        seed.deserialize(Weak(value))
    }
}
