//! Conversions between AMQP field tables and JSON.
//!
//! Declaration arguments and publishing headers reach the relay as JSON (configuration files,
//! facade requests) while message headers travel to task executors as JSON: these helpers
//! bridge the two worlds.
use amq_protocol_types::{AMQPValue, FieldArray, FieldTable};
use lapin::ExchangeKind;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Render an AMQP field table as a JSON object.
///
/// Long strings are decoded lossily as UTF-8, decimals become floating point numbers and
/// byte arrays become arrays of numbers.
pub fn field_table_to_json(table: &FieldTable) -> Value {
    Value::Object(
        table
            .inner()
            .iter()
            .map(|(key, value)| (key.as_str().to_owned(), amqp_value_to_json(value)))
            .collect(),
    )
}

/// Render a single AMQP value as JSON.
pub fn amqp_value_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(v) => Value::Bool(*v),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Float(v) => Value::from(*v),
        AMQPValue::Double(v) => Value::from(*v),
        AMQPValue::DecimalValue(decimal) => {
            Value::from(f64::from(decimal.value) / 10f64.powi(i32::from(decimal.scale)))
        }
        AMQPValue::ShortString(v) => Value::from(v.as_str()),
        AMQPValue::LongString(v) => Value::from(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::FieldArray(values) => {
            Value::Array(values.as_slice().iter().map(amqp_value_to_json).collect())
        }
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::FieldTable(table) => field_table_to_json(table),
        AMQPValue::ByteArray(bytes) => {
            Value::Array(bytes.as_slice().iter().copied().map(Value::from).collect())
        }
        AMQPValue::Void => Value::Null,
    }
}

/// Convert a JSON object into an AMQP field table.
pub fn json_to_field_table(object: &Map<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in object {
        table.insert(key.as_str().into(), json_to_amqp_value(value));
    }
    table
}

/// Convert a JSON value into the closest AMQP value.
///
/// Integers become signed 64-bit integers (`l`), which is what RabbitMQ expects for
/// arguments such as `x-message-ttl` or `x-max-priority`.
pub fn json_to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => AMQPValue::LongLongInt(integer),
            None => AMQPValue::Double(number.as_f64().unwrap_or_default()),
        },
        Value::String(v) => AMQPValue::LongString(v.as_str().into()),
        Value::Array(values) => {
            let mut array = FieldArray::default();
            for value in values {
                array.push(json_to_amqp_value(value));
            }
            AMQPValue::FieldArray(array)
        }
        Value::Object(object) => AMQPValue::FieldTable(json_to_field_table(object)),
    }
}

/// Deserialize an optional JSON object into a [`FieldTable`].
///
/// A missing or `null` value yields an empty table.
pub fn deserialize_field_table<'de, D>(deserializer: D) -> Result<FieldTable, D::Error>
where
    D: Deserializer<'de>,
{
    let object = Option::<Map<String, Value>>::deserialize(deserializer)?;
    Ok(object
        .as_ref()
        .map(json_to_field_table)
        .unwrap_or_default())
}

/// Map an exchange type name onto [`ExchangeKind`].
///
/// Unknown names (e.g. plugin-provided exchange types such as `x-delayed-message`) are passed
/// through as [`ExchangeKind::Custom`].
pub fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        custom => ExchangeKind::Custom(custom.to_owned()),
    }
}
