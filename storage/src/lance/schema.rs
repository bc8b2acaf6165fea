//! Arrow schemas and RecordBatch conversion for the Lance tables.
//!
//! Each row carries the scalar columns needed for filtering plus a JSON
//! `doc` column holding the full record. Message vectors live in their own
//! nullable fixed-size list column.

use std::sync::Arc;

use arrow_array::builder::{FixedSizeListBuilder, Float32Builder};
use arrow_array::{
    Array, ArrayRef, BooleanArray, FixedSizeListArray, Float32Array, Int64Array, RecordBatch,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use serde::de::DeserializeOwned;

use crate::error::{OpContext, Result, StorageError};
use crate::models::{ChatSettings, Message, UserProfile};

pub(super) const MESSAGES_TABLE: &str = "messages";
pub(super) const PROFILES_TABLE: &str = "profiles";
pub(super) const SETTINGS_TABLE: &str = "settings";
pub(super) const VECTOR_COLUMN: &str = "vector";
pub(super) const DISTANCE_COLUMN: &str = "_distance";

pub(super) fn messages_schema(embedding_dim: usize) -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("chat_id", DataType::Int64, false),
        Field::new("message_id", DataType::Int64, false),
        Field::new("user_id", DataType::Int64, false),
        Field::new("timestamp_ms", DataType::Int64, false),
        Field::new("size_bytes", DataType::Int64, false),
        Field::new("embeddable", DataType::Boolean, false),
        Field::new("has_vector", DataType::Boolean, false),
        Field::new("doc", DataType::Utf8, false),
        Field::new(
            VECTOR_COLUMN,
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                embedding_dim as i32,
            ),
            true,
        ),
    ]))
}

pub(super) fn profiles_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("chat_id", DataType::Int64, false),
        Field::new("user_id", DataType::Int64, false),
        Field::new("doc", DataType::Utf8, false),
    ]))
}

pub(super) fn settings_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("chat_id", DataType::Int64, false),
        Field::new("doc", DataType::Utf8, false),
    ]))
}

fn to_doc<T: serde::Serialize>(value: &T, context: OpContext) -> Result<String> {
    serde_json::to_string(value).map_err(|e| StorageError::serialization(context, e))
}

pub(super) fn messages_to_batch(
    schema: SchemaRef,
    messages: &[Message],
    embedding_dim: usize,
    context: OpContext,
) -> Result<RecordBatch> {
    let mut docs = Vec::with_capacity(messages.len());
    let mut vectors = FixedSizeListBuilder::new(Float32Builder::new(), embedding_dim as i32);
    for message in messages {
        // The vector is stored in its own column only.
        let mut doc = message.clone();
        let embedding = doc.embedding.take();
        docs.push(to_doc(&doc, context)?);

        match embedding {
            Some(v) if v.len() == embedding_dim => {
                vectors.values().append_slice(&v);
                vectors.append(true);
            }
            Some(v) => {
                return Err(StorageError::Validation(format!(
                    "embedding dimension mismatch for {}: expected {}, got {}",
                    context,
                    embedding_dim,
                    v.len()
                )))
            }
            None => {
                for _ in 0..embedding_dim {
                    vectors.values().append_value(0.0);
                }
                vectors.append(false);
            }
        }
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from_iter_values(messages.iter().map(|m| m.chat_id))),
        Arc::new(Int64Array::from_iter_values(messages.iter().map(|m| m.message_id))),
        Arc::new(Int64Array::from_iter_values(messages.iter().map(|m| m.user_id))),
        Arc::new(Int64Array::from_iter_values(
            messages.iter().map(|m| m.timestamp.timestamp_millis()),
        )),
        Arc::new(Int64Array::from_iter_values(
            messages.iter().map(|m| m.approx_size() as i64),
        )),
        Arc::new(BooleanArray::from(
            messages.iter().map(|m| m.is_embeddable()).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            messages.iter().map(|m| m.embedding.is_some()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(docs)),
        Arc::new(vectors.finish()),
    ];

    RecordBatch::try_new(schema, columns).map_err(|e| StorageError::serialization(context, e))
}

pub(super) fn profile_to_batch(profile: &UserProfile, context: OpContext) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(vec![profile.chat_id])),
        Arc::new(Int64Array::from(vec![profile.user_id])),
        Arc::new(StringArray::from(vec![to_doc(profile, context)?])),
    ];
    RecordBatch::try_new(profiles_schema(), columns)
        .map_err(|e| StorageError::serialization(context, e))
}

pub(super) fn settings_to_batch(settings: &ChatSettings, context: OpContext) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(vec![settings.chat_id])),
        Arc::new(StringArray::from(vec![to_doc(settings, context)?])),
    ];
    RecordBatch::try_new(settings_schema(), columns)
        .map_err(|e| StorageError::serialization(context, e))
}

/// Typed column lookup by name; Lance may return columns in any order.
pub(super) fn column<'a, T: 'static>(
    batch: &'a RecordBatch,
    name: &str,
    context: OpContext,
) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| {
            StorageError::serialization(context, format!("column {:?} missing or mistyped", name))
        })
}

pub(super) fn docs_from_batch<T: DeserializeOwned>(
    batch: &RecordBatch,
    context: OpContext,
) -> Result<Vec<T>> {
    let docs = column::<StringArray>(batch, "doc", context)?;
    (0..batch.num_rows())
        .map(|row| {
            serde_json::from_str(docs.value(row)).map_err(|e| StorageError::serialization(context, e))
        })
        .collect()
}

pub(super) fn messages_from_batch(batch: &RecordBatch, context: OpContext) -> Result<Vec<Message>> {
    let mut messages: Vec<Message> = docs_from_batch(batch, context)?;
    let Some(vectors) = batch
        .column_by_name(VECTOR_COLUMN)
        .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
    else {
        return Ok(messages);
    };
    for (row, message) in messages.iter_mut().enumerate() {
        if vectors.is_null(row) {
            continue;
        }
        let values = vectors.value(row);
        let values = values
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| StorageError::serialization(context, "vector values are not f32"))?;
        message.embedding = Some(values.iter().map(|x| x.unwrap_or(0.0)).collect());
    }
    Ok(messages)
}

/// Cosine `_distance` to a similarity score in `[0, 1]`.
pub(super) fn distances_from_batch(batch: &RecordBatch) -> Vec<f32> {
    let Some(col) = batch
        .column_by_name(DISTANCE_COLUMN)
        .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
    else {
        return vec![1.0; batch.num_rows()];
    };
    (0..batch.num_rows())
        .map(|row| {
            let distance = if col.is_null(row) { 0.0 } else { col.value(row) };
            (1.0 - distance).clamp(0.0, 1.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_message_batch_round_trip_keeps_vector_out_of_doc() {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let mut vectored = Message::new(1, 1, 2, t, "hi");
        vectored.embedding = Some(vec![0.25, 0.5, 0.75]);
        let plain = Message::new(1, 2, 2, t, "");
        let context = OpContext::new("test");

        let batch =
            messages_to_batch(messages_schema(3), &[vectored.clone(), plain.clone()], 3, context)
                .unwrap();
        let docs = column::<StringArray>(&batch, "doc", context).unwrap();
        assert!(!docs.value(0).contains("embedding"));
        let flags = column::<BooleanArray>(&batch, "embeddable", context).unwrap();
        assert!(flags.value(0));
        assert!(!flags.value(1));

        let back = messages_from_batch(&batch, context).unwrap();
        assert_eq!(back, vec![vectored, plain]);
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let mut m = Message::new(1, 1, 2, t, "hi");
        m.embedding = Some(vec![1.0]);
        let err = messages_to_batch(messages_schema(3), &[m], 3, OpContext::new("test")).unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }
}
