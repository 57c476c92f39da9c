//! Checkpoint 列表编解码
//!
//! 二进制格式（热层 bucket 直接存放）：
//!
//! ```text
//! [u32 大端 count][checkpoint 0 字节][checkpoint 1 字节]...
//! ```
//!
//! 单个 checkpoint 的字节由 [`CheckpointSerializer`] 决定，必须能自行定界。
//!
//! 文本信封（冷层字符串列存放）：
//!
//! ```json
//! { "data": "<上述字节的 base64>" }
//! ```

use crate::error::{CodecError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::marker::PhantomData;

const COUNT_LEN: usize = 4;
const ENVELOPE_FIELD: &str = "data";

/// 单个 checkpoint 的序列化器，由 Agent 运行时提供
pub trait CheckpointSerializer: Send + Sync + 'static {
    type Checkpoint: Clone + Send + Sync + 'static;

    /// 将 checkpoint 追加写入 `out`
    fn write(&self, checkpoint: &Self::Checkpoint, out: &mut Vec<u8>) -> Result<()>;

    /// 从 `input` 头部读出一个 checkpoint，并将游标推进到其后
    fn read(&self, input: &mut &[u8]) -> Result<Self::Checkpoint>;
}

/// 以 `[u32 长度][JSON 字节]` 定界的 serde 序列化器
pub struct JsonCheckpointSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCheckpointSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCheckpointSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CheckpointSerializer for JsonCheckpointSerializer<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Checkpoint = T;

    fn write(&self, checkpoint: &T, out: &mut Vec<u8>) -> Result<()> {
        let bytes = serde_json::to_vec(checkpoint)?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| CodecError::Serialization("checkpoint exceeds 4 GiB".to_string()))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&bytes);
        Ok(())
    }

    fn read(&self, input: &mut &[u8]) -> Result<T> {
        let len = take_u32(input)? as usize;
        if input.len() < len {
            return Err(corrupt(format!(
                "checkpoint declares {len} bytes, only {} available",
                input.len()
            )));
        }
        let (body, rest) = input.split_at(len);
        let checkpoint = serde_json::from_slice(body)
            .map_err(|e| corrupt(format!("checkpoint body: {e}")))?;
        *input = rest;
        Ok(checkpoint)
    }
}

/// 列表编解码器，注入到生命周期控制器中
pub struct CheckpointCodec<S> {
    serializer: S,
}

impl<S: CheckpointSerializer> CheckpointCodec<S> {
    pub fn new(serializer: S) -> Self {
        Self { serializer }
    }

    pub fn encode(&self, checkpoints: &[S::Checkpoint]) -> Result<Vec<u8>> {
        let count = u32::try_from(checkpoints.len())
            .map_err(|_| CodecError::Serialization("too many checkpoints".to_string()))?;
        let mut out = Vec::with_capacity(COUNT_LEN);
        out.extend_from_slice(&count.to_be_bytes());
        for checkpoint in checkpoints {
            self.serializer.write(checkpoint, &mut out)?;
        }
        Ok(out)
    }

    /// 任一 checkpoint 解码失败，或 count 与实际字节不符，都返回 `CorruptPayload`
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<S::Checkpoint>> {
        let mut cursor = bytes;
        let count = take_u32(&mut cursor)? as usize;
        // count 来自不可信数据，不按它预分配
        let mut checkpoints = Vec::with_capacity(count.min(cursor.len()));
        for index in 0..count {
            if cursor.is_empty() {
                return Err(corrupt(format!(
                    "count is {count} but payload ends after {index} checkpoints"
                )));
            }
            let checkpoint = self.serializer.read(&mut cursor).map_err(|e| {
                if e.is_corrupt_payload() {
                    e
                } else {
                    corrupt(format!("checkpoint {index}: {e}"))
                }
            })?;
            checkpoints.push(checkpoint);
        }
        if !cursor.is_empty() {
            return Err(corrupt(format!(
                "{} trailing bytes after {count} checkpoints",
                cursor.len()
            )));
        }
        Ok(checkpoints)
    }

    pub fn encode_envelope(&self, checkpoints: &[S::Checkpoint]) -> Result<String> {
        let bytes = self.encode(checkpoints)?;
        Ok(json!({ ENVELOPE_FIELD: STANDARD.encode(bytes) }).to_string())
    }

    /// 空字符串（或仅空白）视为空列表
    pub fn decode_envelope(&self, envelope: &str) -> Result<Vec<S::Checkpoint>> {
        if envelope.trim().is_empty() {
            return Ok(Vec::new());
        }
        let doc: Value = serde_json::from_str(envelope)
            .map_err(|e| corrupt(format!("envelope is not JSON: {e}")))?;
        let data = doc
            .get(ENVELOPE_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| corrupt(format!("envelope has no string field '{ENVELOPE_FIELD}'")))?;
        let bytes = STANDARD.decode(data)?;
        self.decode(&bytes)
    }

    /// 可为空的信封（例如数据库中的 NULL 列）
    pub fn decode_optional_envelope(&self, envelope: Option<&str>) -> Result<Vec<S::Checkpoint>> {
        match envelope {
            Some(text) => self.decode_envelope(text),
            None => Ok(Vec::new()),
        }
    }
}

fn take_u32(input: &mut &[u8]) -> Result<u32> {
    if input.len() < COUNT_LEN {
        return Err(corrupt(format!(
            "expected a 4-byte length, found {} bytes",
            input.len()
        )));
    }
    let (head, rest) = input.split_at(COUNT_LEN);
    *input = rest;
    Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
}

fn corrupt(message: String) -> crate::error::CacheError {
    CodecError::CorruptPayload(message).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use serde_json::json;

    fn codec() -> CheckpointCodec<JsonCheckpointSerializer<Checkpoint>> {
        CheckpointCodec::new(JsonCheckpointSerializer::new())
    }

    fn sample() -> Vec<Checkpoint> {
        vec![
            Checkpoint::new(json!({"messages": ["hi", "hello"], "score": 0.25}))
                .with_nodes("agent", "tool"),
            Checkpoint::new(json!({"messages": ["hi"]})),
            Checkpoint::new(json!(null)),
        ]
    }

    #[test]
    fn test_empty_list_is_just_a_zero_count() {
        let bytes = codec().encode(&[]).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert!(codec().decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_order_survives_binary_and_envelope() {
        let list = sample();
        let codec = codec();
        assert_eq!(codec.decode(&codec.encode(&list).unwrap()).unwrap(), list);

        let envelope = codec.encode_envelope(&list).unwrap();
        let doc: Value = serde_json::from_str(&envelope).unwrap();
        assert!(doc["data"].is_string());
        assert_eq!(codec.decode_envelope(&envelope).unwrap(), list);
    }

    #[test]
    fn test_count_header_is_big_endian() {
        let bytes = codec().encode(&sample()).unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 3]);
    }

    #[test]
    fn test_blank_or_null_envelope_is_empty() {
        let codec = codec();
        assert!(codec.decode_envelope("").unwrap().is_empty());
        assert!(codec.decode_envelope("   ").unwrap().is_empty());
        assert!(codec.decode_optional_envelope(None).unwrap().is_empty());
    }

    #[test]
    fn test_count_larger_than_payload_is_corrupt() {
        let codec = codec();
        let mut bytes = codec.encode(&sample()).unwrap();
        bytes[3] = 9;
        assert!(codec.decode(&bytes).unwrap_err().is_corrupt_payload());
    }

    #[test]
    fn test_count_smaller_than_payload_is_corrupt() {
        let codec = codec();
        let mut bytes = codec.encode(&sample()).unwrap();
        bytes[3] = 1;
        assert!(codec.decode(&bytes).unwrap_err().is_corrupt_payload());
    }

    #[test]
    fn test_truncated_or_garbled_payload_is_corrupt() {
        let codec = codec();
        let bytes = codec.encode(&sample()).unwrap();
        assert!(codec.decode(&bytes[..bytes.len() - 2]).unwrap_err().is_corrupt_payload());
        assert!(codec.decode(&[0, 0]).unwrap_err().is_corrupt_payload());

        let mut garbled = codec.encode(&sample()[..1]).unwrap();
        let last = garbled.len() - 1;
        garbled[last] = b'#';
        assert!(codec.decode(&garbled).unwrap_err().is_corrupt_payload());
    }

    #[test]
    fn test_malformed_envelopes_are_corrupt() {
        let codec = codec();
        assert!(codec.decode_envelope("not json").unwrap_err().is_corrupt_payload());
        assert!(codec.decode_envelope(r#"{"other": 1}"#).unwrap_err().is_corrupt_payload());
        assert!(codec.decode_envelope(r#"{"data": "@@@"}"#).unwrap_err().is_corrupt_payload());
    }
}
