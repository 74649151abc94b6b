//! 分块 Base64 解码。
//!
//! 大文件一次性解码会把事件循环卡住几百毫秒，这里按固定块处理，
//! 每隔几块让出一次执行权。

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use crate::core::errors::{Result, UploadError};

/// 单块输入长度（字符数，必须是 4 的倍数）
const CHUNK_CHARS: usize = 8 * 1024;

/// 每处理多少块让出一次执行权
const YIELD_EVERY: usize = 4;

/// 把 base64 字符串解码为字节。
/// 输入损坏返回 [`UploadError::Decode`]，调用方按阶段失败处理，不走网络重试。
pub async fn decode_base64_chunked(input: &str) -> Result<Vec<u8>> {
    let input = input.trim();
    let bytes = input.as_bytes();

    // 估算输出大小，避免增量扩容
    let mut out = Vec::with_capacity(bytes.len() / 4 * 3);
    let mut processed = 0usize;
    let mut chunk_index = 0usize;

    while processed < bytes.len() {
        let end = usize::min(processed + CHUNK_CHARS, bytes.len());
        let decoded = BASE64_STANDARD
            .decode(&bytes[processed..end])
            .map_err(|err| UploadError::Decode(err.to_string()))?;
        out.extend_from_slice(&decoded);
        processed = end;

        chunk_index += 1;
        if chunk_index % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_decode_small() {
        let encoded = BASE64_STANDARD.encode(b"hello backhaul");
        let decoded = decode_base64_chunked(&encoded).await.unwrap();
        assert_eq!(decoded, b"hello backhaul");
    }

    #[tokio::test]
    async fn test_decode_spans_many_chunks() {
        // 远超单块大小，覆盖跨块路径
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let encoded = BASE64_STANDARD.encode(&data);
        assert!(encoded.len() > CHUNK_CHARS * 8);

        let decoded = decode_base64_chunked(&encoded).await.unwrap();
        assert_eq!(decoded, data);
    }

    #[tokio::test]
    async fn test_decode_empty() {
        let decoded = decode_base64_chunked("").await.unwrap();
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn test_decode_invalid_input() {
        let result = decode_base64_chunked("not*valid*base64!").await;
        assert!(matches!(result, Err(UploadError::Decode(_))));
    }

    #[tokio::test]
    async fn test_decode_with_surrounding_whitespace() {
        let encoded = format!("  {}\n", BASE64_STANDARD.encode(b"trimmed"));
        let decoded = decode_base64_chunked(&encoded).await.unwrap();
        assert_eq!(decoded, b"trimmed");
    }
}
