//! 截图产物：从工具结果中取 base64 图像并写到 `<output>/trajectory/step_NNN.png`

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

use crate::mcp::image_data;

/// 截图目录名
pub const TRAJECTORY_DIR: &str = "trajectory";

/// 第 step 步的文件名（close 时带 `_final` 后缀）
pub fn artifact_file_name(step: usize, is_final: bool) -> String {
    if is_final {
        format!("step_{step:03}_final.png")
    } else {
        format!("step_{step:03}.png")
    }
}

/// 取图像数据：优先 content 中的 image 条目，其次 data / screenshot / image 字段
pub fn extract_image(result: &Value) -> Option<&str> {
    image_data(result)
        .or_else(|| {
            ["data", "screenshot", "image"]
                .iter()
                .find_map(|key| result.get(*key).and_then(|v| v.as_str()))
        })
        .filter(|s| !s.is_empty())
}

/// 解码 base64（容忍 data URL 前缀与换行）
pub fn decode_image(data: &str) -> Result<Vec<u8>, String> {
    let payload = match data.split_once(";base64,") {
        Some((_, rest)) => rest,
        None => data,
    };
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| format!("invalid base64 image data: {e}"))
}

/// 保存截图，返回写入的路径
pub async fn save_artifact(
    output_dir: &Path,
    step: usize,
    is_final: bool,
    result: &Value,
) -> Result<PathBuf, String> {
    let data = extract_image(result).ok_or_else(|| {
        let keys: Vec<&str> = result
            .as_object()
            .map(|o| o.keys().map(|k| k.as_str()).collect())
            .unwrap_or_default();
        format!("no image data in screenshot response (keys: {keys:?})")
    })?;
    let bytes = decode_image(data)?;

    let dir = output_dir.join(TRAJECTORY_DIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| format!("failed to create {}: {e}", dir.display()))?;
    let path = dir.join(artifact_file_name(step, is_final));
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), bytes = bytes.len(), "screenshot saved");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::mock::TINY_PNG_BASE64;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_file_names() {
        assert_eq!(artifact_file_name(0, false), "step_000.png");
        assert_eq!(artifact_file_name(12, false), "step_012.png");
        assert_eq!(artifact_file_name(3, true), "step_003_final.png");
    }

    #[test]
    fn test_extract_image_fallback_keys() {
        assert_eq!(extract_image(&json!({"screenshot": "QUJD"})), Some("QUJD"));
        assert_eq!(extract_image(&json!({"data": ""})), None);
        assert_eq!(extract_image(&json!({"content": []})), None);
    }

    #[test]
    fn test_decode_accepts_data_url() {
        let bytes = decode_image("data:image/png;base64,QUJD").unwrap();
        assert_eq!(bytes, b"ABC");
        assert!(decode_image("***").is_err());
    }

    #[tokio::test]
    async fn test_save_artifact_writes_png() {
        let dir = TempDir::new().unwrap();
        let result = json!({"content": [{"type": "image", "data": TINY_PNG_BASE64}]});
        let path = save_artifact(dir.path(), 1, false, &result).await.unwrap();
        assert_eq!(path, dir.path().join("trajectory").join("step_001.png"));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"\x89PNG");
    }

    #[tokio::test]
    async fn test_save_artifact_without_image_fails() {
        let dir = TempDir::new().unwrap();
        let err = save_artifact(dir.path(), 1, false, &json!({"content": [{"type": "text", "text": "no"}]}))
            .await
            .unwrap_err();
        assert!(err.contains("no image data"));
    }
}
