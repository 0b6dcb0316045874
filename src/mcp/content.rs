//! tools/call 结果中 content 数组的读取（text / image 条目）

use serde_json::Value;

/// 拼接所有 type == "text" 条目的文本（换行分隔）
pub fn text_content(result: &Value) -> String {
    content_items(result)
        .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 第一个 type == "image" 条目的 base64 数据
pub fn image_data(result: &Value) -> Option<&str> {
    content_items(result)
        .find(|item| item.get("type").and_then(|t| t.as_str()) == Some("image"))
        .and_then(|item| item.get("data"))
        .and_then(|d| d.as_str())
}

fn content_items(result: &Value) -> impl Iterator<Item = &Value> {
    result
        .get("content")
        .and_then(|c| c.as_array())
        .into_iter()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_content_joins_text_items() {
        let result = json!({"content": [
            {"type": "text", "text": "- button \"Search\" [ref=s12]"},
            {"type": "image", "data": "AAAA"},
            {"type": "text", "text": "- textbox [ref=s8]"}
        ]});
        assert_eq!(
            text_content(&result),
            "- button \"Search\" [ref=s12]\n- textbox [ref=s8]"
        );
    }

    #[test]
    fn test_image_data_and_missing_content() {
        let result = json!({"content": [{"type": "image", "data": "iVBORw0KGgo=", "mimeType": "image/png"}]});
        assert_eq!(image_data(&result), Some("iVBORw0KGgo="));
        assert_eq!(image_data(&json!({})), None);
        assert_eq!(text_content(&json!({"content": "oops"})), "");
    }
}
