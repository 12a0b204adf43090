use serde::Serialize;
use serde_json::json;

#[derive(Debug, Serialize)]
struct ErrBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result,
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let body = ErrBody {
        code: code.to_string(),
        message: message.into(),
        details,
    };
    json!({
        "id": id,
        "ok": false,
        "error": body,
    })
}
