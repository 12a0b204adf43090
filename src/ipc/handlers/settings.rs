use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::notify;
use rusqlite::Connection;
use serde_json::{json, Value};

#[derive(Clone, Copy)]
enum TemplateKey {
    Absence,
    FeeReceipt,
    Welcome,
}

impl TemplateKey {
    const ALL: [TemplateKey; 3] = [Self::Absence, Self::FeeReceipt, Self::Welcome];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "absence" => Some(Self::Absence),
            "feeReceipt" => Some(Self::FeeReceipt),
            "welcome" => Some(Self::Welcome),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Absence => "absence",
            Self::FeeReceipt => "feeReceipt",
            Self::Welcome => "welcome",
        }
    }

    fn settings_key(self) -> String {
        format!("emailTemplates.{}", self.name())
    }

    fn default_value(self) -> Value {
        match self {
            Self::Absence => json!({
                "subject": notify::DEFAULT_ABSENCE_SUBJECT,
                "body": notify::DEFAULT_ABSENCE_BODY,
            }),
            Self::FeeReceipt => json!({
                "subject": "Payment received: {{receiptNo}}",
                "body": "<p>Dear guardian,</p>\
<p>We received {{amount}} towards {{studentName}}'s fees. Receipt {{receiptNo}}.</p>",
            }),
            Self::Welcome => json!({
                "subject": "Welcome to the institute",
                "body": "<p>Dear {{studentName}},</p>\
<p>Your enrollment is confirmed. Your login is {{userName}}.</p>",
            }),
        }
    }
}

fn get_email_templates(
    conn: &Connection,
    _params: &Value,
) -> Result<Value, HandlerErr> {
    let mut templates = serde_json::Map::new();
    for key in TemplateKey::ALL {
        let stored = db::settings_get_json(conn, &key.settings_key()).map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
        templates.insert(
            key.name().to_string(),
            stored.unwrap_or_else(|| key.default_value()),
        );
    }
    Ok(json!({ "templates": templates }))
}

fn save_email_template(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let raw_key = get_required_str(params, "key")?;
    let Some(key) = TemplateKey::parse(&raw_key) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "key must be one of: absence, feeReceipt, welcome".to_string(),
            details: Some(json!({ "key": raw_key })),
        });
    };
    let subject = get_required_str(params, "subject")?;
    let body = get_required_str(params, "body")?;

    db::settings_set_json(
        conn,
        &key.settings_key(),
        &json!({ "subject": subject, "body": body }),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "settings" })),
    })?;

    Ok(json!({ "key": key.name() }))
}

fn quick_links_get(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let links = db::settings_get_json(conn, "quickLinks")
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .unwrap_or_else(|| json!([]));
    Ok(json!({ "links": links }))
}

fn quick_links_save(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let Some(links) = params.get("links").filter(|v| v.is_array()) else {
        return Err(HandlerErr::bad_params("missing links"));
    };
    for link in links.as_array().into_iter().flatten() {
        let label = link.get("label").and_then(|v| v.as_str()).unwrap_or("");
        let url = link.get("url").and_then(|v| v.as_str()).unwrap_or("");
        if label.is_empty() || url.is_empty() {
            return Err(HandlerErr::bad_params(
                "each link needs a label and a url",
            ));
        }
    }
    db::settings_set_json(conn, "quickLinks", links).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "settings" })),
    })?;
    Ok(json!({ "saved": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |f: fn(&Connection, &Value) -> Result<Value, HandlerErr>,
               state: &mut AppState,
               req: &Request| {
        let Some(conn) = state.db.as_ref() else {
            return err(&req.id, "no_workspace", "select a workspace first", None);
        };
        match f(conn, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }
    };

    match req.method.as_str() {
        "settings.getEmailTemplates" => Some(run(get_email_templates, state, req)),
        "settings.saveEmailTemplate" => Some(run(save_email_template, state, req)),
        "settings.quickLinks.get" => Some(run(quick_links_get, state, req)),
        "settings.quickLinks.save" => Some(run(quick_links_save, state, req)),
        _ => None,
    }
}
