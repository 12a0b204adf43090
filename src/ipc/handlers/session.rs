use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generated login credential pair for enrollment flows. The plaintext
/// password is returned to the caller exactly once and only its digest is
/// stored.
pub struct Credentials {
    pub user_name: String,
    pub password: String,
}

pub fn generate_credentials(first_name: &str, last_name: &str) -> Credentials {
    let token = Uuid::new_v4().simple().to_string();
    let base: String = format!("{}.{}", first_name, last_name)
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.')
        .collect();
    Credentials {
        user_name: format!("{}.{}", base.trim_matches('.'), &token[..4]),
        password: token[4..14].to_string(),
    }
}

pub fn create_user(
    conn: &Connection,
    user_name: &str,
    password: &str,
    role: &str,
    person_id: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO users(id, user_name, password_sha256, role, person_id)
         VALUES(?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            user_name,
            sha256_hex(password),
            role,
            person_id,
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "users"))?;
    Ok(())
}

fn sign_in(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<Session, HandlerErr> {
    let user_name = get_required_str(params, "userName")?;
    let password = get_required_str(params, "password")?;

    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT password_sha256, role, person_id FROM users WHERE user_name = ?",
            [&user_name],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?;

    let Some((stored_digest, role, person_id)) = row else {
        return Err(HandlerErr::conflict(
            "auth_failed",
            "unknown user or wrong password",
        ));
    };
    if sha256_hex(&password) != stored_digest {
        return Err(HandlerErr::conflict(
            "auth_failed",
            "unknown user or wrong password",
        ));
    }

    Ok(Session {
        user_name,
        role,
        person_id,
    })
}

fn handle_sign_in(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match sign_in(conn, &req.params) {
        Ok(session) => {
            let result = json!({
                "userName": session.user_name,
                "role": session.role,
                "personId": session.person_id,
            });
            state.session = Some(session);
            ok(&req.id, result)
        }
        Err(e) => e.response(&req.id),
    }
}

fn handle_sign_out(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.session = None;
    ok(&req.id, json!({ "signedOut": true }))
}

fn handle_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    match state.session.as_ref() {
        Some(s) => ok(
            &req.id,
            json!({
                "userName": s.user_name,
                "role": s.role,
                "personId": s.person_id,
            }),
        ),
        None => ok(&req.id, json!(null)),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.signIn" => Some(handle_sign_in(state, req)),
        "session.signOut" => Some(handle_sign_out(state, req)),
        "session.current" => Some(handle_current(state, req)),
        _ => None,
    }
}
