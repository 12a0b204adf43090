use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    batch_exists, get_optional_str, get_required_str, now_iso, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let title = get_required_str(params, "title")?;
    let file_url = get_required_str(params, "fileUrl")?;
    let batch_id = get_optional_str(params, "batchId");
    if let Some(ref bid) = batch_id {
        if !batch_exists(conn, bid)? {
            return Err(HandlerErr::not_found("batch not found"));
        }
    }

    let material_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO materials(id, batch_id, subject, title, category, file_url, uploaded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &material_id,
            &batch_id,
            get_optional_str(params, "subject"),
            &title,
            get_optional_str(params, "category"),
            &file_url,
            now_iso(),
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "materials"))?;

    Ok(json!({ "materialId": material_id }))
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_optional_str(params, "batchId");
    let mut stmt = conn
        .prepare(
            "SELECT id, batch_id, subject, title, category, file_url, uploaded_at
             FROM materials
             WHERE ?1 IS NULL OR batch_id = ?1 OR batch_id IS NULL
             ORDER BY uploaded_at DESC",
        )
        .map_err(HandlerErr::query)?;
    let materials = stmt
        .query_map([&batch_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "batchId": r.get::<_, Option<String>>(1)?,
                "subject": r.get::<_, Option<String>>(2)?,
                "title": r.get::<_, String>(3)?,
                "category": r.get::<_, Option<String>>(4)?,
                "fileUrl": r.get::<_, String>(5)?,
                "uploadedAt": r.get::<_, String>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "materials": materials }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let material_id = get_required_str(params, "materialId")?;
    let deleted = conn
        .execute("DELETE FROM materials WHERE id = ?", [&material_id])
        .map_err(|e| HandlerErr::update(e, "materials"))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("material not found"));
    }
    Ok(json!({ "deleted": true }))
}

fn create_album(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let title = get_required_str(params, "title")?;
    let album_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO gallery_albums(id, title, cover_url, created_at)
         VALUES(?, ?, ?, ?)",
        (
            &album_id,
            &title,
            get_optional_str(params, "coverUrl"),
            now_iso(),
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "gallery_albums"))?;
    Ok(json!({ "albumId": album_id }))
}

fn add_images(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let album_id = get_required_str(params, "albumId")?;
    let Some(urls) = params.get("urls").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing urls"));
    };
    let urls: Vec<String> = urls
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .filter(|s| !s.is_empty())
        .collect();
    if urls.is_empty() {
        return Err(HandlerErr::bad_params("urls must not be empty"));
    }

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM gallery_albums WHERE id = ?",
            [&album_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("album not found"));
    }

    let base: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) FROM gallery_images WHERE album_id = ?",
            [&album_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    for (i, url) in urls.iter().enumerate() {
        tx.execute(
            "INSERT INTO gallery_images(id, album_id, url, sort_order)
             VALUES(?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &album_id,
                url,
                base + 1 + i as i64,
            ),
        )
        .map_err(|e| HandlerErr::insert(e, "gallery_images"))?;
    }
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({ "albumId": album_id, "addedCount": urls.len() }))
}

fn list_albums(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.title, a.cover_url, a.created_at,
                    (SELECT COUNT(*) FROM gallery_images i WHERE i.album_id = a.id)
             FROM gallery_albums a
             ORDER BY a.created_at DESC",
        )
        .map_err(HandlerErr::query)?;
    let album_rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut albums = Vec::with_capacity(album_rows.len());
    for (id, title, cover_url, created_at, image_count) in album_rows {
        let mut img_stmt = conn
            .prepare(
                "SELECT url FROM gallery_images WHERE album_id = ? ORDER BY sort_order",
            )
            .map_err(HandlerErr::query)?;
        let images = img_stmt
            .query_map([&id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        albums.push(json!({
            "id": id,
            "title": title,
            "coverUrl": cover_url,
            "createdAt": created_at,
            "imageCount": image_count,
            "images": images,
        }));
    }
    Ok(json!({ "albums": albums }))
}

fn delete_album(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let album_id = get_required_str(params, "albumId")?;
    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "DELETE FROM gallery_images WHERE album_id = ?",
        [&album_id],
    )
    .map_err(|e| HandlerErr::update(e, "gallery_images"))?;
    let deleted = tx
        .execute("DELETE FROM gallery_albums WHERE id = ?", [&album_id])
        .map_err(|e| HandlerErr::update(e, "gallery_albums"))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("album not found"));
    }
    tx.commit().map_err(HandlerErr::commit)?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
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
        "materials.create" => Some(run(create, state, req)),
        "materials.list" => Some(run(list, state, req)),
        "materials.delete" => Some(run(delete, state, req)),
        "gallery.createAlbum" => Some(run(create_album, state, req)),
        "gallery.addImages" => Some(run(add_images, state, req)),
        "gallery.list" => Some(run(list_albums, state, req)),
        "gallery.deleteAlbum" => Some(run(delete_album, state, req)),
        _ => None,
    }
}
