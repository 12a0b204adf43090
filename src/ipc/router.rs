use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let resp = dispatch(state, &req);
    if resp.get("ok").and_then(|v| v.as_bool()) == Some(true) {
        for collection in changed_collections(&req.method) {
            state.bus.notify(collection, &req.method);
        }
    }
    resp
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::session::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::students::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::teachers::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::batches::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::subjects::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::attendance::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::fees::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::gradebook::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::assignments::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::announcements::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::materials::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::expenses::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::settings::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::assets::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::watch::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::backup::try_handle(state, req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}

/// Collections a successful call mutated, for change-bus fan-out.
fn changed_collections(method: &str) -> &'static [&'static str] {
    match method {
        "students.enroll" | "students.update" | "students.delete" => &["students"],
        "teachers.create" | "teachers.update" | "teachers.delete" => &["teachers"],
        "batches.create" | "batches.update" | "batches.delete" => &["batches"],
        "subjects.create" | "subjects.delete" => &["subjects"],
        "attendance.submit" | "attendance.edit" => &["attendanceRecords"],
        "feeStructures.savePlan" | "feeStructures.deletePlan" => &["feeStructures"],
        "studentFees.assignPlan" => &["studentFeeDetails"],
        "studentFees.collect" => &["studentFeeDetails", "receipts"],
        "assessments.create" | "assessments.update" | "assessments.delete" => &["assessments"],
        "grades.saveDraft" => &["grades"],
        "grades.publish" => &["grades", "assessments"],
        "assignments.create" | "assignments.delete" => &["assignments"],
        "submissions.submit" | "submissions.grade" => &["submissions"],
        "announcements.create" | "announcements.delete" => &["announcements"],
        "events.create" | "events.delete" => &["events"],
        "materials.create" | "materials.delete" => &["materials"],
        "gallery.createAlbum" | "gallery.addImages" | "gallery.deleteAlbum" => &["galleryAlbums"],
        "expenses.create" | "expenses.delete" => &["expenses"],
        "payroll.record" => &["payroll"],
        "settings.saveEmailTemplate" | "settings.quickLinks.save" => &["settings"],
        _ => &[],
    }
}
