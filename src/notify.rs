use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde_json::json;
use uuid::Uuid;

pub const DEFAULT_ABSENCE_SUBJECT: &str = "Absence notice: {{studentName}}";
pub const DEFAULT_ABSENCE_BODY: &str = "<p>Dear guardian,</p>\
<p>{{studentName}} was marked absent from batch {{batchName}} on {{date}}.</p>\
<p>Please contact the institute office if this is unexpected.</p>";

#[derive(Debug, Clone)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

/// Boundary trait for the transactional mail collaborator. Delivery mechanics
/// are out of scope; the daemon only hands messages over.
pub trait MailSender: Send + Sync {
    fn send(&self, msg: &MailMessage) -> anyhow::Result<()>;
}

/// Drops each message as a JSON file into an outbox directory, where an
/// external delivery agent picks them up.
pub struct OutboxMailer {
    dir: PathBuf,
}

impl OutboxMailer {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl MailSender for OutboxMailer {
    fn send(&self, msg: &MailMessage) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create outbox {}", self.dir.to_string_lossy())
        })?;
        let queued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let path = self.dir.join(format!("{}.json", Uuid::new_v4()));
        let payload = json!({
            "to": msg.to,
            "subject": msg.subject,
            "htmlBody": msg.html_body,
            "queuedAt": queued_at,
        });
        fs::write(&path, serde_json::to_string_pretty(&payload)?)
            .with_context(|| format!("failed to write {}", path.to_string_lossy()))?;
        Ok(())
    }
}

/// Literal `{{name}}` substitution. Unknown placeholders are left in place.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

/// Fire-and-forget fan-out: one detached send per message, failures logged
/// and never reported back. The caller has already committed its writes.
pub fn dispatch_detached(mailer: Arc<dyn MailSender>, messages: Vec<MailMessage>) {
    for msg in messages {
        let mailer = Arc::clone(&mailer);
        thread::spawn(move || {
            if let Err(e) = mailer.send(&msg) {
                tracing::warn!(to = %msg.to, error = %e, "notification send failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_every_occurrence() {
        let out = render_template(
            "{{studentName}} absent on {{date}}; contact re {{studentName}}",
            &[("studentName", "Asha Rao"), ("date", "2026-08-06")],
        );
        assert_eq!(out, "Asha Rao absent on 2026-08-06; contact re Asha Rao");
    }

    #[test]
    fn render_leaves_unknown_placeholders() {
        let out = render_template("hello {{who}}", &[("name", "x")]);
        assert_eq!(out, "hello {{who}}");
    }

    #[test]
    fn outbox_writes_one_file_per_message() {
        let dir = std::env::temp_dir().join(format!(
            "tutord-outbox-test-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let mailer = OutboxMailer::new(dir.clone());
        mailer
            .send(&MailMessage {
                to: "guardian@example.com".to_string(),
                subject: "s".to_string(),
                html_body: "<p>b</p>".to_string(),
            })
            .expect("send");
        let count = fs::read_dir(&dir).expect("outbox dir").count();
        assert_eq!(count, 1);
        let _ = fs::remove_dir_all(dir);
    }
}
