use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "institute.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batches(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            teacher_id TEXT,
            subjects TEXT NOT NULL DEFAULT '[]',
            capacity INTEGER,
            status TEXT NOT NULL DEFAULT 'upcoming'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            batch_id TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            guardian_name TEXT,
            guardian_email TEXT,
            guardian_phone TEXT,
            subjects TEXT NOT NULL DEFAULT '[]',
            admission_date TEXT NOT NULL,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_batch ON students(batch_id)",
        [],
    )?;

    // Older workspaces carried a denormalized batch name on each student.
    // Resolve those against the batches table once and drop the coupling.
    ensure_students_batch_id(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            subjects TEXT NOT NULL DEFAULT '[]',
            joined_on TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            user_name TEXT NOT NULL UNIQUE,
            password_sha256 TEXT NOT NULL,
            role TEXT NOT NULL,
            person_id TEXT
        )",
        [],
    )?;

    // Master attendance record: id is the natural key {batch_id}_{date} and
    // doubles as the day lock. statuses holds the studentId -> status map.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            date TEXT NOT NULL,
            statuses TEXT NOT NULL,
            teacher_name TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            last_edited_by TEXT,
            last_edited_at TEXT,
            FOREIGN KEY(batch_id) REFERENCES batches(id),
            UNIQUE(batch_id, date)
        )",
        [],
    )?;
    ensure_attendance_edit_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_batch ON attendance_records(batch_id)",
        [],
    )?;

    // Per-student mirror rows, written in the same transaction as the master.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_attendance(
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            record_id TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(student_id, date),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(record_id) REFERENCES attendance_records(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_attendance_record ON student_attendance(record_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_plans(
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            name TEXT NOT NULL,
            plan_type TEXT NOT NULL,
            params TEXT NOT NULL,
            FOREIGN KEY(batch_id) REFERENCES batches(id),
            UNIQUE(batch_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_plans_batch ON fee_plans(batch_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_plan_installments(
            plan_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            description TEXT NOT NULL,
            amount REAL NOT NULL,
            offset_months INTEGER NOT NULL,
            PRIMARY KEY(plan_id, seq),
            FOREIGN KEY(plan_id) REFERENCES fee_plans(id)
        )",
        [],
    )?;

    // One fee detail per student; installments are copied at assignment time
    // and never re-derived from the plan.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_fees(
            student_id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            plan_name TEXT NOT NULL,
            assigned_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_installments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            description TEXT NOT NULL,
            amount REAL NOT NULL,
            due_date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            paid_on TEXT,
            payment_method TEXT,
            receipt_no TEXT,
            collected_by TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, seq)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_installments_student
         ON student_installments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS receipts(
            id TEXT PRIMARY KEY,
            receipt_no TEXT NOT NULL UNIQUE,
            student_id TEXT NOT NULL,
            installment_id TEXT NOT NULL,
            amount REAL NOT NULL,
            payment_method TEXT,
            collected_by TEXT,
            issued_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(installment_id) REFERENCES student_installments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_receipts_student ON receipts(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            title TEXT NOT NULL,
            total_marks REAL NOT NULL,
            assessment_date TEXT,
            is_published INTEGER NOT NULL DEFAULT 0,
            published_at TEXT,
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    ensure_assessments_published_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_batch ON assessments(batch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            assessment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            score REAL NOT NULL,
            link TEXT,
            PRIMARY KEY(assessment_id, student_id),
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            subject TEXT,
            title TEXT NOT NULL,
            description TEXT,
            due_date TEXT,
            attachment_url TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_batch ON assignments(batch_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions(
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            link TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            is_late INTEGER NOT NULL DEFAULT 0,
            marks REAL,
            feedback TEXT,
            graded_at TEXT,
            PRIMARY KEY(assignment_id, student_id),
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS announcements(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            audience TEXT NOT NULL DEFAULT 'all',
            created_at TEXT NOT NULL,
            expires_on TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            event_date TEXT NOT NULL,
            venue TEXT,
            description TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS materials(
            id TEXT PRIMARY KEY,
            batch_id TEXT,
            subject TEXT,
            title TEXT NOT NULL,
            category TEXT,
            file_url TEXT NOT NULL,
            uploaded_at TEXT NOT NULL,
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS gallery_albums(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            cover_url TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS gallery_images(
            id TEXT PRIMARY KEY,
            album_id TEXT NOT NULL,
            url TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(album_id) REFERENCES gallery_albums(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_gallery_images_album ON gallery_images(album_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS expenses(
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            amount REAL NOT NULL,
            spent_on TEXT NOT NULL,
            note TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS payroll(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            month TEXT NOT NULL,
            amount REAL NOT NULL,
            paid_on TEXT,
            note TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(teacher_id, month)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Migration: pre-1.0 workspaces stored a denormalized batch name on each
/// student. Resolve those names against the batches table, then leave the
/// legacy column behind (SQLite cannot cheaply drop it; it is never read).
fn ensure_students_batch_id(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "batch_name")? {
        return Ok(());
    }
    let mut stmt = conn.prepare(
        "SELECT s.id, b.id
         FROM students s
         JOIN batches b ON b.name = s.batch_name
         WHERE s.batch_id IS NULL AND s.batch_name IS NOT NULL",
    )?;
    let pairs = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (student_id, batch_id) in pairs {
        conn.execute(
            "UPDATE students SET batch_id = ?, batch_name = NULL WHERE id = ?",
            (&batch_id, &student_id),
        )?;
    }
    Ok(())
}

fn ensure_attendance_edit_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "attendance_records", "last_edited_by")? {
        conn.execute(
            "ALTER TABLE attendance_records ADD COLUMN last_edited_by TEXT",
            [],
        )?;
    }
    if !table_has_column(conn, "attendance_records", "last_edited_at")? {
        conn.execute(
            "ALTER TABLE attendance_records ADD COLUMN last_edited_at TEXT",
            [],
        )?;
    }
    Ok(())
}

fn ensure_assessments_published_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assessments", "published_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE assessments ADD COLUMN published_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
