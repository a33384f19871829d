use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("evalplan.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluation_plans(
            id TEXT PRIMARY KEY,
            version_id TEXT NOT NULL UNIQUE,
            semester TEXT NOT NULL,
            subject_code TEXT NOT NULL,
            group_number INTEGER NOT NULL,
            academic_year TEXT,
            professor_id TEXT NOT NULL,
            created_by TEXT,
            version_name TEXT NOT NULL,
            parent_plan_id TEXT,
            is_main_version INTEGER NOT NULL DEFAULT 0,
            is_approved INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            usage_count INTEGER NOT NULL DEFAULT 0,
            comment_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_plans_offering
         ON evaluation_plans(semester, subject_code, group_number)",
        [],
    )?;
    // Storage-layer backstop for the election race: at most one active main
    // version per course offering, no matter what the ranking pass does.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_plans_one_main
         ON evaluation_plans(semester, subject_code, group_number)
         WHERE is_main_version = 1 AND is_active = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS plan_activities(
            id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            name TEXT NOT NULL,
            percentage REAL NOT NULL,
            description TEXT,
            due_date TEXT,
            FOREIGN KEY(plan_id) REFERENCES evaluation_plans(id),
            UNIQUE(plan_id, sort_order)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_plan_activities_plan ON plan_activities(plan_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            plan_id TEXT NOT NULL,
            semester TEXT NOT NULL,
            target_grade REAL,
            status TEXT NOT NULL DEFAULT 'in_progress',
            final_grade REAL,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(plan_id) REFERENCES evaluation_plans(id),
            UNIQUE(student_id, plan_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_student
         ON grade_records(student_id, semester)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_plan ON grade_records(plan_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_activities(
            id TEXT PRIMARY KEY,
            record_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            name TEXT NOT NULL,
            percentage REAL NOT NULL,
            score REAL,
            max_score REAL NOT NULL DEFAULT 5,
            notes TEXT,
            updated_at TEXT,
            FOREIGN KEY(record_id) REFERENCES grade_records(id),
            UNIQUE(record_id, sort_order)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_activities_record ON grade_activities(record_id)",
        [],
    )?;

    // Existing workspaces may predate some columns. Add if needed.
    ensure_plans_academic_year(&conn)?;
    ensure_grade_activities_notes(&conn)?;

    Ok(conn)
}

fn ensure_plans_academic_year(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "evaluation_plans", "academic_year")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE evaluation_plans ADD COLUMN academic_year TEXT",
        [],
    )?;
    // Backfill from the semester's leading year token.
    conn.execute(
        "UPDATE evaluation_plans
         SET academic_year = substr(semester, 1, 4)
         WHERE academic_year IS NULL",
        [],
    )?;
    Ok(())
}

fn ensure_grade_activities_notes(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grade_activities", "notes")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE grade_activities ADD COLUMN notes TEXT", [])?;
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
